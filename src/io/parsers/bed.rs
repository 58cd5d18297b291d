//! BED region parsing.
//!
//! Region lists are BED3 (`seqname start end`) or BED6 (`seqname start end name score
//! strand`) files. The strand column is optional; BED3 regions get [`Strand::Unknown`].
//! Lines starting with `#`, `track` or `browser` are skipped.

use std::{
    io::{BufRead, BufReader},
    path::PathBuf,
};

use super::parse_column;
use crate::{
    io::InputStream,
    ranges::{GenomicInterval, Strand},
    BasenjiError, Position,
};

pub const PARSE_CAPACITY: usize = 512;

/// A lazy parser for BED region files, yielding [`GenomicInterval`] entries.
pub struct BedIterator {
    reader: BufReader<Box<dyn std::io::Read>>,
    line_buffer: String,
}

impl std::fmt::Debug for BedIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BedIterator").finish_non_exhaustive()
    }
}

impl BedIterator {
    /// Create a new lazy-parsing iterator over BED data.
    pub fn new(filepath: impl Into<PathBuf>) -> Result<Self, BasenjiError> {
        let reader = InputStream::new(filepath).reader()?;
        let line_buffer = String::with_capacity(PARSE_CAPACITY);
        Ok(Self {
            reader,
            line_buffer,
        })
    }
}

fn is_metadata(line: &str) -> bool {
    line.starts_with('#') || line.starts_with("track") || line.starts_with("browser")
}

impl Iterator for BedIterator {
    type Item = Result<GenomicInterval, BasenjiError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line_buffer.clear();
            match self.reader.read_line(&mut self.line_buffer) {
                Ok(0) => return None,
                Ok(_) => {
                    let line = self.line_buffer.trim_end();
                    if !line.is_empty() && !is_metadata(line) {
                        return Some(parse_bed(line));
                    }
                }
                Err(e) => return Some(Err(BasenjiError::IOError(e))),
            }
        }
    }
}

/// Parses a BED3 or BED6 line into a [`GenomicInterval`].
///
/// # Errors
/// [`BasenjiError::BedlikeTooFewColumns`] for fewer than three columns,
/// [`BasenjiError::InvalidColumnType`] for unparsable positions,
/// [`BasenjiError::InvalidStrand`] for an unknown strand symbol, and
/// [`BasenjiError::InvalidRegion`] if `start >= end`.
pub fn parse_bed(line: &str) -> Result<GenomicInterval, BasenjiError> {
    let columns: Vec<&str> = line.split('\t').collect();
    if columns.len() < 3 {
        return Err(BasenjiError::BedlikeTooFewColumns(line.to_string()));
    }

    let seqname = columns[0];
    let start: Position = parse_column(columns[1], line)?;
    let end: Position = parse_column(columns[2], line)?;
    let strand = match columns.get(5) {
        Some(strand) => strand.parse::<Strand>()?,
        None => Strand::Unknown,
    };

    GenomicInterval::new(seqname, start, end, strand)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_bed3_and_bed6() {
        let iv = parse_bed("chr1\t10\t20").unwrap();
        assert_eq!((iv.start, iv.end, iv.strand), (10, 20, Strand::Unknown));

        let iv = parse_bed("chr1\t10\t20\tpeak1\t0\t-").unwrap();
        assert_eq!(iv.strand, Strand::Reverse);

        assert!(matches!(
            parse_bed("chr1\t10"),
            Err(BasenjiError::BedlikeTooFewColumns(_))
        ));
        assert!(matches!(
            parse_bed("chr1\t500\t100"),
            Err(BasenjiError::InvalidRegion { .. })
        ));
    }

    #[test]
    fn test_bed_iterator_skips_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("regions.bed");
        std::fs::write(
            &path,
            "track name=test\n# comment\nchr1\t0\t100\n\nchr2\t5\t50\t.\t.\t+\n",
        )
        .unwrap();
        let regions: Vec<_> = BedIterator::new(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].seqname, "chr2");
        assert_eq!(regions[1].strand, Strand::Forward);
    }
}
