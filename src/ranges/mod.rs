//! Genomic intervals and the window indexer.
//!
//! All coordinates are 0-indexed and right-exclusive.
//!

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{
    error::BasenjiError,
    traits::{GenericRange, TsvSerialize},
    Position, PositionOffset,
};

pub mod coitrees;
pub mod windows;

/// Nucleotide strand enum type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strand {
    #[default]
    Forward,
    Reverse,
    Unknown,
}

impl Strand {
    /// Whether sequence on this strand must be reverse complemented relative
    /// to the reference.
    pub fn is_reverse(&self) -> bool {
        matches!(self, Strand::Reverse)
    }
}

impl FromStr for Strand {
    type Err = BasenjiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "+" => Ok(Strand::Forward),
            "-" => Ok(Strand::Reverse),
            "." => Ok(Strand::Unknown),
            other => Err(BasenjiError::InvalidStrand(other.to_string())),
        }
    }
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let symbol = match self {
            Strand::Forward => "+",
            Strand::Reverse => "-",
            Strand::Unknown => ".",
        };
        write!(f, "{}", symbol)
    }
}

/// A stranded genomic interval, `(seqname, start, end, strand)`.
///
/// The invariant `end > start` is checked on construction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GenomicInterval {
    pub seqname: String,
    pub start: Position,
    pub end: Position,
    pub strand: Strand,
}

impl GenomicInterval {
    /// Create a new 0-indexed right-exclusive interval.
    ///
    /// # Errors
    /// Returns [`BasenjiError::InvalidRegion`] if `start >= end`.
    pub fn new(
        seqname: impl Into<String>,
        start: Position,
        end: Position,
        strand: Strand,
    ) -> Result<Self, BasenjiError> {
        let seqname = seqname.into();
        if start >= end {
            return Err(BasenjiError::invalid_region(
                &seqname,
                start,
                end,
                "start must be less than end",
            ));
        }
        Ok(Self {
            seqname,
            start,
            end,
            strand,
        })
    }

    /// Create a new interval and check it lies within a sequence of length `seqlen`.
    pub fn new_within(
        seqname: impl Into<String>,
        start: Position,
        end: Position,
        strand: Strand,
        seqlen: Position,
    ) -> Result<Self, BasenjiError> {
        let interval = Self::new(seqname, start, end, strand)?;
        validate_range(&interval.seqname, start, end, seqlen)?;
        Ok(interval)
    }

    /// Return a copy of this interval moved by `offset` basepairs, or `None` if
    /// the moved interval would leave `[0, seqlen)`.
    pub fn shifted(&self, offset: PositionOffset, seqlen: Position) -> Option<Self> {
        let start = i64::from(self.start) + i64::from(offset);
        let end = i64::from(self.end) + i64::from(offset);
        if start < 0 || end > i64::from(seqlen) {
            return None;
        }
        Some(Self {
            seqname: self.seqname.clone(),
            start: start as Position,
            end: end as Position,
            strand: self.strand,
        })
    }

    /// Return a copy of this interval on a different strand.
    pub fn with_strand(&self, strand: Strand) -> Self {
        Self {
            strand,
            ..self.clone()
        }
    }
}

impl fmt::Display for GenomicInterval {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}({})",
            self.seqname, self.start, self.end, self.strand
        )
    }
}

impl GenericRange for GenomicInterval {
    fn start(&self) -> Position {
        self.start
    }
    fn end(&self) -> Position {
        self.end
    }
}

/// BED6-style output: name and score are written as missing.
impl TsvSerialize for GenomicInterval {
    fn to_tsv(&self) -> String {
        format!(
            "{}\t{}\t{}\t.\t.\t{}",
            self.seqname, self.start, self.end, self.strand
        )
    }
}

/// Validates whether a given range is valid for accessing a sequence of a given `length`.
///
/// # Arguments
///
/// * `seqname` - The sequence name, used in error messages.
/// * `start` - The 0-indexed start position.
/// * `end` - The right-exclusive end position.
/// * `length` - The length of the sequence.
pub fn validate_range(
    seqname: &str,
    start: Position,
    end: Position,
    length: Position,
) -> Result<(), BasenjiError> {
    if start >= end {
        return Err(BasenjiError::invalid_region(
            seqname,
            start,
            end,
            "start must be less than end",
        ));
    }

    if end > length {
        return Err(BasenjiError::invalid_region(
            seqname,
            start,
            end,
            format!("end exceeds sequence length {}", length),
        ));
    }
    Ok(())
}
