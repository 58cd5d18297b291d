//! Types and methods for working with per-basepair nucleotide sequence data.
//!
//! Currently this requires the [`noodles::fasta`] module, but their API is unstable
//! and may be a source of future pain.

use bytes::Bytes;
use genomap::GenomeMap;
use noodles::fasta::{reader, record::Sequence};
use std::ops::Deref;
use std::path::PathBuf;
use std::str;
use std::{collections::HashSet, fmt};

use crate::error::BasenjiError;
use crate::ranges::validate_range;
use crate::traits::Sequences;
use crate::Position;

/// A newtype around raw nucleotide [`Bytes`], for making it more
/// display and other operations more convenient.
#[derive(Clone, Debug, PartialEq)]
pub struct Nucleotides(Bytes);

impl fmt::Display for Nucleotides {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => Err(fmt::Error),
        }
    }
}

impl Deref for Nucleotides {
    type Target = Bytes;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&Sequence> for Nucleotides {
    fn from(sequence: &Sequence) -> Self {
        let seq = Bytes::from(sequence.as_ref().to_vec());
        Nucleotides(seq)
    }
}

impl From<String> for Nucleotides {
    fn from(s: String) -> Self {
        Nucleotides(Bytes::from(s.into_bytes()))
    }
}

impl<'a> From<&'a str> for Nucleotides {
    fn from(s: &'a str) -> Self {
        Nucleotides(Bytes::from(s.as_bytes().to_vec()))
    }
}

impl Nucleotides {
    /// Get the length of the nucleotide sequence.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Return whether this is an empty object.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`NucleotideSequences`] for storing a whole genome's nucleotide sequence
/// data in-memory.
///
/// The genome is shared read-only by all producer threads, so it is loaded
/// eagerly rather than lazily per chromosome.
pub struct NucleotideSequences {
    data: GenomeMap<Nucleotides>,
}

impl fmt::Debug for NucleotideSequences {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NucleotideSequences")
            .field("seqnames", &self.data.names())
            .finish()
    }
}

impl NucleotideSequences {
    /// Load an entire FASTA file into memory, into a [`NucleotideSequences`] object.
    ///
    /// # Arguments
    /// * `filepath`: a path to the (possible gzipped) FASTA file.
    /// * `seqnames`: an optional subset of sequences to load.
    pub fn from_fasta(
        filepath: impl Into<PathBuf>,
        seqnames: Option<Vec<String>>,
    ) -> Result<Self, BasenjiError> {
        let data = parse_fasta(filepath, seqnames)?;
        Ok(Self { data })
    }

    /// Build from in-memory `(seqname, sequence)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, BasenjiError>
    where
        I: IntoIterator<Item = (S, Nucleotides)>,
        S: AsRef<str>,
    {
        let mut data = GenomeMap::new();
        for (name, seq) in pairs {
            data.insert(name.as_ref(), seq)?;
        }
        Ok(Self { data })
    }

    /// Retrieve the [`Nucleotides`] for a particular sequence name.
    pub fn get_sequence(&self, seqname: &str) -> Result<&Nucleotides, BasenjiError> {
        self.data
            .get(seqname)
            .ok_or(BasenjiError::NotFound(seqname.to_string()))
    }

    /// Copy out the (uppercased) nucleotides of a region.
    pub fn region_bytes(
        &self,
        seqname: &str,
        start: Position,
        end: Position,
    ) -> Result<Vec<u8>, BasenjiError> {
        self.region_map(&|seq: &[u8]| seq.to_ascii_uppercase(), seqname, start, end)
    }
}

impl Sequences for NucleotideSequences {
    type Slice<'a> = &'a [u8];

    fn seqnames(&self) -> Vec<String> {
        self.data.names()
    }

    /// Apply an arbitrary function to the specified region.
    ///
    /// # Arguments
    /// * `func`: a function that takes the region's bytes and processes them, returning a generic type `V`.
    /// * `seqname`: the sequence name of the region to apply the function to.
    /// * `start`: the start position of the region to apply the function to.
    /// * `end`: the end position of the region to apply the function to.
    fn region_map<V, F>(
        &self,
        func: &F,
        seqname: &str,
        start: Position,
        end: Position,
    ) -> Result<V, BasenjiError>
    where
        F: for<'b> Fn(Self::Slice<'b>) -> V,
    {
        let seq = self.get_sequence(seqname)?;
        validate_range(seqname, start, end, seq.len() as Position)?;
        Ok(func(&seq[start as usize..end as usize]))
    }

    fn get_sequence_length(&self, seqname: &str) -> Result<Position, BasenjiError> {
        let len = self.get_sequence(seqname)?.len();
        Position::try_from(len).map_err(|_| {
            BasenjiError::InvalidGenomeFile(format!(
                "sequence '{}' is longer than the supported maximum",
                seqname
            ))
        })
    }
}

// Convert an `Option<Vec<String>>` into a `Option<HashSet<String>>`
fn option_vec_to_hashset(x: Option<Vec<String>>) -> Option<HashSet<String>> {
    x.map(HashSet::from_iter)
}

/// Use the [`noodles`] library to parse a FASTA file.
pub fn parse_fasta(
    filepath: impl Into<PathBuf>,
    seqnames: Option<Vec<String>>,
) -> Result<GenomeMap<Nucleotides>, BasenjiError> {
    let seqnames_set = option_vec_to_hashset(seqnames);

    let filepath = filepath.into();

    let mut reader = reader::Builder.build_from_path(filepath)?;

    let mut sequences = GenomeMap::new();

    for result in reader.records() {
        let record = result?;
        let name = String::from_utf8(record.definition().name().to_vec())?;
        if seqnames_set
            .as_ref()
            .map_or(true, |keep_seqnames| keep_seqnames.contains(&name))
        {
            sequences.insert(&name, Nucleotides::from(record.sequence()))?;
        }
    }

    Ok(sequences)
}

/// Reverse complement a nucleotide byte slice. Unknown symbols (e.g. `N`) map to `N`;
/// case is not preserved.
pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|base| match base.to_ascii_uppercase() {
            b'A' => b'T',
            b'C' => b'G',
            b'G' => b'C',
            b'T' => b'A',
            _ => b'N',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utilities::write_fasta;
    use tempfile::tempdir;

    #[test]
    fn test_nucleotide_sequences() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("genome.fa");
        write_fasta(
            &path,
            &[
                ("chr1", "TTCACTACTATTAGTACTCACGGCGCAATA"),
                ("chr2", "ACGTNACGTN"),
            ],
        )
        .unwrap();
        let reference = NucleotideSequences::from_fasta(&path, None).unwrap();

        assert_eq!(
            *reference.get_sequence("chr1").unwrap(),
            Nucleotides::from("TTCACTACTATTAGTACTCACGGCGCAATA")
        );
        assert_eq!(reference.seqnames().len(), 2);
        assert_eq!(*reference.seqlens().unwrap().get("chr1").unwrap(), 30);

        let subset = NucleotideSequences::from_fasta(&path, Some(vec!["chr2".into()])).unwrap();
        assert_eq!(subset.seqnames(), vec!["chr2".to_string()]);
    }

    #[test]
    fn region_map_slice() {
        let reference =
            NucleotideSequences::from_pairs([("chr1", "TTCACTACTATTAGTACTCACGGCGCAATA".into())])
                .unwrap();

        #[allow(non_snake_case)]
        // len([l for l in 'TTCACTACTATTAGTACTCACGGCGCAATA'[3:10] if l == 'C'])
        let total_Cs = reference
            .region_map(
                &|seq| seq.iter().filter(|c| **c == b'C').count(),
                "chr1",
                3,
                10,
            )
            .unwrap();
        assert_eq!(total_Cs, 2);

        assert!(matches!(
            reference.region_map(&|seq| seq.len(), "chr1", 20, 31),
            Err(BasenjiError::InvalidRegion { .. })
        ));
        assert!(matches!(
            reference.region_bytes("chrX", 0, 5),
            Err(BasenjiError::NotFound(_))
        ));
    }

    #[test]
    fn test_reverse_complement() {
        assert_eq!(reverse_complement(b"AACGTn"), b"NACGTT".to_vec());
        assert!(reverse_complement(b"").is_empty());
    }
}
