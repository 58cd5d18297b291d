//! Traits used by the basenji library.
//!

use indexmap::IndexMap;
use ndarray::{Array3, ArrayView3};

use crate::{error::BasenjiError, Position};

/// The [`GenericRange`] trait defines common functionality for all range types.
pub trait GenericRange: Clone {
    fn start(&self) -> Position;
    fn end(&self) -> Position;
    fn width(&self) -> Position {
        self.end() - self.start()
    }
    /// Calculate how many basepairs overlap this range and other.
    fn overlap_width<R: GenericRange>(&self, other: &R) -> Position {
        let overlap_start = std::cmp::max(self.start(), other.start());
        let overlap_end = std::cmp::min(self.end(), other.end());
        if overlap_start >= overlap_end {
            return 0;
        }
        overlap_end.saturating_sub(overlap_start)
    }
}

/// Defines how to serialize something to TSV.
pub trait TsvSerialize {
    // Serialize something to a TSV [`String`].
    fn to_tsv(&self) -> String;
}

/// The [`Sequences`] trait defines an abstraction over per-basepair genomic data
/// that exhaustively covers each sequence (e.g. a reference genome's nucleotides).
///
/// Implementations are the read-only external collaborators of the data pipeline:
/// given coordinates, they return values or a [`BasenjiError::NotFound`].
pub trait Sequences {
    /// The borrowed view of a region handed to [`Sequences::region_map()`].
    type Slice<'a>
    where
        Self: 'a;

    /// Retrieve all sequence names.
    fn seqnames(&self) -> Vec<String>;

    /// Get the length of a particular sequence.
    fn get_sequence_length(&self, seqname: &str) -> Result<Position, BasenjiError>;

    /// Apply an arbitrary function to the specified 0-indexed, right-exclusive region.
    fn region_map<V, F>(
        &self,
        func: &F,
        seqname: &str,
        start: Position,
        end: Position,
    ) -> Result<V, BasenjiError>
    where
        F: for<'b> Fn(Self::Slice<'b>) -> V;

    /// Retrieve an [`IndexMap`] of the sequence names and their lengths.
    fn seqlens(&self) -> Result<IndexMap<String, Position>, BasenjiError> {
        self.seqnames()
            .into_iter()
            .map(|name| {
                let length = self.get_sequence_length(&name)?;
                Ok((name, length))
            })
            .collect()
    }
}

/// Anything that maps a batch of encoded sequences onto per-bin track predictions.
///
/// This is the seam between the evaluator (and prediction writer) and the model:
/// neither needs to know the backend or architecture.
pub trait SignalPredictor {
    /// The number of target tracks predicted per bin.
    fn num_targets(&self) -> usize;

    /// Predict per-bin values for one-hot inputs of shape `[batch, length, 4]`,
    /// returning shape `[batch, bins, tracks]`.
    fn predict(&self, inputs: ArrayView3<f32>) -> Result<Array3<f32>, BasenjiError>;
}

#[cfg(test)]
mod tests {
    use super::GenericRange;
    use crate::ranges::{GenomicInterval, Strand};

    #[test]
    fn test_overlap_width() {
        let a = GenomicInterval::new("chr1", 0, 10, Strand::Forward).unwrap();
        let b = GenomicInterval::new("chr1", 5, 20, Strand::Forward).unwrap();
        let c = GenomicInterval::new("chr1", 10, 20, Strand::Forward).unwrap();
        assert_eq!(a.overlap_width(&b), 5);
        assert_eq!(a.overlap_width(&c), 0);
        assert_eq!(b.width(), 15);
    }
}
