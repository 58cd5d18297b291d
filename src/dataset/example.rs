//! Training examples and the source that builds them from windows.

use indexmap::IndexMap;
use ndarray::{Array2, Axis};

use super::augment::{shift_window, Augmentation};
use crate::{
    encoding::{EncodedSequence, OneHotEncoder},
    ranges::{GenomicInterval, Strand},
    sequences::{nucleotide::NucleotideSequences, numeric::TargetTracks},
    traits::Sequences,
    BasenjiError, Position,
};

/// One encoded window paired with its pooled `[bins, tracks]` targets.
///
/// Row `i` of the targets covers positions `[i * pool, (i + 1) * pool)` of the sequence,
/// in the orientation of the sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingExample {
    pub interval: GenomicInterval,
    pub sequence: EncodedSequence,
    pub targets: Array2<f32>,
}

impl TrainingExample {
    /// Pair a sequence with its targets.
    ///
    /// # Errors
    /// Returns [`BasenjiError::AlignmentError`] unless the sequence length is
    /// `targets.nrows() * pooling_factor`.
    pub fn new(
        interval: GenomicInterval,
        sequence: EncodedSequence,
        targets: Array2<f32>,
        pooling_factor: usize,
    ) -> Result<Self, BasenjiError> {
        let sequence_bins = if pooling_factor == 0 {
            0
        } else {
            sequence.len() / pooling_factor
        };
        if pooling_factor == 0
            || sequence.len() % pooling_factor != 0
            || sequence_bins != targets.nrows()
        {
            return Err(BasenjiError::AlignmentError {
                sequence_bins,
                target_bins: targets.nrows(),
            });
        }
        Ok(Self {
            interval,
            sequence,
            targets,
        })
    }

    pub fn num_bins(&self) -> usize {
        self.targets.nrows()
    }

    pub fn num_tracks(&self) -> usize {
        self.targets.ncols()
    }

    /// Reverse complement the example: the sequence is reverse complemented, target bins
    /// are reversed and strand-paired tracks exchanged, as given by `strand_swap`
    /// (see [`TargetTracks::strand_swap()`]).
    pub fn reverse_complement(&self, strand_swap: &[usize]) -> Self {
        let reversed = self.targets.slice(ndarray::s![..;-1, ..]);
        let targets = reversed.select(Axis(1), strand_swap);
        let strand = match self.interval.strand {
            Strand::Reverse => Strand::Forward,
            _ => Strand::Reverse,
        };
        Self {
            interval: self.interval.with_strand(strand),
            sequence: self.sequence.reverse_complement(),
            targets,
        }
    }
}

/// Builds [`TrainingExample`]s: the genome, the target tracks and the encoder, shared
/// read-only by the producer threads.
#[derive(Debug)]
pub struct ExampleSource {
    genome: NucleotideSequences,
    targets: TargetTracks,
    encoder: OneHotEncoder,
    seqlens: IndexMap<String, Position>,
    window_len: Position,
    bin_width: Position,
}

impl ExampleSource {
    /// # Arguments
    /// * `genome`: the reference sequences.
    /// * `targets`: the target tracks, over the same sequences.
    /// * `encoder`: the one-hot encoder.
    /// * `window_len`: the model input length `W`.
    /// * `bin_width`: the number of basepairs pooled into one target bin; this must be the
    ///    model's pooling factor.
    pub fn new(
        genome: NucleotideSequences,
        targets: TargetTracks,
        encoder: OneHotEncoder,
        window_len: Position,
        bin_width: Position,
    ) -> Result<Self, BasenjiError> {
        if bin_width == 0 || window_len == 0 || window_len % bin_width != 0 {
            return Err(BasenjiError::InvalidConfig(format!(
                "window length {} must be a non-zero multiple of the bin width {}",
                window_len, bin_width
            )));
        }
        let seqlens = genome.seqlens()?;
        Ok(Self {
            genome,
            targets,
            encoder,
            seqlens,
            window_len,
            bin_width,
        })
    }

    pub fn window_len(&self) -> Position {
        self.window_len
    }

    pub fn bin_width(&self) -> Position {
        self.bin_width
    }

    pub fn num_bins(&self) -> usize {
        (self.window_len / self.bin_width) as usize
    }

    pub fn seqlens(&self) -> &IndexMap<String, Position> {
        &self.seqlens
    }

    pub fn targets(&self) -> &TargetTracks {
        &self.targets
    }

    /// Encode a window in the orientation of its strand (reverse-strand windows are
    /// reverse complemented).
    pub fn encode(&self, window: &GenomicInterval) -> Result<EncodedSequence, BasenjiError> {
        let seq = self
            .genome
            .region_bytes(&window.seqname, window.start, window.end)?;
        let encoded = self
            .encoder
            .encode_exact(&seq, self.window_len as usize)?;
        if window.strand.is_reverse() {
            Ok(encoded.reverse_complement())
        } else {
            Ok(encoded)
        }
    }

    /// Build the example for a window, applying `augmentation`.
    ///
    /// The window is first shifted (if it stays within its sequence), then the example is
    /// built on the forward strand, and finally reverse complemented if either the
    /// window is on the reverse strand or the augmentation asks for it (but not both).
    pub fn example(
        &self,
        window: &GenomicInterval,
        augmentation: Augmentation,
    ) -> Result<TrainingExample, BasenjiError> {
        let seqlen = *self
            .seqlens
            .get(&window.seqname)
            .ok_or_else(|| BasenjiError::NotFound(window.seqname.clone()))?;
        let window = shift_window(window, augmentation.shift_bins, self.bin_width, seqlen);
        let forward = window.with_strand(Strand::Forward);

        let sequence = self.encode(&forward)?;
        let targets = self.targets.targets(&forward, self.bin_width)?;
        let example = TrainingExample::new(forward, sequence, targets, self.bin_width as usize)?;

        if window.strand.is_reverse() != augmentation.reverse_complement {
            Ok(example.reverse_complement(self.targets.strand_swap()))
        } else {
            Ok(example)
        }
    }
}
