//! Per-bin prediction output.
//!
//! A [`PredictionWriter`] runs a [`SignalPredictor`] over windows and writes one
//! bedGraph-like TSV record per bin and track:
//!
//! ```text
//! seqname  start  end  track  value
//! ```
//!
//! Bins are always reported in forward-strand coordinates. A reverse-strand window is
//! predicted on its reverse complement, and the predictions are mapped back by reversing
//! the bins and exchanging strand-paired tracks.

use ndarray::{s, Array2, Array3, Axis};
use std::io::Write;
use tracing::{debug, warn};

use crate::{
    encoding::{EncodedSequence, OneHotEncoder, ALPHABET_SIZE},
    ranges::GenomicInterval,
    sequences::nucleotide::NucleotideSequences,
    traits::SignalPredictor,
    BasenjiError, Position,
};

/// Counts of what a prediction run wrote.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredictionSummary {
    pub windows: usize,
    pub records: usize,
    /// Windows skipped because of data errors.
    pub dropped: usize,
}

/// Writes per-bin predictions for windows of a genome.
pub struct PredictionWriter<'a, P: SignalPredictor> {
    predictor: &'a P,
    genome: &'a NucleotideSequences,
    encoder: OneHotEncoder,
    track_names: Vec<String>,
    strand_swap: Vec<usize>,
    window_len: Position,
    bin_width: Position,
    batch_size: usize,
    strict: bool,
}

impl<'a, P: SignalPredictor> PredictionWriter<'a, P> {
    /// # Arguments
    /// * `predictor`: the trained model.
    /// * `genome`: the reference sequences.
    /// * `track_names`: the predicted tracks, in model output order.
    /// * `strand_swap`: the strand pair permutation of the tracks (see
    ///   [`strand_swap_permutation()`](crate::sequences::numeric::strand_swap_permutation)).
    /// * `window_len`, `bin_width`: the model input length and its pooling factor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        predictor: &'a P,
        genome: &'a NucleotideSequences,
        encoder: OneHotEncoder,
        track_names: Vec<String>,
        strand_swap: Vec<usize>,
        window_len: Position,
        bin_width: Position,
        batch_size: usize,
    ) -> Result<Self, BasenjiError> {
        if track_names.len() != predictor.num_targets() || strand_swap.len() != track_names.len()
        {
            return Err(BasenjiError::InvalidConfig(format!(
                "the model predicts {} tracks but {} are configured",
                predictor.num_targets(),
                track_names.len()
            )));
        }
        if bin_width == 0 || window_len % bin_width != 0 || batch_size == 0 {
            return Err(BasenjiError::InvalidConfig(format!(
                "window length {} must be a multiple of the bin width {}, and the batch size \
                 non-zero",
                window_len, bin_width
            )));
        }
        Ok(Self {
            predictor,
            genome,
            encoder,
            track_names,
            strand_swap,
            window_len,
            bin_width,
            batch_size,
            strict: false,
        })
    }

    /// Fail on the first window with a data error instead of skipping it.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Predict every window and write the records to `writer`.
    pub fn write<I, W>(&self, windows: I, writer: &mut W) -> Result<PredictionSummary, BasenjiError>
    where
        I: IntoIterator<Item = GenomicInterval>,
        W: Write + ?Sized,
    {
        let mut summary = PredictionSummary::default();
        let mut pending: Vec<(GenomicInterval, EncodedSequence)> =
            Vec::with_capacity(self.batch_size);
        for window in windows {
            match self.encode(&window) {
                Ok(encoded) => pending.push((window, encoded)),
                Err(e) if e.is_data_error() && !self.strict => {
                    warn!(window = %window, error = %e, "skipping window");
                    summary.dropped += 1;
                }
                Err(e) => return Err(e),
            }
            if pending.len() == self.batch_size {
                self.flush(&mut pending, writer, &mut summary)?;
            }
        }
        self.flush(&mut pending, writer, &mut summary)?;
        writer.flush()?;
        debug!(
            windows = summary.windows,
            records = summary.records,
            dropped = summary.dropped,
            "wrote predictions"
        );
        Ok(summary)
    }

    fn encode(&self, window: &GenomicInterval) -> Result<EncodedSequence, BasenjiError> {
        let seq = self
            .genome
            .region_bytes(&window.seqname, window.start, window.end)?;
        let encoded = self.encoder.encode_exact(&seq, self.window_len as usize)?;
        if window.strand.is_reverse() {
            Ok(encoded.reverse_complement())
        } else {
            Ok(encoded)
        }
    }

    fn flush<W: Write + ?Sized>(
        &self,
        pending: &mut Vec<(GenomicInterval, EncodedSequence)>,
        writer: &mut W,
        summary: &mut PredictionSummary,
    ) -> Result<(), BasenjiError> {
        if pending.is_empty() {
            return Ok(());
        }
        let mut inputs =
            Array3::<f32>::zeros((pending.len(), self.window_len as usize, ALPHABET_SIZE));
        for (mut slot, (_, encoded)) in inputs.axis_iter_mut(Axis(0)).zip(pending.iter()) {
            slot.assign(&encoded.view());
        }
        let predictions = self.predictor.predict(inputs.view())?;

        for ((window, _), prediction) in pending.iter().zip(predictions.axis_iter(Axis(0))) {
            let forward: Array2<f32> = if window.strand.is_reverse() {
                prediction
                    .slice(s![..;-1, ..])
                    .select(Axis(1), &self.strand_swap)
            } else {
                prediction.to_owned()
            };
            for (i, row) in forward.axis_iter(Axis(0)).enumerate() {
                let start = window.start + i as Position * self.bin_width;
                let end = start + self.bin_width;
                for (track, value) in self.track_names.iter().zip(row.iter()) {
                    writeln!(
                        writer,
                        "{}\t{}\t{}\t{}\t{}",
                        window.seqname, start, end, track, value
                    )?;
                    summary.records += 1;
                }
            }
            summary.windows += 1;
        }
        pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranges::Strand;
    use crate::sequences::nucleotide::Nucleotides;

    /// Predicts, per bin, the count of A (track 0) and T (track 1).
    struct BaseCounter {
        bin_width: usize,
    }

    impl SignalPredictor for BaseCounter {
        fn num_targets(&self) -> usize {
            2
        }

        fn predict(&self, inputs: ndarray::ArrayView3<f32>) -> Result<Array3<f32>, BasenjiError> {
            let (batch, len, _) = inputs.dim();
            let bins = len / self.bin_width;
            let mut output = Array3::zeros((batch, bins, 2));
            for b in 0..batch {
                for i in 0..bins {
                    let bin = inputs.slice(s![b, i * self.bin_width..(i + 1) * self.bin_width, ..]);
                    output[[b, i, 0]] = bin.column(0).sum();
                    output[[b, i, 1]] = bin.column(3).sum();
                }
            }
            Ok(output)
        }
    }

    fn genome() -> NucleotideSequences {
        NucleotideSequences::from_pairs(vec![("chr1", Nucleotides::from("AAAACCCCGGGGTTTA"))])
            .unwrap()
    }

    fn lines(windows: Vec<GenomicInterval>, strict: bool) -> (Vec<String>, PredictionSummary) {
        let genome = genome();
        let predictor = BaseCounter { bin_width: 4 };
        let writer = PredictionWriter::new(
            &predictor,
            &genome,
            OneHotEncoder::default(),
            vec!["a".to_string(), "t".to_string()],
            vec![1, 0],
            8,
            4,
            2,
        )
        .unwrap()
        .with_strict(strict);
        let mut output = Vec::new();
        let summary = writer.write(windows, &mut output).unwrap();
        let text = String::from_utf8(output).unwrap();
        (text.lines().map(|l| l.to_string()).collect(), summary)
    }

    #[test]
    fn test_forward_and_reverse_windows_agree() {
        let forward = GenomicInterval::new("chr1", 8, 16, Strand::Forward).unwrap();
        let reverse = forward.with_strand(Strand::Reverse);
        let (forward_lines, summary) = lines(vec![forward], false);
        assert_eq!(summary.records, 4);
        assert_eq!(
            forward_lines,
            vec![
                "chr1\t8\t12\ta\t0",
                "chr1\t8\t12\tt\t0",
                "chr1\t12\t16\ta\t1",
                "chr1\t12\t16\tt\t3"
            ]
        );
        let (reverse_lines, _) = lines(vec![reverse], false);
        assert_eq!(reverse_lines, forward_lines);
    }

    #[test]
    fn test_bad_windows_are_skipped() {
        let good = GenomicInterval::new("chr1", 0, 8, Strand::Forward).unwrap();
        let missing = GenomicInterval::new("chr2", 0, 8, Strand::Forward).unwrap();
        let (output, summary) = lines(vec![good.clone(), missing, good], false);
        assert_eq!(summary.windows, 2);
        assert_eq!(summary.dropped, 1);
        assert_eq!(output.len(), 8);
    }
}
