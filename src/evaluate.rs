//! Held-out evaluation: per-track Pearson correlation, R² and mean squared error.
//!
//! An [`Evaluator`] accumulates predictions and targets batch by batch, flattening every
//! bin of every example into one sample per track, and computes the metrics in a
//! single (two-pass) sweep at the end. All accumulation is in `f64`.
//!
//! Tracks whose predictions or targets have zero variance report a correlation (and R²)
//! of `0.0` rather than `NaN`.

use ndarray::{ArrayView3, Axis};
use tracing::debug;

use crate::{
    dataset::Batch, train::metrics::MetricRecord, traits::SignalPredictor, BasenjiError,
};

/// The metrics of one track.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackMetrics {
    pub track: String,
    pub pearson_r: f64,
    pub r2: f64,
    pub mse: f64,
    /// The number of bins evaluated.
    pub count: usize,
}

/// The result of one evaluation round.
#[derive(Clone, Debug, PartialEq)]
pub struct EvaluationReport {
    pub tracks: Vec<TrackMetrics>,
    pub num_examples: usize,
}

impl EvaluationReport {
    /// The mean Pearson correlation across tracks: the model selection metric.
    pub fn mean_pearson_r(&self) -> f64 {
        if self.tracks.is_empty() {
            return 0.0;
        }
        self.tracks.iter().map(|t| t.pearson_r).sum::<f64>() / self.tracks.len() as f64
    }

    /// The metrics log records of this report.
    pub fn to_records(&self, step: u64) -> Vec<MetricRecord> {
        let mut records = Vec::with_capacity(3 * self.tracks.len() + 1);
        for track in &self.tracks {
            records.push(MetricRecord::new(step, &track.track, "pearson_r", track.pearson_r));
            records.push(MetricRecord::new(step, &track.track, "r2", track.r2));
            records.push(MetricRecord::new(step, &track.track, "mse", track.mse));
        }
        records.push(MetricRecord::global(step, "mean_pearson_r", self.mean_pearson_r()));
        records
    }
}

/// Compute `(pearson_r, r2, mse)` of predictions against targets.
pub fn track_metrics(predictions: &[f64], targets: &[f64]) -> (f64, f64, f64) {
    let n = predictions.len().min(targets.len());
    if n == 0 {
        return (0.0, 0.0, 0.0);
    }
    let mean = |values: &[f64]| values[..n].iter().sum::<f64>() / n as f64;
    let (pred_mean, target_mean) = (mean(predictions), mean(targets));

    let (mut covariance, mut pred_var, mut target_var, mut squared_error) = (0.0, 0.0, 0.0, 0.0);
    for (p, t) in predictions[..n].iter().zip(&targets[..n]) {
        let (dp, dt) = (p - pred_mean, t - target_mean);
        covariance += dp * dt;
        pred_var += dp * dp;
        target_var += dt * dt;
        squared_error += (p - t) * (p - t);
    }

    let pearson_r = if pred_var > 0.0 && target_var > 0.0 {
        (covariance / (pred_var.sqrt() * target_var.sqrt())).clamp(-1.0, 1.0)
    } else {
        0.0
    };
    let r2 = if target_var > 0.0 {
        1.0 - squared_error / target_var
    } else {
        0.0
    };
    (pearson_r, r2, squared_error / n as f64)
}

/// Accumulates `[batch, bins, tracks]` predictions and targets.
#[derive(Clone, Debug)]
pub struct Evaluator {
    track_names: Vec<String>,
    predictions: Vec<Vec<f64>>,
    targets: Vec<Vec<f64>>,
    num_examples: usize,
}

impl Evaluator {
    pub fn new(track_names: Vec<String>) -> Self {
        let num_tracks = track_names.len();
        Self {
            track_names,
            predictions: vec![Vec::new(); num_tracks],
            targets: vec![Vec::new(); num_tracks],
            num_examples: 0,
        }
    }

    /// Add one batch.
    ///
    /// # Errors
    /// Returns [`BasenjiError::AlignmentError`] if the shapes differ, and
    /// [`BasenjiError::InvalidConfig`] if the track count is not the evaluator's.
    pub fn update(
        &mut self,
        predictions: ArrayView3<f32>,
        targets: ArrayView3<f32>,
    ) -> Result<(), BasenjiError> {
        if predictions.shape() != targets.shape() {
            return Err(BasenjiError::AlignmentError {
                sequence_bins: predictions.len_of(Axis(1)),
                target_bins: targets.len_of(Axis(1)),
            });
        }
        if predictions.len_of(Axis(2)) != self.track_names.len() {
            return Err(BasenjiError::InvalidConfig(format!(
                "predictions have {} tracks, expected {}",
                predictions.len_of(Axis(2)),
                self.track_names.len()
            )));
        }
        for (j, (pred, target)) in predictions
            .axis_iter(Axis(2))
            .zip(targets.axis_iter(Axis(2)))
            .enumerate()
        {
            self.predictions[j].extend(pred.iter().map(|x| f64::from(*x)));
            self.targets[j].extend(target.iter().map(|x| f64::from(*x)));
        }
        self.num_examples += predictions.len_of(Axis(0));
        Ok(())
    }

    pub fn finish(&self) -> EvaluationReport {
        let tracks = self
            .track_names
            .iter()
            .zip(self.predictions.iter().zip(&self.targets))
            .map(|(name, (pred, target))| {
                let (pearson_r, r2, mse) = track_metrics(pred, target);
                TrackMetrics {
                    track: name.clone(),
                    pearson_r,
                    r2,
                    mse,
                    count: pred.len(),
                }
            })
            .collect();
        EvaluationReport {
            tracks,
            num_examples: self.num_examples,
        }
    }
}

/// Run `predictor` over held-out batches (no augmentation, inference mode) and score it.
pub fn evaluate<P: SignalPredictor>(
    predictor: &P,
    batches: &[Batch],
    track_names: &[String],
) -> Result<EvaluationReport, BasenjiError> {
    let mut evaluator = Evaluator::new(track_names.to_vec());
    for batch in batches {
        let predictions = predictor.predict(batch.inputs().view())?;
        evaluator.update(predictions.view(), batch.targets().view())?;
    }
    let report = evaluator.finish();
    debug!(
        num_examples = report.num_examples,
        mean_pearson_r = report.mean_pearson_r(),
        "evaluated"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    #[test]
    fn test_identical_predictions() {
        let values = [0.0, 1.0, 4.0, 2.0, 8.0];
        let (r, r2, mse) = track_metrics(&values, &values);
        assert!((r - 1.0).abs() < 1e-12);
        assert!((r2 - 1.0).abs() < 1e-12);
        assert_eq!(mse, 0.0);
    }

    #[test]
    fn test_known_values() {
        let (r, _, mse) = track_metrics(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]);
        assert!((r + 1.0).abs() < 1e-12);
        assert!((mse - 8.0 / 3.0).abs() < 1e-12);

        let (_, r2, _) = track_metrics(&[2.0, 2.0, 2.0], &[1.0, 2.0, 3.0]);
        assert!(r2.abs() < 1e-12);
    }

    #[test]
    fn test_zero_variance() {
        let (r, r2, mse) = track_metrics(&[1.0, 1.0, 1.0], &[1.0, 1.0, 1.0]);
        assert_eq!((r, r2, mse), (0.0, 0.0, 0.0));
        let (r, _, _) = track_metrics(&[1.0, 2.0, 3.0], &[5.0, 5.0, 5.0]);
        assert_eq!(r, 0.0);
        assert_eq!(track_metrics(&[], &[]), (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_evaluator_accumulates_batches() {
        let mut evaluator = Evaluator::new(vec!["a".to_string(), "b".to_string()]);
        let first: Array3<f32> = array![[[1.0, 5.0], [2.0, 5.0]]];
        let second: Array3<f32> = array![[[3.0, 5.0], [4.0, 5.0]]];
        evaluator.update(first.view(), first.view()).unwrap();
        evaluator.update(second.view(), second.view()).unwrap();
        let report = evaluator.finish();
        assert_eq!(report.num_examples, 2);
        assert_eq!(report.tracks[0].count, 4);
        assert!((report.tracks[0].pearson_r - 1.0).abs() < 1e-12);
        assert_eq!(report.tracks[1].pearson_r, 0.0);
        assert!((report.mean_pearson_r() - 0.5).abs() < 1e-12);

        let records = report.to_records(100);
        assert_eq!(records.len(), 7);
        assert_eq!(records.last().map(|r| r.metric.as_str()), Some("mean_pearson_r"));

        let wrong: Array3<f32> = Array3::zeros((1, 3, 2));
        assert!(evaluator.update(wrong.view(), first.view()).is_err());
    }
}
