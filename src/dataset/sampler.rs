//! The seeded batch sampler.
//!
//! A [`BatchSampler`] owns the list of windows to train on and builds batch `index` of
//! epoch `epoch` on demand. Everything random about a batch comes from generators seeded
//! with [`derive_seed()`]:
//!
//!  - the window order of an epoch, from `(seed, epoch)`;
//!  - the augmentation of each example in a batch, from `(seed, epoch, index)`.
//!
//! So a batch is a pure function of the sampler and its coordinates, whichever thread
//! builds it and in whatever order.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::{augment::AugmentConfig, batch::Batch, example::ExampleSource};
use crate::{ranges::windows::WindowIndexer, ranges::GenomicInterval, BasenjiError};

/// Settings of a [`BatchSampler`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub batch_size: usize,
    pub seed: u64,
    /// Shuffle the window order every epoch.
    pub shuffle: bool,
    /// Abort on the first data error instead of dropping the example.
    pub strict: bool,
    pub augment: AugmentConfig,
}

impl SamplerConfig {
    /// A sampler configuration for held-out data: fixed order, no augmentation.
    pub fn evaluation(batch_size: usize, strict: bool) -> Self {
        Self {
            batch_size,
            seed: 0,
            shuffle: false,
            strict,
            augment: AugmentConfig::default(),
        }
    }
}

/// An example dropped because of a data error.
#[derive(Clone, Debug, PartialEq)]
pub struct DroppedExample {
    pub window: GenomicInterval,
    /// The error kind, see [`BasenjiError::kind()`].
    pub kind: &'static str,
    pub message: String,
}

/// The result of sampling one batch.
///
/// `batch` is `None` when every example of the batch was dropped.
#[derive(Clone, Debug)]
pub struct SampledBatch {
    pub epoch: usize,
    pub index: usize,
    pub batch: Option<Batch>,
    pub dropped: Vec<DroppedExample>,
}

/// Mix a seed with an epoch and batch index (the SplitMix64 finalizer, applied per
/// component).
pub fn derive_seed(seed: u64, epoch: u64, index: u64) -> u64 {
    fn mix(mut z: u64) -> u64 {
        z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
    mix(mix(mix(seed) ^ epoch) ^ index)
}

/// Builds reproducible batches of [`TrainingExample`](super::TrainingExample)s.
#[derive(Debug)]
pub struct BatchSampler {
    source: Arc<ExampleSource>,
    windows: Vec<GenomicInterval>,
    config: SamplerConfig,
}

impl BatchSampler {
    /// Create a sampler over all windows of `indexer`.
    ///
    /// # Errors
    /// [`BasenjiError::InvalidConfig`] if the indexer's window width is not the source's
    /// window length or the batch size is zero, and [`BasenjiError::NoExamples`] if the
    /// indexer yields no windows.
    pub fn new(
        source: Arc<ExampleSource>,
        indexer: &WindowIndexer,
        config: SamplerConfig,
    ) -> Result<Self, BasenjiError> {
        if indexer.width() != source.window_len() {
            return Err(BasenjiError::InvalidConfig(format!(
                "window width {} differs from the model input length {}",
                indexer.width(),
                source.window_len()
            )));
        }
        if config.batch_size == 0 {
            return Err(BasenjiError::InvalidConfig(
                "batch size must be greater than zero".to_string(),
            ));
        }
        config.augment.validate()?;
        let windows: Vec<GenomicInterval> = indexer.iter().collect();
        if windows.is_empty() {
            return Err(BasenjiError::NoExamples(format!(
                "{}",
                indexer.regions().len()
            )));
        }
        Ok(Self {
            source,
            windows,
            config,
        })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn source(&self) -> &ExampleSource {
        &self.source
    }

    pub fn num_windows(&self) -> usize {
        self.windows.len()
    }

    /// The number of batches per epoch; the last batch of an epoch may be short.
    pub fn num_batches(&self) -> usize {
        self.windows.len().div_ceil(self.config.batch_size)
    }

    /// The window order of an epoch.
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.windows.len()).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(derive_seed(self.config.seed, epoch as u64, u64::MAX));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Build batch `index` of `epoch`, given that epoch's [`BatchSampler::epoch_order()`].
    ///
    /// # Errors
    /// Data errors are returned only in strict mode; other errors always are.
    pub fn sample(
        &self,
        epoch: usize,
        index: usize,
        order: &[usize],
    ) -> Result<SampledBatch, BasenjiError> {
        let mut rng = StdRng::seed_from_u64(derive_seed(
            self.config.seed,
            epoch as u64,
            index as u64,
        ));
        let lo = (index * self.config.batch_size).min(order.len());
        let hi = (lo + self.config.batch_size).min(order.len());

        let mut examples = Vec::with_capacity(hi - lo);
        let mut dropped = Vec::new();
        for &i in &order[lo..hi] {
            let window = &self.windows[i];
            let augmentation = self.config.augment.sample(&mut rng);
            match self.source.example(window, augmentation) {
                Ok(example) => examples.push(example),
                Err(e) if e.is_data_error() && !self.config.strict => {
                    debug!(window = %window, error = %e, "dropped example");
                    dropped.push(DroppedExample {
                        window: window.clone(),
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let batch = if examples.is_empty() {
            None
        } else {
            Some(Batch::new(examples)?)
        };
        Ok(SampledBatch {
            epoch,
            index,
            batch,
            dropped,
        })
    }

    /// Build every batch of one epoch, in order.
    pub fn collect_epoch(&self, epoch: usize) -> Result<Vec<SampledBatch>, BasenjiError> {
        let order = self.epoch_order(epoch);
        (0..self.num_batches())
            .map(|index| self.sample(epoch, index, &order))
            .collect()
    }
}
