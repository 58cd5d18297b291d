//! Model architecture configuration.
//!
//! The `[model]` section of a run configuration file deserializes into a [`ModelConfig`].
//! Architecture values are validated once, at startup, against the input window length.

use burn::{
    nn::{DropoutConfig, LinearConfig, Relu},
    prelude::*,
};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

use super::aggregator::{AttentionAggregatorConfig, GruAggregatorConfig};
use super::conv::ConvBlockConfig;
use super::SeqSignalModel;
use crate::{encoding::ALPHABET_SIZE, BasenjiError};

/// Held while a model is initialized, since burn seeds and draws from one generator per
/// backend and process.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// One convolutional stage: Conv1d, batch norm, ReLU and max-pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvStage {
    pub filters: usize,
    /// Must be odd, so that "same" padding is symmetric.
    pub kernel_size: usize,
    /// Max-pool width and stride; 1 disables pooling for this stage.
    pub pool: usize,
}

impl ConvStage {
    pub fn new(filters: usize, kernel_size: usize, pool: usize) -> Self {
        Self {
            filters,
            kernel_size,
            pool,
        }
    }
}

/// The sequential layer that integrates long-range dependencies across bins.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregatorKind {
    /// A unidirectional GRU.
    #[default]
    Gru,
    /// Multi-head self-attention with sinusoidal position encoding.
    Attention,
}

impl std::fmt::Display for AggregatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregatorKind::Gru => write!(f, "gru"),
            AggregatorKind::Attention => write!(f, "attention"),
        }
    }
}

fn default_conv() -> Vec<ConvStage> {
    vec![
        ConvStage::new(32, 15, 2),
        ConvStage::new(48, 5, 2),
        ConvStage::new(64, 5, 2),
    ]
}

fn default_hidden_size() -> usize {
    64
}

fn default_num_heads() -> usize {
    4
}

fn default_dropout() -> f64 {
    0.1
}

/// The architecture of a [`SeqSignalModel`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_conv")]
    pub conv: Vec<ConvStage>,
    /// The width of the per-bin representation fed to the aggregator.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default)]
    pub aggregator: AggregatorKind,
    /// Attention heads; only used by [`AggregatorKind::Attention`].
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            conv: default_conv(),
            hidden_size: default_hidden_size(),
            aggregator: AggregatorKind::default(),
            num_heads: default_num_heads(),
            dropout: default_dropout(),
        }
    }
}

impl ModelConfig {
    /// The number of basepairs summarized by one output bin: the product of the stage
    /// pool sizes.
    pub fn pooling_factor(&self) -> usize {
        self.conv.iter().map(|stage| stage.pool).product()
    }

    /// The number of output bins for an input of `window_len` basepairs.
    pub fn num_bins(&self, window_len: usize) -> usize {
        window_len / self.pooling_factor().max(1)
    }

    /// Check the architecture against the input window length.
    ///
    /// # Errors
    /// Returns [`BasenjiError::InvalidConfig`] for an empty convolution stack, even or
    /// zero kernels, zero pools or filters, a window length not divisible by the pooling
    /// factor, a dropout outside `[0, 1)`, or (for attention) a head count that does not
    /// divide the hidden size.
    pub fn validate(&self, window_len: usize) -> Result<(), BasenjiError> {
        let invalid = |msg: String| Err(BasenjiError::InvalidConfig(msg));
        if self.conv.is_empty() {
            return invalid("the model needs at least one convolution stage".to_string());
        }
        for (i, stage) in self.conv.iter().enumerate() {
            if stage.kernel_size % 2 == 0 {
                return invalid(format!(
                    "convolution stage {}: kernel size {} must be odd",
                    i, stage.kernel_size
                ));
            }
            if stage.pool == 0 || stage.filters == 0 {
                return invalid(format!(
                    "convolution stage {}: pool and filters must be non-zero",
                    i
                ));
            }
        }
        if self.hidden_size == 0 {
            return invalid("hidden_size must be non-zero".to_string());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return invalid(format!("dropout {} must be in [0, 1)", self.dropout));
        }
        if self.aggregator == AggregatorKind::Attention
            && (self.num_heads == 0 || self.hidden_size % self.num_heads != 0)
        {
            return invalid(format!(
                "{} attention heads do not divide the hidden size {}",
                self.num_heads, self.hidden_size
            ));
        }
        let factor = self.pooling_factor();
        if window_len == 0 || window_len % factor != 0 {
            return invalid(format!(
                "window length {} is not a non-zero multiple of the pooling factor {}",
                window_len, factor
            ));
        }
        Ok(())
    }

    /// Build a freshly initialized model.
    ///
    /// The configuration should have passed [`ModelConfig::validate()`] for `window_len`.
    ///
    /// # Arguments
    /// * `window_len`: the input length, which bounds the attention position encoding.
    /// * `num_targets`: the number of output tracks.
    /// * `device`: the device parameters are allocated on.
    pub fn init<B: Backend>(
        &self,
        window_len: usize,
        num_targets: usize,
        device: &B::Device,
    ) -> SeqSignalModel<B> {
        let _guard = INIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        self.build(window_len, num_targets, device)
    }

    fn build<B: Backend>(
        &self,
        window_len: usize,
        num_targets: usize,
        device: &B::Device,
    ) -> SeqSignalModel<B> {
        let mut in_channels = ALPHABET_SIZE;
        let conv: Vec<_> = self
            .conv
            .iter()
            .map(|stage| {
                let block = ConvBlockConfig::new(in_channels, stage.filters, stage.kernel_size)
                    .with_pool_size(stage.pool)
                    .init(device);
                in_channels = stage.filters;
                block
            })
            .collect();

        let (gru, attention) = match self.aggregator {
            AggregatorKind::Gru => (
                Some(GruAggregatorConfig::new(self.hidden_size).init(device)),
                None,
            ),
            AggregatorKind::Attention => (
                None,
                Some(
                    AttentionAggregatorConfig::new(self.hidden_size, self.num_heads)
                        .with_max_bins(self.num_bins(window_len).max(1))
                        .with_dropout(self.dropout)
                        .init(device),
                ),
            ),
        };

        SeqSignalModel {
            conv,
            projection: LinearConfig::new(in_channels, self.hidden_size).init(device),
            gru,
            attention,
            dropout: DropoutConfig::new(self.dropout).init(),
            head: LinearConfig::new(self.hidden_size, num_targets).init(device),
            activation: Relu::new(),
            pooling_factor: self.pooling_factor(),
            num_targets,
        }
    }

    /// Build a model initialized from `seed`.
    ///
    /// burn's backend generator is process-wide. Seeding and initialization here are
    /// serialized with every other initialization through a [`ModelConfig`], so
    /// concurrent callers with the same seed get the same parameters. Dropout draws from the same generator without this lock: runs
    /// with `dropout > 0` training concurrently in one process are not reproducible.
    pub fn init_seeded<B: Backend>(
        &self,
        seed: u64,
        window_len: usize,
        num_targets: usize,
        device: &B::Device,
    ) -> SeqSignalModel<B> {
        let _guard = INIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        B::seed(seed);
        self.build(window_len, num_targets, device)
    }

    /// Build a model holding `record`'s parameters and batch norm statistics.
    ///
    /// `Module::clone()` shares batch norm running statistics between the copies, so a
    /// forward pass in training mode on either one updates both. A model built here
    /// shares no state with the model the record was taken from.
    pub fn load<B: Backend>(
        &self,
        record: <SeqSignalModel<B> as Module<B>>::Record,
        window_len: usize,
        num_targets: usize,
        device: &B::Device,
    ) -> SeqSignalModel<B> {
        let _guard = INIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        self.build(window_len, num_targets, device).load_record(record)
    }
}
