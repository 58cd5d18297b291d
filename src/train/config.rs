//! Run configuration files.
//!
//! A training run is described by a TOML file with three sections:
//!
//! ```toml
//! [data]
//! fasta = "genome.fa.gz"
//! seqlens = "genome.tsv"          # optional; taken from the FASTA otherwise
//! train_regions = "train.bed"     # optional; the whole genome otherwise
//! valid_regions = "valid.bed"     # optional; no evaluation or early stopping otherwise
//! window_len = 1024
//!
//! [[data.tracks]]
//! name = "dnase"
//! path = "dnase.bedgraph.gz"
//! pool = "mean"
//!
//! [model]
//! aggregator = "gru"
//!
//! [train]
//! batch_size = 16
//! max_steps = 5000
//!
//! [train.optimizer]
//! kind = "adam"
//! ```
//!
//! Every field outside `[data]` has a default, and relative paths are resolved against
//! the directory of the configuration file. [`RunConfig::validate()`] checks the whole
//! configuration before anything is loaded.

use burn::{
    grad_clipping::GradientClippingConfig,
    optim::{momentum::MomentumConfig, AdamConfig, SgdConfig},
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::{
    dataset::{AugmentConfig, PipelineConfig, SamplerConfig},
    encoding::NeutralPolicy,
    model::{LossKind, ModelConfig},
    sequences::numeric::{strand_swap_permutation, TrackSpec},
    BasenjiError, Position,
};

/// The `[data]` section: where examples come from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub fasta: PathBuf,
    #[serde(default)]
    pub seqlens: Option<PathBuf>,
    #[serde(default)]
    pub train_regions: Option<PathBuf>,
    #[serde(default)]
    pub valid_regions: Option<PathBuf>,
    /// Regions (e.g. assembly gaps) that windows should avoid.
    #[serde(default)]
    pub blacklist: Option<PathBuf>,
    /// The largest blacklisted fraction of a window that is still used.
    #[serde(default)]
    pub max_blacklist_fraction: f64,
    /// The model input length `W`.
    pub window_len: Position,
    /// The distance between window starts; `window_len` (no overlap) by default.
    #[serde(default)]
    pub step: Option<Position>,
    #[serde(default)]
    pub neutral: NeutralPolicy,
    pub tracks: Vec<TrackSpec>,
}

impl DataConfig {
    pub fn step(&self) -> Position {
        self.step.unwrap_or(self.window_len)
    }
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_epsilon() -> f32 {
    1e-8
}

/// The optimizer, selected by its `kind`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OptimizerConfig {
    Adam {
        #[serde(default = "default_beta1")]
        beta1: f32,
        #[serde(default = "default_beta2")]
        beta2: f32,
        #[serde(default = "default_epsilon")]
        epsilon: f32,
    },
    Sgd {
        #[serde(default)]
        momentum: Option<f64>,
    },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Adam {
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_epsilon(),
        }
    }
}

impl OptimizerConfig {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerConfig::Adam { .. } => "adam",
            OptimizerConfig::Sgd { .. } => "sgd",
        }
    }

    fn validate(&self) -> Result<(), BasenjiError> {
        let ok = match self {
            OptimizerConfig::Adam {
                beta1,
                beta2,
                epsilon,
            } => (0.0..1.0).contains(beta1) && (0.0..1.0).contains(beta2) && *epsilon > 0.0,
            OptimizerConfig::Sgd { momentum } => {
                momentum.map_or(true, |m| (0.0..1.0).contains(&m))
            }
        };
        if ok {
            Ok(())
        } else {
            Err(BasenjiError::InvalidConfig(format!(
                "invalid {} optimizer parameters: {:?}",
                self.name(),
                self
            )))
        }
    }

    /// The burn Adam configuration, if this is Adam.
    pub fn adam(&self, grad_clip_norm: Option<f32>) -> Option<AdamConfig> {
        match self {
            OptimizerConfig::Adam {
                beta1,
                beta2,
                epsilon,
            } => Some(
                AdamConfig::new()
                    .with_beta_1(*beta1)
                    .with_beta_2(*beta2)
                    .with_epsilon(*epsilon)
                    .with_grad_clipping(grad_clip_norm.map(GradientClippingConfig::Norm)),
            ),
            OptimizerConfig::Sgd { .. } => None,
        }
    }

    /// The burn SGD configuration, if this is SGD.
    pub fn sgd(&self, grad_clip_norm: Option<f32>) -> Option<SgdConfig> {
        match self {
            OptimizerConfig::Sgd { momentum } => Some(
                SgdConfig::new()
                    .with_momentum(momentum.map(|m| {
                        MomentumConfig::new().with_momentum(m).with_dampening(0.0)
                    }))
                    .with_gradient_clipping(grad_clip_norm.map(GradientClippingConfig::Norm)),
            ),
            OptimizerConfig::Adam { .. } => None,
        }
    }
}

fn default_seed() -> u64 {
    42
}

fn default_batch_size() -> usize {
    32
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_max_steps() -> u64 {
    10_000
}

fn default_checkpoint_interval() -> u64 {
    1_000
}

fn default_eval_interval() -> u64 {
    500
}

fn default_patience() -> usize {
    10
}

fn default_log_interval() -> u64 {
    50
}

fn default_io_retries() -> usize {
    3
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("basenji_run")
}

fn default_true() -> bool {
    true
}

/// The `[train]` section: the optimization loop and its surroundings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// Clip the global gradient norm to this value.
    #[serde(default)]
    pub grad_clip_norm: Option<f32>,
    #[serde(default)]
    pub loss: LossKind,
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    /// Steps between checkpoints of the latest parameters; 0 only checkpoints at exit.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    /// Steps between evaluations on the validation regions; 0 disables evaluation.
    #[serde(default = "default_eval_interval")]
    pub eval_interval: u64,
    /// Evaluation rounds without improvement before stopping; 0 disables early stopping.
    #[serde(default = "default_patience")]
    pub patience: usize,
    /// Steps between training loss records in the metrics log.
    #[serde(default = "default_log_interval")]
    pub log_interval: u64,
    #[serde(default)]
    pub augment: AugmentConfig,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    /// Abort on data errors instead of dropping the offending examples.
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Attempts at each checkpoint or metrics write after the first one fails.
    #[serde(default = "default_io_retries")]
    pub io_retries: usize,
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            optimizer: OptimizerConfig::default(),
            grad_clip_norm: None,
            loss: LossKind::default(),
            max_steps: default_max_steps(),
            checkpoint_interval: default_checkpoint_interval(),
            eval_interval: default_eval_interval(),
            patience: default_patience(),
            log_interval: default_log_interval(),
            augment: AugmentConfig::default(),
            shuffle: true,
            strict: false,
            pipeline: PipelineConfig::default(),
            io_retries: default_io_retries(),
            out_dir: default_out_dir(),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<(), BasenjiError> {
        let invalid = |msg: &str| Err(BasenjiError::InvalidConfig(msg.to_string()));
        if self.batch_size == 0 {
            return invalid("batch_size must be greater than zero");
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid("learning_rate must be a positive number");
        }
        if self.max_steps == 0 {
            return invalid("max_steps must be greater than zero");
        }
        if self.log_interval == 0 {
            return invalid("log_interval must be greater than zero");
        }
        if let Some(norm) = self.grad_clip_norm {
            if !(norm.is_finite() && norm > 0.0) {
                return invalid("grad_clip_norm must be a positive number");
            }
        }
        self.optimizer.validate()?;
        self.augment.validate()?;
        self.pipeline.validate()
    }

    /// The sampler settings for training batches.
    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            batch_size: self.batch_size,
            seed: self.seed,
            shuffle: self.shuffle,
            strict: self.strict,
            augment: self.augment.clone(),
        }
    }
}

/// A complete training run description.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub train: TrainConfig,
}

impl RunConfig {
    /// Parse a configuration from TOML text. Paths are left as written.
    pub fn from_toml_str(text: &str) -> Result<Self, BasenjiError> {
        Ok(toml::from_str(text)?)
    }

    /// Read a configuration file, resolving relative paths against its directory.
    pub fn from_file(filepath: impl AsRef<Path>) -> Result<Self, BasenjiError> {
        let filepath = filepath.as_ref();
        let text = fs::read_to_string(filepath)?;
        let mut config = Self::from_toml_str(&text)?;
        if let Some(base) = filepath.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        let data = &mut self.data;
        resolve(&mut data.fasta);
        for path in [
            &mut data.seqlens,
            &mut data.train_regions,
            &mut data.valid_regions,
            &mut data.blacklist,
        ]
        .into_iter()
        .flatten()
        {
            resolve(path);
        }
        for track in &mut data.tracks {
            resolve(&mut track.path);
        }
        resolve(&mut self.train.out_dir);
    }

    /// Apply command line overrides.
    pub fn with_overrides(
        mut self,
        seed: Option<u64>,
        out_dir: Option<PathBuf>,
        max_steps: Option<u64>,
    ) -> Self {
        if let Some(seed) = seed {
            self.train.seed = seed;
        }
        if let Some(out_dir) = out_dir {
            self.train.out_dir = out_dir;
        }
        if let Some(max_steps) = max_steps {
            self.train.max_steps = max_steps;
        }
        self
    }

    /// Check the whole configuration.
    ///
    /// # Errors
    /// Returns [`BasenjiError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<(), BasenjiError> {
        let data = &self.data;
        if data.tracks.is_empty() {
            return Err(BasenjiError::InvalidConfig(
                "at least one target track is required".to_string(),
            ));
        }
        for track in &data.tracks {
            track.validate()?;
        }
        strand_swap_permutation(&data.tracks)?;
        if data.step() == 0 {
            return Err(BasenjiError::InvalidConfig(
                "window step must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&data.max_blacklist_fraction) {
            return Err(BasenjiError::InvalidConfig(format!(
                "max_blacklist_fraction {} must be in [0, 1]",
                data.max_blacklist_fraction
            )));
        }
        self.model.validate(data.window_len as usize)?;
        self.train.validate()
    }

    /// The number of basepairs per target bin: the model's pooling factor.
    pub fn bin_width(&self) -> Position {
        self.model.pooling_factor() as Position
    }

    pub fn track_names(&self) -> Vec<String> {
        self.data.tracks.iter().map(|t| t.name.clone()).collect()
    }
}
