//! Model training: run configuration, the training loop state machine, checkpoints and
//! the metrics log.

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod metrics;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointMeta, CheckpointStore};
pub use config::{DataConfig, OptimizerConfig, RunConfig, TrainConfig};
pub use context::{StopReason, TrainingContext, TrainingState};
pub use metrics::{MetricRecord, MetricsLog};
pub use trainer::Trainer;
