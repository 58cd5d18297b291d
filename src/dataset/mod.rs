//! Training examples, batches and the data pipeline that feeds the training loop.
//!
//! The flow through this module is:
//!
//!  1. An [`ExampleSource`] turns one window from the
//!     [`WindowIndexer`](crate::ranges::windows::WindowIndexer) into a
//!     [`TrainingExample`]: an encoded sequence and its pooled `[bins, tracks]` targets,
//!     with an optional [`Augmentation`] applied to both.
//!  2. A [`BatchSampler`] groups windows into batches, with a per-epoch shuffle and per-batch
//!     augmentation that are both derived from `(seed, epoch, batch index)`.
//!  3. A [`BatchPipeline`] runs the sampler on worker threads, pushing batches into a
//!     bounded channel that the training loop consumes.
//!
//! Data errors (bad regions, unencodable sequence, misaligned targets, unknown sequence
//! names) drop the example and are counted, unless the sampler is strict.

pub mod augment;
pub mod batch;
pub mod example;
pub mod pipeline;
pub mod sampler;

pub use augment::{AugmentConfig, Augmentation};
pub use batch::Batch;
pub use example::{ExampleSource, TrainingExample};
pub use pipeline::{BatchPipeline, BatchSource, CancellationToken, PipelineConfig};
pub use sampler::{BatchSampler, DroppedExample, SampledBatch, SamplerConfig};
