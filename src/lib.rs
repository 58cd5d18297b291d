//! # basenji
//!
//! Train hybrid convolutional/recurrent neural networks that predict regulatory signal
//! tracks (chromatin accessibility, expression, coverage) from DNA sequence.
//!
//! The library is organized along the data flow:
//!
//!  1. [`ranges`]: genomic intervals and the window indexer, which maps a region list onto
//!     fixed-width windows.
//!  2. [`sequences`]: the genome (FASTA) and per-basepair target track sources.
//!  3. [`encoding`]: one-hot encoding of nucleotide windows.
//!  4. [`dataset`]: training examples, augmentation, the seeded batch sampler and the
//!     multi-threaded producer pipeline.
//!  5. [`model`]: the convolution + aggregator network (built on [`burn`]).
//!  6. [`train`]: the training loop state machine, checkpoints and metrics log.
//!  7. [`evaluate`]: per-track held-out metrics.
//!  8. [`predict`]: per-bin prediction output.

pub mod commands;
pub mod dataset;
pub mod encoding;
pub mod error;
pub mod evaluate;
pub mod io;
pub mod model;
pub mod predict;
pub mod ranges;
pub mod reporting;
pub mod sequences;
pub mod test_utilities;
pub mod train;
pub mod traits;

pub use error::BasenjiError;

pub type Position = u32;
pub type PositionOffset = i32;

/// The backend used for training: burn's CPU `ndarray` backend with autodiff.
pub type TrainBackend = burn::backend::Autodiff<burn::backend::NdArray<f32>>;

/// The backend used for inference and evaluation.
pub type InferenceBackend = burn::backend::NdArray<f32>;

pub mod prelude {
    pub use crate::error::BasenjiError;
    pub use crate::io::file::read_seqlens;
    pub use crate::ranges::{GenomicInterval, Strand};
    pub use crate::ranges::windows::WindowIndexer;
    pub use crate::encoding::{EncodedSequence, NeutralPolicy, OneHotEncoder};
    pub use crate::dataset::{Batch, TrainingExample};
    pub use crate::traits::{GenericRange, Sequences, SignalPredictor, TsvSerialize};
    pub use crate::Position;
}
