//! The [`BasenjiError`] `enum` definition and error messages.
//!
use crate::Position;
use genomap::GenomeMapError;
use std::num::{ParseFloatError, ParseIntError};
use std::string::FromUtf8Error;
use thiserror::Error;

/// The [`BasenjiError`] defines the standard set of errors that should
/// be passed to the user.
#[derive(Debug, Error)]
pub enum BasenjiError {
    // IO related errors
    #[error("File reading error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Persistence of '{path}' failed after {attempts} attempts: {source}")]
    PersistenceFailed {
        path: String,
        attempts: usize,
        source: std::io::Error,
    },

    // File parsing related errors
    #[error("TSV parsing error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Integer parsing error: {0}")]
    ParseIntError(#[from] ParseIntError),
    #[error("Float parsing error: {0}")]
    ParseFloatError(#[from] ParseFloatError),
    #[error("UTF-8 conversion error: {0}")]
    FromUtf8Error(#[from] FromUtf8Error),
    #[error("File has invalid column type entry: expected {expected_type}, found '{found_value}'.\nLine: {line}")]
    InvalidColumnType {
        expected_type: String,
        found_value: String,
        line: String,
    },
    #[error("Bed-like file has too few columns. The first three columns must be sequence name, and start and end positions.\nLine: {0}")]
    BedlikeTooFewColumns(String),
    #[error("Genome file is invalid: {0}")]
    InvalidGenomeFile(String),
    #[error("Invalid strand '{0}': must be either '+', '-', or '.'")]
    InvalidStrand(String),
    #[error("Error encountered in genomap::GenomeMap")]
    GenomeMapError(#[from] GenomeMapError),
    #[error("Could not read .npy track: {0}")]
    ReadNpyError(#[from] ndarray_npy::ReadNpyError),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    // Lookups into the genome or target sources
    #[error("Sequence name '{0}' not found")]
    NotFound(String),

    // Data layer errors: skippable per-example unless strict
    #[error("Invalid region {seqname}:{start}-{end}: {reason}")]
    InvalidRegion {
        seqname: String,
        start: Position,
        end: Position,
        reason: String,
    },
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Alignment error: sequence has {sequence_bins} bins but targets have {target_bins}")]
    AlignmentError {
        sequence_bins: usize,
        target_bins: usize,
    },

    // Training layer errors
    #[error("Training diverged at step {step}: loss = {loss}")]
    DivergenceError { step: u64, loss: f64 },
    #[error("Training was cancelled")]
    Cancelled,
    #[error("Batch producer pipeline disconnected: {0}")]
    PipelineDisconnected(String),
    #[error("No examples could be produced from the {0} regions")]
    NoExamples(String),
    #[error("Tensor conversion error: {0}")]
    TensorError(String),

    // Checkpoint related errors
    #[error("Checkpoint format error: {0}")]
    CheckpointFormat(String),
    #[error("Model record error: {0}")]
    RecordError(String),

    // Configuration and command line tool related errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Configuration parsing error: {0}")]
    ConfigParseError(#[from] toml::de::Error),
    #[error("Command line argument error: {0}")]
    ArgumentError(#[from] clap::error::Error),
}

impl BasenjiError {
    /// Build an [`BasenjiError::InvalidRegion`] error.
    pub fn invalid_region(
        seqname: &str,
        start: Position,
        end: Position,
        reason: impl Into<String>,
    ) -> Self {
        BasenjiError::InvalidRegion {
            seqname: seqname.to_string(),
            start,
            end,
            reason: reason.into(),
        }
    }

    /// Whether this is a per-example data-layer error, i.e. one that drops
    /// the example rather than the batch when not in strict mode.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            BasenjiError::InvalidRegion { .. }
                | BasenjiError::EncodingError(_)
                | BasenjiError::AlignmentError { .. }
                | BasenjiError::NotFound(_)
        )
    }

    /// A short stable label for this error kind, used in drop reports.
    pub fn kind(&self) -> &'static str {
        match self {
            BasenjiError::InvalidRegion { .. } => "invalid_region",
            BasenjiError::EncodingError(_) => "encoding",
            BasenjiError::AlignmentError { .. } => "alignment",
            BasenjiError::NotFound(_) => "not_found",
            BasenjiError::DivergenceError { .. } => "divergence",
            BasenjiError::IOError(_) | BasenjiError::PersistenceFailed { .. } => "io",
            _ => "other",
        }
    }
}
