//! Training loop state: the explicit [`TrainingContext`] and the [`TrainingState`]
//! machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a run stopped normally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxSteps,
    EarlyStopping,
    Cancelled,
    DataExhausted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            StopReason::MaxSteps => "maximum number of steps reached",
            StopReason::EarlyStopping => "no improvement on the validation set",
            StopReason::Cancelled => "cancelled",
            StopReason::DataExhausted => "training data exhausted",
        };
        write!(f, "{}", reason)
    }
}

/// The states of the training loop.
///
/// ```text
/// Initialized -> Running <-> Checkpointing
///                Running  -> Stopped(reason)
///   (any)                 -> Failed(reason)
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub enum TrainingState {
    #[default]
    Initialized,
    Running,
    Checkpointing,
    Stopped(StopReason),
    Failed(String),
}

impl TrainingState {
    /// Whether the loop has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrainingState::Stopped(_) | TrainingState::Failed(_))
    }

    /// Whether the transition `self -> next` is allowed.
    pub fn can_transition_to(&self, next: &TrainingState) -> bool {
        use TrainingState::*;
        match (self, next) {
            (_, Failed(_)) => !matches!(self, Failed(_)),
            (Initialized, Running) => true,
            (Running, Checkpointing) | (Checkpointing, Running) => true,
            (Running, Stopped(_)) | (Checkpointing, Stopped(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TrainingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingState::Initialized => write!(f, "initialized"),
            TrainingState::Running => write!(f, "running"),
            TrainingState::Checkpointing => write!(f, "checkpointing"),
            TrainingState::Stopped(reason) => write!(f, "stopped ({})", reason),
            TrainingState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Everything the training loop tracks besides the parameters and optimizer state.
///
/// The context is saved in every checkpoint, so a resumed run continues with the same
/// step counter, early stopping state and batch position.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingContext {
    /// Optimizer steps taken.
    pub step: u64,
    /// Batch jobs consumed from the pipeline, including those with no examples left.
    pub batches_consumed: u64,
    pub epoch: usize,
    /// The best validation metric (mean Pearson r) so far.
    pub best_metric: Option<f64>,
    pub best_step: Option<u64>,
    pub rounds_without_improvement: usize,
    pub dropped_examples: u64,
    pub last_loss: Option<f64>,
}

impl TrainingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an evaluation round, returning whether `metric` improved on the best so
    /// far (higher is better). Non-finite metrics never improve.
    pub fn record_evaluation(&mut self, metric: f64) -> bool {
        let improved =
            metric.is_finite() && self.best_metric.map_or(true, |best| metric > best);
        if improved {
            self.best_metric = Some(metric);
            self.best_step = Some(self.step);
            self.rounds_without_improvement = 0;
        } else {
            self.rounds_without_improvement += 1;
        }
        improved
    }

    /// Whether early stopping should trigger; a `patience` of 0 disables it.
    pub fn patience_exhausted(&self, patience: usize) -> bool {
        patience > 0 && self.rounds_without_improvement >= patience
    }
}
