//! Training losses over `[batch, bins, tracks]` predictions.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// Added to predictions before taking logs.
pub const POISSON_EPSILON: f64 = 1e-6;

/// The loss minimized during training.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    /// Poisson negative log-likelihood, without the `log(y!)` term (constant in the
    /// parameters): `mean(pred - y * log(pred + eps))`.
    #[default]
    Poisson,
    /// Mean squared error.
    Mse,
}

impl LossKind {
    /// The mean loss over all elements, as a one-element tensor.
    pub fn forward<B: Backend>(
        &self,
        predictions: Tensor<B, 3>,
        targets: Tensor<B, 3>,
    ) -> Tensor<B, 1> {
        match self {
            LossKind::Poisson => {
                let log_rate = predictions.clone().add_scalar(POISSON_EPSILON).log();
                (predictions - targets * log_rate).mean()
            }
            LossKind::Mse => (predictions - targets).powf_scalar(2.0).mean(),
        }
    }
}

impl std::fmt::Display for LossKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LossKind::Poisson => write!(f, "poisson"),
            LossKind::Mse => write!(f, "mse"),
        }
    }
}
