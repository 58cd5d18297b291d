//! Sequence augmentation: reverse complement and whole-bin shifts.
//!
//! Augmentations are drawn from a caller-provided generator so that the sampler can
//! reproduce them from a seed.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{ranges::GenomicInterval, BasenjiError, Position, PositionOffset};

fn default_shifts() -> Vec<PositionOffset> {
    vec![0]
}

/// Augmentation settings for training batches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AugmentConfig {
    /// Reverse complement each example with probability one half.
    #[serde(default)]
    pub reverse_complement: bool,
    /// The set of shifts, in bins, each example's window is moved by (drawn uniformly).
    #[serde(default = "default_shifts")]
    pub shifts: Vec<PositionOffset>,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            reverse_complement: false,
            shifts: default_shifts(),
        }
    }
}

impl AugmentConfig {
    pub fn validate(&self) -> Result<(), BasenjiError> {
        if self.shifts.is_empty() {
            return Err(BasenjiError::InvalidConfig(
                "augmentation shifts must contain at least one value (use [0] for none)"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Whether any augmentation is configured at all.
    pub fn is_enabled(&self) -> bool {
        self.reverse_complement || self.shifts.iter().any(|s| *s != 0)
    }

    /// Draw the augmentation for one example.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Augmentation {
        // Both draws always happen: the generator advances the same for every example.
        let flip = rng.gen_bool(0.5);
        let shift_bins = self.shifts[rng.gen_range(0..self.shifts.len())];
        Augmentation {
            reverse_complement: self.reverse_complement && flip,
            shift_bins,
        }
    }
}

/// The augmentation applied to a single example.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Augmentation {
    pub reverse_complement: bool,
    pub shift_bins: PositionOffset,
}

impl Augmentation {
    /// No augmentation, as used for evaluation and prediction.
    pub fn none() -> Self {
        Self::default()
    }
}

/// Move a window by `shift_bins * bin_width` basepairs, falling back to the unshifted
/// window if the shifted one would leave `[0, seqlen)`.
pub fn shift_window(
    window: &GenomicInterval,
    shift_bins: PositionOffset,
    bin_width: Position,
    seqlen: Position,
) -> GenomicInterval {
    if shift_bins == 0 {
        return window.clone();
    }
    let offset = i64::from(shift_bins) * i64::from(bin_width);
    PositionOffset::try_from(offset)
        .ok()
        .and_then(|offset| window.shifted(offset, seqlen))
        .unwrap_or_else(|| window.clone())
}
