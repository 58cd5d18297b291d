//! One-hot encoding of nucleotide sequences.
//!
//! An [`EncodedSequence`] is an immutable `[length, 4]` matrix, one row per position and
//! one column per base, in the order `A, C, G, T`. Because of this column order, the
//! complement of a base is its column reversed, so reverse complementing an encoded
//! sequence is reversing both axes.
//!
//! Unknown bases (`N`) are never an error: they map to a neutral row set by the
//! [`NeutralPolicy`]. Any other character is.

use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::BasenjiError;

/// The encoded alphabet, in column order.
pub const ALPHABET: [u8; 4] = [b'A', b'C', b'G', b'T'];

/// The number of columns of an encoded sequence.
pub const ALPHABET_SIZE: usize = ALPHABET.len();

/// How an unknown base (`N`) is encoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeutralPolicy {
    /// `[0.25, 0.25, 0.25, 0.25]`: the base is equally likely to be any nucleotide.
    #[default]
    Uniform,
    /// `[0, 0, 0, 0]`: no evidence for any nucleotide.
    Zeros,
}

impl NeutralPolicy {
    /// The value written in every column of a neutral row.
    pub fn value(&self) -> f32 {
        match self {
            NeutralPolicy::Uniform => 1.0 / ALPHABET_SIZE as f32,
            NeutralPolicy::Zeros => 0.0,
        }
    }
}

/// A one-hot encoded nucleotide sequence, with shape `[length, 4]`.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedSequence {
    data: Array2<f32>,
}

impl EncodedSequence {
    /// The number of positions.
    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }

    pub fn into_array(self) -> Array2<f32> {
        self.data
    }

    /// Decode back to an uppercase nucleotide string. Rows that are not a one-hot
    /// vector (i.e. neutral rows) decode to `N`.
    pub fn decode(&self) -> String {
        self.data
            .rows()
            .into_iter()
            .map(|row| {
                let hot: Vec<usize> = row
                    .iter()
                    .enumerate()
                    .filter(|(_, x)| **x != 0.0)
                    .map(|(i, _)| i)
                    .collect();
                match hot.as_slice() {
                    [i] if row[*i] == 1.0 => ALPHABET[*i] as char,
                    _ => 'N',
                }
            })
            .collect()
    }

    /// The reverse complement: positions reversed and `A↔T`, `C↔G` swapped.
    /// Neutral rows are symmetric, so they map to themselves.
    pub fn reverse_complement(&self) -> Self {
        Self {
            data: self.data.slice(s![..;-1, ..;-1]).to_owned(),
        }
    }
}

/// Encodes nucleotide sequences with a fixed [`NeutralPolicy`].
#[derive(Clone, Copy, Debug, Default)]
pub struct OneHotEncoder {
    neutral: NeutralPolicy,
}

impl OneHotEncoder {
    pub fn new(neutral: NeutralPolicy) -> Self {
        Self { neutral }
    }

    pub fn neutral_policy(&self) -> NeutralPolicy {
        self.neutral
    }

    /// One-hot encode a case-insensitive sequence over `{A, C, G, T, N}`.
    ///
    /// # Errors
    /// Returns [`BasenjiError::EncodingError`] if the sequence is empty or contains
    /// a character outside the alphabet.
    pub fn encode(&self, seq: &[u8]) -> Result<EncodedSequence, BasenjiError> {
        if seq.is_empty() {
            return Err(BasenjiError::EncodingError(
                "cannot encode an empty sequence".to_string(),
            ));
        }
        let mut data: Array2<f32> = Array2::zeros((seq.len(), ALPHABET_SIZE));
        for (i, base) in seq.iter().enumerate() {
            let column = match base.to_ascii_uppercase() {
                b'A' => 0,
                b'C' => 1,
                b'G' => 2,
                b'T' => 3,
                b'N' => {
                    data.row_mut(i).fill(self.neutral.value());
                    continue;
                }
                _ => {
                    return Err(BasenjiError::EncodingError(format!(
                        "invalid nucleotide '{}' at position {}",
                        base.escape_ascii(),
                        i
                    )))
                }
            };
            data[[i, column]] = 1.0;
        }
        Ok(EncodedSequence { data })
    }

    /// Encode a window, checking it has the expected length.
    pub fn encode_exact(
        &self,
        seq: &[u8],
        expected_len: usize,
    ) -> Result<EncodedSequence, BasenjiError> {
        if seq.len() != expected_len {
            return Err(BasenjiError::EncodingError(format!(
                "sequence has length {} but the window length is {}",
                seq.len(),
                expected_len
            )));
        }
        self.encode(seq)
    }
}
