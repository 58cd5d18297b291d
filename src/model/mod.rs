//! The sequence-to-signal network.
//!
//! A [`SeqSignalModel`] maps one-hot sequences `[batch, length, 4]` to non-negative
//! per-bin predictions `[batch, length / pooling_factor, tracks]`:
//!
//!  1. a stack of [`ConvBlock`]s (Conv1d, batch norm, ReLU, max-pool), which reduce the
//!     length by the pooling factor;
//!  2. a linear projection of each bin to the hidden size;
//!  3. a sequential aggregator, either a GRU or multi-head self-attention (see
//!     [`AggregatorKind`]);
//!  4. a per-bin linear head and a softplus.
//!
//! The model is generic over the burn [`Backend`]: training uses
//! [`TrainBackend`](crate::TrainBackend), and inference
//! [`InferenceBackend`](crate::InferenceBackend) (obtained with `model.valid()`).

pub mod aggregator;
pub mod config;
pub mod conv;
pub mod loss;

use burn::{
    nn::{Dropout, Linear, Relu},
    prelude::*,
    tensor::activation::relu,
};
use ndarray::{Array3, ArrayView3};

pub use aggregator::{AttentionAggregator, GruAggregator};
pub use config::{AggregatorKind, ConvStage, ModelConfig};
pub use conv::{ConvBlock, ConvBlockConfig};
pub use loss::LossKind;

use crate::{
    dataset::batch::{array3_to_tensor, tensor_to_array3},
    encoding::ALPHABET_SIZE,
    traits::SignalPredictor,
    BasenjiError, InferenceBackend,
};

/// The convolution + aggregator network. Build one with [`ModelConfig::init()`].
#[derive(Module, Debug)]
pub struct SeqSignalModel<B: Backend> {
    pub(crate) conv: Vec<ConvBlock<B>>,
    pub(crate) projection: Linear<B>,
    pub(crate) gru: Option<GruAggregator<B>>,
    pub(crate) attention: Option<AttentionAggregator<B>>,
    pub(crate) dropout: Dropout,
    pub(crate) head: Linear<B>,
    pub(crate) activation: Relu,
    pub(crate) pooling_factor: usize,
    pub(crate) num_targets: usize,
}

impl<B: Backend> SeqSignalModel<B> {
    /// Predict `[batch, bins, tracks]` from `[batch, length, 4]` one-hot inputs.
    pub fn forward(&self, inputs: Tensor<B, 3>) -> Tensor<B, 3> {
        // Conv1d works on [batch, channels, length]
        let mut x = inputs.swap_dims(1, 2);
        for block in &self.conv {
            x = block.forward(x);
        }
        let x = x.swap_dims(1, 2);
        let x = self.activation.forward(self.projection.forward(x));

        let x = match (&self.gru, &self.attention) {
            (Some(gru), _) => gru.forward(x),
            (None, Some(attention)) => attention.forward(x),
            (None, None) => x,
        };
        let x = self.dropout.forward(x);
        softplus(self.head.forward(x))
    }

    pub fn pooling_factor(&self) -> usize {
        self.pooling_factor
    }

    pub fn num_targets(&self) -> usize {
        self.num_targets
    }
}

/// `log(1 + exp(x))`, computed without overflow for large `x`.
pub fn softplus<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    relu(x.clone()) + x.abs().neg().exp().log1p()
}

impl SignalPredictor for SeqSignalModel<InferenceBackend> {
    fn num_targets(&self) -> usize {
        self.num_targets
    }

    fn predict(&self, inputs: ArrayView3<f32>) -> Result<Array3<f32>, BasenjiError> {
        let (_, len, channels) = inputs.dim();
        if channels != ALPHABET_SIZE || len == 0 || len % self.pooling_factor != 0 {
            return Err(BasenjiError::EncodingError(format!(
                "model inputs must be [batch, length, {}] with length a multiple of {}, got \
                 {:?}",
                ALPHABET_SIZE,
                self.pooling_factor,
                inputs.shape()
            )));
        }
        let device = Default::default();
        let tensor = array3_to_tensor::<InferenceBackend>(inputs.to_owned(), &device);
        tensor_to_array3(self.forward(tensor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{encoding::OneHotEncoder, test_utilities::random_sequence, TrainBackend};
    use burn::tensor::TensorData;
    use ndarray::{stack, Axis};
    use rand::{rngs::StdRng, SeedableRng};

    fn small_config(aggregator: AggregatorKind) -> ModelConfig {
        ModelConfig {
            conv: vec![ConvStage::new(8, 5, 2), ConvStage::new(8, 3, 2)],
            hidden_size: 8,
            aggregator,
            num_heads: 2,
            dropout: 0.0,
        }
    }

    fn inputs(batch: usize, len: usize) -> Array3<f32> {
        let mut rng = StdRng::seed_from_u64(3);
        let encoder = OneHotEncoder::default();
        let encoded: Vec<_> = (0..batch)
            .map(|_| {
                let seq = random_sequence(&mut rng, len);
                encoder.encode(seq.as_bytes()).unwrap().into_array()
            })
            .collect();
        let views: Vec<_> = encoded.iter().map(|a| a.view()).collect();
        stack(Axis(0), &views).unwrap()
    }

    #[test]
    fn test_forward_shapes_and_non_negative() {
        let device = Default::default();
        for aggregator in [AggregatorKind::Gru, AggregatorKind::Attention] {
            let model = small_config(aggregator).init::<InferenceBackend>(32, 3, &device);
            let predictions = model.predict(inputs(2, 32).view()).unwrap();
            assert_eq!(predictions.shape(), &[2, 8, 3]);
            assert!(predictions.iter().all(|x| x.is_finite() && *x >= 0.0));
        }
    }

    #[test]
    fn test_forward_is_pure() {
        let device = Default::default();
        let model = small_config(AggregatorKind::Gru).init::<InferenceBackend>(32, 2, &device);
        let x = inputs(3, 32);
        assert_eq!(model.predict(x.view()).unwrap(), model.predict(x.view()).unwrap());
    }

    #[test]
    fn test_predict_rejects_bad_length() {
        let device = Default::default();
        let model = small_config(AggregatorKind::Gru).init::<InferenceBackend>(32, 2, &device);
        assert!(model.predict(inputs(1, 30).view()).is_err());
    }

    #[test]
    fn test_softplus() {
        let device = Default::default();
        let x = Tensor::<InferenceBackend, 1>::from_data(
            TensorData::new(vec![-100.0f32, 0.0, 100.0], [3]),
            &device,
        );
        let y = softplus(x).into_data().to_vec::<f32>().unwrap();
        assert!(y[0] >= 0.0 && y[0] < 1e-6);
        assert!((y[1] - 2f32.ln()).abs() < 1e-6);
        assert!((y[2] - 100.0).abs() < 1e-4);
    }

    #[test]
    fn test_gradients_reach_parameters() {
        let device = Default::default();
        let model = small_config(AggregatorKind::Gru).init::<TrainBackend>(32, 2, &device);
        let x = array3_to_tensor::<TrainBackend>(inputs(2, 32), &device);
        let targets = Tensor::<TrainBackend, 3>::ones([2, 8, 2], &device);
        let loss = LossKind::Poisson.forward(model.forward(x), targets);
        let grads = loss.backward();
        let head_grad = model.head.weight.val().grad(&grads);
        assert!(head_grad.is_some());
    }

    #[test]
    fn test_loaded_copy_shares_no_state() {
        use crate::train::checkpoint::record_to_bytes;
        let bytes = |model: &SeqSignalModel<TrainBackend>| {
            record_to_bytes::<TrainBackend, _>(model.clone().into_record()).unwrap()
        };
        let device = Default::default();
        let config = small_config(AggregatorKind::Gru);
        let model = config.init_seeded::<TrainBackend>(4, 32, 2, &device);
        let before = bytes(&model);

        let copy = config.load::<TrainBackend>(model.clone().into_record(), 32, 2, &device);
        assert_eq!(bytes(&copy), before);
        // a training-mode forward pass updates the copy's batch norm statistics only
        let _ = copy.forward(array3_to_tensor::<TrainBackend>(inputs(2, 32), &device));
        assert_ne!(bytes(&copy), before);
        assert_eq!(bytes(&model), before);
    }
}
