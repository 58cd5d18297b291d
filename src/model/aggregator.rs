//! Sequential aggregators over the binned representation.
//!
//! Both aggregators map `[batch, bins, d_model]` to the same shape, with a residual
//! connection followed by layer normalization.

use burn::{
    nn::{
        attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig},
        gru::{Gru, GruConfig},
        LayerNorm, LayerNormConfig, PositionalEncoding, PositionalEncodingConfig,
    },
    prelude::*,
};

#[derive(Config, Debug)]
pub struct GruAggregatorConfig {
    pub d_model: usize,
}

impl GruAggregatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> GruAggregator<B> {
        GruAggregator {
            gru: GruConfig::new(self.d_model, self.d_model, true).init(device),
            norm: LayerNormConfig::new(self.d_model).init(device),
        }
    }
}

/// A unidirectional GRU run along the bins.
#[derive(Module, Debug)]
pub struct GruAggregator<B: Backend> {
    gru: Gru<B>,
    norm: LayerNorm<B>,
}

impl<B: Backend> GruAggregator<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = self.gru.forward(x.clone(), None);
        self.norm.forward(x + hidden)
    }
}

#[derive(Config, Debug)]
pub struct AttentionAggregatorConfig {
    pub d_model: usize,
    pub num_heads: usize,
    /// The longest bin sequence the position encoding covers.
    #[config(default = 4096)]
    pub max_bins: usize,
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl AttentionAggregatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> AttentionAggregator<B> {
        AttentionAggregator {
            position: PositionalEncodingConfig::new(self.d_model)
                .with_max_sequence_size(self.max_bins)
                .init(device),
            attention: MultiHeadAttentionConfig::new(self.d_model, self.num_heads)
                .with_dropout(self.dropout)
                .init(device),
            norm: LayerNormConfig::new(self.d_model).init(device),
        }
    }
}

/// Multi-head self-attention across all bins of a window.
#[derive(Module, Debug)]
pub struct AttentionAggregator<B: Backend> {
    position: PositionalEncoding<B>,
    attention: MultiHeadAttention<B>,
    norm: LayerNorm<B>,
}

impl<B: Backend> AttentionAggregator<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let query = self.position.forward(x.clone());
        let context = self.attention.forward(MhaInput::self_attn(query)).context;
        self.norm.forward(x + context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InferenceBackend;

    #[test]
    fn test_aggregators_keep_shape() {
        let device = Default::default();
        let x = Tensor::<InferenceBackend, 3>::ones([2, 6, 8], &device);

        let gru = GruAggregatorConfig::new(8).init::<InferenceBackend>(&device);
        assert_eq!(gru.forward(x.clone()).dims(), [2, 6, 8]);

        let attention = AttentionAggregatorConfig::new(8, 2)
            .with_max_bins(6)
            .init::<InferenceBackend>(&device);
        assert_eq!(attention.forward(x).dims(), [2, 6, 8]);
    }
}
