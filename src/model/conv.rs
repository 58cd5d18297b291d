//! Convolution stages.

use burn::{
    nn::{
        conv::{Conv1d, Conv1dConfig},
        pool::{MaxPool1d, MaxPool1dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig1d, Relu,
    },
    prelude::*,
};

/// Configuration of a [`ConvBlock`].
#[derive(Config, Debug)]
pub struct ConvBlockConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    #[config(default = 2)]
    pub pool_size: usize,
}

impl ConvBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlock<B> {
        let conv = Conv1dConfig::new(self.in_channels, self.out_channels, self.kernel_size)
            .with_padding(PaddingConfig1d::Same)
            .init(device);
        let norm = BatchNormConfig::new(self.out_channels).init(device);
        let pool = MaxPool1dConfig::new(self.pool_size)
            .with_stride(self.pool_size)
            .init();
        ConvBlock {
            conv,
            norm,
            activation: Relu::new(),
            pool,
        }
    }
}

/// Conv1d ("same" padding), batch norm, ReLU, then a non-overlapping max-pool.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv1d<B>,
    norm: BatchNorm<B, 1>,
    activation: Relu,
    pool: MaxPool1d,
}

impl<B: Backend> ConvBlock<B> {
    /// `[batch, in_channels, length]` to `[batch, out_channels, length / pool_size]`.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        let x = self.activation.forward(x);
        self.pool.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InferenceBackend;

    #[test]
    fn test_conv_block_shape() {
        let device = Default::default();
        let block = ConvBlockConfig::new(4, 6, 5)
            .with_pool_size(4)
            .init::<InferenceBackend>(&device);
        let output = block.forward(Tensor::zeros([2, 4, 32], &device));
        assert_eq!(output.dims(), [2, 6, 8]);
    }
}
