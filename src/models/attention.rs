//! Attention Based Building Blocks
//!
//! Efficient Attention: Attention with Linear Complexities, Z. Shen and al, 2018.
//! https://arxiv.org/abs/1812.01243

use crate::models::groupnorm::{GroupNorm, GroupNormConfig};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

#[derive(Config)]
pub struct LinearAttentionConfig {
    channels: usize,
    #[config(default = 4)]
    n_heads: usize,
    #[config(default = 32)]
    d_head: usize,
    #[config(default = 8)]
    norm_groups: usize,
}

/// Residual self attention over the spatial positions of a feature map,
/// linear in the number of pixels.
#[derive(Module, Debug)]
pub struct LinearAttention<B: Backend> {
    norm: GroupNorm<B>,
    to_qkv: Conv2d<B>,
    to_out: Conv2d<B>,
    n_heads: usize,
    d_head: usize,
    scale: f64,
}

impl LinearAttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> LinearAttention<B> {
        let inner_dim = self.d_head * self.n_heads;

        LinearAttention {
            norm: GroupNormConfig::new(self.norm_groups, self.channels).init(device),
            to_qkv: Conv2dConfig::new([self.channels, inner_dim * 3], [1, 1])
                .with_bias(false)
                .init(device),
            to_out: Conv2dConfig::new([inner_dim, self.channels], [1, 1]).init(device),
            n_heads: self.n_heads,
            d_head: self.d_head,
            scale: 1.0 / f64::sqrt(self.d_head as f64),
        }
    }
}

impl<B: Backend> LinearAttention<B> {
    pub fn forward(&self, xs: Tensor<B, 4>) -> Tensor<B, 4> {
        let [n_batch, _, height, width] = xs.dims();
        let inner_dim = self.n_heads * self.d_head;

        let qkv = self.to_qkv.forward(self.norm.forward(xs.clone()));
        let split = |i: usize| {
            qkv.clone()
                .slice([0..n_batch, i * inner_dim..(i + 1) * inner_dim, 0..height, 0..width])
                .reshape([n_batch, self.n_heads, self.d_head, height * width])
        };

        // Queries normalized over features, keys over positions.
        let query = softmax(split(0), 2).mul_scalar(self.scale);
        let key = softmax(split(1), 3);
        let value = split(2);

        // [n_batch, n_heads, d_head, d_head]
        let context = key.matmul(value.swap_dims(2, 3));
        let out = context
            .swap_dims(2, 3)
            .matmul(query)
            .reshape([n_batch, inner_dim, height, width]);

        xs + self.to_out.forward(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::Distribution;

    #[test]
    fn test_linear_attention_keeps_shape() {
        let device = Default::default();
        let attention = LinearAttentionConfig::new(8)
            .with_n_heads(2)
            .with_d_head(4)
            .with_norm_groups(4)
            .init::<TestBackend>(&device);
        let xs = Tensor::random([2, 8, 4, 6], Distribution::Default, &device);

        let out = attention.forward(xs);

        assert_eq!(out.dims(), [2, 8, 4, 6]);
    }
}
