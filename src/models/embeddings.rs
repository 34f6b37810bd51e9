use crate::utils::pad_with_zeros;
use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::silu;
use burn::tensor::backend::Backend;
use burn::tensor::{Data, Shape, Tensor};
use core::marker::PhantomData;

#[derive(Config, Debug)]
pub struct TimestepEmbeddingConfig {
    channel: usize,
    time_embed_dim: usize,
}

#[derive(Module, Debug)]
pub struct TimestepEmbedding<B: Backend> {
    linear_1: Linear<B>,
    linear_2: Linear<B>,
}

impl TimestepEmbeddingConfig {
    /// Initialize a new [embedding](TimestepEmbedding) module.
    /// Uses activating function: "silu".
    pub fn init<B: Backend>(&self, device: &B::Device) -> TimestepEmbedding<B> {
        let linear_1 = LinearConfig::new(self.channel, self.time_embed_dim).init(device);
        let linear_2 = LinearConfig::new(self.time_embed_dim, self.time_embed_dim).init(device);
        TimestepEmbedding { linear_1, linear_2 }
    }
}

impl<B: Backend> TimestepEmbedding<B> {
    pub fn forward(&self, xs: Tensor<B, 2>) -> Tensor<B, 2> {
        let xs = silu(self.linear_1.forward(xs));
        self.linear_2.forward(xs)
    }
}

/// Sinusoidal projection of scalar timesteps.
#[derive(Module, Debug)]
pub struct Timesteps<B: Backend> {
    num_channels: usize,
    flip_sin_to_cos: bool,
    downscale_freq_shift: f64,
    _backend: PhantomData<B>,
}

impl<B: Backend> Timesteps<B> {
    pub fn new(num_channels: usize, flip_sin_to_cos: bool, downscale_freq_shift: f64) -> Self {
        Self {
            num_channels,
            flip_sin_to_cos,
            downscale_freq_shift,
            _backend: PhantomData,
        }
    }

    /// `[batch] -> [batch, num_channels]`
    pub fn forward(&self, xs: Tensor<B, 1>) -> Tensor<B, 2> {
        let half_dim = self.num_channels / 2;
        let [batch_size] = xs.dims();
        let frequencies: Vec<f32> = (0..half_dim)
            .map(|i| {
                let exponent = -f64::ln(10000.) * i as f64
                    / (half_dim as f64 - self.downscale_freq_shift);
                exponent.exp() as f32
            })
            .collect();
        let frequencies: Tensor<B, 2> = Tensor::from_floats(
            Data::new(frequencies, Shape::new([1, half_dim])),
            &xs.device(),
        );

        let emb = xs.reshape([batch_size, 1]) * frequencies;
        let emb = if self.flip_sin_to_cos {
            Tensor::cat(vec![emb.clone().cos(), emb.sin()], 1)
        } else {
            Tensor::cat(vec![emb.clone().sin(), emb.cos()], 1)
        };

        if self.num_channels % 2 == 1 {
            pad_with_zeros(emb, 1, 0, 1)
        } else {
            emb
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::{Data, Shape};

    #[test]
    fn test_timesteps_even_channels() {
        let device = Default::default();
        let timesteps = Timesteps::<TestBackend>::new(4, true, 0.);
        let xs: Tensor<TestBackend, 1> =
            Tensor::from_floats(Data::from([1., 2., 3., 4.]), &device);

        let emb = timesteps.forward(xs);

        assert_eq!(emb.shape(), Shape::from([4, 4]));
        emb.to_data().assert_approx_eq(
            &Data::from([
                [0.5403, 1.0000, 0.8415, 0.0100],
                [-0.4161, 0.9998, 0.9093, 0.0200],
                [-0.9900, 0.9996, 0.1411, 0.0300],
                [-0.6536, 0.9992, -0.7568, 0.0400],
            ]),
            3,
        );
    }

    #[test]
    fn test_timesteps_odd_channels() {
        let device = Default::default();
        let timesteps = Timesteps::<TestBackend>::new(5, true, 0.);
        let xs: Tensor<TestBackend, 1> =
            Tensor::from_floats(Data::from([1., 2., 3., 4., 5.]), &device);

        let emb = timesteps.forward(xs);

        assert_eq!(emb.shape(), Shape::from([5, 5]));
        emb.to_data().assert_approx_eq(
            &Data::from([
                [0.5403, 1.0000, 0.8415, 0.0100, 0.0000],
                [-0.4161, 0.9998, 0.9093, 0.0200, 0.0000],
                [-0.9900, 0.9996, 0.1411, 0.0300, 0.0000],
                [-0.6536, 0.9992, -0.7568, 0.0400, 0.0000],
                [0.2837, 0.9988, -0.9589, 0.0500, 0.0000],
            ]),
            3,
        );
    }

    #[test]
    fn test_timestep_embedding_shape() {
        let device = Default::default();
        let embedding = TimestepEmbeddingConfig::new(8, 32).init::<TestBackend>(&device);
        let xs = Tensor::zeros([3, 8], &device);

        assert_eq!(embedding.forward(xs).dims(), [3, 32]);
    }
}
