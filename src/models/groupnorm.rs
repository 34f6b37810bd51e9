use burn::config::Config;
use burn::module::{Module, Param};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Configuration to create a [GroupNorm](GroupNorm) layer.
#[derive(Config)]
pub struct GroupNormConfig {
    /// The number of groups to separate the channels into
    num_groups: usize,
    /// The number of channels expected in the input
    num_channels: usize,
    /// A value required for numerical stability. Default: 1e-5
    #[config(default = 1e-5)]
    epsilon: f64,
    /// A boolean value that when set to `true`, this module has learnable
    /// per-channel affine parameters initialized to ones (for weights)
    /// and zeros (for biases). Default: `true`
    #[config(default = true)]
    affine: bool,
}

/// Applies Group Normalization over a mini-batch of inputs.
///
/// `Y = groupnorm(X) * γ + β`
#[derive(Module, Debug)]
pub struct GroupNorm<B: Backend> {
    num_groups: usize,
    num_channels: usize,
    gamma: Param<Tensor<B, 1>>,
    beta: Param<Tensor<B, 1>>,
    epsilon: f64,
    affine: bool,
}

impl GroupNormConfig {
    /// Initialize a new [group norm](GroupNorm) module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> GroupNorm<B> {
        assert_eq!(
            self.num_channels % self.num_groups,
            0,
            "The number of channels must be divisible by the number of groups"
        );

        let gamma = Param::from_tensor(Tensor::ones([self.num_channels], device));
        let beta = Param::from_tensor(Tensor::zeros([self.num_channels], device));

        GroupNorm {
            num_groups: self.num_groups,
            num_channels: self.num_channels,
            gamma,
            beta,
            epsilon: self.epsilon,
            affine: self.affine,
        }
    }
}

impl<B: Backend> GroupNorm<B> {
    /// Applies the forward pass on the input tensor.
    ///
    /// # Shapes
    ///
    /// - input: `[batch_size, num_channels, *]`
    /// - output: `[batch_size, num_channels, *]`
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let shape = input.shape();
        if D < 3 {
            panic!("input rank for GroupNorm should be at least 3, but got {}", D);
        }

        let batch_size = shape.dims[0];
        let num_channels = shape.dims[1];

        if num_channels != self.num_channels {
            panic!(
                "expected {} channels but got {}",
                self.num_channels, num_channels
            );
        }

        let hidden_size = shape.num_elements() / (batch_size * self.num_groups);
        let input = input.reshape([batch_size, self.num_groups, hidden_size]);

        let mean = input.clone().mean_dim(2);
        let centered = input.sub(mean);
        let var = centered.clone().mul(centered.clone()).mean_dim(2);
        let input_normalized = centered
            .div(var.add_scalar(self.epsilon).sqrt())
            .reshape(shape);

        if self.affine {
            let mut affine_shape = [1; D];
            affine_shape[1] = num_channels;

            input_normalized
                .mul(self.gamma.val().reshape(affine_shape))
                .add(self.beta.val().reshape(affine_shape))
        } else {
            input_normalized
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::to_host;
    use crate::TestBackend;
    use burn::tensor::Distribution;

    #[test]
    fn test_group_norm_normalizes_each_group() {
        let device = Default::default();
        let norm = GroupNormConfig::new(2, 4).init::<TestBackend>(&device);
        let input: Tensor<TestBackend, 4> =
            Tensor::random([2, 4, 3, 3], Distribution::Normal(3.0, 2.0), &device);

        let output = norm.forward(input);

        assert_eq!(output.dims(), [2, 4, 3, 3]);
        // Each group spans 2 channels of 3x3 pixels.
        let values = to_host(output);
        for group in values.chunks(18) {
            let mean = group.iter().sum::<f64>() / 18.0;
            let var = group.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 18.0;
            assert!(mean.abs() < 1e-4, "{mean}");
            assert!((var - 1.0).abs() < 1e-2, "{var}");
        }
    }
}
