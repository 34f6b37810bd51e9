//! # Models
//!
//! Denoising backbones consumed by the diffusion process.

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

mod groupnorm;

pub mod attention;
pub mod embeddings;
pub mod resnet;
pub mod unet;
pub mod unet_2d_blocks;

pub use unet::{ConditionalUnet, UnetConfig};

/// A network mapping `(noisy_sample, condition, timestep)` to a noise
/// prediction, followed by a variance prediction when the variance is learned.
pub trait DenoisingBackbone<B: Backend>: Module<B> {
    /// Channels of the prediction, twice the sample channels under learned variance.
    fn out_channels(&self) -> usize;

    fn predict(
        &self,
        noisy: Tensor<B, 4>,
        condition: Tensor<B, 4>,
        timesteps: Tensor<B, 1, Int>,
    ) -> Tensor<B, 4>;
}
