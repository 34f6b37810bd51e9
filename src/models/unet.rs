//! Conditional UNet
//!
//! The noisy depth map and the RGB condition are concatenated on the channel
//! axis and denoised by an encoder/decoder with skip connections, conditioned on
//! the diffusion timestep through a sinusoidal embedding.

use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::silu;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use super::attention::{LinearAttention, LinearAttentionConfig};
use super::embeddings::{TimestepEmbedding, TimestepEmbeddingConfig, Timesteps};
use super::groupnorm::{GroupNorm, GroupNormConfig};
use super::resnet::{ResnetBlock2D, ResnetBlock2DConfig};
use super::unet_2d_blocks::{DownBlock2D, DownsampleKind, LevelSettings, UpBlock2D};
use super::DenoisingBackbone;
use crate::error::{DiffusionError, Result};

#[derive(Config, Debug)]
pub struct UnetConfig {
    /// Channels after the input convolution.
    #[config(default = 64)]
    pub base_dim: usize,
    /// Per level multipliers of `base_dim`.
    #[config(default = "vec![1, 2, 4, 8]")]
    pub dim_mults: Vec<usize>,
    /// Residual blocks per level.
    #[config(default = 2)]
    pub num_res_blocks: usize,
    /// Whether each level ends with a linear attention block.
    #[config(default = "vec![true, true, true, true]")]
    pub attention_levels: Vec<bool>,
    #[config(default = 8)]
    pub norm_groups: usize,
    #[config(default = "DownsampleKind::Conv")]
    pub downsampling: DownsampleKind,
    #[config(default = 4)]
    pub attention_heads: usize,
    #[config(default = 32)]
    pub attention_head_dim: usize,
    /// Channels of the RGB condition.
    #[config(default = 3)]
    pub condition_channels: usize,
    /// Channels of the generated sample.
    #[config(default = 1)]
    pub channels: usize,
    /// Doubles the output channels to carry a variance prediction.
    #[config(default = false)]
    pub learned_variance: bool,
}

impl UnetConfig {
    pub fn out_channels(&self) -> usize {
        if self.learned_variance {
            self.channels * 2
        } else {
            self.channels
        }
    }

    /// Input height and width must be multiples of this value.
    pub fn resolution_multiple(&self) -> usize {
        1 << self.dim_mults.len().saturating_sub(1)
    }

    /// Checks the topology before any module is built.
    pub fn validate(&self) -> Result<()> {
        if self.dim_mults.is_empty() || self.dim_mults.contains(&0) {
            return Err(DiffusionError::config(
                "dim_mults must list at least one positive multiplier",
            ));
        }
        if self.attention_levels.len() != self.dim_mults.len() {
            return Err(DiffusionError::config(format!(
                "attention_levels has {} entries for {} levels",
                self.attention_levels.len(),
                self.dim_mults.len()
            )));
        }
        if self.num_res_blocks == 0 || self.channels == 0 || self.base_dim == 0 {
            return Err(DiffusionError::config(
                "base_dim, num_res_blocks and channels must be positive",
            ));
        }
        if self.norm_groups == 0
            || self
                .dim_mults
                .iter()
                .any(|mult| (self.base_dim * mult) % self.norm_groups != 0)
        {
            return Err(DiffusionError::config(format!(
                "every level width must be divisible by norm_groups {}",
                self.norm_groups
            )));
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ConditionalUnet<B> {
        let widths: Vec<usize> = self.dim_mults.iter().map(|m| self.base_dim * m).collect();
        let temb_channels = self.base_dim * 4;
        let levels = widths.len();
        let settings = |level: usize| LevelSettings {
            num_layers: self.num_res_blocks,
            temb_channels,
            resnet_groups: self.norm_groups,
            attention: self.attention_levels[level],
            attention_heads: self.attention_heads,
            attention_head_dim: self.attention_head_dim,
        };

        let conv_in = Conv2dConfig::new(
            [self.channels + self.condition_channels, self.base_dim],
            [3, 3],
        )
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device);

        let mut in_channels = self.base_dim;
        let mut down_blocks = Vec::with_capacity(levels);
        for (level, &width) in widths.iter().enumerate() {
            let downsample = (level + 1 < levels).then_some(self.downsampling);
            down_blocks.push(DownBlock2D::new(
                in_channels,
                width,
                settings(level),
                downsample,
                device,
            ));
            in_channels = width;
        }

        let mid_channels = in_channels;
        let mid_resnet = || {
            ResnetBlock2DConfig::new()
                .with_temb_channels(Some(temb_channels))
                .with_groups(self.norm_groups)
                .init(mid_channels, device)
        };
        let mid_block_1 = mid_resnet();
        let mid_attention = LinearAttentionConfig::new(mid_channels)
            .with_n_heads(self.attention_heads)
            .with_d_head(self.attention_head_dim)
            .with_norm_groups(self.norm_groups)
            .init(device);
        let mid_block_2 = mid_resnet();

        let mut up_blocks = Vec::with_capacity(levels);
        for (level, &width) in widths.iter().enumerate().rev() {
            up_blocks.push(UpBlock2D::new(
                in_channels,
                width,
                width,
                settings(level),
                level > 0,
                device,
            ));
            in_channels = width;
        }

        let norm_out = GroupNormConfig::new(self.norm_groups, in_channels).init(device);
        let conv_out = Conv2dConfig::new([in_channels, self.out_channels()], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        ConditionalUnet {
            time_proj: Timesteps::new(self.base_dim, true, 0.),
            time_embedding: TimestepEmbeddingConfig::new(self.base_dim, temb_channels)
                .init(device),
            conv_in,
            down_blocks,
            mid_block_1,
            mid_attention,
            mid_block_2,
            up_blocks,
            norm_out,
            conv_out,
            out_channels: self.out_channels(),
        }
    }
}

#[derive(Module, Debug)]
pub struct ConditionalUnet<B: Backend> {
    time_proj: Timesteps<B>,
    time_embedding: TimestepEmbedding<B>,
    conv_in: Conv2d<B>,
    down_blocks: Vec<DownBlock2D<B>>,
    mid_block_1: ResnetBlock2D<B>,
    mid_attention: LinearAttention<B>,
    mid_block_2: ResnetBlock2D<B>,
    up_blocks: Vec<UpBlock2D<B>>,
    norm_out: GroupNorm<B>,
    conv_out: Conv2d<B>,
    out_channels: usize,
}

impl<B: Backend> ConditionalUnet<B> {
    pub fn forward(&self, xs: Tensor<B, 4>, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 4> {
        let emb = self.time_proj.forward(timesteps.float());
        let emb = self.time_embedding.forward(emb);

        let mut xs = self.conv_in.forward(xs);
        let mut skips = Vec::with_capacity(self.down_blocks.len());
        for block in self.down_blocks.iter() {
            let (hidden, skip) = block.forward(xs, emb.clone());
            skips.push(skip);
            xs = hidden;
        }

        let xs = self.mid_block_1.forward(xs, Some(emb.clone()));
        let xs = self.mid_attention.forward(xs);
        let mut xs = self.mid_block_2.forward(xs, Some(emb.clone()));

        for block in self.up_blocks.iter() {
            let skip = match skips.pop() {
                Some(skip) => skip,
                None => break,
            };
            xs = block.forward(xs, skip, emb.clone());
        }

        self.conv_out.forward(silu(self.norm_out.forward(xs)))
    }
}

impl<B: Backend> DenoisingBackbone<B> for ConditionalUnet<B> {
    fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn predict(
        &self,
        noisy: Tensor<B, 4>,
        condition: Tensor<B, 4>,
        timesteps: Tensor<B, 1, Int>,
    ) -> Tensor<B, 4> {
        self.forward(Tensor::cat(vec![noisy, condition], 1), timesteps)
    }
}
