use core::fmt;
use core::str::FromStr;

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::backend::Backend;
use burn::tensor::module::{avg_pool2d, max_pool2d};
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use super::attention::{LinearAttention, LinearAttentionConfig};
use super::resnet::{ResnetBlock2D, ResnetBlock2DConfig};
use crate::error::DiffusionError;
use crate::utils::upsample::upsample_nearest2d;

/// How the encoder halves the spatial resolution between levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownsampleKind {
    Conv,
    Max,
    Average,
}

impl FromStr for DownsampleKind {
    type Err = DiffusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conv" => Ok(Self::Conv),
            "max" => Ok(Self::Max),
            "average" => Ok(Self::Average),
            other => Err(DiffusionError::config(format!(
                "unknown downsampling '{other}', expected conv, max or average"
            ))),
        }
    }
}

impl fmt::Display for DownsampleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Conv => "conv",
            Self::Max => "max",
            Self::Average => "average",
        };
        f.write_str(name)
    }
}

#[derive(Module, Debug)]
pub struct Downsample2D<B: Backend> {
    conv: Option<Conv2d<B>>,
    max_pool: bool,
}

impl<B: Backend> Downsample2D<B> {
    pub fn new(channels: usize, kind: DownsampleKind, device: &B::Device) -> Self {
        let conv = match kind {
            DownsampleKind::Conv => Some(
                Conv2dConfig::new([channels, channels], [3, 3])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
            ),
            _ => None,
        };
        Downsample2D {
            conv,
            max_pool: kind == DownsampleKind::Max,
        }
    }

    pub fn forward(&self, xs: Tensor<B, 4>) -> Tensor<B, 4> {
        match &self.conv {
            Some(conv) => conv.forward(xs),
            None if self.max_pool => max_pool2d(xs, [2, 2], [2, 2], [0, 0], [1, 1]),
            None => avg_pool2d(xs, [2, 2], [2, 2], [0, 0], true),
        }
    }
}

// This does not support the conv-transpose mode.
#[derive(Module, Debug)]
pub struct Upsample2D<B: Backend> {
    conv: Conv2d<B>,
}

impl<B: Backend> Upsample2D<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        Self { conv }
    }

    pub fn forward(&self, xs: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(upsample_nearest2d(xs))
    }
}

/// Settings shared by the encoder and decoder levels of a UNet.
#[derive(Debug, Clone, Copy)]
pub struct LevelSettings {
    pub num_layers: usize,
    pub temb_channels: usize,
    pub resnet_groups: usize,
    pub attention: bool,
    pub attention_heads: usize,
    pub attention_head_dim: usize,
}

impl LevelSettings {
    fn resnet<B: Backend>(
        &self,
        in_channels: usize,
        out_channels: usize,
        device: &B::Device,
    ) -> ResnetBlock2D<B> {
        ResnetBlock2DConfig::new()
            .with_out_channels(Some(out_channels))
            .with_temb_channels(Some(self.temb_channels))
            .with_groups(self.resnet_groups)
            .init(in_channels, device)
    }

    fn attention<B: Backend>(&self, channels: usize, device: &B::Device) -> Option<LinearAttention<B>> {
        self.attention.then(|| {
            LinearAttentionConfig::new(channels)
                .with_n_heads(self.attention_heads)
                .with_d_head(self.attention_head_dim)
                .with_norm_groups(self.resnet_groups)
                .init(device)
        })
    }
}

/// Encoder level: residual blocks, optional attention, optional downsampling.
#[derive(Module, Debug)]
pub struct DownBlock2D<B: Backend> {
    resnets: Vec<ResnetBlock2D<B>>,
    attention: Option<LinearAttention<B>>,
    downsampler: Option<Downsample2D<B>>,
}

impl<B: Backend> DownBlock2D<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        settings: LevelSettings,
        downsample: Option<DownsampleKind>,
        device: &B::Device,
    ) -> Self {
        let resnets = (0..settings.num_layers)
            .map(|i| {
                let in_channels = if i == 0 { in_channels } else { out_channels };
                settings.resnet(in_channels, out_channels, device)
            })
            .collect();

        Self {
            resnets,
            attention: settings.attention(out_channels, device),
            downsampler: downsample.map(|kind| Downsample2D::new(out_channels, kind, device)),
        }
    }

    /// Returns the downsampled output and the skip connection.
    pub fn forward(&self, xs: Tensor<B, 4>, temb: Tensor<B, 2>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let mut xs = xs;
        for resnet in self.resnets.iter() {
            xs = resnet.forward(xs, Some(temb.clone()));
        }
        if let Some(attention) = &self.attention {
            xs = attention.forward(xs);
        }

        let skip = xs.clone();
        let xs = match &self.downsampler {
            Some(downsampler) => downsampler.forward(xs),
            None => xs,
        };
        (xs, skip)
    }
}

/// Decoder level: consumes the matching skip connection, then upsamples.
#[derive(Module, Debug)]
pub struct UpBlock2D<B: Backend> {
    resnets: Vec<ResnetBlock2D<B>>,
    attention: Option<LinearAttention<B>>,
    upsampler: Option<Upsample2D<B>>,
}

impl<B: Backend> UpBlock2D<B> {
    pub fn new(
        in_channels: usize,
        skip_channels: usize,
        out_channels: usize,
        settings: LevelSettings,
        add_upsample: bool,
        device: &B::Device,
    ) -> Self {
        let resnets = (0..settings.num_layers)
            .map(|i| {
                let in_channels = if i == 0 {
                    in_channels + skip_channels
                } else {
                    out_channels
                };
                settings.resnet(in_channels, out_channels, device)
            })
            .collect();

        Self {
            resnets,
            attention: settings.attention(out_channels, device),
            upsampler: add_upsample.then(|| Upsample2D::new(out_channels, out_channels, device)),
        }
    }

    pub fn forward(&self, xs: Tensor<B, 4>, skip: Tensor<B, 4>, temb: Tensor<B, 2>) -> Tensor<B, 4> {
        let mut xs = Tensor::cat(vec![xs, skip], 1);
        for resnet in self.resnets.iter() {
            xs = resnet.forward(xs, Some(temb.clone()));
        }
        if let Some(attention) = &self.attention {
            xs = attention.forward(xs);
        }

        match &self.upsampler {
            Some(upsampler) => upsampler.forward(xs),
            None => xs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::Distribution;

    fn settings(attention: bool) -> LevelSettings {
        LevelSettings {
            num_layers: 2,
            temb_channels: 16,
            resnet_groups: 4,
            attention,
            attention_heads: 2,
            attention_head_dim: 4,
        }
    }

    #[test]
    fn test_downsample_kinds_halve_resolution() {
        let device = Default::default();
        for kind in [DownsampleKind::Conv, DownsampleKind::Max, DownsampleKind::Average] {
            let downsample = Downsample2D::<TestBackend>::new(4, kind, &device);
            let xs = Tensor::random([1, 4, 8, 6], Distribution::Default, &device);

            assert_eq!(downsample.forward(xs).dims(), [1, 4, 4, 3], "{kind}");
        }
    }

    #[test]
    fn test_down_then_up_block_shapes() {
        let device = Default::default();
        let down = DownBlock2D::<TestBackend>::new(
            4,
            8,
            settings(true),
            Some(DownsampleKind::Conv),
            &device,
        );
        let up = UpBlock2D::<TestBackend>::new(8, 8, 4, settings(false), true, &device);
        let xs = Tensor::random([2, 4, 8, 8], Distribution::Default, &device);
        let temb = Tensor::random([2, 16], Distribution::Default, &device);

        let (hidden, skip) = down.forward(xs, temb.clone());
        assert_eq!(hidden.dims(), [2, 8, 4, 4]);
        assert_eq!(skip.dims(), [2, 8, 8, 8]);

        let out = up.forward(upsample_nearest2d(hidden), skip, temb);
        assert_eq!(out.dims(), [2, 4, 16, 16]);
    }

    #[test]
    fn test_parse_downsample_kind() {
        assert_eq!("max".parse::<DownsampleKind>().unwrap(), DownsampleKind::Max);
        assert!("bilinear".parse::<DownsampleKind>().is_err());
    }
}
