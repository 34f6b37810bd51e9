//! Loss terms of the diffusion objective.
//!
//! The denoising term is an MSE on the predicted noise scaled per timestep by a
//! [`LossWeighting`]. Under learned variance the variational bound (in bits per
//! dimension) is added, built from [`normal_kl`] and
//! [`discretized_gaussian_log_likelihood`].

use core::f64::consts::{LN_2, PI};
use core::fmt;
use core::str::FromStr;

use burn::tensor::activation::tanh;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::DiffusionError;
use crate::schedulers::NoiseSchedule;

/// Selects the per timestep weight of the denoising loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossWeightingKind {
    #[serde(rename = "simple")]
    Simple,
    #[serde(rename = "P2")]
    P2,
}

impl FromStr for LossWeightingKind {
    type Err = DiffusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(LossWeightingKind::Simple),
            "P2" | "p2" => Ok(LossWeightingKind::P2),
            other => Err(DiffusionError::config(format!(
                "unknown loss weighting '{other}', expected simple or P2"
            ))),
        }
    }
}

impl fmt::Display for LossWeightingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossWeightingKind::Simple => f.write_str("simple"),
            LossWeightingKind::P2 => f.write_str("P2"),
        }
    }
}

/// Perception prioritized weighting, J. Choi and al, 2022.
/// https://arxiv.org/abs/2204.00227
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossWeighting {
    Simple,
    P2 { k: f64, gamma: f64 },
}

impl LossWeighting {
    pub fn new(kind: LossWeightingKind, p2_k: f64, p2_gamma: f64) -> Self {
        match kind {
            LossWeightingKind::Simple => LossWeighting::Simple,
            LossWeightingKind::P2 => LossWeighting::P2 {
                k: p2_k,
                gamma: p2_gamma,
            },
        }
    }

    pub fn weight(&self, schedule: &NoiseSchedule, t: usize) -> f64 {
        match self {
            LossWeighting::Simple => 1.0,
            LossWeighting::P2 { k, gamma } => 1.0 / (k + schedule.snr(t)).powf(*gamma),
        }
    }

    pub fn weights(&self, schedule: &NoiseSchedule, timesteps: &[usize]) -> Vec<f64> {
        timesteps.iter().map(|&t| self.weight(schedule, t)).collect()
    }
}

/// Elementwise KL divergence between two Gaussians given by mean and log variance.
pub fn normal_kl<B: Backend>(
    mean1: Tensor<B, 4>,
    logvar1: Tensor<B, 4>,
    mean2: Tensor<B, 4>,
    logvar2: Tensor<B, 4>,
) -> Tensor<B, 4> {
    let diff = mean1 - mean2;
    let ratio = (logvar1.clone() - logvar2.clone()).exp();
    let scaled = diff.clone() * diff * logvar2.clone().neg().exp();

    (logvar2 - logvar1 + ratio + scaled)
        .sub_scalar(1.0)
        .mul_scalar(0.5)
}

/// Fast approximation of the cumulative distribution function of the
/// standard normal.
pub fn approx_standard_normal_cdf<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let cubic = x.clone() * x.clone() * x.clone();
    let inner = (x + cubic.mul_scalar(0.044715)).mul_scalar((2.0 / PI).sqrt());

    tanh(inner).add_scalar(1.0).mul_scalar(0.5)
}

/// Log likelihood of `x`, scaled to [-1, 1] from 8 bit values, under a
/// Gaussian discretized into the 256 bins of the data.
pub fn discretized_gaussian_log_likelihood<B: Backend>(
    x: Tensor<B, 4>,
    means: Tensor<B, 4>,
    log_scales: Tensor<B, 4>,
) -> Tensor<B, 4> {
    let bin = 1.0 / 255.0;
    let centered = x.clone() - means;
    let inv_stdv = log_scales.neg().exp();

    let cdf_plus = approx_standard_normal_cdf(inv_stdv.clone() * centered.clone().add_scalar(bin));
    let cdf_min = approx_standard_normal_cdf(inv_stdv * centered.sub_scalar(bin));

    let log_cdf_plus = cdf_plus.clone().clamp_min(1e-12).log();
    let log_one_minus_cdf_min = cdf_min.clone().neg().add_scalar(1.0).clamp_min(1e-12).log();
    let log_cdf_delta = (cdf_plus - cdf_min).clamp_min(1e-12).log();

    // The edge bins extend to infinity.
    let upper_edge = x.clone().greater_elem(0.999);
    let lower_edge = x.lower_elem(-0.999);

    log_cdf_delta
        .mask_where(upper_edge, log_one_minus_cdf_min)
        .mask_where(lower_edge, log_cdf_plus)
}

/// Converts a natural log quantity to bits.
pub fn to_bits<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Tensor<B, D> {
    tensor.div_scalar(LN_2)
}

/// Reduces per example losses of a shard by the size of the whole global
/// batch, so summing shard losses gives the mean over the global batch.
pub fn reduce_global<B: Backend>(per_example: Tensor<B, 1>, global_batch_size: usize) -> Tensor<B, 1> {
    per_example.sum().div_scalar(global_batch_size as f64)
}
