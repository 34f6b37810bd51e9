use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DiffusionError;

pub mod ddpm;
pub mod schedule;

pub use ddpm::DdpmSampler;
pub use schedule::NoiseSchedule;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Improved DDPM cosine schedule on the cumulative alphas.
    Cosine,
    /// Linear interpolation.
    Linear,
    /// Sigmoid ramp between the minimum and maximum beta.
    Sigmoid,
}

impl FromStr for BetaSchedule {
    type Err = DiffusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(BetaSchedule::Cosine),
            "linear" => Ok(BetaSchedule::Linear),
            "sigmoid" => Ok(BetaSchedule::Sigmoid),
            other => Err(DiffusionError::config(format!(
                "unknown beta schedule '{other}', expected cosine, linear or sigmoid"
            ))),
        }
    }
}

impl fmt::Display for BetaSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BetaSchedule::Cosine => "cosine",
            BetaSchedule::Linear => "linear",
            BetaSchedule::Sigmoid => "sigmoid",
        };
        f.write_str(name)
    }
}

/// How the variance of the reverse process is obtained.
///
/// The two bounds are fixed per timestep and derived from the schedule, the
/// learned variants make the backbone predict it in a second set of output
/// channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceType {
    /// Posterior variance `beta_tilde_t`.
    LowerBound,
    /// Forward variance `beta_t`.
    UpperBound,
    /// The backbone predicts the log variance directly.
    Learned,
    /// The backbone predicts an interpolation factor between both bounds.
    LearnedRange,
}

impl VarianceType {
    pub fn is_learned(&self) -> bool {
        matches!(self, VarianceType::Learned | VarianceType::LearnedRange)
    }

    /// Number of output channels the backbone must produce for `channels`
    /// data channels.
    pub fn output_channels(&self, channels: usize) -> usize {
        if self.is_learned() {
            channels * 2
        } else {
            channels
        }
    }
}

impl FromStr for VarianceType {
    type Err = DiffusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lower_bound" => Ok(VarianceType::LowerBound),
            "upper_bound" => Ok(VarianceType::UpperBound),
            "learned" => Ok(VarianceType::Learned),
            "learned_range" => Ok(VarianceType::LearnedRange),
            other => Err(DiffusionError::config(format!(
                "unknown variance type '{other}', expected lower_bound, upper_bound, learned or learned_range"
            ))),
        }
    }
}

impl fmt::Display for VarianceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VarianceType::LowerBound => "lower_bound",
            VarianceType::UpperBound => "upper_bound",
            VarianceType::Learned => "learned",
            VarianceType::LearnedRange => "learned_range",
        };
        f.write_str(name)
    }
}
