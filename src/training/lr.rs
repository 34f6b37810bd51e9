//! Learning rate policy indexed by absolute epoch, so a resumed run continues
//! the warm-up and decay where the restored checkpoint left off.

use core::f64::consts::PI;
use core::fmt;
use core::str::FromStr;

use burn::config::Config;
use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrDecay {
    /// Linear decay to zero at the last epoch.
    Linear,
    /// Half cosine decay to zero at the last epoch.
    Cosine,
    /// Cosine decay restarted every `decay_epochs`.
    CosineRestart,
    /// Multiplied by `decay_rate` every `decay_epochs`.
    Step,
    /// Continuous `decay_rate^(epoch / decay_epochs)`.
    Exponential,
}

impl FromStr for LrDecay {
    type Err = DiffusionError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s {
            "linear" => Ok(LrDecay::Linear),
            "cosine" => Ok(LrDecay::Cosine),
            "cosine_restart" => Ok(LrDecay::CosineRestart),
            "step" => Ok(LrDecay::Step),
            "exponential" => Ok(LrDecay::Exponential),
            other => Err(DiffusionError::config(format!(
                "unknown learning rate decay '{other}'"
            ))),
        }
    }
}

impl fmt::Display for LrDecay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LrDecay::Linear => "linear",
            LrDecay::Cosine => "cosine",
            LrDecay::CosineRestart => "cosine_restart",
            LrDecay::Step => "step",
            LrDecay::Exponential => "exponential",
        };
        f.write_str(name)
    }
}

#[derive(Config, Debug)]
pub struct LrConfig {
    /// Constant learning rate after warm-up when unset.
    pub decay: Option<LrDecay>,
    /// Epochs of linear increase up to the base learning rate.
    #[config(default = 0)]
    pub warmup_epochs: usize,
    /// Period of the step, exponential and restart decays.
    #[config(default = 10)]
    pub decay_epochs: usize,
    #[config(default = 0.5)]
    pub decay_rate: f64,
}

impl LrConfig {
    pub fn validate(&self) -> Result<()> {
        if self.decay_epochs == 0 {
            return Err(DiffusionError::config("decay_epochs must be positive"));
        }
        if !(0.0..=1.0).contains(&self.decay_rate) {
            return Err(DiffusionError::config(format!(
                "decay_rate must be in [0, 1], got {}",
                self.decay_rate
            )));
        }
        Ok(())
    }

    pub fn init(&self, base: f64, epochs: usize) -> LrPolicy {
        LrPolicy {
            base,
            epochs,
            decay: self.decay,
            warmup_epochs: self.warmup_epochs,
            decay_epochs: self.decay_epochs,
            decay_rate: self.decay_rate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LrPolicy {
    base: f64,
    epochs: usize,
    decay: Option<LrDecay>,
    warmup_epochs: usize,
    decay_epochs: usize,
    decay_rate: f64,
}

impl LrPolicy {
    /// Learning rate of `epoch`, counted from the very first epoch of the run.
    pub fn rate(&self, epoch: usize) -> f64 {
        if epoch < self.warmup_epochs {
            return self.base * (epoch + 1) as f64 / self.warmup_epochs as f64;
        }

        let elapsed = (epoch - self.warmup_epochs) as f64;
        let span = self.epochs.saturating_sub(self.warmup_epochs).max(1) as f64;
        let period = self.decay_epochs as f64;
        let progress = (elapsed / span).min(1.0);

        let factor = match self.decay {
            None => 1.0,
            Some(LrDecay::Linear) => 1.0 - progress,
            Some(LrDecay::Cosine) => 0.5 * (1.0 + (PI * progress).cos()),
            Some(LrDecay::CosineRestart) => {
                let cycle = (elapsed % period) / period;
                0.5 * (1.0 + (PI * cycle).cos())
            }
            Some(LrDecay::Step) => self.decay_rate.powf((elapsed / period).floor()),
            Some(LrDecay::Exponential) => self.decay_rate.powf(elapsed / period),
        };

        self.base * factor
    }
}
