//! Noise schedule shared by the forward process, the loss and the sampler.
//!
//! All columns are kept on the host in `f64`: they are indexed per example and
//! turned into small broadcastable tensors on demand, which keeps the schedule
//! independent of the backend and bit-for-bit identical across restarts.

use super::BetaSchedule;
use crate::error::{DiffusionError, Result};

/// The value of beta at the beginning of the linear and sigmoid schedules.
pub const BETA_START: f64 = 1e-4;
/// The value of beta at the end of the linear and sigmoid schedules.
pub const BETA_END: f64 = 0.02;
/// Upper clip of the cosine schedule.
pub const MAX_BETA: f64 = 0.999;

const COSINE_OFFSET: f64 = 0.008;

/// Per timestep statistics of a discrete diffusion process.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    /// Original training timestep of every entry, the identity unless respaced.
    pub timestep_map: Vec<usize>,
    pub betas: Vec<f64>,
    pub alphas: Vec<f64>,
    pub alphas_cumprod: Vec<f64>,
    pub alphas_cumprod_prev: Vec<f64>,
    pub sqrt_alphas_cumprod: Vec<f64>,
    pub sqrt_one_minus_alphas_cumprod: Vec<f64>,
    pub sqrt_recip_alphas_cumprod: Vec<f64>,
    pub sqrt_recipm1_alphas_cumprod: Vec<f64>,
    pub posterior_variance: Vec<f64>,
    /// Log of the posterior variance where the zero at `t = 0` is replaced by
    /// the value at `t = 1`.
    pub posterior_log_variance_clipped: Vec<f64>,
    pub posterior_mean_coef1: Vec<f64>,
    pub posterior_mean_coef2: Vec<f64>,
}

impl NoiseSchedule {
    /// Builds the schedule of `kind` over `num_steps` timesteps.
    pub fn new(kind: BetaSchedule, num_steps: usize) -> Result<Self> {
        if num_steps == 0 {
            return Err(DiffusionError::config(
                "the number of diffusion steps must be positive",
            ));
        }

        let betas = match kind {
            BetaSchedule::Linear => linear_betas(BETA_START, BETA_END, num_steps),
            BetaSchedule::Cosine => cosine_betas(num_steps, MAX_BETA),
            BetaSchedule::Sigmoid => sigmoid_betas(BETA_START, BETA_END, num_steps),
        };

        Self::from_betas(betas, (0..num_steps).collect())
    }

    /// Derives every column from `betas`.
    pub fn from_betas(betas: Vec<f64>, timestep_map: Vec<usize>) -> Result<Self> {
        if betas.is_empty() {
            return Err(DiffusionError::config("a schedule needs at least one beta"));
        }
        if let Some((t, beta)) = betas
            .iter()
            .enumerate()
            .find(|(_, beta)| !(**beta > 0.0 && **beta < 1.0))
        {
            return Err(DiffusionError::config(format!(
                "beta at timestep {t} is {beta}, expected a value in (0, 1)"
            )));
        }

        let num_steps = betas.len();
        let alphas: Vec<f64> = betas.iter().map(|beta| 1.0 - beta).collect();

        let mut alphas_cumprod = Vec::with_capacity(num_steps);
        for alpha in &alphas {
            alphas_cumprod.push(alpha * alphas_cumprod.last().copied().unwrap_or(1.0));
        }

        let mut alphas_cumprod_prev = Vec::with_capacity(num_steps);
        alphas_cumprod_prev.push(1.0);
        alphas_cumprod_prev.extend_from_slice(&alphas_cumprod[..num_steps - 1]);

        let sqrt_alphas_cumprod = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod =
            alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();
        let sqrt_recip_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 / a).sqrt()).collect();
        let sqrt_recipm1_alphas_cumprod = alphas_cumprod
            .iter()
            .map(|a| (1.0 / a - 1.0).sqrt())
            .collect();

        // alphas_cumprod_prev[0] == 1 makes the first posterior variance exactly zero.
        let posterior_variance: Vec<f64> = (0..num_steps)
            .map(|t| betas[t] * (1.0 - alphas_cumprod_prev[t]) / (1.0 - alphas_cumprod[t]))
            .collect();
        let posterior_log_variance_clipped = (0..num_steps)
            .map(|t| {
                let variance = if t == 0 && num_steps > 1 {
                    posterior_variance[1]
                } else {
                    posterior_variance[t]
                };
                variance.max(1e-20).ln()
            })
            .collect();
        let posterior_mean_coef1 = (0..num_steps)
            .map(|t| betas[t] * alphas_cumprod_prev[t].sqrt() / (1.0 - alphas_cumprod[t]))
            .collect();
        let posterior_mean_coef2 = (0..num_steps)
            .map(|t| {
                (1.0 - alphas_cumprod_prev[t]) * alphas[t].sqrt() / (1.0 - alphas_cumprod[t])
            })
            .collect();

        Ok(Self {
            timestep_map,
            betas,
            alphas,
            alphas_cumprod,
            alphas_cumprod_prev,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
            posterior_variance,
            posterior_log_variance_clipped,
            posterior_mean_coef1,
            posterior_mean_coef2,
        })
    }

    /// Keeps `steps` evenly spaced timesteps of this schedule.
    ///
    /// The betas of the shorter process are recomputed from the kept cumulative
    /// alphas, so `alpha_bar` is unchanged at every kept timestep and the
    /// posterior variances account for the skipped intervals.
    pub fn respace(&self, steps: usize) -> Result<Self> {
        let num_steps = self.len();
        if steps == 0 || steps > num_steps {
            return Err(DiffusionError::config(format!(
                "cannot respace {num_steps} diffusion steps to {steps} sampling steps"
            )));
        }
        if steps == num_steps {
            return Ok(self.clone());
        }

        let kept: Vec<usize> = if steps == 1 {
            vec![num_steps - 1]
        } else {
            (0..steps)
                .map(|k| {
                    let position = (k * (num_steps - 1)) as f64 / (steps - 1) as f64;
                    position.round() as usize
                })
                .collect()
        };

        let mut last_alpha_cumprod = 1.0;
        let mut betas = Vec::with_capacity(kept.len());
        for &t in &kept {
            betas.push(1.0 - self.alphas_cumprod[t] / last_alpha_cumprod);
            last_alpha_cumprod = self.alphas_cumprod[t];
        }
        let timestep_map = kept.iter().map(|&t| self.timestep_map[t]).collect();

        Self::from_betas(betas, timestep_map)
    }

    pub fn len(&self) -> usize {
        self.betas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.betas.is_empty()
    }

    /// Signal to noise ratio `alpha_bar_t / (1 - alpha_bar_t)`.
    pub fn snr(&self, t: usize) -> f64 {
        self.alphas_cumprod[t] / (1.0 - self.alphas_cumprod[t])
    }

    /// Errors when any of `timesteps` is outside the schedule.
    pub fn check_timesteps(&self, timesteps: &[usize]) -> Result<()> {
        match timesteps.iter().find(|&&t| t >= self.len()) {
            Some(t) => Err(DiffusionError::config(format!(
                "timestep {t} is outside of the schedule of {} steps",
                self.len()
            ))),
            None => Ok(()),
        }
    }
}

/// Betas evenly distributed over `start..=end`.
fn linear_betas(start: f64, end: f64, num_steps: usize) -> Vec<f64> {
    (0..num_steps)
        .map(|t| start + (end - start) * fraction(t, num_steps))
        .collect()
}

/// Sigmoid of `-6..=6` rescaled to `start..=end`.
fn sigmoid_betas(start: f64, end: f64, num_steps: usize) -> Vec<f64> {
    (0..num_steps)
        .map(|t| {
            let x = -6.0 + 12.0 * fraction(t, num_steps);
            let sigmoid = 1.0 / (1.0 + (-x).exp());
            sigmoid * (end - start) + start
        })
        .collect()
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which defines the cumulative product of
/// `(1-beta)` over time from `t = [0,1]`.
fn cosine_betas(num_diffusion_timesteps: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar = |time_step: usize| {
        let t = time_step as f64 / num_diffusion_timesteps as f64;
        f64::cos((t + COSINE_OFFSET) / (1.0 + COSINE_OFFSET) * std::f64::consts::FRAC_PI_2).powi(2)
    };

    (0..num_diffusion_timesteps)
        .map(|i| (1.0 - alpha_bar(i + 1) / alpha_bar(i)).min(max_beta))
        .collect()
}

fn fraction(t: usize, num_steps: usize) -> f64 {
    if num_steps == 1 {
        0.0
    } else {
        t as f64 / (num_steps - 1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KINDS: [BetaSchedule; 3] = [
        BetaSchedule::Cosine,
        BetaSchedule::Linear,
        BetaSchedule::Sigmoid,
    ];

    #[test]
    fn test_alphas_cumprod_strictly_decreasing() {
        for kind in KINDS {
            let schedule = NoiseSchedule::new(kind, 1000).unwrap();
            for window in schedule.alphas_cumprod.windows(2) {
                assert!(window[1] < window[0], "{kind}: {window:?}");
            }
            assert!(schedule.alphas_cumprod[0] > 0.99, "{kind}");
            assert!(schedule.alphas_cumprod[999] < 1e-3, "{kind}");
            assert!(schedule
                .alphas_cumprod
                .iter()
                .all(|value| *value > 0.0 && *value < 1.0));
        }
    }

    #[test]
    fn test_linear_betas_four_steps() {
        let schedule = NoiseSchedule::new(BetaSchedule::Linear, 4).unwrap();

        assert!((schedule.betas[0] - 1e-4).abs() < 1e-12);
        assert!((schedule.betas[1] - (1e-4 + 0.0199 / 3.0)).abs() < 1e-12);
        assert!((schedule.betas[3] - 0.02).abs() < 1e-12);
        assert!((schedule.alphas_cumprod[1] - (1.0 - 1e-4) * schedule.alphas[1]).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_betas_are_clipped() {
        let schedule = NoiseSchedule::new(BetaSchedule::Cosine, 50).unwrap();

        assert!(schedule.betas.iter().all(|beta| *beta <= MAX_BETA));
        assert_eq!(schedule.betas[49], MAX_BETA);
    }

    #[test]
    fn test_posterior_at_first_timestep() {
        let schedule = NoiseSchedule::new(BetaSchedule::Linear, 10).unwrap();

        assert_eq!(schedule.posterior_variance[0], 0.0);
        assert_eq!(
            schedule.posterior_log_variance_clipped[0],
            schedule.posterior_log_variance_clipped[1]
        );
        assert!((schedule.posterior_mean_coef1[0] - 1.0).abs() < 1e-9);
        assert_eq!(schedule.posterior_mean_coef2[0], 0.0);
    }

    #[test]
    fn test_zero_steps_is_config_error() {
        assert!(matches!(
            NoiseSchedule::new(BetaSchedule::Cosine, 0),
            Err(DiffusionError::Config(_))
        ));
    }

    #[test]
    fn test_schedule_is_deterministic() {
        let first = NoiseSchedule::new(BetaSchedule::Sigmoid, 128).unwrap();
        let second = NoiseSchedule::new(BetaSchedule::Sigmoid, 128).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_respace_keeps_endpoints() {
        let schedule = NoiseSchedule::new(BetaSchedule::Cosine, 100).unwrap();
        let respaced = schedule.respace(10).unwrap();

        assert_eq!(respaced.len(), 10);
        assert_eq!(respaced.timestep_map[0], 0);
        assert_eq!(respaced.timestep_map[9], 99);
        assert_eq!(respaced.timestep_map[1], 11);
        assert!((respaced.alphas_cumprod[0] - schedule.alphas_cumprod[0]).abs() < 1e-12);
        assert!((respaced.alphas_cumprod[9] - schedule.alphas_cumprod[99]).abs() < 1e-12);
        for (i, &t) in respaced.timestep_map.iter().enumerate() {
            assert!((respaced.alphas_cumprod[i] - schedule.alphas_cumprod[t]).abs() < 1e-9);
        }
    }

    #[test]
    fn test_respace_bounds() {
        let schedule = NoiseSchedule::new(BetaSchedule::Linear, 20).unwrap();

        assert!(schedule.respace(0).is_err());
        assert!(schedule.respace(21).is_err());
        assert_eq!(schedule.respace(20).unwrap(), schedule);
        assert_eq!(schedule.respace(1).unwrap().timestep_map, vec![19]);
    }

    #[test]
    fn test_check_timesteps() {
        let schedule = NoiseSchedule::new(BetaSchedule::Linear, 4).unwrap();

        assert!(schedule.check_timesteps(&[0, 3]).is_ok());
        assert!(schedule.check_timesteps(&[4]).is_err());
    }
}
