//! Reverse process of a denoising diffusion probabilistic model.
//!
//! Improved Denoising Diffusion Probabilistic Models, A. Nichol and P. Dhariwal, 2021.
//! https://arxiv.org/abs/2102.09672

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{NoiseSchedule, VarianceType};
use crate::models::DenoisingBackbone;
use crate::utils::{batch_column, per_example, standard_normal, timestep_tensor};

/// Mean and log variance of `p(x_{t-1} | x_t)` together with the clean sample
/// estimate they are derived from.
#[derive(Debug, Clone)]
pub struct MeanVariance<B: Backend> {
    pub mean: Tensor<B, 4>,
    pub log_variance: Tensor<B, 4>,
    pub pred_x0: Tensor<B, 4>,
}

/// Ancestral sampler over a, possibly respaced, noise schedule.
#[derive(Debug, Clone)]
pub struct DdpmSampler {
    schedule: NoiseSchedule,
    variance_type: VarianceType,
    /// `log(beta_t)` with the first entry replaced by the second posterior variance,
    /// the fixed upper bound.
    upper_log_variance: Vec<f64>,
    /// `log(beta_t)`, the upper end of the learned range.
    log_betas: Vec<f64>,
    clip_denoised: bool,
}

impl DdpmSampler {
    pub fn new(schedule: NoiseSchedule, variance_type: VarianceType, clip_denoised: bool) -> Self {
        let upper_log_variance = (0..schedule.len())
            .map(|t| {
                let variance = if t == 0 && schedule.len() > 1 {
                    schedule.posterior_variance[1]
                } else {
                    schedule.betas[t]
                };
                variance.ln()
            })
            .collect();
        let log_betas = schedule.betas.iter().map(|beta| beta.ln()).collect();

        Self {
            schedule,
            variance_type,
            upper_log_variance,
            log_betas,
            clip_denoised,
        }
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn variance_type(&self) -> VarianceType {
        self.variance_type
    }

    /// Mean and log variance of the true posterior `q(x_{t-1} | x_t, x_0)`.
    pub fn q_posterior_mean_variance<B: Backend>(
        &self,
        x_start: Tensor<B, 4>,
        x_t: Tensor<B, 4>,
        indices: &[usize],
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let device = x_t.device();
        let coef1 = per_example::<B>(&self.schedule.posterior_mean_coef1, indices, &device);
        let coef2 = per_example::<B>(&self.schedule.posterior_mean_coef2, indices, &device);
        let log_variance = per_example::<B>(
            &self.schedule.posterior_log_variance_clipped,
            indices,
            &device,
        );

        let mean = x_start * coef1 + x_t.clone() * coef2;
        (mean, x_t.zeros_like() + log_variance)
    }

    /// Clean sample estimate from a noise prediction.
    pub fn predict_x0_from_eps<B: Backend>(
        &self,
        x_t: Tensor<B, 4>,
        eps: Tensor<B, 4>,
        indices: &[usize],
    ) -> Tensor<B, 4> {
        let device = x_t.device();
        let recip = per_example::<B>(&self.schedule.sqrt_recip_alphas_cumprod, indices, &device);
        let recipm1 =
            per_example::<B>(&self.schedule.sqrt_recipm1_alphas_cumprod, indices, &device);

        x_t * recip - eps * recipm1
    }

    /// Splits the backbone output into noise and variance predictions and
    /// applies the configured variance policy.
    pub fn p_mean_variance<B: Backend>(
        &self,
        model_output: Tensor<B, 4>,
        x_t: Tensor<B, 4>,
        indices: &[usize],
    ) -> MeanVariance<B> {
        let device = x_t.device();
        let [batch_size, out_channels, height, width] = model_output.dims();

        let (eps, log_variance) = if self.variance_type.is_learned() {
            let channels = out_channels / 2;
            let eps = model_output
                .clone()
                .slice([0..batch_size, 0..channels, 0..height, 0..width]);
            let values =
                model_output.slice([0..batch_size, channels..out_channels, 0..height, 0..width]);

            let log_variance = match self.variance_type {
                VarianceType::Learned => values,
                _ => {
                    let min_log = per_example::<B>(
                        &self.schedule.posterior_log_variance_clipped,
                        indices,
                        &device,
                    );
                    let max_log = per_example::<B>(&self.log_betas, indices, &device);
                    // The output is in [-1, 1], map it to an interpolation factor.
                    let frac = values.add_scalar(1.0).div_scalar(2.0);
                    frac * (max_log - min_log.clone()) + min_log
                }
            };
            (eps, log_variance)
        } else {
            let column = match self.variance_type {
                VarianceType::LowerBound => &self.schedule.posterior_log_variance_clipped,
                _ => &self.upper_log_variance,
            };
            let log_variance = x_t.zeros_like() + per_example::<B>(column, indices, &device);
            (model_output, log_variance)
        };

        let pred_x0 = self.predict_x0_from_eps(x_t.clone(), eps, indices);
        let pred_x0 = if self.clip_denoised {
            pred_x0.clamp(-1.0, 1.0)
        } else {
            pred_x0
        };
        let (mean, _) = self.q_posterior_mean_variance(pred_x0.clone(), x_t, indices);

        MeanVariance {
            mean,
            log_variance,
            pred_x0,
        }
    }

    /// One transition `x_t -> x_{t-1}`. No noise is added at the first timestep.
    pub fn step<B: Backend, R: Rng + ?Sized>(
        &self,
        model_output: Tensor<B, 4>,
        x_t: Tensor<B, 4>,
        indices: &[usize],
        rng: &mut R,
    ) -> Tensor<B, 4> {
        let device = x_t.device();
        let out = self.p_mean_variance(model_output, x_t, indices);
        if indices.iter().all(|&i| i == 0) {
            return out.mean;
        }

        let noise = standard_normal::<B, 4, R>(out.mean.dims(), rng, &device);
        let nonzero: Vec<f64> = indices
            .iter()
            .map(|&i| if i == 0 { 0.0 } else { 1.0 })
            .collect();
        let nonzero = batch_column::<B>(&nonzero, &device);

        out.mean + nonzero * out.log_variance.mul_scalar(0.5).exp() * noise
    }

    /// Generates `channels` channel samples for `condition`, starting from
    /// pure noise drawn from `seed`.
    pub fn sample<B: Backend, M: DenoisingBackbone<B>>(
        &self,
        backbone: &M,
        condition: Tensor<B, 4>,
        channels: usize,
        seed: u64,
    ) -> Tensor<B, 4> {
        let device = condition.device();
        let [batch_size, _, height, width] = condition.dims();
        let mut rng = StdRng::seed_from_u64(seed);

        let mut sample =
            standard_normal::<B, 4, _>([batch_size, channels, height, width], &mut rng, &device);
        for i in (0..self.schedule.len()).rev() {
            let indices = vec![i; batch_size];
            let timesteps = vec![self.schedule.timestep_map[i]; batch_size];
            let model_output = backbone.predict(
                sample.clone(),
                condition.clone(),
                timestep_tensor::<B>(&timesteps, &device),
            );
            sample = self.step(model_output, sample, &indices, &mut rng);
        }

        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::ScaledBackbone;
    use crate::schedulers::BetaSchedule;
    use crate::utils::to_host;
    use crate::TestBackend;
    use burn::tensor::Distribution;

    fn condition(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 4> {
        Tensor::random([2, 3, 4, 4], Distribution::Uniform(-1.0, 1.0), device)
    }

    #[test]
    fn test_sample_is_reproducible() {
        let device = Default::default();
        let schedule = NoiseSchedule::new(BetaSchedule::Cosine, 20).unwrap();
        let sampler = DdpmSampler::new(schedule, VarianceType::UpperBound, true);
        let backbone = ScaledBackbone::<TestBackend>::new(0.1, 1);
        let condition = condition(&device);

        let first = sampler.sample(&backbone, condition.clone(), 1, 1911);
        let second = sampler.sample(&backbone, condition.clone(), 1, 1911);
        let other = sampler.sample(&backbone, condition, 1, 7);

        assert_eq!(first.dims(), [2, 1, 4, 4]);
        assert_eq!(first.clone().into_data(), second.into_data());
        assert_ne!(first.into_data(), other.into_data());
    }

    #[test]
    fn test_respaced_sample_shape() {
        let device = Default::default();
        let schedule = NoiseSchedule::new(BetaSchedule::Linear, 100)
            .unwrap()
            .respace(5)
            .unwrap();
        let sampler = DdpmSampler::new(schedule, VarianceType::LearnedRange, true);
        let backbone = ScaledBackbone::<TestBackend>::new(0.5, 2);

        let sample = sampler.sample(&backbone, condition(&device), 1, 3);

        assert_eq!(sample.dims(), [2, 1, 4, 4]);
        assert!(to_host(sample).iter().all(|value| value.is_finite()));
    }

    #[test]
    fn test_last_step_returns_clipped_mean() {
        let device = Default::default();
        let schedule = NoiseSchedule::new(BetaSchedule::Linear, 10).unwrap();
        let sampler = DdpmSampler::new(schedule, VarianceType::LowerBound, true);
        let x_t: Tensor<TestBackend, 4> = Tensor::ones([1, 1, 2, 2], &device).mul_scalar(3.0);
        let eps = Tensor::zeros([1, 1, 2, 2], &device);

        let sample = sampler.step(eps, x_t, &[0], &mut StdRng::seed_from_u64(0));

        // At t = 0 the posterior mean is the clipped clean estimate.
        for value in to_host(sample) {
            assert!((value - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_fixed_variances_follow_schedule() {
        let device = Default::default();
        let schedule = NoiseSchedule::new(BetaSchedule::Linear, 10).unwrap();
        let lower = DdpmSampler::new(schedule.clone(), VarianceType::LowerBound, false);
        let upper = DdpmSampler::new(schedule.clone(), VarianceType::UpperBound, false);
        let x_t: Tensor<TestBackend, 4> = Tensor::zeros([1, 1, 1, 1], &device);

        let lower = lower.p_mean_variance(x_t.clone(), x_t.clone(), &[5]);
        let upper = upper.p_mean_variance(x_t.clone(), x_t, &[5]);

        let lower_log = to_host(lower.log_variance)[0];
        let upper_log = to_host(upper.log_variance)[0];
        assert!((lower_log - schedule.posterior_variance[5].ln()).abs() < 1e-4);
        assert!((upper_log - schedule.betas[5].ln()).abs() < 1e-4);
        assert!(lower_log < upper_log);
    }

    #[test]
    fn test_learned_range_interpolates_bounds() {
        let device = Default::default();
        let schedule = NoiseSchedule::new(BetaSchedule::Cosine, 10).unwrap();
        let sampler = DdpmSampler::new(schedule.clone(), VarianceType::LearnedRange, false);
        let x_t: Tensor<TestBackend, 4> = Tensor::zeros([1, 1, 1, 1], &device);
        let lower = Tensor::cat(vec![x_t.clone(), x_t.clone().sub_scalar(1.0)], 1);
        let upper = Tensor::cat(vec![x_t.clone(), x_t.clone().add_scalar(1.0)], 1);

        let lower = to_host(sampler.p_mean_variance(lower, x_t.clone(), &[4]).log_variance)[0];
        let upper = to_host(sampler.p_mean_variance(upper, x_t, &[4]).log_variance)[0];

        assert!((lower - schedule.posterior_log_variance_clipped[4]).abs() < 1e-4);
        assert!((upper - schedule.betas[4].ln()).abs() < 1e-4);
    }

    #[test]
    fn test_learned_range_first_step_spans_beta() {
        let device = Default::default();
        let schedule = NoiseSchedule::new(BetaSchedule::Linear, 10).unwrap();
        let sampler = DdpmSampler::new(schedule.clone(), VarianceType::LearnedRange, false);
        let x_t: Tensor<TestBackend, 4> = Tensor::zeros([1, 1, 1, 1], &device);
        let lower = Tensor::cat(vec![x_t.clone(), x_t.clone().sub_scalar(1.0)], 1);
        let upper = Tensor::cat(vec![x_t.clone(), x_t.clone().add_scalar(1.0)], 1);

        let lower = to_host(sampler.p_mean_variance(lower, x_t.clone(), &[0]).log_variance)[0];
        let upper = to_host(sampler.p_mean_variance(upper, x_t, &[0]).log_variance)[0];

        assert!((upper - schedule.betas[0].ln()).abs() < 1e-4);
        assert!((lower - schedule.posterior_log_variance_clipped[0]).abs() < 1e-4);
        assert!(upper - lower > 1e-2);
    }
}
