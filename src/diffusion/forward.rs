use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::error::{DiffusionError, Result};
use crate::schedulers::NoiseSchedule;
use crate::utils::per_example;

/// Diffuses `x_start` to the per example `timesteps` with the given `noise`:
/// `sqrt(alpha_bar_t) * x_start + sqrt(1 - alpha_bar_t) * noise`.
pub fn q_sample<B: Backend>(
    schedule: &NoiseSchedule,
    x_start: Tensor<B, 4>,
    timesteps: &[usize],
    noise: Tensor<B, 4>,
) -> Result<Tensor<B, 4>> {
    schedule.check_timesteps(timesteps)?;
    let [batch_size, _, _, _] = x_start.dims();
    if timesteps.len() != batch_size {
        return Err(DiffusionError::config(format!(
            "{} timesteps for a batch of {batch_size}",
            timesteps.len()
        )));
    }
    if noise.dims() != x_start.dims() {
        return Err(DiffusionError::config(format!(
            "noise of shape {:?} for samples of shape {:?}",
            noise.dims(),
            x_start.dims()
        )));
    }

    let device = x_start.device();
    let signal = per_example::<B>(&schedule.sqrt_alphas_cumprod, timesteps, &device);
    let sigma = per_example::<B>(&schedule.sqrt_one_minus_alphas_cumprod, timesteps, &device);

    Ok(x_start * signal + noise * sigma)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedulers::BetaSchedule;
    use crate::utils::to_host;
    use crate::TestBackend;
    use burn::tensor::{Data, Distribution};

    #[test]
    fn test_first_timestep_is_nearly_clean() {
        let device = Default::default();
        for kind in [BetaSchedule::Cosine, BetaSchedule::Linear] {
            let schedule = NoiseSchedule::new(kind, 1000).unwrap();
            let x_start: Tensor<TestBackend, 4> =
                Tensor::random([2, 1, 4, 4], Distribution::Uniform(-1.0, 1.0), &device);
            let noise = Tensor::random([2, 1, 4, 4], Distribution::Normal(0.0, 1.0), &device);

            let x_t = q_sample(&schedule, x_start.clone(), &[0, 0], noise.clone()).unwrap();

            assert!(schedule.sqrt_one_minus_alphas_cumprod[0] < 1e-2);
            let expected = x_start.mul_scalar(schedule.sqrt_alphas_cumprod[0])
                + noise.mul_scalar(schedule.sqrt_one_minus_alphas_cumprod[0]);
            x_t.into_data().assert_approx_eq(&expected.into_data(), 4);
        }
    }

    #[test]
    fn test_mixes_per_example() {
        let device = Default::default();
        let schedule = NoiseSchedule::new(BetaSchedule::Linear, 4).unwrap();
        let x_start: Tensor<TestBackend, 4> = Tensor::ones([2, 1, 1, 1], &device);
        let noise: Tensor<TestBackend, 4> =
            Tensor::from_floats(Data::from([[[[2.0]]], [[[-2.0]]]]), &device);

        let x_t = to_host(q_sample(&schedule, x_start, &[1, 3], noise).unwrap());

        let expected = |t: usize, eps: f64| {
            schedule.sqrt_alphas_cumprod[t] + schedule.sqrt_one_minus_alphas_cumprod[t] * eps
        };
        assert!((x_t[0] - expected(1, 2.0)).abs() < 1e-5);
        assert!((x_t[1] - expected(3, -2.0)).abs() < 1e-5);
    }

    #[test]
    fn test_rejects_out_of_range_timestep() {
        let device = Default::default();
        let schedule = NoiseSchedule::new(BetaSchedule::Linear, 4).unwrap();
        let x_start: Tensor<TestBackend, 4> = Tensor::zeros([1, 1, 2, 2], &device);

        let result = q_sample(&schedule, x_start.clone(), &[4], x_start.clone());
        assert!(matches!(result, Err(DiffusionError::Config(_))));

        let result = q_sample(&schedule, x_start.clone(), &[0, 1], x_start);
        assert!(matches!(result, Err(DiffusionError::Config(_))));
    }
}
