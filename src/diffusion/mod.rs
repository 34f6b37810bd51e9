//! # Diffusion
//!
//! Gaussian diffusion over depth maps conditioned on RGB images.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::Rng;

use crate::config::DiffusionConfig;
use crate::error::{DiffusionError, Result};
use crate::models::DenoisingBackbone;
use crate::schedulers::{DdpmSampler, NoiseSchedule, VarianceType};
use crate::utils::{batch_vector, mean_flat, timestep_tensor};

pub mod forward;
pub mod loss;
pub mod model;

pub use forward::q_sample;
pub use loss::{LossWeighting, LossWeightingKind};
pub use model::{DiffusionModel, StepMetrics};

/// Per example loss terms of a batch.
#[derive(Debug, Clone)]
pub struct LossTerms<B: Backend> {
    /// Weighted denoising loss plus the weighted variational bound.
    pub loss: Tensor<B, 1>,
    /// Unweighted MSE of the noise prediction.
    pub mse: Tensor<B, 1>,
    /// Variational bound in bits per dimension, under learned variance.
    pub vb: Option<Tensor<B, 1>>,
    /// Clean sample estimate, detached from the graph.
    pub pred_x0: Tensor<B, 4>,
}

/// Training objective and sampling procedure of one diffusion process.
#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    /// Full schedule, used by the loss.
    training: DdpmSampler,
    /// Possibly respaced schedule, used for generation.
    sampling: DdpmSampler,
    weighting: LossWeighting,
    lambda_vlb: f64,
    channels: usize,
}

impl GaussianDiffusion {
    pub fn new(config: &DiffusionConfig) -> Result<Self> {
        config.validate()?;
        let schedule = NoiseSchedule::new(config.beta_schedule, config.time_steps)?;
        let respaced = schedule.respace(config.sampling_steps())?;

        Ok(Self {
            training: DdpmSampler::new(schedule, config.variance_type, false),
            sampling: DdpmSampler::new(respaced, config.variance_type, config.clip_denoised),
            weighting: LossWeighting::new(config.loss_weighting, config.p2_k, config.p2_gamma),
            lambda_vlb: config.lambda_vlb,
            channels: config.channels,
        })
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        self.training.schedule()
    }

    pub fn sampling_schedule(&self) -> &NoiseSchedule {
        self.sampling.schedule()
    }

    pub fn variance_type(&self) -> VarianceType {
        self.training.variance_type()
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Channels the backbone has to predict.
    pub fn output_channels(&self) -> usize {
        self.variance_type().output_channels(self.channels)
    }

    /// Uniform training timesteps, one per example.
    pub fn sample_timesteps<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Vec<usize> {
        let num_steps = self.schedule().len();
        (0..batch_size).map(|_| rng.gen_range(0..num_steps)).collect()
    }

    /// Loss terms of `backbone` on `x_start` diffused to `timesteps` with `noise`.
    pub fn training_losses<B: Backend, M: DenoisingBackbone<B>>(
        &self,
        backbone: &M,
        condition: Tensor<B, 4>,
        x_start: Tensor<B, 4>,
        timesteps: &[usize],
        noise: Tensor<B, 4>,
    ) -> Result<LossTerms<B>> {
        let device = x_start.device();
        let x_t = q_sample(self.schedule(), x_start.clone(), timesteps, noise.clone())?;
        let timestep_ids = timestep_tensor::<B>(timesteps, &device);
        let output = backbone.predict(x_t.clone(), condition, timestep_ids);

        let [batch_size, out_channels, height, width] = output.dims();
        if out_channels != self.output_channels() {
            return Err(DiffusionError::config(format!(
                "the backbone predicted {out_channels} channels, variance type {} expects {}",
                self.variance_type(),
                self.output_channels()
            )));
        }

        let channels = self.channels;
        let eps = output
            .clone()
            .slice([0..batch_size, 0..channels, 0..height, 0..width]);
        let error = noise - eps.clone();
        let mse = mean_flat(error.clone() * error);

        let weights = self.weighting.weights(self.schedule(), timesteps);
        let weights = batch_vector::<B>(&weights, &device);
        let mut loss = mse.clone() * weights;

        let vb = if self.variance_type().is_learned() {
            // Only the variance is trained through the bound.
            let values = output.slice([0..batch_size, channels..out_channels, 0..height, 0..width]);
            let frozen = Tensor::cat(vec![eps.clone().detach(), values], 1);
            let vb = self.vb_terms_bpd(frozen, x_start, x_t.clone(), timesteps);
            loss = loss + vb.clone().mul_scalar(self.lambda_vlb);
            Some(vb)
        } else {
            None
        };

        let pred_x0 = self
            .training
            .predict_x0_from_eps(x_t.detach(), eps.detach(), timesteps);

        Ok(LossTerms {
            loss,
            mse,
            vb,
            pred_x0,
        })
    }

    /// Terms of the variational bound in bits: the KL to the true posterior,
    /// or the decoder negative log likelihood at the first timestep.
    fn vb_terms_bpd<B: Backend>(
        &self,
        model_output: Tensor<B, 4>,
        x_start: Tensor<B, 4>,
        x_t: Tensor<B, 4>,
        timesteps: &[usize],
    ) -> Tensor<B, 1> {
        let device = x_t.device();
        let (true_mean, true_log_variance) =
            self.training.q_posterior_mean_variance(x_start.clone(), x_t.clone(), timesteps);
        let out = self.training.p_mean_variance(model_output, x_t, timesteps);

        let kl = loss::normal_kl(
            true_mean,
            true_log_variance,
            out.mean.clone(),
            out.log_variance.clone(),
        );
        let kl = loss::to_bits(mean_flat(kl));

        let decoder_nll = loss::discretized_gaussian_log_likelihood(
            x_start,
            out.mean,
            out.log_variance.mul_scalar(0.5),
        )
        .neg();
        let decoder_nll = loss::to_bits(mean_flat(decoder_nll));

        let first: Vec<f64> = timesteps
            .iter()
            .map(|&t| if t == 0 { 1.0 } else { 0.0 })
            .collect();
        let first = batch_vector::<B>(&first, &device);

        decoder_nll * first.clone() + kl * first.neg().add_scalar(1.0)
    }

    /// Generates samples for `condition` from the noise drawn from `seed`.
    pub fn sample<B: Backend, M: DenoisingBackbone<B>>(
        &self,
        backbone: &M,
        condition: Tensor<B, 4>,
        seed: u64,
    ) -> Tensor<B, 4> {
        self.sampling.sample(backbone, condition, self.channels, seed)
    }
}
