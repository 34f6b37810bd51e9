//! Trainable diffusion model: a backbone together with its optimizer, loss
//! scaler and diffusion process.

use std::path::{Path, PathBuf};

use burn::module::AutodiffModule;
use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use rand::Rng;
use tracing::debug;

use super::loss::reduce_global;
use super::GaussianDiffusion;
use crate::config::DiffusionConfig;
use crate::error::{DiffusionError, Result};
use crate::models::DenoisingBackbone;
use crate::training::checkpoint::{self, CheckpointManager};
use crate::training::optimizer::TrainOptimizer;
use crate::training::precision::{transfer_gradients, HalfPrecision, LossScaler};
use crate::training::replica::{shard, Replicas};
use crate::utils::{mean_flat, scalar, standard_normal, to_host};

/// Host side metrics of one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMetrics {
    /// Objective the update was computed from.
    pub loss: f64,
    /// Unweighted MSE of the noise prediction.
    pub mse: f64,
    /// MSE of the clean sample estimate against the target.
    pub x0_mse: f64,
    /// Variational bound in bits per dimension, under learned variance.
    pub vb: Option<f64>,
    /// Whether the loss scaler dropped the update.
    pub skipped: bool,
}

pub struct DiffusionModel<B, M>
where
    B: AutodiffBackend,
    M: DenoisingBackbone<B> + AutodiffModule<B>,
    M::InnerModule: DenoisingBackbone<B::InnerBackend>,
{
    backbone: M,
    optimizer: TrainOptimizer<B, M>,
    scaler: LossScaler,
    replicas: Replicas,
    diffusion: GaussianDiffusion,
    half: Option<Box<dyn HalfPrecisionPass<B, M>>>,
    epoch: usize,
    step: usize,
}

impl<B, M> DiffusionModel<B, M>
where
    B: AutodiffBackend,
    M: DenoisingBackbone<B> + AutodiffModule<B>,
    M::InnerModule: DenoisingBackbone<B::InnerBackend>,
{
    pub fn new(
        backbone: M,
        optimizer: TrainOptimizer<B, M>,
        config: &DiffusionConfig,
        replicas: Replicas,
        mixed_precision: bool,
    ) -> Result<Self> {
        let diffusion = GaussianDiffusion::new(config)?;
        if backbone.out_channels() != diffusion.output_channels() {
            return Err(DiffusionError::config(format!(
                "variance type {} requires a backbone with {} output channels, got {}",
                diffusion.variance_type(),
                diffusion.output_channels(),
                backbone.out_channels()
            )));
        }

        let scaler = if mixed_precision {
            LossScaler::new()
        } else {
            LossScaler::disabled()
        };

        Ok(Self {
            backbone,
            optimizer,
            scaler,
            replicas,
            diffusion,
            half: None,
            epoch: 0,
            step: 0,
        })
    }

    /// Runs the forward and backward passes on `backbone`, a reduced precision
    /// copy on backend `H`, and keeps the weights of the master backbone in
    /// full precision. Enables loss scaling.
    pub fn with_half_precision<H, MH>(mut self, backbone: MH, device: H::Device) -> Result<Self>
    where
        H: AutodiffBackend,
        MH: DenoisingBackbone<H> + AutodiffModule<H> + 'static,
    {
        if backbone.out_channels() != self.backbone.out_channels() {
            return Err(DiffusionError::config(format!(
                "the reduced precision backbone has {} output channels, the master {}",
                backbone.out_channels(),
                self.backbone.out_channels()
            )));
        }
        if !self.scaler.is_enabled() {
            self.scaler = LossScaler::new();
        }
        self.half = Some(Box::new(HalfPrecision::<H, MH>::new(backbone, device)));
        Ok(self)
    }

    /// Whether the passes run on a reduced precision copy of the backbone.
    pub fn is_half_precision(&self) -> bool {
        self.half.is_some()
    }

    pub fn backbone(&self) -> &M {
        &self.backbone
    }

    pub fn diffusion(&self) -> &GaussianDiffusion {
        &self.diffusion
    }

    pub fn replicas(&self) -> Replicas {
        self.replicas
    }

    pub fn loss_scale(&self) -> f64 {
        self.scaler.scale()
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Updates applied or skipped since the model was built.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Epoch reported by numeric instability errors.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    /// One gradient update on a global batch.
    ///
    /// The batch is split across the replicas, every shard computes its loss
    /// reduced by the global batch size and the summed loss is back propagated
    /// once, scaled when mixed precision is enabled.
    pub fn train_step<R: Rng + ?Sized>(
        &mut self,
        condition: Tensor<B, 4>,
        target: Tensor<B, 4>,
        lr: f64,
        rng: &mut R,
    ) -> Result<StepMetrics> {
        let device = target.device();
        let [batch_size, _, _, _] = target.dims();
        let timesteps = self.diffusion.sample_timesteps(batch_size, rng);
        let noise = standard_normal::<B, 4, R>(target.dims(), rng, &device);
        let inputs = StepInputs {
            condition,
            target,
            noise,
            timesteps,
        };

        let (grads, metrics) = match self.half.as_mut() {
            Some(half) => half.backward(
                &self.backbone,
                &self.diffusion,
                self.replicas,
                &self.scaler,
                inputs,
            )?,
            None => backward(
                &self.diffusion,
                self.replicas,
                &self.scaler,
                &self.backbone,
                inputs,
            )?,
        };
        let Some(grads) = grads else {
            return Err(DiffusionError::NumericInstability {
                epoch: self.epoch,
                step: self.step,
                value: metrics.loss,
            });
        };

        let (grads, finite) = self.scaler.unscale(grads, &self.backbone);
        let applied = self.scaler.update(finite);
        if applied {
            self.backbone = self.optimizer.step(lr, self.backbone.clone(), grads);
        }
        self.step += 1;
        debug!(step = self.step, loss = metrics.loss, mse = metrics.mse, "train step");

        Ok(StepMetrics {
            skipped: !applied,
            ..metrics
        })
    }

    /// Same losses as [`DiffusionModel::train_step`] on the inference module,
    /// without any update.
    pub fn test_step<R: Rng + ?Sized>(
        &self,
        condition: Tensor<B::InnerBackend, 4>,
        target: Tensor<B::InnerBackend, 4>,
        rng: &mut R,
    ) -> Result<StepMetrics> {
        let backbone = self.backbone.valid();
        let device = target.device();
        let [batch_size, _, _, _] = target.dims();
        let timesteps = self.diffusion.sample_timesteps(batch_size, rng);
        let noise = standard_normal::<B::InnerBackend, 4, R>(target.dims(), rng, &device);

        let terms = self.diffusion.training_losses(
            &backbone,
            condition,
            target.clone(),
            &timesteps,
            noise,
        )?;
        let error = terms.pred_x0 - target;

        Ok(StepMetrics {
            loss: mean(terms.loss),
            mse: mean(terms.mse),
            x0_mse: mean(mean_flat(error.clone() * error)),
            vb: terms.vb.map(mean),
            skipped: false,
        })
    }

    /// Generates depth maps for `condition` with the respaced sampling schedule.
    pub fn sample(&self, condition: Tensor<B::InnerBackend, 4>, seed: u64) -> Tensor<B::InnerBackend, 4> {
        self.diffusion.sample(&self.backbone.valid(), condition, seed)
    }

    /// Saves the state reached after `epoch` epochs.
    pub fn save_checkpoint(&self, manager: &CheckpointManager, epoch: usize) -> Result<PathBuf> {
        manager.save(epoch, &self.backbone, &self.optimizer)
    }

    /// Restores the backbone and optimizer state saved at `path`.
    pub fn load_checkpoint(self, path: &Path, device: &B::Device) -> Result<Self> {
        let (backbone, optimizer) = checkpoint::load(path, self.backbone, self.optimizer, device)?;
        Ok(Self {
            backbone,
            optimizer,
            ..self
        })
    }
}

/// Inputs of one training step: the batch with its sampled timesteps and noise.
struct StepInputs<B: Backend> {
    condition: Tensor<B, 4>,
    target: Tensor<B, 4>,
    noise: Tensor<B, 4>,
    timesteps: Vec<usize>,
}

impl<B: Backend> StepInputs<B> {
    fn to_backend<H: Backend>(self, device: &H::Device) -> StepInputs<H> {
        StepInputs {
            condition: convert::<B, H>(self.condition, device),
            target: convert::<B, H>(self.target, device),
            noise: convert::<B, H>(self.noise, device),
            timesteps: self.timesteps,
        }
    }
}

fn convert<B: Backend, H: Backend>(tensor: Tensor<B, 4>, device: &H::Device) -> Tensor<H, 4> {
    Tensor::from_data(tensor.into_data().convert::<H::FloatElem>(), device)
}

/// Loss of a global batch, the sum over the replicas of their shard losses
/// reduced by the global batch size. The metrics are accumulated on the host
/// in `f64` whatever the float type of `B`.
fn batch_losses<B, M>(
    diffusion: &GaussianDiffusion,
    replicas: Replicas,
    backbone: &M,
    inputs: StepInputs<B>,
) -> Result<(Tensor<B, 1>, StepMetrics)>
where
    B: Backend,
    M: DenoisingBackbone<B>,
{
    let StepInputs {
        condition,
        target,
        noise,
        timesteps,
    } = inputs;
    let [batch_size, _, _, _] = target.dims();
    let shards = replicas.shards(batch_size)?;

    let mut losses = Vec::with_capacity(shards.len());
    let mut sums = HostSums::default();
    for range in shards {
        let target = shard(target.clone(), range.clone());
        let terms = diffusion.training_losses(
            backbone,
            shard(condition.clone(), range.clone()),
            target.clone(),
            &timesteps[range.clone()],
            shard(noise.clone(), range),
        )?;

        let error = terms.pred_x0 - target.detach();
        sums.x0_mse += to_host(mean_flat(error.clone() * error)).iter().sum::<f64>();
        sums.mse += to_host(terms.mse.detach()).iter().sum::<f64>();
        if let Some(vb) = terms.vb {
            sums.vb = Some(sums.vb.unwrap_or(0.0) + to_host(vb.detach()).iter().sum::<f64>());
        }
        sums.loss += to_host(terms.loss.clone().detach()).iter().sum::<f64>();
        losses.push(terms.loss);
    }

    let loss = replicas
        .reduce(losses, batch_size)
        .ok_or_else(|| DiffusionError::config("empty batch"))?;
    Ok((loss, sums.metrics(batch_size)))
}

#[derive(Default)]
struct HostSums {
    loss: f64,
    mse: f64,
    x0_mse: f64,
    vb: Option<f64>,
}

impl HostSums {
    fn metrics(self, batch_size: usize) -> StepMetrics {
        let batch_size = batch_size as f64;
        StepMetrics {
            loss: self.loss / batch_size,
            mse: self.mse / batch_size,
            x0_mse: self.x0_mse / batch_size,
            vb: self.vb.map(|vb| vb / batch_size),
            skipped: false,
        }
    }
}

/// Scaled gradients of the batch loss, none when the loss is not finite.
fn backward<B, M>(
    diffusion: &GaussianDiffusion,
    replicas: Replicas,
    scaler: &LossScaler,
    backbone: &M,
    inputs: StepInputs<B>,
) -> Result<(Option<GradientsParams>, StepMetrics)>
where
    B: AutodiffBackend,
    M: DenoisingBackbone<B> + AutodiffModule<B>,
{
    let (loss, metrics) = batch_losses(diffusion, replicas, backbone, inputs)?;
    if !metrics.loss.is_finite() {
        return Ok((None, metrics));
    }
    let grads = scaler.scale_loss(loss).backward();
    Ok((Some(GradientsParams::from_grads(grads, backbone)), metrics))
}

/// Backward pass of a master backbone `M` on a reduced precision copy.
trait HalfPrecisionPass<B: AutodiffBackend, M> {
    fn backward(
        &mut self,
        master: &M,
        diffusion: &GaussianDiffusion,
        replicas: Replicas,
        scaler: &LossScaler,
        inputs: StepInputs<B>,
    ) -> Result<(Option<GradientsParams>, StepMetrics)>;
}

impl<B, M, H, MH> HalfPrecisionPass<B, M> for HalfPrecision<H, MH>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    H: AutodiffBackend,
    MH: DenoisingBackbone<H> + AutodiffModule<H>,
{
    fn backward(
        &mut self,
        master: &M,
        diffusion: &GaussianDiffusion,
        replicas: Replicas,
        scaler: &LossScaler,
        inputs: StepInputs<B>,
    ) -> Result<(Option<GradientsParams>, StepMetrics)> {
        self.sync::<B, M>(master)?;
        let inputs = inputs.to_backend::<H>(self.device());
        let (grads, metrics) = backward(diffusion, replicas, scaler, self.module(), inputs)?;
        let grads = grads.map(|grads| transfer_gradients::<H, B, M>(grads, master));
        Ok((grads, metrics))
    }
}

fn mean<B: Backend>(values: Tensor<B, 1>) -> f64 {
    let [batch_size] = values.dims();
    scalar(reduce_global(values, batch_size))
}
