use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use depth_diffusion::config::{DiffusionConfig, TrainingConfig};
use depth_diffusion::data::DatasetConfig;
use depth_diffusion::diffusion::{DiffusionModel, LossWeightingKind};
use depth_diffusion::models::unet_2d_blocks::DownsampleKind;
use depth_diffusion::models::{ConditionalUnet, UnetConfig};
use depth_diffusion::schedulers::{BetaSchedule, VarianceType};
use depth_diffusion::training::lr::{LrConfig, LrDecay};
use depth_diffusion::training::{
    data_loaders, OptimizerKind, Replicas, RunDirectory, TrainOptimizer, Trainer,
};

use super::TrainBackend;

type TrainModel = DiffusionModel<TrainBackend, ConditionalUnet<TrainBackend>>;

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Number of timesteps of the forward and reverse processes.
    #[arg(short = 't', long, default_value_t = 600)]
    time_steps: usize,

    /// Number of steps used for sampling.
    #[arg(short = 's', long, default_value_t = 600)]
    sampling_steps: usize,

    #[arg(short = 'e', long, default_value_t = 100)]
    epochs: usize,

    /// Examples per replica.
    #[arg(short = 'b', long, default_value_t = 16)]
    batch_size: usize,

    /// Number of data parallel replicas sharing a global batch.
    #[arg(long, default_value_t = 1)]
    replicas: usize,

    /// Center crops the samples to half their width.
    #[arg(long)]
    crop_width_half: bool,

    /// Channels of the first UNet level.
    #[arg(long, default_value_t = 64)]
    model_basedim: usize,

    /// Multipliers of the base channels, one per UNet level.
    #[arg(long, num_args = 1.., default_values_t = [1, 2, 4, 8])]
    model_dim_multiplier: Vec<usize>,

    /// Whether a level ends with linear attention, 1 or 0 per level.
    #[arg(long, num_args = 1.., default_values_t = [1, 1, 1, 1])]
    model_attention_blocks: Vec<u8>,

    /// Residual blocks per level.
    #[arg(long, default_value_t = 2)]
    model_num_res_blocks: usize,

    #[arg(long, default_value = "conv")]
    down_sampling: DownsampleKind,

    /// Loss weighting, P2 or simple.
    #[arg(short = 'l', long, default_value = "P2")]
    loss_weighting: LossWeightingKind,

    /// lower_bound, upper_bound, learned or learned_range.
    #[arg(short = 'v', long, default_value = "upper_bound")]
    variance: VarianceType,

    /// cosine, linear or sigmoid.
    #[arg(long, default_value = "cosine")]
    beta_schedule: BetaSchedule,

    #[arg(short = 'd', long, default_value = "v_human_rendered")]
    dataset: String,

    /// Spatial resolution of the samples, height then width.
    #[arg(long, num_args = 2, default_values_t = [64, 64])]
    height_width: Vec<usize>,

    /// Number of training pairs to read, all of them when unset.
    #[arg(long)]
    number_samples_train: Option<usize>,

    #[arg(long)]
    number_samples_test: Option<usize>,

    /// Dynamic loss scaling, with the passes in f16 on the torch backend.
    #[arg(short = 'm', long)]
    mixed_precision: bool,

    /// Checkpoint directory to resume from, e.g. `.../checkpoints/ckpt-50`.
    #[arg(short = 'c', long, value_name = "DIR")]
    checkpoint_path_to_restore: Option<String>,

    #[arg(long, default_value_t = 50)]
    sample_frequency: usize,

    #[arg(long, default_value_t = 5)]
    test_frequency: usize,

    #[arg(long, default_value_t = 50)]
    checkpoint_period: usize,

    /// adam, adamW, yogi, sgd or sgdW.
    #[arg(long, default_value = "adam")]
    optimizer: OptimizerKind,

    /// linear, cosine, cosine_restart, step or exponential.
    #[arg(long)]
    learning_rate_decay: Option<LrDecay>,

    #[arg(long, default_value_t = 0)]
    warm_up_epochs: usize,

    /// Weight decay of adamW and sgdW, four times the learning rate by default.
    #[arg(long)]
    weight_decay: Option<f64>,

    /// Derived from the model width when unset.
    #[arg(long)]
    learning_rate: Option<f64>,

    /// Random horizontal flips of the training pairs.
    #[arg(long)]
    apply_flip: bool,

    #[arg(long, default_value_t = 4)]
    num_workers: usize,

    /// Base directory of the datasets and the output runs.
    #[arg(long, default_value = ".")]
    base_dir: String,

    /// Name of the output directory, the current unix time by default.
    #[arg(long)]
    outdir_name: Option<String>,

    #[arg(long, default_value_t = 1911)]
    seed: u64,
}

impl TrainArgs {
    fn config(&self) -> TrainingConfig {
        let diffusion = DiffusionConfig::new()
            .with_time_steps(self.time_steps)
            .with_sampling_steps(Some(self.sampling_steps))
            .with_beta_schedule(self.beta_schedule)
            .with_variance_type(self.variance)
            .with_loss_weighting(self.loss_weighting);

        let unet = UnetConfig::new()
            .with_base_dim(self.model_basedim)
            .with_dim_mults(self.model_dim_multiplier.clone())
            .with_attention_levels(
                self.model_attention_blocks
                    .iter()
                    .map(|&enabled| enabled != 0)
                    .collect(),
            )
            .with_num_res_blocks(self.model_num_res_blocks)
            .with_downsampling(self.down_sampling)
            .with_learned_variance(self.variance.is_learned());

        let (height, width) = match self.height_width.as_slice() {
            [height, width] => (*height, *width),
            _ => (64, 64),
        };
        let dataset = DatasetConfig::new()
            .with_base_dir(self.base_dir.clone())
            .with_dataset(self.dataset.clone())
            .with_height(height)
            .with_width(width)
            .with_crop_width_half(self.crop_width_half)
            .with_flip(self.apply_flip)
            .with_limit_train(self.number_samples_train)
            .with_limit_test(self.number_samples_test)
            .with_num_workers(self.num_workers);

        let lr = LrConfig::new()
            .with_decay(self.learning_rate_decay)
            .with_warmup_epochs(self.warm_up_epochs);

        TrainingConfig::new(diffusion, unet, dataset, lr)
            .with_optimizer(self.optimizer)
            .with_learning_rate(self.learning_rate)
            .with_weight_decay(self.weight_decay)
            .with_epochs(self.epochs)
            .with_batch_size(self.batch_size)
            .with_replicas(self.replicas)
            .with_mixed_precision(self.mixed_precision)
            .with_test_frequency(self.test_frequency)
            .with_sample_frequency(self.sample_frequency)
            .with_checkpoint_frequency(self.checkpoint_period)
            .with_seed(self.seed)
            .with_restore(self.checkpoint_path_to_restore.clone())
    }
}

pub fn handle_train(args: &TrainArgs) -> Result<()> {
    let config = args.config();
    config.validate()?;

    let run = RunDirectory::under(Path::new(&args.base_dir), args.outdir_name.as_deref());
    run.create()
        .with_context(|| format!("creating {}", run.root().display()))?;
    config.save_run(run.root())?;
    info!("Run directory {}", run.root().display());
    info!(
        learning_rate = config.learning_rate(),
        global_batch_size = config.global_batch_size(),
        optimizer = %config.optimizer,
        "Training for {} epochs",
        config.epochs
    );

    let device = Default::default();
    let backbone = config.unet.init::<TrainBackend>(&device);
    let optimizer = TrainOptimizer::new(config.optimizer, config.weight_decay());
    let model = DiffusionModel::new(
        backbone,
        optimizer,
        &config.diffusion,
        Replicas::new(config.replicas)?,
        config.mixed_precision,
    )?;
    let model = half_precision(model, &config, &device)?;
    let (train, test) = data_loaders::<TrainBackend>(&config, &device)?;

    let trainer = Trainer::new(&config, run);
    let (trainer, model) = match &config.restore {
        Some(path) => trainer.restore(model, Path::new(path), &device)?,
        None => (trainer, model),
    };
    trainer.fit(model, train, test)?;

    Ok(())
}

#[cfg(all(feature = "torch", not(feature = "ndarray")))]
fn half_precision(
    model: TrainModel,
    config: &TrainingConfig,
    device: &<TrainBackend as burn::tensor::backend::Backend>::Device,
) -> Result<TrainModel> {
    use super::HalfBackend;

    if !config.mixed_precision {
        return Ok(model);
    }
    info!("Forward and backward passes in f16, weights in f32");
    let backbone = config.unet.init::<HalfBackend>(device);
    Ok(model.with_half_precision::<HalfBackend, _>(backbone, device.clone())?)
}

#[cfg(not(all(feature = "torch", not(feature = "ndarray"))))]
fn half_precision(
    model: TrainModel,
    config: &TrainingConfig,
    _device: &<TrainBackend as burn::tensor::backend::Backend>::Device,
) -> Result<TrainModel> {
    if config.mixed_precision {
        tracing::warn!("No f16 backend is enabled, mixed precision only scales the loss");
    }
    Ok(model)
}
