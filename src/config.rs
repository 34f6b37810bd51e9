//! Run configuration.
//!
//! Every hyperparameter of a run lives in one [`TrainingConfig`], built once by
//! the command line and saved as `config.json` next to the checkpoints so a
//! restore always sees the diffusion process it was trained with.

use std::path::Path;
use std::process::Command;

use burn::config::Config;

use crate::data::DatasetConfig;
use crate::diffusion::loss::LossWeightingKind;
use crate::error::{DiffusionError, Result};
use crate::models::UnetConfig;
use crate::schedulers::{BetaSchedule, VarianceType};
use crate::training::lr::LrConfig;
use crate::training::optimizer::OptimizerKind;

/// Name of the run configuration file inside a run directory.
pub const CONFIG_FILE: &str = "config.json";

/// The diffusion process: schedule, variance and loss policies.
#[derive(Config, Debug)]
pub struct DiffusionConfig {
    /// Number of diffusion steps during training.
    #[config(default = 600)]
    pub time_steps: usize,
    /// Number of steps of the respaced sampling process, all of them when unset.
    pub sampling_steps: Option<usize>,
    #[config(default = "BetaSchedule::Cosine")]
    pub beta_schedule: BetaSchedule,
    #[config(default = "VarianceType::UpperBound")]
    pub variance_type: VarianceType,
    #[config(default = "LossWeightingKind::P2")]
    pub loss_weighting: LossWeightingKind,
    #[config(default = 1.0)]
    pub p2_k: f64,
    #[config(default = 0.5)]
    pub p2_gamma: f64,
    /// Weight of the variational bound under learned variance.
    #[config(default = 0.001)]
    pub lambda_vlb: f64,
    /// Channels of the generated sample.
    #[config(default = 1)]
    pub channels: usize,
    /// Clip the clean sample estimate to [-1, 1] while sampling.
    #[config(default = true)]
    pub clip_denoised: bool,
}

impl DiffusionConfig {
    pub fn sampling_steps(&self) -> usize {
        self.sampling_steps.unwrap_or(self.time_steps)
    }

    /// Output channels the backbone must produce.
    pub fn output_channels(&self) -> usize {
        self.variance_type.output_channels(self.channels)
    }

    pub fn validate(&self) -> Result<()> {
        if self.time_steps == 0 {
            return Err(DiffusionError::config("time_steps must be positive"));
        }
        let sampling_steps = self.sampling_steps();
        if sampling_steps == 0 || sampling_steps > self.time_steps {
            return Err(DiffusionError::config(format!(
                "sampling_steps must be in 1..={}, got {sampling_steps}",
                self.time_steps
            )));
        }
        if self.channels == 0 {
            return Err(DiffusionError::config("channels must be positive"));
        }
        if self.p2_gamma < 0.0 || self.p2_k < 0.0 || self.lambda_vlb < 0.0 {
            return Err(DiffusionError::config(
                "p2_k, p2_gamma and lambda_vlb must not be negative",
            ));
        }
        Ok(())
    }
}

#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub diffusion: DiffusionConfig,
    pub unet: UnetConfig,
    pub dataset: DatasetConfig,
    pub lr: LrConfig,
    #[config(default = "OptimizerKind::Adam")]
    pub optimizer: OptimizerKind,
    /// Overrides the learning rate looked up from the model width.
    pub learning_rate: Option<f64>,
    /// Weight decay of adamW and sgdW, four times the learning rate when unset.
    pub weight_decay: Option<f64>,
    /// Total number of epochs, including those of a restored run.
    #[config(default = 100)]
    pub epochs: usize,
    /// Examples per replica, the global batch is `batch_size * replicas`.
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 1)]
    pub replicas: usize,
    /// Dynamic loss scaling, with the passes in f16 on the torch backend.
    #[config(default = false)]
    pub mixed_precision: bool,
    #[config(default = 5)]
    pub test_frequency: usize,
    #[config(default = 50)]
    pub sample_frequency: usize,
    #[config(default = 50)]
    pub checkpoint_frequency: usize,
    /// Number of checkpoints kept on disk.
    #[config(default = 10)]
    pub max_to_keep: usize,
    #[config(default = 1911)]
    pub seed: u64,
    /// Seed of the illustration samples, fixed across epochs.
    #[config(default = 42)]
    pub illustration_seed: u64,
    /// Checkpoint directory to resume from.
    pub restore: Option<String>,
    /// Source revision the run was started from.
    pub revision: Option<String>,
}

impl TrainingConfig {
    /// Learning rate of the run: the explicit value, or the default of the
    /// model width, scaled up for yogi.
    pub fn learning_rate(&self) -> f64 {
        if let Some(learning_rate) = self.learning_rate {
            return learning_rate;
        }
        let learning_rate = match self.unet.base_dim {
            64 => 2e-5,
            96 => 6e-5,
            128 => 1e-4,
            _ => 1e-4,
        };
        match self.optimizer {
            OptimizerKind::Yogi => learning_rate * 5.0,
            _ => learning_rate,
        }
    }

    pub fn global_batch_size(&self) -> usize {
        self.batch_size * self.replicas
    }

    pub fn weight_decay(&self) -> f64 {
        self.weight_decay.unwrap_or_else(|| 4.0 * self.learning_rate())
    }

    /// Checks every cross-field constraint before anything is built.
    pub fn validate(&self) -> Result<()> {
        self.diffusion.validate()?;
        self.unet.validate()?;
        if self.unet.channels != self.diffusion.channels {
            return Err(DiffusionError::config(format!(
                "the backbone generates {} channels, the diffusion process {}",
                self.unet.channels, self.diffusion.channels
            )));
        }
        if self.unet.out_channels() != self.diffusion.output_channels() {
            return Err(DiffusionError::config(format!(
                "variance type {} requires {} output channels, the backbone has {}",
                self.diffusion.variance_type,
                self.diffusion.output_channels(),
                self.unet.out_channels()
            )));
        }
        let multiple = self.unet.resolution_multiple();
        if self.dataset.height % multiple != 0 || self.dataset.sample_width() % multiple != 0 {
            return Err(DiffusionError::config(format!(
                "a {}x{} sample cannot be downsampled {} times, both sides must be multiples of {multiple}",
                self.dataset.height,
                self.dataset.sample_width(),
                self.unet.dim_mults.len() - 1
            )));
        }
        self.validate_schedule()
    }

    /// Checks the parameters of the epoch loop: batch sizes, cadences and
    /// the learning rate policy.
    pub fn validate_schedule(&self) -> Result<()> {
        if self.batch_size == 0 || self.replicas == 0 {
            return Err(DiffusionError::config(
                "batch_size and replicas must be positive",
            ));
        }
        if self.epochs == 0 {
            return Err(DiffusionError::config("epochs must be positive"));
        }
        if self.test_frequency == 0 || self.sample_frequency == 0 || self.checkpoint_frequency == 0
        {
            return Err(DiffusionError::config("cadences must be positive"));
        }
        if self.max_to_keep == 0 {
            return Err(DiffusionError::config("max_to_keep must be positive"));
        }
        let learning_rate = self.learning_rate();
        if !learning_rate.is_finite() || learning_rate <= 0.0 {
            return Err(DiffusionError::config("the learning rate must be positive"));
        }
        self.lr.validate()
    }

    /// Records the current source revision and writes `config.json` in `dir`.
    pub fn save_run(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let config = self.clone().with_revision(self.revision.clone().or_else(git_revision));
        config.save(dir.join(CONFIG_FILE))?;
        Ok(())
    }

    pub fn load_run(dir: &Path) -> Result<Self> {
        TrainingConfig::load(dir.join(CONFIG_FILE))
            .map_err(|error| DiffusionError::config(format!("{error}")))
    }
}

/// `git rev-parse HEAD` of the working directory, when available.
fn git_revision() -> Option<String> {
    let output = Command::new("git").args(["rev-parse", "HEAD"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let revision = String::from_utf8(output.stdout).ok()?;
    Some(revision.trim().to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_config() -> TrainingConfig {
        TrainingConfig::new(
            DiffusionConfig::new(),
            UnetConfig::new(),
            DatasetConfig::new(),
            LrConfig::new(),
        )
    }

    #[test]
    fn test_default_learning_rate_follows_width() {
        let config = test_config();
        let with_width = |width: usize| {
            let mut config = config.clone();
            config.unet = UnetConfig::new().with_base_dim(width);
            config
        };

        assert_eq!(with_width(64).learning_rate(), 2e-5);
        assert_eq!(with_width(96).learning_rate(), 6e-5);
        assert_eq!(with_width(128).learning_rate(), 1e-4);
        assert_eq!(with_width(32).learning_rate(), 1e-4);
        let yogi = with_width(64).with_optimizer(OptimizerKind::Yogi);
        assert!((yogi.learning_rate() - 1e-4).abs() < 1e-12);
        assert_eq!(with_width(64).with_learning_rate(Some(3e-4)).learning_rate(), 3e-4);
    }

    #[test]
    fn test_default_weight_decay() {
        let config = test_config().with_learning_rate(Some(1e-4));

        assert!((config.weight_decay() - 4e-4).abs() < 1e-12);
        assert_eq!(config.with_weight_decay(Some(0.0)).weight_decay(), 0.0);
    }

    #[test]
    fn test_validate_variance_channels() {
        assert!(test_config().validate().is_ok());

        let mut learned = test_config();
        learned.diffusion = DiffusionConfig::new().with_variance_type(VarianceType::LearnedRange);
        assert!(matches!(learned.validate(), Err(DiffusionError::Config(_))));

        learned.unet = learned.unet.clone().with_learned_variance(true);
        assert!(learned.validate().is_ok());
    }

    #[test]
    fn test_validate_batch_and_steps() {
        let config = test_config().with_batch_size(8).with_replicas(4);
        assert!(config.validate().is_ok());
        assert_eq!(config.global_batch_size(), 32);
        assert!(test_config().with_replicas(0).validate().is_err());
        let mut oversampled = test_config();
        oversampled.diffusion = DiffusionConfig::new().with_sampling_steps(Some(2000));
        assert!(oversampled.validate().is_err());
    }

    #[test]
    fn test_validate_resolution() {
        let mut config = test_config();
        config.dataset = DatasetConfig::new().with_crop_width_half(true);
        assert!(config.validate().is_ok());

        config.dataset = DatasetConfig::new().with_width(60);
        assert!(matches!(config.validate(), Err(DiffusionError::Config(_))));
    }

    #[test]
    fn test_run_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config()
            .with_epochs(7)
            .with_revision(Some("abc123".to_string()));

        config.save_run(dir.path()).unwrap();
        let loaded = TrainingConfig::load_run(dir.path()).unwrap();

        assert_eq!(loaded.epochs, 7);
        assert_eq!(loaded.revision.as_deref(), Some("abc123"));
        assert_eq!(loaded.diffusion.beta_schedule, BetaSchedule::Cosine);
        assert_eq!(loaded.diffusion.loss_weighting, LossWeightingKind::P2);
    }
}
