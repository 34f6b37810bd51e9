//! Epoch loop of a training run.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use super::checkpoint::{epoch_from_path, CheckpointManager};
use super::illustration::write_illustration;
use crate::config::TrainingConfig;
use crate::data::{DepthBatch, DepthBatcher, DepthDataset};
use crate::diffusion::{DiffusionModel, StepMetrics};
use crate::error::Result;
use crate::models::DenoisingBackbone;

const CHECKPOINT_DIR: &str = "checkpoints";
const ILLUSTRATION_DIR: &str = "illustrations";

/// Output directory of a run: `config.json`, `checkpoints/` and `illustrations/`.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    root: PathBuf,
}

impl RunDirectory {
    /// `<base_dir>/output_runs/DepthDiffusion/<name>`, named after the current
    /// unix time when no name is given.
    pub fn under(base_dir: &Path, name: Option<&str>) -> Self {
        let name = match name {
            Some(name) => name.to_string(),
            None => std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or_default()
                .to_string(),
        };
        Self::new(base_dir.join("output_runs").join("DepthDiffusion").join(name))
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(self.checkpoints())?;
        fs::create_dir_all(self.illustrations())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoints(&self) -> PathBuf {
        self.root.join(CHECKPOINT_DIR)
    }

    pub fn illustrations(&self) -> PathBuf {
        self.root.join(ILLUSTRATION_DIR)
    }

    pub fn illustration(&self, epoch: usize) -> PathBuf {
        self.illustrations().join(format!("epoch-{epoch}.png"))
    }
}

/// Train and test loaders of the configured dataset.
///
/// The train stream is shuffled and augmented, the test stream is neither.
/// Both yield global batches.
#[allow(clippy::type_complexity)]
pub fn data_loaders<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<(
    Arc<dyn DataLoader<DepthBatch<B>>>,
    Arc<dyn DataLoader<DepthBatch<B::InnerBackend>>>,
)> {
    let dataset = &config.dataset;
    let train = DataLoaderBuilder::new(
        DepthBatcher::<B>::new(device.clone())
            .with_flip(dataset.flip)
            .with_seed(config.seed),
    )
    .batch_size(config.global_batch_size())
    .shuffle(config.seed)
    .num_workers(dataset.num_workers)
    .build(DepthDataset::train(dataset)?);

    let test = DataLoaderBuilder::new(DepthBatcher::<B::InnerBackend>::new(device.clone()))
        .batch_size(config.global_batch_size())
        .num_workers(dataset.num_workers)
        .build(DepthDataset::test(dataset)?);

    Ok((train, test))
}

/// Running means of the metrics of an epoch.
#[derive(Debug, Default, Clone)]
struct MetricsMean {
    steps: usize,
    loss: f64,
    mse: f64,
    x0_mse: f64,
    vb: f64,
    vb_steps: usize,
    skipped: usize,
}

impl MetricsMean {
    fn push(&mut self, metrics: &StepMetrics) {
        self.steps += 1;
        self.loss += metrics.loss;
        self.mse += metrics.mse;
        self.x0_mse += metrics.x0_mse;
        if let Some(vb) = metrics.vb {
            self.vb += vb;
            self.vb_steps += 1;
        }
        if metrics.skipped {
            self.skipped += 1;
        }
    }

    fn mean(&self, value: f64) -> f64 {
        value / self.steps.max(1) as f64
    }

    fn log(&self, stage: &str, epoch: usize) {
        let vb = (self.vb_steps > 0).then(|| self.vb / self.vb_steps as f64);
        info!(
            epoch,
            steps = self.steps,
            loss = self.mean(self.loss),
            mse = self.mean(self.mse),
            x0_mse = self.mean(self.x0_mse),
            vb = ?vb,
            skipped = self.skipped,
            "{stage}"
        );
    }
}

pub struct Trainer<'a> {
    config: &'a TrainingConfig,
    run: RunDirectory,
    checkpoints: CheckpointManager,
    epoch_offset: usize,
}

impl<'a> Trainer<'a> {
    pub fn new(config: &'a TrainingConfig, run: RunDirectory) -> Self {
        let checkpoints = CheckpointManager::new(run.checkpoints(), config.max_to_keep);
        Self {
            config,
            run,
            checkpoints,
            epoch_offset: 0,
        }
    }

    /// First epoch of the run, the number of epochs a restored checkpoint
    /// was trained for.
    pub fn with_epoch_offset(mut self, epoch_offset: usize) -> Self {
        self.epoch_offset = epoch_offset;
        self
    }

    pub fn epoch_offset(&self) -> usize {
        self.epoch_offset
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Loads the checkpoint at `path` into `model` and resumes after the epoch
    /// its name ends with.
    pub fn restore<B, M>(
        self,
        model: DiffusionModel<B, M>,
        path: &Path,
        device: &B::Device,
    ) -> Result<(Self, DiffusionModel<B, M>)>
    where
        B: AutodiffBackend,
        M: DenoisingBackbone<B> + AutodiffModule<B>,
        M::InnerModule: DenoisingBackbone<B::InnerBackend>,
    {
        let epoch_offset = epoch_from_path(path)?;
        let model = model.load_checkpoint(path, device)?;
        info!("Restored {} at epoch {epoch_offset}", path.display());
        Ok((self.with_epoch_offset(epoch_offset), model))
    }

    /// Trains from the epoch offset up to the configured number of epochs.
    ///
    /// A failing batch aborts the run. Illustrations and checkpoints are
    /// written on their cadence and after the last epoch; failing to write
    /// one is logged and training goes on.
    pub fn fit<B, M>(
        &self,
        mut model: DiffusionModel<B, M>,
        train: Arc<dyn DataLoader<DepthBatch<B>>>,
        test: Arc<dyn DataLoader<DepthBatch<B::InnerBackend>>>,
    ) -> Result<DiffusionModel<B, M>>
    where
        B: AutodiffBackend,
        M: DenoisingBackbone<B> + AutodiffModule<B>,
        M::InnerModule: DenoisingBackbone<B::InnerBackend>,
    {
        let config = self.config;
        config.validate_schedule()?;
        let global_batch_size = config.global_batch_size();
        let lr_policy = config.lr.init(config.learning_rate(), config.epochs);
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(self.epoch_offset as u64));
        let illustration_batch = test.iter().next();
        if illustration_batch.is_none() {
            warn!("The test set is empty, no illustrations will be written");
        }

        if self.epoch_offset >= config.epochs {
            warn!(
                "Nothing to train: resuming at epoch {} of {}",
                self.epoch_offset, config.epochs
            );
        }

        for epoch in self.epoch_offset..config.epochs {
            let lr = lr_policy.rate(epoch);
            model.set_epoch(epoch);
            info!(epoch, lr, "Starting epoch {}/{}", epoch + 1, config.epochs);

            let mut train_metrics = MetricsMean::default();
            for batch in train.iter() {
                let [batch_size, _, _, _] = batch.target.dims();
                if batch_size != global_batch_size {
                    debug!("Dropping a partial batch of {batch_size}");
                    continue;
                }
                let metrics = model.train_step(batch.condition, batch.target, lr, &mut rng)?;
                train_metrics.push(&metrics);
            }
            train_metrics.log("train", epoch);

            let completed = epoch + 1;
            let last = completed == config.epochs;

            if completed % config.test_frequency == 0 {
                let mut test_metrics = MetricsMean::default();
                for batch in test.iter() {
                    let metrics = model.test_step(batch.condition, batch.target, &mut rng)?;
                    test_metrics.push(&metrics);
                }
                test_metrics.log("test", epoch);
            }

            if completed % config.sample_frequency == 0 || last {
                if let Some(batch) = &illustration_batch {
                    let generated =
                        model.sample(batch.condition.clone(), config.illustration_seed);
                    let path = self.run.illustration(completed);
                    match write_illustration(
                        &path,
                        batch.condition.clone(),
                        batch.target.clone(),
                        generated,
                    ) {
                        Ok(()) => info!("Wrote {}", path.display()),
                        Err(error) => warn!("Could not write {}: {error}", path.display()),
                    }
                }
            }

            if completed % config.checkpoint_frequency == 0 || last {
                if let Err(error) = model.save_checkpoint(&self.checkpoints, completed) {
                    warn!("Could not save the checkpoint of epoch {completed}: {error}");
                }
            }
        }

        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::config::DiffusionConfig;
    use crate::data::DatasetConfig;
    use crate::error::DiffusionError;
    use crate::models::testing::ConvBackbone;
    use crate::training::optimizer::{OptimizerKind, TrainOptimizer};
    use crate::training::replica::Replicas;
    use crate::TestAutodiffBackend;

    type Backbone = ConvBackbone<TestAutodiffBackend>;

    fn setup(epochs: usize) -> (tempfile::TempDir, TrainingConfig) {
        let dir = tempfile::tempdir().unwrap();
        let dataset = DatasetConfig::new()
            .with_base_dir(dir.path().to_string_lossy().to_string())
            .with_dataset("tiny".to_string())
            .with_height(4)
            .with_width(4)
            .with_flip(true)
            .with_num_workers(1);
        crate::data::write_pairs(&dataset.train_dir(), 5, 4, 4);
        crate::data::write_pairs(&dataset.test_dir(), 2, 4, 4);

        let mut config = test_config()
            .with_epochs(epochs)
            .with_batch_size(1)
            .with_replicas(2)
            .with_learning_rate(Some(1e-3))
            .with_test_frequency(1)
            .with_sample_frequency(2)
            .with_checkpoint_frequency(2);
        config.diffusion = DiffusionConfig::new().with_time_steps(8);
        config.dataset = dataset;
        (dir, config)
    }

    fn model(config: &TrainingConfig) -> DiffusionModel<TestAutodiffBackend, Backbone> {
        let device = Default::default();
        DiffusionModel::new(
            Backbone::new(4, 1, &device),
            TrainOptimizer::new(OptimizerKind::Adam, 0.0),
            &config.diffusion,
            Replicas::new(config.replicas).unwrap(),
            false,
        )
        .unwrap()
    }

    fn checkpoint_epochs(trainer: &Trainer) -> Vec<usize> {
        trainer
            .checkpoints()
            .list()
            .unwrap()
            .into_iter()
            .map(|(epoch, _)| epoch)
            .collect()
    }

    #[test]
    fn test_fit_writes_cadenced_outputs() {
        let (dir, config) = setup(3);
        let device = Default::default();
        let run = RunDirectory::new(dir.path().join("run"));
        run.create().unwrap();
        let (train, test) = data_loaders::<TestAutodiffBackend>(&config, &device).unwrap();
        let trainer = Trainer::new(&config, run.clone());

        let model = trainer.fit(model(&config), train, test).unwrap();

        // Two full batches of two per epoch, the fifth example is dropped.
        assert_eq!(model.step(), 6);
        assert_eq!(checkpoint_epochs(&trainer), vec![2, 3]);
        assert!(run.illustration(2).exists());
        assert!(run.illustration(3).exists());
        assert!(!run.illustration(1).exists());
    }

    #[test]
    fn test_restore_continues_from_checkpoint_epoch() {
        let (dir, config) = setup(2);
        let device = Default::default();
        let run = RunDirectory::new(dir.path().join("run"));
        run.create().unwrap();
        let (train, test) = data_loaders::<TestAutodiffBackend>(&config, &device).unwrap();
        let trainer = Trainer::new(&config, run.clone());
        trainer.fit(model(&config), train, test).unwrap();

        let config = config.with_epochs(4);
        let (train, test) = data_loaders::<TestAutodiffBackend>(&config, &device).unwrap();
        let (trainer, restored) = Trainer::new(&config, run.clone())
            .restore(model(&config), &run.checkpoints().join("ckpt-2"), &device)
            .unwrap();
        let restored = trainer.fit(restored, train, test).unwrap();

        assert_eq!(trainer.epoch_offset(), 2);
        assert_eq!(restored.step(), 4);
        assert_eq!(restored.epoch(), 3);
        assert_eq!(checkpoint_epochs(&trainer), vec![2, 4]);
    }

    #[test]
    fn test_failed_side_writes_do_not_abort() {
        let (dir, config) = setup(2);
        let device = Default::default();
        let run = RunDirectory::new(dir.path().join("run"));
        fs::create_dir_all(run.root()).unwrap();
        // Files where the output directories belong make every write fail.
        fs::write(run.illustrations(), b"").unwrap();
        fs::write(run.checkpoints(), b"").unwrap();
        let (train, test) = data_loaders::<TestAutodiffBackend>(&config, &device).unwrap();

        let model = Trainer::new(&config, run.clone())
            .fit(model(&config), train, test)
            .unwrap();

        assert_eq!(model.step(), 4);
        assert!(run.illustrations().is_file());
    }

    #[test]
    fn test_fit_rejects_zero_cadence() {
        let (dir, config) = setup(2);
        let device = Default::default();
        let (train, test) = data_loaders::<TestAutodiffBackend>(&config, &device).unwrap();
        let config = config.with_sample_frequency(0);
        let run = RunDirectory::new(dir.path().join("run"));

        let result = Trainer::new(&config, run).fit(model(&config), train, test);

        assert!(matches!(result, Err(DiffusionError::Config(_))));
    }

    #[test]
    fn test_run_directory_layout() {
        let run = RunDirectory::under(Path::new("/tmp/base"), Some("demo"));

        assert_eq!(
            run.root(),
            Path::new("/tmp/base/output_runs/DepthDiffusion/demo")
        );
        assert_eq!(run.checkpoints(), run.root().join("checkpoints"));
        assert_eq!(run.illustration(5), run.root().join("illustrations/epoch-5.png"));
    }
}
