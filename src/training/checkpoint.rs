//! Checkpoints of the backbone and the optimizer.
//!
//! Each checkpoint is a directory `ckpt-<epoch>` holding `model.mpk` and
//! `optimizer.mpk`. The trailing integer of the directory name is the epoch a
//! restored run resumes from.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::{AutodiffModule, Module};
use burn::tensor::backend::{AutodiffBackend, Backend};
use tracing::{debug, info};

use super::optimizer::{CheckpointRecorder, TrainOptimizer};
use crate::error::{DiffusionError, Result};

const PREFIX: &str = "ckpt-";
const MODEL_FILE: &str = "model";
const OPTIMIZER_FILE: &str = "optimizer";

/// Writes checkpoints into one directory and keeps the newest `max_to_keep`.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    directory: PathBuf,
    max_to_keep: usize,
}

impl CheckpointManager {
    pub fn new(directory: impl Into<PathBuf>, max_to_keep: usize) -> Self {
        Self {
            directory: directory.into(),
            max_to_keep: max_to_keep.max(1),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.directory.join(format!("{PREFIX}{epoch}"))
    }

    /// Saves the checkpoint reached after `epoch` epochs and prunes old ones.
    pub fn save<B: AutodiffBackend, M: AutodiffModule<B>>(
        &self,
        epoch: usize,
        model: &M,
        optimizer: &TrainOptimizer<B, M>,
    ) -> Result<PathBuf> {
        let path = self.checkpoint_path(epoch);
        fs::create_dir_all(&path)?;

        model
            .clone()
            .save_file(path.join(MODEL_FILE), &CheckpointRecorder::new())?;
        optimizer.save(path.join(OPTIMIZER_FILE))?;
        info!("Saved checkpoint {}", path.display());

        self.prune()?;
        Ok(path)
    }

    /// Checkpoints on disk, oldest first.
    pub fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.directory.exists() {
            return Ok(Vec::new());
        }
        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let is_checkpoint = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(PREFIX));
            if let (true, Ok(epoch)) = (is_checkpoint, epoch_from_path(&path)) {
                checkpoints.push((epoch, path));
            }
        }
        checkpoints.sort();
        Ok(checkpoints)
    }

    pub fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.list()?.pop().map(|(_, path)| path))
    }

    fn prune(&self) -> Result<()> {
        let checkpoints = self.list()?;
        let excess = checkpoints.len().saturating_sub(self.max_to_keep);
        for (_, path) in checkpoints.into_iter().take(excess) {
            debug!("Removing checkpoint {}", path.display());
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }
}

/// Epoch encoded as the trailing integer of a checkpoint path, `…/ckpt-50` is 50.
pub fn epoch_from_path(path: &Path) -> Result<usize> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| DiffusionError::config(format!("invalid checkpoint path {path:?}")))?;

    name.rsplit('-')
        .next()
        .and_then(|epoch| epoch.parse().ok())
        .ok_or_else(|| {
            DiffusionError::config(format!(
                "checkpoint {name} does not end with an epoch number"
            ))
        })
}

/// Loads the backbone parameters of the checkpoint at `path` into `model`.
pub fn load_model<B: Backend, M: Module<B>>(path: &Path, model: M, device: &B::Device) -> Result<M> {
    let model = model.load_file(path.join(MODEL_FILE), &CheckpointRecorder::new(), device)?;
    Ok(model)
}

/// Restores both the backbone and the optimizer state.
pub fn load<B: AutodiffBackend, M: AutodiffModule<B>>(
    path: &Path,
    model: M,
    optimizer: TrainOptimizer<B, M>,
    device: &B::Device,
) -> Result<(M, TrainOptimizer<B, M>)> {
    let model = load_model(path, model, device)?;
    let optimizer = optimizer.load(path.join(OPTIMIZER_FILE), device)?;
    Ok((model, optimizer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::optimizer::OptimizerKind;
    use crate::TestAutodiffBackend;
    use burn::nn::{Linear, LinearConfig};
    use burn::optim::GradientsParams;
    use burn::tensor::{Distribution, Tensor};

    type Model = Linear<TestAutodiffBackend>;

    #[test]
    fn test_epoch_from_path() {
        assert_eq!(epoch_from_path(Path::new("runs/a/checkpoints/ckpt-50")).unwrap(), 50);
        assert_eq!(epoch_from_path(Path::new("ckpt-7")).unwrap(), 7);
        assert!(epoch_from_path(Path::new("runs/latest")).is_err());
    }

    #[test]
    fn test_retention_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let manager = CheckpointManager::new(dir.path(), 2);
        let model: Model = LinearConfig::new(2, 2).init(&device);
        let optimizer = TrainOptimizer::<TestAutodiffBackend, Model>::new(OptimizerKind::Adam, 0.0);

        for epoch in [5, 10, 15] {
            manager.save(epoch, &model, &optimizer).unwrap();
        }

        let kept: Vec<usize> = manager.list().unwrap().into_iter().map(|(e, _)| e).collect();
        assert_eq!(kept, vec![10, 15]);
        assert_eq!(manager.latest().unwrap(), Some(manager.checkpoint_path(15)));
    }

    #[test]
    fn test_round_trip_reproduces_predictions_and_optimizer() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let manager = CheckpointManager::new(dir.path(), 10);
        let mut model: Model = LinearConfig::new(3, 2).init(&device);
        let mut optimizer =
            TrainOptimizer::<TestAutodiffBackend, Model>::new(OptimizerKind::Adam, 0.0);
        let input: Tensor<TestAutodiffBackend, 2> =
            Tensor::random([4, 3], Distribution::Default, &device);

        // One update so the optimizer has moments to persist.
        let grads = model.forward(input.clone()).sum().backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optimizer.step(1e-2, model, grads);
        let path = manager.save(1, &model, &optimizer).unwrap();

        let fresh: Model = LinearConfig::new(3, 2).init(&device);
        let fresh_optimizer =
            TrainOptimizer::<TestAutodiffBackend, Model>::new(OptimizerKind::Adam, 0.0);
        let (mut restored, mut restored_optimizer) =
            load(&path, fresh, fresh_optimizer, &device).unwrap();

        restored
            .forward(input.clone())
            .into_data()
            .assert_approx_eq(&model.forward(input.clone()).into_data(), 6);

        // Identical state means identical next updates.
        let step = |model: Model, optimizer: &mut TrainOptimizer<TestAutodiffBackend, Model>| {
            let grads = model.forward(input.clone()).sum().backward();
            let grads = GradientsParams::from_grads(grads, &model);
            optimizer.step(1e-2, model, grads)
        };
        model = step(model, &mut optimizer);
        restored = step(restored, &mut restored_optimizer);
        restored
            .forward(input.clone())
            .into_data()
            .assert_approx_eq(&model.forward(input).into_data(), 5);
    }
}
