//! Optimizers applying the gradient updates of the backbone.
//!
//! adam, adamW and sgd(W) come from burn; yogi is provided here as a
//! [`SimpleOptimizer`] so every optimizer is driven and recorded the same way.

use core::fmt;
use core::marker::PhantomData;
use core::str::FromStr;
use std::path::PathBuf;

use burn::config::Config;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamConfig, AdamWConfig, GradientsParams, Optimizer, SgdConfig, SimpleOptimizer};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Record, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};

/// Recorder of every checkpoint file.
pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Momentum of sgd and sgdW.
pub const SGD_MOMENTUM: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    #[serde(rename = "adam")]
    Adam,
    #[serde(rename = "adamW")]
    AdamW,
    #[serde(rename = "sgd")]
    Sgd,
    #[serde(rename = "sgdW")]
    SgdW,
    #[serde(rename = "yogi")]
    Yogi,
}

impl FromStr for OptimizerKind {
    type Err = DiffusionError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s {
            "adam" => Ok(OptimizerKind::Adam),
            "adamW" => Ok(OptimizerKind::AdamW),
            "sgd" => Ok(OptimizerKind::Sgd),
            "sgdW" => Ok(OptimizerKind::SgdW),
            "yogi" => Ok(OptimizerKind::Yogi),
            other => Err(DiffusionError::config(format!(
                "unknown optimizer '{other}', expected adam, adamW, sgd, sgdW or yogi"
            ))),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizerKind::Adam => "adam",
            OptimizerKind::AdamW => "adamW",
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::SgdW => "sgdW",
            OptimizerKind::Yogi => "yogi",
        };
        f.write_str(name)
    }
}

/// Configuration to create the [Yogi](Yogi) optimizer.
#[derive(Config)]
pub struct YogiConfig {
    #[config(default = 0.9)]
    beta_1: f32,
    #[config(default = 0.999)]
    beta_2: f32,
    #[config(default = 1e-3)]
    epsilon: f32,
    /// Starting value of the second moment estimate.
    #[config(default = 1e-6)]
    initial_accumulator: f32,
}

impl YogiConfig {
    pub fn init<B: AutodiffBackend, M: AutodiffModule<B>>(
        &self,
    ) -> OptimizerAdaptor<Yogi<B::InnerBackend>, M, B> {
        let optim = Yogi {
            beta_1: self.beta_1,
            beta_2: self.beta_2,
            epsilon: self.epsilon,
            initial_accumulator: self.initial_accumulator,
            _backend: PhantomData,
        };
        OptimizerAdaptor::from(optim)
    }
}

/// Adaptive Methods for Nonconvex Optimization, M. Zaheer and al, 2018.
///
/// Adam with an additive second moment update controlled by the sign of
/// `v - g^2`, which keeps the effective learning rate from growing abruptly.
#[derive(Clone)]
pub struct Yogi<B: Backend> {
    beta_1: f32,
    beta_2: f32,
    epsilon: f32,
    initial_accumulator: f32,
    _backend: PhantomData<B>,
}

/// Yogi state.
#[derive(Record, Clone)]
pub struct YogiState<B: Backend, const D: usize> {
    time: usize,
    moment_1: Tensor<B, D>,
    moment_2: Tensor<B, D>,
}

impl<B: Backend> SimpleOptimizer<B> for Yogi<B> {
    type State<const D: usize> = YogiState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: f64,
        tensor: Tensor<B, D>,
        grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        let (time, moment_1, moment_2) = match state {
            Some(state) => (state.time + 1, state.moment_1, state.moment_2),
            None => (
                1,
                grad.zeros_like(),
                grad.zeros_like().add_scalar(self.initial_accumulator),
            ),
        };
        let beta_1 = self.beta_1 as f64;
        let beta_2 = self.beta_2 as f64;

        let moment_1 = moment_1
            .mul_scalar(beta_1)
            .add(grad.clone().mul_scalar(1.0 - beta_1));

        let grad_squared = grad.clone() * grad;
        let difference = moment_2.clone() - grad_squared.clone();
        let sign = difference.clone().greater_elem(0.0).float() - difference.lower_elem(0.0).float();
        let moment_2 = moment_2 - grad_squared * sign * (1.0 - beta_2);

        let moment_1_corrected = moment_1.clone().div_scalar(1.0 - beta_1.powi(time as i32));
        let moment_2_corrected = moment_2.clone().div_scalar(1.0 - beta_2.powi(time as i32));
        let delta = moment_1_corrected
            .div(moment_2_corrected.sqrt().add_scalar(self.epsilon))
            .mul_scalar(lr);

        let state = YogiState {
            time,
            moment_1,
            moment_2,
        };

        (tensor - delta, Some(state))
    }

    fn to_device<const D: usize>(mut state: Self::State<D>, device: &B::Device) -> Self::State<D> {
        state.moment_1 = state.moment_1.to_device(device);
        state.moment_2 = state.moment_2.to_device(device);
        state
    }
}

/// Object safe view of a burn [`Optimizer`] with its record written to and
/// read from checkpoint files.
trait CheckpointedOptimizer<B: AutodiffBackend, M: AutodiffModule<B>>: Send {
    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M;

    fn save(&self, path: PathBuf) -> Result<()>;

    fn load(
        self: Box<Self>,
        path: PathBuf,
        device: &B::Device,
    ) -> Result<Box<dyn CheckpointedOptimizer<B, M>>>;
}

impl<B, M, O> CheckpointedOptimizer<B, M> for O
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + 'static,
    O: Optimizer<M, B> + 'static,
{
    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M {
        Optimizer::step(self, lr, module, grads)
    }

    fn save(&self, path: PathBuf) -> Result<()> {
        Recorder::<B>::record(&CheckpointRecorder::new(), self.to_record(), path)?;
        Ok(())
    }

    fn load(
        self: Box<Self>,
        path: PathBuf,
        device: &B::Device,
    ) -> Result<Box<dyn CheckpointedOptimizer<B, M>>> {
        let record: O::Record = Recorder::<B>::load(&CheckpointRecorder::new(), path, device)?;
        Ok(Box::new((*self).load_record(record)))
    }
}

/// The optimizer selected by an [`OptimizerKind`].
///
/// burn's adam and adamW builders return opaque optimizer types, so the
/// selected optimizer is kept behind a box.
pub struct TrainOptimizer<B: AutodiffBackend, M: AutodiffModule<B>> {
    kind: OptimizerKind,
    inner: Box<dyn CheckpointedOptimizer<B, M>>,
}

impl<B: AutodiffBackend, M: AutodiffModule<B> + 'static> TrainOptimizer<B, M> {
    /// `weight_decay` only applies to adamW and sgdW.
    pub fn new(kind: OptimizerKind, weight_decay: f64) -> Self {
        let momentum = MomentumConfig::new().with_momentum(SGD_MOMENTUM as _);
        let inner: Box<dyn CheckpointedOptimizer<B, M>> = match kind {
            OptimizerKind::Adam => Box::new(AdamConfig::new().init::<B, M>()),
            OptimizerKind::AdamW => Box::new(
                AdamWConfig::new()
                    .with_weight_decay(weight_decay as _)
                    .init::<B, M>(),
            ),
            OptimizerKind::Sgd => Box::new(
                SgdConfig::new()
                    .with_momentum(Some(momentum))
                    .init::<B, M>(),
            ),
            OptimizerKind::SgdW => Box::new(
                SgdConfig::new()
                    .with_momentum(Some(momentum))
                    .with_weight_decay(Some(WeightDecayConfig::new(weight_decay as _)))
                    .init::<B, M>(),
            ),
            OptimizerKind::Yogi => Box::new(YogiConfig::new().init::<B, M>()),
        };
        Self { kind, inner }
    }
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> TrainOptimizer<B, M> {
    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M {
        self.inner.step(lr, module, grads)
    }

    /// Writes the optimizer state to `path` with the `.mpk` extension.
    pub fn save(&self, path: PathBuf) -> Result<()> {
        self.inner.save(path)
    }

    /// Restores the optimizer state written by [`TrainOptimizer::save`].
    pub fn load(self, path: PathBuf, device: &B::Device) -> Result<Self> {
        Ok(Self {
            kind: self.kind,
            inner: self.inner.load(path, device)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::to_host;
    use crate::{TestAutodiffBackend, TestBackend};
    use burn::tensor::Data;

    #[test]
    fn test_parse_optimizer_kind() {
        assert_eq!("adamW".parse::<OptimizerKind>().unwrap(), OptimizerKind::AdamW);
        assert_eq!("sgdW".parse::<OptimizerKind>().unwrap(), OptimizerKind::SgdW);
        assert!("adamw".parse::<OptimizerKind>().is_err());
        assert_eq!(OptimizerKind::Yogi.to_string(), "yogi");
    }

    #[test]
    fn test_yogi_first_step_moves_against_gradient() {
        let device = Default::default();
        let yogi = Yogi::<TestBackend> {
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-3,
            initial_accumulator: 1e-6,
            _backend: PhantomData,
        };
        let tensor: Tensor<TestBackend, 1> =
            Tensor::from_floats(Data::from([1.0, 1.0, 1.0]), &device);
        let grad: Tensor<TestBackend, 1> =
            Tensor::from_floats(Data::from([0.5, -0.5, 0.0]), &device);

        let (updated, state) = yogi.step(0.1, tensor, grad, None);
        let updated = to_host(updated);

        assert!(updated[0] < 1.0);
        assert!(updated[1] > 1.0);
        assert!((updated[2] - 1.0).abs() < 1e-6);
        // Bias corrected first step: lr * g / (|g| + eps).
        assert!((updated[0] - (1.0 - 0.1 * 0.5 / (0.5 + 1e-3))).abs() < 1e-3);
        assert_eq!(state.unwrap().time, 1);
    }

    #[test]
    fn test_every_kind_updates_parameters() {
        type Model = burn::nn::Linear<TestAutodiffBackend>;
        let device = Default::default();
        for kind in [
            OptimizerKind::Adam,
            OptimizerKind::AdamW,
            OptimizerKind::Sgd,
            OptimizerKind::SgdW,
            OptimizerKind::Yogi,
        ] {
            let mut optimizer = TrainOptimizer::<TestAutodiffBackend, Model>::new(kind, 4e-4);
            assert_eq!(optimizer.kind(), kind);

            let model: Model = burn::nn::LinearConfig::new(2, 1).init(&device);
            let before = to_host(model.weight.val());
            let input = Tensor::<TestAutodiffBackend, 2>::ones([4, 2], &device);
            let grads = model.forward(input).sum().backward();
            let grads = GradientsParams::from_grads(grads, &model);
            let model = optimizer.step(1e-2, model, grads);
            let after = to_host(model.weight.val());

            assert!(
                before.iter().zip(&after).any(|(b, a)| (b - a).abs() > 1e-6),
                "{kind}"
            );
        }
    }

    #[test]
    fn test_save_and_load_keep_kind() {
        type Model = burn::nn::Linear<TestAutodiffBackend>;
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optimizer");

        let optimizer = TrainOptimizer::<TestAutodiffBackend, Model>::new(OptimizerKind::AdamW, 4e-4);
        optimizer.save(path.clone()).unwrap();
        let restored = TrainOptimizer::<TestAutodiffBackend, Model>::new(OptimizerKind::AdamW, 4e-4)
            .load(path, &device)
            .unwrap();

        assert_eq!(restored.kind(), OptimizerKind::AdamW);
    }
}
