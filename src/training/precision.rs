//! Dynamic loss scaling.
//!
//! The loss is multiplied by a large factor before the backward pass so small
//! gradients survive a reduced precision backend, and the gradients are
//! divided by the same factor before the update. A step whose gradients
//! overflow is skipped and the scale backs off.
//!
//! [`HalfPrecision`] keeps a reduced precision copy of a full precision
//! master module. The forward and backward passes run on the copy, and the
//! gradients are converted back to the master's float type for the update.

use core::marker::PhantomData;

use burn::module::{AutodiffModule, Module, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use tracing::{debug, warn};

use crate::error::Result;
use crate::utils::scalar;

#[derive(Debug, Clone)]
pub struct LossScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    steps_since_update: usize,
}

impl LossScaler {
    pub fn new() -> Self {
        Self {
            enabled: true,
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            steps_since_update: 0,
        }
    }

    /// Full precision: no scaling and every step is applied.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            scale: 1.0,
            growth_factor: 1.0,
            backoff_factor: 1.0,
            growth_interval: 2000,
            steps_since_update: 0,
        }
    }

    pub fn with_growth_interval(mut self, growth_interval: usize) -> Self {
        self.growth_interval = growth_interval.max(1);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn scale_loss<B: AutodiffBackend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        if self.enabled {
            loss.mul_scalar(self.scale)
        } else {
            loss
        }
    }

    /// Divides every gradient of `module` by the scale. Returns whether all of
    /// them are finite.
    pub fn unscale<B: AutodiffBackend, M: AutodiffModule<B>>(
        &self,
        grads: GradientsParams,
        module: &M,
    ) -> (GradientsParams, bool) {
        if !self.enabled {
            return (grads, true);
        }

        let mut unscaler = GradientUnscaler::<B> {
            grads,
            inv_scale: 1.0 / self.scale,
            finite: true,
            _backend: PhantomData,
        };
        module.visit(&mut unscaler);

        (unscaler.grads, unscaler.finite)
    }

    /// Adjusts the scale after a step. Returns whether the step should be applied.
    pub fn update(&mut self, finite: bool) -> bool {
        if !self.enabled {
            return true;
        }

        if finite {
            self.steps_since_update += 1;
            if self.steps_since_update >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.steps_since_update = 0;
                debug!("Increasing loss scale to {}", self.scale);
            }
            true
        } else {
            self.scale *= self.backoff_factor;
            self.steps_since_update = 0;
            warn!("Gradient overflow, skipping step and decreasing loss scale to {}", self.scale);
            false
        }
    }
}

impl Default for LossScaler {
    fn default() -> Self {
        Self::new()
    }
}

struct GradientUnscaler<B: AutodiffBackend> {
    grads: GradientsParams,
    inv_scale: f64,
    finite: bool,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientUnscaler<B> {
    fn visit_float<const D: usize>(&mut self, id: &ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            let grad = grad.mul_scalar(self.inv_scale);
            if self.finite && !scalar(grad.clone().sum()).is_finite() {
                self.finite = false;
            }
            self.grads.register::<B::InnerBackend, D>(id.clone(), grad);
        }
    }
}

/// Reduced precision copy of a master module, on backend `H`.
#[derive(Debug)]
pub struct HalfPrecision<H: AutodiffBackend, MH: AutodiffModule<H>> {
    module: MH,
    device: H::Device,
}

impl<H: AutodiffBackend, MH: AutodiffModule<H>> HalfPrecision<H, MH> {
    pub fn new(module: MH, device: H::Device) -> Self {
        Self { module, device }
    }

    pub fn module(&self) -> &MH {
        &self.module
    }

    pub fn device(&self) -> &H::Device {
        &self.device
    }

    /// Copies the weights of `master` into the reduced precision module. The
    /// parameter ids are copied too, so gradients can be matched back.
    pub fn sync<B: Backend, M: Module<B>>(&mut self, master: &M) -> Result<()> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::new();
        let bytes = Recorder::<B>::record(&recorder, master.clone().into_record(), ())?;
        let record: MH::Record = Recorder::<H>::load(&recorder, bytes, &self.device)?;
        self.module = self.module.clone().load_record(record);
        Ok(())
    }
}

/// Moves the gradients of every parameter of `master` out of `grads`,
/// computed on backend `H`, converting them to the float type of `B`.
pub fn transfer_gradients<H, B, M>(grads: GradientsParams, master: &M) -> GradientsParams
where
    H: AutodiffBackend,
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut transfer = GradientTransfer::<H, B> {
        from: grads,
        to: GradientsParams::new(),
        _backend: PhantomData,
    };
    master.visit(&mut transfer);
    transfer.to
}

struct GradientTransfer<H: AutodiffBackend, B: AutodiffBackend> {
    from: GradientsParams,
    to: GradientsParams,
    _backend: PhantomData<(H, B)>,
}

impl<H: AutodiffBackend, B: AutodiffBackend> ModuleVisitor<B> for GradientTransfer<H, B> {
    fn visit_float<const D: usize>(&mut self, id: &ParamId, tensor: &Tensor<B, D>) {
        if let Some(grad) = self.from.remove::<H::InnerBackend, D>(id) {
            let data = grad
                .into_data()
                .convert::<<B::InnerBackend as Backend>::FloatElem>();
            let grad = Tensor::<B::InnerBackend, D>::from_data(data, &tensor.device());
            self.to.register::<B::InnerBackend, D>(id.clone(), grad);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestAutodiffBackend;
    use burn::nn::LinearConfig;
    use burn::tensor::Distribution;

    #[test]
    fn test_disabled_scaler_is_identity() {
        let mut scaler = LossScaler::disabled();

        assert_eq!(scaler.scale(), 1.0);
        assert!(scaler.update(false));
        assert_eq!(scaler.scale(), 1.0);
    }

    #[test]
    fn test_backoff_and_growth() {
        let mut scaler = LossScaler::new().with_growth_interval(2);

        assert!(!scaler.update(false));
        assert_eq!(scaler.scale(), 32768.0);
        assert!(scaler.update(true));
        assert_eq!(scaler.scale(), 32768.0);
        assert!(scaler.update(true));
        assert_eq!(scaler.scale(), 65536.0);
    }

    #[test]
    fn test_unscaled_gradients_match_unscaled_loss() {
        let device = Default::default();
        let linear = LinearConfig::new(3, 2).init::<TestAutodiffBackend>(&device);
        let input = Tensor::random([4, 3], Distribution::Default, &device);
        let scaler = LossScaler::new();

        let loss = linear.forward(input.clone()).sum();
        let reference = GradientsParams::from_grads(loss.backward(), &linear);

        let scaled = scaler.scale_loss(linear.forward(input).sum());
        let grads = GradientsParams::from_grads(scaled.backward(), &linear);
        let (mut grads, finite) = scaler.unscale(grads, &linear);
        let mut reference = reference;

        assert!(finite);
        let (id, _) = linear.weight.clone().consume();
        let expected = reference
            .remove::<<TestAutodiffBackend as AutodiffBackend>::InnerBackend, 2>(&id)
            .unwrap();
        let actual = grads
            .remove::<<TestAutodiffBackend as AutodiffBackend>::InnerBackend, 2>(&id)
            .unwrap();
        actual.into_data().assert_approx_eq(&expected.into_data(), 3);
    }

    #[test]
    fn test_half_precision_copy_matches_master() {
        type Inner = <TestAutodiffBackend as AutodiffBackend>::InnerBackend;
        let device = Default::default();
        let master = LinearConfig::new(3, 2).init::<TestAutodiffBackend>(&device);
        let mut half = HalfPrecision::<TestAutodiffBackend, _>::new(
            LinearConfig::new(3, 2).init::<TestAutodiffBackend>(&device),
            device,
        );
        let input: Tensor<TestAutodiffBackend, 2> =
            Tensor::random([4, 3], Distribution::Default, &device);

        half.sync::<TestAutodiffBackend, _>(&master).unwrap();
        half.module()
            .forward(input.clone())
            .into_data()
            .assert_approx_eq(&master.forward(input.clone()).into_data(), 5);

        let grads = GradientsParams::from_grads(
            half.module().forward(input.clone()).sum().backward(),
            half.module(),
        );
        let mut grads =
            transfer_gradients::<TestAutodiffBackend, TestAutodiffBackend, _>(grads, &master);
        let mut reference =
            GradientsParams::from_grads(master.forward(input).sum().backward(), &master);

        let (id, _) = master.weight.clone().consume();
        let expected = reference.remove::<Inner, 2>(&id).unwrap();
        let actual = grads.remove::<Inner, 2>(&id).unwrap();
        actual.into_data().assert_approx_eq(&expected.into_data(), 5);
    }
}
