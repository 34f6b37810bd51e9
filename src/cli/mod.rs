pub mod sample;
pub mod train;

#[cfg(feature = "ndarray")]
pub type Backend = burn::backend::NdArray<f32>;

#[cfg(all(feature = "torch", not(feature = "ndarray")))]
pub type Backend = burn::backend::LibTorch<f32>;

#[cfg(all(feature = "wgpu", not(any(feature = "ndarray", feature = "torch"))))]
pub type Backend = burn::backend::Wgpu;

pub type TrainBackend = burn::backend::Autodiff<Backend>;

/// Backend of the forward and backward passes under mixed precision.
#[cfg(all(feature = "torch", not(feature = "ndarray")))]
pub type HalfBackend = burn::backend::Autodiff<burn::backend::LibTorch<burn::tensor::f16>>;
