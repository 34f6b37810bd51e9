//! # Depth diffusion
//!
//! Training of an RGB conditioned depth diffusion model with [Burn](https://github.com/burn-rs/burn):
//! noise schedules, the forward and reverse processes, the loss weightings of
//! improved DDPM, and the training loop around them.

pub mod config;
pub mod data;
pub mod diffusion;
pub mod error;
pub mod models;
pub mod schedulers;
pub mod training;
pub mod utils;

pub use error::{DiffusionError, Result};

#[cfg(all(test, feature = "ndarray"))]
use burn::backend::ndarray;

#[cfg(all(test, feature = "torch"))]
use burn::backend::libtorch;

#[cfg(all(test, feature = "wgpu"))]
use burn::backend::wgpu;

#[cfg(all(test, feature = "ndarray"))]
pub type TestBackend = ndarray::NdArray<f32>;

#[cfg(all(test, feature = "torch"))]
pub type TestBackend = libtorch::LibTorch<f32>;

#[cfg(all(test, feature = "wgpu", not(target_os = "macos")))]
pub type TestBackend = wgpu::Wgpu<wgpu::Vulkan, f32, i32>;

#[cfg(all(test, feature = "wgpu", target_os = "macos"))]
pub type TestBackend = wgpu::Wgpu<wgpu::Metal, f32, i32>;

#[cfg(test)]
pub type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;
