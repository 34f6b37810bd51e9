//! # Training
//!
//! Everything around the train step: optimizers, learning rate policy, loss
//! scaling, replicas, checkpoints, illustrations and the epoch loop.

pub mod checkpoint;
pub mod illustration;
pub mod lr;
pub mod optimizer;
pub mod precision;
pub mod replica;
pub mod trainer;

pub use checkpoint::CheckpointManager;
pub use optimizer::{OptimizerKind, TrainOptimizer};
pub use replica::Replicas;
pub use trainer::{data_loaders, RunDirectory, Trainer};
