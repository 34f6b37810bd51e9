//! Data parallel replicas.
//!
//! A global batch is split into equal shards, one per replica. Each shard
//! reduces its per example losses by the global batch size, so the sum of the
//! shard losses (the all-reduce) is the mean over the global batch and the
//! gradients are not scaled by the number of replicas.

use core::ops::Range;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::diffusion::loss::reduce_global;
use crate::error::{DiffusionError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replicas {
    count: usize,
}

impl Replicas {
    pub fn new(count: usize) -> Result<Self> {
        if count == 0 {
            return Err(DiffusionError::config("at least one replica is required"));
        }
        Ok(Self { count })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Example ranges of every replica in a global batch.
    pub fn shards(&self, global_batch_size: usize) -> Result<Vec<Range<usize>>> {
        if global_batch_size == 0 || global_batch_size % self.count != 0 {
            return Err(DiffusionError::config(format!(
                "a global batch of {global_batch_size} cannot be split across {} replicas",
                self.count
            )));
        }
        let shard_size = global_batch_size / self.count;

        Ok((0..self.count)
            .map(|replica| replica * shard_size..(replica + 1) * shard_size)
            .collect())
    }

    /// Sums the per replica losses, each reduced by the global batch size.
    pub fn reduce<B: Backend>(
        &self,
        per_replica: Vec<Tensor<B, 1>>,
        global_batch_size: usize,
    ) -> Option<Tensor<B, 1>> {
        per_replica
            .into_iter()
            .map(|losses| reduce_global(losses, global_batch_size))
            .reduce(|total, loss| total + loss)
    }
}

/// Examples `range` of a batch.
pub fn shard<B: Backend>(batch: Tensor<B, 4>, range: Range<usize>) -> Tensor<B, 4> {
    let [_, channels, height, width] = batch.dims();
    batch.slice([range, 0..channels, 0..height, 0..width])
}
