use std::sync::{Arc, Mutex};

use burn::data::dataloader::batcher::Batcher;
use burn::tensor::backend::Backend;
use burn::tensor::{Data, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::DepthItem;

#[derive(Clone, Debug)]
pub struct DepthBatcher<B: Backend> {
    device: B::Device,
    flip: bool,
    rng: Arc<Mutex<StdRng>>,
}

/// RGB conditions `[batch, 3, height, width]` with their depth targets
/// `[batch, 1, height, width]`.
#[derive(Clone, Debug)]
pub struct DepthBatch<B: Backend> {
    pub condition: Tensor<B, 4>,
    pub target: Tensor<B, 4>,
}

impl<B: Backend> DepthBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self {
            device,
            flip: false,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(0))),
        }
    }

    /// Flips every example horizontally with probability one half.
    pub fn with_flip(mut self, flip: bool) -> Self {
        self.flip = flip;
        self
    }

    /// Seeds the flip decisions, shared by every worker of a loader.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    fn flips(&self, count: usize) -> Vec<bool> {
        if !self.flip {
            return vec![false; count];
        }
        let mut rng = match self.rng.lock() {
            Ok(rng) => rng,
            Err(poisoned) => poisoned.into_inner(),
        };
        (0..count).map(|_| rng.gen_bool(0.5)).collect()
    }
}

impl<B: Backend> Batcher<DepthItem, DepthBatch<B>> for DepthBatcher<B> {
    fn batch(&self, items: Vec<DepthItem>) -> DepthBatch<B> {
        let batch_size = items.len();
        let flips = self.flips(batch_size);
        let (height, width) = items
            .first()
            .map(|item| (item.height, item.width))
            .unwrap_or_default();

        let mut condition = Vec::with_capacity(batch_size * 3 * height * width);
        let mut target = Vec::with_capacity(batch_size * height * width);
        for (item, flip) in items.into_iter().zip(flips) {
            let item = if flip {
                item.flipped()
            } else {
                item
            };
            condition.extend(item.condition);
            target.extend(item.depth);
        }

        let condition = Tensor::from_floats(
            Data::new(condition, Shape::new([batch_size, 3, height, width])),
            &self.device,
        );
        let target = Tensor::from_floats(
            Data::new(target, Shape::new([batch_size, 1, height, width])),
            &self.device,
        );

        DepthBatch { condition, target }
    }
}
