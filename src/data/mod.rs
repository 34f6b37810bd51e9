//! # Data
//!
//! Paired RGB and depth images stored as
//! `<base_dir>/manual_datasets/<dataset>/{train,test}/{rgb,depth}/<name>.png`.

use std::path::PathBuf;

use burn::config::Config;

mod batcher;
mod dataset;

pub use batcher::{DepthBatch, DepthBatcher};
pub use dataset::{load_condition, png_files, DepthDataset, DepthItem};

#[cfg(test)]
pub(crate) use dataset::tests::write_pairs;

#[derive(Config, Debug)]
pub struct DatasetConfig {
    #[config(default = "String::from(\".\")")]
    pub base_dir: String,
    #[config(default = "String::from(\"v_human_rendered\")")]
    pub dataset: String,
    /// Resolution every image is resized to.
    #[config(default = 64)]
    pub height: usize,
    #[config(default = 64)]
    pub width: usize,
    /// Keeps the center half of the width.
    #[config(default = false)]
    pub crop_width_half: bool,
    /// Random horizontal flips of training examples.
    #[config(default = false)]
    pub flip: bool,
    /// Number of training pairs to read, all of them when unset.
    pub limit_train: Option<usize>,
    pub limit_test: Option<usize>,
    #[config(default = 4)]
    pub num_workers: usize,
}

impl DatasetConfig {
    pub fn root(&self) -> PathBuf {
        PathBuf::from(&self.base_dir)
            .join("manual_datasets")
            .join(&self.dataset)
    }

    pub fn train_dir(&self) -> PathBuf {
        self.root().join("train")
    }

    pub fn test_dir(&self) -> PathBuf {
        self.root().join("test")
    }

    /// Width of the examples after the optional crop.
    pub fn sample_width(&self) -> usize {
        if self.crop_width_half {
            self.width / 2
        } else {
            self.width
        }
    }
}
