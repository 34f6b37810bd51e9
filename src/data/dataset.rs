use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use burn::data::dataset::Dataset;
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::{error, info, warn};

use super::DatasetConfig;
use crate::error::{DiffusionError, Result};

const RGB_DIR: &str = "rgb";
const DEPTH_DIR: &str = "depth";

/// One RGB/depth pair, channel first, values in [-1, 1].
#[derive(Debug, Clone)]
pub struct DepthItem {
    /// `3 * height * width` values.
    pub condition: Vec<f32>,
    /// `height * width` values.
    pub depth: Vec<f32>,
    pub height: usize,
    pub width: usize,
}

impl DepthItem {
    /// Mirrors both images along the width.
    pub fn flipped(&self) -> Self {
        let flip = |values: &[f32]| -> Vec<f32> {
            values
                .chunks(self.width)
                .flat_map(|row| row.iter().rev().copied())
                .collect()
        };
        Self {
            condition: flip(&self.condition),
            depth: flip(&self.depth),
            height: self.height,
            width: self.width,
        }
    }
}

/// Pairs of a directory. Only the headers are read when the dataset is
/// opened, each pair is decoded when it is fetched.
#[derive(Debug)]
pub struct DepthDataset {
    pairs: Vec<(PathBuf, PathBuf)>,
    config: DatasetConfig,
}

impl DepthDataset {
    pub fn train(config: &DatasetConfig) -> Result<Self> {
        Self::new(&config.train_dir(), config, config.limit_train)
    }

    pub fn test(config: &DatasetConfig) -> Result<Self> {
        Self::new(&config.test_dir(), config, config.limit_test)
    }

    /// Lists the pairs of `directory/rgb` and `directory/depth` sharing a
    /// file stem, in name order.
    pub fn new(directory: &Path, config: &DatasetConfig, limit: Option<usize>) -> Result<Self> {
        let mut pairs = pairs(directory)?;
        pairs.truncate(limit.unwrap_or(pairs.len()));

        for (rgb, depth) in pairs.iter() {
            image::image_dimensions(rgb)?;
            image::image_dimensions(depth)?;
        }
        info!("Found {} pairs in {}", pairs.len(), directory.display());

        Ok(Self {
            pairs,
            config: config.clone(),
        })
    }

    /// Decodes the pair at `index`.
    pub fn load(&self, index: usize) -> Option<Result<DepthItem>> {
        self.pairs
            .get(index)
            .map(|(rgb, depth)| load_item(rgb, depth, &self.config))
    }
}

impl Dataset<DepthItem> for DepthDataset {
    fn get(&self, index: usize) -> Option<DepthItem> {
        match self.load(index)? {
            Ok(item) => Some(item),
            Err(error) => {
                error!("Could not decode pair {index}: {error}");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.pairs.len()
    }
}

fn png_stems(directory: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let mut stems = BTreeMap::new();
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        let is_png = path
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| extension.eq_ignore_ascii_case("png"));
        if let (true, Some(stem)) = (is_png, path.file_stem().and_then(|stem| stem.to_str())) {
            stems.insert(stem.to_string(), path.clone());
        }
    }
    Ok(stems)
}

/// PNG files of `directory` in name order.
pub fn png_files(directory: &Path) -> Result<Vec<PathBuf>> {
    Ok(png_stems(directory)?.into_values().collect())
}

fn pairs(directory: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let rgb = png_stems(&directory.join(RGB_DIR))?;
    let mut depth = png_stems(&directory.join(DEPTH_DIR))?;

    let mut pairs = Vec::with_capacity(rgb.len());
    for (stem, rgb_path) in rgb {
        match depth.remove(&stem) {
            Some(depth_path) => pairs.push((rgb_path, depth_path)),
            None => warn!("No depth map for {}", rgb_path.display()),
        }
    }
    if pairs.is_empty() {
        return Err(DiffusionError::config(format!(
            "no rgb/depth pairs in {}",
            directory.display()
        )));
    }
    Ok(pairs)
}

/// Resizes to the configured resolution and keeps the center half of the
/// width when cropping is enabled.
fn prepare(image: DynamicImage, config: &DatasetConfig, filter: FilterType) -> DynamicImage {
    let (height, width) = (config.height as u32, config.width as u32);
    let image = if image.width() != width || image.height() != height {
        image.resize_exact(width, height, filter)
    } else {
        image
    };

    if config.crop_width_half {
        let crop = config.sample_width() as u32;
        image.crop_imm((width - crop) / 2, 0, crop, height)
    } else {
        image
    }
}

/// Reads an RGB image as `3 * height * width` channel first values in
/// [-1, 1], together with its height and width.
pub fn load_condition(path: &Path, config: &DatasetConfig) -> Result<(Vec<f32>, usize, usize)> {
    let rgb = prepare(image::open(path)?, config, FilterType::Triangle).to_rgb8();
    let (width, height) = rgb.dimensions();
    let plane = (width * height) as usize;

    let mut condition = vec![0.0; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let offset = (y * width + x) as usize;
        for channel in 0..3 {
            condition[channel * plane + offset] = pixel[channel] as f32 / 127.5 - 1.0;
        }
    }

    Ok((condition, height as usize, width as usize))
}

fn load_item(rgb: &Path, depth: &Path, config: &DatasetConfig) -> Result<DepthItem> {
    let (condition, height, width) = load_condition(rgb, config)?;
    // Nearest neighbour keeps depth edges free of interpolated values.
    let depth = prepare(image::open(depth)?, config, FilterType::Nearest).to_luma16();
    let depth = depth
        .pixels()
        .map(|pixel| pixel[0] as f32 / 32767.5 - 1.0)
        .collect();

    Ok(DepthItem {
        condition,
        depth,
        height,
        width,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb, RgbImage};

    /// Writes `count` pairs of `height x width` images under `directory`.
    pub(crate) fn write_pairs(directory: &Path, count: usize, height: u32, width: u32) {
        fs::create_dir_all(directory.join(RGB_DIR)).unwrap();
        fs::create_dir_all(directory.join(DEPTH_DIR)).unwrap();
        for i in 0..count {
            let rgb = RgbImage::from_fn(width, height, |x, _| Rgb([255, (x * 10) as u8, 0]));
            let depth: ImageBuffer<Luma<u16>, Vec<u16>> =
                ImageBuffer::from_fn(width, height, |x, _| Luma([if x == 0 { 0 } else { 65535 }]));
            rgb.save(directory.join(RGB_DIR).join(format!("{i:04}.png")))
                .unwrap();
            depth
                .save(directory.join(DEPTH_DIR).join(format!("{i:04}.png")))
                .unwrap();
        }
    }

    fn config(height: usize, width: usize) -> DatasetConfig {
        DatasetConfig::new().with_height(height).with_width(width)
    }

    #[test]
    fn test_pairs_are_normalized() {
        let dir = tempfile::tempdir().unwrap();
        write_pairs(dir.path(), 3, 4, 4);

        let dataset = DepthDataset::new(dir.path(), &config(4, 4), None).unwrap();
        let item = dataset.get(0).unwrap();

        assert_eq!(dataset.len(), 3);
        assert_eq!(item.condition.len(), 3 * 16);
        assert_eq!(item.depth.len(), 16);
        // Red channel is saturated, blue is empty.
        assert!((item.condition[0] - 1.0).abs() < 1e-6);
        assert!((item.condition[2 * 16] + 1.0).abs() < 1e-6);
        assert!((item.depth[0] + 1.0).abs() < 1e-6);
        assert!((item.depth[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_unpaired_images_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_pairs(dir.path(), 2, 4, 4);
        RgbImage::new(4, 4)
            .save(dir.path().join(RGB_DIR).join("orphan.png"))
            .unwrap();

        let dataset = DepthDataset::new(dir.path(), &config(4, 4), None).unwrap();

        assert_eq!(dataset.len(), 2);
    }

    #[test]
    fn test_limit_resize_and_crop() {
        let dir = tempfile::tempdir().unwrap();
        write_pairs(dir.path(), 5, 16, 16);
        let config = config(8, 8).with_crop_width_half(true);

        let dataset = DepthDataset::new(dir.path(), &config, Some(2)).unwrap();
        let item = dataset.get(1).unwrap();

        assert_eq!(dataset.len(), 2);
        assert_eq!((item.height, item.width), (8, 4));
        assert_eq!(item.depth.len(), 32);
    }

    #[test]
    fn test_empty_directory_is_error() {
        let dir = tempfile::tempdir().unwrap();
        write_pairs(dir.path(), 0, 4, 4);

        let result = DepthDataset::new(dir.path(), &config(4, 4), None);

        assert!(matches!(result, Err(DiffusionError::Config(_))));
    }

    #[test]
    fn test_flip_mirrors_rows() {
        let item = DepthItem {
            condition: vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
            depth: vec![-1.0, 1.0],
            height: 1,
            width: 2,
        };

        let flipped = item.flipped();

        assert_eq!(flipped.condition, vec![1.0, 0.0, 3.0, 2.0, 5.0, 4.0]);
        assert_eq!(flipped.depth, vec![1.0, -1.0]);
    }

    #[test]
    fn test_pairs_are_decoded_on_access() {
        let dir = tempfile::tempdir().unwrap();
        write_pairs(dir.path(), 2, 4, 4);
        let dataset = DepthDataset::new(dir.path(), &config(4, 4), None).unwrap();

        // Replaced after opening: the new content is what gets decoded.
        RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]))
            .save(dir.path().join(RGB_DIR).join("0001.png"))
            .unwrap();
        let item = dataset.get(1).unwrap();
        assert!((item.condition[0] + 1.0).abs() < 1e-6);

        fs::write(dir.path().join(DEPTH_DIR).join("0000.png"), b"broken").unwrap();
        assert!(matches!(dataset.load(0), Some(Err(_))));
        assert!(dataset.get(0).is_none());
        assert!(dataset.load(2).is_none());
    }

    #[test]
    fn test_unreadable_image_fails_on_open() {
        let dir = tempfile::tempdir().unwrap();
        write_pairs(dir.path(), 2, 4, 4);
        fs::write(dir.path().join(RGB_DIR).join("0001.png"), b"broken").unwrap();

        let result = DepthDataset::new(dir.path(), &config(4, 4), None);

        assert!(matches!(result, Err(DiffusionError::Image(_))));
    }
}
