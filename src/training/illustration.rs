//! PNG sheets for visual inspection of the generated depth maps.
//!
//! One row per example: the RGB condition, the ground truth depth and the
//! generated depth side by side.

use std::path::Path;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use image::{ImageBuffer, Luma, Rgb, RgbImage};

use crate::error::{DiffusionError, Result};
use crate::utils::to_host;

/// Maps a value in [-1, 1] to [0, 255].
fn to_pixel(value: f64) -> u8 {
    ((value + 1.0) * 127.5).round().clamp(0.0, 255.0) as u8
}

struct Panel {
    values: Vec<f64>,
    channels: usize,
}

impl Panel {
    fn new<B: Backend>(tensor: Tensor<B, 4>) -> Self {
        let [_, channels, _, _] = tensor.dims();
        Self {
            values: to_host(tensor),
            channels,
        }
    }

    fn pixel(&self, example: usize, x: usize, y: usize, height: usize, width: usize) -> Rgb<u8> {
        let plane = height * width;
        let offset = example * self.channels * plane + y * width + x;
        let channel = |c: usize| to_pixel(self.values[offset + c.min(self.channels - 1) * plane]);
        Rgb([channel(0), channel(1), channel(2)])
    }
}

/// Builds the sheet of a batch. Every tensor is NCHW with the same batch,
/// height and width.
pub fn illustration_sheet<B: Backend>(
    condition: Tensor<B, 4>,
    target: Tensor<B, 4>,
    generated: Tensor<B, 4>,
) -> Result<RgbImage> {
    let [batch_size, _, height, width] = condition.dims();
    for dims in [target.dims(), generated.dims()] {
        if dims[0] != batch_size || dims[2] != height || dims[3] != width {
            return Err(DiffusionError::config(format!(
                "cannot illustrate {dims:?} next to a [{batch_size}, _, {height}, {width}] condition"
            )));
        }
    }

    let panels = [Panel::new(condition), Panel::new(target), Panel::new(generated)];
    let mut sheet = RgbImage::new((width * panels.len()) as u32, (height * batch_size) as u32);
    for example in 0..batch_size {
        for (column, panel) in panels.iter().enumerate() {
            for y in 0..height {
                for x in 0..width {
                    sheet.put_pixel(
                        (column * width + x) as u32,
                        (example * height + y) as u32,
                        panel.pixel(example, x, y, height, width),
                    );
                }
            }
        }
    }

    Ok(sheet)
}

/// Writes the sheet of a batch as a PNG at `path`.
pub fn write_illustration<B: Backend>(
    path: &Path,
    condition: Tensor<B, 4>,
    target: Tensor<B, 4>,
    generated: Tensor<B, 4>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    illustration_sheet(condition, target, generated)?.save(path)?;
    Ok(())
}

/// Writes the first example of a `[batch, 1, height, width]` depth tensor as
/// a 16 bit grayscale PNG, the inverse of the dataset normalization.
pub fn write_depth<B: Backend>(path: &Path, depth: Tensor<B, 4>) -> Result<()> {
    let [_, _, height, width] = depth.dims();
    let values = to_host(depth);
    let image: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
            let value = values[y as usize * width + x as usize];
            Luma([((value + 1.0) * 32767.5).round().clamp(0.0, 65535.0) as u16])
        });
    image.save(path)?;
    Ok(())
}
