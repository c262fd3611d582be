//! Image preprocessing for the re-identification input pipeline
//!
//! Loads a person crop, converts it to a CHW float tensor in [0, 1],
//! normalizes with ImageNet statistics, and resizes to the 256x128 input
//! shape the model expects.

use std::path::Path;

use candle_core::{Device, Result, Tensor};
use image::DynamicImage;

/// Model input height in pixels.
pub const INPUT_HEIGHT: usize = 256;
/// Model input width in pixels.
pub const INPUT_WIDTH: usize = 128;

/// ImageNet normalization mean values (RGB order)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet normalization std values (RGB order)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Convert a DynamicImage to a tensor in CHW format with values in [0, 1].
pub fn image_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let img = img.to_rgb8();
    let (width, height) = img.dimensions();
    let h = height as usize;
    let w = width as usize;
    let raw = img.into_raw();

    let mut chw = Vec::with_capacity(3 * h * w);
    for c in 0..3 {
        for y in 0..h {
            for x in 0..w {
                chw.push(raw[(y * w + x) * 3 + c] as f32 / 255.0);
            }
        }
    }

    Tensor::from_vec(chw, (3, h, w), device)
}

/// Normalize a `[3, H, W]` tensor with ImageNet mean and std.
pub fn normalize(tensor: &Tensor) -> Result<Tensor> {
    let device = tensor.device();
    let mean = Tensor::from_slice(&IMAGENET_MEAN, (3, 1, 1), device)?;
    let std = Tensor::from_slice(&IMAGENET_STD, (3, 1, 1), device)?;
    tensor.broadcast_sub(&mean)?.broadcast_div(&std)
}

/// Bilinear-resize a `[3, H, W]` tensor to the fixed 256x128 input shape.
pub fn resize_to_input(tensor: &Tensor) -> Result<Tensor> {
    tensor
        .unsqueeze(0)?
        .upsample_bilinear2d(INPUT_HEIGHT, INPUT_WIDTH, false)?
        .squeeze(0)
}

/// Full pipeline: load, convert, normalize, resize to the model input shape.
///
/// Returns a `[3, 256, 128]` tensor ready to be stacked into a batch.
pub fn load_input(path: &Path, device: &Device) -> anyhow::Result<Tensor> {
    let img = image::open(path)
        .map_err(|e| anyhow::anyhow!("cannot load image {}: {e}", path.display()))?;
    let tensor = image_to_tensor(&img, device)?;
    let normalized = normalize(&tensor)?;
    Ok(resize_to_input(&normalized)?)
}
