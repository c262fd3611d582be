//! Attention heatmap rendering
//!
//! Turns a pooled feature vector into a jet-colored overlay on the source
//! crop. Only two pooled lengths have a known spatial layout: 210 maps
//! directly onto the 21x10 part grid, 128 is a 16x8 patch grid that gets
//! interpolated up. Anything else is an `UnsupportedFeatureLen`, which the
//! inference runner treats as a per-sample skip.

use std::path::{Path, PathBuf};

use candle_core::{Result, Tensor, D};
use image::RgbImage;

use crate::preprocess::{INPUT_HEIGHT, INPUT_WIDTH};

/// Pooled feature length with no known spatial layout.
#[derive(Debug, thiserror::Error)]
#[error("no heatmap layout for feature length {0}")]
pub struct UnsupportedFeatureLen(pub usize);

/// Known spatial layouts of a pooled feature vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureGrid {
    /// 21x10 grid, used as-is.
    Jpm21x10,
    /// 16x8 patch grid, bilinearly interpolated up to 21x10.
    Patch16x8,
}

impl FeatureGrid {
    pub fn for_len(len: usize) -> std::result::Result<Self, UnsupportedFeatureLen> {
        match len {
            210 => Ok(Self::Jpm21x10),
            128 => Ok(Self::Patch16x8),
            other => Err(UnsupportedFeatureLen(other)),
        }
    }

    /// Lay a pooled vector out as a `[1, 1, 21, 10]` activation grid.
    pub fn to_grid(&self, pooled: &Tensor) -> Result<Tensor> {
        match self {
            Self::Jpm21x10 => pooled.reshape((1, 1, 21, 10)),
            Self::Patch16x8 => pooled
                .reshape((1, 1, 16, 8))?
                .upsample_bilinear2d(21, 10, false),
        }
    }
}

/// Collapse one sample's features to a vector: rank-1 passes through,
/// rank-2 `[tokens, dim]` is averaged over the embedding dimension.
pub fn pool_features(features: &Tensor) -> Result<Tensor> {
    match features.rank() {
        1 => Ok(features.clone()),
        2 => features.mean(D::Minus1),
        rank => candle_core::bail!("heatmap features must be rank 1 or 2, got rank {rank}"),
    }
}

/// Approximate jet colormap for a value in [0, 1].
fn jet_color(v: f32) -> [u8; 3] {
    let v = v.clamp(0.0, 1.0);
    let r = (1.5 - (4.0 * v - 3.0).abs()).clamp(0.0, 1.0);
    let g = (1.5 - (4.0 * v - 2.0).abs()).clamp(0.0, 1.0);
    let b = (1.5 - (4.0 * v - 1.0).abs()).clamp(0.0, 1.0);
    [(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8]
}

/// Upsample the activation grid to the input resolution and smooth it with
/// a 5x5 zero-padded average pool.
fn upsample_and_smooth(grid: &Tensor) -> Result<Tensor> {
    let up = grid.upsample_bilinear2d(INPUT_HEIGHT, INPUT_WIDTH, false)?;
    let padded = up.pad_with_zeros(2, 2, 2)?.pad_with_zeros(3, 2, 2)?;
    padded.avg_pool2d_with_stride((5, 5), (1, 1))
}

/// Min-max normalize a flat activation buffer into [0, 1].
fn normalize_activations(values: &mut [f32]) {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &v in values.iter() {
        min = min.min(v);
        max = max.max(v);
    }
    let span = (max - min).max(1e-12);
    for v in values.iter_mut() {
        *v = (*v - min) / span;
    }
}

/// Render one sample's heatmap over its source crop.
///
/// The pooled vector is min-max normalized before the grid layout; the
/// zero padding in the smoothing pool would otherwise drag border pixels
/// toward zero for activations with a large offset. Writes
/// `{out_dir}/{basename}.png` and returns the written path. The overlay
/// keeps 60% of the original pixel and 40% of the heatmap color.
pub fn render_heatmap(features: &Tensor, image_path: &Path, out_dir: &Path) -> anyhow::Result<PathBuf> {
    let pooled = pool_features(features)?;
    let layout = FeatureGrid::for_len(pooled.dim(0)?)?;
    let mut pooled_values: Vec<f32> = pooled.to_vec1()?;
    normalize_activations(&mut pooled_values);
    let len = pooled_values.len();
    let pooled = Tensor::from_vec(pooled_values, len, pooled.device())?;
    let grid = layout.to_grid(&pooled)?;
    let smoothed = upsample_and_smooth(&grid)?;
    let mut activations: Vec<f32> = smoothed.flatten_all()?.to_vec1()?;
    normalize_activations(&mut activations);

    let original = image::open(image_path)
        .map_err(|e| anyhow::anyhow!("cannot load image {}: {e}", image_path.display()))?
        .resize_exact(
            INPUT_WIDTH as u32,
            INPUT_HEIGHT as u32,
            image::imageops::FilterType::Triangle,
        )
        .to_rgb8();

    let mut blended = RgbImage::new(INPUT_WIDTH as u32, INPUT_HEIGHT as u32);
    for y in 0..INPUT_HEIGHT {
        for x in 0..INPUT_WIDTH {
            let heat = jet_color(activations[y * INPUT_WIDTH + x]);
            let orig = original.get_pixel(x as u32, y as u32).0;
            let mut pixel = [0u8; 3];
            for c in 0..3 {
                pixel[c] = (orig[c] as f32 * 0.6 + heat[c] as f32 * 0.4) as u8;
            }
            blended.put_pixel(x as u32, y as u32, image::Rgb(pixel));
        }
    }

    std::fs::create_dir_all(out_dir)
        .map_err(|e| anyhow::anyhow!("cannot create {}: {e}", out_dir.display()))?;
    let stem = image_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow::anyhow!("image path {} has no stem", image_path.display()))?;
    let out_path = out_dir.join(format!("{stem}.png"));
    blended
        .save(&out_path)
        .map_err(|e| anyhow::anyhow!("cannot write {}: {e}", out_path.display()))?;
    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_grid_selection_by_length() {
        assert_eq!(FeatureGrid::for_len(210).unwrap(), FeatureGrid::Jpm21x10);
        assert_eq!(FeatureGrid::for_len(128).unwrap(), FeatureGrid::Patch16x8);
        let err = FeatureGrid::for_len(64).unwrap_err();
        assert_eq!(err.0, 64);
    }

    #[test]
    fn test_both_layouts_produce_the_part_grid() {
        let device = Device::Cpu;
        let direct = Tensor::randn(0.0f32, 1.0, 210, &device).unwrap();
        let grid = FeatureGrid::Jpm21x10.to_grid(&direct).unwrap();
        assert_eq!(grid.dims(), &[1, 1, 21, 10]);

        let patch = Tensor::randn(0.0f32, 1.0, 128, &device).unwrap();
        let grid = FeatureGrid::Patch16x8.to_grid(&patch).unwrap();
        assert_eq!(grid.dims(), &[1, 1, 21, 10]);
    }

    #[test]
    fn test_pool_features_averages_tokens() {
        let device = Device::Cpu;
        let flat = Tensor::randn(0.0f32, 1.0, 128, &device).unwrap();
        assert_eq!(pool_features(&flat).unwrap().dims(), &[128]);

        let tokens = Tensor::ones((210, 8), candle_core::DType::F32, &device).unwrap();
        let pooled = pool_features(&tokens).unwrap();
        assert_eq!(pooled.dims(), &[210]);
        let values: Vec<f32> = pooled.to_vec1().unwrap();
        assert!(values.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_normalize_spans_unit_interval() {
        let mut values = vec![2.0, 4.0, 3.0];
        normalize_activations(&mut values);
        assert_eq!(values, vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn test_render_writes_png() {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let crop = dir.path().join("0001_c1s1_000001_00.png");
        image::RgbImage::new(32, 64).save(&crop).unwrap();

        let features = Tensor::randn(0.0f32, 1.0, 210, &device).unwrap();
        let out_dir = dir.path().join("heatmaps");
        let written = render_heatmap(&features, &crop, &out_dir).unwrap();
        assert_eq!(written, out_dir.join("0001_c1s1_000001_00.png"));
        let img = image::open(&written).unwrap();
        assert_eq!(img.width(), INPUT_WIDTH as u32);
        assert_eq!(img.height(), INPUT_HEIGHT as u32);
    }

    #[test]
    fn test_render_ignores_activation_offset() {
        // Min-max normalization is shift invariant, so a constant offset
        // on the raw activations must not change the overlay.
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let crop = dir.path().join("0001_c1s1_000001_00.png");
        image::RgbImage::new(32, 64).save(&crop).unwrap();

        let features = Tensor::randn(0.0f32, 1.0, 210, &device).unwrap();
        let shifted = (&features + 100.0).unwrap();
        let plain = render_heatmap(&features, &crop, &dir.path().join("a")).unwrap();
        let offset = render_heatmap(&shifted, &crop, &dir.path().join("b")).unwrap();
        assert_eq!(
            std::fs::read(&plain).unwrap(),
            std::fs::read(&offset).unwrap()
        );
    }

    #[test]
    fn test_render_rejects_unknown_length() {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let crop = dir.path().join("0001_c1s1_000001_00.png");
        image::RgbImage::new(32, 64).save(&crop).unwrap();

        let features = Tensor::randn(0.0f32, 1.0, 64, &device).unwrap();
        let err = render_heatmap(&features, &crop, dir.path()).unwrap_err();
        assert!(err.downcast_ref::<UnsupportedFeatureLen>().is_some());
    }
}
