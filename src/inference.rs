//! Inference over a query+gallery split
//!
//! Streams the evaluation loader through the model, optionally renders an
//! attention heatmap per sample, then ranks queries against the gallery.
//! A heatmap failure is confined to its sample: the feature still enters
//! the evaluator and the pass continues.

use anyhow::Context;
use candle_core::Device;

use crate::config::EngineConfig;
use crate::data::EvalLoader;
use crate::heatmap;
use crate::logging::TrainLog;
use crate::metrics::R1MapEvaluator;
use crate::model::ReidModel;

/// Run one retrieval pass and return `(rank-1, rank-5)` accuracy.
pub fn run_inference(
    cfg: &EngineConfig,
    model: &dyn ReidModel,
    loader: &mut dyn EvalLoader,
    evaluator: &mut R1MapEvaluator,
    device: &Device,
    log: &dyn TrainLog,
) -> anyhow::Result<(f32, f32)> {
    log.info("Enter inferencing");
    evaluator.reset();
    loader.reset()?;
    let vis_dir = cfg.vis_dir();
    let mut batch_idx = 0usize;

    while let Some(batch) = loader.next_batch() {
        batch_idx += 1;
        let batch = batch.with_context(|| format!("loading inference batch {batch_idx}"))?;
        let features = model
            .forward(&batch.images, &batch.camids, &batch.viewids)?
            .detach();

        if cfg.test.visualize {
            for (i, path) in batch.paths.iter().enumerate() {
                let row = features.get(i)?;
                if let Err(e) = heatmap::render_heatmap(&row, path, &vis_dir) {
                    log.warn(&format!("skipping heatmap for {}: {e}", path.display()));
                }
            }
        }

        evaluator.update(&features, &batch.pid_labels, &batch.cam_labels)?;
    }

    let summary = evaluator.compute()?;
    log.info("Validation Results");
    log.info(&format!("mAP: {:.1}%", summary.map * 100.0));
    for rank in [1usize, 5, 10] {
        log.info(&format!(
            "CMC curve, Rank-{rank:<3}:{:.1}%",
            summary.cmc[rank - 1] * 100.0
        ));
    }
    device.synchronize()?;
    Ok((summary.cmc[0], summary.cmc[4]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::testutil::VecEvalLoader;
    use crate::data::EvalBatch;
    use crate::logging::MemoryLog;
    use crate::model::PatchEmbedder;
    use candle_core::{DType, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use std::path::{Path, PathBuf};

    fn test_config(output_dir: &Path, feat_dim: usize, visualize: bool) -> EngineConfig {
        let json = format!(
            r#"{{
                "solver": {{ "max_epochs": 1 }},
                "model": {{
                    "name": "reid_test", "feat_dim": {feat_dim},
                    "num_cameras": 4, "num_views": 1
                }},
                "test": {{ "feat_norm": true, "visualize": {visualize} }},
                "output_dir": {:?}
            }}"#,
            output_dir.to_str().unwrap()
        );
        serde_json::from_str(&json).unwrap()
    }

    fn model(cfg: &EngineConfig, device: &Device) -> PatchEmbedder {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        PatchEmbedder::new(vb, &cfg.model, 4).unwrap()
    }

    fn eval_batch(device: &Device, paths: Vec<PathBuf>) -> EvalBatch {
        EvalBatch {
            images: Tensor::randn(0.0f32, 1.0, (4, 3, 256, 128), device).unwrap(),
            camids: Tensor::from_vec(vec![0u32, 0, 1, 1], 4, device).unwrap(),
            viewids: Tensor::from_vec(vec![0u32, 0, 0, 0], 4, device).unwrap(),
            pid_labels: vec![1, 2, 1, 2],
            cam_labels: vec![0, 0, 1, 1],
            paths,
        }
    }

    fn write_crops(dir: &Path) -> Vec<PathBuf> {
        (0..4)
            .map(|i| {
                let path = dir.join(format!("000{i}_c1s1_00000{i}_00.png"));
                image::RgbImage::new(32, 64).save(&path).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_inference_reports_ranks() {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path(), 16, false);
        let model = model(&cfg, &device);
        let mut loader =
            VecEvalLoader::new(vec![eval_batch(&device, vec![PathBuf::new(); 4])], 2);
        let mut evaluator = R1MapEvaluator::new(2, 10, true);
        let log = MemoryLog::new();

        let (r1, r5) =
            run_inference(&cfg, &model, &mut loader, &mut evaluator, &device, &log).unwrap();
        assert!((0.0..=1.0).contains(&r1));
        assert!(r5 >= r1);

        let infos = log.infos();
        assert!(infos.iter().any(|l| l == &"Enter inferencing"));
        assert_eq!(infos.iter().filter(|l| l.starts_with("mAP:")).count(), 1);
        assert_eq!(
            infos.iter().filter(|l| l.starts_with("CMC curve,")).count(),
            3
        );
    }

    #[test]
    fn test_visualize_writes_one_heatmap_per_sample() {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        // feat_dim 128 has a known heatmap layout.
        let cfg = test_config(dir.path(), 128, true);
        let model = model(&cfg, &device);
        let paths = write_crops(dir.path());
        let mut loader = VecEvalLoader::new(vec![eval_batch(&device, paths.clone())], 2);
        let mut evaluator = R1MapEvaluator::new(2, 10, true);
        let log = MemoryLog::new();

        run_inference(&cfg, &model, &mut loader, &mut evaluator, &device, &log).unwrap();

        assert!(log.warns().is_empty());
        for path in &paths {
            let stem = path.file_stem().unwrap().to_str().unwrap();
            assert!(cfg.vis_dir().join(format!("{stem}.png")).exists());
        }
    }

    #[test]
    fn test_unsupported_feature_shape_skips_sample_only() {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        // feat_dim 16 has no heatmap layout; every render fails.
        let cfg = test_config(dir.path(), 16, true);
        let model = model(&cfg, &device);
        let paths = write_crops(dir.path());
        let mut loader = VecEvalLoader::new(vec![eval_batch(&device, paths)], 2);
        let mut evaluator = R1MapEvaluator::new(2, 10, true);
        let log = MemoryLog::new();

        let result =
            run_inference(&cfg, &model, &mut loader, &mut evaluator, &device, &log);
        // Metrics still come out; only the overlays are skipped.
        result.unwrap();
        let warns = log.warns();
        assert_eq!(warns.len(), 4);
        assert!(warns[0].starts_with("skipping heatmap for"));
        assert!(warns[0].contains("no heatmap layout for feature length 16"));
    }
}
