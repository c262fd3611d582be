//! Train subcommand: wires data, model, losses, and optimizers into the
//! epoch driver.

use std::path::PathBuf;

use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap, SGD};
use clap::Args;

use crate::config::EngineConfig;
use crate::data::{BatchedLoader, ImageFolderDataset};
use crate::logging::{CancelToken, Role, TracingLog};
use crate::loss::{CenterLoss, CompositeLoss, ReidLoss};
use crate::metrics::R1MapEvaluator;
use crate::model::PatchEmbedder;
use crate::scheduler::WarmupCosineLr;
use crate::trainer::TrainEngine;

/// Ranks tracked by the retrieval evaluator.
pub const MAX_RANK: usize = 50;

const LABEL_SMOOTH_EPS: f64 = 0.1;

/// Arguments for the train subcommand
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Path to the JSON engine configuration.
    #[arg(long)]
    pub config: PathBuf,

    /// Directory of training crops, named `{pid}_c{camid}...`.
    #[arg(long)]
    pub train_dir: PathBuf,

    /// Directory of query crops for validation.
    #[arg(long)]
    pub query_dir: PathBuf,

    /// Directory of gallery crops for validation.
    #[arg(long)]
    pub gallery_dir: PathBuf,

    /// Samples per batch.
    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,
}

/// Run the train subcommand
pub fn run(args: &TrainArgs, device: &Device) -> anyhow::Result<()> {
    let cfg = EngineConfig::from_path(&args.config)?;
    cfg.validate()?;
    anyhow::ensure!(args.batch_size > 0, "batch_size must be at least 1");

    let train_set = ImageFolderDataset::scan(&args.train_dir, true)?;
    anyhow::ensure!(
        !train_set.is_empty(),
        "no training samples under {}",
        args.train_dir.display()
    );
    let num_classes = train_set.num_ids();
    tracing::info!(
        "training set: {} samples, {} identities",
        train_set.len(),
        num_classes
    );

    let query = ImageFolderDataset::scan(&args.query_dir, false)?;
    let gallery = ImageFolderDataset::scan(&args.gallery_dir, false)?;
    anyhow::ensure!(!query.is_empty(), "no query samples under {}", args.query_dir.display());
    anyhow::ensure!(
        !gallery.is_empty(),
        "no gallery samples under {}",
        args.gallery_dir.display()
    );
    let num_query = query.len();

    let mut train_loader = BatchedLoader::train(train_set, args.batch_size, device.clone());
    let mut val_loader = BatchedLoader::eval(query, gallery, args.batch_size, device.clone());

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = PatchEmbedder::new(vb, &cfg.model, num_classes)?;

    let center = if cfg.has_center_loss() {
        Some(CenterLoss::new(num_classes, cfg.model.feat_dim, device)?)
    } else {
        None
    };
    let loss_fn = CompositeLoss::new(LABEL_SMOOTH_EPS, center, cfg.solver.center_loss_weight);

    let mut optimizer = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: cfg.solver.base_lr,
            ..Default::default()
        },
    )?;
    let mut optimizer_center = SGD::new(loss_fn.center_vars(), cfg.solver.center_lr)?;
    let scheduler = WarmupCosineLr::from_solver(&cfg.solver);
    let mut evaluator = R1MapEvaluator::new(num_query, MAX_RANK, cfg.test.feat_norm);

    let role = Role::from_env(cfg.model.dist_train);
    let log = TracingLog;
    let engine = TrainEngine::new(&cfg, role, &log, CancelToken::new());
    engine.run(
        &model,
        &loss_fn,
        &mut train_loader,
        &mut val_loader,
        &mut optimizer,
        &mut optimizer_center,
        &scheduler,
        &mut evaluator,
        &varmap,
        device,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_batch_size_is_rejected_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("engine.json");
        std::fs::write(
            &config,
            r#"{
                "solver": { "max_epochs": 1 },
                "model": { "name": "reid_test" },
                "test": {},
                "output_dir": "out"
            }"#,
        )
        .unwrap();

        let args = TrainArgs {
            config,
            train_dir: dir.path().join("train"),
            query_dir: dir.path().join("query"),
            gallery_dir: dir.path().join("gallery"),
            batch_size: 0,
        };
        let err = run(&args, &Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }
}
