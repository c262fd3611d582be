//! Eval subcommand: loads a checkpoint and runs one retrieval pass over a
//! query+gallery split.

use std::path::PathBuf;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;

use crate::cmd_train::MAX_RANK;
use crate::config::EngineConfig;
use crate::data::{BatchedLoader, ImageFolderDataset};
use crate::inference::run_inference;
use crate::logging::TracingLog;
use crate::metrics::R1MapEvaluator;
use crate::model::PatchEmbedder;

/// Arguments for the eval subcommand
#[derive(Args, Debug)]
pub struct EvalArgs {
    /// Path to the JSON engine configuration.
    #[arg(long)]
    pub config: PathBuf,

    /// Path to model weights, in safetensors format.
    #[arg(long)]
    pub weights: PathBuf,

    /// Number of identities the checkpoint's classifier head was built for.
    #[arg(long)]
    pub num_classes: usize,

    /// Directory of query crops.
    #[arg(long)]
    pub query_dir: PathBuf,

    /// Directory of gallery crops.
    #[arg(long)]
    pub gallery_dir: PathBuf,

    /// Samples per batch.
    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,
}

/// Run the eval subcommand
pub fn run(args: &EvalArgs, device: &Device) -> anyhow::Result<()> {
    let cfg = EngineConfig::from_path(&args.config)?;
    cfg.validate()?;
    anyhow::ensure!(args.batch_size > 0, "batch_size must be at least 1");

    let query = ImageFolderDataset::scan(&args.query_dir, false)?;
    let gallery = ImageFolderDataset::scan(&args.gallery_dir, false)?;
    anyhow::ensure!(!query.is_empty(), "no query samples under {}", args.query_dir.display());
    anyhow::ensure!(
        !gallery.is_empty(),
        "no gallery samples under {}",
        args.gallery_dir.display()
    );
    let num_query = query.len();
    let mut loader = BatchedLoader::eval(query, gallery, args.batch_size, device.clone());

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = PatchEmbedder::new(vb, &cfg.model, args.num_classes)?;
    varmap.load(&args.weights)?;
    tracing::info!("loaded weights from {}", args.weights.display());

    let mut evaluator = R1MapEvaluator::new(num_query, MAX_RANK, cfg.test.feat_norm);
    let log = TracingLog;
    let (rank1, rank5) = run_inference(&cfg, &model, &mut loader, &mut evaluator, device, &log)?;
    tracing::info!("Rank-1: {:.1}% Rank-5: {:.1}%", rank1 * 100.0, rank5 * 100.0);
    Ok(())
}
