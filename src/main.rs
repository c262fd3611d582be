//! Person re-identification training and retrieval evaluation with Candle
//!
//! This binary trains a re-identification model over identity-labeled
//! person crops and evaluates retrieval quality (CMC ranks and mAP) on a
//! query+gallery split.

mod cmd_eval;
mod cmd_train;
mod config;
mod data;
mod heatmap;
mod inference;
mod logging;
mod loss;
mod meter;
mod metrics;
mod model;
mod preprocess;
mod scaler;
mod scheduler;
mod step;
mod trainer;

use candle_core::{Device, Result};
use clap::{Parser, Subcommand};

/// Select the compute device
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        println!("Running on CPU, to run on GPU, build this binary with `--features cuda`");
        Ok(Device::Cpu)
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model and periodically validate retrieval quality.
    Train(cmd_train::TrainArgs),
    /// Evaluate a checkpoint on a query+gallery split.
    Eval(cmd_eval::EvalArgs),
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let device = device(cli.cpu)?;
    tracing::info!("using device: {:?}", device);

    match &cli.command {
        Command::Train(args) => cmd_train::run(args, &device),
        Command::Eval(args) => cmd_eval::run(args, &device),
    }
}
