use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use burn::backend::cuda::CudaDevice;
use burn::backend::{Autodiff, Cuda};
use burn::config::Config;
use clap::Parser;
use inpaint_gan::config::{GanType, TrainingConfig};
use inpaint_gan::model::training::train;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type MyBackend = Cuda<f32, i32>;
type MyAutodiffBackend = Autodiff<MyBackend>;

/// Train a two-stage inpainting GAN.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Training configuration (JSON, as written by a previous run).
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Directory for checkpoints, logs and the resolved config.
    #[arg(long, default_value = "runs/default")]
    run_dir: PathBuf,

    /// Root folder of the training images.
    #[arg(long)]
    baseroot: Option<String>,

    /// Checkpoint to resume from: an iteration number or "latest".
    #[arg(long)]
    restore: Option<String>,

    /// Restore from another run's checkpoint store instead of this one.
    #[arg(long)]
    wandb_runpath: Option<String>,

    #[arg(long, value_enum)]
    gan_type: Option<GanType>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => TrainingConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => {
            let baseroot = args
                .baseroot
                .clone()
                .context("either --config or --baseroot is required")?;
            TrainingConfig::new(baseroot)
        }
    };
    if let Some(baseroot) = args.baseroot {
        config.baseroot = baseroot;
    }
    if let Some(restore) = args.restore {
        config.restore = Some(restore);
    }
    if let Some(runpath) = args.wandb_runpath {
        config.wandb_runpath = Some(runpath);
    }
    if let Some(gan_type) = args.gan_type {
        config.gan_type = gan_type;
    }

    let devices: Vec<CudaDevice> = config.devices.iter().map(|&i| CudaDevice::new(i)).collect();
    info!(?devices, gan = ?config.gan_type, run_dir = %args.run_dir.display(), "starting");

    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received, stopping after the current iteration");
        flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install interrupt handler")?;

    train::<MyAutodiffBackend>(&args.run_dir, config, devices, stop)?;
    Ok(())
}
