//! `pretrain` binary: momentum-contrastive pretraining of the patch encoder.
//!
//! # Usage
//!
//! ```bash
//! pretrain --config moco.json
//! pretrain --config moco.json --output-dir runs/moco
//! pretrain --dry-run --dry-run-samples 256
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use slidemil_nn::FeatureExtractor;
use slidemil_train::config::PretrainConfig;
use slidemil_train::dataset::{ImagePatchSource, PatchSource, SyntheticPatchSource};
use slidemil_train::trainer::ContrastiveTrainer;

/// Command-line arguments for the pretraining binary.
#[derive(Parser, Debug)]
#[command(
    name = "pretrain",
    version,
    about = "Momentum-contrastive pretraining for whole-slide image patches",
    long_about = None
)]
struct Args {
    /// Path to the JSON configuration file.
    ///
    /// If not provided, the default `PretrainConfig` is used.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the directory searched for patch manifests.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Override the output directory from the config.
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Train on deterministic synthetic patches instead of real data.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Number of synthetic patches when `--dry-run` is active.
    #[arg(long, default_value_t = 256)]
    dry_run_samples: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let log_level_filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!("slidemil contrastive pretraining v{}", slidemil_train::VERSION);

    let mut config = match args.config.as_deref() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            match PretrainConfig::from_json(path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!("Failed to load configuration: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => {
            info!("No configuration file provided, using defaults");
            PretrainConfig::default()
        }
    };

    if let Some(dir) = args.data_dir {
        config.dataset.root = dir;
    }
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {e}");
        std::process::exit(1);
    }

    info!("  experiment   : {}", config.experiment_name);
    info!("  backbone     : {}", config.model.backbone.name());
    info!("  magnification: {}", config.dataset.magnification);
    info!("  batch size   : {}", config.training.batch_size);
    info!("  num keys     : {}", config.training.num_keys);
    info!("  moco m / tau : {} / {}", config.training.moco_m, config.training.temperature);
    info!("  epochs       : {}", config.training.epochs);
    info!("  seed         : {}", config.run.seed);

    let backbone: Arc<dyn FeatureExtractor> = match config.model.backbone.stand_in_extractor(config.run.seed) {
        Ok(bb) => Arc::new(bb),
        Err(e) => {
            error!("Cannot build backbone: {e}");
            std::process::exit(1);
        }
    };

    if args.dry_run {
        info!("DRY RUN, using synthetic patches ({} samples)", args.dry_run_samples);
        let source = SyntheticPatchSource::new(args.dry_run_samples, config.dataset.patch_size, config.run.seed);
        run_trainer(config, backbone, &source);
    } else {
        info!("Collecting patch manifests under {}", config.dataset.root.display());
        let source = match ImagePatchSource::from_manifest_dir(&config.dataset.root) {
            Ok(src) => src,
            Err(e) => {
                error!("Failed to load dataset: {e}");
                std::process::exit(1);
            }
        };
        if source.is_empty() {
            error!("No patches listed under {}", config.dataset.root.display());
            std::process::exit(1);
        }
        run_trainer(config, backbone, &source);
    }
}

fn run_trainer(config: PretrainConfig, backbone: Arc<dyn FeatureExtractor>, source: &dyn PatchSource) {
    info!("Dataset: {} ({} patches)", source.name(), source.len());
    let mut trainer = match ContrastiveTrainer::new(config, backbone) {
        Ok(t) => t,
        Err(e) => {
            error!("Failed to initialise trainer: {e}");
            std::process::exit(1);
        }
    };
    match trainer.run(source) {
        Ok(summary) => {
            info!(
                "Training finished after {} epochs in {:.1}s: best loss {:.5}{}",
                summary.history.len(),
                summary.total_time_secs,
                summary.best_loss,
                if summary.stopped_early { " (early stop)" } else { "" }
            );
        }
        Err(e) => {
            error!("Training failed: {e}");
            std::process::exit(1);
        }
    }
}
