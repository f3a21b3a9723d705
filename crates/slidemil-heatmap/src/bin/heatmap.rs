//! `heatmap` binary: render attention heatmaps for slides of one fold.
//!
//! # Usage
//!
//! ```bash
//! heatmap --config heatmap.json --fold fold_0 --slide TCGA-18-3417-01Z-00-DX1
//! heatmap --config heatmap.json --fold fold_1 --slide A --slide B --class 2
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use slidemil_heatmap::{HeatmapConfig, HeatmapRenderer, ImageSlideReader, SlideRequest};
use slidemil_nn::FeatureExtractor;

/// Command-line arguments for the heatmap binary.
#[derive(Parser, Debug)]
#[command(
    name = "heatmap",
    version,
    about = "Attention heatmaps for whole-slide images",
    long_about = None
)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Fold whose aggregator checkpoint is used.
    #[arg(long, default_value = "fold_0")]
    fold: String,

    /// Slide identifier; repeat for several slides.
    #[arg(long = "slide", value_name = "ID", required = true)]
    slides: Vec<String>,

    /// Draw the attention of this class instead of the predicted one.
    #[arg(long, value_name = "CLASS")]
    class: Option<usize>,

    /// Override the output directory from the config.
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

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

    info!("slidemil heatmaps v{}", slidemil_heatmap::VERSION);

    let mut config = match args.config.as_deref() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            match HeatmapConfig::from_json(path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!("Failed to load configuration: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => {
            info!("No configuration file provided, using defaults");
            HeatmapConfig::default()
        }
    };
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }

    let backbone: Arc<dyn FeatureExtractor> = match config.model.backbone.stand_in_extractor(config.run.seed) {
        Ok(bb) => Arc::new(bb),
        Err(e) => {
            error!("Cannot build backbone: {e}");
            std::process::exit(1);
        }
    };

    let requests: Vec<SlideRequest> = args
        .slides
        .iter()
        .map(|id| SlideRequest {
            target_class: args.class,
            ..SlideRequest::from_layout(&config.layout, id, &args.fold)
        })
        .collect();

    let pool = match config.run.thread_pool() {
        Ok(pool) => pool,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let renderer = match HeatmapRenderer::from_checkpoint(config, &args.fold, backbone, Box::new(ImageSlideReader)) {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to initialise renderer: {e}");
            std::process::exit(1);
        }
    };
    info!("Loaded {} using {} as backbone", renderer.config().experiment_name, renderer.config().model.backbone.name());

    let results = pool.install(|| renderer.render_many(&requests));
    let mut failed = 0usize;
    for (request, result) in requests.iter().zip(results) {
        match result {
            Ok(done) => info!(
                "{}: class probabilities {:?}, saved {}",
                done.slide_id,
                done.probabilities.to_vec(),
                done.output_path.display()
            ),
            Err(e) => {
                failed += 1;
                error!("{}: {e}", request.slide_id);
            }
        }
    }
    if failed > 0 {
        error!("{failed} of {} slides failed", requests.len());
        std::process::exit(1);
    }
}
