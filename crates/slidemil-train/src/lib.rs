//! # slidemil-train
//!
//! Momentum-contrastive pretraining of a patch encoder for whole-slide
//! images.
//!
//! ## Crate layout
//!
//! | Module | Purpose |
//! |---|---|
//! | [`config`] | `PretrainConfig`, `RunContext` and their validation |
//! | [`error`] | `TrainError` and its per-concern sub-errors |
//! | [`dataset`] | tiling CSVs, patch manifests, patch sources, view-pair loader |
//! | [`augment`] | two-view augmentation and normalisation |
//! | [`momentum`] | EMA sync, online/momentum encoder pair, batch shuffle |
//! | [`queue`] | bounded FIFO dictionary of negative keys |
//! | [`losses`] | contrastive loss with its query gradient |
//! | [`optim`] | SGD with momentum and weight decay |
//! | [`stats`] | running average, early stopping, checkpoint schedule |
//! | [`checkpoint`] | best / temporary encoder files |
//! | [`trainer`] | the training loop |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use slidemil_train::config::PretrainConfig;
//! use slidemil_train::dataset::SyntheticPatchSource;
//! use slidemil_train::trainer::ContrastiveTrainer;
//!
//! let config = PretrainConfig::default();
//! let backbone = Arc::new(config.model.backbone.stand_in_extractor(config.run.seed).unwrap());
//! let source = SyntheticPatchSource::new(256, config.dataset.patch_size, config.run.seed);
//!
//! let mut trainer = ContrastiveTrainer::new(config, backbone).unwrap();
//! let summary = trainer.run(&source).unwrap();
//! println!("best loss {:.4}", summary.best_loss);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod augment;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod losses;
pub mod momentum;
pub mod optim;
pub mod queue;
pub mod stats;
pub mod trainer;

pub use config::{PretrainConfig, RunContext};
pub use error::{ConfigError, DatasetError, LossError, TrainError, TrainResult};
pub use trainer::{ContrastiveTrainer, EpochStats, PretrainSummary, StepOutcome};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
