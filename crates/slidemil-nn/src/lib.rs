//! # slidemil-nn
//!
//! Pure-`ndarray` building blocks shared by the pretraining and heatmap
//! crates:
//!
//! - [`linear::Linear`] and [`projection::ProjectionHead`] with hand-written
//!   backward passes, enough to train a contrastive projection head on CPU.
//! - [`aggregator::AttentionAggregator`], the attention-MIL pooling model
//!   that turns a bag of patch embeddings into slide logits and per-class
//!   attention maps.
//! - [`backbone`], the capability record of a patch backbone and the
//!   [`backbone::FeatureExtractor`] seam.
//! - [`params`], named parameters and the JSON checkpoint format.
//!
//! ## Architecture
//!
//! ```text
//! BackboneKind ──resolve──► BackboneSpec ──► AggregatorConfig ──► AttentionAggregator
//!                                │
//!                                └────────► ProjectionConfig ──► ProjectionHead
//!
//! Parameterized (Linear | BatchNorm1d | ProjectionHead | AttentionAggregator)
//!       │
//!       └──► ParamStore::save / load / load_into
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ndarray::Array2;
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//! use slidemil_nn::{AggregatorConfig, AttentionAggregator, BackboneKind, PoolingMode};
//!
//! let spec = BackboneKind::Resnet34.resolve(128, 4, true);
//! let config = AggregatorConfig::from_spec(spec, true, 0.2, PoolingMode::SingleChannel);
//! let model = AttentionAggregator::new(config, &mut StdRng::seed_from_u64(33)).unwrap();
//!
//! let bag = Array2::<f32>::zeros((10, 512));
//! let out = model.forward(bag.view()).unwrap();
//! println!("predicted class {}", out.predicted_class());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregator;
pub mod backbone;
pub mod error;
pub mod linear;
pub mod params;
pub mod projection;

pub use aggregator::{AggregatorConfig, AggregatorOutput, AttentionAggregator, PoolingMode};
pub use backbone::{BackboneKind, BackboneSpec, FeatureExtractor, RandomProjectionBackbone};
pub use error::{NnError, NnResult};
pub use linear::{Linear, LinearGrads};
pub use params::{Gradients, LoadMode, LoadReport, ParamStore, Parameterized, StoredTensor};
pub use projection::{BatchNorm1d, ProjectionConfig, ProjectionHead};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
