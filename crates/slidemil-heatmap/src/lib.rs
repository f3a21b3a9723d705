//! # slidemil-heatmap
//!
//! Attention heatmaps over whole-slide thumbnails.
//!
//! A slide's patch features go through the attention aggregator; the
//! attention weights of one class are scattered onto a grid the size of the
//! tissue mask, smoothed with a Gaussian, colour-mapped by class and
//! alpha-blended over a thumbnail of the slide.
//!
//! | Module | Purpose |
//! |---|---|
//! | [`config`] | `HeatmapConfig`, render parameters, input layout |
//! | [`slide`] | slide reader seam, image-file reader, mask size |
//! | [`grid`] | `HeatmapGrid::scatter` |
//! | [`smooth`] | Gaussian smoothing |
//! | [`colormap`] | class colour maps |
//! | [`composite`] | normalisation and alpha blending |
//! | [`pipeline`] | `HeatmapRenderer::render_slide_heatmap` |

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod colormap;
pub mod composite;
pub mod config;
pub mod error;
pub mod grid;
pub mod pipeline;
pub mod slide;
pub mod smooth;

pub use colormap::ColorMapKind;
pub use composite::{composite, normalize};
pub use config::{HeatmapConfig, RenderConfig, SlideLayout};
pub use error::{HeatmapError, HeatmapResult};
pub use grid::{GridPatch, HeatmapGrid, OverlapPolicy};
pub use pipeline::{render_overlay, HeatmapRenderer, Overlay, RenderedHeatmap, SlideRequest};
pub use slide::{ImageSlideReader, SlideHandle, SlideReader};
pub use smooth::gaussian_smooth;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
