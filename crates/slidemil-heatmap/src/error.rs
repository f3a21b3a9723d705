//! Error type for heatmap rendering.
//!
//! Every variant is fatal for the slide being rendered: no partial heatmap
//! is written.

use slidemil_nn::NnError;
use slidemil_train::error::{ConfigError, DatasetError};
use std::path::PathBuf;
use thiserror::Error;

/// Convenient `Result` alias for this crate.
pub type HeatmapResult<T> = Result<T, HeatmapError>;

/// Failures while turning a slide into a heatmap image.
#[derive(Debug, Error)]
pub enum HeatmapError {
    /// The slide file is missing or cannot be decoded.
    #[error("Cannot open slide {path}: {reason}")]
    SlideOpen {
        /// Slide path.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The tissue mask is missing or cannot be decoded.
    #[error("Cannot open mask {path}: {source}")]
    MaskOpen {
        /// Mask path.
        path: PathBuf,
        /// Underlying decoder error.
        #[source]
        source: image::ImageError,
    },

    /// A patch footprint extends past the grid.
    #[error(
        "Patch {index} at ({row}, {col}) with footprint {size} does not fit a {rows}x{cols} grid"
    )]
    OutOfBounds {
        /// Patch index in tiling order.
        index: usize,
        /// Grid row of the footprint origin.
        row: usize,
        /// Grid column of the footprint origin.
        col: usize,
        /// Footprint side in grid cells.
        size: usize,
        /// Grid rows.
        rows: usize,
        /// Grid columns.
        cols: usize,
    },

    /// Two patch footprints cover the same cell.
    #[error("Patch {index} at ({row}, {col}) overlaps an earlier patch")]
    Overlap {
        /// Patch index in tiling order.
        index: usize,
        /// Grid row of the footprint origin.
        row: usize,
        /// Grid column of the footprint origin.
        col: usize,
    },

    /// Two per-patch sequences that must be index-aligned differ in length.
    #[error("{context}: expected {expected} entries, got {actual}")]
    CountMismatch {
        /// Which sequences disagree.
        context: &'static str,
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// An attention weight is NaN or infinite.
    #[error("Patch {index} has non-finite weight {value}")]
    NonFiniteWeight {
        /// Patch index.
        index: usize,
        /// Offending value.
        value: f32,
    },

    /// Two rasters that must be the same size are not.
    #[error("{context}: expected {expected:?}, got {actual:?}")]
    SizeMismatch {
        /// Which rasters disagree.
        context: &'static str,
        /// Expected `(width, height)`.
        expected: (u32, u32),
        /// Actual `(width, height)`.
        actual: (u32, u32),
    },

    /// The output image cannot be written.
    #[error("Cannot write image {path}: {source}")]
    Encode {
        /// Output path.
        path: PathBuf,
        /// Underlying encoder error.
        #[source]
        source: image::ImageError,
    },

    /// The cached feature matrix cannot be read or written.
    #[error("Feature cache {path}: {reason}")]
    FeatureCache {
        /// Cache file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Filesystem error.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Tiling CSV or patch image error.
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Aggregator, backbone or checkpoint error.
    #[error("Model error: {0}")]
    Model(#[from] NnError),
}

impl HeatmapError {
    /// Construct a [`HeatmapError::SlideOpen`].
    pub fn slide_open<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        HeatmapError::SlideOpen { path: path.into(), reason: reason.into() }
    }

    /// Construct a [`HeatmapError::FeatureCache`].
    pub fn feature_cache<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        HeatmapError::FeatureCache { path: path.into(), reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_bounds_message_names_the_patch() {
        let err = HeatmapError::OutOfBounds { index: 3, row: 10, col: 2, size: 7, rows: 12, cols: 12 };
        let msg = err.to_string();
        assert!(msg.contains("Patch 3"));
        assert!(msg.contains("12x12"));
    }

    #[test]
    fn dataset_errors_convert() {
        let err: HeatmapError = DatasetError::not_found("/nope.csv", "missing").into();
        assert!(matches!(err, HeatmapError::Dataset(_)));
    }
}
