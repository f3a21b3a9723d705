//! Error types for the contrastive pretraining pipeline.
//!
//! ## Hierarchy
//!
//! ```text
//! TrainError (top-level)
//! ├── ConfigError   (config validation / file loading)
//! ├── DatasetError  (tiling CSVs, patch images, batching)
//! ├── LossError     (numerical failures inside a training step)
//! └── NnError       (layers, parameter layouts, checkpoints)
//! ```
//!
//! [`LossError`] is kept apart from [`DatasetError`] so that the training
//! loop can tell a bad step from bad data; see [`TrainError::is_numerical`].

use slidemil_nn::NnError;
use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// TrainResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used by orchestration-level functions.
pub type TrainResult<T> = Result<T, TrainError>;

// ---------------------------------------------------------------------------
// TrainError
// ---------------------------------------------------------------------------

/// Top-level error type for pretraining.
#[derive(Debug, Error)]
pub enum TrainError {
    /// A configuration validation or loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A dataset loading or access error.
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    /// A numerical failure in the loss for one step.
    #[error("Loss error: {0}")]
    Loss(#[from] LossError),

    /// A layer, parameter layout or checkpoint error.
    #[error("Model error: {0}")]
    Model(#[from] NnError),

    /// The patch pool cannot fill a single batch.
    #[error("Dataset has {len} patches, fewer than one batch of {batch_size}")]
    NotEnoughPatches {
        /// Patches available.
        len: usize,
        /// Configured batch size.
        batch_size: usize,
    },

    /// The worker pool could not be built.
    #[error("Cannot build thread pool: {0}")]
    ThreadPool(String),
}

impl TrainError {
    /// `true` when a single step produced NaN or infinity. Such steps may be
    /// skipped; every other class, an invalid temperature included, is fatal
    /// to the run.
    pub fn is_numerical(&self) -> bool {
        matches!(self, TrainError::Loss(LossError::NonFinite { .. }))
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when loading or validating a configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A configuration file could not be read from or written to disk.
    #[error("Cannot access config file `{path}`: {source}")]
    FileRead {
        /// Path that was being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file is malformed or lacks a required field.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// DatasetError
// ---------------------------------------------------------------------------

/// Errors produced while reading tiling metadata or patch images.
///
/// Missing data is never papered over: a slide whose metadata cannot be read
/// produces no output at all.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// A required file or directory was not found.
    #[error("Data not found at `{path}`: {message}")]
    DataNotFound {
        /// Path that was expected to exist.
        path: PathBuf,
        /// Additional context.
        message: String,
    },

    /// A CSV file could not be parsed.
    #[error("Cannot read CSV `{path}`: {source}")]
    Csv {
        /// Offending file.
        path: PathBuf,
        /// Underlying CSV error.
        #[source]
        source: csv::Error,
    },

    /// A file was found but a row or field is malformed.
    #[error("Invalid data format in `{path}`: {message}")]
    InvalidFormat {
        /// Path of the malformed file.
        path: PathBuf,
        /// Description of the problem.
        message: String,
    },

    /// The paths CSV and the coordinates CSV disagree on the patch count.
    #[error("Patch count mismatch: `{paths}` lists {path_count} patches, `{coords}` lists {coord_count}")]
    CountMismatch {
        /// Paths CSV.
        paths: PathBuf,
        /// Number of rows in the paths CSV.
        path_count: usize,
        /// Coordinates CSV.
        coords: PathBuf,
        /// Number of rows in the coordinates CSV.
        coord_count: usize,
    },

    /// A patch image could not be opened or decoded.
    #[error("Cannot decode image `{path}`: {source}")]
    Image {
        /// Image path.
        path: PathBuf,
        /// Underlying decoder error.
        #[source]
        source: image::ImageError,
    },

    /// A sample index is out of bounds.
    #[error("Index {idx} out of bounds (dataset has {len} patches)")]
    IndexOutOfBounds {
        /// The requested index.
        idx: usize,
        /// Total number of patches.
        len: usize,
    },

    /// A low-level I/O error.
    #[error("I/O error reading `{path}`: {source}")]
    IoError {
        /// Path being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl DatasetError {
    /// Construct a [`DatasetError::DataNotFound`].
    pub fn not_found<S: Into<String>>(path: impl Into<PathBuf>, msg: S) -> Self {
        DatasetError::DataNotFound { path: path.into(), message: msg.into() }
    }

    /// Construct a [`DatasetError::InvalidFormat`].
    pub fn invalid_format<S: Into<String>>(path: impl Into<PathBuf>, msg: S) -> Self {
        DatasetError::InvalidFormat { path: path.into(), message: msg.into() }
    }
}

// ---------------------------------------------------------------------------
// LossError
// ---------------------------------------------------------------------------

/// Failures of the contrastive loss for one step.
#[derive(Debug, Error)]
pub enum LossError {
    /// The temperature is not a usable positive number.
    #[error("Temperature must be finite and > 0, got {0}")]
    InvalidTemperature(f32),

    /// Query, key and dictionary widths or batch sizes disagree.
    #[error("Loss input shape mismatch ({context}): expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Which input was inconsistent.
        context: &'static str,
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Activations, the loss or its gradient contain NaN or infinity.
    #[error("Non-finite value ({value}) in contrastive step {step}")]
    NonFinite {
        /// Offending loss value.
        value: f32,
        /// Global step index, `0` when unknown.
        step: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_non_finite_loss_is_numerical() {
        let loss: TrainError = LossError::NonFinite { value: f32::NAN, step: 3 }.into();
        assert!(loss.is_numerical());

        let data: TrainError = DatasetError::not_found("/missing.csv", "no such file").into();
        assert!(!data.is_numerical());

        let temp: TrainError = LossError::InvalidTemperature(0.0).into();
        assert!(!temp.is_numerical());
    }

    #[test]
    fn count_mismatch_message_names_both_files() {
        let err = DatasetError::CountMismatch {
            paths: "a_paths.csv".into(),
            path_count: 3,
            coords: "a_coords.csv".into(),
            coord_count: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("a_paths.csv") && msg.contains("a_coords.csv"));
    }
}
