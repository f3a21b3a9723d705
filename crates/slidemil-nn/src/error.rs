//! Error types for the `slidemil-nn` crate.

use std::path::PathBuf;
use thiserror::Error;

/// Convenient `Result` alias for layer and aggregator operations.
pub type NnResult<T> = Result<T, NnError>;

/// Errors raised by layers, the attention aggregator and the parameter store.
#[derive(Debug, Error)]
pub enum NnError {
    /// An input tensor does not have the shape the layer expects.
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Which layer or operation detected the mismatch.
        context: &'static str,
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// A slide bag with no patches was passed to the aggregator.
    #[error("Slide bag is empty; attention pooling needs at least one patch")]
    EmptyBag,

    /// A layer or aggregator was configured with an unusable value.
    #[error("Invalid configuration for `{field}`: {reason}")]
    InvalidConfig {
        /// Name of the offending field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// Two modules that must share a parameter layout do not.
    #[error("Parameter layout mismatch at `{name}`: {reason}")]
    LayoutMismatch {
        /// Parameter name where the layouts diverge.
        name: String,
        /// Description of the divergence.
        reason: String,
    },

    /// A checkpoint file could not be read or written.
    #[error("Checkpoint I/O error at `{path}`: {source}")]
    CheckpointIo {
        /// File being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A checkpoint file is not a valid parameter map.
    #[error("Malformed checkpoint `{path}`: {source}")]
    CheckpointFormat {
        /// File being parsed.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Strict loading was requested but the key sets differ.
    #[error("Strict checkpoint load failed: {missing} missing, {unexpected} unexpected, {mismatched} shape-mismatched keys")]
    StrictLoad {
        /// Keys expected by the module but absent from the checkpoint.
        missing: usize,
        /// Keys present in the checkpoint but unknown to the module.
        unexpected: usize,
        /// Keys present in both with different shapes.
        mismatched: usize,
    },
}

impl NnError {
    /// Construct a [`NnError::ShapeMismatch`].
    pub fn shape(context: &'static str, expected: Vec<usize>, actual: Vec<usize>) -> Self {
        NnError::ShapeMismatch { context, expected, actual }
    }

    /// Construct a [`NnError::InvalidConfig`].
    pub fn invalid_config<S: Into<String>>(field: &'static str, reason: S) -> Self {
        NnError::InvalidConfig { field, reason: reason.into() }
    }

    /// Construct a [`NnError::LayoutMismatch`].
    pub fn layout<S: Into<String>>(name: impl Into<String>, reason: S) -> Self {
        NnError::LayoutMismatch { name: name.into(), reason: reason.into() }
    }
}
