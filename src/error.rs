//! Error type shared by every component of the crate.
//!
//! Construction-time problems (bad parameters, shape mismatches, composition
//! rule violations) and run-time numeric failures are all reported through
//! [`DnnError`]. Nothing is retried or swallowed.

use thiserror::Error;

/// Errors produced by layers, the network container and the training loop.
#[derive(Debug, Error)]
pub enum DnnError {
    /// A constructor argument is out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid learning rate {0}: must be in (0, 1]")]
    InvalidLearningRate(f32),

    #[error("unknown decay policy '{0}': expected one of hyperbolic, sqrt_inv, log_inv")]
    UnknownDecayPolicy(String),

    #[error("unknown activation '{0}': expected one of none, tanh, sigmoid, relu")]
    UnknownActivation(String),

    /// A layer cannot be attached to the network at its requested position.
    #[error("layer '{layer}' cannot be added: {reason}")]
    StructuralMismatch { layer: String, reason: String },

    /// Auxiliary input count outside 1..=100.
    #[error("invalid number of auxiliary inputs: {0} (expected 1..=100)")]
    InvalidFanIn(usize),

    #[error("duplicate layer name '{0}'")]
    DuplicateName(String),

    #[error("layer not found: {0}")]
    LayerNotFound(String),

    /// Tensor shapes disagree with what the operation expects.
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    /// NaN or infinity detected in a forward or backward result.
    #[error("non-finite value in layer '{layer}' during {stage}")]
    NonFinite { layer: String, stage: &'static str },

    /// Iteration counters start at 1.
    #[error("invalid iteration {0}: must be >= 1")]
    InvalidIteration(usize),

    #[error("layer '{0}' has no forward state matching this backward call")]
    MissingForwardState(String),

    /// The network bookkeeping disagrees with its contents.
    #[error("corrupted network: {0}")]
    Corrupted(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DnnError>;

impl DnnError {
    pub(crate) fn dims(
        context: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        DnnError::DimensionMismatch {
            context: context.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
