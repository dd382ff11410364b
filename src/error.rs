//! Error types for prompt construction and scoring

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = PromptError> = std::result::Result<T, E>;

/// Failures surfaced while building or scoring a prompt.
///
/// Nothing here is retried; the caller decides whether to skip the prompt,
/// substitute a default or abort.
#[derive(Debug, Error)]
pub enum PromptError {
    /// Weight or stop field is not a number, or the fields violate the
    /// weight/stop sign rules.
    #[error("invalid prompt descriptor {descriptor:?}: {reason}")]
    Parse { descriptor: String, reason: String },

    #[error("failed to fetch {identifier:?}: {reason}")]
    Fetch { identifier: String, reason: String },

    #[error("failed to decode image {identifier:?}: {source}")]
    Decode {
        identifier: String,
        #[source]
        source: image::ImageError,
    },

    #[error("shape mismatch: expected {expected}, got {actual:?}")]
    ShapeMismatch { expected: String, actual: Vec<usize> },

    #[error(transparent)]
    Perceptor(#[from] PerceptorError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl PromptError {
    pub(crate) fn parse(descriptor: &str, reason: impl Into<String>) -> Self {
        PromptError::Parse {
            descriptor: descriptor.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn fetch(identifier: &str, reason: impl ToString) -> Self {
        PromptError::Fetch {
            identifier: identifier.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Failures raised by encoder implementations.
#[derive(Debug, Error)]
pub enum PerceptorError {
    #[error("{perceptor}: no embedding for text {text:?}")]
    UnknownText { perceptor: String, text: String },

    #[error("{perceptor} cannot encode {modality}")]
    Unsupported {
        perceptor: String,
        modality: &'static str,
    },

    #[error("embedding table {}: {reason}", .path.display())]
    Table { path: PathBuf, reason: String },

    #[error("no perceptors configured")]
    Empty,

    #[error("failed to download {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
