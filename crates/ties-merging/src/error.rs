//! Error types for TIES merging

use thiserror::Error;

/// Model merging errors
#[derive(Debug, Error)]
pub enum MergeError {
    /// Tensor shape disagrees with the initial model (or with its own data)
    #[error("Shape mismatch in '{layer}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        layer: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Fine-tuned model does not carry the initial model's layer set
    #[error(
        "Layer mismatch in model '{model}': missing {missing:?}, unexpected {unexpected:?}"
    )]
    LayerMismatch {
        model: String,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    /// No fine-tuned models to merge
    #[error("No fine-tuned models provided")]
    EmptyInput,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl MergeError {
    /// True for key-set or shape disagreements between models
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::ShapeMismatch { .. } | Self::LayerMismatch { .. })
    }
}

impl From<serde_json::Error> for MergeError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Result type for merge operations
pub type Result<T> = std::result::Result<T, MergeError>;
