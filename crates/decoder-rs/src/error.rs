//! Typed failures surfaced by model assembly, import, and persistence.
//!
//! Public entry points return `anyhow::Result`; callers that need to branch on the failure kind
//! recover it with `err.downcast_ref::<ModelError>()`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("shape mismatch for parameter '{parameter}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        parameter: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("missing parameter '{0}'")]
    MissingParameter(String),
    #[error("unexpected parameter '{0}'")]
    UnexpectedParameter(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("backend '{name}' is not available (registered: {available:?})")]
    BackendUnavailable { name: String, available: Vec<String> },
    #[error("unknown layer class '{0}'")]
    UnknownLayer(String),
}

impl ModelError {
    pub fn configuration(message: impl Into<String>) -> Self {
        ModelError::Configuration(message.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        ModelError::InvalidInput(message.into())
    }

    pub fn shape_mismatch(parameter: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        ModelError::ShapeMismatch {
            parameter: parameter.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
