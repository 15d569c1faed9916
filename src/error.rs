//! Error kinds raised while fanning a request out to model backends.

use thiserror::Error;

/// Failure of a single backend invocation.
///
/// Tokenization and template failures never surface here: both are
/// recovered where they happen.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    /// No backend could be loaded for the requested model.
    #[error("failed to load model {model}: {reason}")]
    Resolution { model: String, reason: String },

    /// The model was missing locally and could not be installed.
    #[error("failed to install model {model}: {reason}")]
    Install { model: String, reason: String },

    /// The backend call itself failed, possibly mid-stream.
    #[error("backend inference failed: {0}")]
    Backend(String),

    /// The request's cancellation token fired before the backend finished.
    #[error("inference cancelled")]
    Cancelled,
}

impl InferenceError {
    pub fn resolution(model: &str, err: impl std::fmt::Display) -> Self {
        InferenceError::Resolution {
            model: model.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn install(model: &str, err: impl std::fmt::Display) -> Self {
        InferenceError::Install {
            model: model.to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for InferenceError {
    fn from(err: anyhow::Error) -> Self {
        InferenceError::Backend(format!("{:#}", err))
    }
}
