use thiserror::Error;

/// Error taxonomy surfaced at component boundaries.
///
/// Adapters keep backend-specific detail as message text only; no SDK error
/// type crosses a component boundary.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad request input (missing/invalid slug, missing file)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Shared-secret check failed
    #[error("unauthorized")]
    Unauthorized,

    /// Referenced entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend failure that is worth retrying (timeout, 5xx)
    #[error("{backend} transient failure: {message}")]
    RemoteTransient { backend: &'static str, message: String },

    /// Backend failure that is not known to be retryable
    #[error("{backend} failure: {message}")]
    Remote { backend: &'static str, message: String },
}

impl PipelineError {
    /// Wrap a backend error, keeping only its rendered message
    pub fn remote(backend: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Remote {
            backend,
            message: err.to_string(),
        }
    }

    /// Wrap a timeout or other retryable backend failure
    pub fn transient(backend: &'static str, err: impl std::fmt::Display) -> Self {
        Self::RemoteTransient {
            backend,
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
