//! Error surface returned to facade callers.

use bytes::Bytes;

pub type Result<T> = std::result::Result<T, Error>;

/// Represents errors that can occur in filesystem operations.
///
/// `AccessDenied` is recoverable by re-authenticating at a higher layer.
/// `Usage` indicates a caller mistake and should not be retried.
/// `Cancelled` is always surfaced as-is, never remapped.
/// `Image` carries the raw payload of a failed thumbnail fetch so a caller
/// can render a provider-specific error image instead of crashing a view.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("access denied")]
    AccessDenied,

    #[error("invalid operation: {0}")]
    Usage(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("thumbnail fetch failed with a {} byte payload", .0.len())]
    Image(Bytes),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Opaque passthrough for provider-specific failures.
    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

impl Error {
    pub fn usage(message: impl Into<String>) -> Self {
        Error::Usage(message.into())
    }

    pub fn not_supported(operation: impl Into<String>) -> Self {
        Error::NotSupported(operation.into())
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Error::Provider(anyhow::anyhow!(message.into()))
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, Error::AccessDenied)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
