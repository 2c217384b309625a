//! Error types shared by every transport implementation.

/// Result alias used throughout the transport crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by transports.
///
/// Transient poll failures never reach the caller as errors; they feed the
/// retry machinery and come out through [`TransportEvents::on_error`]
/// instead.
///
/// [`TransportEvents::on_error`]: crate::traits::TransportEvents::on_error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection failed or dropped mid-operation.
    #[error("connection failed: {0}")]
    Connection(String),

    /// No socket implementation is available to this build or host.
    #[error("socket unavailable: {0}")]
    Unavailable(String),

    /// The operation is not supported by this transport.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// A request ran past its deadline.
    #[error("request timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    /// The backend answered with a non-success status.
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// HTTP plumbing failed below the protocol level.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// A frame or response failed to (de)serialize.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// An endpoint could not be parsed or derived.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl Error {
    /// Connection-level failure with a normalized message.
    #[must_use]
    pub fn connection(message: impl std::fmt::Display) -> Self {
        Self::Connection(message.to_string())
    }

    /// No implementation could serve the request.
    #[must_use]
    pub fn unavailable(message: impl std::fmt::Display) -> Self {
        Self::Unavailable(message.to_string())
    }

    /// The transport does not implement this operation.
    #[must_use]
    pub fn unsupported(operation: impl std::fmt::Display) -> Self {
        Self::Unsupported(operation.to_string())
    }

    /// Non-success HTTP response.
    #[must_use]
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Status { status, body: body.into() }
    }

    /// Deadline exceeded.
    #[must_use]
    pub fn timeout(after_ms: u64) -> Self {
        Self::Timeout { after_ms }
    }
}
