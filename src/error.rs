//! Error types for the ADO work-item MCP server

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the server.
///
/// Each variant corresponds to one of the failure kinds surfaced to MCP
/// clients through the result envelope; [`Error::kind`] yields the stable
/// slug used in envelope metadata.
#[derive(Error, Debug)]
pub enum Error {
    /// Tool arguments failed schema validation
    #[error("validation error: {0}")]
    Validation(String),

    /// No Azure CLI session or token acquisition failed
    #[error("authentication unavailable: {0}")]
    AuthenticationMissing(String),

    /// Query handle missing from the store or past its TTL
    #[error("query handle not found or expired: {0}")]
    HandleNotFoundOrExpired(String),

    /// Selector refers to an absent index or an unknown criterion
    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    /// Selector requires a context field that was never snapshotted
    #[error("selection context unavailable: {0}")]
    ContextUnavailable(String),

    /// Azure DevOps returned a non-429 error status
    #[error("Azure DevOps request failed ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// 429 after retry exhaustion
    #[error("rate limited by Azure DevOps: {0}")]
    RateLimited(String),

    /// The MCP host offers no sampling capability
    #[error("sampling unavailable: {0}")]
    SamplingUnavailable(String),

    /// The tool call was cancelled by the client
    #[error("operation cancelled")]
    Cancelled,

    /// Request timeout
    #[error("request timeout")]
    Timeout,

    /// HTTP transport error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a new authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Error::AuthenticationMissing(msg.into())
    }

    /// Create a handle-not-found-or-expired error for the given handle id
    pub fn handle_not_found(handle_id: impl Into<String>) -> Self {
        Error::HandleNotFoundOrExpired(handle_id.into())
    }

    /// Create a new invalid-selection error
    pub fn invalid_selection(msg: impl Into<String>) -> Self {
        Error::InvalidSelection(msg.into())
    }

    /// Create a new context-unavailable error
    pub fn context_unavailable(msg: impl Into<String>) -> Self {
        Error::ContextUnavailable(msg.into())
    }

    /// Create a new upstream error from an HTTP status and response body
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Error::Upstream {
            status,
            message: message.into(),
        }
    }

    /// Create a new rate-limited error
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Error::RateLimited(msg.into())
    }

    /// Create a new sampling-unavailable error
    pub fn sampling_unavailable(msg: impl Into<String>) -> Self {
        Error::SamplingUnavailable(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Stable slug identifying the error kind, used in envelope metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "ValidationError",
            Error::AuthenticationMissing(_) => "AuthenticationMissing",
            Error::HandleNotFoundOrExpired(_) => "HandleNotFoundOrExpired",
            Error::InvalidSelection(_) => "InvalidSelection",
            Error::ContextUnavailable(_) => "ContextUnavailable",
            Error::Upstream { .. } => "UpstreamError",
            Error::RateLimited(_) => "RateLimited",
            Error::SamplingUnavailable(_) => "SamplingUnavailable",
            Error::Cancelled => "Cancelled",
            Error::Timeout => "Timeout",
            Error::Http(_) => "UpstreamError",
            Error::Json(_) => "ValidationError",
            Error::Config(_) => "ConfigError",
            Error::Other(_) => "InternalError",
        }
    }
}
