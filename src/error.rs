//! Error types for the proxy.

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while configuring the proxy or answering a query.
///
/// `Config`, `InvalidSubnet` and `Listen` are startup errors. Everything else is
/// scoped to a single query and ends up as a SERVFAIL reply. The type is
/// `Clone` so one upstream result can be handed to every waiter of an
/// in-flight fetch.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid edns subnet {value:?}: {reason}")]
    InvalidSubnet { value: String, reason: String },

    #[error("cannot resolve DoH endpoint: {0}")]
    EndpointResolution(String),

    #[error("upstream replied with HTTP status {status}")]
    UpstreamHttp { status: u16 },

    #[error("cannot decode upstream response: {0}")]
    UpstreamDecode(String),

    #[error("unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("query timed out")]
    Timeout,

    #[error("cannot listen: {0}")]
    Listen(String),
}

impl Error {
    /// True for errors that must stop the process before it starts serving.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::InvalidSubnet { .. } | Error::Listen(_)
        )
    }
}
