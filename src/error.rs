//! The single error type threaded through every component.

use thiserror::Error;

/// When things go awry.
#[derive(Debug, Error)]
pub enum DnsProxyError {
    /// The query packet failed to parse per RFC 1035 (too short, bad label,
    /// bad compression pointer, qdcount != 1, oversized QNAME).
    #[error("malformed DNS query: {0}")]
    MalformedQuery(String),

    /// The configuration file could not be loaded or a required value was
    /// missing/invalid.
    #[error("startup error: {0}")]
    StartupError(String),

    /// A listener, accept, or readiness-registration call failed.
    #[error("socket error: {0}")]
    SocketError(#[from] std::io::Error),

    /// The policy store returned an error on either the roster load or a
    /// per-query COUNT.
    #[error("policy store error: {0}")]
    PolicyStoreError(#[from] sqlx::Error),

    /// Failed to pack/unpack a `packed_struct` wire type.
    #[error("packing error: {0}")]
    PackingError(#[from] packed_struct::PackingError),

    /// Sending across an internal `tokio::mpsc` work queue failed (the
    /// receiver was dropped, i.e. the owning task has already shut down).
    #[error("send error: {0}")]
    SendError(String),

    /// The upstream reply arrived shorter than the query that was sent,
    /// which looks like truncated garbage rather than a real answer.
    #[error("upstream reply truncated")]
    UpstreamTruncation,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for DnsProxyError {
    fn from(error: tokio::sync::mpsc::error::SendError<T>) -> Self {
        DnsProxyError::SendError(error.to_string())
    }
}
