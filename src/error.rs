use thiserror::Error;

/// Errors surfaced by the connection core.
///
/// Transient network failures are recovered internally by the reconnect loop
/// and never appear here; only establishment failures, terminal failures, and
/// local contract violations reach callers.
#[derive(Error, Debug)]
pub enum Error {
    /// Establishing the physical connection failed before any caller was
    /// ever connected.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The reconnect budget was exhausted for an established endpoint.
    #[error("reconnect attempts exhausted")]
    RetriesExhausted,

    /// The endpoint was torn down while the operation was in flight.
    #[error("connection closed")]
    Closed,

    /// Local contract violation: an empty destination.
    #[error("invalid destination: {0:?}")]
    InvalidDestination(String),

    /// Transport-level failure reported by the injected transport.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type alias for connection-core operations.
pub type Result<T> = std::result::Result<T, Error>;
