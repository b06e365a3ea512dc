//! Bus error taxonomy.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// The transport closed while a call was pending. Pending calls on the
    /// connection fail immediately; there is no retry.
    #[error("connection lost")]
    ConnectionLost,

    /// A call was issued against a connection that is already closed.
    #[error("connection {0} is closed")]
    ConnectionClosed(String),

    /// No correlated reply arrived in time. Only the specific call fails;
    /// the caller may retry.
    #[error("request timed out")]
    Timeout,

    /// The remote side answered with an error frame.
    #[error("{0}")]
    Remote(String),

    /// An envelope failed validation at the bus boundary.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A request arrived on a channel nobody handles.
    #[error("no handler registered for channel {0}")]
    NoHandler(String),
}
