//! Error types for vhub operations.

/// Alias for `Result<T, vhub::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by device and aggregate operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A command was submitted while no socket was open.
    ///
    /// Reported synchronously; the client does not queue across reconnects.
    #[error("not connected")]
    NotConnected,

    /// The device answered `NAK`.
    #[error("command rejected by device")]
    Rejected,

    /// An id-or-label selector did not resolve to a known port.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The aggregate planner found no hop chain to the requested output.
    #[error("no route to output {0:?}")]
    Unreachable(String),

    /// The connection dropped before the command's reply arrived.
    ///
    /// The command may or may not have been applied; re-issue after the
    /// next connect notification.
    #[error("connection lost before reply")]
    ConnectionLost,

    /// A socket-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
