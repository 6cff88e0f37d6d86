//! Error types for fdlink.

use thiserror::Error;

/// Result type alias using fdlink's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for fdlink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A payload does not fit its fixed wire capacity. The whole send is
    /// aborted; nothing is written to the socket.
    #[error("{0} payload exceeds capacity: {1} > {2} bytes")]
    PayloadTooLarge(&'static str, usize, usize),

    /// A received message could not be decoded. The message is dropped;
    /// the connection stays up.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A message referenced a buffer id with no cached descriptor and no
    /// descriptor in flight.
    #[error("unknown buffer id: {0}")]
    UnknownBufferId(i32),

    /// The engine has no live connection to a peer.
    #[error("not connected")]
    NotConnected,

    /// Too many buffers are in flight and unacknowledged.
    #[error("backpressure: {0} buffers outstanding")]
    Backpressure(usize),

    /// No data arrived within the polling timeout.
    #[error("timed out waiting for socket data")]
    Timeout,

    /// The peer signalled end of stream.
    #[error("end of stream")]
    Eos,

    /// The engine is shutting down or was never ready.
    #[error("flushing")]
    Flushing,

    /// An engine failed to start.
    #[error("start failed: {0}")]
    StartFailed(String),

    /// A submitted buffer does not match the negotiated stream mode.
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Whether this error indicates the peer is merely unavailable right
    /// now (the caller may retry later).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NotConnected | Error::Timeout | Error::Backpressure(_))
    }
}
