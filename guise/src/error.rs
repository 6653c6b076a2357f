use std::net::SocketAddrV4;

use thiserror::Error;

/// Main error type for guise.
#[derive(Debug, Error)]
pub enum GuiseError {
    /// No capture interface carries the requested local address
    #[error("cannot find correct interface")]
    NoInterface,

    /// Capture channel or link discovery failed during setup
    #[error("capture setup failed: {0}")]
    Capture(String),

    /// Handshake gave up after its last permitted attempt
    #[error("retry too many times")]
    RetryExhausted,

    /// A read deadline expired; recoverable, handshakes retry on it
    #[error("read from {0}")]
    ReadTimeout(SocketAddrV4),

    /// A write deadline expired before the segment was emitted
    #[error("write to {0}")]
    WriteTimeout(SocketAddrV4),

    /// The capture handle was closed under a pending read
    #[error("read from closed connection")]
    Closed,

    /// `write_to` addressed a peer with no established flow
    #[error("cannot write to {0}")]
    UnknownPeer(SocketAddrV4),

    /// Configuration file or flag errors
    #[error("configuration error: {0}")]
    Conf(String),

    /// Socket and injection plumbing errors
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GuiseError {
    /// Whether the operation may be retried on the same connection.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            GuiseError::ReadTimeout(_) | GuiseError::WriteTimeout(_)
        )
    }
}

/// Type alias for Result with GuiseError
pub type Result<T> = std::result::Result<T, GuiseError>;
