use std::io;

use thiserror::Error;

/// Central error type for the suil engine.
#[derive(Debug, Error)]
pub enum SuilError {
    /// Underlying I/O error from the OS or network.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// An operation did not complete before its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The socket, channel or file the operation needed is gone.
    #[error("resource closed")]
    Closed,

    /// Malformed bytes on a wire protocol (HTTP, WebSocket, RPC envelope).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation is not supported by this adaptor (e.g. sendfile on TLS).
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Worker supervisor failure (spawn, pipe, listener setup).
    #[error("worker error: {0}")]
    Worker(String),

    /// Generic or miscellaneous error.
    #[error("{0}")]
    Other(String),
}

impl SuilError {
    pub fn proto(msg: impl Into<String>) -> Self {
        SuilError::Protocol(msg.into())
    }

    /// True when the error is a plain deadline expiry, which callers on the
    /// accept and keep-alive paths treat as a normal wakeup.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SuilError::Timeout)
    }
}

pub type SuilResult<T> = Result<T, SuilError>;
