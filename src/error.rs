//! Error types for the frame-echo server.
//!
//! Errors are split by blast radius:
//! - `FrameError`: scoped to one session, never leaves it
//! - `ServerError`: listener/process level, decides the exit status

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors produced by the frame codec and observed by a session.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Outgoing payload is longer than the encoder allows.
    #[error("frame too large: {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Peer advertised a frame length above the configured maximum.
    #[error("protocol violation: advertised length {len} exceeds maximum of {max}")]
    ProtocolViolation { len: usize, max: usize },

    /// Stream ended part way through a frame.
    #[error("connection closed mid-frame")]
    ConnectionClosed,

    /// Underlying socket error (reset, broken pipe, ...).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by the listener to the process entry point.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Fatal error on the listening socket; the accept loop has stopped.
    #[error("accept loop failed on {addr}: {source}")]
    Accept {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Admission rejected because the session ceiling was reached.
    #[error("session limit of {limit} reached")]
    CapacityExceeded { limit: usize },
}

/// Result type alias for listener operations.
pub type Result<T> = std::result::Result<T, ServerError>;
