//! Error types for Lanshare.
//!
//! This module provides a unified error type for all engine operations,
//! with specific variants for each failure mode in the transfer pipeline.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// A specialized `Result` type for Lanshare operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Lanshare.
#[derive(Error, Debug)]
pub enum Error {
    /// Could not bind the discovery socket
    #[error("unable to bind discovery socket: {0}")]
    DiscoveryBindFailed(String),

    /// Unable to broadcast on the network
    #[error("unable to broadcast on network: {0}")]
    BroadcastFailed(String),

    /// Peer did not answer the handshake in time
    #[error("no handshake response from {0}")]
    HandshakeTimeout(SocketAddr),

    /// Invalid file size in a file header
    #[error("invalid file size: {0}")]
    InvalidFileSize(i64),

    /// Invalid chunk count in a file header
    #[error("invalid chunk count: {0}")]
    InvalidChunkCount(u32),

    /// Invalid filename length in a file header
    #[error("invalid filename length: {0}")]
    InvalidNameLength(u32),

    /// Filename failed the escape-safety check
    #[error("invalid filename: {0:?}")]
    InvalidFileName(String),

    /// Receiver never signalled readiness
    #[error("receiver not ready: {0}")]
    ReceiverNotReady(String),

    /// A chunk header failed validation
    #[error("invalid chunk header for chunk {index}: {reason}")]
    InvalidChunkHeader {
        /// Chunk index from the header
        index: u32,
        /// What was wrong with it
        reason: String,
    },

    /// A chunk transfer failed after exhausting its retries
    #[error("chunk {index} failed after {attempts} attempts: {reason}")]
    ChunkFailed {
        /// The chunk that failed
        index: u32,
        /// Attempts made before giving up
        attempts: u32,
        /// Last underlying error
        reason: String,
    },

    /// A chunk made no progress for the stall interval
    #[error("chunk {index} stalled: no progress for {secs} seconds")]
    ChunkStalled {
        /// The stalled chunk
        index: u32,
        /// The stall interval that elapsed
        secs: u64,
    },

    /// No free port found for a chunk connection
    #[error("no available port for chunk {0} after {1} attempts")]
    PortExhausted(u32, usize),

    /// The peers could not agree on a port mapping
    #[error("port negotiation failed: {0}")]
    PortNegotiationFailed(String),

    /// Connection lost mid-transfer
    #[error("connection lost during transfer to {0}")]
    ConnectionLost(SocketAddr),

    /// Transfer was cancelled
    #[error("transfer cancelled")]
    Cancelled,

    /// Could not create the save directory
    #[error("cannot create save directory '{0}': {1}")]
    SaveDirectory(String, String),

    /// Invalid protocol message
    #[error("invalid protocol message: {0}")]
    Protocol(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation timeout
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns whether this error is transient and worth retrying at the
    /// chunk-worker level.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::ChunkStalled { .. } | Self::Timeout(_) | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(Error::Timeout(30).is_recoverable());
        assert!(Error::ChunkStalled { index: 2, secs: 60 }.is_recoverable());
        assert!(!Error::InvalidFileName("..".into()).is_recoverable());
        assert!(!Error::Cancelled.is_recoverable());
    }
}
