//! Error types for runq

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using runq Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the host proxy
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A disk backend could not be classified; the disk must not be attached
    #[error("Cannot classify disk {id} at {}", path.display())]
    UnknownDisk { id: String, path: PathBuf },

    /// The single writer queue is full; the message was dropped
    #[error("Control channel queue full")]
    ChannelFull,

    /// The single writer task has stopped
    #[error("Control channel closed")]
    ChannelClosed,

    /// Signal subscription errors
    #[error("Signal error: {0}")]
    Signal(String),

    /// Timeout waiting for the guest
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Protocol wire-format errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] runq_protocol::ProtocolError),
}
