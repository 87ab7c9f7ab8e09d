//! Error types for runq-init

use runq_protocol::{ProtocolError, SignalKind};
use thiserror::Error;

use crate::harden::HardenError;

/// Result type alias using the init error
pub type Result<T> = std::result::Result<T, InitError>;

/// Errors that end the guest control loop or abort boot
#[derive(Error, Debug)]
pub enum InitError {
    /// Control channel framing or sequencing errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Fatal hardening errors
    #[error("Hardening failed: {0}")]
    Harden(#[from] HardenError),

    /// The supervised or a hook process could not be started
    #[error("Failed to start {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Signal delivery to a guest process failed
    #[error("Failed to deliver {signal} to pid {pid}: {source}")]
    Deliver {
        signal: SignalKind,
        pid: i32,
        #[source]
        source: nix::Error,
    },

    /// Control channel setup errors
    #[error("Channel error: {0}")]
    Channel(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call errors
    #[error("System error: {0}")]
    System(#[from] nix::Error),
}
