//! Error types for enginewire.

use thiserror::Error;

use crate::protocol::exception::{CrashReport, SerializedException};

/// Main error type for all driver operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// I/O error during socket or pipe operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine closed the connection mid-frame.
    #[error("connection closed by engine")]
    ConnectionClosed,

    /// Protocol error (undocumented status byte, inconsistent lengths, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The engine reported a failure with an empty exception payload;
    /// only the numeric status identifies the error.
    #[error("engine error, status {status}")]
    Engine { status: u8 },

    /// The engine reported a failure with a serialized exception payload.
    #[error("engine exception: {0}")]
    Exception(SerializedException),

    /// The engine requested an intentional crash of the coordinator.
    /// Non-recoverable; the driver is unusable afterwards.
    #[error("engine crash: {0}")]
    Crash(CrashReport),

    /// Operation intentionally unsupported over IPC.
    #[error("{0}")]
    NotImplemented(&'static str),

    /// The engine process failed to come up (exited or closed its output
    /// before the listening handshake).
    #[error("engine startup failed: {0}")]
    Startup(String),
}

/// Result type alias using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;
