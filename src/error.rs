//! Error types shared by the codec, transfer engine, server and client.
//!
//! Client-facing operations convert every variant into an absent result plus
//! a logged diagnostic; the server maps them onto per-connection outcomes.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for the bridge.
#[derive(Debug, Error)]
pub enum Error {
    /// Connect, read or write failure on a socket or file.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Payload is not valid JSON, lacks `action`, or lacks a required field.
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unsupported client action: {0}")]
    UnsupportedAction(String),

    /// Bad local arguments (empty name, zero-length upload, unusable directory).
    #[error("{0}")]
    Validation(String),

    #[error("No write access to: {path:?} ({reason})")]
    Directory { path: PathBuf, reason: String },

    /// Peer closed before the declared size was reached.
    #[error("Error writing {name}")]
    ShortTransfer {
        name: String,
        expected: u64,
        received: u64,
    },

    #[error("Protocol overrun writing {name}: {received} bytes > declared {expected}")]
    ProtocolOverrun {
        name: String,
        expected: u64,
        received: u64,
    },

    /// The executor reported a failure while running a command.
    #[error("Executor error: {0}")]
    Executor(String),

    /// No response within the budget. The remote operation may still be running.
    #[error("Server not responding after {0:?}")]
    Timeout(Duration),

    /// The server answered, but with its `error` field populated.
    #[error("Server error: {0}")]
    Remote(String),

    #[error("Error accessing URL {url}: {reason}")]
    UrlLookup { url: String, reason: String },

    #[error("Operation was cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Result alias for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;
