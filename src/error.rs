//! Error types for Aether

use thiserror::Error;

/// Main error type for Aether
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Replay detected")]
    Replay,

    #[error("Rule error: {0}")]
    Rule(String),

    #[error("Geodata error: {0}")]
    Geo(String),

    #[error("Remote error {code:#06x}: {message}")]
    Remote { code: u16, message: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

impl From<web_transport_quinn::WriteError> for Error {
    fn from(e: web_transport_quinn::WriteError) -> Self {
        Error::Transport(e.to_string())
    }
}

/// Result type alias for Aether
pub type Result<T> = std::result::Result<T, Error>;
