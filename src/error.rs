//! WolfCoord Error Types

use thiserror::Error;

/// Result type alias for WolfCoord operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfCoord error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Coordination service outcomes
    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Version mismatch on {0}")]
    BadVersion(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Connection to coordination service lost")]
    ConnectionLoss,

    #[error("Coordination session expired")]
    SessionExpired,

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    // Election errors
    #[error("Election error: {0}")]
    Election(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is an expected race on election bookkeeping
    /// (someone else created or removed the node first)
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Error::NodeExists(_) | Error::NoNode(_))
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLoss | Error::Timeout(_)
        )
    }
}
