//! Error types for BlobVault

use std::io;
use thiserror::Error;

/// Result type alias for BlobVault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// Custom error types for BlobVault
///
/// Request-level failures (bad login, missing key, quota) are not errors in
/// this sense: they travel to the client as a [`crate::protocol::Status`].
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol parse error: {0}")]
    Protocol(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Client error: {0}")]
    Client(String),
}

impl VaultError {
    /// Errors that must take the whole server down rather than one connection
    pub fn is_fatal(&self) -> bool {
        matches!(self, VaultError::Persistence(_))
    }
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for VaultError {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        let detail = match err {
            nom::Err::Incomplete(_) => "incomplete input".to_string(),
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                format!("{:?} with {} bytes left", e.code, e.input.len())
            }
        };
        VaultError::Protocol(format!("Parse error: {}", detail))
    }
}
