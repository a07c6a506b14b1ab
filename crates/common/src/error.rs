//! Error types for the Custom Installer Builder

use thiserror::Error;

use crate::partition::PartitionError;
use crate::validation::ValidationError;

/// Result type alias using the builder Error
pub type Result<T> = std::result::Result<T, Error>;

/// Builder error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Partition(#[from] PartitionError),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Packaging error: {0}")]
    Packaging(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Whether the error was caused by user input rather than the server.
    pub fn is_user_error(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::Partition(_))
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        Error::Crypto(e.to_string())
    }
}
