//! Error types for the outbox feed engine.
//!
//! None of these reach the caller of the feed operations: resolution and
//! fetch failures degrade into thinner results. They are used internally and
//! by the storage layer.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the engine.
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Nostr SDK error.
    #[error("Nostr SDK error: {0}")]
    NostrSdk(#[from] nostr_sdk::client::Error),

    /// Core parsing error.
    #[error(transparent)]
    Core(#[from] outbox_core::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A relay fetch failed for a reason other than the SDK (used by
    /// alternative `EventFetcher` implementations).
    #[error("Relay error on {relay}: {reason}")]
    Relay {
        /// The relay that failed.
        relay: String,
        /// What went wrong.
        reason: String,
    },
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
