//! Error types shared across the outbox crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while handling protocol data.
#[derive(Error, Debug)]
pub enum Error {
    /// A relay URL failed normalization.
    #[error("invalid relay URL '{url}': {reason}")]
    InvalidRelayUrl {
        /// The URL as received.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A public key could not be parsed (hex or bech32).
    #[error("invalid public key '{0}'")]
    InvalidPublicKey(String),
}
