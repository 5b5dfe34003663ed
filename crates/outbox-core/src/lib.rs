//! Core types, protocol parsing, and shared utilities for the outbox feed engine.
//!
//! This crate provides:
//! - The shared data model ([`FollowEntry`], [`RelayConfig`])
//! - Parsing of NIP-65 relay lists and kind 3 follow lists
//! - Relay URL normalization and filtering
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
pub mod metrics;
mod types;
pub mod url;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Maximum number of authors placed in a single relay-list request filter.
pub const MAX_AUTHORS_PER_REQUEST: usize = 150;

/// Relays used when an author has no resolvable relay list.
pub const DEFAULT_FALLBACK_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.primal.net",
];

/// Relays that index relay lists and follow lists (NIP-65 "indexers").
pub const DEFAULT_BOOTSTRAP_RELAYS: &[&str] = &[
    "wss://purplepag.es",
    "wss://relay.damus.io",
    "wss://relay.nostr.band",
];

pub use error::{Error, Result};
pub use event::{newest_per_author, parse_follow_list, parse_relay_list};
pub use types::{FollowEntry, RelayConfig};
pub use url::{
    NormalizeOptions, NormalizeResult, normalize_relay_list, normalize_relay_url,
    normalize_relay_url_with_opts, parse_relay_url,
};

/// Parse a public key given as hex or `npub` bech32.
pub fn parse_public_key(input: &str) -> Result<nostr::PublicKey> {
    nostr::PublicKey::parse(input.trim())
        .map_err(|_| Error::InvalidPublicKey(input.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid_relay_urls() {
        for url in DEFAULT_FALLBACK_RELAYS.iter().chain(DEFAULT_BOOTSTRAP_RELAYS) {
            assert!(normalize_relay_url(url).is_ok(), "{url}");
        }
    }

    #[test]
    fn test_parse_public_key_hex_and_bech32() {
        use nostr::ToBech32;

        let pk = nostr::Keys::generate().public_key();
        assert_eq!(parse_public_key(&pk.to_hex()).unwrap(), pk);
        assert_eq!(parse_public_key(&pk.to_bech32().unwrap()).unwrap(), pk);
        assert!(matches!(
            parse_public_key("bogus"),
            Err(Error::InvalidPublicKey(_))
        ));
    }
}
