//! Shared data model for the outbox engine.

use nostr::PublicKey;
use serde::{Deserialize, Serialize};

/// One author the user follows, as declared in their kind 3 follow list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowEntry {
    /// The followed author.
    pub author: PublicKey,
    /// Inline relay hints from the `p` tag (normalized, possibly empty).
    pub relay_hints: Vec<String>,
    /// Optional petname from the `p` tag.
    pub alias: Option<String>,
}

impl FollowEntry {
    /// A follow entry with no hints and no alias.
    pub fn new(author: PublicKey) -> Self {
        Self {
            author,
            relay_hints: Vec::new(),
            alias: None,
        }
    }

    /// Attach a relay hint.
    pub fn with_hint(mut self, relay: impl Into<String>) -> Self {
        self.relay_hints.push(relay.into());
        self
    }
}

/// Where an author publishes (write relays) and listens (read relays).
///
/// An empty `write_relays` list is a sentinel meaning "no usable relay list
/// was found for this author"; the planner routes such authors to the
/// fallback relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// The author this configuration belongs to.
    pub author: PublicKey,
    /// Write relays, most preferred first.
    pub write_relays: Vec<String>,
    /// Read relays.
    pub read_relays: Vec<String>,
    /// When this entry was resolved (Unix epoch milliseconds).
    pub updated_at: u64,
}

impl RelayConfig {
    /// The "nothing resolvable" sentinel for an author.
    pub fn empty(author: PublicKey, updated_at: u64) -> Self {
        Self {
            author,
            write_relays: Vec::new(),
            read_relays: Vec::new(),
            updated_at,
        }
    }

    /// True when the author has no usable write relays.
    pub fn is_empty(&self) -> bool {
        self.write_relays.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::Keys;

    #[test]
    fn test_empty_sentinel() {
        let author = Keys::generate().public_key();
        let config = RelayConfig::empty(author, 42);
        assert!(config.is_empty());
        assert_eq!(config.updated_at, 42);
    }

    #[test]
    fn test_relay_config_json_roundtrip() {
        let author = Keys::generate().public_key();
        let config = RelayConfig {
            author,
            write_relays: vec!["wss://relay.damus.io".to_string()],
            read_relays: vec![],
            updated_at: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(&author.to_hex()));
        let back: RelayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_follow_entry_builder() {
        let author = Keys::generate().public_key();
        let entry = FollowEntry::new(author).with_hint("wss://nos.lol");
        assert_eq!(entry.relay_hints, vec!["wss://nos.lol"]);
        assert!(entry.alias.is_none());
    }
}
