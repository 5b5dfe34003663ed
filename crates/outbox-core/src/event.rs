//! Parsing of the protocol records the outbox engine consumes.
//!
//! - NIP-65 relay lists (kind 10002): `["r", <url>, <"read"|"write">?]`
//! - Follow lists (kind 3): `["p", <pubkey hex>, <relay hint>?, <petname>?]`

use std::collections::HashMap;

use nostr::{Event, Kind, PublicKey};

use crate::types::{FollowEntry, RelayConfig};
use crate::url::{NormalizeOptions, NormalizeResult, normalize_relay_url_with_opts};

/// Marker on an `r` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayMarker {
    Read,
    Write,
    Both,
}

impl RelayMarker {
    fn from_tag(marker: Option<&str>) -> Self {
        match marker.map(str::trim) {
            Some("read") => Self::Read,
            Some("write") => Self::Write,
            // NIP-65: no marker means the relay is used for both.
            _ => Self::Both,
        }
    }
}

/// Parse a kind 10002 relay-list event into a [`RelayConfig`].
///
/// Malformed or blocked URLs are dropped; duplicates keep their first
/// position. Unmarked entries land in both lists.
pub fn parse_relay_list(event: &Event, opts: &NormalizeOptions, updated_at: u64) -> RelayConfig {
    let mut config = RelayConfig::empty(event.pubkey, updated_at);

    for tag in event.tags.iter() {
        let values = tag.as_slice();
        if values.len() < 2 || values[0] != "r" {
            continue;
        }

        let url = match normalize_relay_url_with_opts(&values[1], opts) {
            NormalizeResult::Ok(url) => url,
            NormalizeResult::Invalid(reason) | NormalizeResult::Blocked(reason) => {
                tracing::trace!(
                    author = %event.pubkey,
                    url = %values[1],
                    %reason,
                    "skipping relay list entry"
                );
                continue;
            }
        };

        let marker = RelayMarker::from_tag(values.get(2).map(String::as_str));
        if matches!(marker, RelayMarker::Write | RelayMarker::Both)
            && !config.write_relays.contains(&url)
        {
            config.write_relays.push(url.clone());
        }
        if matches!(marker, RelayMarker::Read | RelayMarker::Both)
            && !config.read_relays.contains(&url)
        {
            config.read_relays.push(url);
        }
    }

    config
}

/// Parse a kind 3 follow-list event into follow entries.
///
/// Invalid pubkeys are skipped and duplicate authors keep their first entry.
pub fn parse_follow_list(event: &Event, opts: &NormalizeOptions) -> Vec<FollowEntry> {
    let mut seen = std::collections::HashSet::new();
    let mut follows = Vec::new();

    for tag in event.tags.iter() {
        let values = tag.as_slice();
        if values.len() < 2 || values[0] != "p" {
            continue;
        }

        let Ok(author) = PublicKey::from_hex(values[1].trim()) else {
            tracing::trace!(value = %values[1], "skipping invalid p tag");
            continue;
        };
        if !seen.insert(author) {
            continue;
        }

        let relay_hints = values
            .get(2)
            .filter(|hint| !hint.trim().is_empty())
            .and_then(|hint| normalize_relay_url_with_opts(hint, opts).ok())
            .into_iter()
            .collect();

        let alias = values
            .get(3)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        follows.push(FollowEntry {
            author,
            relay_hints,
            alias,
        });
    }

    follows
}

/// Keep only the newest event of `kind` per author.
///
/// Replaceable events can come back from several relays in several versions;
/// the one with the highest `created_at` wins (ties go to the larger id so the
/// choice does not depend on arrival order).
pub fn newest_per_author<I>(events: I, kind: Kind) -> HashMap<PublicKey, Event>
where
    I: IntoIterator<Item = Event>,
{
    let mut newest: HashMap<PublicKey, Event> = HashMap::new();
    for event in events.into_iter().filter(|e| e.kind == kind) {
        match newest.get(&event.pubkey) {
            Some(current)
                if (current.created_at, current.id) >= (event.created_at, event.id) => {}
            _ => {
                newest.insert(event.pubkey, event);
            }
        }
    }
    newest
}
