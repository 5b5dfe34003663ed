//! Scripted fakes shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nostr::{Event, EventBuilder, Keys, Kind, Tag, Timestamp};
use parking_lot::Mutex;

use crate::fetcher::{EventFetcher, FeedFilter};
use crate::{Error, Result};

/// What a scripted relay does when queried.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Serve matching events from the shared universe.
    Serve,
    /// Return exactly these events.
    Fixed(Vec<Event>),
    /// Fail with a relay error.
    Fail,
}

#[derive(Debug, Clone)]
struct Script {
    delay: Duration,
    reply: Reply,
}

/// One recorded call to [`FakeFetcher::fetch_events`].
#[derive(Debug, Clone)]
pub struct FetchCall {
    pub filter: FeedFilter,
    pub relays: Vec<String>,
}

/// An [`EventFetcher`] driven by per-relay scripts.
///
/// Relays without a script serve matching events from the universe
/// immediately.
#[derive(Debug, Default)]
pub struct FakeFetcher {
    universe: Mutex<Vec<Event>>,
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<FetchCall>>,
    offline: AtomicBool,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_events<I: IntoIterator<Item = Event>>(&self, events: I) {
        self.universe.lock().extend(events);
    }

    pub fn script(&self, relay: &str, delay: Duration, reply: Reply) {
        self.scripts
            .lock()
            .insert(relay.to_string(), Script { delay, reply });
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().clone()
    }

    pub fn queried_relays(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .flat_map(|c| c.relays.iter().cloned())
            .collect()
    }
}

impl EventFetcher for FakeFetcher {
    async fn fetch_events(
        &self,
        filter: FeedFilter,
        relays: Vec<String>,
        _timeout: Duration,
    ) -> Result<Vec<Event>> {
        self.calls.lock().push(FetchCall {
            filter: filter.clone(),
            relays: relays.clone(),
        });

        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Relay {
                relay: relays.join(","),
                reason: "offline".to_string(),
            });
        }

        let script = {
            let scripts = self.scripts.lock();
            relays.iter().find_map(|r| scripts.get(r).cloned())
        }
        .unwrap_or(Script {
            delay: Duration::ZERO,
            reply: Reply::Serve,
        });

        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }

        match script.reply {
            Reply::Fail => Err(Error::Relay {
                relay: relays.join(","),
                reason: "scripted failure".to_string(),
            }),
            Reply::Fixed(events) => Ok(events),
            Reply::Serve => Ok(self
                .universe
                .lock()
                .iter()
                .filter(|e| filter.kinds.is_empty() || filter.kinds.contains(&e.kind))
                .filter(|e| filter.authors.is_empty() || filter.authors.contains(&e.pubkey))
                .cloned()
                .collect()),
        }
    }
}

/// A signed text note.
pub fn note(keys: &Keys, content: &str, created_at: u64) -> Event {
    EventBuilder::text_note(content)
        .custom_created_at(Timestamp::from(created_at))
        .sign_with_keys(keys)
        .unwrap()
}

/// A signed NIP-65 relay list. `None` marker means "read and write".
pub fn relay_list(keys: &Keys, relays: &[(&str, Option<&str>)], created_at: u64) -> Event {
    let tags: Vec<Tag> = relays
        .iter()
        .map(|&(url, marker)| match marker {
            Some(m) => Tag::parse(["r", url, m]).unwrap(),
            None => Tag::parse(["r", url]).unwrap(),
        })
        .collect();
    EventBuilder::new(Kind::RelayList, "")
        .tags(tags)
        .custom_created_at(Timestamp::from(created_at))
        .sign_with_keys(keys)
        .unwrap()
}

/// A signed kind 3 follow list.
pub fn follow_list(keys: &Keys, follows: &[(&Keys, Option<&str>)]) -> Event {
    let tags: Vec<Tag> = follows
        .iter()
        .map(|&(k, hint)| {
            let hex = k.public_key().to_hex();
            match hint {
                Some(h) => Tag::parse(["p", hex.as_str(), h]).unwrap(),
                None => Tag::parse(["p", hex.as_str()]).unwrap(),
            }
        })
        .collect();
    EventBuilder::new(Kind::ContactList, "")
        .tags(tags)
        .sign_with_keys(keys)
        .unwrap()
}
