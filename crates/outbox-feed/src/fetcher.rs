//! The connection-pool seam.
//!
//! The engine never talks to relays directly. Everything goes through an
//! [`EventFetcher`], which takes a filter and an explicit relay set and hands
//! back whatever events those relays returned. [`NostrFetcher`] implements it
//! on top of a nostr-sdk [`Client`]; tests use scripted fakes.

use std::future::Future;
use std::time::Duration;

use nostr_sdk::prelude::*;

use crate::{Error, Result};

/// A request filter: author set, kinds, time range and limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedFilter {
    /// Event kinds to request.
    pub kinds: Vec<Kind>,
    /// Authors to request. Filled per relay by the orchestrator.
    pub authors: Vec<PublicKey>,
    /// Only events created at or after this time.
    pub since: Option<Timestamp>,
    /// Only events created at or before this time.
    pub until: Option<Timestamp>,
    /// Maximum number of events per relay.
    pub limit: Option<usize>,
}

impl FeedFilter {
    /// An empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the kinds.
    pub fn kinds<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = Kind>,
    {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// Set the authors.
    pub fn authors<I>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = PublicKey>,
    {
        self.authors = authors.into_iter().collect();
        self
    }

    /// Set the lower time bound.
    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    /// Set the upper time bound.
    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }

    /// Set the per-relay limit.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Copy this filter as a template with a different author set.
    pub fn for_authors(&self, authors: &[PublicKey]) -> Self {
        Self {
            authors: authors.to_vec(),
            ..self.clone()
        }
    }

    /// Convert to a nostr [`Filter`].
    pub fn to_filter(&self) -> Filter {
        let mut filter = Filter::new();
        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds.iter().copied());
        }
        if !self.authors.is_empty() {
            filter = filter.authors(self.authors.iter().copied());
        }
        if let Some(since) = self.since {
            filter = filter.since(since);
        }
        if let Some(until) = self.until {
            filter = filter.until(until);
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        filter
    }
}

/// Fetches events from an explicit set of relays.
///
/// Implementations must be cheap to share (`Arc`) and must give up once
/// `timeout` has passed. Dropping the returned future must abandon the
/// request.
pub trait EventFetcher: Send + Sync + 'static {
    /// Run `filter` against `relays` and collect what comes back.
    fn fetch_events(
        &self,
        filter: FeedFilter,
        relays: Vec<String>,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<Event>>> + Send;
}

/// [`EventFetcher`] backed by a nostr-sdk [`Client`].
///
/// Relays are added to the client's pool the first time they are queried and
/// stay there, so repeated fetches reuse the open connection.
#[derive(Debug, Clone)]
pub struct NostrFetcher {
    client: Client,
}

impl NostrFetcher {
    /// Wrap an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Make sure `url` is in the pool and a connection attempt is running.
    async fn ensure_relay(&self, url: &str) -> Result<()> {
        if self.client.add_relay(url).await? {
            tracing::debug!(relay = %url, "added relay to pool");
        }
        self.client.connect_relay(url).await?;
        Ok(())
    }
}

impl Default for NostrFetcher {
    fn default() -> Self {
        Self::new(Client::default())
    }
}

impl EventFetcher for NostrFetcher {
    async fn fetch_events(
        &self,
        filter: FeedFilter,
        relays: Vec<String>,
        timeout: Duration,
    ) -> Result<Vec<Event>> {
        let mut targets = Vec::with_capacity(relays.len());
        for url in &relays {
            match self.ensure_relay(url).await {
                Ok(()) => targets.push(url.clone()),
                Err(e) => tracing::debug!(relay = %url, error = %e, "failed to add relay"),
            }
        }

        if targets.is_empty() {
            return Err(Error::Relay {
                relay: relays.join(","),
                reason: "no relay could be added to the pool".to_string(),
            });
        }

        let events = self
            .client
            .fetch_events_from(targets, filter.to_filter(), timeout)
            .await?;

        Ok(events.into_iter().collect())
    }
}
