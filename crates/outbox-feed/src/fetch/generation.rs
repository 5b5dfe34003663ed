//! Generation-stamped invalidation.
//!
//! Each feed request takes a ticket. Taking a new ticket cancels the previous
//! one, so a slow request that is superseded by a newer one stops fetching
//! and its results are recognisably stale.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// A request's generation and its cancellation token.
#[derive(Debug, Clone)]
pub struct GenerationTicket {
    /// Monotonic generation number, starting at 1.
    pub generation: u64,
    /// Cancelled when a newer ticket is issued.
    pub cancel: CancellationToken,
}

/// Issues generation tickets.
#[derive(Debug, Default)]
pub struct Generations {
    current: AtomicU64,
    token: Mutex<CancellationToken>,
}

impl Generations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation, cancelling the previous one.
    pub fn begin(&self) -> GenerationTicket {
        let cancel = CancellationToken::new();
        let mut token = self.token.lock();
        let generation = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = std::mem::replace(&mut *token, cancel.clone());
        previous.cancel();
        GenerationTicket { generation, cancel }
    }

    /// The latest generation issued (0 before the first).
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Whether `generation` is still the latest.
    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }

    /// Cancel the latest generation without starting a new one.
    pub fn cancel_current(&self) {
        self.token.lock().cancel();
    }
}
