//! Follow list and relay list caches.
//!
//! - [`FollowListResolver`] - kind 3 follow sets, moka-cached per user
//! - [`RelayListCache`] - NIP-65 relay lists per author, TTL plus a
//!   versioned snapshot in a [`SnapshotStore`]
//! - [`SqliteSnapshotStore`] / [`MemorySnapshotStore`] - snapshot backends

mod follows;
mod relay_list;
mod schema;
mod store;

pub use follows::{FollowListConfig, FollowListResolver};
pub use relay_list::{RelayListCache, RelayListCacheConfig, SNAPSHOT_KEY, SNAPSHOT_VERSION};
pub use store::{MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore};
