//! # Shared State Store
//!
//! The seam through which router processes coordinate. Every cross-process
//! invariant (rate-limit windows, agent reservations, presence records) is
//! expressed with the small set of atomic primitives on [`SharedStore`]:
//!
//! | Primitive | Semantics |
//! |-----------|-----------|
//! | [`SharedStore::incr_with_expiry`] | increment a counter, arming its expiry on the first hit |
//! | [`SharedStore::set_if_absent`] | write only when no value exists |
//! | [`SharedStore::compare_and_set`] | write only when the current value equals an expected value |
//! | [`SharedStore::delete_if_equals`] | delete only when the current value matches |
//! | [`SharedStore::set_add`] / [`SharedStore::set_remove`] | add or remove one member of an unordered set |
//!
//! Values and sets live in separate keys; a key is only ever used as one or
//! the other.
//!
//! ## Implementations
//!
//! - [`MemoryStore`]: in-process map with TTLs measured on the tokio clock.
//!   Used for single-process deployments and tests; an outage can be
//!   simulated with [`MemoryStore::set_available`].
//! - [`RedisStore`]: Redis over a multiplexed async connection. Connects
//!   lazily, reconnects in the background with [`BackoffPolicy`], and gives up
//!   (loudly) once the schedule is exhausted.
//!
//! Callers are expected to treat [`crate::StoreError::Unavailable`] as a cue to
//! fall back to process-local state rather than as a hard failure.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::errors::StoreResult;

pub mod backoff;
pub mod memory;
pub mod redis_store;

pub use backoff::BackoffPolicy;
pub use memory::MemoryStore;
pub use redis_store::{ConnectionState, RedisStore, RedisStoreConfig};

/// Key-value store shared by every router process
#[async_trait]
pub trait SharedStore: Send + Sync + fmt::Debug {
    /// Whether the store is currently believed reachable. Never blocks.
    fn is_connected(&self) -> bool;

    /// Atomically increment `key`. The expiry is armed only when the counter
    /// is created, so the window is fixed from the first hit.
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> StoreResult<u64>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Write `value` only if `key` holds nothing. Returns whether it was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool>;

    /// Write `value` only if the current value equals `expected`
    /// (`None` meaning "absent"). Returns whether it was written.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Delete `key` only if it currently holds `expected`
    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Add `member` to the set at `key`. A `ttl` (re)arms the expiry of the
    /// whole set. Returns whether the member was new.
    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> StoreResult<bool>;

    /// Returns whether the member was present
    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn set_len(&self, key: &str) -> StoreResult<u64>;
}
