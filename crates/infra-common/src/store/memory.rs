use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use super::SharedStore;
use crate::errors::{StoreError, StoreResult};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: impl Into<String>, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            value: value.into(),
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, Default)]
struct StoredSet {
    members: HashSet<String>,
    expires_at: Option<Instant>,
}

impl StoredSet {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`SharedStore`]
///
/// Each primitive runs under the owning DashMap shard lock, so it is atomic
/// with respect to every other caller in the process. Expiry uses the tokio
/// clock, which keeps paused-time tests deterministic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    sets: DashMap<String, StoredSet>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage. While unavailable every call fails with
    /// [`StoreError::Unavailable`] and `is_connected` reports false.
    pub fn set_available(&self, available: bool) {
        if !available {
            warn!("🔌 Memory store marked unavailable");
        }
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.len();
        self.entries.retain(|_, v| !v.is_expired(now));
        self.sets.retain(|_, s| !s.is_expired(now) && !s.members.is_empty());
        before.saturating_sub(self.len())
    }

    /// Number of keys (values and sets), expired ones included until purged
    pub fn len(&self) -> usize {
        self.entries.len() + self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.sets.is_empty()
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn live_value(&self, key: &str, now: Instant) -> Option<String> {
        let value = self
            .entries
            .get(key)
            .and_then(|entry| (!entry.is_expired(now)).then(|| entry.value.clone()));
        if value.is_none() {
            self.entries.remove_if(key, |_, v| v.is_expired(now));
        }
        value
    }

    fn with_live_set<T>(&self, key: &str, read: impl FnOnce(&HashSet<String>) -> T) -> Option<T> {
        let now = Instant::now();
        let result = self
            .sets
            .get(key)
            .and_then(|set| (!set.is_expired(now)).then(|| read(&set.members)));
        if result.is_none() {
            self.sets.remove_if(key, |_, s| s.is_expired(now));
        }
        result
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    fn is_connected(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> StoreResult<u64> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::new("0", Some(window), now));
        if entry.is_expired(now) {
            *entry = StoredValue::new("0", Some(window), now);
        }
        let current: u64 = entry.value.parse().map_err(|_| StoreError::InvalidValue {
            key: key.to_string(),
            reason: format!("'{}' is not a counter", entry.value),
        })?;
        let next = current + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.ensure_available()?;
        Ok(self.live_value(key, Instant::now()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.ensure_available()?;
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl, Instant::now()));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        self.ensure_available()?;
        let now = Instant::now();
        let written = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredValue::new(value, ttl, now));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl, now));
                true
            }
        };
        Ok(written)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.ensure_available()?;
        let now = Instant::now();
        let written = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let current = (!current.is_expired(now)).then_some(current.value.as_str());
                if current == expected {
                    occupied.insert(StoredValue::new(value, ttl, now));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(StoredValue::new(value, ttl, now));
                    true
                } else {
                    false
                }
            }
        };
        Ok(written)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.ensure_available()?;
        self.entries.remove(key);
        self.sets.remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.ensure_available()?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, v| !v.is_expired(now) && v.value == expected)
            .is_some())
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut set = self.sets.entry(key.to_string()).or_default();
        if set.is_expired(now) {
            *set = StoredSet::default();
        }
        if let Some(ttl) = ttl {
            set.expires_at = Some(now + ttl);
        }
        Ok(set.members.insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.ensure_available()?;
        let now = Instant::now();
        let removed = match self.sets.get_mut(key) {
            Some(mut set) if !set.is_expired(now) => set.members.remove(member),
            _ => false,
        };
        self.sets.remove_if(key, |_, s| s.members.is_empty() || s.is_expired(now));
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.ensure_available()?;
        Ok(self
            .with_live_set(key, |members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_len(&self, key: &str) -> StoreResult<u64> {
        self.ensure_available()?;
        Ok(self
            .with_live_set(key, |members| members.len() as u64)
            .unwrap_or(0))
    }
}
