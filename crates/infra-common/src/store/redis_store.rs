use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{BackoffPolicy, SharedStore};
use crate::errors::{StoreError, StoreResult};

const INCR_WITH_EXPIRY: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

// ARGV: has_expected ("0"/"1"), expected, value, ttl_ms (0 = none)
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
local matches
if ARGV[1] == '0' then
  matches = (current == false)
else
  matches = (current == ARGV[2])
end
if not matches then
  return 0
end
if tonumber(ARGV[4]) > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#;

const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Connection settings for [`RedisStore`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisStoreConfig {
    /// `redis://` or `rediss://` URL
    pub url: String,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout_ms: 10_000,
            command_timeout_ms: 2_000,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            max_reconnect_attempts: 10,
        }
    }
}

impl RedisStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.max_reconnect_attempts,
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Where the store is in its connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection attempted yet; the first command connects
    Idle,
    Connecting,
    Connected,
    /// Background reconnect in progress (1-based attempt number)
    Reconnecting { attempt: u32 },
    /// Backoff schedule exhausted; needs [`RedisStore::reconnect`]
    Abandoned,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            ConnectionState::Abandoned => write!(f, "abandoned"),
        }
    }
}

struct ConnectionSlot {
    connection: Mutex<Option<MultiplexedConnection>>,
    state: Mutex<ConnectionState>,
    connected: AtomicBool,
}

impl ConnectionSlot {
    fn install(&self, connection: MultiplexedConnection) {
        *self.connection.lock() = Some(connection);
        *self.state.lock() = ConnectionState::Connected;
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Forget the current connection. Returns false if it was already gone.
    fn invalidate(&self) -> bool {
        let had_connection = self.connection.lock().take().is_some();
        self.connected.store(false, Ordering::SeqCst);
        had_connection
    }
}

/// Redis-backed [`SharedStore`]
///
/// The connection is established lazily by the first command (or eagerly
/// with [`RedisStore::connect`]). When it fails or drops, commands fail fast
/// with [`StoreError::Unavailable`] while a background task reconnects on the
/// configured [`BackoffPolicy`]. Once the schedule is exhausted the store stays
/// [`ConnectionState::Abandoned`] and an error is logged; it never retries
/// silently forever.
pub struct RedisStore {
    client: Client,
    config: RedisStoreConfig,
    slot: Arc<ConnectionSlot>,
    incr_script: Script,
    cas_script: Script,
    delete_if_script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.config.url)
            .field("state", &self.connection_state())
            .finish()
    }
}

impl RedisStore {
    /// Validate the URL and build the store. Does not connect.
    pub fn new(config: RedisStoreConfig) -> StoreResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Config(format!("invalid redis url '{}': {}", config.url, e)))?;

        Ok(Self {
            client,
            config,
            slot: Arc::new(ConnectionSlot {
                connection: Mutex::new(None),
                state: Mutex::new(ConnectionState::Idle),
                connected: AtomicBool::new(false),
            }),
            incr_script: Script::new(INCR_WITH_EXPIRY),
            cas_script: Script::new(COMPARE_AND_SET),
            delete_if_script: Script::new(DELETE_IF_EQUALS),
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.slot.state.lock()
    }

    /// Connect now instead of on first use. On failure the background
    /// reconnect loop is started and the error is returned.
    pub async fn connect(&self) -> StoreResult<()> {
        self.connection().await.map(|_| ())
    }

    /// Restart the reconnect loop after the store was abandoned
    pub fn reconnect(&self) {
        if self.slot.connected.load(Ordering::SeqCst) {
            return;
        }
        info!("🔄 Operator requested Redis reconnect");
        self.spawn_reconnect();
    }

    async fn connection(&self) -> StoreResult<MultiplexedConnection> {
        if let Some(connection) = self.slot.connection.lock().clone() {
            return Ok(connection);
        }

        {
            let mut state = self.slot.state.lock();
            match *state {
                ConnectionState::Idle => *state = ConnectionState::Connecting,
                ConnectionState::Connected => {
                    // Invalidated concurrently; the reconnect loop owns recovery
                    return Err(StoreError::Unavailable("connection lost".to_string()));
                }
                other => return Err(StoreError::Unavailable(format!("redis {}", other))),
            }
        }

        match connect_once(&self.client, self.config.connect_timeout()).await {
            Ok(connection) => {
                info!("✅ Connected to Redis at {}", self.config.url);
                self.slot.install(connection.clone());
                Ok(connection)
            }
            Err(e) => {
                warn!("❌ Initial Redis connection failed: {}", e);
                *self.slot.state.lock() = ConnectionState::Idle;
                self.spawn_reconnect();
                Err(e)
            }
        }
    }

    fn spawn_reconnect(&self) {
        {
            let mut state = self.slot.state.lock();
            if matches!(*state, ConnectionState::Reconnecting { .. } | ConnectionState::Connecting) {
                return;
            }
            *state = ConnectionState::Reconnecting { attempt: 0 };
        }

        let slot = self.slot.clone();
        let client = self.client.clone();
        let policy = self.config.backoff();
        let connect_timeout = self.config.connect_timeout();

        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                let Some(delay) = policy.delay_for(attempt) else {
                    error!(
                        "❌ Giving up on Redis after {} reconnect attempts; shared state is degraded to local-only",
                        attempt
                    );
                    *slot.state.lock() = ConnectionState::Abandoned;
                    return;
                };
                attempt += 1;
                *slot.state.lock() = ConnectionState::Reconnecting { attempt };
                debug!("Redis reconnect attempt {} in {:?}", attempt, delay);
                tokio::time::sleep(delay).await;

                match connect_once(&client, connect_timeout).await {
                    Ok(connection) => {
                        slot.install(connection);
                        info!("✅ Redis reconnected after {} attempt(s)", attempt);
                        return;
                    }
                    Err(e) => warn!("⚠️ Redis reconnect attempt {} failed: {}", attempt, e),
                }
            }
        });
    }

    /// Run one command against the current connection, invalidating it (and
    /// starting the reconnect loop) when the failure is about reachability.
    async fn run<T, F, Fut>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let connection = self.connection().await?;
        let outcome = tokio::time::timeout(self.config.command_timeout(), op(connection))
            .await
            .map_err(|_| StoreError::Unavailable("redis command timed out".to_string()))
            .and_then(|result| result.map_err(StoreError::from));

        if let Err(err) = &outcome {
            if err.is_unavailable() && self.slot.invalidate() {
                warn!("🔌 Redis connection lost: {}", err);
                self.spawn_reconnect();
            }
        }
        outcome
    }
}

async fn connect_once(client: &Client, timeout: Duration) -> StoreResult<MultiplexedConnection> {
    match tokio::time::timeout(timeout, client.get_multiplexed_async_connection()).await {
        Ok(Ok(connection)) => Ok(connection),
        Ok(Err(e)) => Err(StoreError::Unavailable(e.to_string())),
        Err(_) => Err(StoreError::Unavailable(format!("connect timed out after {:?}", timeout))),
    }
}

fn ttl_millis(ttl: Option<Duration>) -> u64 {
    ttl.map(|ttl| ttl.as_millis().max(1) as u64).unwrap_or(0)
}

#[async_trait]
impl SharedStore for RedisStore {
    fn is_connected(&self) -> bool {
        self.slot.connected.load(Ordering::SeqCst)
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> StoreResult<u64> {
        let invocation = {
            let mut invocation = self.incr_script.prepare_invoke();
            invocation.key(key).arg(ttl_millis(Some(window)));
            invocation
        };
        self.run(|mut connection| async move {
            let count: u64 = invocation.invoke_async(&mut connection).await?;
            Ok(count)
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.run(|mut connection| async move {
            let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut connection).await?;
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.run(|mut connection| async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_millis(Some(ttl)));
            }
            let _: () = cmd.query_async(&mut connection).await?;
            Ok(())
        })
        .await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        self.run(|mut connection| async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value).arg("NX");
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_millis(Some(ttl)));
            }
            let reply: Option<String> = cmd.query_async(&mut connection).await?;
            Ok(reply.is_some())
        })
        .await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let invocation = {
            let mut invocation = self.cas_script.prepare_invoke();
            invocation
                .key(key)
                .arg(if expected.is_some() { "1" } else { "0" })
                .arg(expected.unwrap_or(""))
                .arg(value)
                .arg(ttl_millis(ttl));
            invocation
        };
        self.run(|mut connection| async move {
            let written: i64 = invocation.invoke_async(&mut connection).await?;
            Ok(written == 1)
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.run(|mut connection| async move {
            let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut connection).await?;
            Ok(())
        })
        .await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let invocation = {
            let mut invocation = self.delete_if_script.prepare_invoke();
            invocation.key(key).arg(expected);
            invocation
        };
        self.run(|mut connection| async move {
            let removed: i64 = invocation.invoke_async(&mut connection).await?;
            Ok(removed > 0)
        })
        .await
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        self.run(|mut connection| async move {
            let added: i64 = match ttl {
                Some(ttl) => {
                    let (added,): (i64,) = redis::pipe()
                        .atomic()
                        .cmd("SADD")
                        .arg(key)
                        .arg(member)
                        .cmd("PEXPIRE")
                        .arg(key)
                        .arg(ttl_millis(Some(ttl)))
                        .ignore()
                        .query_async(&mut connection)
                        .await?;
                    added
                }
                None => redis::cmd("SADD").arg(key).arg(member).query_async(&mut connection).await?,
            };
            Ok(added > 0)
        })
        .await
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.run(|mut connection| async move {
            let removed: i64 = redis::cmd("SREM").arg(key).arg(member).query_async(&mut connection).await?;
            Ok(removed > 0)
        })
        .await
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.run(|mut connection| async move {
            let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut connection).await?;
            Ok(members)
        })
        .await
    }

    async fn set_len(&self, key: &str) -> StoreResult<u64> {
        self.run(|mut connection| async move {
            let len: u64 = redis::cmd("SCARD").arg(key).query_async(&mut connection).await?;
            Ok(len)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_url() {
        let err = RedisStore::new(RedisStoreConfig::new("not a url")).unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn starts_idle_and_disconnected() {
        let store = RedisStore::new(RedisStoreConfig::default()).unwrap();
        assert_eq!(store.connection_state(), ConnectionState::Idle);
        assert!(!store.is_connected());
    }

    #[test]
    fn config_maps_to_backoff_policy() {
        let config = RedisStoreConfig::default();
        let policy = config.backoff();
        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn ttl_is_at_least_one_millisecond() {
        assert_eq!(ttl_millis(None), 0);
        assert_eq!(ttl_millis(Some(Duration::from_micros(10))), 1);
        assert_eq!(ttl_millis(Some(Duration::from_secs(60))), 60_000);
    }

    #[tokio::test]
    async fn unreachable_server_fails_fast_and_gives_up() {
        let config = RedisStoreConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connect_timeout_ms: 200,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            max_reconnect_attempts: 2,
            ..Default::default()
        };
        let store = RedisStore::new(config).unwrap();

        let err = store.get("anything").await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(!store.is_connected());

        let mut abandoned = false;
        for _ in 0..100 {
            if store.connection_state() == ConnectionState::Abandoned {
                abandoned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(abandoned, "store should give up after the backoff schedule");

        // Abandoned stores fail immediately without retrying
        assert!(store.get("anything").await.unwrap_err().is_unavailable());
    }
}
