//! # GreetNow Infrastructure Common
//!
//! Shared infrastructure used by every GreetNow router process:
//!
//! - **Shared state** ([`store`]): the key-value seam that lets several router
//!   processes coordinate. Two implementations ship with the crate, an
//!   in-process [`store::MemoryStore`] and a Redis-backed [`store::RedisStore`]
//!   that connects lazily and reconnects with exponential backoff.
//! - **Backoff** ([`store::BackoffPolicy`]): the reconnect schedule used by the
//!   Redis store.
//! - **Logging** ([`logging`]): one-call `tracing-subscriber` setup with env
//!   filtering and optional JSON output.
//! - **Errors** ([`errors`]): the error type shared by the above.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use greetnow_infra_common::store::{MemoryStore, SharedStore};
//!
//! # async fn example() -> greetnow_infra_common::errors::StoreResult<()> {
//! let store = MemoryStore::new();
//! let hits = store.incr_with_expiry("rl:call:request:visitor-1", Duration::from_secs(60)).await?;
//! assert_eq!(hits, 1);
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod logging;
pub mod store;

pub use errors::{LoggingError, StoreError, StoreResult};
pub use store::{BackoffPolicy, ConnectionState, MemoryStore, RedisStore, RedisStoreConfig, SharedStore};
