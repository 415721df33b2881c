//! # Inbound Event Rate Limiting
//!
//! Per-event-type, per-identifier fixed windows. The identifier is whatever
//! the caller keys abuse on: a visitor id, agent id or remote address.
//!
//! Counting happens in the shared store when one is configured, so a visitor
//! hopping between router processes still shares one budget. Whenever the
//! store errors the check falls back to a process-local counter; a rate
//! limiter outage never blocks traffic.
//!
//! ```rust
//! # async fn demo() {
//! use greetnow_call_engine::rate_limit::{events, RateLimiter};
//!
//! let limiter = RateLimiter::local_only(Default::default());
//! for _ in 0..5 {
//!     assert!(limiter.check(events::CALL_REQUEST, "visitor-1").await.allowed);
//! }
//! assert!(!limiter.check(events::CALL_REQUEST, "visitor-1").await.allowed);
//! # }
//! ```

use greetnow_infra_common::SharedStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::keys;

pub mod local;
pub mod rules;

pub use local::LocalWindowCounter;
pub use rules::{default_rules, events, RateLimitDecision, RateLimitRule};

pub struct RateLimiter {
    rules: HashMap<String, RateLimitRule>,
    store: Option<Arc<dyn SharedStore>>,
    local: LocalWindowCounter,
    enabled: bool,
}

impl RateLimiter {
    /// Build a limiter with the default table, with `overrides` replacing
    /// individual entries
    pub fn new(overrides: HashMap<String, RateLimitRule>, store: Option<Arc<dyn SharedStore>>) -> Self {
        let mut rules = default_rules();
        rules.extend(overrides);
        Self {
            rules,
            store,
            local: LocalWindowCounter::new(),
            enabled: true,
        }
    }

    pub fn local_only(overrides: HashMap<String, RateLimitRule>) -> Self {
        Self::new(overrides, None)
    }

    /// A limiter that allows everything
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::local_only(HashMap::new())
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.store.is_some()
    }

    pub fn rule(&self, event: &str) -> Option<&RateLimitRule> {
        self.rules.get(event)
    }

    /// Count one `event` from `identifier` and decide whether it may proceed.
    /// Never fails.
    pub async fn check(&self, event: &str, identifier: &str) -> RateLimitDecision {
        if !self.enabled {
            return RateLimitDecision::unlimited();
        }
        let Some(rule) = self.rules.get(event) else {
            return RateLimitDecision::unlimited();
        };

        let key = keys::rate_limit(event, identifier);
        let count = match &self.store {
            Some(store) => match store.incr_with_expiry(&key, rule.window()).await {
                Ok(count) => count,
                Err(e) => {
                    warn!("⚠️ Rate limit store unavailable, counting locally: {}", e);
                    self.local.hit(&key, rule.window())
                }
            },
            None => self.local.hit(&key, rule.window()),
        };

        let decision = rule.decide(count);
        if !decision.allowed {
            debug!(
                "🚫 Rate limit exceeded: {} by {} ({} in {}s)",
                event, identifier, count, rule.window_secs
            );
        }
        decision
    }

    /// Drop closed local windows. Driven by the server's maintenance loop.
    pub fn cleanup_expired(&self) -> usize {
        self.local.cleanup_expired()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rules", &self.rules.len())
            .field("distributed", &self.is_distributed())
            .field("enabled", &self.enabled)
            .finish()
    }
}
