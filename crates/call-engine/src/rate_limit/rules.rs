use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Inbound event names that carry a default limit
pub mod events {
    pub const VISITOR_JOIN: &str = "visitor:join";
    pub const VISITOR_PAGEVIEW: &str = "visitor:pageview";
    pub const VISITOR_INTERACTION: &str = "visitor:interaction";
    pub const VISITOR_REJOIN: &str = "visitor:rejoin";
    pub const CALL_REQUEST: &str = "call:request";
    pub const CALL_ACCEPT: &str = "call:accept";
    pub const CALL_REJECT: &str = "call:reject";
    pub const CALL_CANCEL: &str = "call:cancel";
    pub const CALL_END: &str = "call:end";
    pub const AGENT_LOGIN: &str = "agent:login";
    pub const AGENT_STATUS: &str = "agent:status";
    pub const WEBRTC_SIGNAL: &str = "webrtc:signal";
    pub const COBROWSE_SNAPSHOT: &str = "cobrowse:snapshot";
    pub const COBROWSE_MOUSE: &str = "cobrowse:mouse";
    pub const COBROWSE_SCROLL: &str = "cobrowse:scroll";
}

/// At most `max_requests` per fixed window of `window_secs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimitRule {
    pub const fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window_secs: 60,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Decision for the `count`-th hit inside the current window
    pub fn decide(&self, count: u64) -> RateLimitDecision {
        let max = u64::from(self.max_requests);
        RateLimitDecision {
            allowed: count <= max,
            remaining: Some(max.saturating_sub(count) as u32),
        }
    }
}

/// Result of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// `None` when the event has no limit
    pub remaining: Option<u32>,
}

impl RateLimitDecision {
    pub const fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: None,
        }
    }
}

pub fn default_rules() -> HashMap<String, RateLimitRule> {
    use events::*;

    [
        (CALL_REQUEST, 5),
        (VISITOR_JOIN, 10),
        (VISITOR_PAGEVIEW, 30),
        (VISITOR_INTERACTION, 60),
        (VISITOR_REJOIN, 10),
        (AGENT_STATUS, 30),
        (AGENT_LOGIN, 10),
        (CALL_ACCEPT, 10),
        (CALL_REJECT, 10),
        (CALL_CANCEL, 10),
        (CALL_END, 10),
        (WEBRTC_SIGNAL, 100),
        (COBROWSE_SNAPSHOT, 10),
        (COBROWSE_MOUSE, 300),
        (COBROWSE_SCROLL, 120),
    ]
    .into_iter()
    .map(|(event, max)| (event.to_string(), RateLimitRule::per_minute(max)))
    .collect()
}
