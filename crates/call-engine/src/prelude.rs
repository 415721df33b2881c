//! Common imports for embedding the call engine
//!
//! ```rust
//! use greetnow_call_engine::prelude::*;
//! ```

pub use crate::collaborators::{
    ActivitySink, CacheTtls, CallSettings, CountryPolicy, IdentityVerifier, JwtIdentityVerifier, NoopActivitySink, OrgDirectory,
    StaticOrgDirectory, SubscriptionStatus,
};
pub use crate::config::{CallEngineConfig, CallsConfig};
pub use crate::error::{CallEngineError, CallOpError, Result, RoutingFailure};
pub use crate::gateway::EventGateway;
pub use crate::notify::{AgentEvent, ChannelNotifier, Notifier, OutboundMessage, VisitorEvent};
pub use crate::orchestrator::{
    ActiveCall, CallRequest, CallState, CallStats, EndReason, ManagerStats, PoolManager, PoolManagerBuilder,
    ReassignReason, Reassignment, SignalSource,
};
pub use crate::presence::{DistributedPresenceStore, LocalPresenceStore, PresenceStore};
pub use crate::rate_limit::{events, RateLimitRule, RateLimiter};
pub use crate::routing::{ConditionType, MatchType, OrgConfig, PathRule, PoolMatch, RuleCondition, RuleMatcher};
pub use crate::server::{CallEngineServer, CallEngineServerBuilder};
pub use crate::types::{
    AgentId, AgentProfile, AgentState, AgentStatus, CallId, GreetingAssignment, OrgId, PoolId, PoolMembership,
    SocketId, VisitorId, VisitorLocation, VisitorSession,
};

pub use greetnow_infra_common::{MemoryStore, RedisStore, RedisStoreConfig, SharedStore};
