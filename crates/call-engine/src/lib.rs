//! # GreetNow Call Engine
//!
//! Routes website visitors to live agents over WebRTC calls. A visitor's
//! page URL selects an agent pool; the longest-idle available agent in that
//! pool is rung; the call then moves through an explicit state machine
//! until one side hangs up, a timer fires, or a transport drops for good.
//!
//! ## Architecture
//!
//! ```text
//!   transport dispatcher (WebSocket)                 admin sync (HTTP)
//!            │                                              │
//!            ▼                                              ▼
//!   ┌─────────────────┐                          ┌───────────────────┐
//!   │  EventGateway   │  rate limits, login      │ CallEngineServer  │
//!   └────────┬────────┘                          └─────────┬─────────┘
//!            ▼                                              │
//!   ┌───────────────────────────────────────────────────────▼──────┐
//!   │                          PoolManager                         │
//!   │  RuleMatcher ─ PresenceStore ─ call registry ─ timers ─      │
//!   │  ReconnectionWindowManager ─ OrgDirectory ─ Notifier         │
//!   └──────────────────────────────┬───────────────────────────────┘
//!                                  ▼
//!                     SharedStore (Redis or in-memory)
//! ```
//!
//! ## Modules
//!
//! - [`routing`]: URL to pool resolution ([`routing::RuleMatcher`])
//! - [`rate_limit`]: fixed-window per-event limits
//! - [`presence`]: agent and visitor presence, local or distributed
//! - [`orchestrator`]: the [`PoolManager`] call state machine
//! - [`lifecycle`]: visitor reconnection windows
//! - [`collaborators`]: subscription, activity and identity seams
//! - [`gateway`]: inbound event admission
//! - [`server`]: process wiring and the admin HTTP surface
//! - [`config`]: layered configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use greetnow_call_engine::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<()> {
//! let (notifier, _outbound) = ChannelNotifier::new();
//! let manager = PoolManagerBuilder::new()
//!     .with_notifier(Arc::new(notifier))
//!     .build()?;
//!
//! manager
//!     .set_org_config(OrgConfig::new("acme", Some(PoolId::from("sales"))))
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod config;
pub mod error;
pub mod gateway;
pub mod keys;
pub mod lifecycle;
pub mod notify;
pub mod orchestrator;
pub mod presence;
pub mod rate_limit;
pub mod routing;
pub mod server;
pub mod timer;
pub mod types;

pub mod prelude;

pub use config::CallEngineConfig;
pub use error::{CallEngineError, CallOpError, Result, RoutingFailure};
pub use gateway::EventGateway;
pub use orchestrator::{ActiveCall, CallState, EndReason, PoolManager, PoolManagerBuilder};
pub use server::{CallEngineServer, CallEngineServerBuilder};
