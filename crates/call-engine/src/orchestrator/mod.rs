//! # Call Orchestration Module
//!
//! The [`PoolManager`] is the heart of the router. It owns every live call
//! in this process and coordinates routing, presence, timers and outbound
//! notifications around them.
//!
//! ## Module Organization
//!
//! - **[`core`]**: the [`PoolManager`] itself, its builder, org routing
//!   configuration and statistics
//! - **[`agents`]**: agent login, status changes and pool memberships, plus
//!   visitor presence
//! - **[`calls`]**: the call state machine (request, offer, accept, reject,
//!   ring-no-answer, end)
//! - **[`connections`]**: transport drops, the reconnection window and
//!   signalling relay
//! - **[`greetings`]**: which agent's recorded greeting each visitor sees
//! - **[`call`]**: call records, states and end reasons
//!
//! ## Call Flow
//!
//! ```text
//!  visitor                    PoolManager                        agent
//!     │  request_call              │                               │
//!     ├───────────────────────────►│ RuleMatcher ─► pool           │
//!     │                            │ PresenceStore ─► candidates   │
//!     │                            │ try_claim_agent (atomic)      │
//!     │   call_requested           │         call_offered          │
//!     │◄───────────────────────────┼──────────────────────────────►│
//!     │                            │  ⏱ RNA timer                  │
//!     │                            │◄──────────────── accept_call ─┤
//!     │   agent_assigned(profile)  │         call_started          │
//!     │◄───────────────────────────┼──────────────────────────────►│
//!     │                            │  ⏱ max duration timer         │
//! ```
//!
//! ## Consistency
//!
//! All transitions go through a single registry lock that is never held
//! across an await. The first event to reach the registry wins; a late
//! accept, reject, cancel or timeout sees `already_resolved` and changes
//! nothing. Across processes, an agent is reserved for a call with one
//! set-if-absent on the shared store before it is rung.
//!
//! Outbound notifications are sent only after the transition has
//! committed. Activity tracking runs in spawned tasks and never delays
//! routing.
//!
//! ## Example
//!
//! ```rust
//! use greetnow_call_engine::notify::ChannelNotifier;
//! use greetnow_call_engine::orchestrator::PoolManagerBuilder;
//! use greetnow_call_engine::routing::OrgConfig;
//! use greetnow_call_engine::types::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> greetnow_call_engine::error::Result<()> {
//! let (notifier, _outbound) = ChannelNotifier::new();
//! let manager = PoolManagerBuilder::new()
//!     .with_notifier(Arc::new(notifier))
//!     .build()?;
//!
//! manager
//!     .set_org_config(OrgConfig::new("acme", Some(PoolId::from("general"))))
//!     .await;
//! manager
//!     .register_agent(
//!         &AgentId::from("alice"),
//!         &SocketId::from("agent-socket"),
//!         AgentProfile::new("alice", "acme", "Alice"),
//!     )
//!     .await;
//! manager
//!     .set_agent_pool_memberships(&AgentId::from("alice"), vec![PoolMembership::new("general", 1)])
//!     .await;
//! manager
//!     .register_visitor(
//!         &VisitorId::from("v1"),
//!         &OrgId::from("acme"),
//!         &SocketId::from("visitor-socket"),
//!         "https://acme.com/pricing",
//!         None,
//!     )
//!     .await;
//!
//! let request = manager.request_call(&VisitorId::from("v1"), None).await?;
//! assert_eq!(request.agent_id, AgentId::from("alice"));
//! # Ok(())
//! # }
//! ```

pub mod agents;
pub mod call;
pub mod calls;
pub mod connections;
pub mod core;
pub mod greetings;
pub(crate) mod registry;

pub use self::core::{ManagerStats, PoolManager, PoolManagerBuilder};
pub use call::{ActiveCall, CallRequest, CallState, CallStats, EndReason};
pub use connections::SignalSource;
pub use greetings::{ReassignReason, Reassignment};
