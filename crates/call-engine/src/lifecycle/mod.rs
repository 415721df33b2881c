//! # Call Lifecycle Management
//!
//! Timed phases of a call that outlive a single event. Today that is the
//! visitor reconnection window:
//!
//! ```text
//!   active ──visitor transport drops──► waiting_for_reconnection
//!                                            │
//!             ┌──────── rejoin (same visitor, current token) ────────┐
//!             ▼                                                       │
//!          active  (new socket, rotated token)              window expires
//!                                                                     │
//!                                                                     ▼
//!                                                     ended(reconnect_failed)
//! ```
//!
//! The [`ReconnectionWindowManager`] owns only the timers. The call records
//! live with the pool manager, which implements [`ReconnectHost`] so the
//! manager can check tokens and hand back expiries and rejoins.

pub mod reconnect;

pub use reconnect::{ReconnectHost, ReconnectionWindowManager, DEFAULT_RECONNECT_WINDOW};
