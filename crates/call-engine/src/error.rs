//! Error types for the call engine
//!
//! Two kinds of failure are kept apart:
//!
//! - [`CallEngineError`]: something went wrong (bad config, rejected login,
//!   rate limit, infrastructure failure).
//! - [`RoutingFailure`] and [`CallOpError`]: normal, expected outcomes of
//!   routing and call operations (nobody available, call already resolved).
//!   They are returned as typed values and never logged as errors.

use greetnow_infra_common::StoreError;
use serde::Serialize;
use thiserror::Error;

/// Main error type for call engine operations
#[derive(Error, Debug)]
pub enum CallEngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Shared store error: {0}")]
    Store(#[from] StoreError),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Visitor not found: {0}")]
    VisitorNotFound(String),

    #[error("Rate limit exceeded for '{event}' by {identifier}")]
    RateLimited { event: String, identifier: String },

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Organization {0} is not accepting calls")]
    OrgInactive(String),

    #[error("Agent {0} is handling a call")]
    AgentBusy(String),

    #[error("Routing failed: {0}")]
    Routing(#[from] RoutingFailure),

    #[error("Call operation failed: {0}")]
    CallOp(#[from] CallOpError),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallEngineError {
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this is an expected outcome rather than a fault
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::Routing(_) | Self::CallOp(_) | Self::RateLimited { .. } | Self::AgentBusy(_) | Self::OrgInactive(_)
        )
    }
}

/// Result type alias for call engine operations
pub type Result<T> = std::result::Result<T, CallEngineError>;

/// Why a call request could not be routed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingFailure {
    #[error("no agent is available")]
    AgentUnavailable,
    #[error("visitor is not connected")]
    VisitorNotFound,
    #[error("visitor already has a call in progress")]
    AlreadyInCall,
    #[error("organization is not accepting calls")]
    OrgInactive,
    #[error("calls are not offered in the visitor's country")]
    CountryBlocked,
}

impl RoutingFailure {
    /// Reason string sent to the visitor widget
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingFailure::AgentUnavailable => "agent_unavailable",
            RoutingFailure::VisitorNotFound => "visitor_not_found",
            RoutingFailure::AlreadyInCall => "already_in_call",
            RoutingFailure::OrgInactive => "org_inactive",
            RoutingFailure::CountryBlocked => "country_blocked",
        }
    }
}

/// Why an accept/reject/cancel did not apply
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOpError {
    #[error("call not found")]
    NotFound,
    #[error("call already resolved")]
    AlreadyResolved,
    /// The accepting agent vanished between the offer and the accept
    #[error("agent is no longer available")]
    AgentUnavailable,
}
