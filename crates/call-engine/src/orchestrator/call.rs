//! Call records and the state machine edges

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::types::{AgentId, CallId, OrgId, PoolId, SocketId, VisitorId};

/// Lifecycle state of a call
///
/// ```text
/// (none) ─► pending ─► ringing ─► accepted ─► active ◄──► waiting_for_reconnection
///              ▲          │
///              └──────────┘  reject / ring-no-answer (re-offer)
///
/// every non-ended state ─► ended
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Pending,
    Ringing,
    Accepted,
    Active,
    WaitingForReconnection,
    Ended,
}

impl CallState {
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Ended, _) => false,
            (_, Ended) => true,
            (Pending, Ringing) => true,
            (Ringing, Accepted) | (Ringing, Pending) => true,
            (Accepted, Active) => true,
            (Active, WaitingForReconnection) => true,
            (WaitingForReconnection, Active) => true,
            _ => false,
        }
    }

    /// The visitor is still waiting for someone to pick up
    pub fn is_unanswered(&self) -> bool {
        matches!(self, CallState::Pending | CallState::Ringing)
    }

    /// An agent has picked up and the call has not ended
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            CallState::Accepted | CallState::Active | CallState::WaitingForReconnection
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Pending => "pending",
            CallState::Ringing => "ringing",
            CallState::Accepted => "accepted",
            CallState::Active => "active",
            CallState::WaitingForReconnection => "waiting_for_reconnection",
            CallState::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    NoAgent,
    AllRejected,
    RnaTimeout,
    ReconnectFailed,
    AgentEnded,
    AgentDisconnected,
    VisitorEnded,
    VisitorCancelled,
    VisitorDisconnected,
    MaxDurationExceeded,
    AgentUnavailable,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::NoAgent => "no_agent",
            EndReason::AllRejected => "all_rejected",
            EndReason::RnaTimeout => "rna_timeout",
            EndReason::ReconnectFailed => "reconnect_failed",
            EndReason::AgentEnded => "agent_ended",
            EndReason::AgentDisconnected => "agent_disconnected",
            EndReason::VisitorEnded => "visitor_ended",
            EndReason::VisitorCancelled => "visitor_cancelled",
            EndReason::VisitorDisconnected => "visitor_disconnected",
            EndReason::MaxDurationExceeded => "max_duration_exceeded",
            EndReason::AgentUnavailable => "agent_unavailable",
        }
    }

    /// Reasons that mean "nobody could take the call" rather than a hang-up
    pub fn is_routing_outcome(&self) -> bool {
        matches!(
            self,
            EndReason::NoAgent
                | EndReason::AllRejected
                | EndReason::RnaTimeout
                | EndReason::AgentUnavailable
                | EndReason::AgentDisconnected
        )
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call tracked by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveCall {
    pub call_id: CallId,
    pub visitor_id: VisitorId,
    /// Socket the visitor was on when the call was requested or last rejoined
    pub visitor_socket_id: SocketId,
    pub org_id: OrgId,
    /// Set while ringing and after an agent accepts
    pub agent_id: Option<AgentId>,
    pub pool_id: PoolId,
    pub page_url: String,
    pub state: CallState,
    pub requested_at: DateTime<Utc>,
    pub ring_started_at: Option<DateTime<Utc>>,
    pub answered_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    pub reconnect_token: Option<String>,
    /// Agents that rejected or missed this call
    pub declined_agents: Vec<AgentId>,
    pub ring_timeout_seconds: u64,
    pub max_duration_seconds: u64,
}

impl ActiveCall {
    pub fn new(
        call_id: CallId,
        visitor_id: VisitorId,
        visitor_socket_id: SocketId,
        org_id: OrgId,
        pool_id: PoolId,
        page_url: impl Into<String>,
        ring_timeout: Duration,
        max_duration: Duration,
    ) -> Self {
        Self {
            call_id,
            visitor_id,
            visitor_socket_id,
            org_id,
            agent_id: None,
            pool_id,
            page_url: page_url.into(),
            state: CallState::Pending,
            requested_at: Utc::now(),
            ring_started_at: None,
            answered_at: None,
            connected_at: None,
            ended_at: None,
            end_reason: None,
            reconnect_token: None,
            declined_agents: Vec::new(),
            ring_timeout_seconds: ring_timeout.as_secs(),
            max_duration_seconds: max_duration.as_secs(),
        }
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_seconds)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_seconds)
    }

    pub fn is_ended(&self) -> bool {
        self.state == CallState::Ended
    }

    /// Whether `agent_id` is the agent currently ringing or on this call
    pub fn is_assigned_to(&self, agent_id: &AgentId) -> bool {
        self.agent_id.as_ref() == Some(agent_id)
    }
}

/// What `request_call` hands back once an agent is ringing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub call_id: CallId,
    pub visitor_id: VisitorId,
    pub agent_id: AgentId,
    pub pool_id: PoolId,
    pub requested_at: DateTime<Utc>,
    pub ring_timeout_seconds: u64,
}

/// Counts of live calls by state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStats {
    pub pending: usize,
    pub ringing: usize,
    pub accepted: usize,
    pub active: usize,
    pub waiting_for_reconnection: usize,
}

impl CallStats {
    pub fn total(&self) -> usize {
        self.pending + self.ringing + self.accepted + self.active + self.waiting_for_reconnection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CallState::*;

    const ALL: [CallState; 6] = [Pending, Ringing, Accepted, Active, WaitingForReconnection, Ended];

    #[test]
    fn only_listed_edges_are_allowed() {
        let allowed = [
            (Pending, Ringing),
            (Ringing, Accepted),
            (Ringing, Pending),
            (Accepted, Active),
            (Active, WaitingForReconnection),
            (WaitingForReconnection, Active),
        ];
        for from in ALL {
            for to in ALL {
                let expected = allowed.contains(&(from, to)) || (from != Ended && to == Ended);
                assert_eq!(from.can_transition_to(to), expected, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn end_reasons_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&EndReason::MaxDurationExceeded).unwrap(),
            "\"max_duration_exceeded\""
        );
        assert_eq!(EndReason::RnaTimeout.to_string(), "rna_timeout");
        assert!(EndReason::AllRejected.is_routing_outcome());
        assert!(!EndReason::AgentEnded.is_routing_outcome());
    }
}
