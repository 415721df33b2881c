//! Outbound notifications
//!
//! The engine never writes to a transport directly. Every side effect meant
//! for a participant becomes an [`OutboundMessage`] addressed by socket
//! reference and handed to a [`Notifier`]. Delivery is fire-and-forget; a
//! stale socket reference simply goes nowhere.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::orchestrator::call::EndReason;
use crate::orchestrator::greetings::ReassignReason;
use crate::types::{AgentId, AgentProfile, CallId, PoolId, SocketId, VisitorId};

/// Events delivered to an agent's dashboard
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    #[serde(rename_all = "camelCase")]
    CallOffered {
        call_id: CallId,
        visitor_id: VisitorId,
        page_url: String,
        pool_id: Option<PoolId>,
        ring_timeout_seconds: u64,
    },
    /// The offer was withdrawn (visitor left, missed, or re-routed)
    #[serde(rename_all = "camelCase")]
    CallCancelled { call_id: CallId, reason: EndReason },
    MarkedAway { reason: String },
    #[serde(rename_all = "camelCase")]
    CallStarted {
        call_id: CallId,
        visitor_id: VisitorId,
        reconnect_token: String,
    },
    #[serde(rename_all = "camelCase")]
    CallReconnecting {
        call_id: CallId,
        message: String,
        timeout_seconds: u64,
    },
    #[serde(rename_all = "camelCase")]
    CallReconnected {
        call_id: CallId,
        visitor_id: VisitorId,
        reconnect_token: String,
    },
    #[serde(rename_all = "camelCase")]
    CallEnded { call_id: CallId, reason: EndReason },
    #[serde(rename_all = "camelCase")]
    Signal {
        call_id: CallId,
        payload: serde_json::Value,
    },
}

/// Events delivered to a visitor's widget
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum VisitorEvent {
    /// Whose greeting to play
    GreetingAssigned { agent: AgentProfile },
    /// The greeting agent left idle; play this one instead
    #[serde(rename_all = "camelCase")]
    GreetingReassigned {
        previous_agent_id: AgentId,
        agent: AgentProfile,
        reason: ReassignReason,
    },
    #[serde(rename_all = "camelCase")]
    CallRequested { call_id: CallId },
    #[serde(rename_all = "camelCase")]
    AgentAssigned {
        call_id: CallId,
        agent: AgentProfile,
        reconnect_token: String,
    },
    #[serde(rename_all = "camelCase")]
    AgentUnavailable {
        call_id: Option<CallId>,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Reconnected {
        call_id: CallId,
        agent: AgentProfile,
        reconnect_token: String,
    },
    #[serde(rename_all = "camelCase")]
    CallEnded { call_id: CallId, reason: EndReason },
    #[serde(rename_all = "camelCase")]
    Signal {
        call_id: CallId,
        payload: serde_json::Value,
    },
}

/// One addressed notification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "to", rename_all = "snake_case")]
pub enum OutboundMessage {
    #[serde(rename_all = "camelCase")]
    Agent {
        agent_id: AgentId,
        socket_id: SocketId,
        #[serde(flatten)]
        event: AgentEvent,
    },
    #[serde(rename_all = "camelCase")]
    Visitor {
        visitor_id: VisitorId,
        socket_id: SocketId,
        #[serde(flatten)]
        event: VisitorEvent,
    },
}

impl OutboundMessage {
    pub fn socket_id(&self) -> &SocketId {
        match self {
            OutboundMessage::Agent { socket_id, .. } | OutboundMessage::Visitor { socket_id, .. } => socket_id,
        }
    }
}

/// Sink for outbound notifications. Must not block.
pub trait Notifier: Send + Sync {
    fn send(&self, message: OutboundMessage);

    fn notify_agent(&self, agent_id: &AgentId, socket_id: &SocketId, event: AgentEvent) {
        self.send(OutboundMessage::Agent {
            agent_id: agent_id.clone(),
            socket_id: socket_id.clone(),
            event,
        });
    }

    fn notify_visitor(&self, visitor_id: &VisitorId, socket_id: &SocketId, event: VisitorEvent) {
        self.send(OutboundMessage::Visitor {
            visitor_id: visitor_id.clone(),
            socket_id: socket_id.clone(),
            event,
        });
    }
}

/// Notifier backed by an unbounded channel; the transport layer drains the
/// receiving end.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn send(&self, message: OutboundMessage) {
        if self.tx.send(message).is_err() {
            debug!("Outbound channel closed; dropping notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_serialize_flat_with_tags() {
        let message = OutboundMessage::Visitor {
            visitor_id: VisitorId::from("v1"),
            socket_id: SocketId::from("s1"),
            event: VisitorEvent::CallEnded {
                call_id: CallId::from("c1"),
                reason: EndReason::ReconnectFailed,
            },
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["to"], "visitor");
        assert_eq!(json["event"], "call_ended");
        assert_eq!(json["callId"], "c1");
        assert_eq!(json["reason"], "reconnect_failed");
        assert_eq!(json["socketId"], "s1");
    }

    #[test]
    fn reassignment_carries_the_new_profile() {
        let event = VisitorEvent::GreetingReassigned {
            previous_agent_id: AgentId::from("alice"),
            agent: AgentProfile::new("bob", "acme", "Bob"),
            reason: ReassignReason::AgentBusy,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "greeting_reassigned");
        assert_eq!(json["previousAgentId"], "alice");
        assert_eq!(json["agent"]["displayName"], "Bob");
        assert_eq!(json["reason"], "agent_busy");
    }

    #[test]
    fn channel_notifier_delivers_in_order() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.notify_agent(
            &AgentId::from("a1"),
            &SocketId::from("s1"),
            AgentEvent::MarkedAway {
                reason: "ring_no_answer".to_string(),
            },
        );
        notifier.notify_visitor(
            &VisitorId::from("v1"),
            &SocketId::from("s2"),
            VisitorEvent::CallRequested {
                call_id: CallId::from("c1"),
            },
        );
        assert!(matches!(rx.try_recv().unwrap(), OutboundMessage::Agent { .. }));
        assert_eq!(rx.try_recv().unwrap().socket_id(), &SocketId::from("s2"));
    }

    #[test]
    fn closed_channel_is_ignored() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        notifier.send(OutboundMessage::Visitor {
            visitor_id: VisitorId::from("v1"),
            socket_id: SocketId::from("s1"),
            event: VisitorEvent::CallRequested {
                call_id: CallId::from("c1"),
            },
        });
    }
}
