//! Transport drops, rejoins and signalling relay

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::call::{CallState, EndReason};
use super::calls::new_reconnect_token;
use super::core::PoolManager;
use super::greetings::ReassignReason;
use crate::error::CallOpError;
use crate::lifecycle::ReconnectHost;
use crate::notify::{AgentEvent, VisitorEvent};
use crate::types::{AgentId, CallId, SocketId, VisitorId};

/// Which side of a call sent a signalling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalSource {
    Visitor(VisitorId),
    Agent(AgentId),
}

impl PoolManager {
    /// A visitor's transport closed.
    ///
    /// Events for a socket the visitor has since replaced are ignored. An
    /// active call waits for the visitor to come back; an unanswered one is
    /// cancelled, and an accepted one that never got media is ended.
    pub async fn visitor_disconnected(&self, visitor_id: &VisitorId, socket_id: &SocketId) {
        let Some(session) = self.presence.get_visitor(visitor_id).await else {
            debug!("Disconnect for unknown visitor {}", visitor_id);
            return;
        };
        if &session.socket_id != socket_id {
            debug!("Ignoring stale disconnect of visitor {} on {}", visitor_id, socket_id);
            return;
        }

        let Some(call) = self.get_active_call_by_visitor_id(visitor_id) else {
            self.visitor_left(visitor_id).await;
            debug!("Visitor {} left", visitor_id);
            return;
        };

        match call.state {
            CallState::Active => {
                let waiting = self.calls.lock().await_reconnection(&call.call_id, socket_id);
                match waiting {
                    Ok(waiting) => self.open_reconnect_window(&waiting.call_id, visitor_id, waiting.agent_id).await,
                    Err(_) => {
                        warn!(
                            "⚠️ Visitor {} dropped socket {} that call {} does not know; ending it",
                            visitor_id, socket_id, call.call_id
                        );
                        self.end_call_with_reason(&call.call_id, EndReason::VisitorDisconnected)
                            .await;
                    }
                }
            }
            CallState::Pending | CallState::Ringing => {
                let cancelled = self
                    .finish_call(&call.call_id, EndReason::VisitorCancelled, |c| c.state.is_unanswered())
                    .await;
                if let Err(e) = cancelled {
                    debug!("Call {} moved on before visitor {} dropped: {}", call.call_id, visitor_id, e);
                }
                self.visitor_left(visitor_id).await;
            }
            CallState::Accepted => {
                let ended = self
                    .finish_call(&call.call_id, EndReason::VisitorDisconnected, |c| {
                        c.state == CallState::Accepted
                    })
                    .await;
                if let Err(e) = ended {
                    debug!("Call {} moved on before visitor {} dropped: {}", call.call_id, visitor_id, e);
                }
                self.visitor_left(visitor_id).await;
            }
            CallState::WaitingForReconnection | CallState::Ended => {}
        }
    }

    async fn open_reconnect_window(&self, call_id: &CallId, visitor_id: &VisitorId, agent_id: Option<AgentId>) {
        let Some(agent_id) = agent_id else {
            error!("🚨 Call {} is active without an agent", call_id);
            self.end_call_with_reason(call_id, EndReason::AgentUnavailable).await;
            return;
        };
        if !self.reconnects.start_window(call_id, visitor_id, &agent_id) {
            return;
        }
        let timeout_seconds = self.reconnects.duration().as_secs();
        self.notify_agent(
            &agent_id,
            AgentEvent::CallReconnecting {
                call_id: call_id.clone(),
                message: "Visitor connection lost, waiting for them to reconnect".to_string(),
                timeout_seconds,
            },
        )
        .await;
    }

    /// An agent's transport closed. Whatever call they hold ends, their
    /// greeting viewers move to other agents, and the agent enters the
    /// reconnect grace period.
    pub async fn agent_disconnected(&self, agent_id: &AgentId, socket_id: &SocketId) {
        let Some(agent) = self.presence.get_agent(agent_id).await else {
            debug!("Disconnect for unknown agent {}", agent_id);
            return;
        };
        if &agent.socket_id != socket_id {
            debug!("Ignoring stale disconnect of agent {} on {}", agent_id, socket_id);
            return;
        }

        let call_id = self.get_active_call_by_agent_id(agent_id).map(|c| c.call_id);
        if let Some(call_id) = call_id {
            self.end_call_with_reason(&call_id, EndReason::AgentDisconnected).await;
        }
        self.presence.disconnect_agent(agent_id).await;
        self.reassign_greetings(agent_id, None, ReassignReason::AgentOffline)
            .await;
    }

    /// A visitor returns to a call waiting for them
    pub async fn handle_rejoin(&self, call_id: &CallId, visitor_id: &VisitorId, socket_id: &SocketId, token: &str) -> bool {
        self.reconnects.handle_rejoin(call_id, visitor_id, socket_id, token).await
    }

    /// Rejoin by visitor id, for transports that only remember the token
    pub async fn rejoin_visitor(&self, visitor_id: &VisitorId, socket_id: &SocketId, token: &str) -> bool {
        let Some(call) = self.get_active_call_by_visitor_id(visitor_id) else {
            debug!("Rejoin from visitor {} with no call", visitor_id);
            return false;
        };
        self.handle_rejoin(&call.call_id, visitor_id, socket_id, token).await
    }

    /// Forward an opaque signalling payload to the other party of a call
    pub async fn relay_signal(
        &self,
        call_id: &CallId,
        from: SignalSource,
        payload: serde_json::Value,
    ) -> Result<(), CallOpError> {
        let call = self.get_call(call_id).ok_or(CallOpError::NotFound)?;
        if !call.state.is_connected() {
            return Err(CallOpError::AlreadyResolved);
        }
        match from {
            SignalSource::Visitor(visitor_id) if visitor_id == call.visitor_id => {
                let agent_id = call.agent_id.as_ref().ok_or(CallOpError::NotFound)?;
                self.notify_agent(
                    agent_id,
                    AgentEvent::Signal {
                        call_id: call_id.clone(),
                        payload,
                    },
                )
                .await;
            }
            SignalSource::Agent(agent_id) if call.is_assigned_to(&agent_id) => {
                self.notify_visitor(
                    &call.visitor_id,
                    VisitorEvent::Signal {
                        call_id: call_id.clone(),
                        payload,
                    },
                )
                .await;
            }
            other => {
                warn!("⚠️ Signal for call {} from a non-participant: {:?}", call_id, other);
                return Err(CallOpError::NotFound);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ReconnectHost for PoolManager {
    fn rejoin_allowed(&self, call_id: &CallId, visitor_id: &VisitorId, token: &str) -> bool {
        self.calls.lock().rejoin_allowed(call_id, visitor_id, token)
    }

    async fn window_expired(&self, call_id: &CallId, visitor_id: &VisitorId, agent_id: &AgentId) {
        let Some(call) = self.end_call_with_reason(call_id, EndReason::ReconnectFailed).await else {
            return;
        };
        info!("💔 Visitor {} did not come back; agent {} released", visitor_id, agent_id);

        // The visitor never returned on a new socket: forget the session
        let abandoned = self
            .presence
            .get_visitor(visitor_id)
            .await
            .is_some_and(|s| s.socket_id == call.visitor_socket_id);
        if abandoned {
            self.visitor_left(visitor_id).await;
        }
    }

    async fn complete_rejoin(&self, call_id: &CallId, visitor_id: &VisitorId, socket_id: &SocketId) -> bool {
        let token = new_reconnect_token();
        let resumed = self.calls.lock().resume(call_id, socket_id, token.clone());
        let Ok(call) = resumed else {
            return false;
        };

        if !self.presence.update_visitor_socket(visitor_id, socket_id).await {
            warn!("⚠️ Visitor {} rejoined call {} without a session", visitor_id, call_id);
        }

        let agent = match &call.agent_id {
            Some(agent_id) => self.presence.get_agent(agent_id).await.filter(|a| a.is_connected()),
            None => None,
        };
        let Some(agent) = agent else {
            error!("🚨 Call {} resumed but its agent is gone", call_id);
            self.end_call_with_reason(call_id, EndReason::AgentUnavailable).await;
            return false;
        };

        info!("🔁 Visitor {} rejoined call {} on {}", visitor_id, call_id, socket_id);
        self.notifier.notify_visitor(
            visitor_id,
            socket_id,
            VisitorEvent::Reconnected {
                call_id: call_id.clone(),
                agent: agent.profile.clone(),
                reconnect_token: token.clone(),
            },
        );
        self.notifier.notify_agent(
            &agent.agent_id,
            &agent.socket_id,
            AgentEvent::CallReconnected {
                call_id: call_id.clone(),
                visitor_id: visitor_id.clone(),
                reconnect_token: token,
            },
        );
        true
    }
}
