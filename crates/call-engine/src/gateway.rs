//! # Inbound Event Gateway
//!
//! The transport dispatcher (WebSocket server, not part of this crate)
//! turns each frame it receives into one call on [`EventGateway`]. The
//! gateway is where abuse control and authentication happen, so the
//! [`PoolManager`] only ever sees admitted, authenticated events.
//!
//! ```text
//!  transport frame ─► EventGateway ─┬─ RateLimiter.check(event, sender) ─► RateLimited
//!                                   ├─ IdentityVerifier (agent login)   ─► Unauthorized
//!                                   └─ PoolManager operation
//! ```
//!
//! Disconnect notifications come from the transport itself rather than
//! from a client, and are never rate limited.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::collaborators::IdentityVerifier;
use crate::error::{CallEngineError, CallOpError, Result};
use crate::orchestrator::{ActiveCall, CallRequest, PoolManager, SignalSource};
use crate::rate_limit::{events, RateLimiter};
use crate::routing::PoolMatch;
use crate::types::{
    AgentId, AgentState, AgentStatus, CallId, OrgId, SocketId, StatusChange, VisitorId, VisitorLocation,
    VisitorSession,
};

pub struct EventGateway {
    manager: Arc<PoolManager>,
    limiter: Arc<RateLimiter>,
    identity: Arc<dyn IdentityVerifier>,
}

impl EventGateway {
    pub fn new(manager: Arc<PoolManager>, limiter: Arc<RateLimiter>, identity: Arc<dyn IdentityVerifier>) -> Self {
        Self {
            manager,
            limiter,
            identity,
        }
    }

    pub fn manager(&self) -> &Arc<PoolManager> {
        &self.manager
    }

    async fn admit(&self, event: &str, identifier: &str) -> Result<()> {
        let decision = self.limiter.check(event, identifier).await;
        if decision.allowed {
            return Ok(());
        }
        warn!("🚫 Dropping {} from {}: rate limited", event, identifier);
        Err(CallEngineError::RateLimited {
            event: event.to_string(),
            identifier: identifier.to_string(),
        })
    }

    // ---------------------------------------------------------------
    // Visitor events
    // ---------------------------------------------------------------

    pub async fn visitor_join(
        &self,
        visitor_id: &VisitorId,
        org_id: &OrgId,
        socket_id: &SocketId,
        page_url: &str,
        location: Option<VisitorLocation>,
    ) -> Result<VisitorSession> {
        self.admit(events::VISITOR_JOIN, visitor_id.as_str()).await?;
        Ok(self
            .manager
            .register_visitor(visitor_id, org_id, socket_id, page_url, location)
            .await)
    }

    pub async fn visitor_pageview(&self, visitor_id: &VisitorId, page_url: &str) -> Result<PoolMatch> {
        self.admit(events::VISITOR_PAGEVIEW, visitor_id.as_str()).await?;
        self.manager
            .update_visitor_page(visitor_id, page_url)
            .await
            .ok_or_else(|| CallEngineError::VisitorNotFound(visitor_id.to_string()))
    }

    pub async fn visitor_request_call(&self, visitor_id: &VisitorId, page_url: Option<&str>) -> Result<CallRequest> {
        self.admit(events::CALL_REQUEST, visitor_id.as_str()).await?;
        Ok(self.manager.request_call(visitor_id, page_url).await?)
    }

    pub async fn visitor_cancel_call(&self, visitor_id: &VisitorId, call_id: &CallId) -> Result<ActiveCall> {
        self.admit(events::CALL_CANCEL, visitor_id.as_str()).await?;
        Ok(self.manager.cancel_call(call_id, visitor_id).await?)
    }

    /// `None` when the visitor had no call to end
    pub async fn visitor_end_call(&self, visitor_id: &VisitorId) -> Result<Option<ActiveCall>> {
        self.admit(events::CALL_END, visitor_id.as_str()).await?;
        Ok(self.manager.end_call_by_visitor(visitor_id).await)
    }

    /// Returns false when the rejoin did not apply; the widget then starts
    /// over with a fresh call request.
    pub async fn visitor_rejoin(&self, visitor_id: &VisitorId, token: &str, socket_id: &SocketId) -> Result<bool> {
        self.admit(events::VISITOR_REJOIN, visitor_id.as_str()).await?;
        let rejoined = self.manager.rejoin_visitor(visitor_id, socket_id, token).await;
        if !rejoined {
            debug!("Rejoin by visitor {} did not apply", visitor_id);
        }
        Ok(rejoined)
    }

    pub async fn visitor_disconnected(&self, visitor_id: &VisitorId, socket_id: &SocketId) {
        self.manager.visitor_disconnected(visitor_id, socket_id).await;
    }

    // ---------------------------------------------------------------
    // Agent events
    // ---------------------------------------------------------------

    /// Authenticate and register an agent. A bad token never reaches
    /// presence.
    pub async fn agent_login(&self, agent_id: &AgentId, token: &str, socket_id: &SocketId) -> Result<AgentState> {
        self.admit(events::AGENT_LOGIN, agent_id.as_str()).await?;
        let profile = self.identity.verify_agent(agent_id, token).await.map_err(|rejection| {
            warn!("🔒 Login refused for agent {}: {}", agent_id, rejection);
            CallEngineError::unauthorized(rejection.to_string())
        })?;
        Ok(self.manager.register_agent(agent_id, socket_id, profile).await)
    }

    pub async fn agent_set_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<Option<StatusChange>> {
        self.admit(events::AGENT_STATUS, agent_id.as_str()).await?;
        self.manager.set_agent_status(agent_id, status).await
    }

    pub async fn agent_accept(&self, agent_id: &AgentId, call_id: &CallId) -> Result<ActiveCall> {
        self.admit(events::CALL_ACCEPT, agent_id.as_str()).await?;
        Ok(self.manager.accept_call(call_id, agent_id).await?)
    }

    pub async fn agent_reject(&self, agent_id: &AgentId, call_id: &CallId) -> Result<ActiveCall> {
        self.admit(events::CALL_REJECT, agent_id.as_str()).await?;
        Ok(self.manager.reject_call(call_id, agent_id).await?)
    }

    /// Hang up. Agents may only end their own calls.
    ///
    /// Hanging up an offer that is still ringing declines it. A repeated
    /// hang-up of a call this agent was in returns `None`.
    pub async fn agent_end(&self, agent_id: &AgentId, call_id: &CallId) -> Result<Option<ActiveCall>> {
        self.admit(events::CALL_END, agent_id.as_str()).await?;
        let Some(call) = self.manager.get_call(call_id) else {
            let ended_here = self
                .manager
                .recently_ended(call_id)
                .is_some_and(|ended| ended.involves_agent(agent_id));
            if ended_here {
                debug!("Repeated end of call {} from agent {}", call_id, agent_id);
                return Ok(None);
            }
            return Err(CallOpError::NotFound.into());
        };
        if !call.is_assigned_to(agent_id) {
            return Err(CallOpError::NotFound.into());
        }
        if call.state.is_unanswered() {
            self.manager.reject_call(call_id, agent_id).await?;
            return Ok(None);
        }
        Ok(self.manager.end_call(call_id).await)
    }

    pub async fn agent_disconnected(&self, agent_id: &AgentId, socket_id: &SocketId) {
        self.manager.agent_disconnected(agent_id, socket_id).await;
    }

    // ---------------------------------------------------------------
    // Media
    // ---------------------------------------------------------------

    /// Either side reports that media is flowing
    pub async fn media_connected(&self, from: SignalSource, call_id: &CallId) -> Result<ActiveCall> {
        self.admit(events::WEBRTC_SIGNAL, source_key(&from)).await?;
        let participant = match self.manager.get_call(call_id) {
            Some(call) => is_participant(&from, &call.visitor_id, call.agent_id.as_ref()),
            None => {
                let ended_here = self
                    .manager
                    .recently_ended(call_id)
                    .is_some_and(|ended| is_participant(&from, &ended.visitor_id, ended.agent_id.as_ref()));
                if ended_here {
                    return Err(CallOpError::AlreadyResolved.into());
                }
                false
            }
        };
        if !participant {
            return Err(CallOpError::NotFound.into());
        }
        Ok(self.manager.mark_media_connected(call_id)?)
    }

    /// Forward an SDP/ICE payload to the other party untouched
    pub async fn relay_signal(&self, from: SignalSource, call_id: &CallId, payload: serde_json::Value) -> Result<()> {
        self.admit(events::WEBRTC_SIGNAL, source_key(&from)).await?;
        Ok(self.manager.relay_signal(call_id, from, payload).await?)
    }
}

fn is_participant(source: &SignalSource, visitor_id: &VisitorId, agent_id: Option<&AgentId>) -> bool {
    match source {
        SignalSource::Visitor(from) => from == visitor_id,
        SignalSource::Agent(from) => agent_id == Some(from),
    }
}

fn source_key(source: &SignalSource) -> &str {
    match source {
        SignalSource::Visitor(visitor_id) => visitor_id.as_str(),
        SignalSource::Agent(agent_id) => agent_id.as_str(),
    }
}

impl std::fmt::Debug for EventGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventGateway")
            .field("manager", &self.manager)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}
