//! Agent and visitor presence as seen by the call state machine

use tracing::{debug, info, warn};

use super::call::{CallState, EndReason};
use super::core::PoolManager;
use crate::error::{CallEngineError, Result};
use crate::notify::AgentEvent;
use crate::routing::PoolMatch;
use crate::types::{
    dedup_memberships, AgentId, AgentProfile, AgentState, AgentStatus, OrgId, PoolMembership, SocketId,
    StatusChange, VisitorId, VisitorLocation, VisitorSession,
};

impl PoolManager {
    /// Log an agent in (or back in) on `socket_id`.
    ///
    /// Agents of an org whose subscription does not allow availability
    /// come up `away` instead of `idle`. An idle agent takes on visitors
    /// waiting for a greeting.
    pub async fn register_agent(&self, agent_id: &AgentId, socket_id: &SocketId, profile: AgentProfile) -> AgentState {
        let org_id = profile.org_id.clone();
        let mut state = self.presence.register_agent(agent_id, socket_id, profile).await;

        if state.status == AgentStatus::Idle && !self.directory.is_org_active(&org_id).await {
            info!("💤 Org {} is not active; agent {} starts away", org_id, agent_id);
            if let Some(change) = self.presence.set_agent_status(agent_id, AgentStatus::Away).await {
                state.status = change.current;
                state.status_changed_at = change.changed_at;
                self.status_changed(change, None).await;
            }
        }
        if state.status == AgentStatus::Idle {
            self.assign_waiting_visitors(&org_id).await;
        }
        state
    }

    /// Change an agent's availability.
    ///
    /// Going idle needs an org that may take calls. While an agent holds an
    /// accepted or active call only `in_call` is accepted. Leaving idle
    /// while a call is ringing takes the offer back and re-offers it.
    pub async fn set_agent_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<Option<StatusChange>> {
        let Some(agent) = self.presence.get_agent(agent_id).await else {
            return Err(CallEngineError::AgentNotFound(agent_id.to_string()));
        };

        let current_call = self.get_active_call_by_agent_id(agent_id);
        if let Some(call) = &current_call {
            if call.state.is_connected() && status != AgentStatus::InCall {
                return Err(CallEngineError::AgentBusy(agent_id.to_string()));
            }
        }
        if status == AgentStatus::Idle && !self.directory.is_org_active(agent.org_id()).await {
            return Err(CallEngineError::OrgInactive(agent.org_id().to_string()));
        }

        let change = self.presence.set_agent_status(agent_id, status).await;
        if let Some(change) = &change {
            info!("🔄 Agent {} is now {} (was {})", agent_id, change.current, change.previous);
            let caller = current_call.as_ref().map(|c| c.visitor_id.clone());
            self.status_changed(change.clone(), caller.as_ref()).await;
        }

        let ringing = current_call.filter(|c| c.state == CallState::Ringing);
        if let Some(call) = ringing.filter(|_| !status.is_available()) {
            if self.withdraw_offer(&call.call_id, agent_id).await.is_ok() {
                info!("↩️ Offer of call {} withdrawn from agent {} ({})", call.call_id, agent_id, status);
                self.notify_agent(
                    agent_id,
                    AgentEvent::CallCancelled {
                        call_id: call.call_id.clone(),
                        reason: EndReason::AgentUnavailable,
                    },
                )
                .await;
                self.reoffer(&call.call_id, EndReason::AllRejected).await;
            }
        }
        Ok(change)
    }

    /// Replace an agent's pool memberships. Duplicate pools keep their
    /// first rank.
    pub async fn set_agent_pool_memberships(&self, agent_id: &AgentId, memberships: Vec<PoolMembership>) {
        self.presence
            .set_pool_memberships(agent_id, dedup_memberships(memberships))
            .await;
    }

    /// Drop agents whose reconnect grace ran out
    pub async fn purge_disconnected_agents(&self) -> Vec<AgentId> {
        let purged = self.presence.purge_disconnected(self.config.agent_grace()).await;
        if !purged.is_empty() {
            info!("🧹 Purged {} agent(s) past their reconnect grace", purged.len());
        }
        purged
    }

    /// Record a visitor's widget connection and the pool their page maps
    /// to, then pick the agent whose greeting they see
    pub async fn register_visitor(
        &self,
        visitor_id: &VisitorId,
        org_id: &OrgId,
        socket_id: &SocketId,
        page_url: &str,
        location: Option<VisitorLocation>,
    ) -> VisitorSession {
        let matched = self.resolve_pool(org_id, page_url).await;
        let mut session = VisitorSession {
            visitor_id: visitor_id.clone(),
            org_id: org_id.clone(),
            socket_id: socket_id.clone(),
            page_url: page_url.to_string(),
            matched_pool_id: matched.pool_id,
            location,
            connected_at: chrono::Utc::now(),
            assigned_agent_id: None,
        };
        self.presence.register_visitor(session.clone()).await;
        debug!(
            "Visitor {} joined {} on {} (pool {:?})",
            visitor_id, org_id, page_url, session.matched_pool_id
        );

        self.mark_embed_verified(org_id, page_url);
        session.assigned_agent_id = self.assign_greeting(&session).await;
        session
    }

    /// The visitor navigated; re-resolve their pool. `None` if unknown.
    pub async fn update_visitor_page(&self, visitor_id: &VisitorId, page_url: &str) -> Option<PoolMatch> {
        let session = self.presence.get_visitor(visitor_id).await?;
        let matched = self.resolve_pool(&session.org_id, page_url).await;
        let updated = self
            .presence
            .update_visitor_page(visitor_id, page_url, matched.pool_id.clone())
            .await;
        updated.then_some(matched)
    }

    /// Dispatch status-change tracking without waiting for it
    pub(super) fn record_status_change(&self, change: StatusChange) {
        let activity = self.activity.clone();
        tokio::spawn(async move {
            if let Err(e) = activity.record_status_change(&change).await {
                warn!("⚠️ Could not record status change for agent {}: {}", change.agent_id, e);
            }
        });
    }

    /// Write the embed marker once per org per process
    fn mark_embed_verified(&self, org_id: &OrgId, page_url: &str) {
        if !self.verified_embeds.insert(org_id.clone()) {
            return;
        }
        let activity = self.activity.clone();
        let (org_id, page_url) = (org_id.clone(), page_url.to_string());
        tokio::spawn(async move {
            match activity.mark_embed_verified(&org_id, &page_url).await {
                Ok(()) => info!("🧩 Widget embed verified for org {} on {}", org_id, page_url),
                Err(e) => warn!("⚠️ Could not mark embed verified for org {}: {}", org_id, e),
            }
        });
    }
}
