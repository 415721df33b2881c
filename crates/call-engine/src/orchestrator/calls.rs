//! The call state machine
//!
//! Every operation here follows the same shape: one registry transition
//! under the lock, then timers, claims and notifications once the lock is
//! released. A transition that is refused means someone else got there
//! first, and the operation reports that instead of acting.

use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::call::{ActiveCall, CallRequest, CallState, EndReason};
use super::core::PoolManager;
use crate::error::{CallOpError, RoutingFailure};
use crate::notify::{AgentEvent, VisitorEvent};
use crate::timer::ScheduledTask;
use crate::types::{AgentId, AgentStatus, CallId, VisitorId};

/// Extra life on an agent claim beyond the timer that guards it, so the
/// claim never lapses while the timer is still pending
pub(super) const CLAIM_MARGIN: Duration = Duration::from_secs(5);

/// Reason carried by `marked_away` after a missed offer
const MARKED_AWAY_RNA: &str = "ring_no_answer";

/// Result of trying to ring the next agent for a pending call
#[derive(Debug)]
pub(super) enum Offer {
    Ringing(ActiveCall),
    /// Nobody left to ring
    NoCandidate,
    /// The call is no longer pending
    Resolved,
}

pub(super) fn new_reconnect_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl PoolManager {
    /// A visitor asks to talk to someone.
    ///
    /// Failures are normal outcomes. Apart from an unknown visitor, every
    /// failure is also announced to the visitor as `agent_unavailable`.
    pub async fn request_call(
        &self,
        visitor_id: &VisitorId,
        page_url: Option<&str>,
    ) -> Result<CallRequest, RoutingFailure> {
        let Some(mut session) = self.presence.get_visitor(visitor_id).await else {
            debug!("Call request from unknown visitor {}", visitor_id);
            return Err(RoutingFailure::VisitorNotFound);
        };

        if self.get_active_call_by_visitor_id(visitor_id).is_some() {
            return self.refuse(visitor_id, RoutingFailure::AlreadyInCall).await;
        }

        if let Some(url) = page_url.filter(|url| *url != session.page_url) {
            let matched = self.resolve_pool(&session.org_id, url).await;
            self.presence
                .update_visitor_page(visitor_id, url, matched.pool_id.clone())
                .await;
            session.page_url = url.to_string();
            session.matched_pool_id = matched.pool_id;
        }

        let org_id = session.org_id.clone();
        if !self.directory.is_org_active(&org_id).await {
            return self.refuse(visitor_id, RoutingFailure::OrgInactive).await;
        }
        let country = session.location.as_ref().and_then(|l| l.country_code.as_deref());
        if !self.directory.is_country_allowed(&org_id, country).await {
            return self.refuse(visitor_id, RoutingFailure::CountryBlocked).await;
        }
        let Some(pool_id) = session.matched_pool_id.clone() else {
            debug!("Visitor {} is on an unrouted page: {}", visitor_id, session.page_url);
            return self.refuse(visitor_id, RoutingFailure::AgentUnavailable).await;
        };

        let settings = self.directory.call_settings(&org_id).await;
        let call = ActiveCall::new(
            CallId::generate(),
            visitor_id.clone(),
            session.socket_id.clone(),
            org_id,
            pool_id,
            session.page_url.clone(),
            settings.rna_timeout(),
            settings.max_call_duration(),
        );
        let call_id = call.call_id.clone();
        let inserted = self.calls.lock().insert(call);
        if let Err(failure) = inserted {
            return self.refuse(visitor_id, failure).await;
        }
        info!("📞 Call {} requested by visitor {}", call_id, visitor_id);

        match self.offer_next(&call_id).await {
            Offer::Ringing(call) => {
                self.notify_visitor(
                    visitor_id,
                    VisitorEvent::CallRequested {
                        call_id: call_id.clone(),
                    },
                )
                .await;
                let Some(agent_id) = call.agent_id.clone() else {
                    return Err(RoutingFailure::AgentUnavailable);
                };
                Ok(CallRequest {
                    call_id,
                    visitor_id: call.visitor_id,
                    agent_id,
                    pool_id: call.pool_id,
                    requested_at: call.requested_at,
                    ring_timeout_seconds: call.ring_timeout_seconds,
                })
            }
            Offer::NoCandidate => {
                self.end_call_with_reason(&call_id, EndReason::NoAgent).await;
                Err(RoutingFailure::AgentUnavailable)
            }
            // Cancelled while the offer was being made
            Offer::Resolved => Err(RoutingFailure::AgentUnavailable),
        }
    }

    async fn refuse<T>(&self, visitor_id: &VisitorId, failure: RoutingFailure) -> Result<T, RoutingFailure> {
        info!("🚫 Call request from visitor {} refused: {}", visitor_id, failure);
        self.notify_visitor(
            visitor_id,
            VisitorEvent::AgentUnavailable {
                call_id: None,
                reason: failure.as_str().to_string(),
            },
        )
        .await;
        Err(failure)
    }

    /// Ring the best remaining candidate for a pending call
    pub(super) async fn offer_next(&self, call_id: &CallId) -> Offer {
        let Some(call) = self.get_call(call_id).filter(|c| c.state == CallState::Pending) else {
            return Offer::Resolved;
        };

        let candidates = self.presence.available_agents(&call.pool_id).await;
        let claim_ttl = call.ring_timeout() + CLAIM_MARGIN;

        for candidate in candidates {
            let agent_id = &candidate.agent_id;
            if call.declined_agents.contains(agent_id) || candidate.org_id() != &call.org_id {
                continue;
            }
            if !self.presence.try_claim_agent(agent_id, call_id, claim_ttl).await {
                debug!("Agent {} was claimed elsewhere; trying the next one", agent_id);
                continue;
            }

            let ringing = self.calls.lock().begin_ringing(call_id, agent_id);
            let ringing = match ringing {
                Ok(ringing) => ringing,
                Err(_) => {
                    self.presence.release_agent_claim(agent_id, call_id).await;
                    let still_pending = self
                        .get_call(call_id)
                        .is_some_and(|c| c.state == CallState::Pending);
                    if still_pending {
                        continue;
                    }
                    return Offer::Resolved;
                }
            };

            self.start_rna_timer(call_id, agent_id, ringing.ring_timeout());
            info!(
                "🔔 Call {} ringing agent {} ({}s to answer)",
                call_id, agent_id, ringing.ring_timeout_seconds
            );
            self.notifier.notify_agent(
                agent_id,
                &candidate.socket_id,
                AgentEvent::CallOffered {
                    call_id: call_id.clone(),
                    visitor_id: ringing.visitor_id.clone(),
                    page_url: ringing.page_url.clone(),
                    pool_id: Some(ringing.pool_id.clone()),
                    ring_timeout_seconds: ringing.ring_timeout_seconds,
                },
            );
            return Offer::Ringing(ringing);
        }

        Offer::NoCandidate
    }

    /// Offer again after a withdrawal; end with `fallback` if nobody is left
    pub(super) async fn reoffer(&self, call_id: &CallId, fallback: EndReason) {
        match self.offer_next(call_id).await {
            Offer::Ringing(_) | Offer::Resolved => {}
            Offer::NoCandidate => {
                info!("📭 No one left to ring for call {}", call_id);
                self.end_call_with_reason(call_id, fallback).await;
            }
        }
    }

    /// Take a ringing offer back from `agent_id` and free the agent
    pub(super) async fn withdraw_offer(&self, call_id: &CallId, agent_id: &AgentId) -> Result<ActiveCall, CallOpError> {
        let pending = self.calls.lock().return_to_pending(call_id, agent_id)?;
        self.rna_timers.remove(call_id);
        self.presence.release_agent_claim(agent_id, call_id).await;
        Ok(pending)
    }

    fn start_rna_timer(&self, call_id: &CallId, agent_id: &AgentId, timeout: Duration) {
        let manager = self.weak_self.clone();
        let (call, agent) = (call_id.clone(), agent_id.clone());
        let timer = ScheduledTask::start(timeout, async move {
            if let Some(manager) = manager.upgrade() {
                manager.handle_rna_timeout(&call, &agent).await;
            }
        });
        self.rna_timers.insert(call_id.clone(), timer);
    }

    fn start_duration_timer(&self, call_id: &CallId, max_duration: Duration) {
        let manager = self.weak_self.clone();
        let call = call_id.clone();
        let timer = ScheduledTask::start(max_duration, async move {
            if let Some(manager) = manager.upgrade() {
                info!("⏱️ Call {} reached its maximum duration", call);
                manager.end_call_with_reason(&call, EndReason::MaxDurationExceeded).await;
            }
        });
        self.duration_timers.insert(call_id.clone(), timer);
    }

    /// The ringing agent did not answer in time: mark them away and offer
    /// the call to whoever is now best placed.
    pub(super) async fn handle_rna_timeout(&self, call_id: &CallId, agent_id: &AgentId) {
        if self.withdraw_offer(call_id, agent_id).await.is_err() {
            debug!("RNA timer for call {} fired after the offer was resolved", call_id);
            return;
        }
        info!("⏰ Agent {} did not answer call {}", agent_id, call_id);

        if let Some(change) = self.presence.set_agent_status(agent_id, AgentStatus::Away).await {
            self.status_changed(change, None).await;
        }
        self.notify_agent(
            agent_id,
            AgentEvent::CallCancelled {
                call_id: call_id.clone(),
                reason: EndReason::RnaTimeout,
            },
        )
        .await;
        self.notify_agent(
            agent_id,
            AgentEvent::MarkedAway {
                reason: MARKED_AWAY_RNA.to_string(),
            },
        )
        .await;

        self.reoffer(call_id, EndReason::RnaTimeout).await;
    }

    /// The ringing agent picks up
    pub async fn accept_call(&self, call_id: &CallId, agent_id: &AgentId) -> Result<ActiveCall, CallOpError> {
        let token = new_reconnect_token();
        let accepted = self.calls.lock().accept(call_id, agent_id, token.clone());
        let call = match accepted {
            Ok(call) => call,
            Err(e) => {
                debug!("Accept of call {} by {} refused: {}", call_id, agent_id, e);
                return Err(e);
            }
        };
        self.rna_timers.remove(call_id);

        let Some(agent) = self.presence.get_agent(agent_id).await.filter(|a| a.is_connected()) else {
            error!("🚨 Agent {} accepted call {} but has no presence record", agent_id, call_id);
            self.end_call_with_reason(call_id, EndReason::AgentUnavailable).await;
            return Err(CallOpError::AgentUnavailable);
        };

        // The caller now watches whoever answered
        self.presence.assign_visitor(&call.visitor_id, agent_id).await;
        if let Some(change) = self.presence.set_agent_status(agent_id, AgentStatus::InCall).await {
            self.status_changed(change, Some(&call.visitor_id)).await;
        }
        let claim_ttl = call.max_duration() + CLAIM_MARGIN;
        if !self.presence.extend_agent_claim(agent_id, call_id, claim_ttl).await {
            warn!("⚠️ Claim on agent {} for call {} had lapsed before accept", agent_id, call_id);
        }
        self.start_duration_timer(call_id, call.max_duration());

        info!("✅ Call {} accepted by agent {}", call_id, agent_id);
        self.notify_visitor(
            &call.visitor_id,
            VisitorEvent::AgentAssigned {
                call_id: call_id.clone(),
                agent: agent.profile.clone(),
                reconnect_token: token.clone(),
            },
        )
        .await;
        self.notifier.notify_agent(
            agent_id,
            &agent.socket_id,
            AgentEvent::CallStarted {
                call_id: call_id.clone(),
                visitor_id: call.visitor_id.clone(),
                reconnect_token: token,
            },
        );
        Ok(call)
    }

    /// The ringing agent declines; the call moves on to the next candidate
    /// that has not declined it yet.
    pub async fn reject_call(&self, call_id: &CallId, agent_id: &AgentId) -> Result<ActiveCall, CallOpError> {
        let pending = self.withdraw_offer(call_id, agent_id).await?;
        info!("↩️ Agent {} rejected call {}", agent_id, call_id);
        self.reoffer(call_id, EndReason::AllRejected).await;
        Ok(pending)
    }

    /// Media is flowing: accepted -> active
    pub fn mark_media_connected(&self, call_id: &CallId) -> Result<ActiveCall, CallOpError> {
        let active = self.calls.lock().media_connected(call_id)?;
        info!("🎥 Call {} media connected", call_id);
        Ok(active)
    }

    /// The visitor withdraws a request nobody has picked up yet
    pub async fn cancel_call(&self, call_id: &CallId, visitor_id: &VisitorId) -> Result<ActiveCall, CallOpError> {
        self.finish_call(call_id, EndReason::VisitorCancelled, |call| {
            &call.visitor_id == visitor_id && call.state.is_unanswered()
        })
        .await
    }

    /// The agent hangs up. Returns the ended call the first time only.
    pub async fn end_call(&self, call_id: &CallId) -> Option<ActiveCall> {
        self.end_call_with_reason(call_id, EndReason::AgentEnded).await
    }

    /// The visitor hangs up whatever call they are in
    pub async fn end_call_by_visitor(&self, visitor_id: &VisitorId) -> Option<ActiveCall> {
        let call = self.get_active_call_by_visitor_id(visitor_id)?;
        let reason = if call.state.is_unanswered() {
            EndReason::VisitorCancelled
        } else {
            EndReason::VisitorEnded
        };
        self.finish_call(&call.call_id, reason, |c| &c.visitor_id == visitor_id)
            .await
            .ok()
    }

    /// End a call for any reason. Idempotent: `None` if already ended.
    pub async fn end_call_with_reason(&self, call_id: &CallId, reason: EndReason) -> Option<ActiveCall> {
        self.finish_call(call_id, reason, |_| true).await.ok()
    }

    /// End a call if `allowed` agrees with its current record
    pub(super) async fn finish_call(
        &self,
        call_id: &CallId,
        reason: EndReason,
        allowed: impl FnOnce(&ActiveCall) -> bool,
    ) -> Result<ActiveCall, CallOpError> {
        let finished = self.calls.lock().finish_if(call_id, reason, allowed);
        let (call, previous) = finished?;

        self.rna_timers.remove(call_id);
        self.duration_timers.remove(call_id);
        self.reconnects.cancel_window(call_id);

        if let Some(agent_id) = &call.agent_id {
            self.presence.release_agent_claim(agent_id, call_id).await;
            if previous.is_connected() {
                self.free_agent(agent_id, &call).await;
            }
        }

        info!("📴 Call {} ended from {}: {}", call_id, previous, reason);
        self.announce_end(&call, previous, reason).await;
        Ok(call)
    }

    /// Put an agent back in rotation after their call
    async fn free_agent(&self, agent_id: &AgentId, call: &ActiveCall) {
        let in_call = self
            .presence
            .get_agent(agent_id)
            .await
            .is_some_and(|a| a.status == AgentStatus::InCall);
        if !in_call {
            return;
        }
        let next = if self.directory.is_org_active(&call.org_id).await {
            AgentStatus::Idle
        } else {
            AgentStatus::Away
        };
        if let Some(change) = self.presence.set_agent_status(agent_id, next).await {
            self.status_changed(change, None).await;
        }
    }

    async fn announce_end(&self, call: &ActiveCall, previous: CallState, reason: EndReason) {
        let unanswered = reason == EndReason::AgentUnavailable || (previous.is_unanswered() && reason.is_routing_outcome());
        let visitor_event = if unanswered {
            VisitorEvent::AgentUnavailable {
                call_id: Some(call.call_id.clone()),
                reason: reason.as_str().to_string(),
            }
        } else {
            VisitorEvent::CallEnded {
                call_id: call.call_id.clone(),
                reason,
            }
        };
        self.notify_visitor(&call.visitor_id, visitor_event).await;

        if let Some(agent_id) = &call.agent_id {
            let agent_event = if previous == CallState::Ringing {
                AgentEvent::CallCancelled {
                    call_id: call.call_id.clone(),
                    reason,
                }
            } else {
                AgentEvent::CallEnded {
                    call_id: call.call_id.clone(),
                    reason,
                }
            };
            self.notify_agent(agent_id, agent_event).await;
        }
    }
}
