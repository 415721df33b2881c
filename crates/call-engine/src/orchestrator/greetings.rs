//! Greeting assignment
//!
//! Every visitor on a customer page is shown one agent's recorded greeting
//! before any call is requested. This module keeps those assignments in
//! step with agent availability:
//!
//! ```text
//!  visitor joins ─────────► find_greeting_agent ─► greeting_assigned
//!                                   │ nobody has room
//!                                   └────────────► agent_unavailable (waits)
//!
//!  agent leaves idle ─────► each viewer moves on ─► greeting_reassigned
//!  (accept, away, drop)             │ nobody has room
//!                                   └────────────► agent_unavailable (waits)
//!
//!  agent becomes idle ────► waiting visitors ─────► greeting_assigned
//! ```
//!
//! The visitor on an agent's call keeps that agent's greeting.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use super::core::PoolManager;
use crate::notify::VisitorEvent;
use crate::types::{AgentId, AgentStatus, OrgId, StatusChange, VisitorId, VisitorSession};

/// Reason sent to a visitor with no greeting agent on arrival
const NO_GREETING_AGENT: &str = "no_agent";

/// Why a visitor's greeting moved to another agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReassignReason {
    /// The agent took a call
    AgentBusy,
    AgentAway,
    AgentOffline,
}

impl ReassignReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReassignReason::AgentBusy => "agent_busy",
            ReassignReason::AgentAway => "agent_away",
            ReassignReason::AgentOffline => "agent_offline",
        }
    }

    /// The reason implied by an agent leaving idle for `status`
    pub fn for_status(status: AgentStatus) -> Self {
        match status {
            AgentStatus::InCall | AgentStatus::InSimulation => ReassignReason::AgentBusy,
            AgentStatus::Offline => ReassignReason::AgentOffline,
            AgentStatus::Away | AgentStatus::Idle => ReassignReason::AgentAway,
        }
    }
}

impl fmt::Display for ReassignReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of moving an agent's viewers elsewhere
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reassignment {
    /// Visitor and the agent now greeting them
    pub reassigned: Vec<(VisitorId, AgentId)>,
    /// Visitors left waiting
    pub unassigned: Vec<VisitorId>,
}

impl PoolManager {
    /// Pick a greeting agent for a visitor who just arrived and tell the widget.
    /// Returns the agent, or `None` if the visitor has to wait.
    pub(super) async fn assign_greeting(&self, session: &VisitorSession) -> Option<AgentId> {
        let found = self
            .presence
            .find_greeting_agent(&session.org_id, session.matched_pool_id.as_ref(), None)
            .await;
        let assignment = match found {
            Some(agent) => self.presence.assign_visitor(&session.visitor_id, &agent.agent_id).await,
            None => None,
        };
        let Some(assignment) = assignment else {
            debug!("No agent can greet visitor {} of {} yet", session.visitor_id, session.org_id);
            self.notify_visitor(
                &session.visitor_id,
                VisitorEvent::AgentUnavailable {
                    call_id: None,
                    reason: NO_GREETING_AGENT.to_string(),
                },
            )
            .await;
            return None;
        };

        self.notify_visitor(
            &session.visitor_id,
            VisitorEvent::GreetingAssigned {
                agent: assignment.agent.profile.clone(),
            },
        )
        .await;
        Some(assignment.agent.agent_id)
    }

    /// Move every visitor watching `agent_id` to the best other agent.
    ///
    /// `keep` stays where it is (the visitor on the agent's call). Visitors
    /// nobody can take are left waiting for the next agent with room.
    pub async fn reassign_greetings(
        &self,
        agent_id: &AgentId,
        keep: Option<&VisitorId>,
        reason: ReassignReason,
    ) -> Reassignment {
        let mut outcome = Reassignment::default();
        let Some(agent) = self.presence.get_agent(agent_id).await else {
            return outcome;
        };

        for visitor_id in agent.simulations.iter().filter(|v| Some(*v) != keep) {
            let Some(session) = self.presence.get_visitor(visitor_id).await else {
                debug!("Viewer {} of agent {} is gone", visitor_id, agent_id);
                continue;
            };
            let next = self
                .presence
                .find_greeting_agent(&session.org_id, session.matched_pool_id.as_ref(), Some(agent_id))
                .await;
            let assignment = match next {
                Some(next) => self.presence.assign_visitor(visitor_id, &next.agent_id).await,
                None => None,
            };

            match assignment {
                Some(assignment) => {
                    self.notify_visitor(
                        visitor_id,
                        VisitorEvent::GreetingReassigned {
                            previous_agent_id: agent_id.clone(),
                            agent: assignment.agent.profile.clone(),
                            reason,
                        },
                    )
                    .await;
                    outcome
                        .reassigned
                        .push((visitor_id.clone(), assignment.agent.agent_id));
                }
                None => {
                    self.presence.unassign_visitor(visitor_id).await;
                    self.notify_visitor(
                        visitor_id,
                        VisitorEvent::AgentUnavailable {
                            call_id: None,
                            reason: reason.as_str().to_string(),
                        },
                    )
                    .await;
                    outcome.unassigned.push(visitor_id.clone());
                }
            }
        }

        if !outcome.reassigned.is_empty() || !outcome.unassigned.is_empty() {
            info!(
                "🔀 Agent {} is {}: {} viewer(s) reassigned, {} waiting",
                agent_id,
                reason,
                outcome.reassigned.len(),
                outcome.unassigned.len()
            );
        }
        outcome
    }

    /// Give waiting visitors of `org_id` to whoever now has room, longest
    /// waiting first. Returns how many were assigned.
    pub async fn assign_waiting_visitors(&self, org_id: &OrgId) -> usize {
        let mut assigned = 0;
        for session in self.presence.unassigned_visitors(org_id).await {
            let Some(agent) = self
                .presence
                .find_greeting_agent(org_id, session.matched_pool_id.as_ref(), None)
                .await
            else {
                break;
            };
            let Some(assignment) = self.presence.assign_visitor(&session.visitor_id, &agent.agent_id).await else {
                continue;
            };
            self.notify_visitor(
                &session.visitor_id,
                VisitorEvent::GreetingAssigned {
                    agent: assignment.agent.profile,
                },
            )
            .await;
            assigned += 1;
        }
        if assigned > 0 {
            info!("👋 {} waiting visitor(s) of {} now have a greeting", assigned, org_id);
        }
        assigned
    }

    /// Forget a visitor who left. The greeting slot they held goes to
    /// whoever is waiting.
    pub(super) async fn visitor_left(&self, visitor_id: &VisitorId) {
        let Some(session) = self.presence.remove_visitor(visitor_id).await else {
            return;
        };
        if session.assigned_agent_id.is_some() {
            self.assign_waiting_visitors(&session.org_id).await;
        }
    }

    /// Follow an agent's status change: viewers move off an agent leaving
    /// idle, waiting visitors come to one entering it.
    pub(super) async fn rebalance_greetings(&self, change: &StatusChange, keep: Option<&VisitorId>) {
        match (change.previous, change.current) {
            (_, AgentStatus::Idle) => {
                self.assign_waiting_visitors(&change.org_id).await;
            }
            (AgentStatus::Idle, current) => {
                self.reassign_greetings(&change.agent_id, keep, ReassignReason::for_status(current))
                    .await;
            }
            _ => {}
        }
    }

    /// Track a committed status change and keep greetings in step with it
    pub(super) async fn status_changed(&self, change: StatusChange, keep: Option<&VisitorId>) {
        self.rebalance_greetings(&change, keep).await;
        self.record_status_change(change);
    }
}
