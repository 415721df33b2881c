//! # Presence Store
//!
//! Who is online, in which pools, and in what state. The store is the single
//! authority the pool manager consults when choosing an agent for a call.
//!
//! ## Implementations
//!
//! | Store | When | Atomicity |
//! |-------|------|-----------|
//! | [`LocalPresenceStore`] | single process | one lock, never held across an await |
//! | [`DistributedPresenceStore`] | several router processes | store primitives (`set_if_absent`, compare-and-set) |
//!
//! The distributed store keeps a local mirror of everything it writes. When
//! the shared store is unreachable it logs a warning and serves from the
//! mirror, so a single process keeps routing through an outage.
//!
//! ## Agent Selection
//!
//! ```text
//! pool members ─► idle & connected ─► not claimed ─► not excluded
//!                                                        │
//!                          sort by (priority rank, idle sequence)
//!                                                        │
//!                                                 first = offered
//! ```
//!
//! The idle sequence is stamped each time an agent becomes idle, so a
//! smaller value means the agent has waited longer.
//!
//! ## Claims
//!
//! Selecting an agent and reserving it are separate steps. The pool manager
//! must [`PresenceStore::try_claim_agent`] before ringing; only one call can
//! hold an agent's claim at a time. Claims carry a TTL so a crashed process
//! cannot pin an agent forever.
//!
//! ## Greetings
//!
//! Separately from calls, every visitor is shown one agent's recorded
//! greeting. [`pick_greeting_agent`] chooses who: the best tier of the
//! visitor's pool first, then within it an agent nobody is watching (the
//! one assigned longest ago), else the lightest load. An agent is never
//! given more viewers than `max_simultaneous_simulations`. Viewers do not
//! change an agent's status; they only show up as
//! [`AgentState::presence_status`].
//!
//! ## Reconnect Grace
//!
//! A dropped agent stays registered (status `offline`, `disconnected_at` set)
//! for a grace period. Logging back in within it restores the previous
//! status; after it the login starts fresh as `idle`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::types::{
    AgentId, AgentProfile, AgentState, AgentStatus, CallId, GreetingAssignment, OrgId, PoolId, PoolMembership,
    PresenceStats, SocketId, StatusChange, VisitorId, VisitorSession,
};

pub mod distributed;
pub mod local;

pub use distributed::DistributedPresenceStore;
pub use local::LocalPresenceStore;

/// How long a dropped agent's record survives by default
pub const DEFAULT_AGENT_GRACE: Duration = Duration::from_secs(10);

/// Presence operations shared by the local and distributed stores
#[async_trait]
pub trait PresenceStore: Send + Sync + std::fmt::Debug {
    /// Whether state is shared with other processes
    fn is_distributed(&self) -> bool;

    /// Register (or re-register) an agent on a socket.
    ///
    /// An existing record within the reconnect grace period keeps its
    /// status; `offline` and `in_call` come back as `idle`.
    async fn register_agent(&self, agent_id: &AgentId, socket_id: &SocketId, profile: AgentProfile) -> AgentState;

    async fn get_agent(&self, agent_id: &AgentId) -> Option<AgentState>;

    async fn get_agent_by_socket(&self, socket_id: &SocketId) -> Option<AgentState>;

    /// Returns the committed change, or `None` for unknown agents and no-op updates
    async fn set_agent_status(&self, agent_id: &AgentId, status: AgentStatus) -> Option<StatusChange>;

    /// Replace an agent's pool memberships. Works before the agent logs in.
    async fn set_pool_memberships(&self, agent_id: &AgentId, memberships: Vec<PoolMembership>);

    /// Every registered member of a pool, in any status
    async fn pool_members(&self, pool_id: &PoolId) -> Vec<AgentState>;

    /// Idle, connected, unclaimed members of a pool, best candidate first
    async fn available_agents(&self, pool_id: &PoolId) -> Vec<AgentState>;

    /// Best candidate in `pool_id` that is not in `exclude`
    async fn find_available_agent(&self, pool_id: &PoolId, exclude: &[AgentId]) -> Option<AgentState> {
        self.available_agents(pool_id)
            .await
            .into_iter()
            .find(|agent| !exclude.contains(&agent.agent_id))
    }

    /// Reserve an agent for `call_id`. Fails if any live claim exists.
    async fn try_claim_agent(&self, agent_id: &AgentId, call_id: &CallId, ttl: Duration) -> bool;

    /// Push out the expiry of a claim held by `call_id`
    async fn extend_agent_claim(&self, agent_id: &AgentId, call_id: &CallId, ttl: Duration) -> bool;

    /// Release a claim, only if `call_id` still holds it
    async fn release_agent_claim(&self, agent_id: &AgentId, call_id: &CallId);

    async fn agent_claim(&self, agent_id: &AgentId) -> Option<CallId>;

    /// Mark an agent's socket gone and start its grace period
    async fn disconnect_agent(&self, agent_id: &AgentId) -> Option<AgentState>;

    async fn unregister_agent(&self, agent_id: &AgentId) -> Option<AgentState>;

    /// Remove agents whose grace period has run out
    async fn purge_disconnected(&self, grace: Duration) -> Vec<AgentId>;

    async fn all_agents(&self) -> Vec<AgentState>;

    async fn register_visitor(&self, session: VisitorSession);

    async fn get_visitor(&self, visitor_id: &VisitorId) -> Option<VisitorSession>;

    async fn get_visitor_by_socket(&self, socket_id: &SocketId) -> Option<VisitorSession>;

    async fn update_visitor_socket(&self, visitor_id: &VisitorId, socket_id: &SocketId) -> bool;

    async fn update_visitor_page(&self, visitor_id: &VisitorId, page_url: &str, matched_pool_id: Option<PoolId>) -> bool;

    /// Forget a visitor, detaching them from their greeting agent
    async fn remove_visitor(&self, visitor_id: &VisitorId) -> Option<VisitorSession>;

    /// Best agent of `org_id` to greet a visitor. Members of `pool_id` are
    /// tried first, then anyone in the org.
    async fn find_greeting_agent(
        &self,
        org_id: &OrgId,
        pool_id: Option<&PoolId>,
        exclude: Option<&AgentId>,
    ) -> Option<AgentState> {
        if let Some(pool_id) = pool_id {
            let members = self
                .pool_members(pool_id)
                .await
                .into_iter()
                .filter(|agent| agent.org_id() == org_id)
                .collect();
            if let Some(agent) = pick_greeting_agent(members, Some(pool_id), exclude) {
                return Some(agent);
            }
        }
        let everyone = self
            .all_agents()
            .await
            .into_iter()
            .filter(|agent| agent.org_id() == org_id)
            .collect();
        pick_greeting_agent(everyone, None, exclude)
    }

    /// Point a visitor's greeting at `agent_id`, detaching them from any
    /// previous agent. `None` when either side is unknown.
    async fn assign_visitor(&self, visitor_id: &VisitorId, agent_id: &AgentId) -> Option<GreetingAssignment>;

    /// Detach a visitor from their greeting agent; they wait for the next
    /// agent with room. Returns the agent they were detached from.
    async fn unassign_visitor(&self, visitor_id: &VisitorId) -> Option<AgentId>;

    /// Visitors of `org_id` without a greeting agent, longest waiting first
    async fn unassigned_visitors(&self, org_id: &OrgId) -> Vec<VisitorSession>;

    async fn stats(&self) -> PresenceStats;
}

/// Monotonic idle stamps based on wall-clock microseconds.
///
/// Stamps from different processes are comparable as long as their clocks
/// agree; within a process they are strictly increasing.
#[derive(Debug, Default)]
pub(crate) struct IdleSequence {
    last: AtomicU64,
}

impl IdleSequence {
    pub(crate) fn next(&self) -> u64 {
        let now = Utc::now().timestamp_micros().max(0) as u64;
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// Never hand out a stamp at or below one seen elsewhere
    pub(crate) fn observe(&self, seen: u64) {
        self.last.fetch_max(seen, Ordering::AcqRel);
    }
}

pub(crate) fn within_grace(disconnected_at: DateTime<Utc>, grace: Duration, now: DateTime<Utc>) -> bool {
    match (now - disconnected_at).to_std() {
        Ok(elapsed) => elapsed < grace,
        // Clock went backwards; treat as just disconnected
        Err(_) => !grace.is_zero(),
    }
}

/// Compute the record produced by a login
pub(crate) fn registration_state(
    existing: Option<AgentState>,
    agent_id: &AgentId,
    socket_id: &SocketId,
    profile: AgentProfile,
    memberships: Vec<PoolMembership>,
    grace: Duration,
    now: DateTime<Utc>,
    next_seq: impl FnOnce() -> u64,
) -> AgentState {
    match existing {
        // Same agent, new socket (second tab or transport reconnect)
        Some(previous) if previous.is_connected() => AgentState {
            socket_id: socket_id.clone(),
            pool_memberships: memberships,
            profile,
            ..previous
        },
        Some(previous)
            if previous
                .disconnected_at
                .is_some_and(|at| within_grace(at, grace, now)) =>
        {
            let restored = match previous.previous_status {
                Some(AgentStatus::Offline) | Some(AgentStatus::InCall) | None => AgentStatus::Idle,
                Some(status) => status,
            };
            let idle_seq = if restored == AgentStatus::Idle && previous.previous_status == Some(AgentStatus::Idle) {
                previous.idle_seq
            } else {
                next_seq()
            };
            AgentState {
                agent_id: agent_id.clone(),
                socket_id: socket_id.clone(),
                status: restored,
                pool_memberships: memberships,
                profile,
                connected_at: now,
                status_changed_at: if restored == previous.status { previous.status_changed_at } else { now },
                idle_seq,
                disconnected_at: None,
                previous_status: None,
                simulations: previous.simulations,
                last_assigned_seq: previous.last_assigned_seq,
            }
        }
        _ => AgentState {
            agent_id: agent_id.clone(),
            socket_id: socket_id.clone(),
            status: AgentStatus::Idle,
            pool_memberships: memberships,
            profile,
            connected_at: now,
            status_changed_at: now,
            idle_seq: next_seq(),
            disconnected_at: None,
            previous_status: None,
            simulations: Vec::new(),
            last_assigned_seq: 0,
        },
    }
}

/// Apply a status update in place, stamping the idle sequence on entry to idle
pub(crate) fn apply_status(
    agent: &mut AgentState,
    status: AgentStatus,
    now: DateTime<Utc>,
    next_seq: impl FnOnce() -> u64,
) -> Option<StatusChange> {
    if agent.status == status {
        return None;
    }
    let previous = agent.status;
    agent.status = status;
    agent.status_changed_at = now;
    if status == AgentStatus::Idle {
        agent.idle_seq = next_seq();
    }
    Some(StatusChange {
        agent_id: agent.agent_id.clone(),
        org_id: agent.org_id().clone(),
        previous,
        current: status,
        changed_at: now,
    })
}

pub(crate) fn mark_disconnected(agent: &mut AgentState, now: DateTime<Utc>) {
    if agent.disconnected_at.is_none() {
        agent.previous_status = Some(agent.status);
        agent.disconnected_at = Some(now);
    }
    agent.status = AgentStatus::Offline;
    agent.status_changed_at = now;
}

pub(crate) fn sort_candidates(candidates: &mut [AgentState], pool_id: &PoolId) {
    candidates.sort_by_key(|agent| (agent.rank_in(pool_id).unwrap_or(u32::MAX), agent.idle_seq));
}

/// Choose who greets the next visitor.
///
/// Only agents that [`AgentState::can_greet`] qualify. Candidates are
/// ordered by rank in `pool_id` (a single tier without one), then by how
/// many visitors already watch them, then by how long ago they were last
/// assigned.
pub fn pick_greeting_agent(
    candidates: Vec<AgentState>,
    pool_id: Option<&PoolId>,
    exclude: Option<&AgentId>,
) -> Option<AgentState> {
    candidates
        .into_iter()
        .filter(|agent| agent.can_greet() && Some(&agent.agent_id) != exclude)
        .min_by_key(|agent| {
            let tier = pool_id.map_or(0, |pool_id| agent.rank_in(pool_id).unwrap_or(u32::MAX));
            (tier, agent.simulations.len(), agent.last_assigned_seq, agent.idle_seq)
        })
}

pub(crate) fn count_stats<'a>(agents: impl Iterator<Item = &'a AgentState>, total_visitors: usize) -> PresenceStats {
    let mut stats = PresenceStats {
        total_visitors,
        ..Default::default()
    };
    for agent in agents {
        stats.total_agents += 1;
        match agent.status {
            AgentStatus::Idle => stats.idle_agents += 1,
            AgentStatus::InCall => stats.in_call_agents += 1,
            AgentStatus::Away => stats.away_agents += 1,
            AgentStatus::Offline | AgentStatus::InSimulation => {}
        }
        if agent.presence_status() == AgentStatus::InSimulation {
            stats.in_simulation_agents += 1;
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn agent(status: AgentStatus) -> AgentState {
        let now = Utc::now();
        AgentState {
            agent_id: AgentId::from("alice"),
            socket_id: SocketId::from("s1"),
            status,
            pool_memberships: vec![PoolMembership::new("sales", 1)],
            profile: AgentProfile::new("alice", "acme", "Alice"),
            connected_at: now,
            status_changed_at: now,
            idle_seq: 7,
            disconnected_at: None,
            previous_status: None,
            simulations: vec![],
            last_assigned_seq: 0,
        }
    }

    fn greeter(id: &str, rank: u32, viewers: usize, last_assigned_seq: u64) -> AgentState {
        let mut state = agent(AgentStatus::Idle);
        state.agent_id = AgentId::from(id);
        state.pool_memberships = vec![PoolMembership::new("sales", rank)];
        state.simulations = (0..viewers).map(|n| VisitorId::from(format!("{}-v{}", id, n))).collect();
        state.last_assigned_seq = last_assigned_seq;
        state
    }

    #[test]
    fn idle_sequence_is_strictly_increasing() {
        let seq = IdleSequence::default();
        let a = seq.next();
        let b = seq.next();
        assert!(b > a);
        seq.observe(u64::MAX - 10);
        assert_eq!(seq.next(), u64::MAX - 9);
    }

    #[test]
    fn in_call_agent_restores_as_idle() {
        let now = Utc::now();
        let mut previous = agent(AgentStatus::InCall);
        mark_disconnected(&mut previous, now);
        let state = registration_state(
            Some(previous),
            &AgentId::from("alice"),
            &SocketId::from("s2"),
            AgentProfile::new("alice", "acme", "Alice"),
            vec![],
            Duration::from_secs(10),
            now,
            || 99,
        );
        assert_eq!(state.status, AgentStatus::Idle);
        assert_eq!(state.idle_seq, 99);
        assert!(state.is_connected());
    }

    #[test]
    fn idle_agent_keeps_its_place_across_a_blip() {
        let now = Utc::now();
        let mut previous = agent(AgentStatus::Idle);
        mark_disconnected(&mut previous, now);
        let state = registration_state(
            Some(previous),
            &AgentId::from("alice"),
            &SocketId::from("s2"),
            AgentProfile::new("alice", "acme", "Alice"),
            vec![],
            Duration::from_secs(10),
            now,
            || 99,
        );
        assert_eq!(state.idle_seq, 7);
    }

    #[test]
    fn apply_status_ignores_no_ops() {
        let mut state = agent(AgentStatus::Away);
        assert!(apply_status(&mut state, AgentStatus::Away, Utc::now(), || 1).is_none());
        let change = apply_status(&mut state, AgentStatus::Idle, Utc::now(), || 42).unwrap();
        assert_eq!(change.previous, AgentStatus::Away);
        assert_eq!(state.idle_seq, 42);
    }

    #[test]
    fn stats_count_by_status() {
        let mut greeting = agent(AgentStatus::Idle);
        greeting.simulations.push(VisitorId::from("v1"));
        let agents = [
            agent(AgentStatus::Idle),
            greeting,
            agent(AgentStatus::InCall),
            agent(AgentStatus::Away),
        ];
        let stats = count_stats(agents.iter(), 4);
        assert_eq!(
            stats,
            PresenceStats {
                total_agents: 4,
                idle_agents: 2,
                in_call_agents: 1,
                away_agents: 1,
                in_simulation_agents: 1,
                total_visitors: 4,
            }
        );
    }

    #[test]
    fn unwatched_agent_assigned_longest_ago_greets_first() {
        let pool = PoolId::from("sales");
        let picked = pick_greeting_agent(
            vec![greeter("busy", 1, 2, 1), greeter("recent", 1, 0, 9), greeter("rested", 1, 0, 4)],
            Some(&pool),
            None,
        )
        .unwrap();
        assert_eq!(picked.agent_id, AgentId::from("rested"));
    }

    #[test]
    fn lightest_load_wins_when_everyone_is_watched() {
        let pool = PoolId::from("sales");
        let picked = pick_greeting_agent(
            vec![greeter("alice", 1, 3, 1), greeter("bob", 1, 1, 8)],
            Some(&pool),
            None,
        )
        .unwrap();
        assert_eq!(picked.agent_id, AgentId::from("bob"));
    }

    #[test]
    fn first_tier_with_room_greets() {
        let pool = PoolId::from("sales");
        let mut full = greeter("lead", 1, 1, 0);
        full.profile = full.profile.with_max_simulations(1);
        let candidates = vec![full.clone(), greeter("loaded", 1, 4, 0), greeter("backup", 2, 0, 0)];

        // The loaded lead-tier agent still beats an empty backup
        let picked = pick_greeting_agent(candidates, Some(&pool), None).unwrap();
        assert_eq!(picked.agent_id, AgentId::from("loaded"));

        let picked = pick_greeting_agent(vec![full, greeter("backup", 2, 0, 0)], Some(&pool), None).unwrap();
        assert_eq!(picked.agent_id, AgentId::from("backup"));
    }

    #[test]
    fn busy_and_excluded_agents_never_greet() {
        let mut away = greeter("away", 1, 0, 0);
        away.status = AgentStatus::Away;
        let mut in_call = greeter("in-call", 1, 0, 0);
        in_call.status = AgentStatus::InCall;
        let mut dropped = greeter("dropped", 1, 0, 0);
        mark_disconnected(&mut dropped, Utc::now());
        let excluded = greeter("leaving", 1, 0, 0);

        let candidates = vec![away, in_call, dropped, excluded];
        assert!(pick_greeting_agent(candidates, None, Some(&AgentId::from("leaving"))).is_none());
    }
}
