use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{registration_state, within_grace, IdleSequence, PresenceStore};
use crate::types::{
    dedup_memberships, AgentId, AgentProfile, AgentState, AgentStatus, CallId, GreetingAssignment, OrgId, PoolId,
    PoolMembership, PresenceStats, SocketId, StatusChange, VisitorId, VisitorSession,
};

#[derive(Debug, Clone)]
struct Claim {
    call_id: CallId,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct PresenceState {
    agents: HashMap<AgentId, AgentState>,
    agent_sockets: HashMap<SocketId, AgentId>,
    memberships: HashMap<AgentId, Vec<PoolMembership>>,
    pools: HashMap<PoolId, Vec<AgentId>>,
    claims: HashMap<AgentId, Claim>,
    visitors: HashMap<VisitorId, VisitorSession>,
    visitor_sockets: HashMap<SocketId, VisitorId>,
}

impl PresenceState {
    fn live_claim(&self, agent_id: &AgentId, now: Instant) -> Option<&Claim> {
        self.claims.get(agent_id).filter(|c| c.expires_at > now)
    }

    fn replace_memberships(&mut self, agent_id: &AgentId, memberships: Vec<PoolMembership>) {
        if let Some(previous) = self.memberships.remove(agent_id) {
            for membership in previous {
                if let Some(members) = self.pools.get_mut(&membership.pool_id) {
                    members.retain(|id| id != agent_id);
                    if members.is_empty() {
                        self.pools.remove(&membership.pool_id);
                    }
                }
            }
        }
        for membership in &memberships {
            let members = self.pools.entry(membership.pool_id.clone()).or_default();
            if !members.contains(agent_id) {
                members.push(agent_id.clone());
            }
        }
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.pool_memberships = memberships.clone();
        }
        self.memberships.insert(agent_id.clone(), memberships);
    }

    fn put_agent(&mut self, state: AgentState) {
        if let Some(previous) = self.agents.get(&state.agent_id) {
            if previous.socket_id != state.socket_id {
                self.agent_sockets.remove(&previous.socket_id);
            }
        }
        if state.is_connected() {
            self.agent_sockets.insert(state.socket_id.clone(), state.agent_id.clone());
        } else {
            self.agent_sockets.remove(&state.socket_id);
        }
        self.agents.insert(state.agent_id.clone(), state);
    }

    fn drop_agent(&mut self, agent_id: &AgentId) -> Option<AgentState> {
        let removed = self.agents.remove(agent_id)?;
        if self.agent_sockets.get(&removed.socket_id) == Some(agent_id) {
            self.agent_sockets.remove(&removed.socket_id);
        }
        self.claims.remove(agent_id);
        Some(removed)
    }

    fn put_visitor(&mut self, session: VisitorSession) {
        if let Some(previous) = self.visitors.get(&session.visitor_id).cloned() {
            if previous.socket_id != session.socket_id {
                self.visitor_sockets.remove(&previous.socket_id);
            }
            if let Some(agent_id) = previous
                .assigned_agent_id
                .filter(|agent_id| session.assigned_agent_id.as_ref() != Some(agent_id))
            {
                self.detach_viewer(&agent_id, &session.visitor_id);
            }
        }
        self.visitor_sockets
            .insert(session.socket_id.clone(), session.visitor_id.clone());
        self.visitors.insert(session.visitor_id.clone(), session);
    }

    fn drop_visitor(&mut self, visitor_id: &VisitorId) -> Option<VisitorSession> {
        let removed = self.visitors.remove(visitor_id)?;
        if self.visitor_sockets.get(&removed.socket_id) == Some(visitor_id) {
            self.visitor_sockets.remove(&removed.socket_id);
        }
        if let Some(agent_id) = &removed.assigned_agent_id {
            self.detach_viewer(agent_id, visitor_id);
        }
        Some(removed)
    }

    fn detach_viewer(&mut self, agent_id: &AgentId, visitor_id: &VisitorId) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.simulations.retain(|id| id != visitor_id);
        }
    }

    fn assign_viewer(&mut self, visitor_id: &VisitorId, agent_id: &AgentId, seq: u64) -> Option<GreetingAssignment> {
        if !self.agents.contains_key(agent_id) {
            return None;
        }
        let visitor = self.visitors.get_mut(visitor_id)?;
        let previous_agent_id = visitor
            .assigned_agent_id
            .replace(agent_id.clone())
            .filter(|previous| previous != agent_id);
        let visitor = visitor.clone();
        if let Some(previous) = &previous_agent_id {
            self.detach_viewer(previous, visitor_id);
        }

        let agent = self.agents.get_mut(agent_id)?;
        if !agent.simulations.contains(visitor_id) {
            agent.simulations.push(visitor_id.clone());
        }
        agent.last_assigned_seq = seq;
        Some(GreetingAssignment {
            visitor,
            agent: agent.clone(),
            previous_agent_id,
        })
    }
}

/// Single-process [`PresenceStore`]
///
/// All state sits behind one `RwLock` that is never held across an await,
/// so every operation is atomic with respect to the others.
#[derive(Debug)]
pub struct LocalPresenceStore {
    state: RwLock<PresenceState>,
    grace_period: Duration,
    idle_sequence: IdleSequence,
}

impl Default for LocalPresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalPresenceStore {
    pub fn new() -> Self {
        Self::with_grace_period(super::DEFAULT_AGENT_GRACE)
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            state: RwLock::new(PresenceState::default()),
            grace_period,
            idle_sequence: IdleSequence::default(),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    // Mirror hooks used by the distributed store to keep a local copy of
    // whatever it last wrote, so it can keep serving during an outage.

    pub(crate) fn mirror_agent(&self, state: AgentState) {
        self.idle_sequence.observe(state.idle_seq);
        self.state.write().put_agent(state);
    }

    pub(crate) fn mirror_agent_removed(&self, agent_id: &AgentId) {
        self.state.write().drop_agent(agent_id);
    }

    pub(crate) fn mirror_memberships(&self, agent_id: &AgentId, memberships: Vec<PoolMembership>) {
        self.state.write().replace_memberships(agent_id, memberships);
    }

    pub(crate) fn mirror_claim(&self, agent_id: &AgentId, call_id: &CallId, ttl: Duration) {
        self.state.write().claims.insert(
            agent_id.clone(),
            Claim {
                call_id: call_id.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub(crate) fn mirror_claim_released(&self, agent_id: &AgentId, call_id: &CallId) {
        let mut state = self.state.write();
        if state.claims.get(agent_id).is_some_and(|c| &c.call_id == call_id) {
            state.claims.remove(agent_id);
        }
    }

    pub(crate) fn mirror_claim_cleared(&self, agent_id: &AgentId) {
        self.state.write().claims.remove(agent_id);
    }

    pub(crate) fn mirror_visitor(&self, session: VisitorSession) {
        self.state.write().put_visitor(session);
    }

    pub(crate) fn mirror_visitor_removed(&self, visitor_id: &VisitorId) {
        self.state.write().drop_visitor(visitor_id);
    }

    pub(crate) fn next_idle_seq(&self) -> u64 {
        self.idle_sequence.next()
    }

    /// Candidates in `pool_id`: idle, connected, unclaimed; best first
    fn ordered_candidates(&self, pool_id: &PoolId) -> Vec<AgentState> {
        let now = Instant::now();
        let state = self.state.read();
        let mut candidates: Vec<AgentState> = state
            .pools
            .get(pool_id)
            .into_iter()
            .flatten()
            .filter_map(|agent_id| state.agents.get(agent_id))
            .filter(|agent| agent.status.is_available() && agent.is_connected())
            .filter(|agent| state.live_claim(&agent.agent_id, now).is_none())
            .cloned()
            .collect();
        super::sort_candidates(&mut candidates, pool_id);
        candidates
    }
}

#[async_trait]
impl PresenceStore for LocalPresenceStore {
    fn is_distributed(&self) -> bool {
        false
    }

    async fn register_agent(&self, agent_id: &AgentId, socket_id: &SocketId, profile: AgentProfile) -> AgentState {
        let now = Utc::now();
        let mut state = self.state.write();
        let memberships = state.memberships.get(agent_id).cloned().unwrap_or_default();
        let existing = state.agents.get(agent_id).cloned();
        let registered = registration_state(
            existing,
            agent_id,
            socket_id,
            profile,
            memberships,
            self.grace_period,
            now,
            || self.idle_sequence.next(),
        );
        info!(
            "👤 Agent registered: {} ({}) as {}",
            registered.profile.display_name, agent_id, registered.status
        );
        state.put_agent(registered.clone());
        registered
    }

    async fn get_agent(&self, agent_id: &AgentId) -> Option<AgentState> {
        self.state.read().agents.get(agent_id).cloned()
    }

    async fn get_agent_by_socket(&self, socket_id: &SocketId) -> Option<AgentState> {
        let state = self.state.read();
        state
            .agent_sockets
            .get(socket_id)
            .and_then(|agent_id| state.agents.get(agent_id))
            .cloned()
    }

    async fn set_agent_status(&self, agent_id: &AgentId, status: AgentStatus) -> Option<StatusChange> {
        let mut state = self.state.write();
        let agent = state.agents.get_mut(agent_id)?;
        let change = super::apply_status(agent, status, Utc::now(), || self.idle_sequence.next())?;
        debug!("Agent {} status {} -> {}", agent_id, change.previous, change.current);
        Some(change)
    }

    async fn set_pool_memberships(&self, agent_id: &AgentId, memberships: Vec<PoolMembership>) {
        let memberships = dedup_memberships(memberships);
        let count = memberships.len();
        self.state.write().replace_memberships(agent_id, memberships);
        info!("🏊 Agent {} pool memberships updated: {} pool(s)", agent_id, count);
    }

    async fn pool_members(&self, pool_id: &PoolId) -> Vec<AgentState> {
        let state = self.state.read();
        state
            .pools
            .get(pool_id)
            .into_iter()
            .flatten()
            .filter_map(|agent_id| state.agents.get(agent_id).cloned())
            .collect()
    }

    async fn available_agents(&self, pool_id: &PoolId) -> Vec<AgentState> {
        self.ordered_candidates(pool_id)
    }

    async fn try_claim_agent(&self, agent_id: &AgentId, call_id: &CallId, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut state = self.state.write();
        if state.live_claim(agent_id, now).is_some() {
            return false;
        }
        state.claims.insert(
            agent_id.clone(),
            Claim {
                call_id: call_id.clone(),
                expires_at: now + ttl,
            },
        );
        true
    }

    async fn extend_agent_claim(&self, agent_id: &AgentId, call_id: &CallId, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut state = self.state.write();
        match state.claims.get_mut(agent_id) {
            Some(claim) if &claim.call_id == call_id && claim.expires_at > now => {
                claim.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    async fn release_agent_claim(&self, agent_id: &AgentId, call_id: &CallId) {
        self.mirror_claim_released(agent_id, call_id);
    }

    async fn agent_claim(&self, agent_id: &AgentId) -> Option<CallId> {
        self.state
            .read()
            .live_claim(agent_id, Instant::now())
            .map(|c| c.call_id.clone())
    }

    async fn disconnect_agent(&self, agent_id: &AgentId) -> Option<AgentState> {
        let now = Utc::now();
        let mut state = self.state.write();
        let mut agent = state.agents.get(agent_id).cloned()?;
        super::mark_disconnected(&mut agent, now);
        state.put_agent(agent.clone());
        state.claims.remove(agent_id);
        info!("🔌 Agent {} disconnected, holding record for {:?}", agent_id, self.grace_period);
        Some(agent)
    }

    async fn unregister_agent(&self, agent_id: &AgentId) -> Option<AgentState> {
        let removed = self.state.write().drop_agent(agent_id);
        if removed.is_some() {
            info!("👋 Agent unregistered: {}", agent_id);
        }
        removed
    }

    async fn purge_disconnected(&self, grace: Duration) -> Vec<AgentId> {
        let now = Utc::now();
        let mut state = self.state.write();
        let expired: Vec<AgentId> = state
            .agents
            .values()
            .filter(|agent| {
                agent
                    .disconnected_at
                    .is_some_and(|at: DateTime<Utc>| !within_grace(at, grace, now))
            })
            .map(|agent| agent.agent_id.clone())
            .collect();
        for agent_id in &expired {
            state.drop_agent(agent_id);
        }
        expired
    }

    async fn all_agents(&self) -> Vec<AgentState> {
        self.state.read().agents.values().cloned().collect()
    }

    async fn register_visitor(&self, session: VisitorSession) {
        debug!(
            "Visitor registered: {} on {} (pool {:?})",
            session.visitor_id, session.page_url, session.matched_pool_id
        );
        self.state.write().put_visitor(session);
    }

    async fn get_visitor(&self, visitor_id: &VisitorId) -> Option<VisitorSession> {
        self.state.read().visitors.get(visitor_id).cloned()
    }

    async fn get_visitor_by_socket(&self, socket_id: &SocketId) -> Option<VisitorSession> {
        let state = self.state.read();
        state
            .visitor_sockets
            .get(socket_id)
            .and_then(|visitor_id| state.visitors.get(visitor_id))
            .cloned()
    }

    async fn update_visitor_socket(&self, visitor_id: &VisitorId, socket_id: &SocketId) -> bool {
        let mut state = self.state.write();
        let Some(mut session) = state.visitors.get(visitor_id).cloned() else {
            return false;
        };
        session.socket_id = socket_id.clone();
        state.put_visitor(session);
        true
    }

    async fn update_visitor_page(&self, visitor_id: &VisitorId, page_url: &str, matched_pool_id: Option<PoolId>) -> bool {
        let mut state = self.state.write();
        match state.visitors.get_mut(visitor_id) {
            Some(session) => {
                session.page_url = page_url.to_string();
                session.matched_pool_id = matched_pool_id;
                true
            }
            None => false,
        }
    }

    async fn remove_visitor(&self, visitor_id: &VisitorId) -> Option<VisitorSession> {
        self.state.write().drop_visitor(visitor_id)
    }

    async fn assign_visitor(&self, visitor_id: &VisitorId, agent_id: &AgentId) -> Option<GreetingAssignment> {
        let assignment = self
            .state
            .write()
            .assign_viewer(visitor_id, agent_id, self.idle_sequence.next())?;
        debug!(
            "Visitor {} now greeted by {} ({} viewer(s))",
            visitor_id,
            agent_id,
            assignment.agent.simulations.len()
        );
        Some(assignment)
    }

    async fn unassign_visitor(&self, visitor_id: &VisitorId) -> Option<AgentId> {
        let mut state = self.state.write();
        let agent_id = state.visitors.get_mut(visitor_id)?.assigned_agent_id.take()?;
        state.detach_viewer(&agent_id, visitor_id);
        Some(agent_id)
    }

    async fn unassigned_visitors(&self, org_id: &OrgId) -> Vec<VisitorSession> {
        let state = self.state.read();
        let mut waiting: Vec<VisitorSession> = state
            .visitors
            .values()
            .filter(|session| &session.org_id == org_id && session.assigned_agent_id.is_none())
            .cloned()
            .collect();
        waiting.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.visitor_id.as_str().cmp(b.visitor_id.as_str()))
        });
        waiting
    }

    async fn stats(&self) -> PresenceStats {
        let state = self.state.read();
        super::count_stats(state.agents.values(), state.visitors.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrgId;
    use pretty_assertions::assert_eq;

    fn profile(id: &str) -> AgentProfile {
        AgentProfile::new(id, "acme", id.to_uppercase())
    }

    async fn online(store: &LocalPresenceStore, id: &str, pools: &[&str]) {
        store
            .set_pool_memberships(
                &AgentId::from(id),
                PoolMembership::from_ordered(pools.iter().map(|p| PoolId::from(*p))),
            )
            .await;
        store
            .register_agent(&AgentId::from(id), &SocketId::from(format!("sock-{}", id)), profile(id))
            .await;
    }

    #[tokio::test]
    async fn longest_idle_agent_is_offered_first() {
        let store = LocalPresenceStore::new();
        online(&store, "alice", &["sales"]).await;
        online(&store, "bob", &["sales"]).await;

        let found = store.find_available_agent(&PoolId::from("sales"), &[]).await.unwrap();
        assert_eq!(found.agent_id, AgentId::from("alice"));

        // Alice goes away and comes back: Bob has now been idle longer
        store.set_agent_status(&AgentId::from("alice"), AgentStatus::Away).await;
        store.set_agent_status(&AgentId::from("alice"), AgentStatus::Idle).await;
        let found = store.find_available_agent(&PoolId::from("sales"), &[]).await.unwrap();
        assert_eq!(found.agent_id, AgentId::from("bob"));
    }

    #[tokio::test]
    async fn lower_priority_tier_wins_over_idle_time() {
        let store = LocalPresenceStore::new();
        // Alice only backs up sales (second pool), Bob leads it
        online(&store, "alice", &["support", "sales"]).await;
        online(&store, "bob", &["sales"]).await;

        let found = store.find_available_agent(&PoolId::from("sales"), &[]).await.unwrap();
        assert_eq!(found.agent_id, AgentId::from("bob"));
    }

    #[tokio::test]
    async fn never_returns_non_idle_or_non_member() {
        let store = LocalPresenceStore::new();
        online(&store, "alice", &["sales"]).await;
        online(&store, "bob", &["support"]).await;
        store.set_agent_status(&AgentId::from("alice"), AgentStatus::Away).await;

        assert!(store.find_available_agent(&PoolId::from("sales"), &[]).await.is_none());
        for status in [AgentStatus::InCall, AgentStatus::Offline, AgentStatus::InSimulation] {
            store.set_agent_status(&AgentId::from("alice"), status).await;
            assert!(store.find_available_agent(&PoolId::from("sales"), &[]).await.is_none());
        }
    }

    #[tokio::test]
    async fn excluded_agents_are_skipped() {
        let store = LocalPresenceStore::new();
        online(&store, "alice", &["sales"]).await;
        online(&store, "bob", &["sales"]).await;
        let found = store
            .find_available_agent(&PoolId::from("sales"), &[AgentId::from("alice")])
            .await
            .unwrap();
        assert_eq!(found.agent_id, AgentId::from("bob"));
    }

    #[tokio::test]
    async fn claims_are_exclusive() {
        let store = LocalPresenceStore::new();
        online(&store, "alice", &["sales"]).await;
        let alice = AgentId::from("alice");
        let ttl = Duration::from_secs(30);

        assert!(store.try_claim_agent(&alice, &CallId::from("c1"), ttl).await);
        assert!(!store.try_claim_agent(&alice, &CallId::from("c2"), ttl).await);
        assert!(store.available_agents(&PoolId::from("sales")).await.is_empty());

        // Only the owner can release
        store.release_agent_claim(&alice, &CallId::from("c2")).await;
        assert_eq!(store.agent_claim(&alice).await, Some(CallId::from("c1")));
        store.release_agent_claim(&alice, &CallId::from("c1")).await;
        assert!(store.try_claim_agent(&alice, &CallId::from("c2"), ttl).await);
    }

    #[tokio::test(start_paused = true)]
    async fn claims_expire() {
        let store = LocalPresenceStore::new();
        let alice = AgentId::from("alice");
        assert!(store.try_claim_agent(&alice, &CallId::from("c1"), Duration::from_secs(5)).await);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!store.extend_agent_claim(&alice, &CallId::from("c1"), Duration::from_secs(5)).await);
        assert!(store.try_claim_agent(&alice, &CallId::from("c2"), Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn memberships_never_duplicate() {
        let store = LocalPresenceStore::new();
        let alice = AgentId::from("alice");
        store
            .set_pool_memberships(
                &alice,
                vec![
                    PoolMembership::new("sales", 1),
                    PoolMembership::new("sales", 2),
                    PoolMembership::new("support", 3),
                ],
            )
            .await;
        store.register_agent(&alice, &SocketId::from("s1"), profile("alice")).await;
        store
            .set_pool_memberships(&alice, vec![PoolMembership::new("sales", 1)])
            .await;

        assert_eq!(store.pool_members(&PoolId::from("sales")).await.len(), 1);
        assert!(store.pool_members(&PoolId::from("support")).await.is_empty());
        let agent = store.get_agent(&alice).await.unwrap();
        assert_eq!(agent.pool_memberships, vec![PoolMembership::new("sales", 1)]);
    }

    #[tokio::test]
    async fn unchanged_status_reports_nothing() {
        let store = LocalPresenceStore::new();
        online(&store, "alice", &[]).await;
        let alice = AgentId::from("alice");
        assert!(store.set_agent_status(&alice, AgentStatus::Idle).await.is_none());
        let change = store.set_agent_status(&alice, AgentStatus::Away).await.unwrap();
        assert_eq!(change.previous, AgentStatus::Idle);
        assert_eq!(change.current, AgentStatus::Away);
        assert_eq!(change.org_id, OrgId::from("acme"));
        assert!(store.set_agent_status(&AgentId::from("ghost"), AgentStatus::Idle).await.is_none());
    }

    #[tokio::test]
    async fn reconnect_inside_grace_keeps_status() {
        let store = LocalPresenceStore::with_grace_period(Duration::from_secs(10));
        online(&store, "alice", &["sales"]).await;
        let alice = AgentId::from("alice");
        store.set_agent_status(&alice, AgentStatus::Away).await;

        let dropped = store.disconnect_agent(&alice).await.unwrap();
        assert_eq!(dropped.status, AgentStatus::Offline);
        assert!(store.get_agent_by_socket(&SocketId::from("sock-alice")).await.is_none());

        let back = store.register_agent(&alice, &SocketId::from("new-sock"), profile("alice")).await;
        assert_eq!(back.status, AgentStatus::Away);
        assert!(back.is_connected());
        assert_eq!(
            store.get_agent_by_socket(&SocketId::from("new-sock")).await.unwrap().agent_id,
            alice
        );
    }

    #[tokio::test]
    async fn reconnect_after_grace_is_fresh_login() {
        let store = LocalPresenceStore::with_grace_period(Duration::ZERO);
        online(&store, "alice", &["sales"]).await;
        let alice = AgentId::from("alice");
        store.set_agent_status(&alice, AgentStatus::Away).await;
        store.disconnect_agent(&alice).await;

        let back = store.register_agent(&alice, &SocketId::from("new-sock"), profile("alice")).await;
        assert_eq!(back.status, AgentStatus::Idle);
        // Pool memberships survive since they are configuration
        assert_eq!(back.rank_in(&PoolId::from("sales")), Some(1));
    }

    #[tokio::test]
    async fn purge_removes_expired_disconnects() {
        let store = LocalPresenceStore::new();
        online(&store, "alice", &["sales"]).await;
        online(&store, "bob", &["sales"]).await;
        store.disconnect_agent(&AgentId::from("alice")).await;

        assert!(store.purge_disconnected(Duration::from_secs(3_600)).await.is_empty());
        let purged = store.purge_disconnected(Duration::ZERO).await;
        assert_eq!(purged, vec![AgentId::from("alice")]);
        assert!(store.get_agent(&AgentId::from("alice")).await.is_none());
        assert!(store.get_agent(&AgentId::from("bob")).await.is_some());
    }

    #[tokio::test]
    async fn visitor_socket_index_follows_updates() {
        let store = LocalPresenceStore::new();
        let visitor = VisitorId::from("v1");
        store
            .register_visitor(VisitorSession {
                visitor_id: visitor.clone(),
                org_id: OrgId::from("acme"),
                socket_id: SocketId::from("s1"),
                page_url: "https://acme.com/".to_string(),
                matched_pool_id: None,
                location: None,
                connected_at: Utc::now(),
                assigned_agent_id: None,
            })
            .await;

        assert!(store.update_visitor_socket(&visitor, &SocketId::from("s2")).await);
        assert!(store.get_visitor_by_socket(&SocketId::from("s1")).await.is_none());
        assert_eq!(
            store.get_visitor_by_socket(&SocketId::from("s2")).await.unwrap().visitor_id,
            visitor
        );
        assert!(store.update_visitor_page(&visitor, "https://acme.com/pricing", Some(PoolId::from("sales"))).await);
        assert_eq!(store.stats().await.total_visitors, 1);
        assert!(store.remove_visitor(&visitor).await.is_some());
        assert!(!store.update_visitor_socket(&visitor, &SocketId::from("s3")).await);
    }

    async fn visit(store: &LocalPresenceStore, id: &str) -> VisitorId {
        let visitor_id = VisitorId::from(id);
        store
            .register_visitor(VisitorSession {
                visitor_id: visitor_id.clone(),
                org_id: OrgId::from("acme"),
                socket_id: SocketId::from(format!("sock-{}", id)),
                page_url: "https://acme.com/".to_string(),
                matched_pool_id: Some(PoolId::from("sales")),
                location: None,
                connected_at: Utc::now(),
                assigned_agent_id: None,
            })
            .await;
        visitor_id
    }

    #[tokio::test]
    async fn greetings_spread_across_idle_agents() {
        let store = LocalPresenceStore::new();
        online(&store, "alice", &["sales"]).await;
        online(&store, "bob", &["sales"]).await;
        let org = OrgId::from("acme");
        let sales = PoolId::from("sales");

        for (visitor, expected) in [("v1", "alice"), ("v2", "bob"), ("v3", "alice")] {
            let visitor = visit(&store, visitor).await;
            let agent = store.find_greeting_agent(&org, Some(&sales), None).await.unwrap();
            assert_eq!(agent.agent_id, AgentId::from(expected));
            store.assign_visitor(&visitor, &agent.agent_id).await.unwrap();
        }

        let alice = store.get_agent(&AgentId::from("alice")).await.unwrap();
        assert_eq!(alice.simulations, vec![VisitorId::from("v1"), VisitorId::from("v3")]);
        assert_eq!(alice.presence_status(), AgentStatus::InSimulation);
        // Greeting viewers never take an agent out of call rotation
        assert_eq!(store.available_agents(&sales).await.len(), 2);
        assert_eq!(store.stats().await.in_simulation_agents, 2);
    }

    #[tokio::test]
    async fn reassigning_moves_the_viewer() {
        let store = LocalPresenceStore::new();
        online(&store, "alice", &["sales"]).await;
        online(&store, "bob", &["sales"]).await;
        let visitor = visit(&store, "v1").await;
        store.assign_visitor(&visitor, &AgentId::from("alice")).await.unwrap();

        let moved = store.assign_visitor(&visitor, &AgentId::from("bob")).await.unwrap();
        assert_eq!(moved.previous_agent_id, Some(AgentId::from("alice")));
        assert_eq!(moved.visitor.assigned_agent_id, Some(AgentId::from("bob")));
        assert!(store.get_agent(&AgentId::from("alice")).await.unwrap().simulations.is_empty());
        assert!(store.assign_visitor(&visitor, &AgentId::from("ghost")).await.is_none());
    }

    #[tokio::test]
    async fn unassigned_visitors_wait_until_removed() {
        let store = LocalPresenceStore::new();
        online(&store, "alice", &["sales"]).await;
        let org = OrgId::from("acme");
        let first = visit(&store, "v1").await;
        let second = visit(&store, "v2").await;
        store.assign_visitor(&first, &AgentId::from("alice")).await.unwrap();
        store.assign_visitor(&second, &AgentId::from("alice")).await.unwrap();

        assert_eq!(store.unassign_visitor(&first).await, Some(AgentId::from("alice")));
        assert_eq!(store.unassign_visitor(&first).await, None);
        let waiting: Vec<VisitorId> = store
            .unassigned_visitors(&org)
            .await
            .into_iter()
            .map(|s| s.visitor_id)
            .collect();
        assert_eq!(waiting, vec![first.clone()]);
        assert!(store.unassigned_visitors(&OrgId::from("other")).await.is_empty());

        // Leaving frees the agent's slot
        store.remove_visitor(&second).await;
        assert!(store.get_agent(&AgentId::from("alice")).await.unwrap().simulations.is_empty());
    }
}
