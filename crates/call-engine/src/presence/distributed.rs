use async_trait::async_trait;
use chrono::Utc;
use greetnow_infra_common::{SharedStore, StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{apply_status, count_stats, mark_disconnected, registration_state, sort_candidates, within_grace};
use super::{LocalPresenceStore, PresenceStore};
use crate::keys;
use crate::types::{
    dedup_memberships, AgentId, AgentProfile, AgentState, AgentStatus, CallId, GreetingAssignment, OrgId, PoolId,
    PoolMembership, PresenceStats, SocketId, StatusChange, VisitorId, VisitorSession,
};

/// Compare-and-set attempts before an update is abandoned
const MAX_CAS_ATTEMPTS: usize = 16;

/// Visitor records expire if their process dies without cleaning up
const VISITOR_TTL: Duration = Duration::from_secs(6 * 3_600);

/// [`PresenceStore`] backed by a [`SharedStore`]
///
/// Records are JSON values; read-modify-write goes through compare-and-set
/// loops and claims use `set_if_absent`, so concurrent processes never
/// double-assign an agent. Indexes (all agents, pool members, connected and
/// waiting visitors) are store sets. Every successful write is mirrored locally and the
/// mirror answers whenever the shared store errors.
#[derive(Debug)]
pub struct DistributedPresenceStore {
    store: Arc<dyn SharedStore>,
    mirror: LocalPresenceStore,
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> StoreResult<T> {
    serde_json::from_str(raw).map_err(|e| StoreError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn encode<T: Serialize>(key: &str, value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

impl DistributedPresenceStore {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self::with_grace_period(store, super::DEFAULT_AGENT_GRACE)
    }

    pub fn with_grace_period(store: Arc<dyn SharedStore>, grace_period: Duration) -> Self {
        Self {
            store,
            mirror: LocalPresenceStore::with_grace_period(grace_period),
        }
    }

    fn degraded(&self, operation: &str, error: &StoreError) {
        warn!(
            "⚠️ Shared store failed during {}, serving from local mirror: {}",
            operation, error
        );
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.store.get(key).await? {
            Some(raw) => decode(key, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Read-modify-write under compare-and-set.
    ///
    /// `update` sees the current value and returns the replacement, or `None`
    /// to leave the key alone. It may run more than once under contention.
    async fn update_json<T, F>(&self, key: &str, ttl: Option<Duration>, mut update: F) -> StoreResult<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut(Option<T>) -> Option<T> + Send,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let raw = self.store.get(key).await?;
            let current = match raw.as_deref() {
                Some(raw) => Some(decode::<T>(key, raw)?),
                None => None,
            };
            let Some(next) = update(current) else {
                return Ok(None);
            };
            let encoded = encode(key, &next)?;
            if self
                .store
                .compare_and_set(key, raw.as_deref(), &encoded, ttl)
                .await?
            {
                return Ok(Some(next));
            }
            debug!("CAS conflict on {} (attempt {})", key, attempt);
        }
        Err(StoreError::Command(format!(
            "gave up updating {} after {} conflicting writes",
            key, MAX_CAS_ATTEMPTS
        )))
    }

    async fn add_to_index(&self, key: &str, id: &str) -> StoreResult<()> {
        self.store.set_add(key, id, None).await?;
        Ok(())
    }

    async fn remove_from_index(&self, key: &str, id: &str) -> StoreResult<()> {
        self.store.set_remove(key, id).await?;
        Ok(())
    }

    async fn index(&self, key: &str) -> StoreResult<Vec<String>> {
        self.store.set_members(key).await
    }

    async fn register_in_store(
        &self,
        agent_id: &AgentId,
        socket_id: &SocketId,
        profile: &AgentProfile,
    ) -> StoreResult<AgentState> {
        let memberships: Vec<PoolMembership> = self
            .read_json(&keys::agent_pools(agent_id))
            .await?
            .unwrap_or_default();
        let now = Utc::now();
        let grace = self.mirror.grace_period();
        let mut replaced_socket = None;
        let registered = self
            .update_json(&keys::agent(agent_id), None, |existing: Option<AgentState>| {
                replaced_socket = existing
                    .as_ref()
                    .map(|previous| previous.socket_id.clone())
                    .filter(|previous| previous != socket_id);
                Some(registration_state(
                    existing,
                    agent_id,
                    socket_id,
                    profile.clone(),
                    memberships.clone(),
                    grace,
                    now,
                    || self.mirror.next_idle_seq(),
                ))
            })
            .await?
            .ok_or_else(|| StoreError::Command(format!("registration of {} produced no record", agent_id)))?;

        if let Some(previous) = replaced_socket {
            self.store
                .delete_if_equals(&keys::agent_socket(&previous), agent_id.as_str())
                .await?;
        }
        self.store
            .set(&keys::agent_socket(socket_id), agent_id.as_str(), None)
            .await?;
        self.add_to_index(&keys::agent_index(), agent_id.as_str()).await?;
        Ok(registered)
    }

    async fn agent_by_socket_in_store(&self, socket_id: &SocketId) -> StoreResult<Option<AgentState>> {
        let Some(agent_id) = self.store.get(&keys::agent_socket(socket_id)).await? else {
            return Ok(None);
        };
        let agent: Option<AgentState> = self.read_json(&keys::agent(&AgentId::from(agent_id))).await?;
        Ok(agent.filter(|agent| &agent.socket_id == socket_id && agent.is_connected()))
    }

    async fn status_in_store(
        &self,
        agent_id: &AgentId,
        status: AgentStatus,
    ) -> StoreResult<Option<(AgentState, StatusChange)>> {
        let now = Utc::now();
        let mut change = None;
        let updated = self
            .update_json(&keys::agent(agent_id), None, |current: Option<AgentState>| {
                let mut agent = current?;
                change = apply_status(&mut agent, status, now, || self.mirror.next_idle_seq());
                change.as_ref().map(|_| agent)
            })
            .await?;
        Ok(updated.zip(change))
    }

    async fn memberships_in_store(&self, agent_id: &AgentId, memberships: &[PoolMembership]) -> StoreResult<()> {
        let mut previous = Vec::new();
        self.update_json(&keys::agent_pools(agent_id), None, |current: Option<Vec<PoolMembership>>| {
            previous = current.unwrap_or_default();
            Some(memberships.to_vec())
        })
        .await?;

        for old in previous
            .iter()
            .filter(|old| !memberships.iter().any(|m| m.pool_id == old.pool_id))
        {
            self.remove_from_index(&keys::pool_agents(&old.pool_id), agent_id.as_str())
                .await?;
        }
        for membership in memberships {
            self.add_to_index(&keys::pool_agents(&membership.pool_id), agent_id.as_str())
                .await?;
        }

        self.update_json(&keys::agent(agent_id), None, |current: Option<AgentState>| {
            let mut agent = current?;
            if agent.pool_memberships.as_slice() == memberships {
                return None;
            }
            agent.pool_memberships = memberships.to_vec();
            Some(agent)
        })
        .await?;
        Ok(())
    }

    async fn members_in_store(&self, pool_id: &PoolId) -> StoreResult<Vec<AgentState>> {
        let mut agents = Vec::new();
        for agent_id in self.index(&keys::pool_agents(pool_id)).await? {
            if let Some(agent) = self
                .read_json::<AgentState>(&keys::agent(&AgentId::from(agent_id)))
                .await?
            {
                agents.push(agent);
            }
        }
        Ok(agents)
    }

    async fn available_in_store(&self, pool_id: &PoolId) -> StoreResult<Vec<AgentState>> {
        let mut candidates = Vec::new();
        for agent in self.members_in_store(pool_id).await? {
            if !agent.status.is_available() || !agent.is_connected() {
                continue;
            }
            if self.store.get(&keys::agent_claim(&agent.agent_id)).await?.is_some() {
                continue;
            }
            candidates.push(agent);
        }
        sort_candidates(&mut candidates, pool_id);
        Ok(candidates)
    }

    async fn disconnect_in_store(&self, agent_id: &AgentId) -> StoreResult<Option<AgentState>> {
        let now = Utc::now();
        let updated = self
            .update_json(&keys::agent(agent_id), None, |current: Option<AgentState>| {
                let mut agent = current?;
                mark_disconnected(&mut agent, now);
                Some(agent)
            })
            .await?;
        if let Some(agent) = &updated {
            self.store
                .delete_if_equals(&keys::agent_socket(&agent.socket_id), agent_id.as_str())
                .await?;
            self.store.delete(&keys::agent_claim(agent_id)).await?;
        }
        Ok(updated)
    }

    async fn forget_agent(&self, agent: &AgentState) -> StoreResult<()> {
        self.store
            .delete_if_equals(&keys::agent_socket(&agent.socket_id), agent.agent_id.as_str())
            .await?;
        self.store.delete(&keys::agent_claim(&agent.agent_id)).await?;
        self.remove_from_index(&keys::agent_index(), agent.agent_id.as_str())
            .await
    }

    async fn unregister_in_store(&self, agent_id: &AgentId) -> StoreResult<Option<AgentState>> {
        let key = keys::agent(agent_id);
        let Some(agent) = self.read_json::<AgentState>(&key).await? else {
            return Ok(None);
        };
        self.store.delete(&key).await?;
        self.forget_agent(&agent).await?;
        Ok(Some(agent))
    }

    async fn purge_in_store(&self, grace: Duration) -> StoreResult<Vec<AgentId>> {
        let now = Utc::now();
        let mut purged = Vec::new();
        for agent_id in self.index(&keys::agent_index()).await? {
            let agent_id = AgentId::from(agent_id);
            let key = keys::agent(&agent_id);
            let Some(raw) = self.store.get(&key).await? else {
                self.remove_from_index(&keys::agent_index(), agent_id.as_str()).await?;
                continue;
            };
            let agent: AgentState = decode(&key, &raw)?;
            let expired = agent
                .disconnected_at
                .is_some_and(|at| !within_grace(at, grace, now));
            // Only delete the exact record we judged; a concurrent login wins
            if expired && self.store.delete_if_equals(&key, &raw).await? {
                self.forget_agent(&agent).await?;
                purged.push(agent_id);
            }
        }
        Ok(purged)
    }

    async fn all_in_store(&self) -> StoreResult<Vec<AgentState>> {
        let mut agents = Vec::new();
        for agent_id in self.index(&keys::agent_index()).await? {
            if let Some(agent) = self
                .read_json::<AgentState>(&keys::agent(&AgentId::from(agent_id)))
                .await?
            {
                agents.push(agent);
            }
        }
        Ok(agents)
    }

    async fn register_visitor_in_store(&self, session: &VisitorSession) -> StoreResult<()> {
        let key = keys::visitor(&session.visitor_id);
        if let Some(previous) = self.read_json::<VisitorSession>(&key).await? {
            if previous.socket_id != session.socket_id {
                self.store
                    .delete_if_equals(&keys::visitor_socket(&previous.socket_id), session.visitor_id.as_str())
                    .await?;
            }
            if let Some(agent_id) = previous
                .assigned_agent_id
                .filter(|agent_id| session.assigned_agent_id.as_ref() != Some(agent_id))
            {
                self.detach_in_store(&agent_id, &session.visitor_id).await?;
            }
        }
        self.store
            .set(&key, &encode(&key, session)?, Some(VISITOR_TTL))
            .await?;
        self.store
            .set(
                &keys::visitor_socket(&session.socket_id),
                session.visitor_id.as_str(),
                Some(VISITOR_TTL),
            )
            .await?;
        self.store
            .set_add(&keys::visitor_index(), session.visitor_id.as_str(), Some(VISITOR_TTL))
            .await?;
        if session.assigned_agent_id.is_none() {
            self.store
                .set_add(
                    &keys::waiting_visitors(&session.org_id),
                    session.visitor_id.as_str(),
                    Some(VISITOR_TTL),
                )
                .await?;
        }
        Ok(())
    }

    async fn visitor_by_socket_in_store(&self, socket_id: &SocketId) -> StoreResult<Option<VisitorSession>> {
        let Some(visitor_id) = self.store.get(&keys::visitor_socket(socket_id)).await? else {
            return Ok(None);
        };
        let session: Option<VisitorSession> = self
            .read_json(&keys::visitor(&VisitorId::from(visitor_id)))
            .await?;
        Ok(session.filter(|s| &s.socket_id == socket_id))
    }

    async fn visitor_socket_in_store(
        &self,
        visitor_id: &VisitorId,
        socket_id: &SocketId,
    ) -> StoreResult<Option<VisitorSession>> {
        let mut previous_socket = None;
        let updated = self
            .update_json(&keys::visitor(visitor_id), Some(VISITOR_TTL), |current: Option<VisitorSession>| {
                let mut session = current?;
                previous_socket = Some(session.socket_id.clone());
                session.socket_id = socket_id.clone();
                Some(session)
            })
            .await?;
        if updated.is_some() {
            if let Some(previous) = previous_socket.filter(|previous| previous != socket_id) {
                self.store
                    .delete_if_equals(&keys::visitor_socket(&previous), visitor_id.as_str())
                    .await?;
            }
            self.store
                .set(&keys::visitor_socket(socket_id), visitor_id.as_str(), Some(VISITOR_TTL))
                .await?;
        }
        Ok(updated)
    }

    async fn visitor_page_in_store(
        &self,
        visitor_id: &VisitorId,
        page_url: &str,
        matched_pool_id: &Option<PoolId>,
    ) -> StoreResult<Option<VisitorSession>> {
        self.update_json(&keys::visitor(visitor_id), Some(VISITOR_TTL), |current: Option<VisitorSession>| {
            let mut session = current?;
            session.page_url = page_url.to_string();
            session.matched_pool_id = matched_pool_id.clone();
            Some(session)
        })
        .await
    }

    async fn remove_visitor_in_store(&self, visitor_id: &VisitorId) -> StoreResult<Option<VisitorSession>> {
        let key = keys::visitor(visitor_id);
        let session: Option<VisitorSession> = self.read_json(&key).await?;
        self.store.delete(&key).await?;
        if let Some(session) = &session {
            self.store
                .delete_if_equals(&keys::visitor_socket(&session.socket_id), visitor_id.as_str())
                .await?;
            self.store
                .set_remove(&keys::waiting_visitors(&session.org_id), visitor_id.as_str())
                .await?;
            if let Some(agent_id) = &session.assigned_agent_id {
                self.detach_in_store(agent_id, visitor_id).await?;
            }
        }
        self.store
            .set_remove(&keys::visitor_index(), visitor_id.as_str())
            .await?;
        Ok(session)
    }

    /// Take a visitor off an agent's viewer list
    async fn detach_in_store(&self, agent_id: &AgentId, visitor_id: &VisitorId) -> StoreResult<()> {
        let updated = self
            .update_json(&keys::agent(agent_id), None, |current: Option<AgentState>| {
                let mut agent = current?;
                let before = agent.simulations.len();
                agent.simulations.retain(|id| id != visitor_id);
                (agent.simulations.len() != before).then_some(agent)
            })
            .await?;
        if let Some(agent) = updated {
            self.mirror.mirror_agent(agent);
        }
        Ok(())
    }

    async fn assign_in_store(
        &self,
        visitor_id: &VisitorId,
        agent_id: &AgentId,
    ) -> StoreResult<Option<GreetingAssignment>> {
        let seq = self.mirror.next_idle_seq();
        let agent = self
            .update_json(&keys::agent(agent_id), None, |current: Option<AgentState>| {
                let mut agent = current?;
                if !agent.simulations.contains(visitor_id) {
                    agent.simulations.push(visitor_id.clone());
                }
                agent.last_assigned_seq = seq;
                Some(agent)
            })
            .await?;
        let Some(agent) = agent else {
            return Ok(None);
        };

        let mut previous = None;
        let visitor = self
            .update_json(&keys::visitor(visitor_id), Some(VISITOR_TTL), |current: Option<VisitorSession>| {
                let mut session = current?;
                previous = session.assigned_agent_id.replace(agent_id.clone());
                Some(session)
            })
            .await?;
        let Some(visitor) = visitor else {
            // Visitor left in the meantime
            self.detach_in_store(agent_id, visitor_id).await?;
            return Ok(None);
        };

        let previous_agent_id = previous.filter(|previous| previous != agent_id);
        if let Some(previous) = &previous_agent_id {
            self.detach_in_store(previous, visitor_id).await?;
        }
        self.store
            .set_remove(&keys::waiting_visitors(&visitor.org_id), visitor_id.as_str())
            .await?;
        Ok(Some(GreetingAssignment {
            visitor,
            agent,
            previous_agent_id,
        }))
    }

    async fn unassign_in_store(&self, visitor_id: &VisitorId) -> StoreResult<Option<(VisitorSession, AgentId)>> {
        let mut previous = None;
        let updated = self
            .update_json(&keys::visitor(visitor_id), Some(VISITOR_TTL), |current: Option<VisitorSession>| {
                let mut session = current?;
                previous = session.assigned_agent_id.take();
                previous.as_ref().map(|_| session)
            })
            .await?;
        let (Some(session), Some(agent_id)) = (updated, previous) else {
            return Ok(None);
        };
        self.detach_in_store(&agent_id, visitor_id).await?;
        self.store
            .set_add(
                &keys::waiting_visitors(&session.org_id),
                visitor_id.as_str(),
                Some(VISITOR_TTL),
            )
            .await?;
        Ok(Some((session, agent_id)))
    }

    async fn waiting_in_store(&self, org_id: &OrgId) -> StoreResult<Vec<VisitorSession>> {
        let key = keys::waiting_visitors(org_id);
        let mut waiting = Vec::new();
        for visitor_id in self.store.set_members(&key).await? {
            match self
                .read_json::<VisitorSession>(&keys::visitor(&VisitorId::from(visitor_id.as_str())))
                .await?
            {
                Some(session) if session.assigned_agent_id.is_none() => waiting.push(session),
                Some(_) => {}
                None => {
                    self.store.set_remove(&key, &visitor_id).await?;
                }
            }
        }
        waiting.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.visitor_id.as_str().cmp(b.visitor_id.as_str()))
        });
        Ok(waiting)
    }

    async fn stats_in_store(&self) -> StoreResult<PresenceStats> {
        let agents = self.all_in_store().await?;
        let visitors = self.store.set_len(&keys::visitor_index()).await?;
        Ok(count_stats(agents.iter(), visitors as usize))
    }
}

#[async_trait]
impl PresenceStore for DistributedPresenceStore {
    fn is_distributed(&self) -> bool {
        true
    }

    async fn register_agent(&self, agent_id: &AgentId, socket_id: &SocketId, profile: AgentProfile) -> AgentState {
        match self.register_in_store(agent_id, socket_id, &profile).await {
            Ok(registered) => {
                info!(
                    "👤 Agent registered: {} ({}) as {}",
                    registered.profile.display_name, agent_id, registered.status
                );
                self.mirror
                    .mirror_memberships(agent_id, registered.pool_memberships.clone());
                self.mirror.mirror_agent(registered.clone());
                registered
            }
            Err(e) => {
                self.degraded("register_agent", &e);
                self.mirror.register_agent(agent_id, socket_id, profile).await
            }
        }
    }

    async fn get_agent(&self, agent_id: &AgentId) -> Option<AgentState> {
        match self.read_json::<AgentState>(&keys::agent(agent_id)).await {
            Ok(Some(agent)) => {
                self.mirror.mirror_agent(agent.clone());
                Some(agent)
            }
            Ok(None) => {
                self.mirror.mirror_agent_removed(agent_id);
                None
            }
            Err(e) => {
                self.degraded("get_agent", &e);
                self.mirror.get_agent(agent_id).await
            }
        }
    }

    async fn get_agent_by_socket(&self, socket_id: &SocketId) -> Option<AgentState> {
        match self.agent_by_socket_in_store(socket_id).await {
            Ok(found) => found,
            Err(e) => {
                self.degraded("get_agent_by_socket", &e);
                self.mirror.get_agent_by_socket(socket_id).await
            }
        }
    }

    async fn set_agent_status(&self, agent_id: &AgentId, status: AgentStatus) -> Option<StatusChange> {
        match self.status_in_store(agent_id, status).await {
            Ok(Some((agent, change))) => {
                debug!("Agent {} status {} -> {}", agent_id, change.previous, change.current);
                self.mirror.mirror_agent(agent);
                Some(change)
            }
            Ok(None) => None,
            Err(e) => {
                self.degraded("set_agent_status", &e);
                self.mirror.set_agent_status(agent_id, status).await
            }
        }
    }

    async fn set_pool_memberships(&self, agent_id: &AgentId, memberships: Vec<PoolMembership>) {
        let memberships = dedup_memberships(memberships);
        match self.memberships_in_store(agent_id, &memberships).await {
            Ok(()) => {
                info!(
                    "🏊 Agent {} pool memberships updated: {} pool(s)",
                    agent_id,
                    memberships.len()
                );
                self.mirror.mirror_memberships(agent_id, memberships);
            }
            Err(e) => {
                self.degraded("set_pool_memberships", &e);
                self.mirror.set_pool_memberships(agent_id, memberships).await;
            }
        }
    }

    async fn pool_members(&self, pool_id: &PoolId) -> Vec<AgentState> {
        match self.members_in_store(pool_id).await {
            Ok(members) => members,
            Err(e) => {
                self.degraded("pool_members", &e);
                self.mirror.pool_members(pool_id).await
            }
        }
    }

    async fn available_agents(&self, pool_id: &PoolId) -> Vec<AgentState> {
        match self.available_in_store(pool_id).await {
            Ok(candidates) => candidates,
            Err(e) => {
                self.degraded("available_agents", &e);
                self.mirror.available_agents(pool_id).await
            }
        }
    }

    async fn try_claim_agent(&self, agent_id: &AgentId, call_id: &CallId, ttl: Duration) -> bool {
        match self
            .store
            .set_if_absent(&keys::agent_claim(agent_id), call_id.as_str(), Some(ttl))
            .await
        {
            Ok(true) => {
                self.mirror.mirror_claim(agent_id, call_id, ttl);
                true
            }
            Ok(false) => false,
            Err(e) => {
                self.degraded("try_claim_agent", &e);
                self.mirror.try_claim_agent(agent_id, call_id, ttl).await
            }
        }
    }

    async fn extend_agent_claim(&self, agent_id: &AgentId, call_id: &CallId, ttl: Duration) -> bool {
        match self
            .store
            .compare_and_set(
                &keys::agent_claim(agent_id),
                Some(call_id.as_str()),
                call_id.as_str(),
                Some(ttl),
            )
            .await
        {
            Ok(extended) => {
                if extended {
                    self.mirror.mirror_claim(agent_id, call_id, ttl);
                }
                extended
            }
            Err(e) => {
                self.degraded("extend_agent_claim", &e);
                self.mirror.extend_agent_claim(agent_id, call_id, ttl).await
            }
        }
    }

    async fn release_agent_claim(&self, agent_id: &AgentId, call_id: &CallId) {
        if let Err(e) = self
            .store
            .delete_if_equals(&keys::agent_claim(agent_id), call_id.as_str())
            .await
        {
            self.degraded("release_agent_claim", &e);
        }
        self.mirror.mirror_claim_released(agent_id, call_id);
    }

    async fn agent_claim(&self, agent_id: &AgentId) -> Option<CallId> {
        match self.store.get(&keys::agent_claim(agent_id)).await {
            Ok(claim) => claim.map(CallId::from),
            Err(e) => {
                self.degraded("agent_claim", &e);
                self.mirror.agent_claim(agent_id).await
            }
        }
    }

    async fn disconnect_agent(&self, agent_id: &AgentId) -> Option<AgentState> {
        match self.disconnect_in_store(agent_id).await {
            Ok(Some(agent)) => {
                info!("🔌 Agent {} disconnected, holding record for {:?}", agent_id, self.mirror.grace_period());
                self.mirror.mirror_agent(agent.clone());
                self.mirror.mirror_claim_cleared(agent_id);
                Some(agent)
            }
            Ok(None) => None,
            Err(e) => {
                self.degraded("disconnect_agent", &e);
                self.mirror.disconnect_agent(agent_id).await
            }
        }
    }

    async fn unregister_agent(&self, agent_id: &AgentId) -> Option<AgentState> {
        match self.unregister_in_store(agent_id).await {
            Ok(removed) => {
                if removed.is_some() {
                    info!("👋 Agent unregistered: {}", agent_id);
                }
                self.mirror.mirror_agent_removed(agent_id);
                removed
            }
            Err(e) => {
                self.degraded("unregister_agent", &e);
                self.mirror.unregister_agent(agent_id).await
            }
        }
    }

    async fn purge_disconnected(&self, grace: Duration) -> Vec<AgentId> {
        match self.purge_in_store(grace).await {
            Ok(purged) => {
                for agent_id in &purged {
                    self.mirror.mirror_agent_removed(agent_id);
                }
                purged
            }
            Err(e) => {
                self.degraded("purge_disconnected", &e);
                self.mirror.purge_disconnected(grace).await
            }
        }
    }

    async fn all_agents(&self) -> Vec<AgentState> {
        match self.all_in_store().await {
            Ok(agents) => agents,
            Err(e) => {
                self.degraded("all_agents", &e);
                self.mirror.all_agents().await
            }
        }
    }

    async fn register_visitor(&self, session: VisitorSession) {
        if let Err(e) = self.register_visitor_in_store(&session).await {
            self.degraded("register_visitor", &e);
        }
        self.mirror.mirror_visitor(session);
    }

    async fn get_visitor(&self, visitor_id: &VisitorId) -> Option<VisitorSession> {
        match self.read_json::<VisitorSession>(&keys::visitor(visitor_id)).await {
            Ok(session) => session,
            Err(e) => {
                self.degraded("get_visitor", &e);
                self.mirror.get_visitor(visitor_id).await
            }
        }
    }

    async fn get_visitor_by_socket(&self, socket_id: &SocketId) -> Option<VisitorSession> {
        match self.visitor_by_socket_in_store(socket_id).await {
            Ok(session) => session,
            Err(e) => {
                self.degraded("get_visitor_by_socket", &e);
                self.mirror.get_visitor_by_socket(socket_id).await
            }
        }
    }

    async fn update_visitor_socket(&self, visitor_id: &VisitorId, socket_id: &SocketId) -> bool {
        match self.visitor_socket_in_store(visitor_id, socket_id).await {
            Ok(Some(session)) => {
                self.mirror.mirror_visitor(session);
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.degraded("update_visitor_socket", &e);
                self.mirror.update_visitor_socket(visitor_id, socket_id).await
            }
        }
    }

    async fn update_visitor_page(&self, visitor_id: &VisitorId, page_url: &str, matched_pool_id: Option<PoolId>) -> bool {
        match self
            .visitor_page_in_store(visitor_id, page_url, &matched_pool_id)
            .await
        {
            Ok(Some(session)) => {
                self.mirror.mirror_visitor(session);
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.degraded("update_visitor_page", &e);
                self.mirror
                    .update_visitor_page(visitor_id, page_url, matched_pool_id)
                    .await
            }
        }
    }

    async fn remove_visitor(&self, visitor_id: &VisitorId) -> Option<VisitorSession> {
        match self.remove_visitor_in_store(visitor_id).await {
            Ok(session) => {
                self.mirror.mirror_visitor_removed(visitor_id);
                session
            }
            Err(e) => {
                self.degraded("remove_visitor", &e);
                self.mirror.remove_visitor(visitor_id).await
            }
        }
    }

    async fn assign_visitor(&self, visitor_id: &VisitorId, agent_id: &AgentId) -> Option<GreetingAssignment> {
        match self.assign_in_store(visitor_id, agent_id).await {
            Ok(Some(assignment)) => {
                debug!(
                    "Visitor {} now greeted by {} ({} viewer(s))",
                    visitor_id,
                    agent_id,
                    assignment.agent.simulations.len()
                );
                self.mirror.mirror_agent(assignment.agent.clone());
                self.mirror.mirror_visitor(assignment.visitor.clone());
                Some(assignment)
            }
            Ok(None) => None,
            Err(e) => {
                self.degraded("assign_visitor", &e);
                self.mirror.assign_visitor(visitor_id, agent_id).await
            }
        }
    }

    async fn unassign_visitor(&self, visitor_id: &VisitorId) -> Option<AgentId> {
        match self.unassign_in_store(visitor_id).await {
            Ok(Some((session, agent_id))) => {
                self.mirror.mirror_visitor(session);
                Some(agent_id)
            }
            Ok(None) => None,
            Err(e) => {
                self.degraded("unassign_visitor", &e);
                self.mirror.unassign_visitor(visitor_id).await
            }
        }
    }

    async fn unassigned_visitors(&self, org_id: &OrgId) -> Vec<VisitorSession> {
        match self.waiting_in_store(org_id).await {
            Ok(waiting) => waiting,
            Err(e) => {
                self.degraded("unassigned_visitors", &e);
                self.mirror.unassigned_visitors(org_id).await
            }
        }
    }

    async fn stats(&self) -> PresenceStats {
        match self.stats_in_store().await {
            Ok(stats) => stats,
            Err(e) => {
                self.degraded("stats", &e);
                self.mirror.stats().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greetnow_infra_common::MemoryStore;
    use pretty_assertions::assert_eq;

    struct Cluster {
        store: Arc<MemoryStore>,
        a: DistributedPresenceStore,
        b: DistributedPresenceStore,
    }

    /// Two router processes sharing one store
    fn cluster() -> Cluster {
        let store = Arc::new(MemoryStore::new());
        Cluster {
            a: DistributedPresenceStore::new(store.clone()),
            b: DistributedPresenceStore::new(store.clone()),
            store,
        }
    }

    async fn login(presence: &DistributedPresenceStore, id: &str, pools: &[&str]) -> AgentState {
        let agent_id = AgentId::from(id);
        presence
            .set_pool_memberships(
                &agent_id,
                PoolMembership::from_ordered(pools.iter().map(|p| PoolId::from(*p))),
            )
            .await;
        presence
            .register_agent(
                &agent_id,
                &SocketId::from(format!("sock-{}", id)),
                AgentProfile::new(id, "acme", id.to_uppercase()),
            )
            .await
    }

    #[tokio::test]
    async fn agents_are_visible_across_processes() {
        let cluster = cluster();
        login(&cluster.a, "alice", &["sales"]).await;

        let seen = cluster.b.get_agent(&AgentId::from("alice")).await.unwrap();
        assert_eq!(seen.status, AgentStatus::Idle);
        let by_socket = cluster.b.get_agent_by_socket(&SocketId::from("sock-alice")).await.unwrap();
        assert_eq!(by_socket.agent_id, AgentId::from("alice"));

        cluster.b.set_agent_status(&AgentId::from("alice"), AgentStatus::Away).await;
        assert_eq!(
            cluster.a.get_agent(&AgentId::from("alice")).await.unwrap().status,
            AgentStatus::Away
        );
    }

    #[tokio::test]
    async fn a_claim_blocks_every_process() {
        let cluster = cluster();
        login(&cluster.a, "alice", &["sales"]).await;
        let alice = AgentId::from("alice");
        let ttl = Duration::from_secs(30);

        assert!(cluster.a.try_claim_agent(&alice, &CallId::from("c1"), ttl).await);
        assert!(!cluster.b.try_claim_agent(&alice, &CallId::from("c2"), ttl).await);
        assert!(cluster.b.find_available_agent(&PoolId::from("sales"), &[]).await.is_none());

        assert!(cluster.a.extend_agent_claim(&alice, &CallId::from("c1"), ttl).await);
        assert!(!cluster.b.extend_agent_claim(&alice, &CallId::from("c2"), ttl).await);
        cluster.b.release_agent_claim(&alice, &CallId::from("c1")).await;
        assert_eq!(cluster.a.agent_claim(&alice).await, None);
    }

    #[tokio::test]
    async fn selection_orders_by_rank_then_idle_time() {
        let cluster = cluster();
        login(&cluster.a, "alice", &["support", "sales"]).await;
        login(&cluster.b, "bob", &["sales"]).await;
        login(&cluster.a, "carol", &["sales"]).await;

        let order: Vec<AgentId> = cluster
            .b
            .available_agents(&PoolId::from("sales"))
            .await
            .into_iter()
            .map(|a| a.agent_id)
            .collect();
        assert_eq!(
            order,
            vec![AgentId::from("bob"), AgentId::from("carol"), AgentId::from("alice")]
        );
    }

    #[tokio::test]
    async fn membership_changes_update_pool_indexes() {
        let cluster = cluster();
        login(&cluster.a, "alice", &["sales", "support"]).await;
        cluster
            .b
            .set_pool_memberships(&AgentId::from("alice"), vec![PoolMembership::new("support", 1)])
            .await;

        assert!(cluster.a.pool_members(&PoolId::from("sales")).await.is_empty());
        let support = cluster.a.pool_members(&PoolId::from("support")).await;
        assert_eq!(support.len(), 1);
        assert_eq!(support[0].pool_memberships, vec![PoolMembership::new("support", 1)]);
    }

    #[tokio::test]
    async fn outage_falls_back_to_the_mirror() {
        let cluster = cluster();
        login(&cluster.a, "alice", &["sales"]).await;
        cluster.store.set_available(false);

        // Still answers from what this process last wrote
        let alice = cluster.a.get_agent(&AgentId::from("alice")).await.unwrap();
        assert_eq!(alice.status, AgentStatus::Idle);
        assert!(cluster
            .a
            .try_claim_agent(&alice.agent_id, &CallId::from("c1"), Duration::from_secs(30))
            .await);
        assert!(cluster.a.set_agent_status(&alice.agent_id, AgentStatus::InCall).await.is_some());

        // The other process never saw alice
        assert!(cluster.b.get_agent(&AgentId::from("alice")).await.is_none());
    }

    #[tokio::test]
    async fn disconnect_and_purge_clean_the_store() {
        let cluster = cluster();
        login(&cluster.a, "alice", &["sales"]).await;
        login(&cluster.a, "bob", &["sales"]).await;
        let alice = AgentId::from("alice");

        let dropped = cluster.b.disconnect_agent(&alice).await.unwrap();
        assert!(!dropped.is_connected());
        assert!(cluster.a.get_agent_by_socket(&SocketId::from("sock-alice")).await.is_none());

        let purged = cluster.b.purge_disconnected(Duration::ZERO).await;
        assert_eq!(purged, vec![alice.clone()]);
        assert!(cluster.a.get_agent(&alice).await.is_none());
        assert_eq!(cluster.a.stats().await.total_agents, 1);
    }

    #[tokio::test]
    async fn visitors_move_between_sockets() {
        let cluster = cluster();
        let visitor = VisitorId::from("v1");
        cluster
            .a
            .register_visitor(VisitorSession {
                visitor_id: visitor.clone(),
                org_id: "acme".into(),
                socket_id: SocketId::from("s1"),
                page_url: "https://acme.com/".to_string(),
                matched_pool_id: Some(PoolId::from("sales")),
                location: None,
                connected_at: Utc::now(),
                assigned_agent_id: None,
            })
            .await;

        assert!(cluster.b.update_visitor_socket(&visitor, &SocketId::from("s2")).await);
        assert!(cluster.a.get_visitor_by_socket(&SocketId::from("s1")).await.is_none());
        assert_eq!(
            cluster.a.get_visitor_by_socket(&SocketId::from("s2")).await.unwrap().visitor_id,
            visitor
        );
        assert_eq!(cluster.a.stats().await.total_visitors, 1);

        assert!(cluster.b.remove_visitor(&visitor).await.is_some());
        assert!(cluster.a.get_visitor(&visitor).await.is_none());
        assert_eq!(cluster.a.stats().await.total_visitors, 0);
    }

    async fn arrive(presence: &DistributedPresenceStore, id: &str) -> VisitorId {
        let visitor_id = VisitorId::from(id);
        presence
            .register_visitor(VisitorSession {
                visitor_id: visitor_id.clone(),
                org_id: "acme".into(),
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
    async fn greetings_are_balanced_across_processes() {
        let cluster = cluster();
        login(&cluster.a, "alice", &["sales"]).await;
        login(&cluster.b, "bob", &["sales"]).await;
        let org = OrgId::from("acme");
        let sales = PoolId::from("sales");

        let first = arrive(&cluster.a, "v1").await;
        let greeter = cluster.a.find_greeting_agent(&org, Some(&sales), None).await.unwrap();
        cluster.a.assign_visitor(&first, &greeter.agent_id).await.unwrap();

        // The other process sees the load and picks the other agent
        let second = arrive(&cluster.b, "v2").await;
        let next = cluster.b.find_greeting_agent(&org, Some(&sales), None).await.unwrap();
        assert_ne!(next.agent_id, greeter.agent_id);
        cluster.b.assign_visitor(&second, &next.agent_id).await.unwrap();

        let stats = cluster.a.stats().await;
        assert_eq!(stats.total_visitors, 2);
        assert_eq!(stats.in_simulation_agents, 2);
        assert_eq!(
            cluster.b.get_visitor(&first).await.unwrap().assigned_agent_id,
            Some(greeter.agent_id.clone())
        );
    }

    #[tokio::test]
    async fn waiting_visitors_are_shared() {
        let cluster = cluster();
        login(&cluster.a, "alice", &["sales"]).await;
        let org = OrgId::from("acme");
        let alice = AgentId::from("alice");
        let first = arrive(&cluster.a, "v1").await;
        let second = arrive(&cluster.a, "v2").await;
        assert_eq!(cluster.b.unassigned_visitors(&org).await.len(), 2);

        cluster.a.assign_visitor(&first, &alice).await.unwrap();
        cluster.a.assign_visitor(&second, &alice).await.unwrap();
        assert!(cluster.b.unassigned_visitors(&org).await.is_empty());

        assert_eq!(cluster.b.unassign_visitor(&first).await, Some(alice.clone()));
        let waiting = cluster.a.unassigned_visitors(&org).await;
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].visitor_id, first);
        assert_eq!(cluster.a.get_agent(&alice).await.unwrap().simulations, vec![second.clone()]);

        cluster.b.remove_visitor(&second).await;
        assert!(cluster.a.get_agent(&alice).await.unwrap().simulations.is_empty());
        assert_eq!(cluster.a.stats().await.total_visitors, 1);
    }
}
