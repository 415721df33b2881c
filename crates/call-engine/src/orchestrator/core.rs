use dashmap::{DashMap, DashSet};
use greetnow_infra_common::SharedStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use super::call::{ActiveCall, CallStats};
use super::registry::{CallRegistry, EndedCall};
use crate::collaborators::{
    ActivitySink, CacheTtls, CachedOrgDirectory, NoopActivitySink, OrgDirectory, StaticOrgDirectory,
};
use crate::config::CallsConfig;
use crate::error::{CallEngineError, Result};
use crate::lifecycle::{ReconnectHost, ReconnectionWindowManager};
use crate::notify::{AgentEvent, Notifier, VisitorEvent};
use crate::presence::{DistributedPresenceStore, LocalPresenceStore, PresenceStore};
use crate::routing::{OrgConfig, OrgConfigRegistry, PoolMatch, RuleMatcher};
use crate::timer::ScheduledTask;
use crate::types::{AgentId, AgentState, CallId, OrgId, PresenceStats, VisitorId, VisitorSession};

/// Routes calls to agents and drives each call through its lifecycle
///
/// Construct with [`PoolManagerBuilder`]; the manager is always handed out
/// as an `Arc` because its timers hold weak references back to it.
pub struct PoolManager {
    pub(super) weak_self: Weak<PoolManager>,
    pub(super) config: CallsConfig,
    pub(super) presence: Arc<dyn PresenceStore>,
    pub(super) org_configs: OrgConfigRegistry,
    pub(super) calls: Mutex<CallRegistry>,
    pub(super) rna_timers: DashMap<CallId, ScheduledTask>,
    pub(super) duration_timers: DashMap<CallId, ScheduledTask>,
    pub(super) reconnects: ReconnectionWindowManager,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) directory: CachedOrgDirectory,
    pub(super) activity: Arc<dyn ActivitySink>,
    /// Orgs whose embed marker this process already wrote
    pub(super) verified_embeds: DashSet<OrgId>,
}

/// Snapshot for `/stats`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub presence: PresenceStats,
    pub calls: CallStats,
    pub reconnect_windows: usize,
    pub org_configs: usize,
    pub distributed: bool,
}

impl PoolManager {
    pub fn calls_config(&self) -> &CallsConfig {
        &self.config
    }

    pub fn presence(&self) -> &Arc<dyn PresenceStore> {
        &self.presence
    }

    pub fn directory(&self) -> &CachedOrgDirectory {
        &self.directory
    }

    pub fn reconnect_windows(&self) -> &ReconnectionWindowManager {
        &self.reconnects
    }

    // ---------------------------------------------------------------
    // Org routing configuration
    // ---------------------------------------------------------------

    /// Replace an organization's routing rules wholesale
    pub async fn set_org_config(&self, config: OrgConfig) -> Arc<OrgConfig> {
        let org_id = config.org_id.clone();
        let stored = self.org_configs.replace(config).await;
        self.directory.invalidate(&org_id).await;
        stored
    }

    pub async fn org_config(&self, org_id: &OrgId) -> Option<Arc<OrgConfig>> {
        self.org_configs.get(org_id).await
    }

    /// Pool for a page, with the rule that decided it. Orgs without a
    /// config are unrouted.
    pub async fn resolve_pool(&self, org_id: &OrgId, page_url: &str) -> PoolMatch {
        match self.org_configs.get(org_id).await {
            Some(config) => RuleMatcher::explain(&config, page_url),
            None => {
                debug!("No routing config for org {}", org_id);
                PoolMatch {
                    pool_id: None,
                    rule_id: None,
                    used_default: true,
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Lookups
    // ---------------------------------------------------------------

    pub async fn get_agent(&self, agent_id: &AgentId) -> Option<AgentState> {
        self.presence.get_agent(agent_id).await
    }

    pub async fn get_visitor(&self, visitor_id: &VisitorId) -> Option<VisitorSession> {
        self.presence.get_visitor(visitor_id).await
    }

    /// Visitors of `org_id` with no greeting agent, longest waiting first
    pub async fn unassigned_visitors(&self, org_id: &OrgId) -> Vec<VisitorSession> {
        self.presence.unassigned_visitors(org_id).await
    }

    pub fn get_call(&self, call_id: &CallId) -> Option<ActiveCall> {
        self.calls.lock().get(call_id).cloned()
    }

    /// Participants of a call that left the arena recently
    pub(crate) fn recently_ended(&self, call_id: &CallId) -> Option<EndedCall> {
        self.calls.lock().recently_ended(call_id).cloned()
    }

    pub fn get_active_call_by_visitor_id(&self, visitor_id: &VisitorId) -> Option<ActiveCall> {
        self.calls.lock().by_visitor(visitor_id).cloned()
    }

    pub fn get_active_call_by_agent_id(&self, agent_id: &AgentId) -> Option<ActiveCall> {
        self.calls.lock().by_agent(agent_id).cloned()
    }

    pub fn call_stats(&self) -> CallStats {
        self.calls.lock().stats()
    }

    pub async fn stats(&self) -> ManagerStats {
        let calls = self.call_stats();
        ManagerStats {
            presence: self.presence.stats().await,
            calls,
            reconnect_windows: self.reconnects.len(),
            org_configs: self.org_configs.len(),
            distributed: self.presence.is_distributed(),
        }
    }

    /// Cancel every timer this process owns. Calls stay in the registry.
    pub fn shutdown(&self) {
        let windows = self.reconnects.clear_all();
        let rna = self.rna_timers.len();
        let durations = self.duration_timers.len();
        self.rna_timers.clear();
        self.duration_timers.clear();
        info!(
            "🛑 Pool manager stopped: {} reconnect window(s), {} ring timer(s), {} duration timer(s) cancelled",
            windows, rna, durations
        );
    }

    // ---------------------------------------------------------------
    // Outbound helpers
    // ---------------------------------------------------------------

    /// Send to the agent's current socket; dropped if the agent is gone
    pub(super) async fn notify_agent(&self, agent_id: &AgentId, event: AgentEvent) {
        match self.presence.get_agent(agent_id).await {
            Some(agent) if agent.is_connected() => self.notifier.notify_agent(agent_id, &agent.socket_id, event),
            _ => debug!("Agent {} is not connected; dropping notification", agent_id),
        }
    }

    /// Send to the visitor's current socket; dropped if the visitor is gone
    pub(super) async fn notify_visitor(&self, visitor_id: &VisitorId, event: VisitorEvent) {
        match self.presence.get_visitor(visitor_id).await {
            Some(session) => self.notifier.notify_visitor(visitor_id, &session.socket_id, event),
            None => debug!("Visitor {} is not connected; dropping notification", visitor_id),
        }
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("calls", &self.calls.lock().len())
            .field("presence", &self.presence)
            .field("reconnects", &self.reconnects)
            .finish_non_exhaustive()
    }
}

/// Builder for [`PoolManager`]
///
/// Only the notifier is required. Without a presence store one is chosen
/// from the shared store: distributed when a store is given, local
/// otherwise.
pub struct PoolManagerBuilder {
    config: CallsConfig,
    cache_ttls: CacheTtls,
    presence: Option<Arc<dyn PresenceStore>>,
    store: Option<Arc<dyn SharedStore>>,
    notifier: Option<Arc<dyn Notifier>>,
    directory: Option<Arc<dyn OrgDirectory>>,
    activity: Option<Arc<dyn ActivitySink>>,
}

impl PoolManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: CallsConfig::default(),
            cache_ttls: CacheTtls::default(),
            presence: None,
            store: None,
            notifier: None,
            directory: None,
            activity: None,
        }
    }

    pub fn with_config(mut self, config: CallsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cache_ttls(mut self, ttls: CacheTtls) -> Self {
        self.cache_ttls = ttls;
        self
    }

    pub fn with_presence(mut self, presence: Arc<dyn PresenceStore>) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Share org configs (and, unless a presence store is set, presence)
    /// with other processes through `store`
    pub fn with_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn OrgDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_activity_sink(mut self, activity: Arc<dyn ActivitySink>) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn build(self) -> Result<Arc<PoolManager>> {
        let notifier = self
            .notifier
            .ok_or_else(|| CallEngineError::configuration("PoolManager needs a notifier"))?;

        let grace = self.config.agent_grace();
        let presence: Arc<dyn PresenceStore> = match (self.presence, &self.store) {
            (Some(presence), _) => presence,
            (None, Some(store)) => Arc::new(DistributedPresenceStore::with_grace_period(store.clone(), grace)),
            (None, None) => Arc::new(LocalPresenceStore::with_grace_period(grace)),
        };
        let directory: Arc<dyn OrgDirectory> = self.directory.unwrap_or_else(|| {
            Arc::new(StaticOrgDirectory::new().with_default_settings(self.config.default_call_settings()))
        });
        let activity: Arc<dyn ActivitySink> = self.activity.unwrap_or_else(|| Arc::new(NoopActivitySink));
        let org_configs = OrgConfigRegistry::new(self.store.clone());
        let config = self.config;
        let cache_ttls = self.cache_ttls;

        let manager = Arc::new_cyclic(|weak: &Weak<PoolManager>| {
            let host: Weak<dyn ReconnectHost> = weak.clone();
            PoolManager {
                weak_self: weak.clone(),
                config,
                presence,
                org_configs,
                calls: Mutex::new(CallRegistry::default()),
                rna_timers: DashMap::new(),
                duration_timers: DashMap::new(),
                reconnects: ReconnectionWindowManager::new(host, config.reconnect_window()),
                notifier,
                directory: CachedOrgDirectory::new(directory, cache_ttls),
                activity,
                verified_embeds: DashSet::new(),
            }
        });

        info!(
            "🎛️ Pool manager ready ({} presence, {}s reconnect window)",
            if manager.presence.is_distributed() { "distributed" } else { "local" },
            config.reconnect_window_secs
        );
        Ok(manager)
    }
}

impl Default for PoolManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
