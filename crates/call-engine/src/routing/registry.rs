use dashmap::DashMap;
use greetnow_infra_common::SharedStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::rules::OrgConfig;
use crate::keys;
use crate::types::OrgId;

/// Holds each organization's routing configuration
///
/// Configs are replaced wholesale. With a shared store attached, writes are
/// mirrored to it and reads prefer it so every process routes with the same
/// rules; the local copy answers while the store is unreachable.
#[derive(Debug, Clone)]
pub struct OrgConfigRegistry {
    local: Arc<DashMap<OrgId, Arc<OrgConfig>>>,
    store: Option<Arc<dyn SharedStore>>,
}

impl OrgConfigRegistry {
    pub fn new(store: Option<Arc<dyn SharedStore>>) -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            store,
        }
    }

    pub fn local_only() -> Self {
        Self::new(None)
    }

    pub async fn replace(&self, config: OrgConfig) -> Arc<OrgConfig> {
        let config = Arc::new(config);
        self.local.insert(config.org_id.clone(), config.clone());

        if let Some(store) = &self.store {
            match serde_json::to_string(config.as_ref()) {
                Ok(json) => {
                    if let Err(e) = store.set(&keys::org_config(&config.org_id), &json, None).await {
                        warn!("⚠️ Org config for {} kept local only: {}", config.org_id, e);
                    }
                }
                Err(e) => warn!("⚠️ Could not encode org config for {}: {}", config.org_id, e),
            }
        }

        info!(
            "🗺️ Org config updated: {} with {} rule(s), default pool {:?}",
            config.org_id,
            config.path_rules.len(),
            config.default_pool_id
        );
        config
    }

    pub async fn get(&self, org_id: &OrgId) -> Option<Arc<OrgConfig>> {
        if let Some(store) = self.store.as_ref().filter(|s| s.is_connected()) {
            match store.get(&keys::org_config(org_id)).await {
                Ok(Some(json)) => match serde_json::from_str::<OrgConfig>(&json) {
                    Ok(config) => {
                        let config = Arc::new(config);
                        self.local.insert(org_id.clone(), config.clone());
                        return Some(config);
                    }
                    Err(e) => warn!("⚠️ Stored org config for {} is unreadable: {}", org_id, e),
                },
                Ok(None) => debug!("No shared org config for {}", org_id),
                Err(e) => warn!("⚠️ Falling back to local org config for {}: {}", org_id, e),
            }
        }
        self.local.get(org_id).map(|c| c.value().clone())
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PoolId;
    use greetnow_infra_common::MemoryStore;

    #[tokio::test]
    async fn replace_is_wholesale() {
        let registry = OrgConfigRegistry::local_only();
        registry
            .replace(OrgConfig::new("acme", Some(PoolId::from("general"))))
            .await;
        registry.replace(OrgConfig::new("acme", None)).await;

        let config = registry.get(&OrgId::from("acme")).await.unwrap();
        assert_eq!(config.default_pool_id, None);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn configs_are_visible_to_other_processes() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let writer = OrgConfigRegistry::new(Some(store.clone()));
        let reader = OrgConfigRegistry::new(Some(store));

        writer
            .replace(OrgConfig::new("acme", Some(PoolId::from("sales"))))
            .await;
        let seen = reader.get(&OrgId::from("acme")).await.unwrap();
        assert_eq!(seen.default_pool_id, Some(PoolId::from("sales")));
    }

    #[tokio::test]
    async fn local_copy_serves_during_outage() {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn SharedStore> = memory.clone();
        let registry = OrgConfigRegistry::new(Some(store));
        registry.replace(OrgConfig::new("acme", None)).await;

        memory.set_available(false);
        assert!(registry.get(&OrgId::from("acme")).await.is_some());
    }
}
