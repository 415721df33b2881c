use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::{CallSettings, CountryPolicy, OrgDirectory, SubscriptionStatus};
use crate::types::OrgId;

/// How long each kind of answer is reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtls {
    pub subscription_secs: u64,
    /// Failed subscription lookups are retried sooner
    pub subscription_failure_secs: u64,
    pub call_settings_secs: u64,
    pub country_policy_secs: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            subscription_secs: 30,
            subscription_failure_secs: 5,
            call_settings_secs: 300,
            country_policy_secs: 300,
        }
    }
}

/// Caching facade over an [`OrgDirectory`]
///
/// Answers are infallible: lookup failures degrade to permissive defaults
/// (active subscription, default call settings, no country restriction) and
/// are logged.
pub struct CachedOrgDirectory {
    inner: Arc<dyn OrgDirectory>,
    subscriptions: Cache<OrgId, SubscriptionStatus>,
    subscription_failures: Cache<OrgId, SubscriptionStatus>,
    settings: Cache<OrgId, CallSettings>,
    policies: Cache<OrgId, CountryPolicy>,
}

impl CachedOrgDirectory {
    pub fn new(inner: Arc<dyn OrgDirectory>, ttls: CacheTtls) -> Self {
        let build = |secs: u64| Duration::from_secs(secs.max(1));
        Self {
            inner,
            subscriptions: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(build(ttls.subscription_secs))
                .build(),
            subscription_failures: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(build(ttls.subscription_failure_secs))
                .build(),
            settings: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(build(ttls.call_settings_secs))
                .build(),
            policies: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(build(ttls.country_policy_secs))
                .build(),
        }
    }

    pub async fn subscription_status(&self, org_id: &OrgId) -> SubscriptionStatus {
        if let Some(status) = self.subscriptions.get(org_id).await {
            return status;
        }
        if let Some(status) = self.subscription_failures.get(org_id).await {
            return status;
        }
        match self.inner.subscription_status(org_id).await {
            Ok(status) => {
                self.subscriptions.insert(org_id.clone(), status).await;
                status
            }
            Err(e) => {
                warn!("⚠️ Subscription lookup for {} failed, assuming active: {}", org_id, e);
                self.subscription_failures
                    .insert(org_id.clone(), SubscriptionStatus::Active)
                    .await;
                SubscriptionStatus::Active
            }
        }
    }

    pub async fn is_org_active(&self, org_id: &OrgId) -> bool {
        self.subscription_status(org_id).await.allows_availability()
    }

    pub async fn is_org_paused(&self, org_id: &OrgId) -> bool {
        self.subscription_status(org_id).await.is_paused()
    }

    pub async fn call_settings(&self, org_id: &OrgId) -> CallSettings {
        if let Some(settings) = self.settings.get(org_id).await {
            return settings;
        }
        match self.inner.call_settings(org_id).await {
            Ok(settings) => {
                self.settings.insert(org_id.clone(), settings).await;
                settings
            }
            Err(e) => {
                warn!("⚠️ Call settings lookup for {} failed, using defaults: {}", org_id, e);
                CallSettings::default()
            }
        }
    }

    pub async fn country_policy(&self, org_id: &OrgId) -> CountryPolicy {
        if let Some(policy) = self.policies.get(org_id).await {
            return policy;
        }
        match self.inner.country_policy(org_id).await {
            Ok(policy) => {
                self.policies.insert(org_id.clone(), policy.clone()).await;
                policy
            }
            Err(e) => {
                warn!("⚠️ Country policy lookup for {} failed, allowing all: {}", org_id, e);
                CountryPolicy::default()
            }
        }
    }

    /// Whether a visitor from `country_code` may request calls
    pub async fn is_country_allowed(&self, org_id: &OrgId, country_code: Option<&str>) -> bool {
        if country_code.is_none() {
            return true;
        }
        self.country_policy(org_id).await.allows(country_code)
    }

    /// Forget everything cached for `org_id` (dashboard changed its settings)
    pub async fn invalidate(&self, org_id: &OrgId) {
        self.subscriptions.invalidate(org_id).await;
        self.subscription_failures.invalidate(org_id).await;
        self.settings.invalidate(org_id).await;
        self.policies.invalidate(org_id).await;
    }
}

impl std::fmt::Debug for CachedOrgDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedOrgDirectory")
            .field("subscriptions", &self.subscriptions.entry_count())
            .field("settings", &self.settings.entry_count())
            .field("policies", &self.policies.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::CollaboratorError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDirectory {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl OrgDirectory for CountingDirectory {
        async fn subscription_status(&self, _org_id: &OrgId) -> Result<SubscriptionStatus, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CollaboratorError::Lookup("database down".to_string()))
            } else {
                Ok(SubscriptionStatus::PastDue)
            }
        }

        async fn call_settings(&self, _org_id: &OrgId) -> Result<CallSettings, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CollaboratorError::Lookup("database down".to_string()))
            } else {
                Ok(CallSettings {
                    rna_timeout_seconds: 30,
                    ..Default::default()
                })
            }
        }

        async fn country_policy(&self, _org_id: &OrgId) -> Result<CountryPolicy, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CountryPolicy::blocklist(["CN"]))
        }
    }

    #[tokio::test]
    async fn repeated_lookups_hit_the_cache() {
        let inner = Arc::new(CountingDirectory::default());
        let cached = CachedOrgDirectory::new(inner.clone(), CacheTtls::default());
        let org = OrgId::from("acme");

        for _ in 0..5 {
            assert_eq!(cached.subscription_status(&org).await, SubscriptionStatus::PastDue);
            assert_eq!(cached.call_settings(&org).await.rna_timeout_seconds, 30);
        }
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert!(!cached.is_org_active(&org).await);
    }

    #[tokio::test]
    async fn failures_degrade_to_defaults() {
        let inner = Arc::new(CountingDirectory {
            fail: true,
            ..Default::default()
        });
        let cached = CachedOrgDirectory::new(inner, CacheTtls::default());
        let org = OrgId::from("acme");

        assert_eq!(cached.subscription_status(&org).await, SubscriptionStatus::Active);
        assert_eq!(cached.call_settings(&org).await, CallSettings::default());
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_lookup() {
        let inner = Arc::new(CountingDirectory::default());
        let cached = CachedOrgDirectory::new(inner.clone(), CacheTtls::default());
        let org = OrgId::from("acme");

        assert!(!cached.is_country_allowed(&org, Some("cn")).await);
        cached.invalidate(&org).await;
        assert!(cached.is_country_allowed(&org, Some("US")).await);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert!(cached.is_country_allowed(&org, None).await);
    }
}
