use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{ActivitySink, CallSettings, CollaboratorError, CountryPolicy, OrgDirectory, SubscriptionStatus};
use crate::types::{OrgId, StatusChange};

/// In-memory [`OrgDirectory`]
///
/// Orgs without an explicit entry are active, use default call settings and
/// block no countries. Used by single-binary deployments and tests.
#[derive(Debug, Default)]
pub struct StaticOrgDirectory {
    subscriptions: DashMap<OrgId, SubscriptionStatus>,
    settings: DashMap<OrgId, CallSettings>,
    policies: DashMap<OrgId, CountryPolicy>,
    default_settings: CallSettings,
}

impl StaticOrgDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings for orgs without an explicit entry
    pub fn with_default_settings(mut self, settings: CallSettings) -> Self {
        self.default_settings = settings;
        self
    }

    pub fn set_subscription(&self, org_id: impl Into<OrgId>, status: SubscriptionStatus) {
        self.subscriptions.insert(org_id.into(), status);
    }

    pub fn set_call_settings(&self, org_id: impl Into<OrgId>, settings: CallSettings) {
        self.settings.insert(org_id.into(), settings);
    }

    pub fn set_country_policy(&self, org_id: impl Into<OrgId>, policy: CountryPolicy) {
        self.policies.insert(org_id.into(), policy);
    }
}

#[async_trait]
impl OrgDirectory for StaticOrgDirectory {
    async fn subscription_status(&self, org_id: &OrgId) -> Result<SubscriptionStatus, CollaboratorError> {
        Ok(self
            .subscriptions
            .get(org_id)
            .map(|s| *s.value())
            .unwrap_or(SubscriptionStatus::Active))
    }

    async fn call_settings(&self, org_id: &OrgId) -> Result<CallSettings, CollaboratorError> {
        Ok(self
            .settings
            .get(org_id)
            .map(|s| *s.value())
            .unwrap_or(self.default_settings))
    }

    async fn country_policy(&self, org_id: &OrgId) -> Result<CountryPolicy, CollaboratorError> {
        Ok(self.policies.get(org_id).map(|p| p.value().clone()).unwrap_or_default())
    }
}

/// [`ActivitySink`] that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopActivitySink;

#[async_trait]
impl ActivitySink for NoopActivitySink {
    async fn record_status_change(&self, change: &StatusChange) -> Result<(), CollaboratorError> {
        debug!(
            "Agent {} status {} -> {}",
            change.agent_id, change.previous, change.current
        );
        Ok(())
    }

    async fn mark_embed_verified(&self, org_id: &OrgId, page_url: &str) -> Result<(), CollaboratorError> {
        debug!("Embed verified for {} on {}", org_id, page_url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_orgs_get_permissive_defaults() {
        let directory = StaticOrgDirectory::new();
        let org = OrgId::from("acme");
        assert_eq!(directory.subscription_status(&org).await.unwrap(), SubscriptionStatus::Active);
        assert_eq!(directory.call_settings(&org).await.unwrap(), CallSettings::default());
        assert!(directory.country_policy(&org).await.unwrap().allows(Some("CN")));
    }

    #[tokio::test]
    async fn explicit_entries_win() {
        let directory = StaticOrgDirectory::new();
        directory.set_subscription("acme", SubscriptionStatus::Paused);
        directory.set_country_policy("acme", CountryPolicy::blocklist(["CN"]));
        let org = OrgId::from("acme");
        assert_eq!(directory.subscription_status(&org).await.unwrap(), SubscriptionStatus::Paused);
        assert!(!directory.country_policy(&org).await.unwrap().allows(Some("cn")));
    }

    #[tokio::test]
    async fn default_settings_apply_to_unknown_orgs() {
        let fallback = CallSettings {
            rna_timeout_seconds: 20,
            ..Default::default()
        };
        let directory = StaticOrgDirectory::new().with_default_settings(fallback);
        directory.set_call_settings("beta", CallSettings::default());
        assert_eq!(directory.call_settings(&OrgId::from("acme")).await.unwrap(), fallback);
        assert_eq!(
            directory.call_settings(&OrgId::from("beta")).await.unwrap(),
            CallSettings::default()
        );
    }
}
