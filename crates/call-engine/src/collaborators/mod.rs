//! # External Collaborators
//!
//! The engine consults a handful of systems it does not own. Each is a trait
//! so deployments can plug in their own backends and tests can stub them.
//!
//! | Trait | Used for | Default |
//! |-------|----------|---------|
//! | [`OrgDirectory`] | subscription status, call settings, country policy | [`StaticOrgDirectory`] |
//! | [`ActivitySink`] | status-change tracking, embed verification marker | [`NoopActivitySink`] |
//! | [`IdentityVerifier`] | agent login token validation | [`JwtIdentityVerifier`] |
//!
//! Lookups on the hot path go through [`CachedOrgDirectory`], which keeps
//! answers for a short TTL so a burst of call requests costs one lookup.
//! Activity calls are dispatched in the background and their failures only
//! logged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

use crate::types::{AgentId, AgentProfile, OrgId, StatusChange};

pub mod cache;
pub mod identity;
pub mod static_directory;

pub use cache::{CacheTtls, CachedOrgDirectory};
pub use identity::{AgentClaims, JwtIdentityVerifier};
pub use static_directory::{NoopActivitySink, StaticOrgDirectory};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("lookup failed: {0}")]
    Lookup(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Billing state of an organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Cancelled,
    Paused,
}

impl SubscriptionStatus {
    /// Agents may only go available while the org is paying or trialing
    pub fn allows_availability(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, SubscriptionStatus::Paused)
    }
}

/// Per-organization call behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSettings {
    pub rna_timeout_seconds: u64,
    pub max_call_duration_minutes: u64,
    pub is_recording_enabled: bool,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            rna_timeout_seconds: 15,
            max_call_duration_minutes: 120,
            is_recording_enabled: false,
        }
    }
}

impl CallSettings {
    pub fn rna_timeout(&self) -> Duration {
        Duration::from_secs(self.rna_timeout_seconds)
    }

    pub fn max_call_duration(&self) -> Duration {
        Duration::from_secs(self.max_call_duration_minutes * 60)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountryListMode {
    /// Listed countries are refused
    #[default]
    Blocklist,
    /// Only listed countries are served
    Allowlist,
}

/// Which visitor countries may request calls
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryPolicy {
    pub mode: CountryListMode,
    pub countries: HashSet<String>,
}

impl CountryPolicy {
    pub fn blocklist<I, S>(countries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            mode: CountryListMode::Blocklist,
            countries: countries.into_iter().map(|c| c.as_ref().to_uppercase()).collect(),
        }
    }

    pub fn allowlist<I, S>(countries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            mode: CountryListMode::Allowlist,
            countries: countries.into_iter().map(|c| c.as_ref().to_uppercase()).collect(),
        }
    }

    /// Unknown countries are always allowed; geolocation is best-effort.
    pub fn allows(&self, country_code: Option<&str>) -> bool {
        let Some(code) = country_code.filter(|c| !c.is_empty()) else {
            return true;
        };
        let listed = self.countries.contains(&code.to_uppercase());
        match self.mode {
            CountryListMode::Blocklist => !listed,
            CountryListMode::Allowlist => self.countries.is_empty() || listed,
        }
    }
}

/// Organization facts the router needs but does not own
#[async_trait]
pub trait OrgDirectory: Send + Sync {
    async fn subscription_status(&self, org_id: &OrgId) -> Result<SubscriptionStatus, CollaboratorError>;

    async fn call_settings(&self, org_id: &OrgId) -> Result<CallSettings, CollaboratorError>;

    async fn country_policy(&self, org_id: &OrgId) -> Result<CountryPolicy, CollaboratorError>;
}

/// Background side effects; failures are logged and never affect routing
#[async_trait]
pub trait ActivitySink: Send + Sync {
    async fn record_status_change(&self, change: &StatusChange) -> Result<(), CollaboratorError>;

    /// Write-once marker that an org's widget was seen live on a page
    async fn mark_embed_verified(&self, org_id: &OrgId, page_url: &str) -> Result<(), CollaboratorError>;
}

/// Why a login token was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthRejection {
    #[error("token is malformed or has a bad signature")]
    InvalidToken,
    #[error("token has expired")]
    Expired,
    #[error("token was issued for a different agent")]
    AgentMismatch,
}

/// Validates agent login tokens issued by the dashboard
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify_agent(&self, agent_id: &AgentId, token: &str) -> Result<AgentProfile, AuthRejection>;
}
