//! Router configuration
//!
//! Read once at process start. Sources, later ones winning:
//!
//! 1. built-in defaults
//! 2. an optional TOML file (`--config`)
//! 3. `GREETNOW__SECTION__KEY` environment variables
//! 4. the deployment-level variables `REDIS_URL`, `ALLOWED_ORIGINS` and
//!    `JWT_SECRET`
//!
//! ```toml
//! [general]
//! bind_addr = "0.0.0.0:3100"
//! allowed_origins = ["https://app.greetnow.com"]
//!
//! [calls]
//! reconnect_window_secs = 60
//!
//! [store.redis]
//! url = "redis://cache.internal:6379"
//!
//! [rate_limits.overrides."call:request"]
//! max_requests = 3
//! window_secs = 60
//! ```

use config::{Config, Environment, File};
use greetnow_infra_common::logging::LoggingConfig;
use greetnow_infra_common::RedisStoreConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::collaborators::{CacheTtls, CallSettings};
use crate::error::{CallEngineError, Result};
use crate::rate_limit::RateLimitRule;

/// Main configuration for the router
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallEngineConfig {
    pub general: GeneralConfig,
    pub calls: CallsConfig,
    pub store: StoreConfig,
    pub rate_limits: RateLimitConfig,
    pub cache: CacheTtls,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

/// Process-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Admin sync HTTP listen address
    pub bind_addr: String,
    /// Origins allowed to call the HTTP surface; empty allows any
    pub allowed_origins: Vec<String>,
    /// Bearer token required on `/config/*` when set
    pub admin_token: Option<String>,
    /// How often stale presence and rate-limit windows are swept
    pub maintenance_interval_secs: u64,
    /// Name of this process in logs and `/stats`
    pub instance_id: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3100".to_string(),
            allowed_origins: Vec::new(),
            admin_token: None,
            maintenance_interval_secs: 30,
            instance_id: format!("router-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
        }
    }
}

/// Call lifecycle timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallsConfig {
    /// Ring-no-answer timeout for orgs without their own setting
    pub default_rna_timeout_secs: u64,
    /// Max call length for orgs without their own setting
    pub default_max_call_duration_mins: u64,
    pub reconnect_window_secs: u64,
    /// How long a dropped agent keeps its status
    pub agent_grace_secs: u64,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            default_rna_timeout_secs: 15,
            default_max_call_duration_mins: 120,
            reconnect_window_secs: 60,
            agent_grace_secs: 10,
        }
    }
}

impl CallsConfig {
    pub fn reconnect_window(&self) -> Duration {
        Duration::from_secs(self.reconnect_window_secs)
    }

    pub fn agent_grace(&self) -> Duration {
        Duration::from_secs(self.agent_grace_secs)
    }

    pub fn default_call_settings(&self) -> CallSettings {
        CallSettings {
            rna_timeout_seconds: self.default_rna_timeout_secs,
            max_call_duration_minutes: self.default_max_call_duration_mins,
            ..CallSettings::default()
        }
    }
}

/// Shared store; absent means single-process mode
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub redis: Option<RedisStoreConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Per-event replacements for the built-in table
    pub overrides: HashMap<String, RateLimitRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret shared with the dashboard for agent login tokens
    pub jwt_secret: Option<String>,
}

impl CallEngineConfig {
    /// Load from defaults, an optional file and the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&CallEngineConfig::default())
            .map_err(|e| CallEngineError::configuration(format!("defaults: {}", e)))?;

        let mut builder = Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("GREETNOW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("general.allowed_origins"),
        );

        let mut config: CallEngineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| CallEngineError::configuration(e.to_string()))?;

        config.apply_deployment_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml(document: &str) -> Result<Self> {
        toml::from_str(document).map_err(|e| CallEngineError::configuration(e.to_string()))
    }

    /// Apply the unprefixed variables shared with the rest of the platform
    pub fn apply_deployment_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("REDIS_URL").filter(|u| !u.trim().is_empty()) {
            match self.store.redis.as_mut() {
                Some(redis) => redis.url = url,
                None => self.store.redis = Some(RedisStoreConfig::new(url)),
            }
        }
        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            self.general.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(secret) = lookup("JWT_SECRET").filter(|s| !s.is_empty()) {
            self.auth.jwt_secret = Some(secret);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.general
            .bind_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| CallEngineError::configuration(format!("general.bind_addr: {}", e)))?;

        if self.general.maintenance_interval_secs == 0 {
            return Err(CallEngineError::configuration(
                "general.maintenance_interval_secs must be positive",
            ));
        }
        if self.calls.default_rna_timeout_secs == 0 {
            return Err(CallEngineError::configuration(
                "calls.default_rna_timeout_secs must be positive",
            ));
        }
        if self.calls.reconnect_window_secs == 0 {
            return Err(CallEngineError::configuration(
                "calls.reconnect_window_secs must be positive",
            ));
        }
        if self.calls.default_max_call_duration_mins == 0 {
            return Err(CallEngineError::configuration(
                "calls.default_max_call_duration_mins must be positive",
            ));
        }

        if let Some(redis) = &self.store.redis {
            let parsed = url::Url::parse(&redis.url)
                .map_err(|e| CallEngineError::configuration(format!("store.redis.url: {}", e)))?;
            if !matches!(parsed.scheme(), "redis" | "rediss") {
                return Err(CallEngineError::configuration(format!(
                    "store.redis.url must use redis:// or rediss://, got {}://",
                    parsed.scheme()
                )));
            }
        }

        for (event, rule) in &self.rate_limits.overrides {
            if rule.max_requests == 0 || rule.window_secs == 0 {
                return Err(CallEngineError::configuration(format!(
                    "rate_limits.overrides.\"{}\" needs a positive max_requests and window_secs",
                    event
                )));
            }
        }
        Ok(())
    }
}
