//! # Router Server
//!
//! [`CallEngineServer`] wires the engine together for one router process
//! and runs the pieces that are not driven by inbound events:
//!
//! - the admin sync HTTP surface (axum)
//! - a maintenance loop that purges agents whose reconnect grace expired
//!   and drops closed local rate-limit windows
//!
//! ## HTTP Surface
//!
//! | Method | Path | Body / query | Purpose |
//! |--------|------|--------------|---------|
//! | `POST` | `/config/org` | `{orgId, defaultPoolId, pathRules[]}` | replace an org's routing rules |
//! | `POST` | `/config/agent-pools` | `{agentId, poolIds[]}` or `{agentId, memberships[]}` | replace an agent's pools |
//! | `GET` | `/test-match` | `?orgId=&url=` | show which pool and rule a URL resolves to |
//! | `GET` | `/health` | | liveness and store connectivity |
//! | `GET` | `/stats` | | presence and call counts |
//!
//! When `general.admin_token` is set, the `/config/*` and `/test-match`
//! routes require `Authorization: Bearer <token>`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use greetnow_call_engine::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<()> {
//! let mut config = CallEngineConfig::default();
//! config.auth.jwt_secret = Some("dashboard-shared-secret".to_string());
//!
//! let (notifier, mut outbound) = ChannelNotifier::new();
//! tokio::spawn(async move {
//!     while let Some(message) = outbound.recv().await {
//!         // hand `message` to the WebSocket layer
//!         let _ = message;
//!     }
//! });
//!
//! let mut server = CallEngineServerBuilder::new()
//!     .with_config(config)
//!     .with_notifier(Arc::new(notifier))
//!     .build()?;
//! let addr = server.start().await?;
//! println!("admin sync listening on {}", addr);
//! # Ok(())
//! # }
//! ```

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use greetnow_infra_common::SharedStore;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::collaborators::{ActivitySink, IdentityVerifier, JwtIdentityVerifier, OrgDirectory};
use crate::config::CallEngineConfig;
use crate::error::{CallEngineError, Result};
use crate::gateway::EventGateway;
use crate::notify::Notifier;
use crate::orchestrator::{PoolManager, PoolManagerBuilder};
use crate::rate_limit::RateLimiter;
use crate::routing::OrgConfig;
use crate::types::{dedup_memberships, AgentId, OrgId, PoolId, PoolMembership};

/// One router process: pool manager, gateway, admin HTTP and maintenance
pub struct CallEngineServer {
    config: CallEngineConfig,
    manager: Arc<PoolManager>,
    limiter: Arc<RateLimiter>,
    gateway: Arc<EventGateway>,
    store: Option<Arc<dyn SharedStore>>,
    started_at: DateTime<Utc>,
    http_handle: Option<JoinHandle<()>>,
    maintenance_handle: Option<JoinHandle<()>>,
}

/// State shared by the HTTP handlers
#[derive(Clone)]
struct AppState {
    manager: Arc<PoolManager>,
    store: Option<Arc<dyn SharedStore>>,
    admin_token: Option<Arc<str>>,
    instance_id: Arc<str>,
    started_at: DateTime<Utc>,
}

impl CallEngineServer {
    pub fn config(&self) -> &CallEngineConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<PoolManager> {
        &self.manager
    }

    /// Entry point for the transport dispatcher
    pub fn gateway(&self) -> &Arc<EventGateway> {
        &self.gateway
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Bind the admin HTTP listener and start background loops. Returns the
    /// bound address (useful with port 0).
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(&self.config.general.bind_addr)
            .await
            .map_err(|e| CallEngineError::Server(format!("bind {}: {}", self.config.general.bind_addr, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| CallEngineError::Server(e.to_string()))?;

        let app = self.router();
        self.http_handle = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("🚨 Admin HTTP server stopped: {}", e);
            }
        }));
        info!("🌐 Admin sync HTTP listening on {}", addr);

        let manager = self.manager.clone();
        let limiter = self.limiter.clone();
        let every = Duration::from_secs(self.config.general.maintenance_interval_secs);
        self.maintenance_handle = Some(tokio::spawn(async move {
            Self::maintenance_loop(manager, limiter, every).await;
        }));
        info!("✅ Router {} started", self.config.general.instance_id);

        Ok(addr)
    }

    /// Stop background work and cancel every timer
    pub async fn stop(&mut self) -> Result<()> {
        info!("🛑 Stopping router {}...", self.config.general.instance_id);

        if let Some(handle) = self.maintenance_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(handle) = self.http_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.manager.shutdown();

        info!("✅ Router stopped");
        Ok(())
    }

    async fn maintenance_loop(manager: Arc<PoolManager>, limiter: Arc<RateLimiter>, every: Duration) {
        debug!("Maintenance loop running every {:?}", every);
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            manager.purge_disconnected_agents().await;
            let dropped = limiter.cleanup_expired();
            if dropped > 0 {
                debug!("Dropped {} closed rate-limit window(s)", dropped);
            }
            let stats = manager.call_stats();
            if stats.total() > 0 {
                info!(
                    "📊 Calls: {} pending, {} ringing, {} accepted, {} active, {} reconnecting",
                    stats.pending, stats.ringing, stats.accepted, stats.active, stats.waiting_for_reconnection
                );
            }
        }
    }

    /// The admin HTTP application, without binding a listener
    pub fn router(&self) -> Router {
        let state = AppState {
            manager: self.manager.clone(),
            store: self.store.clone(),
            admin_token: self.config.general.admin_token.as_deref().map(Arc::from),
            instance_id: Arc::from(self.config.general.instance_id.as_str()),
            started_at: self.started_at,
        };

        Router::new()
            .route("/config/org", post(replace_org_config))
            .route("/config/agent-pools", post(replace_agent_pools))
            .route("/test-match", get(test_match))
            .route("/health", get(health))
            .route("/stats", get(stats))
            .layer(cors_layer(&self.config.general.allowed_origins))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    if allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("⚠️ Ignoring invalid allowed origin {:?}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

// ---------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------

/// Error body for the admin API
enum ApiError {
    Unauthorized,
    BadRequest(String),
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "missing or invalid admin token".to_string()),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
        };
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> std::result::Result<(), ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if presented == Some(expected) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

async fn replace_org_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(config): Json<OrgConfig>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    if config.org_id.as_str().is_empty() {
        return Err(ApiError::BadRequest("orgId is required".to_string()));
    }
    if let Some(rule) = config.path_rules.iter().find(|r| r.id.is_empty()) {
        return Err(ApiError::BadRequest(format!(
            "every path rule needs an id (pool {})",
            rule.pool_id
        )));
    }

    let stored = state.manager.set_org_config(config).await;
    Ok(Json(json!({
        "success": true,
        "orgId": stored.org_id,
        "rules": stored.path_rules.len(),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentPoolsBody {
    agent_id: AgentId,
    #[serde(default)]
    pool_ids: Option<Vec<PoolId>>,
    #[serde(default)]
    memberships: Option<Vec<PoolMembership>>,
}

async fn replace_agent_pools(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AgentPoolsBody>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let memberships = match (body.memberships, body.pool_ids) {
        (Some(memberships), _) => memberships,
        (None, Some(pool_ids)) => PoolMembership::from_ordered(pool_ids),
        (None, None) => {
            return Err(ApiError::BadRequest("poolIds or memberships is required".to_string()));
        }
    };
    let memberships = dedup_memberships(memberships);
    let count = memberships.len();
    state
        .manager
        .set_agent_pool_memberships(&body.agent_id, memberships)
        .await;
    Ok(Json(json!({
        "success": true,
        "agentId": body.agent_id,
        "pools": count,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestMatchQuery {
    org_id: OrgId,
    url: String,
}

async fn test_match(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TestMatchQuery>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    if state.manager.org_config(&query.org_id).await.is_none() {
        return Err(ApiError::NotFound(format!("no routing config for org {}", query.org_id)));
    }
    let matched = state.manager.resolve_pool(&query.org_id, &query.url).await;
    Ok(Json(json!({
        "orgId": query.org_id,
        "url": query.url,
        "match": matched,
    })))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store_connected = state.store.as_ref().map(|s| s.is_connected());
    Json(json!({
        "status": "ok",
        "instanceId": &*state.instance_id,
        "distributed": state.manager.presence().is_distributed(),
        "storeConnected": store_connected,
    }))
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.manager.stats().await;
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(json!({
        "instanceId": &*state.instance_id,
        "uptimeSeconds": uptime_seconds,
        "stats": stats,
    }))
}

// ---------------------------------------------------------------
// Builder
// ---------------------------------------------------------------

/// Builder for [`CallEngineServer`]
///
/// A notifier is required. Agent login tokens are verified with
/// `auth.jwt_secret` unless a verifier is supplied.
pub struct CallEngineServerBuilder {
    config: Option<CallEngineConfig>,
    store: Option<Arc<dyn SharedStore>>,
    notifier: Option<Arc<dyn Notifier>>,
    directory: Option<Arc<dyn OrgDirectory>>,
    activity: Option<Arc<dyn ActivitySink>>,
    identity: Option<Arc<dyn IdentityVerifier>>,
}

impl CallEngineServerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            store: None,
            notifier: None,
            directory: None,
            activity: None,
            identity: None,
        }
    }

    pub fn with_config(mut self, config: CallEngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Coordinate with other router processes through `store`
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

    pub fn with_identity_verifier(mut self, identity: Arc<dyn IdentityVerifier>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn build(self) -> Result<CallEngineServer> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let notifier = self
            .notifier
            .ok_or_else(|| CallEngineError::configuration("a notifier is required"))?;
        let identity: Arc<dyn IdentityVerifier> = match (self.identity, &config.auth.jwt_secret) {
            (Some(identity), _) => identity,
            (None, Some(secret)) => Arc::new(JwtIdentityVerifier::new(secret.as_bytes())),
            (None, None) => {
                return Err(CallEngineError::configuration(
                    "auth.jwt_secret (or JWT_SECRET) is required to verify agent logins",
                ))
            }
        };

        let mut manager = PoolManagerBuilder::new()
            .with_config(config.calls)
            .with_cache_ttls(config.cache)
            .with_notifier(notifier);
        if let Some(store) = &self.store {
            manager = manager.with_store(store.clone());
        }
        if let Some(directory) = self.directory {
            manager = manager.with_directory(directory);
        }
        if let Some(activity) = self.activity {
            manager = manager.with_activity_sink(activity);
        }
        let manager = manager.build()?;

        let limiter = Arc::new(if config.rate_limits.enabled {
            RateLimiter::new(config.rate_limits.overrides.clone(), self.store.clone())
        } else {
            warn!("⚠️ Rate limiting is disabled");
            RateLimiter::disabled()
        });
        let gateway = Arc::new(EventGateway::new(manager.clone(), limiter.clone(), identity));

        Ok(CallEngineServer {
            config,
            manager,
            limiter,
            gateway,
            store: self.store,
            started_at: Utc::now(),
            http_handle: None,
            maintenance_handle: None,
        })
    }
}

impl Default for CallEngineServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
