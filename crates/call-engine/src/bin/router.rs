//! GreetNow router process
//!
//! Loads layered configuration, connects to the shared store when one is
//! configured, and serves the admin sync HTTP surface. Outbound events are
//! drained to the log; a deployment embeds [`CallEngineServer`] next to its
//! WebSocket layer and forwards them to sockets instead.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use greetnow_call_engine::notify::{ChannelNotifier, OutboundMessage};
use greetnow_call_engine::{CallEngineConfig, CallEngineServer, CallEngineServerBuilder};
use greetnow_infra_common::logging::{log_welcome, setup_logging};
use greetnow_infra_common::{RedisStore, SharedStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "GreetNow call router", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "GREETNOW_CONFIG")]
    config: Option<PathBuf>,

    /// Override the admin HTTP bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Override the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = CallEngineConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.general.bind_addr = bind;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.json_logs {
        config.logging.json = true;
    }
    config.validate().context("validating configuration")?;

    setup_logging(&config.logging).context("initializing logging")?;
    log_welcome("GreetNow Router", env!("CARGO_PKG_VERSION"));

    info!("⚙️  Router configuration:");
    info!("   Instance: {}", config.general.instance_id);
    info!("   Admin HTTP: {}", config.general.bind_addr);
    info!("   Ring timeout: {}s", config.calls.default_rna_timeout_secs);
    info!("   Reconnect window: {}s", config.calls.reconnect_window_secs);

    let store = connect_store(&config).await?;

    let (notifier, mut outbound) = ChannelNotifier::new();
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            log_outbound(&message);
        }
    });

    let mut builder = CallEngineServerBuilder::new()
        .with_config(config)
        .with_notifier(Arc::new(notifier));
    if let Some(store) = store {
        builder = builder.with_store(store);
    }
    let mut server: CallEngineServer = builder.build().context("building router")?;

    server.start().await.context("starting router")?;
    info!("🚀 Router ready");

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("📴 Shutdown requested");
    server.stop().await?;
    Ok(())
}

/// Redis when configured, otherwise single-process mode
async fn connect_store(config: &CallEngineConfig) -> anyhow::Result<Option<Arc<dyn SharedStore>>> {
    let Some(redis) = config.store.redis.clone() else {
        info!("💾 No shared store configured; running single-process");
        return Ok(None);
    };

    let store = RedisStore::new(redis).context("configuring Redis store")?;
    if let Err(e) = store.connect().await {
        // The store keeps retrying in the background
        warn!("⚠️ Redis not reachable yet: {}", e);
    } else {
        info!("💾 Connected to Redis");
    }
    Ok(Some(Arc::new(store)))
}

fn log_outbound(message: &OutboundMessage) {
    match message {
        OutboundMessage::Agent { agent_id, event, .. } => debug!("➡️ agent {}: {:?}", agent_id, event),
        OutboundMessage::Visitor { visitor_id, event, .. } => debug!("➡️ visitor {}: {:?}", visitor_id, event),
    }
}
