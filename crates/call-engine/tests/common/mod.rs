//! Shared fixtures for the call-engine integration suites

#![allow(dead_code)]

use greetnow_call_engine::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

pub const ORG: &str = "acme";
pub const SALES: &str = "sales";
pub const PRICING: &str = "pricing";
pub const HOME_URL: &str = "https://acme.test/";
pub const PRICING_URL: &str = "https://acme.test/pricing?plan=team";

/// A pool manager wired to an in-memory directory and a channel notifier
pub struct Harness {
    pub manager: Arc<PoolManager>,
    pub directory: Arc<StaticOrgDirectory>,
    pub outbound: UnboundedReceiver<OutboundMessage>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_store(None).await
    }

    pub async fn with_store(store: Option<Arc<dyn SharedStore>>) -> Self {
        let directory = Arc::new(StaticOrgDirectory::new());
        let (notifier, outbound) = ChannelNotifier::new();
        let mut builder = PoolManagerBuilder::new()
            .with_notifier(Arc::new(notifier))
            .with_directory(directory.clone());
        if let Some(store) = store {
            builder = builder.with_store(store);
        }
        let manager = builder.build().expect("manager builds");
        manager.set_org_config(acme_routing()).await;
        Self {
            manager,
            directory,
            outbound,
        }
    }

    /// Log in an idle agent of the test org with pools in priority order
    pub async fn agent(&self, id: &str, pools: &[&str]) -> (AgentId, SocketId) {
        let agent_id = AgentId::from(id);
        let socket_id = SocketId::from(format!("sock-{}", id));
        let pools = pools.iter().map(|p| PoolId::from(*p)).collect::<Vec<_>>();
        self.manager
            .set_agent_pool_memberships(&agent_id, PoolMembership::from_ordered(pools))
            .await;
        self.manager
            .register_agent(&agent_id, &socket_id, AgentProfile::new(id, ORG, id.to_uppercase()))
            .await;
        (agent_id, socket_id)
    }

    /// Connect a visitor of the test org on `page_url`
    pub async fn visitor(&self, id: &str, page_url: &str) -> (VisitorId, SocketId) {
        let visitor_id = VisitorId::from(id);
        let socket_id = SocketId::from(format!("sock-{}", id));
        self.manager
            .register_visitor(&visitor_id, &OrgId::from(ORG), &socket_id, page_url, None)
            .await;
        (visitor_id, socket_id)
    }

    /// Everything sent since the last drain
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        drain(&mut self.outbound)
    }
}

pub fn drain(outbound: &mut UnboundedReceiver<OutboundMessage>) -> Vec<OutboundMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = outbound.try_recv() {
        messages.push(message);
    }
    messages
}

/// `sales` by default, `pricing` for any page under /pricing
pub fn acme_routing() -> OrgConfig {
    OrgConfig::new(ORG, Some(PoolId::from(SALES))).with_rule(
        PathRule::new("pricing-pages", PRICING, 10).with_condition(RuleCondition {
            condition_type: ConditionType::Path,
            match_type: MatchType::StartsWith,
            value: "/pricing".to_string(),
            param_name: None,
        }),
    )
}

pub fn agent_events<'a>(messages: &'a [OutboundMessage], agent: &AgentId) -> Vec<&'a AgentEvent> {
    messages
        .iter()
        .filter_map(|m| match m {
            OutboundMessage::Agent { agent_id, event, .. } if agent_id == agent => Some(event),
            _ => None,
        })
        .collect()
}

pub fn visitor_events<'a>(messages: &'a [OutboundMessage], visitor: &VisitorId) -> Vec<&'a VisitorEvent> {
    messages
        .iter()
        .filter_map(|m| match m {
            OutboundMessage::Visitor { visitor_id, event, .. } if visitor_id == visitor => Some(event),
            _ => None,
        })
        .collect()
}

/// Let spawned bookkeeping tasks run
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
