//! Shared-store key layout
//!
//! Every process must agree on these names, so they live in one place.

use crate::types::{AgentId, OrgId, PoolId, SocketId, VisitorId};

pub fn rate_limit(event: &str, identifier: &str) -> String {
    format!("rl:{}:{}", event, identifier)
}

pub fn agent(agent_id: &AgentId) -> String {
    format!("agents:{}", agent_id)
}

/// Set of every known agent id
pub fn agent_index() -> String {
    "agents:all".to_string()
}

pub fn agent_socket(socket_id: &SocketId) -> String {
    format!("agents:socket:{}", socket_id)
}

/// Holds the id of the call an agent is reserved for
pub fn agent_claim(agent_id: &AgentId) -> String {
    format!("agents:{}:claim", agent_id)
}

/// Ordered pool memberships of an agent, kept even while it is offline
pub fn agent_pools(agent_id: &AgentId) -> String {
    format!("agents:{}:pools", agent_id)
}

pub fn visitor(visitor_id: &VisitorId) -> String {
    format!("visitors:{}", visitor_id)
}

/// Set of every connected visitor id
pub fn visitor_index() -> String {
    "visitors:all".to_string()
}

pub fn visitor_socket(socket_id: &SocketId) -> String {
    format!("visitors:socket:{}", socket_id)
}

/// Set of agent ids belonging to a pool
pub fn pool_agents(pool_id: &PoolId) -> String {
    format!("pool:{}:agents", pool_id)
}

/// Set of an org's visitors waiting for a greeting agent
pub fn waiting_visitors(org_id: &OrgId) -> String {
    format!("org:{}:visitors:waiting", org_id)
}

pub fn org_config(org_id: &OrgId) -> String {
    format!("org:{}:config", org_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_shared_layout() {
        assert_eq!(rate_limit("call:request", "v1"), "rl:call:request:v1");
        assert_eq!(agent(&AgentId::from("a1")), "agents:a1");
        assert_eq!(agent_claim(&AgentId::from("a1")), "agents:a1:claim");
        assert_eq!(agent_pools(&AgentId::from("a1")), "agents:a1:pools");
        assert_eq!(pool_agents(&PoolId::from("sales")), "pool:sales:agents");
        assert_eq!(org_config(&OrgId::from("acme")), "org:acme:config");
        assert_eq!(waiting_visitors(&OrgId::from("acme")), "org:acme:visitors:waiting");
    }
}
