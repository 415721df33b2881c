//! Core identifiers and presence data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Agent identifier (stable across logins)
    AgentId
);
string_id!(
    /// Anonymous visitor identifier issued by the widget
    VisitorId
);
string_id!(
    /// Call identifier
    CallId
);
string_id!(PoolId);
string_id!(OrgId);
string_id!(
    /// Opaque reference to a live transport connection
    SocketId
);

impl CallId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Agent availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Offline,
    Idle,
    Away,
    InCall,
    InSimulation,
}

impl AgentStatus {
    /// Only idle agents are offered calls
    pub fn is_available(&self) -> bool {
        matches!(self, AgentStatus::Idle)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Offline => "offline",
            AgentStatus::Idle => "idle",
            AgentStatus::Away => "away",
            AgentStatus::InCall => "in_call",
            AgentStatus::InSimulation => "in_simulation",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offline" => Ok(AgentStatus::Offline),
            "idle" | "available" => Ok(AgentStatus::Idle),
            "away" => Ok(AgentStatus::Away),
            "in_call" => Ok(AgentStatus::InCall),
            "in_simulation" => Ok(AgentStatus::InSimulation),
            other => Err(format!("unknown agent status '{}'", other)),
        }
    }
}

/// Greeting viewers an agent takes unless their profile says otherwise
pub const DEFAULT_MAX_SIMULATIONS: u32 = 25;

fn default_max_simulations() -> u32 {
    DEFAULT_MAX_SIMULATIONS
}

/// What the visitor sees of an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: AgentId,
    pub org_id: OrgId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wave_video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intro_video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_video_url: Option<String>,
    /// How many visitors may watch this agent's greeting at once
    #[serde(default = "default_max_simulations")]
    pub max_simultaneous_simulations: u32,
}

impl AgentProfile {
    pub fn new(id: impl Into<AgentId>, org_id: impl Into<OrgId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            org_id: org_id.into(),
            display_name: display_name.into(),
            avatar_url: None,
            wave_video_url: None,
            intro_video_url: None,
            loop_video_url: None,
            connect_video_url: None,
            max_simultaneous_simulations: DEFAULT_MAX_SIMULATIONS,
        }
    }

    pub fn with_max_simulations(mut self, max: u32) -> Self {
        self.max_simultaneous_simulations = max;
        self
    }
}

/// An agent's membership in one pool. Lower rank is a higher tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMembership {
    pub pool_id: PoolId,
    pub priority_rank: u32,
}

impl PoolMembership {
    pub fn new(pool_id: impl Into<PoolId>, priority_rank: u32) -> Self {
        Self {
            pool_id: pool_id.into(),
            priority_rank,
        }
    }

    /// Memberships from an ordered pool list: first pool gets rank 1
    pub fn from_ordered(pool_ids: impl IntoIterator<Item = PoolId>) -> Vec<Self> {
        pool_ids
            .into_iter()
            .enumerate()
            .map(|(index, pool_id)| Self {
                pool_id,
                priority_rank: index as u32 + 1,
            })
            .collect()
    }
}

/// Drop repeated pool ids, keeping the first occurrence
pub fn dedup_memberships(memberships: Vec<PoolMembership>) -> Vec<PoolMembership> {
    let mut seen = std::collections::HashSet::new();
    memberships
        .into_iter()
        .filter(|m| seen.insert(m.pool_id.clone()))
        .collect()
}

/// Live presence record for a connected agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub agent_id: AgentId,
    pub socket_id: SocketId,
    pub status: AgentStatus,
    pub pool_memberships: Vec<PoolMembership>,
    pub profile: AgentProfile,
    pub connected_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
    /// Ordering key stamped when the agent becomes idle; smaller means idle longer
    pub idle_seq: u64,
    /// Set while the agent is inside the reconnect grace period
    #[serde(default)]
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub previous_status: Option<AgentStatus>,
    /// Visitors currently shown this agent's greeting
    #[serde(default)]
    pub simulations: Vec<VisitorId>,
    /// Stamped on every greeting assignment; smaller means longer ago
    #[serde(default)]
    pub last_assigned_seq: u64,
}

impl AgentState {
    pub fn is_connected(&self) -> bool {
        self.disconnected_at.is_none()
    }

    /// Status as shown to dashboards: an idle agent whose greeting is
    /// playing for someone reads as `in_simulation`.
    ///
    /// Call routing looks at [`AgentState::status`], so such an agent still
    /// takes calls.
    pub fn presence_status(&self) -> AgentStatus {
        if self.status == AgentStatus::Idle && !self.simulations.is_empty() {
            AgentStatus::InSimulation
        } else {
            self.status
        }
    }

    /// Connected, idle and below their greeting capacity
    pub fn can_greet(&self) -> bool {
        self.is_connected()
            && self.status == AgentStatus::Idle
            && (self.simulations.len() as u64) < u64::from(self.profile.max_simultaneous_simulations)
    }

    pub fn org_id(&self) -> &OrgId {
        &self.profile.org_id
    }

    /// Priority rank in `pool_id`, if a member
    pub fn rank_in(&self, pool_id: &PoolId) -> Option<u32> {
        self.pool_memberships
            .iter()
            .find(|m| &m.pool_id == pool_id)
            .map(|m| m.priority_rank)
    }

    pub fn pool_ids(&self) -> impl Iterator<Item = &PoolId> {
        self.pool_memberships.iter().map(|m| &m.pool_id)
    }
}

/// A committed status change, used for activity tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub agent_id: AgentId,
    pub org_id: OrgId,
    pub previous: AgentStatus,
    pub current: AgentStatus,
    pub changed_at: DateTime<Utc>,
}

/// Coarse visitor location supplied by the transport layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorLocation {
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

impl VisitorLocation {
    pub fn country(code: impl Into<String>) -> Self {
        Self {
            country_code: Some(code.into()),
            ..Default::default()
        }
    }
}

/// Presence record for a connected visitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorSession {
    pub visitor_id: VisitorId,
    pub org_id: OrgId,
    pub socket_id: SocketId,
    pub page_url: String,
    pub matched_pool_id: Option<PoolId>,
    #[serde(default)]
    pub location: Option<VisitorLocation>,
    pub connected_at: DateTime<Utc>,
    /// Agent whose greeting this visitor is shown
    #[serde(default)]
    pub assigned_agent_id: Option<AgentId>,
}

/// Result of pointing a visitor's greeting at an agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreetingAssignment {
    pub visitor: VisitorSession,
    pub agent: AgentState,
    /// Who showed the greeting before, if anyone else did
    pub previous_agent_id: Option<AgentId>,
}

/// Aggregate presence counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceStats {
    pub total_agents: usize,
    pub idle_agents: usize,
    pub in_call_agents: usize,
    pub away_agents: usize,
    /// Idle agents with greeting viewers; also counted as idle
    pub in_simulation_agents: usize,
    pub total_visitors: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_status_round_trips_through_strings() {
        for status in [
            AgentStatus::Offline,
            AgentStatus::Idle,
            AgentStatus::Away,
            AgentStatus::InCall,
            AgentStatus::InSimulation,
        ] {
            assert_eq!(status.to_string().parse::<AgentStatus>().unwrap(), status);
        }
        assert_eq!("available".parse::<AgentStatus>().unwrap(), AgentStatus::Idle);
        assert!("busy".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn ordered_pools_become_ranks() {
        let memberships = PoolMembership::from_ordered(vec![PoolId::from("sales"), PoolId::from("support")]);
        assert_eq!(memberships[0].priority_rank, 1);
        assert_eq!(memberships[1].priority_rank, 2);
    }

    #[test]
    fn dedup_keeps_first_rank() {
        let memberships = dedup_memberships(vec![
            PoolMembership::new("sales", 1),
            PoolMembership::new("support", 2),
            PoolMembership::new("sales", 3),
        ]);
        assert_eq!(memberships.len(), 2);
        assert_eq!(memberships[0], PoolMembership::new("sales", 1));
    }

    #[test]
    fn greeting_viewers_show_as_in_simulation() {
        let now = Utc::now();
        let mut agent = AgentState {
            agent_id: AgentId::from("alice"),
            socket_id: SocketId::from("s1"),
            status: AgentStatus::Idle,
            pool_memberships: vec![],
            profile: AgentProfile::new("alice", "acme", "Alice").with_max_simulations(1),
            connected_at: now,
            status_changed_at: now,
            idle_seq: 1,
            disconnected_at: None,
            previous_status: None,
            simulations: vec![],
            last_assigned_seq: 0,
        };
        assert_eq!(agent.presence_status(), AgentStatus::Idle);
        assert!(agent.can_greet());

        agent.simulations.push(VisitorId::from("v1"));
        assert_eq!(agent.presence_status(), AgentStatus::InSimulation);
        assert!(!agent.can_greet());

        agent.status = AgentStatus::Away;
        assert_eq!(agent.presence_status(), AgentStatus::Away);
    }

    #[test]
    fn profiles_without_capacity_get_the_default() {
        let profile: AgentProfile =
            serde_json::from_str(r#"{"id":"alice","orgId":"acme","displayName":"Alice"}"#).unwrap();
        assert_eq!(profile.max_simultaneous_simulations, DEFAULT_MAX_SIMULATIONS);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&AgentId::from("agent-1")).unwrap();
        assert_eq!(json, "\"agent-1\"");
    }
}
