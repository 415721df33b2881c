use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::{AuthRejection, IdentityVerifier};
use crate::types::{AgentId, AgentProfile, OrgId, DEFAULT_MAX_SIMULATIONS};

/// Claims carried by a dashboard-issued agent token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentClaims {
    /// Agent id
    pub sub: String,
    pub org_id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub wave_video_url: Option<String>,
    #[serde(default)]
    pub intro_video_url: Option<String>,
    #[serde(default)]
    pub loop_video_url: Option<String>,
    #[serde(default)]
    pub connect_video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_simultaneous_simulations: Option<u32>,
    /// Expiry (seconds since the epoch)
    pub exp: u64,
}

impl From<AgentClaims> for AgentProfile {
    fn from(claims: AgentClaims) -> Self {
        AgentProfile {
            id: AgentId::from(claims.sub),
            org_id: OrgId::from(claims.org_id),
            display_name: claims.display_name,
            avatar_url: claims.avatar_url,
            wave_video_url: claims.wave_video_url,
            intro_video_url: claims.intro_video_url,
            loop_video_url: claims.loop_video_url,
            connect_video_url: claims.connect_video_url,
            max_simultaneous_simulations: claims
                .max_simultaneous_simulations
                .unwrap_or(DEFAULT_MAX_SIMULATIONS),
        }
    }
}

/// Verifies HS256 tokens signed with a secret shared with the dashboard
pub struct JwtIdentityVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentityVerifier {
    async fn verify_agent(&self, agent_id: &AgentId, token: &str) -> Result<AgentProfile, AuthRejection> {
        let data = decode::<AgentClaims>(token, &self.key, &self.validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthRejection::Expired,
            _ => AuthRejection::InvalidToken,
        })?;
        if data.claims.sub != agent_id.as_str() {
            return Err(AuthRejection::AgentMismatch);
        }
        Ok(data.claims.into())
    }
}

impl std::fmt::Debug for JwtIdentityVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtIdentityVerifier").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &[u8] = b"dashboard-shared-secret";

    fn token_for(agent: &str, exp: u64, secret: &[u8]) -> String {
        let claims = AgentClaims {
            sub: agent.to_string(),
            org_id: "acme".to_string(),
            display_name: "Alice".to_string(),
            avatar_url: Some("https://cdn.acme.com/alice.png".to_string()),
            wave_video_url: None,
            intro_video_url: None,
            loop_video_url: None,
            connect_video_url: None,
            max_simultaneous_simulations: Some(3),
            exp,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn in_one_hour() -> u64 {
        (chrono::Utc::now().timestamp() + 3_600) as u64
    }

    #[tokio::test]
    async fn valid_token_yields_profile() {
        let verifier = JwtIdentityVerifier::new(SECRET);
        let profile = verifier
            .verify_agent(&AgentId::from("alice"), &token_for("alice", in_one_hour(), SECRET))
            .await
            .unwrap();
        assert_eq!(profile.display_name, "Alice");
        assert_eq!(profile.org_id, OrgId::from("acme"));
        assert_eq!(profile.max_simultaneous_simulations, 3);
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let verifier = JwtIdentityVerifier::new(SECRET);
        let err = verifier
            .verify_agent(&AgentId::from("alice"), &token_for("alice", in_one_hour(), b"other"))
            .await
            .unwrap_err();
        assert_eq!(err, AuthRejection::InvalidToken);
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let verifier = JwtIdentityVerifier::new(SECRET);
        let err = verifier
            .verify_agent(&AgentId::from("alice"), &token_for("alice", 1_000, SECRET))
            .await
            .unwrap_err();
        assert_eq!(err, AuthRejection::Expired);
    }

    #[tokio::test]
    async fn token_for_another_agent_is_rejected() {
        let verifier = JwtIdentityVerifier::new(SECRET);
        let err = verifier
            .verify_agent(&AgentId::from("mallory"), &token_for("alice", in_one_hour(), SECRET))
            .await
            .unwrap_err();
        assert_eq!(err, AuthRejection::AgentMismatch);
        assert!(verifier.verify_agent(&AgentId::from("alice"), "garbage").await.is_err());
    }
}
