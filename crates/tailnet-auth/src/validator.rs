//! Peer authentication and tunnel authorization seams
//!
//! The coordinator does not evaluate policy itself. It asks a
//! [`PeerAuthenticator`] who the peer behind a handshake is, and a
//! [`TunnelAuthorizer`] whether that peer may open a tunnel to a target.

use async_trait::async_trait;
use tailnet_proto::{Handshake, PeerKind};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::jwt::{JwtError, JwtValidator};

/// Authentication and authorization errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Token does not match handshake: {0}")]
    IdentityMismatch(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
}

impl From<JwtError> for AuthError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::TokenExpired => AuthError::TokenExpired,
            JwtError::InvalidToken => AuthError::InvalidToken("Invalid JWT".to_string()),
            JwtError::EncodingError(e) => AuthError::InvalidToken(e.to_string()),
        }
    }
}

/// Identity established for a Coordinate stream
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizedPeer {
    pub peer_id: Uuid,
    pub kind: PeerKind,
    pub name: String,
    /// Agents a client may tunnel to; `None` means any
    pub allowed_agents: Option<Vec<Uuid>>,
}

impl AuthorizedPeer {
    pub fn new(peer_id: Uuid, kind: PeerKind, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            kind,
            name: name.into(),
            allowed_agents: None,
        }
    }

    pub fn with_allowed_agents(mut self, agents: Vec<Uuid>) -> Self {
        self.allowed_agents = Some(agents);
        self
    }
}

/// Turns a handshake credential into a peer identity
#[async_trait]
pub trait PeerAuthenticator: Send + Sync {
    async fn authenticate(&self, handshake: &Handshake) -> Result<AuthorizedPeer, AuthError>;
}

/// Decides whether a peer may open a tunnel to a target
#[async_trait]
pub trait TunnelAuthorizer: Send + Sync {
    async fn authorize_tunnel(&self, src: &AuthorizedPeer, dst: Uuid) -> Result<(), AuthError>;
}

/// Authenticates handshakes carrying a peer JWT
pub struct JwtAuthenticator {
    validator: JwtValidator,
}

impl JwtAuthenticator {
    pub fn new(validator: JwtValidator) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl PeerAuthenticator for JwtAuthenticator {
    async fn authenticate(&self, handshake: &Handshake) -> Result<AuthorizedPeer, AuthError> {
        let claims = self.validator.validate(&handshake.auth_token)?;

        let peer_id = claims.peer_id()?;
        if peer_id != handshake.peer_id {
            return Err(AuthError::IdentityMismatch(format!(
                "token is for peer {}, handshake claims {}",
                peer_id, handshake.peer_id
            )));
        }
        if claims.kind != handshake.kind {
            return Err(AuthError::IdentityMismatch(format!(
                "token is for a {}, handshake claims {}",
                claims.kind, handshake.kind
            )));
        }

        let mut peer = AuthorizedPeer::new(peer_id, claims.kind, handshake.name.clone());
        if let Some(agents) = claims.allowed_agent_ids()? {
            peer = peer.with_allowed_agents(agents);
        }

        debug!(peer_id = %peer_id, kind = %peer.kind, "Peer authenticated");
        Ok(peer)
    }
}

/// Accepts every handshake at face value. For development only.
#[derive(Debug, Default, Clone, Copy)]
pub struct InsecureAuthenticator;

#[async_trait]
impl PeerAuthenticator for InsecureAuthenticator {
    async fn authenticate(&self, handshake: &Handshake) -> Result<AuthorizedPeer, AuthError> {
        Ok(AuthorizedPeer::new(
            handshake.peer_id,
            handshake.kind,
            handshake.name.clone(),
        ))
    }
}

/// Default policy: clients may tunnel to the agents their credential
/// allows; agents only answer tunnels and never open them.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClaimsAuthorizer;

#[async_trait]
impl TunnelAuthorizer for ClaimsAuthorizer {
    async fn authorize_tunnel(&self, src: &AuthorizedPeer, dst: Uuid) -> Result<(), AuthError> {
        if src.kind == PeerKind::Agent {
            return Err(AuthError::PermissionDenied(
                "agents may not open tunnels".to_string(),
            ));
        }

        if let Some(allowed) = &src.allowed_agents {
            if !allowed.contains(&dst) {
                return Err(AuthError::PermissionDenied(format!(
                    "agent '{}' is not in allowed agents list",
                    dst
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwt::PeerClaims;
    use chrono::Duration;

    const SECRET: &[u8] = b"handshake-secret";

    fn handshake(peer_id: Uuid, kind: PeerKind, token: String) -> Handshake {
        Handshake {
            peer_id,
            kind,
            name: "peer".to_string(),
            auth_token: token,
            resume_token: None,
        }
    }

    fn token_for(peer_id: Uuid, kind: PeerKind) -> String {
        let claims = PeerClaims::new(
            peer_id,
            kind,
            "tailnet".to_string(),
            "tailnet".to_string(),
            Duration::hours(1),
        );
        JwtValidator::encode(SECRET, &claims).unwrap()
    }

    #[tokio::test]
    async fn test_jwt_authenticator_accepts_matching_identity() {
        let auth = JwtAuthenticator::new(JwtValidator::new(SECRET));
        let peer_id = Uuid::new_v4();

        let peer = auth
            .authenticate(&handshake(
                peer_id,
                PeerKind::Agent,
                token_for(peer_id, PeerKind::Agent),
            ))
            .await
            .unwrap();

        assert_eq!(peer.peer_id, peer_id);
        assert_eq!(peer.kind, PeerKind::Agent);
        assert_eq!(peer.allowed_agents, None);
    }

    #[tokio::test]
    async fn test_jwt_authenticator_rejects_borrowed_token() {
        let auth = JwtAuthenticator::new(JwtValidator::new(SECRET));
        let owner = Uuid::new_v4();
        let impostor = Uuid::new_v4();

        let result = auth
            .authenticate(&handshake(
                impostor,
                PeerKind::Client,
                token_for(owner, PeerKind::Client),
            ))
            .await;
        assert!(matches!(result, Err(AuthError::IdentityMismatch(_))));
    }

    #[tokio::test]
    async fn test_jwt_authenticator_rejects_kind_mismatch() {
        let auth = JwtAuthenticator::new(JwtValidator::new(SECRET));
        let peer_id = Uuid::new_v4();

        let result = auth
            .authenticate(&handshake(
                peer_id,
                PeerKind::Agent,
                token_for(peer_id, PeerKind::Client),
            ))
            .await;
        assert!(matches!(result, Err(AuthError::IdentityMismatch(_))));
    }

    #[tokio::test]
    async fn test_jwt_authenticator_rejects_garbage() {
        let auth = JwtAuthenticator::new(JwtValidator::new(SECRET));
        let result = auth
            .authenticate(&handshake(
                Uuid::new_v4(),
                PeerKind::Client,
                "garbage".to_string(),
            ))
            .await;
        assert!(matches!(result, Err(AuthError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_insecure_authenticator_trusts_handshake() {
        let peer_id = Uuid::new_v4();
        let peer = InsecureAuthenticator
            .authenticate(&handshake(peer_id, PeerKind::Client, String::new()))
            .await
            .unwrap();
        assert_eq!(peer.peer_id, peer_id);
        assert_eq!(peer.name, "peer");
    }

    #[tokio::test]
    async fn test_claims_authorizer() {
        let agent_a = Uuid::new_v4();
        let agent_b = Uuid::new_v4();

        let open_client = AuthorizedPeer::new(Uuid::new_v4(), PeerKind::Client, "c1");
        assert!(ClaimsAuthorizer
            .authorize_tunnel(&open_client, agent_a)
            .await
            .is_ok());

        let scoped_client = AuthorizedPeer::new(Uuid::new_v4(), PeerKind::Client, "c2")
            .with_allowed_agents(vec![agent_a]);
        assert!(ClaimsAuthorizer
            .authorize_tunnel(&scoped_client, agent_a)
            .await
            .is_ok());
        assert!(matches!(
            ClaimsAuthorizer
                .authorize_tunnel(&scoped_client, agent_b)
                .await,
            Err(AuthError::PermissionDenied(_))
        ));

        let agent = AuthorizedPeer::new(agent_a, PeerKind::Agent, "agent");
        assert!(matches!(
            ClaimsAuthorizer.authorize_tunnel(&agent, agent_b).await,
            Err(AuthError::PermissionDenied(_))
        ));
    }
}
