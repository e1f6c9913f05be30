//! JWT (JSON Web Token) handling for peer credentials

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tailnet_proto::PeerKind;
use thiserror::Error;
use uuid::Uuid;

/// JWT claims presented in a Coordinate handshake
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerClaims {
    /// Subject (peer ID)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
    /// Custom: whether the bearer is an agent or a client
    pub kind: PeerKind,
    /// Custom: agent IDs a client may open tunnels to
    /// If None, all agents are allowed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_agents: Option<Vec<String>>,
}

impl PeerClaims {
    pub fn new(
        peer_id: Uuid,
        kind: PeerKind,
        issuer: String,
        audience: String,
        validity: Duration,
    ) -> Self {
        let now = Utc::now();
        let exp = now + validity;

        Self {
            sub: peer_id.to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: issuer,
            aud: audience,
            kind,
            allowed_agents: None,
        }
    }

    /// Restrict tunnels to specific agent IDs
    /// An empty Vec leaves all agents allowed
    pub fn with_allowed_agents(mut self, agents: Vec<String>) -> Self {
        self.allowed_agents = if agents.is_empty() {
            None
        } else {
            Some(agents)
        };
        self
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    pub fn exp_formatted(&self) -> String {
        use chrono::{DateTime, Local};
        let dt = DateTime::<Utc>::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now);
        let local: DateTime<Local> = dt.into();
        local.format("%Y-%m-%d %H:%M:%S %Z").to_string()
    }

    /// Peer ID from the subject claim
    pub fn peer_id(&self) -> Result<Uuid, JwtError> {
        Uuid::parse_str(&self.sub).map_err(|_| JwtError::InvalidToken)
    }

    /// Parsed allow-list; `None` means unrestricted
    pub fn allowed_agent_ids(&self) -> Result<Option<Vec<Uuid>>, JwtError> {
        match &self.allowed_agents {
            None => Ok(None),
            Some(agents) => agents
                .iter()
                .map(|a| Uuid::parse_str(a).map_err(|_| JwtError::InvalidToken))
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
        }
    }
}

/// JWT errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,
}

/// JWT validator
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Create a new JWT validator using HMAC-SHA256 (symmetric secret)
    ///
    /// Validates the signature and expiration only, unless an issuer or
    /// audience is configured.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn with_audience(mut self, audience: String) -> Self {
        self.validation.set_audience(&[audience]);
        self
    }

    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn validate(&self, token: &str) -> Result<PeerClaims, JwtError> {
        let token_data = decode::<PeerClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::TokenExpired,
                _ => JwtError::EncodingError(e),
            })?;

        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }

        Ok(token_data.claims)
    }

    /// Encode JWT using HMAC-SHA256 (symmetric secret)
    pub fn encode(secret: &[u8], claims: &PeerClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }
}

impl std::fmt::Debug for JwtValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtValidator")
            .field("algorithms", &self.validation.algorithms)
            .finish()
    }
}
