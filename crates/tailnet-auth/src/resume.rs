//! Resume tokens
//!
//! A resume token lets a peer whose connection dropped reclaim its registry
//! record on reconnect. Tokens are HS256 JWTs binding the peer ID and a
//! token ID (`jti`) with an expiry; the registry remembers the `jti` of the
//! most recently issued token per peer.

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Resume token errors. None of these are fatal to a handshake; the peer
/// simply registers fresh.
#[derive(Debug, Error)]
pub enum ResumeTokenError {
    #[error("Resume token expired")]
    Expired,

    #[error("Resume token signature is invalid")]
    InvalidSignature,

    #[error("Malformed resume token: {0}")]
    Malformed(String),

    #[error("Failed to sign resume token: {0}")]
    Signing(String),
}

/// Claims carried by a resume token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumeClaims {
    /// Peer ID
    pub sub: String,
    /// Token ID
    pub jti: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
}

impl ResumeClaims {
    pub fn peer_id(&self) -> Result<Uuid, ResumeTokenError> {
        Uuid::parse_str(&self.sub)
            .map_err(|_| ResumeTokenError::Malformed("subject is not a peer ID".to_string()))
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.exp
    }
}

/// A freshly signed token with the fields the registry and the peer need
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedToken {
    pub token: String,
    pub token_id: String,
    /// Unix seconds
    pub expires_at: i64,
}

/// Issues and verifies resume tokens with a process-wide secret
pub struct ResumeTokenProvider {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    lifetime: Duration,
}

impl std::fmt::Debug for ResumeTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeTokenProvider")
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

impl ResumeTokenProvider {
    pub fn new(secret: &[u8], lifetime: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            lifetime,
        }
    }

    /// Provider with a random secret; tokens do not survive a restart
    pub fn with_random_secret(lifetime: Duration) -> Self {
        Self::new(&Self::generate_secret(), lifetime)
    }

    pub fn generate_secret() -> Vec<u8> {
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        secret
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Sign a new token for `peer_id`
    pub fn issue(&self, peer_id: Uuid) -> Result<IssuedToken, ResumeTokenError> {
        let now = Utc::now().timestamp();
        let claims = ResumeClaims {
            sub: peer_id.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + self.lifetime.as_secs() as i64,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| ResumeTokenError::Signing(e.to_string()))?;

        debug!(peer_id = %peer_id, token_id = %claims.jti, "Issued resume token");

        Ok(IssuedToken {
            token,
            token_id: claims.jti,
            expires_at: claims.exp,
        })
    }

    /// Check signature and expiry
    pub fn verify(&self, token: &str) -> Result<ResumeClaims, ResumeTokenError> {
        let data = decode::<ResumeClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => ResumeTokenError::Expired,
                ErrorKind::InvalidSignature => ResumeTokenError::InvalidSignature,
                _ => ResumeTokenError::Malformed(e.to_string()),
            },
        )?;

        if data.claims.is_expired() {
            return Err(ResumeTokenError::Expired);
        }
        data.claims.peer_id()?;

        Ok(data.claims)
    }

    /// Exchange a still-valid token for a new one.
    ///
    /// Returns the verified claims of the presented token alongside the new
    /// token so the caller can update the registry record.
    pub fn refresh(&self, token: &str) -> Result<(ResumeClaims, IssuedToken), ResumeTokenError> {
        let claims = self.verify(token)?;
        let issued = self.issue(claims.peer_id()?)?;
        Ok((claims, issued))
    }
}
