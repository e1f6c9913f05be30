//! Authentication and authorization for the tailnet coordinator

pub mod jwt;
pub mod resume;
pub mod validator;

pub use jwt::{JwtError, JwtValidator, PeerClaims};
pub use resume::{IssuedToken, ResumeClaims, ResumeTokenError, ResumeTokenProvider};
pub use validator::{
    AuthError, AuthorizedPeer, ClaimsAuthorizer, InsecureAuthenticator, JwtAuthenticator,
    PeerAuthenticator, TunnelAuthorizer,
};

// Re-export useful types
pub use async_trait::async_trait;
