use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use parley_types::{AuthError, ResourceGrants, Token};

/// What a client asks the authorization service for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRequest {
    pub ttl: Duration,
    pub identity: String,
    pub grants: ResourceGrants,
}

/// Issues tokens. In production this is a remote service; the session only
/// depends on this trait.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn grant(&self, request: GrantRequest) -> Result<Token, AuthError>;
}

/// Claims recovered from a presented token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub identity: String,
    pub grants: ResourceGrants,
    pub expires_at: DateTime<Utc>,
}

/// Validates tokens presented to a transport.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<VerifiedToken, AuthError>;
}
