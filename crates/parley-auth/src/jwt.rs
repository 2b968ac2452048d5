use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use parley_types::{AuthError, ResourceGrants, Token};

use crate::authorizer::{Authorizer, GrantRequest, TokenVerifier, VerifiedToken};

/// Longest ttl the authorizer will sign.
const MAX_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// JWT claims carried by every token this authorizer signs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
    pub iat: u64,
    pub jti: Uuid,
    #[serde(default)]
    pub grants: ResourceGrants,
}

/// In-process authorization service that signs HS256 tokens with a shared
/// secret and verifies them for the transport side.
pub struct JwtAuthorizer {
    secret: String,
    denied: RwLock<HashSet<String>>,
}

impl JwtAuthorizer {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            denied: RwLock::new(HashSet::new()),
        }
    }

    /// Refuse future grants for `identity`.
    pub fn deny(&self, identity: impl Into<String>) {
        self.denied.write().insert(identity.into());
    }

    pub fn allow(&self, identity: &str) {
        self.denied.write().remove(identity);
    }

    /// Sign `claims` as-is. Exposed so callers can mint tokens with explicit
    /// timestamps.
    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AuthError::Denied(format!("failed to sign token: {}", e)))
    }

    fn issue(&self, request: &GrantRequest) -> Result<Token, AuthError> {
        if request.identity.is_empty() {
            return Err(AuthError::Denied("identity is required".into()));
        }
        if request.ttl.is_zero() || request.ttl > MAX_TTL {
            return Err(AuthError::Denied(format!(
                "ttl {:?} outside 0..={:?}",
                request.ttl, MAX_TTL
            )));
        }
        if self.denied.read().contains(&request.identity) {
            warn!(identity = %request.identity, "token grant refused");
            return Err(AuthError::Denied(format!(
                "identity {} is not allowed",
                request.identity
            )));
        }

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(request.ttl)
            .map_err(|_| AuthError::Denied("ttl out of range".into()))?;
        // JWT expiry has whole-second resolution; round up so the token lives
        // at least `ttl`.
        let deadline = now + ttl;
        let exp = if deadline.timestamp_subsec_nanos() > 0 {
            deadline.timestamp() + 1
        } else {
            deadline.timestamp()
        };
        let expires_at = DateTime::from_timestamp(exp, 0)
            .ok_or_else(|| AuthError::Denied("expiry out of range".into()))?;

        let claims = Claims {
            sub: request.identity.clone(),
            exp: exp as u64,
            iat: now.timestamp() as u64,
            jti: Uuid::new_v4(),
            grants: request.grants.clone(),
        };
        let value = self.sign(&claims)?;

        debug!(identity = %claims.sub, %expires_at, "token granted");
        Ok(Token {
            value,
            expires_at,
            grants: claims.grants,
        })
    }
}

#[async_trait]
impl Authorizer for JwtAuthorizer {
    async fn grant(&self, request: GrantRequest) -> Result<Token, AuthError> {
        self.issue(&request)
    }
}

impl TokenVerifier for JwtAuthorizer {
    fn verify(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Denied(format!("invalid token: {}", e)),
        })?;

        let claims = data.claims;
        if self.denied.read().contains(&claims.sub) {
            return Err(AuthError::Denied(format!(
                "identity {} is not allowed",
                claims.sub
            )));
        }

        let expires_at = DateTime::from_timestamp(claims.exp as i64, 0)
            .ok_or_else(|| AuthError::Denied("expiry out of range".into()))?;
        Ok(VerifiedToken {
            identity: claims.sub,
            grants: claims.grants,
            expires_at,
        })
    }
}
