pub mod authorizer;
pub mod cache;
pub mod identity;
pub mod jwt;

pub use authorizer::{Authorizer, GrantRequest, TokenVerifier, VerifiedToken};
pub use cache::{TokenCache, TokenConfig};
pub use identity::{FixedIdentity, IdentityProvider, RandomIdentity};
pub use jwt::{Claims, JwtAuthorizer};
