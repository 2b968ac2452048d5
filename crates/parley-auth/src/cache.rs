use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_types::{AuthError, Permissions, ResourceGrants, Token};

use crate::authorizer::{Authorizer, GrantRequest};
use crate::identity::IdentityProvider;

const DEFAULT_REFRESH_MARGIN: f64 = 0.2;
const MAX_REFRESH_MARGIN: f64 = 0.9;

/// What the cache asks the authorizer for on every refresh.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Requested token lifetime.
    pub ttl: Duration,
    /// Fraction of a token's lifetime, counted back from expiry, inside
    /// which the token is refreshed. Clamped to `0.0..=0.9`.
    pub refresh_margin: f64,
    pub grants: ResourceGrants,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15 * 60),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            grants: ResourceGrants::all_channels(Permissions::READ_WRITE),
        }
    }
}

impl TokenConfig {
    pub fn margin(&self) -> f64 {
        if self.refresh_margin.is_nan() {
            return DEFAULT_REFRESH_MARGIN;
        }
        self.refresh_margin.clamp(0.0, MAX_REFRESH_MARGIN)
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: Token,
    refresh_at: DateTime<Utc>,
}

impl CachedToken {
    fn new(token: Token, margin: f64, received_at: DateTime<Utc>) -> Self {
        let lifetime_ms = (token.expires_at - received_at).num_milliseconds().max(0);
        let lead = chrono::Duration::milliseconds((lifetime_ms as f64 * margin) as i64);
        let refresh_at = token.expires_at - lead;
        Self { token, refresh_at }
    }

    fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now < self.refresh_at && self.token.is_valid_at(now)
    }
}

type PendingGrant = Shared<BoxFuture<'static, Result<Token, AuthError>>>;

#[derive(Default)]
struct CacheState {
    current: Option<CachedToken>,
    /// The one outstanding authorizer request, if any.
    pending: Option<PendingGrant>,
}

/// Holds the session's authorization token and keeps it fresh.
///
/// Refreshes are single-flight: callers that arrive while a request is
/// outstanding await the same request and observe the identical token or the
/// identical error.
pub struct TokenCache {
    authorizer: Arc<dyn Authorizer>,
    identity: Arc<dyn IdentityProvider>,
    config: TokenConfig,
    state: Arc<Mutex<CacheState>>,
    requests: Arc<AtomicU64>,
    replaced: Arc<Notify>,
}

impl TokenCache {
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        identity: Arc<dyn IdentityProvider>,
        config: TokenConfig,
    ) -> Self {
        Self {
            authorizer,
            identity,
            config,
            state: Arc::new(Mutex::new(CacheState::default())),
            requests: Arc::new(AtomicU64::new(0)),
            replaced: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    pub fn identity(&self) -> String {
        self.identity.identity()
    }

    /// A token that is valid right now.
    ///
    /// Returns the cached token while it is outside the refresh window.
    /// Inside the window a refresh is attempted; if it fails and the cached
    /// token has not yet expired, the cached token is returned instead.
    pub async fn get_token(&self) -> Result<Token, AuthError> {
        let now = Utc::now();
        let fallback = {
            let state = self.state.lock();
            match &state.current {
                Some(cached) if cached.is_fresh_at(now) => return Ok(cached.token.clone()),
                Some(cached) if cached.token.is_valid_at(now) => Some(cached.token.clone()),
                _ => None,
            }
        };

        match self.refresh().await {
            Ok(token) => Ok(token),
            Err(e) => match fallback {
                Some(token) if token.is_valid() => {
                    warn!(error = %e, expires_at = %token.expires_at, "token refresh failed, using current token");
                    Ok(token)
                }
                _ => Err(e),
            },
        }
    }

    /// Request a new token with the configured ttl and grants.
    pub async fn refresh(&self) -> Result<Token, AuthError> {
        self.refresh_with(self.config.ttl, self.config.grants.clone())
            .await
    }

    /// Request a new token. If a request is already outstanding this joins
    /// it, whatever `ttl` and `grants` it was issued with.
    pub async fn refresh_with(
        &self,
        ttl: Duration,
        grants: ResourceGrants,
    ) -> Result<Token, AuthError> {
        let pending = {
            let mut state = self.state.lock();
            match &state.pending {
                Some(pending) => pending.clone(),
                None => {
                    let pending = self.start_grant(ttl, grants).shared();
                    state.pending = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    fn start_grant(&self, ttl: Duration, grants: ResourceGrants) -> BoxFuture<'static, Result<Token, AuthError>> {
        let authorizer = Arc::clone(&self.authorizer);
        let state = Arc::clone(&self.state);
        let replaced = Arc::clone(&self.replaced);
        let margin = self.config.margin();
        let request = GrantRequest {
            ttl,
            identity: self.identity.identity(),
            grants,
        };
        let seq = self.requests.fetch_add(1, Ordering::Relaxed) + 1;

        async move {
            debug!(identity = %request.identity, ?ttl, seq, "requesting token");
            let result = authorizer.grant(request).await.and_then(|token| {
                if token.is_valid() {
                    Ok(token)
                } else {
                    warn!(expires_at = %token.expires_at, "authorizer returned an expired token");
                    Err(AuthError::Expired)
                }
            });

            {
                let mut state = state.lock();
                state.pending = None;
                if let Ok(token) = &result {
                    state.current = Some(CachedToken::new(token.clone(), margin, Utc::now()));
                }
            }

            match &result {
                Ok(token) => {
                    debug!(seq, expires_at = %token.expires_at, "token stored");
                    replaced.notify_one();
                }
                Err(e) => warn!(seq, error = %e, "token request failed"),
            }
            result
        }
        .boxed()
    }

    /// The cached token, valid or not.
    pub fn current(&self) -> Option<Token> {
        self.state.lock().current.as_ref().map(|c| c.token.clone())
    }

    /// Forget the cached token so the next `get_token` refreshes.
    pub fn invalidate(&self) {
        self.state.lock().current = None;
    }

    /// Number of requests sent to the authorizer so far.
    pub fn requests_issued(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Time until the cached token enters its refresh window. `None` with no
    /// cached token.
    pub fn until_refresh(&self) -> Option<Duration> {
        let state = self.state.lock();
        let cached = state.current.as_ref()?;
        Some((cached.refresh_at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Spawn a task that refreshes the token when it enters its refresh
    /// window. Runs until `cancel` fires.
    pub fn spawn_refresh_task(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            info!("token refresh task started");
            loop {
                let wait = cache.until_refresh();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = cache.replaced.notified() => continue,
                    _ = sleep_for(wait) => {}
                }

                let outcome = tokio::select! {
                    _ = cancel.cancelled() => break,
                    outcome = cache.refresh() => outcome,
                };
                match outcome {
                    Ok(token) => debug!(expires_at = %token.expires_at, "token refreshed ahead of expiry"),
                    Err(e) => {
                        warn!(error = %e, "proactive token refresh failed, waiting for next token");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = cache.replaced.notified() => {}
                        }
                    }
                }
            }
            info!("token refresh task stopped");
        })
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}
