use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use parley_auth::{FixedIdentity, IdentityProvider, RandomIdentity, TokenConfig};
use parley_types::{Permissions, ResourceGrants, validate_channel_name};

use crate::backoff::BackoffConfig;

const DEFAULT_SECRET: &str = "dev-secret-change-me";
const DEFAULT_CHANNEL: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {key}: expected {expected}, got {value:?}")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backoff: BackoffConfig,
    /// How long a reconnect episode may last before giving up. `None`
    /// retries until closed.
    pub max_retry_duration: Option<Duration>,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    /// Per-observer queue length. The queue rounds it up to a power of two;
    /// `from_lookup` applies that rounding so the setting reads as it runs.
    pub observer_capacity: usize,
    /// Messages fetched when a channel is (re)subscribed.
    pub history_fetch: usize,
    /// Messages retained per channel in the local store.
    pub store_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            max_retry_duration: Some(Duration::from_secs(5 * 60)),
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
            observer_capacity: 256,
            history_fetch: 100,
            store_capacity: 1000,
        }
    }
}

/// Everything a client process needs, read from `PARLEY_*` variables.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// `None` picks a random username.
    pub identity: Option<String>,
    pub channels: Vec<String>,
    pub secret: String,
    pub session: SessionConfig,
    pub tokens: TokenConfig,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let channels = vec![DEFAULT_CHANNEL.to_string()];
        Self {
            identity: None,
            tokens: TokenConfig {
                grants: grants_for(&channels),
                ..TokenConfig::default()
            },
            channels,
            secret: DEFAULT_SECRET.to_string(),
            session: SessionConfig::default(),
        }
    }
}

impl ClientSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source. Empty values count
    /// as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut settings = Self::default();

        settings.identity = get("PARLEY_IDENTITY");
        if let Some(secret) = get("PARLEY_SECRET") {
            settings.secret = secret;
        }

        if let Some(raw) = get("PARLEY_CHANNELS") {
            let mut channels = Vec::new();
            for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                if validate_channel_name(name).is_err() {
                    return Err(invalid("PARLEY_CHANNELS", "comma-separated channel names", &raw));
                }
                if !channels.iter().any(|c| c == name) {
                    channels.push(name.to_string());
                }
            }
            if channels.is_empty() {
                return Err(invalid("PARLEY_CHANNELS", "at least one channel", &raw));
            }
            settings.tokens.grants = grants_for(&channels);
            settings.channels = channels;
        }

        if let Some(secs) = parse::<u64>(&get, "PARLEY_TOKEN_TTL_SECS", "positive seconds")? {
            if secs == 0 {
                return Err(invalid("PARLEY_TOKEN_TTL_SECS", "positive seconds", "0"));
            }
            settings.tokens.ttl = Duration::from_secs(secs);
        }
        if let Some(margin) = parse::<f64>(&get, "PARLEY_REFRESH_MARGIN", "fraction between 0 and 0.9")? {
            if !margin.is_finite() {
                return Err(invalid("PARLEY_REFRESH_MARGIN", "fraction between 0 and 0.9", &margin.to_string()));
            }
            settings.tokens.refresh_margin = margin;
        }

        let session = &mut settings.session;
        if let Some(ms) = parse::<u64>(&get, "PARLEY_BACKOFF_BASE_MS", "milliseconds")? {
            session.backoff.base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&get, "PARLEY_BACKOFF_CAP_MS", "milliseconds")? {
            session.backoff.cap = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&get, "PARLEY_MAX_RETRY_SECS", "seconds, 0 for unbounded")? {
            session.max_retry_duration = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse::<u64>(&get, "PARLEY_CONNECT_TIMEOUT_SECS", "seconds")? {
            session.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&get, "PARLEY_PUBLISH_TIMEOUT_SECS", "seconds")? {
            session.publish_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse::<usize>(&get, "PARLEY_OBSERVER_CAPACITY", "queue length")? {
            session.observer_capacity = n
                .max(1)
                .checked_next_power_of_two()
                .ok_or_else(|| invalid("PARLEY_OBSERVER_CAPACITY", "queue length", &n.to_string()))?;
        }
        if let Some(n) = parse::<usize>(&get, "PARLEY_HISTORY_FETCH", "message count")? {
            session.history_fetch = n;
        }
        if let Some(n) = parse::<usize>(&get, "PARLEY_STORE_CAPACITY", "message count")? {
            session.store_capacity = n;
        }

        Ok(settings)
    }

    pub fn identity_provider(&self) -> Arc<dyn IdentityProvider> {
        match &self.identity {
            Some(identity) => Arc::new(FixedIdentity::new(identity.clone())),
            None => Arc::new(RandomIdentity::new()),
        }
    }
}

fn grants_for(channels: &[String]) -> ResourceGrants {
    channels
        .iter()
        .fold(ResourceGrants::new(), |grants, channel| {
            grants.channel(channel.clone(), Permissions::READ_WRITE)
        })
}

fn invalid(key: &'static str, expected: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        expected,
        value: value.to_string(),
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    match get(key) {
        Some(raw) => raw.parse().map(Some).map_err(|_| invalid(key, expected, &raw)),
        None => Ok(None),
    }
}
