use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
}

impl Permissions {
    pub const NONE: Self = Self {
        read: false,
        write: false,
    };
    pub const READ_ONLY: Self = Self {
        read: true,
        write: false,
    };
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };
}

/// Channel permissions carried by a token.
///
/// Keys are exact channel names or patterns ending in `*` that match by
/// prefix. An exact entry beats any pattern; among patterns the longest
/// prefix wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGrants {
    #[serde(default)]
    pub channels: BTreeMap<String, Permissions>,
}

impl ResourceGrants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `permissions` on every channel.
    pub fn all_channels(permissions: Permissions) -> Self {
        Self::new().channel("*", permissions)
    }

    pub fn channel(mut self, name: impl Into<String>, permissions: Permissions) -> Self {
        self.channels.insert(name.into(), permissions);
        self
    }

    pub fn permissions_for(&self, channel: &str) -> Permissions {
        if let Some(exact) = self.channels.get(channel) {
            return *exact;
        }
        self.channels
            .iter()
            .filter_map(|(key, perms)| {
                let prefix = key.strip_suffix('*')?;
                channel.starts_with(prefix).then_some((prefix.len(), *perms))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, perms)| perms)
            .unwrap_or(Permissions::NONE)
    }

    pub fn can_read(&self, channel: &str) -> bool {
        self.permissions_for(channel).read
    }

    pub fn can_write(&self, channel: &str) -> bool {
        self.permissions_for(channel).write
    }
}

/// A time-bounded credential. Replaced wholesale on refresh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub value: String,
    pub expires_at: DateTime<Utc>,
    pub grants: ResourceGrants,
}

impl Token {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

// Keep token material out of logs.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("grants", &self.grants)
            .finish()
    }
}
