use thiserror::Error;

/// Longest channel name accepted, in bytes.
pub const MAX_CHANNEL_NAME_LEN: usize = 92;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelNameError {
    #[error("channel name is empty")]
    Empty,

    #[error("channel name is {0} bytes (max 92)")]
    TooLong(usize),

    #[error("channel name contains forbidden character {0:?}")]
    ForbiddenChar(char),
}

/// Check a channel name before it reaches the transport.
///
/// `*` is reserved for grant patterns, `,` and `:` are reserved as list and
/// scope separators.
pub fn validate_channel_name(name: &str) -> Result<(), ChannelNameError> {
    if name.is_empty() {
        return Err(ChannelNameError::Empty);
    }
    if name.len() > MAX_CHANNEL_NAME_LEN {
        return Err(ChannelNameError::TooLong(name.len()));
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || matches!(c, ',' | ':' | '*'))
    {
        return Err(ChannelNameError::ForbiddenChar(c));
    }
    Ok(())
}
