use std::time::Duration;

use thiserror::Error;

use crate::channel::ChannelNameError;
use crate::models::MessageId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("authorization denied: {0}")]
    Denied(String),

    #[error("authorization token expired")]
    Expired,

    #[error("authorization service unreachable: {0}")]
    Network(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("transport handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("transport handshake timed out")]
    Timeout,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("gave up reconnecting after {0:?}")]
    RetriesExhausted(Duration),

    #[error("session is not connected")]
    NotConnected,

    #[error("session closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("publish denied: {0}")]
    AuthDenied(String),

    #[error("publish failed: {0}")]
    Network(String),

    #[error("invalid channel: {0}")]
    ChannelInvalid(String),
}

impl From<AuthError> for PublishError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Denied(reason) => Self::AuthDenied(reason),
            AuthError::Expired => Self::AuthDenied("token expired".into()),
            AuthError::Network(reason) => Self::Network(reason),
        }
    }
}

impl From<ChannelNameError> for PublishError {
    fn from(e: ChannelNameError) -> Self {
        Self::ChannelInvalid(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("message {message_id} not found in channel {channel}")]
pub struct NotFoundError {
    pub channel: String,
    pub message_id: MessageId,
}

/// Reported to a single observer whose queue overflowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("observer queue overflowed, {dropped} oldest events dropped")]
pub struct OverflowError {
    pub dropped: u64,
}

/// Errors from session operations that span several failure classes
/// (subscribe, annotate).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("invalid channel: {0}")]
    ChannelInvalid(String),

    #[error("session closed")]
    Closed,
}

impl From<ChannelNameError> for SessionError {
    fn from(e: ChannelNameError) -> Self {
        Self::ChannelInvalid(e.to_string())
    }
}
