use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use parley_types::{AnnotationKind, Message, MessageId, PublishError, Token, TransportEvent};

/// Collaborator-facing failures. The session maps these into the
/// caller-facing error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport refused the request: {0}")]
    Denied(String),

    #[error("transport unreachable: {0}")]
    Network(String),

    #[error("transport did not answer in time")]
    Timeout,

    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    #[error("message {0} not found")]
    NotFound(MessageId),

    #[error("no open link")]
    NotConnected,
}

impl TransportError {
    /// Whether retrying on a new link could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout | Self::NotConnected)
    }
}

impl From<TransportError> for PublishError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Denied(reason) => Self::AuthDenied(reason),
            TransportError::InvalidChannel(reason) => Self::ChannelInvalid(reason),
            other => Self::Network(other.to_string()),
        }
    }
}

/// Events pushed by an open link. The stream ends when the link closes.
pub type EventStream = BoxStream<'static, TransportEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationRequest {
    pub kind: AnnotationKind,
    pub value: String,
}

/// The wire the session talks over. Every call that needs authorization
/// takes the token explicitly.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link. Any previous link is replaced.
    async fn connect(&self, token: &Token) -> Result<EventStream, TransportError>;

    async fn subscribe(&self, token: &Token, channels: &[String]) -> Result<(), TransportError>;

    async fn unsubscribe(&self, channels: &[String]) -> Result<(), TransportError>;

    /// Publish and wait for the server-assigned id.
    async fn publish(
        &self,
        token: &Token,
        channel: &str,
        body: &str,
    ) -> Result<MessageId, TransportError>;

    async fn annotate(
        &self,
        token: &Token,
        channel: &str,
        message_id: MessageId,
        request: AnnotationRequest,
    ) -> Result<(), TransportError>;

    /// A page of `channel`, ascending. With a cursor, the first `limit`
    /// messages after it; without one, the most recent `limit`.
    async fn history(
        &self,
        token: &Token,
        channel: &str,
        after: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>, TransportError>;

    /// Messages with ids in `from..=through`, ascending, each carrying its
    /// current annotations.
    async fn range(
        &self,
        token: &Token,
        channel: &str,
        from: MessageId,
        through: MessageId,
    ) -> Result<Vec<Message>, TransportError>;

    /// Close the link. Its event stream ends.
    async fn disconnect(&self);
}
