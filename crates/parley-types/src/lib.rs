pub mod channel;
pub mod errors;
pub mod events;
pub mod models;
pub mod token;

pub use channel::{ChannelNameError, MAX_CHANNEL_NAME_LEN, validate_channel_name};
pub use errors::{
    AuthError, ConnectionError, NotFoundError, OverflowError, PublishError, SessionError,
};
pub use events::{ConnectionStatus, LinkStatus, TransportEvent};
pub use models::{Annotation, AnnotationKind, Message, MessageId, ReactionGroup};
pub use token::{Permissions, ResourceGrants, Token};
