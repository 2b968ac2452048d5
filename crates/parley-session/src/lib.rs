//! Client-side chat session: connection lifecycle, channel subscriptions,
//! publish and message actions, and observer fan-out, over an injected
//! [`Transport`] and token cache.

pub mod backoff;
pub mod client;
pub mod config;
pub mod hub;
pub mod observer;
pub mod registry;
pub mod transport;

pub use backoff::{Backoff, BackoffConfig};
pub use client::{SessionClient, SessionState};
pub use config::{ClientSettings, ConfigError, SessionConfig};
pub use hub::{MemoryHub, MemoryTransport};
pub use observer::{ListenerId, SessionEvent, SessionObserver};
pub use registry::{ChannelRegistry, ChannelSubscription};
pub use transport::{AnnotationRequest, EventStream, Transport, TransportError};
