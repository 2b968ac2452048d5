//! In-memory message log for chat sessions.
//!
//! Each channel keeps an ordered, append-only list of messages. Moderation
//! (reactions, flags, soft-deletes) is layered on as annotations so the
//! original content and the audit trail are never lost.

pub mod message_store;
pub mod stats;

pub use message_store::{AnnotateOutcome, AppendOutcome, DEFAULT_CHANNEL_CAPACITY, MessageStore};
pub use stats::{StoreStats, StoreStatsSnapshot};
