use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use parley_types::{Annotation, AnnotationKind, Message, MessageId, NotFoundError};

use crate::stats::{StoreStats, StoreStatsSnapshot};

/// Messages retained per channel before the oldest are evicted.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Stored,
    /// The id did not advance past `last`; the message was ignored.
    Stale { last: MessageId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotateOutcome {
    Applied,
    /// The annotation repeated one already on the message.
    Duplicate,
}

#[derive(Debug, Default)]
struct ChannelLog {
    /// Ascending by id.
    messages: VecDeque<Message>,
    /// Highest id ever stored. Survives eviction.
    last_id: Option<MessageId>,
}

impl ChannelLog {
    fn position(&self, id: MessageId) -> Option<usize> {
        self.messages.binary_search_by_key(&id, |m| m.id).ok()
    }

    fn tail(&self, limit: usize) -> impl Iterator<Item = &Message> {
        self.messages
            .iter()
            .skip(self.messages.len().saturating_sub(limit))
    }
}

/// Per-channel ordered message log.
///
/// Writers for a channel serialize on that channel's lock only; readers copy
/// a snapshot under a read lock, so a listed message is always complete.
pub struct MessageStore {
    capacity: usize,
    channels: RwLock<HashMap<String, Arc<RwLock<ChannelLog>>>>,
    stats: StoreStats,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
            stats: StoreStats::new(),
        }
    }

    fn log(&self, channel: &str) -> Option<Arc<RwLock<ChannelLog>>> {
        self.channels.read().get(channel).cloned()
    }

    fn log_or_create(&self, channel: &str) -> Arc<RwLock<ChannelLog>> {
        if let Some(log) = self.log(channel) {
            return log;
        }
        self.channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .clone()
    }

    // -- Writes --

    /// Append a message to `channel`.
    ///
    /// Messages whose id does not exceed the last stored id are ignored, which
    /// turns at-least-once delivery into exactly-once application.
    pub fn append(&self, channel: &str, message: Message) -> AppendOutcome {
        let log = self.log_or_create(channel);
        let mut log = log.write();

        if let Some(last) = log.last_id {
            if message.id <= last {
                StoreStats::bump(&self.stats.stale_dropped);
                debug!(
                    channel,
                    id = %message.id,
                    last = %last,
                    "dropping stale or duplicate message"
                );
                return AppendOutcome::Stale { last };
            }
        }

        trace!(channel, id = %message.id, "message stored");
        log.last_id = Some(message.id);
        log.messages.push_back(message);
        StoreStats::bump(&self.stats.appended);

        while log.messages.len() > self.capacity {
            log.messages.pop_front();
            StoreStats::bump(&self.stats.evicted);
        }

        AppendOutcome::Stored
    }

    /// Attach an annotation to a stored message.
    pub fn annotate(
        &self,
        channel: &str,
        message_id: MessageId,
        annotation: Annotation,
    ) -> Result<AnnotateOutcome, NotFoundError> {
        let not_found = || NotFoundError {
            channel: channel.to_string(),
            message_id,
        };

        let log = self.log(channel).ok_or_else(not_found)?;
        let mut log = log.write();
        let idx = log.position(message_id).ok_or_else(not_found)?;

        let kind = annotation.kind;
        if log.messages[idx].attach(annotation) {
            StoreStats::bump(&self.stats.annotations);
            trace!(channel, id = %message_id, %kind, "annotation applied");
            Ok(AnnotateOutcome::Applied)
        } else {
            StoreStats::bump(&self.stats.duplicate_annotations);
            Ok(AnnotateOutcome::Duplicate)
        }
    }

    /// Hide a message without removing it from the log.
    pub fn soft_delete(
        &self,
        channel: &str,
        message_id: MessageId,
        actor_id: &str,
    ) -> Result<AnnotateOutcome, NotFoundError> {
        self.annotate(channel, message_id, Annotation::delete(actor_id))
    }

    // -- Reads --

    /// The most recent `limit` messages in ascending id order, deleted ones
    /// included.
    pub fn list(&self, channel: &str, limit: usize) -> Vec<Message> {
        let Some(log) = self.log(channel) else {
            return Vec::new();
        };
        let log = log.read();
        log.tail(limit).cloned().collect()
    }

    /// Like [`list`](Self::list) but skips soft-deleted messages.
    pub fn list_visible(&self, channel: &str, limit: usize) -> Vec<Message> {
        let Some(log) = self.log(channel) else {
            return Vec::new();
        };
        let log = log.read();
        let mut visible: Vec<Message> = log
            .messages
            .iter()
            .rev()
            .filter(|m| !m.is_deleted())
            .take(limit)
            .cloned()
            .collect();
        visible.reverse();
        visible
    }

    pub fn get(&self, channel: &str, message_id: MessageId) -> Option<Message> {
        let log = self.log(channel)?;
        let log = log.read();
        log.position(message_id).map(|idx| log.messages[idx].clone())
    }

    pub fn contains(&self, channel: &str, message_id: MessageId) -> bool {
        self.get(channel, message_id).is_some()
    }

    /// Oldest id still retained for `channel`.
    pub fn first_id(&self, channel: &str) -> Option<MessageId> {
        let log = self.log(channel)?;
        let log = log.read();
        log.messages.front().map(|m| m.id)
    }

    pub fn last_id(&self, channel: &str) -> Option<MessageId> {
        let log = self.log(channel)?;
        let log = log.read();
        log.last_id
    }

    pub fn len(&self, channel: &str) -> usize {
        let Some(log) = self.log(channel) else {
            return 0;
        };
        let log = log.read();
        log.messages.len()
    }

    pub fn is_empty(&self, channel: &str) -> bool {
        self.len(channel) == 0
    }

    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Count of messages in `channel` carrying at least one annotation of `kind`.
    pub fn count_annotated(&self, channel: &str, kind: AnnotationKind) -> usize {
        let Some(log) = self.log(channel) else {
            return 0;
        };
        let log = log.read();
        log.messages
            .iter()
            .filter(|m| m.annotations.iter().any(|a| a.kind == kind))
            .count()
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }
}
