use std::collections::{BTreeMap, BTreeSet};

use parley_types::MessageId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSubscription {
    pub channel: String,
    /// Last applied message id. Never moves backward.
    pub cursor: Option<MessageId>,
    pub active: bool,
}

/// Which channels the session is subscribed to and how far each has been
/// applied. One entry per channel; unsubscribing keeps the entry (and its
/// cursor) so a later subscribe resumes where it left off.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    entries: BTreeMap<String, ChannelSubscription>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `channel` active. Returns `true` if it was not active before.
    pub fn subscribe(&mut self, channel: &str) -> bool {
        let entry = self
            .entries
            .entry(channel.to_string())
            .or_insert_with(|| ChannelSubscription {
                channel: channel.to_string(),
                cursor: None,
                active: false,
            });
        let activated = !entry.active;
        entry.active = true;
        activated
    }

    /// Mark `channel` inactive. Returns `true` if it was active before.
    pub fn unsubscribe(&mut self, channel: &str) -> bool {
        match self.entries.get_mut(channel) {
            Some(entry) if entry.active => {
                entry.active = false;
                true
            }
            _ => false,
        }
    }

    pub fn list_active(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .filter(|e| e.active)
            .map(|e| e.channel.clone())
            .collect()
    }

    pub fn is_active(&self, channel: &str) -> bool {
        self.entries.get(channel).is_some_and(|e| e.active)
    }

    pub fn cursor(&self, channel: &str) -> Option<MessageId> {
        self.entries.get(channel).and_then(|e| e.cursor)
    }

    /// Move the cursor forward to `id`. Returns `false` (and leaves the
    /// cursor alone) if `id` is not past it or the channel is unknown.
    pub fn advance_cursor(&mut self, channel: &str, id: MessageId) -> bool {
        let Some(entry) = self.entries.get_mut(channel) else {
            return false;
        };
        if entry.cursor.is_some_and(|cursor| id <= cursor) {
            return false;
        }
        entry.cursor = Some(id);
        true
    }

    pub fn get(&self, channel: &str) -> Option<&ChannelSubscription> {
        self.entries.get(channel)
    }

    /// Deactivate everything. Returns the channels that were active.
    pub fn deactivate_all(&mut self) -> Vec<String> {
        let mut were_active = Vec::new();
        for entry in self.entries.values_mut().filter(|e| e.active) {
            entry.active = false;
            were_active.push(entry.channel.clone());
        }
        were_active
    }
}
