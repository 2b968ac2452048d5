use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server-assigned message id. Strictly increasing within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// -- Annotations --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    Reaction,
    Flag,
    Delete,
}

impl fmt::Display for AnnotationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reaction => "reaction",
            Self::Flag => "flag",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Metadata attached to a message after the fact. The message body is never
/// touched; moderation state is derived from the annotation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub kind: AnnotationKind,
    pub actor_id: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

impl Annotation {
    pub fn new(kind: AnnotationKind, actor_id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind,
            actor_id: actor_id.into(),
            value: value.into(),
            created_at: Utc::now(),
        }
    }

    pub fn reaction(actor_id: impl Into<String>, emoji: impl Into<String>) -> Self {
        Self::new(AnnotationKind::Reaction, actor_id, emoji)
    }

    pub fn flag(actor_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(AnnotationKind::Flag, actor_id, reason)
    }

    pub fn delete(actor_id: impl Into<String>) -> Self {
        Self::new(AnnotationKind::Delete, actor_id, "deleted")
    }

    /// Whether `other` would be a repeat of this annotation.
    ///
    /// Any two deletes collide (first one wins). Reactions and flags collide
    /// only on the same actor and value.
    pub fn collides_with(&self, other: &Annotation) -> bool {
        match (self.kind, other.kind) {
            (AnnotationKind::Delete, AnnotationKind::Delete) => true,
            (a, b) if a == b => self.actor_id == other.actor_id && self.value == other.value,
            _ => false,
        }
    }
}

// -- Messages --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel: String,
    pub sender_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl Message {
    /// Attach an annotation unless it repeats one already present.
    /// Returns `true` when the annotation was added.
    pub fn attach(&mut self, annotation: Annotation) -> bool {
        if self.annotations.iter().any(|a| a.collides_with(&annotation)) {
            return false;
        }
        self.annotations.push(annotation);
        true
    }

    pub fn is_deleted(&self) -> bool {
        self.deletion().is_some()
    }

    /// The delete annotation that took effect, if any.
    pub fn deletion(&self) -> Option<&Annotation> {
        self.annotations
            .iter()
            .find(|a| a.kind == AnnotationKind::Delete)
    }

    pub fn is_flagged(&self) -> bool {
        self.flags().next().is_some()
    }

    pub fn flags(&self) -> impl Iterator<Item = &Annotation> {
        self.annotations
            .iter()
            .filter(|a| a.kind == AnnotationKind::Flag)
    }

    /// Reactions grouped by emoji, in the order each emoji first appeared.
    pub fn reactions(&self) -> Vec<ReactionGroup> {
        let mut groups: Vec<ReactionGroup> = Vec::new();
        for a in self
            .annotations
            .iter()
            .filter(|a| a.kind == AnnotationKind::Reaction)
        {
            match groups.iter_mut().find(|g| g.emoji == a.value) {
                Some(group) => {
                    group.count += 1;
                    group.actor_ids.push(a.actor_id.clone());
                }
                None => groups.push(ReactionGroup {
                    emoji: a.value.clone(),
                    count: 1,
                    actor_ids: vec![a.actor_id.clone()],
                }),
            }
        }
        groups
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub actor_ids: Vec<String>,
}
