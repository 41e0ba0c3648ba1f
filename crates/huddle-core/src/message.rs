use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use huddle_types::api::{MessageResponse, ReactionGroup};
use huddle_types::models::{AttachmentRef, ReplyPreview};

use crate::attachment::ValidatedAttachment;

/// Client-generated id tying an optimistic mutation to its server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Saved(Uuid),
    Pending(CorrelationId),
}

impl MessageId {
    pub fn saved(&self) -> Option<Uuid> {
        match self {
            Self::Saved(id) => Some(*id),
            Self::Pending(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    Delivered,
    Pending,
    Failed { reason: String },
}

/// One emoji on a message. The count is always the size of the user set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub emoji: String,
    user_ids: BTreeSet<Uuid>,
}

impl Reaction {
    pub fn new(emoji: impl Into<String>, user_ids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            emoji: emoji.into(),
            user_ids: user_ids.into_iter().collect(),
        }
    }

    pub fn count(&self) -> usize {
        self.user_ids.len()
    }

    pub fn user_ids(&self) -> &BTreeSet<Uuid> {
        &self.user_ids
    }

    pub fn has_reacted(&self, user_id: Uuid) -> bool {
        self.user_ids.contains(&user_id)
    }
}

/// Reactions of a message in order of first use. Zero-count entries are
/// never kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReactionSet {
    reactions: Vec<Reaction>,
}

impl ReactionSet {
    pub fn iter(&self) -> impl Iterator<Item = &Reaction> {
        self.reactions.iter()
    }

    pub fn get(&self, emoji: &str) -> Option<&Reaction> {
        self.reactions.iter().find(|r| r.emoji == emoji)
    }

    pub fn is_empty(&self) -> bool {
        self.reactions.is_empty()
    }

    pub fn has_reacted(&self, emoji: &str, user_id: Uuid) -> bool {
        self.get(emoji).is_some_and(|r| r.has_reacted(user_id))
    }

    /// Add `user_id` under `emoji`, appending a new entry if the emoji is new.
    pub fn add(&mut self, emoji: &str, user_id: Uuid) -> bool {
        match self.reactions.iter_mut().find(|r| r.emoji == emoji) {
            Some(reaction) => reaction.user_ids.insert(user_id),
            None => {
                self.reactions.push(Reaction::new(emoji, [user_id]));
                true
            }
        }
    }

    /// Remove `user_id` from `emoji`, dropping the entry once it is empty.
    pub fn remove(&mut self, emoji: &str, user_id: Uuid) -> bool {
        let Some(idx) = self.reactions.iter().position(|r| r.emoji == emoji) else {
            return false;
        };
        let removed = self.reactions[idx].user_ids.remove(&user_id);
        if self.reactions[idx].user_ids.is_empty() {
            self.reactions.remove(idx);
        }
        removed
    }

    /// Build from server groups, keeping their order. Empty groups are
    /// skipped and a count that disagrees with the user list is logged; the
    /// user list wins.
    pub fn from_groups(groups: Vec<ReactionGroup>) -> Self {
        let mut set = Self::default();
        for group in groups {
            if group.count != group.user_ids.len() {
                warn!(
                    "Reaction {} reports count {} for {} users",
                    group.emoji,
                    group.count,
                    group.user_ids.len()
                );
            }
            if group.user_ids.is_empty() {
                continue;
            }
            match set.reactions.iter_mut().find(|r| r.emoji == group.emoji) {
                Some(existing) => existing.user_ids.extend(group.user_ids),
                None => set.reactions.push(Reaction::new(group.emoji, group.user_ids)),
            }
        }
        set
    }
}

/// The authenticated user of this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: Uuid,
    pub display_name: String,
}

/// Message as held in the client cache.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: Uuid,
    pub author_id: Uuid,
    pub author_name: String,
    pub body: Option<String>,
    pub attachment: Option<AttachmentRef>,
    pub reactions: ReactionSet,
    pub reply_to: Option<ReplyPreview>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub status: MessageStatus,
    /// Draft the optimistic entry was built from; dropped on reconciliation.
    pub(crate) draft: Option<Draft>,
}

impl Message {
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self.id {
            MessageId::Pending(correlation_id) => Some(correlation_id),
            MessageId::Saved(_) => None,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        matches!(self.id, MessageId::Pending(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, MessageStatus::Failed { .. })
    }

    /// Historical ordering: `(created_at, id)` ascending.
    pub fn history_cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.saved().cmp(&other.id.saved()))
    }

    /// Short text for channel previews.
    pub fn summary(&self) -> String {
        match (&self.body, &self.attachment) {
            (Some(body), _) if !body.trim().is_empty() => excerpt(body, 80),
            (_, Some(attachment)) => attachment.name.clone(),
            _ => String::new(),
        }
    }
}

impl From<MessageResponse> for Message {
    fn from(resp: MessageResponse) -> Self {
        Self {
            id: MessageId::Saved(resp.id),
            channel_id: resp.channel_id,
            author_id: resp.author_id,
            author_name: resp.author_name,
            body: resp.body,
            attachment: resp.attachment,
            reactions: ReactionSet::from_groups(resp.reactions),
            reply_to: resp.reply_to,
            created_at: resp.created_at,
            edited_at: resp.edited_at,
            status: MessageStatus::Delivered,
            draft: None,
        }
    }
}

/// Everything the composer hands over for one send.
#[derive(Debug, Clone)]
pub struct Draft {
    pub body: Option<String>,
    pub attachment: Option<ValidatedAttachment>,
    pub reply_to: Option<ReplyPreview>,
}

impl Draft {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            attachment: None,
            reply_to: None,
        }
    }

    /// A draft needs non-blank text or an attachment.
    pub fn is_sendable(&self) -> bool {
        self.body.as_deref().is_some_and(|b| !b.trim().is_empty()) || self.attachment.is_some()
    }
}

/// First `max_chars` characters of `text`, with an ellipsis when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
