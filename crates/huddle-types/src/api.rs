use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AttachmentRef, Channel, ReplyPreview};

// -- Messages --

/// Query string for page fetches. `before` is the id of the oldest message
/// the client already holds; omit it for the newest page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Uuid>,
}

fn default_limit() -> u32 {
    50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub author_id: Uuid,
    pub author_name: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub attachment: Option<AttachmentRef>,
    #[serde(default)]
    pub reply_to: Option<ReplyPreview>,
    #[serde(default)]
    pub reactions: Vec<ReactionGroup>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub edited_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Echo of the client correlation id, present only on send responses.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

/// A page of channel history, ordered oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessageResponse>,
    pub has_more: bool,
}

/// Response of the direct-message page fetch: the resolved (or newly
/// created) DM channel together with its newest page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectPage {
    pub channel: Channel,
    pub page: MessagePage,
}

/// Where a new message goes. Direct sends address the other participant and
/// let the server resolve the DM channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum SendTarget {
    Channel(Uuid),
    Direct(Uuid),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub attachment: Option<OutgoingAttachment>,
    #[serde(default)]
    pub reply_to_id: Option<Uuid>,
    pub correlation_id: Uuid,
}

/// File payload of a send. `data` is standard base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingAttachment {
    pub name: String,
    #[serde(default)]
    pub mime: Option<String>,
    pub data: String,
}

// -- Reactions --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<Uuid>,
}

/// Authoritative reaction set of one message after a toggle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionSetResponse {
    pub message_id: Uuid,
    pub reactions: Vec<ReactionGroup>,
}
