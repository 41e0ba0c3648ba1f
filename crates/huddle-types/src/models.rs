use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    GroupChat,
    InstitutionChat,
    DirectMessage,
}

/// A conversation context as listed by the server.
///
/// `counterpart_user_id` is only set for direct messages and names the other
/// participant from the viewer's point of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub kind: ChannelKind,
    pub display_name: String,
    #[serde(default)]
    pub counterpart_user_id: Option<Uuid>,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    #[serde(default)]
    pub last_message_summary: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub member_count: Option<u32>,
}

impl Channel {
    pub fn is_direct(&self) -> bool {
        self.kind == ChannelKind::DirectMessage
    }
}

/// One entry of an institution roster, used for mentions and DM lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterMember {
    pub id: Uuid,
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
}

/// A file already stored server-side and referenced by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub url: String,
    pub name: String,
    /// MIME type when the uploader declared one, otherwise the file extension.
    pub mime_or_ext: String,
}

/// Preview of the message being replied to, denormalized onto the reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub id: Uuid,
    pub author_name: String,
    pub body_excerpt: String,
}
