use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{MessageResponse, ReactionGroup};
use crate::models::Channel;

/// Server-originated events. Nothing in the request/response API produces
/// these; they are accepted from whatever push transport a deployment adds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChatEvent {
    /// A message was posted, possibly by this very client
    MessageCreate { message: MessageResponse },

    /// A user started typing
    TypingStart {
        channel_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    /// The reaction set of a message changed
    ReactionsUpdate {
        channel_id: Uuid,
        message_id: Uuid,
        reactions: Vec<ReactionGroup>,
    },

    /// Channel metadata (preview, unread count, name) changed
    ChannelUpdate { channel: Channel },
}

impl ChatEvent {
    /// Channel the event belongs to. For `ChannelUpdate` that is the updated channel itself.
    pub fn channel_id(&self) -> Uuid {
        match self {
            Self::MessageCreate { message } => message.channel_id,
            Self::TypingStart { channel_id, .. } => *channel_id,
            Self::ReactionsUpdate { channel_id, .. } => *channel_id,
            Self::ChannelUpdate { channel } => channel.id,
        }
    }
}
