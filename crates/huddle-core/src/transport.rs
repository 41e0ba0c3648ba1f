use async_trait::async_trait;
use uuid::Uuid;

use huddle_types::api::{DirectPage, MessagePage, MessageResponse, ReactionGroup, SendMessageRequest, SendTarget};
use huddle_types::models::{Channel, RosterMember};

use crate::error::TransportError;

/// Server endpoints the messaging core consumes.
///
/// Implementations authenticate on their own; the core only ever sees the
/// viewer's user id.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn list_channels(&self) -> Result<Vec<Channel>, TransportError>;

    /// One page of history, oldest first. `before` is the oldest id already
    /// held; `None` asks for the newest page.
    async fn fetch_page(
        &self,
        channel_id: Uuid,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<MessagePage, TransportError>;

    /// Newest page of the DM with `other_user`, creating the channel if needed.
    async fn fetch_direct_page(&self, other_user: Uuid, limit: u32) -> Result<DirectPage, TransportError>;

    async fn send_message(
        &self,
        target: SendTarget,
        request: SendMessageRequest,
    ) -> Result<MessageResponse, TransportError>;

    /// Toggle the caller's `emoji` on a message; returns the full set afterwards.
    async fn toggle_reaction(
        &self,
        channel_id: Uuid,
        message_id: Uuid,
        emoji: &str,
    ) -> Result<Vec<ReactionGroup>, TransportError>;

    async fn fetch_roster(&self, institution_id: Uuid) -> Result<Vec<RosterMember>, TransportError>;

    /// Best effort; servers without a typing endpoint can ignore it.
    async fn notify_typing(&self, _channel_id: Uuid) -> Result<(), TransportError> {
        Ok(())
    }
}
