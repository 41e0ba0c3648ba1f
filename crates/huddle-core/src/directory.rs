use tracing::warn;
use uuid::Uuid;

use huddle_types::models::Channel;

/// The channel list with preview/unread metadata.
///
/// Holds at most one direct-message channel per counterpart, and a
/// channel's kind never changes once seen.
#[derive(Debug, Default)]
pub struct ChannelDirectory {
    channels: Vec<Channel>,
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn get(&self, channel_id: Uuid) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == channel_id)
    }

    pub fn find_direct(&self, counterpart: Uuid) -> Option<&Channel> {
        self.channels
            .iter()
            .find(|c| c.is_direct() && c.counterpart_user_id == Some(counterpart))
    }

    /// Replace the list with a fresh server listing, keeping server order.
    pub fn replace(&mut self, listed: Vec<Channel>) {
        let previous = std::mem::take(&mut self.channels);
        for mut channel in listed {
            if let Some(known) = previous.iter().find(|c| c.id == channel.id) {
                keep_kind(known, &mut channel);
            }
            if channel.is_direct() {
                if let Some(existing) = channel
                    .counterpart_user_id
                    .and_then(|user| self.find_direct(user))
                {
                    warn!(
                        "Skipping duplicate direct channel {} (already have {})",
                        channel.id, existing.id
                    );
                    continue;
                }
            }
            self.channels.push(channel);
        }
    }

    /// Insert or update one channel. A new direct channel replaces any other
    /// entry for the same counterpart.
    pub fn upsert(&mut self, mut channel: Channel) {
        if let Some(idx) = self.channels.iter().position(|c| c.id == channel.id) {
            keep_kind(&self.channels[idx], &mut channel);
            self.channels[idx] = channel;
            return;
        }
        if channel.is_direct() {
            if let Some(user) = channel.counterpart_user_id {
                self.channels
                    .retain(|c| !(c.is_direct() && c.counterpart_user_id == Some(user)));
            }
        }
        self.channels.push(channel);
    }

    pub fn mark_read(&mut self, channel_id: Uuid) {
        if let Some(channel) = self.channels.iter_mut().find(|c| c.id == channel_id) {
            channel.unread_count = 0;
        }
    }

    /// Update the preview; `unread` also bumps the unread counter.
    pub fn record_message(&mut self, channel_id: Uuid, summary: String, unread: bool) {
        if let Some(channel) = self.channels.iter_mut().find(|c| c.id == channel_id) {
            channel.last_message_summary = Some(summary);
            if unread {
                channel.unread_count = channel.unread_count.saturating_add(1);
            }
        }
    }
}

fn keep_kind(known: &Channel, incoming: &mut Channel) {
    if known.kind != incoming.kind {
        warn!(
            "Channel {} changed kind from {:?} to {:?}; keeping {:?}",
            known.id, known.kind, incoming.kind, known.kind
        );
        incoming.kind = known.kind;
        incoming.counterpart_user_id = known.counterpart_user_id;
    }
}
