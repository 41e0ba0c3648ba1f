use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::timer::Deadline;

/// A transient, user-visible error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: u64,
    pub channel_id: Option<Uuid>,
    pub text: String,
    expires: Deadline,
}

/// Notices that dismiss themselves after `ttl` or when the user closes them.
#[derive(Debug)]
pub struct NoticeBoard {
    ttl: Duration,
    next_id: u64,
    notices: Vec<Notice>,
}

impl NoticeBoard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            next_id: 0,
            notices: Vec::new(),
        }
    }

    pub fn push(&mut self, channel_id: Option<Uuid>, text: impl Into<String>, now: Instant) -> u64 {
        self.next_id += 1;
        let mut expires = Deadline::new();
        expires.schedule(now, self.ttl);
        self.notices.push(Notice {
            id: self.next_id,
            channel_id,
            text: text.into(),
            expires,
        });
        self.next_id
    }

    pub fn dismiss(&mut self, id: u64) -> bool {
        let before = self.notices.len();
        self.notices.retain(|n| n.id != id);
        self.notices.len() != before
    }

    /// Notices still visible at `now`, oldest first.
    pub fn active(&mut self, now: Instant) -> Vec<Notice> {
        self.notices.retain(|n| !n.expires.is_due(now));
        self.notices.clone()
    }
}
