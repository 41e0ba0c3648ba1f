use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::timer::Throttle;

/// A remote user's "is typing" signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSignal {
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingSummary {
    Nobody,
    One(String),
    Several(usize),
}

impl fmt::Display for TypingSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nobody => Ok(()),
            Self::One(name) => write!(f, "{} is typing…", name),
            Self::Several(count) => write!(f, "{} people are typing…", count),
        }
    }
}

/// Local emission throttling and remote signal aggregation, per channel.
#[derive(Debug)]
pub struct TypingPresence {
    viewer: Uuid,
    emit_interval: Duration,
    expiry: Duration,
    local: HashMap<Uuid, Throttle>,
    /// channel_id -> signals in order of first arrival
    remote: HashMap<Uuid, Vec<TypingSignal>>,
}

impl TypingPresence {
    pub fn new(viewer: Uuid, emit_interval: Duration, expiry: Duration) -> Self {
        Self {
            viewer,
            emit_interval,
            expiry,
            local: HashMap::new(),
            remote: HashMap::new(),
        }
    }

    /// Called on every composer keystroke. Returns true when a typing signal
    /// should go out now.
    pub fn keystroke(&mut self, channel_id: Uuid, now: Instant) -> bool {
        let interval = self.emit_interval;
        self.local
            .entry(channel_id)
            .or_insert_with(|| Throttle::new(interval))
            .try_fire(now)
    }

    /// After a send the next keystroke starts a fresh burst.
    pub fn message_sent(&mut self, channel_id: Uuid) {
        if let Some(throttle) = self.local.get_mut(&channel_id) {
            throttle.reset();
        }
    }

    /// Record or renew a remote signal. Our own echo is ignored.
    pub fn receive(&mut self, channel_id: Uuid, user_id: Uuid, display_name: &str, now: Instant) {
        if user_id == self.viewer {
            return;
        }
        let expires_at = now + self.expiry;
        let signals = self.remote.entry(channel_id).or_default();
        match signals.iter_mut().find(|s| s.user_id == user_id) {
            Some(signal) => {
                signal.expires_at = expires_at;
                signal.display_name = display_name.to_string();
            }
            None => signals.push(TypingSignal {
                channel_id,
                user_id,
                display_name: display_name.to_string(),
                expires_at,
            }),
        }
    }

    /// A user's message arrived, so they are done typing it.
    pub fn clear_user(&mut self, channel_id: Uuid, user_id: Uuid) {
        if let Some(signals) = self.remote.get_mut(&channel_id) {
            signals.retain(|s| s.user_id != user_id);
        }
    }

    /// Live signals for a channel; expired ones are pruned first.
    pub fn typists(&mut self, channel_id: Uuid, now: Instant) -> Vec<TypingSignal> {
        let Some(signals) = self.remote.get_mut(&channel_id) else {
            return Vec::new();
        };
        signals.retain(|s| s.expires_at > now);
        let live = signals.clone();
        if signals.is_empty() {
            self.remote.remove(&channel_id);
        }
        live
    }

    pub fn summary(&mut self, channel_id: Uuid, now: Instant) -> TypingSummary {
        let mut typists = self.typists(channel_id, now);
        match typists.len() {
            0 => TypingSummary::Nobody,
            1 => TypingSummary::One(typists.remove(0).display_name),
            n => TypingSummary::Several(n),
        }
    }

    /// Prune expired signals in every channel. Returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        self.remote.retain(|_, signals| {
            let before = signals.len();
            signals.retain(|s| s.expires_at > now);
            removed += before - signals.len();
            !signals.is_empty()
        });
        removed
    }

    /// Earliest pending expiry, for scheduling the next sweep.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.remote
            .values()
            .flat_map(|signals| signals.iter().map(|s| s.expires_at))
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(viewer: Uuid) -> TypingPresence {
        TypingPresence::new(viewer, Duration::from_secs(3), Duration::from_secs(6))
    }

    #[tokio::test(start_paused = true)]
    async fn keystrokes_are_throttled_per_channel() {
        let mut typing = presence(Uuid::new_v4());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let t0 = Instant::now();

        assert!(typing.keystroke(a, t0));
        assert!(!typing.keystroke(a, t0 + Duration::from_secs(1)));
        assert!(typing.keystroke(b, t0 + Duration::from_secs(1)));
        assert!(typing.keystroke(a, t0 + Duration::from_secs(4)));

        typing.message_sent(a);
        assert!(typing.keystroke(a, t0 + Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn signal_expires_without_renewal() {
        let mut typing = presence(Uuid::new_v4());
        let channel = Uuid::new_v4();
        let anna = Uuid::new_v4();

        typing.receive(channel, anna, "Anna", Instant::now());
        assert_eq!(
            typing.summary(channel, Instant::now()),
            TypingSummary::One("Anna".into())
        );

        tokio::time::advance(Duration::from_secs(7)).await;
        assert_eq!(typing.summary(channel, Instant::now()), TypingSummary::Nobody);
        assert!(typing.next_expiry().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_resets_expiry_without_duplicating() {
        let mut typing = presence(Uuid::new_v4());
        let channel = Uuid::new_v4();
        let anna = Uuid::new_v4();
        let t0 = Instant::now();

        typing.receive(channel, anna, "Anna", t0);
        typing.receive(channel, anna, "Anna", t0 + Duration::from_secs(4));
        let live = typing.typists(channel, t0 + Duration::from_secs(8));
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].expires_at, t0 + Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn summary_counts_several_and_ignores_viewer() {
        let viewer = Uuid::new_v4();
        let mut typing = presence(viewer);
        let channel = Uuid::new_v4();
        let now = Instant::now();

        typing.receive(channel, viewer, "Me", now);
        assert_eq!(typing.summary(channel, now), TypingSummary::Nobody);

        typing.receive(channel, Uuid::new_v4(), "Anna", now);
        typing.receive(channel, Uuid::new_v4(), "Bert", now);
        let summary = typing.summary(channel, now);
        assert_eq!(summary, TypingSummary::Several(2));
        assert_eq!(summary.to_string(), "2 people are typing…");
        assert_eq!(TypingSummary::One("Anna".into()).to_string(), "Anna is typing…");
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_prunes_all_channels() {
        let mut typing = presence(Uuid::new_v4());
        let t0 = Instant::now();
        typing.receive(Uuid::new_v4(), Uuid::new_v4(), "Anna", t0);
        typing.receive(Uuid::new_v4(), Uuid::new_v4(), "Bert", t0 + Duration::from_secs(3));

        assert_eq!(typing.next_expiry(), Some(t0 + Duration::from_secs(6)));
        assert_eq!(typing.sweep(t0 + Duration::from_secs(6)), 1);
        assert_eq!(typing.sweep(t0 + Duration::from_secs(9)), 1);
        assert!(typing.next_expiry().is_none());
    }
}
