//! Optimistic reaction toggles.
//!
//! Per (message, emoji) pair:
//!
//! ```text
//! Absent --toggle--> OptimisticAdding --ok--> Added
//! Added  --toggle--> OptimisticRemoving --ok--> Absent
//! OptimisticAdding   --err--> Absent
//! OptimisticRemoving --err--> Added
//! ```
//!
//! Only one toggle per pair is in flight; later ones wait on the pair's slot
//! in FIFO order. The server's reaction set always replaces the local one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tracing::debug;
use uuid::Uuid;

use crate::error::ChatError;
use crate::lock;
use crate::message::ReactionSet;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReactionKey {
    pub message_id: Uuid,
    pub emoji: String,
}

impl ReactionKey {
    pub fn new(message_id: Uuid, emoji: impl Into<String>) -> Self {
        Self {
            message_id,
            emoji: emoji.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionPhase {
    Absent,
    OptimisticAdding,
    Added,
    OptimisticRemoving,
}

impl ReactionPhase {
    pub fn settled(viewer_has_reacted: bool) -> Self {
        if viewer_has_reacted { Self::Added } else { Self::Absent }
    }

    /// Optimistic edge taken by a toggle.
    pub fn toggled(self) -> Self {
        match self {
            Self::Absent => Self::OptimisticAdding,
            Self::Added => Self::OptimisticRemoving,
            in_flight => in_flight,
        }
    }

    /// Edge taken when the server call fails.
    pub fn rolled_back(self) -> Self {
        match self {
            Self::OptimisticAdding => Self::Absent,
            Self::OptimisticRemoving => Self::Added,
            settled => settled,
        }
    }

    /// Whether the viewer is (or is about to be) among the reactors.
    pub fn viewer_reacted(self) -> bool {
        matches!(self, Self::OptimisticAdding | Self::Added)
    }

    fn apply(self, reactions: &mut ReactionSet, emoji: &str, viewer: Uuid) {
        if self.viewer_reacted() {
            reactions.add(emoji, viewer);
        } else {
            reactions.remove(emoji, viewer);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    Added,
    Removed,
    /// The server's answer differs from the optimistic guess because someone
    /// else acted concurrently; the server state was adopted.
    RaceReconciled { viewer_has_reacted: bool },
    /// The server call failed and the optimistic change was undone.
    RolledBack { error: ChatError },
}

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Default)]
pub struct ReactionEngine {
    slots: Mutex<HashMap<ReactionKey, Slot>>,
    in_flight: Mutex<HashMap<ReactionKey, ReactionPhase>>,
}

/// Exclusive right to toggle one (message, emoji) pair.
pub struct ToggleSlot<'a> {
    engine: &'a ReactionEngine,
    key: ReactionKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ToggleSlot<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = lock(&self.engine.slots);
        if slots
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.key);
        }
    }
}

impl ReactionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other toggle for `key` is in flight.
    pub async fn acquire(&self, key: &ReactionKey) -> ToggleSlot<'_> {
        let slot = lock(&self.slots).entry(key.clone()).or_default().clone();
        let guard = slot.lock_owned().await;
        ToggleSlot {
            engine: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Apply the optimistic change of a toggle and record the in-flight phase.
    pub fn begin(&self, key: &ReactionKey, reactions: &mut ReactionSet, viewer: Uuid) -> ReactionPhase {
        let phase = ReactionPhase::settled(reactions.has_reacted(&key.emoji, viewer)).toggled();
        phase.apply(reactions, &key.emoji, viewer);
        lock(&self.in_flight).insert(key.clone(), phase);
        phase
    }

    /// Adopt the server's reaction set. Optimistic changes of other pairs on
    /// the same message that are still in flight are laid back on top.
    pub fn settle(
        &self,
        key: &ReactionKey,
        phase: ReactionPhase,
        reactions: &mut ReactionSet,
        server: ReactionSet,
        viewer: Uuid,
    ) -> ToggleOutcome {
        let has_reacted = server.has_reacted(&key.emoji, viewer);
        lock(&self.in_flight).remove(key);
        self.adopt_server(key.message_id, reactions, server, viewer);

        match (phase.viewer_reacted(), has_reacted) {
            (true, true) => ToggleOutcome::Added,
            (false, false) => ToggleOutcome::Removed,
            (_, viewer_has_reacted) => {
                debug!(
                    "Reaction {} on {} settled to {} after a concurrent change",
                    key.emoji, key.message_id, viewer_has_reacted
                );
                ToggleOutcome::RaceReconciled { viewer_has_reacted }
            }
        }
    }

    /// Replace a message's reactions with a server set (toggle response or
    /// pushed update), keeping in-flight toggles on that message visible.
    pub fn adopt_server(&self, message_id: Uuid, reactions: &mut ReactionSet, server: ReactionSet, viewer: Uuid) {
        *reactions = server;
        for (key, phase) in lock(&self.in_flight).iter() {
            if key.message_id == message_id {
                phase.apply(reactions, &key.emoji, viewer);
            }
        }
    }

    /// Undo the optimistic change of a failed toggle.
    pub fn rollback(&self, key: &ReactionKey, phase: ReactionPhase, reactions: &mut ReactionSet, viewer: Uuid) {
        phase.rolled_back().apply(reactions, &key.emoji, viewer);
        lock(&self.in_flight).remove(key);
    }

    /// Forget an in-flight phase whose message left the cache.
    pub fn forget(&self, key: &ReactionKey) {
        lock(&self.in_flight).remove(key);
    }
}
