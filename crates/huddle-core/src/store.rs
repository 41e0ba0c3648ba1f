//! Per-channel message cache.
//!
//! Each channel's entry sits behind its own mutex inside a channel-keyed map,
//! and every mutation goes through `MessageStore`. Locks are never held
//! across an await; the orchestrator fetches first and applies afterwards.
//!
//! Entry layout: a history prefix sorted by `(created_at, id)`, followed by
//! optimistic sends in the order they were made. Pagination only extends the
//! prefix backward and reconciliation replaces an optimistic message in
//! place, so once the first page is in nothing is reordered after it is shown.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use huddle_types::models::AttachmentRef;

use crate::error::{ChatError, Result};
use crate::message::{CorrelationId, Draft, Message, MessageId, MessageStatus, ReactionSet, Viewer};
use crate::{lock, read_lock, write_lock};

/// Point-in-time copy of a channel's cache entry.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub oldest_loaded_id: Option<Uuid>,
    pub is_loading: bool,
}

#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// Nothing cached; a first-page fetch is needed.
    Missing,
    /// The first page is being fetched.
    Loading,
    Ready(CacheSnapshot),
}

/// Identifies one outstanding fetch. Results are applied only while the
/// entry still carries the same generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    pub channel_id: Uuid,
    pub generation: u64,
    /// Page cursor for older-page fetches.
    pub before: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OlderLoad {
    NotLoaded,
    NoMore,
    AlreadyLoading,
    Start(LoadTicket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The optimistic entry now carries the server id.
    Delivered,
    /// The optimistic entry is kept and marked failed.
    Failed,
    /// The server message was already in the cache (e.g. pushed before the
    /// send response); the optimistic entry was folded into it.
    AlreadyPresent,
    /// No matching optimistic entry, e.g. after an invalidate.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    Inserted,
    Updated,
    /// Matched an optimistic send by correlation id.
    Reconciled,
    /// Channel not cached; the next fetch will include the message.
    Ignored,
}

#[derive(Debug)]
struct CacheEntry {
    messages: Vec<Message>,
    has_more: bool,
    oldest_loaded_id: Option<Uuid>,
    /// First page outstanding.
    is_loading: bool,
    loading_older: bool,
    /// First page has been applied.
    loaded: bool,
    generation: u64,
}

impl CacheEntry {
    fn new(generation: u64) -> Self {
        Self {
            messages: Vec::new(),
            has_more: true,
            oldest_loaded_id: None,
            is_loading: true,
            loading_older: false,
            loaded: false,
            generation,
        }
    }

    fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            messages: self.messages.clone(),
            has_more: self.has_more,
            oldest_loaded_id: self.oldest_loaded_id,
            is_loading: self.is_loading || self.loading_older,
        }
    }

    fn position_saved(&self, id: Uuid) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.id == MessageId::Saved(id))
    }

    fn position_pending(&self, correlation_id: CorrelationId) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.id == MessageId::Pending(correlation_id))
    }

    /// End of the sorted history prefix: the first message still awaiting
    /// (or having failed) reconciliation.
    fn history_end(&self) -> usize {
        self.messages
            .iter()
            .position(|m| m.is_optimistic())
            .unwrap_or(self.messages.len())
    }

    fn saved_ids(&self) -> HashSet<Uuid> {
        self.messages.iter().filter_map(|m| m.id.saved()).collect()
    }

    fn refresh_oldest(&mut self) {
        self.oldest_loaded_id = self.messages.iter().find_map(|m| m.id.saved());
    }

    /// Insert a delivered message into the history prefix at its sorted slot.
    fn insert_history(&mut self, message: Message) {
        let end = self.history_end();
        let pos = self.messages[..end]
            .partition_point(|m| m.history_cmp(&message) != Ordering::Greater);
        self.messages.insert(pos, message);
    }

    /// Replace the optimistic message at `idx` with the server's version,
    /// dropping any other copy of the same server id.
    fn adopt_at(&mut self, mut idx: usize, server: Message) -> Reconciled {
        let mut outcome = Reconciled::Delivered;
        if let Some(saved_id) = server.id.saved() {
            if let Some(dup) = self.position_saved(saved_id) {
                self.messages.remove(dup);
                if dup < idx {
                    idx -= 1;
                }
                outcome = Reconciled::AlreadyPresent;
            }
        }
        self.messages[idx] = server;
        if self.oldest_loaded_id.is_none() {
            self.refresh_oldest();
        }
        outcome
    }
}

fn sorted_unique(mut page: Vec<Message>, existing: &HashSet<Uuid>) -> Vec<Message> {
    let mut seen = HashSet::new();
    page.retain(|m| match m.id.saved() {
        Some(id) => !existing.contains(&id) && seen.insert(id),
        None => false,
    });
    page.sort_by(|a, b| a.history_cmp(b));
    page
}

/// Channel-keyed arena of cache entries.
#[derive(Debug, Default)]
pub struct MessageStore {
    entries: RwLock<HashMap<Uuid, Arc<Mutex<CacheEntry>>>>,
    next_generation: AtomicU64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, channel_id: Uuid) -> Option<Arc<Mutex<CacheEntry>>> {
        read_lock(&self.entries).get(&channel_id).cloned()
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, AtomicOrdering::Relaxed) + 1
    }

    pub fn get(&self, channel_id: Uuid) -> CacheLookup {
        let Some(entry) = self.entry(channel_id) else {
            return CacheLookup::Missing;
        };
        let entry = lock(&entry);
        match (entry.loaded, entry.is_loading) {
            (true, _) => CacheLookup::Ready(entry.snapshot()),
            (false, true) => CacheLookup::Loading,
            (false, false) => CacheLookup::Missing,
        }
    }

    /// Snapshot regardless of load state, including optimistic messages sent
    /// while the first page was outstanding.
    pub fn snapshot(&self, channel_id: Uuid) -> Option<CacheSnapshot> {
        self.entry(channel_id).map(|entry| lock(&entry).snapshot())
    }

    /// Claim the first-page fetch for a channel. `None` if the channel is
    /// already cached or being fetched.
    pub fn begin_initial_load(&self, channel_id: Uuid) -> Option<LoadTicket> {
        let generation = self.next_generation();
        let mut entries = write_lock(&self.entries);
        match entries.get(&channel_id) {
            Some(existing) => {
                let mut entry = lock(existing);
                if entry.loaded || entry.is_loading {
                    return None;
                }
                entry.is_loading = true;
                entry.generation = generation;
            }
            None => {
                entries.insert(channel_id, Arc::new(Mutex::new(CacheEntry::new(generation))));
            }
        }
        Some(LoadTicket {
            channel_id,
            generation,
            before: None,
        })
    }

    /// Apply a first page. Returns false if the ticket went stale.
    pub fn complete_initial_load(&self, ticket: LoadTicket, page: Vec<Message>, has_more: bool) -> bool {
        let Some(entry) = self.entry(ticket.channel_id) else {
            return false;
        };
        let mut entry = lock(&entry);
        if entry.generation != ticket.generation || !entry.is_loading {
            return false;
        }

        // Server messages that arrived while loading (pushes, sends settled
        // ahead of any still-pending one) join the sorted history. The
        // optimistic tail keeps its order after it.
        let existing = entry.saved_ids();
        let mut messages = sorted_unique(page, &existing);
        let fetched = messages.len();
        let end = entry.history_end();
        let tail = entry.messages.split_off(end);
        messages.append(&mut entry.messages);
        messages.sort_by(|a, b| a.history_cmp(b));
        messages.extend(tail);

        entry.messages = messages;
        entry.has_more = has_more;
        entry.is_loading = false;
        entry.loaded = true;
        entry.refresh_oldest();
        debug!("Loaded {} messages into channel {}", fetched, ticket.channel_id);
        true
    }

    /// Give up on a first-page fetch (cancelled or failed). The entry is
    /// dropped unless it holds optimistic sends.
    pub fn abandon_initial_load(&self, ticket: LoadTicket) {
        let mut entries = write_lock(&self.entries);
        let Some(existing) = entries.get(&ticket.channel_id) else {
            return;
        };
        let remove = {
            let mut entry = lock(existing);
            if entry.generation != ticket.generation || entry.loaded {
                return;
            }
            entry.is_loading = false;
            entry.messages.is_empty()
        };
        if remove {
            entries.remove(&ticket.channel_id);
        }
    }

    /// Claim an older-page fetch. At most one is outstanding per channel.
    pub fn begin_load_older(&self, channel_id: Uuid) -> OlderLoad {
        let Some(entry) = self.entry(channel_id) else {
            return OlderLoad::NotLoaded;
        };
        let mut entry = lock(&entry);
        if !entry.loaded {
            return OlderLoad::NotLoaded;
        }
        if entry.loading_older {
            return OlderLoad::AlreadyLoading;
        }
        let Some(before) = entry.oldest_loaded_id.filter(|_| entry.has_more) else {
            return OlderLoad::NoMore;
        };
        entry.loading_older = true;
        OlderLoad::Start(LoadTicket {
            channel_id,
            generation: entry.generation,
            before: Some(before),
        })
    }

    /// Prepend an older page, skipping ids already cached. Returns the number
    /// of messages added, or `None` if the ticket went stale.
    pub fn complete_load_older(
        &self,
        ticket: LoadTicket,
        page: Vec<Message>,
        has_more: bool,
    ) -> Option<usize> {
        let entry = self.entry(ticket.channel_id)?;
        let mut entry = lock(&entry);
        if entry.generation != ticket.generation || !entry.loading_older {
            return None;
        }

        let existing = entry.saved_ids();
        let mut messages = sorted_unique(page, &existing);
        let added = messages.len();
        messages.append(&mut entry.messages);

        entry.messages = messages;
        entry.has_more = has_more;
        entry.loading_older = false;
        entry.refresh_oldest();
        Some(added)
    }

    pub fn abandon_load_older(&self, ticket: LoadTicket) {
        if let Some(entry) = self.entry(ticket.channel_id) {
            let mut entry = lock(&entry);
            if entry.generation == ticket.generation {
                entry.loading_older = false;
            }
        }
    }

    /// Append a pending message built from `draft` at the tail.
    pub fn append_optimistic(
        &self,
        channel_id: Uuid,
        viewer: &Viewer,
        draft: Draft,
        now: DateTime<Utc>,
    ) -> Result<CorrelationId> {
        let entry = self
            .entry(channel_id)
            .ok_or(ChatError::ChannelNotLoaded(channel_id))?;
        let correlation_id = CorrelationId::new();

        let attachment = draft.attachment.as_ref().map(|file| AttachmentRef {
            url: String::new(),
            name: file.name().to_string(),
            mime_or_ext: file.mime_or_ext(),
        });
        let message = Message {
            id: MessageId::Pending(correlation_id),
            channel_id,
            author_id: viewer.user_id,
            author_name: viewer.display_name.clone(),
            body: draft.body.clone(),
            attachment,
            reactions: ReactionSet::default(),
            reply_to: draft.reply_to.clone(),
            created_at: now,
            edited_at: None,
            status: MessageStatus::Pending,
            draft: Some(draft),
        };

        lock(&entry).messages.push(message);
        debug!("Queued optimistic message {} in channel {}", correlation_id, channel_id);
        Ok(correlation_id)
    }

    /// Settle an optimistic message. Success swaps in the server message at
    /// the same position; failure keeps it, marked failed.
    pub fn reconcile(
        &self,
        channel_id: Uuid,
        correlation_id: CorrelationId,
        outcome: std::result::Result<Message, String>,
    ) -> Reconciled {
        let Some(entry) = self.entry(channel_id) else {
            return Reconciled::Unknown;
        };
        let mut entry = lock(&entry);
        let Some(idx) = entry.position_pending(correlation_id) else {
            // A push may already have reconciled it
            if let Ok(server) = &outcome {
                if let Some(saved_id) = server.id.saved() {
                    if entry.position_saved(saved_id).is_some() {
                        return Reconciled::AlreadyPresent;
                    }
                }
            }
            debug!("No optimistic message {} in channel {}", correlation_id, channel_id);
            return Reconciled::Unknown;
        };

        match outcome {
            Ok(server) => entry.adopt_at(idx, server),
            Err(reason) => {
                entry.messages[idx].status = MessageStatus::Failed { reason };
                Reconciled::Failed
            }
        }
    }

    /// Remove a failed message and hand back its draft.
    pub fn take_failed(&self, channel_id: Uuid, correlation_id: CorrelationId) -> Option<Draft> {
        let entry = self.entry(channel_id)?;
        let mut entry = lock(&entry);
        let idx = entry.position_pending(correlation_id)?;
        if !entry.messages[idx].is_failed() {
            return None;
        }
        entry.messages.remove(idx).draft
    }

    /// Apply a server message that did not come from a page fetch (push
    /// delivery or refresh). `correlation_id` is the echo of our own send.
    pub fn ingest(
        &self,
        channel_id: Uuid,
        message: Message,
        correlation_id: Option<CorrelationId>,
    ) -> Ingested {
        let Some(entry) = self.entry(channel_id) else {
            return Ingested::Ignored;
        };
        let mut entry = lock(&entry);

        if let Some(idx) = correlation_id.and_then(|cid| entry.position_pending(cid)) {
            entry.adopt_at(idx, message);
            return Ingested::Reconciled;
        }

        let Some(saved_id) = message.id.saved() else {
            return Ingested::Ignored;
        };
        if let Some(idx) = entry.position_saved(saved_id) {
            entry.messages[idx] = message;
            return Ingested::Updated;
        }
        if !entry.loaded {
            // The outstanding first page will carry it
            return Ingested::Ignored;
        }

        entry.insert_history(message);
        if entry.oldest_loaded_id.is_none() {
            entry.refresh_oldest();
        }
        Ingested::Inserted
    }

    /// Merge the newest page after a refetch. When none of it overlaps the
    /// cached history and more exists, the cache can no longer be a gap-free
    /// suffix, so the history is replaced while optimistic sends are kept.
    /// Replacing the history also makes an outstanding older-page fetch stale.
    pub fn merge_latest(&self, channel_id: Uuid, page: Vec<Message>, has_more: bool) -> usize {
        let Some(entry) = self.entry(channel_id) else {
            return 0;
        };
        let mut entry = lock(&entry);
        if !entry.loaded {
            return 0;
        }

        let cached = entry.saved_ids();
        let overlaps = page
            .iter()
            .any(|m| m.id.saved().is_some_and(|id| cached.contains(&id)));
        if !overlaps && has_more && !cached.is_empty() {
            debug!("Refetch of channel {} left a gap, replacing history", channel_id);
            entry.messages.retain(|m| m.is_optimistic());
            entry.has_more = true;
            entry.generation = self.next_generation();
            entry.loading_older = false;
        }

        let mut added = 0;
        for message in page {
            let Some(saved_id) = message.id.saved() else {
                continue;
            };
            match entry.position_saved(saved_id) {
                Some(idx) => entry.messages[idx] = message,
                None => {
                    entry.insert_history(message);
                    added += 1;
                }
            }
        }
        entry.refresh_oldest();
        added
    }

    /// Run `f` on a cached, delivered message.
    pub fn with_message<R>(
        &self,
        channel_id: Uuid,
        message_id: Uuid,
        f: impl FnOnce(&mut Message) -> R,
    ) -> Option<R> {
        let entry = self.entry(channel_id)?;
        let mut entry = lock(&entry);
        let idx = entry.position_saved(message_id)?;
        Some(f(&mut entry.messages[idx]))
    }

    /// Drop a channel's entry. Outstanding fetches for it go stale.
    pub fn invalidate(&self, channel_id: Uuid) -> bool {
        write_lock(&self.entries).remove(&channel_id).is_some()
    }
}
