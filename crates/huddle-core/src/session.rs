//! The orchestrator: applies optimistic state, talks to the transport and
//! reconciles the results into the store.
//!
//! Fetches carry the cancellation token of the channel they were issued for.
//! Selecting another channel cancels it, and whatever still arrives for the
//! old channel is dropped. Sends are never cancelled; their result lands in
//! the entry of the channel they were made in.

use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_types::api::{SendMessageRequest, SendTarget};
use huddle_types::events::ChatEvent;
use huddle_types::models::{Channel, RosterMember};

use crate::composer::Composer;
use crate::config::ChatConfig;
use crate::directory::ChannelDirectory;
use crate::error::{ChatError, Result, ValidationError};
use crate::message::{CorrelationId, Draft, Message, ReactionSet, Viewer};
use crate::notice::{Notice, NoticeBoard};
use crate::reactions::{ReactionEngine, ReactionKey, ToggleOutcome};
use crate::store::{CacheLookup, CacheSnapshot, Ingested, MessageStore, OlderLoad, Reconciled};
use crate::transport::ChatTransport;
use crate::typing::{TypingPresence, TypingSummary};
use crate::{lock, read_lock, write_lock};

/// Change notifications for whatever renders the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    DirectoryChanged,
    /// Messages or reactions of a channel changed.
    ChannelChanged { channel_id: Uuid },
    TypingChanged { channel_id: Uuid },
    NoticeRaised(Notice),
}

#[derive(Debug, Clone)]
pub enum SendOutcome {
    Delivered(Message),
    /// The message stays in the channel marked failed; its draft can be
    /// retried or pulled back with [`ChatSession::discard_failed`]. When the
    /// channel's cache was dropped while the send was out, nothing is kept
    /// and the draft comes back here instead.
    Failed {
        correlation_id: CorrelationId,
        error: ChatError,
        draft: Option<Draft>,
    },
}

struct ActiveChannel {
    channel_id: Uuid,
    cancel: CancellationToken,
}

/// Client-side messaging session of one viewer.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    transport: Arc<dyn ChatTransport>,
    viewer: Viewer,
    config: ChatConfig,
    store: MessageStore,
    reactions: ReactionEngine,
    directory: Mutex<ChannelDirectory>,
    typing: Mutex<TypingPresence>,
    notices: Mutex<NoticeBoard>,
    /// `None` until loaded, or when loading failed.
    roster: RwLock<Option<Vec<RosterMember>>>,
    active: Mutex<Option<ActiveChannel>>,
    events: broadcast::Sender<SessionEvent>,
}

impl ChatSession {
    pub fn new(transport: Arc<dyn ChatTransport>, viewer: Viewer, config: ChatConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let typing = TypingPresence::new(viewer.user_id, config.typing_emit_interval, config.typing_expiry);
        let notices = NoticeBoard::new(config.notice_ttl);
        Self {
            inner: Arc::new(SessionInner {
                transport,
                viewer,
                config,
                store: MessageStore::new(),
                reactions: ReactionEngine::new(),
                directory: Mutex::new(ChannelDirectory::new()),
                typing: Mutex::new(typing),
                notices: Mutex::new(notices),
                roster: RwLock::new(None),
                active: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn viewer(&self) -> &Viewer {
        &self.inner.viewer
    }

    pub fn config(&self) -> &ChatConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    // -- Directory --

    pub fn channels(&self) -> Vec<Channel> {
        lock(&self.inner.directory).channels().to_vec()
    }

    pub fn channel(&self, channel_id: Uuid) -> Option<Channel> {
        lock(&self.inner.directory).get(channel_id).cloned()
    }

    pub async fn refresh_directory(&self) -> Result<Vec<Channel>> {
        let listed = self.inner.transport.list_channels().await.map_err(|e| {
            warn!("Channel list fetch failed: {}", e);
            ChatError::from(e)
        })?;
        let channels = {
            let mut directory = lock(&self.inner.directory);
            directory.replace(listed);
            directory.channels().to_vec()
        };
        info!("Directory refreshed: {} channels", channels.len());
        self.emit(SessionEvent::DirectoryChanged);
        Ok(channels)
    }

    // -- Roster --

    /// Load the roster used for mentions. A failure only disables mentions.
    pub async fn load_roster(&self, institution_id: Uuid) -> bool {
        let roster = match self.inner.transport.fetch_roster(institution_id).await {
            Ok(members) => {
                debug!("Roster of {} loaded: {} members", institution_id, members.len());
                Some(members)
            }
            Err(e) => {
                warn!("Roster fetch failed, mentions disabled: {}", e);
                None
            }
        };
        let available = roster.is_some();
        *write_lock(&self.inner.roster) = roster;
        available
    }

    pub fn roster(&self) -> Option<Vec<RosterMember>> {
        read_lock(&self.inner.roster).clone()
    }

    /// A composer configured for this session, mentions wired to the roster.
    pub fn new_composer(&self) -> Composer {
        let mut composer = Composer::new(&self.inner.config);
        composer.set_roster(self.roster());
        composer
    }

    // -- Channel selection and history --

    pub fn active_channel(&self) -> Option<Uuid> {
        lock(&self.inner.active).as_ref().map(|active| active.channel_id)
    }

    pub fn view(&self, channel_id: Uuid) -> CacheLookup {
        self.inner.store.get(channel_id)
    }

    /// Make `channel_id` active. Outstanding fetches of the previously active
    /// channel are cancelled.
    fn activate(&self, channel_id: Uuid) -> CancellationToken {
        let token = {
            let mut active = lock(&self.inner.active);
            match active.as_ref() {
                Some(current) if current.channel_id == channel_id => current.cancel.clone(),
                _ => {
                    if let Some(previous) = active.take() {
                        debug!("Cancelling fetches of channel {}", previous.channel_id);
                        previous.cancel.cancel();
                    }
                    let cancel = CancellationToken::new();
                    *active = Some(ActiveChannel {
                        channel_id,
                        cancel: cancel.clone(),
                    });
                    cancel
                }
            }
        };
        lock(&self.inner.directory).mark_read(channel_id);
        self.emit(SessionEvent::DirectoryChanged);
        token
    }

    /// Token for a fetch on `channel_id`: the active channel's own token, or
    /// an already-cancelled one when the channel is no longer active.
    fn fetch_token(&self, channel_id: Uuid) -> CancellationToken {
        match lock(&self.inner.active).as_ref() {
            Some(active) if active.channel_id == channel_id => active.cancel.clone(),
            _ => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    /// Select a channel and make sure its newest page is cached.
    pub async fn select_channel(&self, channel_id: Uuid) -> Result<CacheSnapshot> {
        let cancel = self.activate(channel_id);

        if let CacheLookup::Ready(snapshot) = self.inner.store.get(channel_id) {
            return Ok(snapshot);
        }
        let Some(ticket) = self.inner.store.begin_initial_load(channel_id) else {
            // Someone else is already fetching the first page
            return self
                .inner
                .store
                .snapshot(channel_id)
                .ok_or(ChatError::ChannelNotLoaded(channel_id));
        };

        let fetch = self
            .inner
            .transport
            .fetch_page(channel_id, None, self.inner.config.page_size);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = fetch => Some(result),
        };

        let page = match result {
            Some(Ok(page)) if !cancel.is_cancelled() => page,
            Some(Err(e)) if !cancel.is_cancelled() => {
                self.inner.store.abandon_initial_load(ticket);
                warn!("History fetch for channel {} failed: {}", channel_id, e);
                return Err(e.into());
            }
            _ => {
                self.inner.store.abandon_initial_load(ticket);
                warn!("Dropping history of channel {}: no longer selected", channel_id);
                return Err(ChatError::Cancelled { channel_id });
            }
        };

        let messages = page.messages.into_iter().map(Message::from).collect();
        if !self
            .inner
            .store
            .complete_initial_load(ticket, messages, page.has_more)
        {
            warn!("Dropping stale history of channel {}", channel_id);
            return Err(ChatError::Cancelled { channel_id });
        }
        info!("Channel {} loaded", channel_id);
        self.emit(SessionEvent::ChannelChanged { channel_id });
        self.inner
            .store
            .snapshot(channel_id)
            .ok_or(ChatError::ChannelNotLoaded(channel_id))
    }

    /// Fetch the page before the oldest cached message. Returns how many
    /// messages were added; 0 when there is nothing more or a load is
    /// already running.
    pub async fn load_older(&self, channel_id: Uuid) -> Result<usize> {
        let ticket = match self.inner.store.begin_load_older(channel_id) {
            OlderLoad::Start(ticket) => ticket,
            OlderLoad::NotLoaded => return Err(ChatError::ChannelNotLoaded(channel_id)),
            OlderLoad::NoMore | OlderLoad::AlreadyLoading => return Ok(0),
        };
        let cancel = self.fetch_token(channel_id);

        let fetch = self
            .inner
            .transport
            .fetch_page(channel_id, ticket.before, self.inner.config.page_size);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = fetch => Some(result),
        };

        match result {
            Some(Ok(page)) if !cancel.is_cancelled() => {
                let messages = page.messages.into_iter().map(Message::from).collect();
                match self
                    .inner
                    .store
                    .complete_load_older(ticket, messages, page.has_more)
                {
                    Some(added) => {
                        debug!("Prepended {} older messages to channel {}", added, channel_id);
                        self.emit(SessionEvent::ChannelChanged { channel_id });
                        Ok(added)
                    }
                    None => Err(ChatError::Cancelled { channel_id }),
                }
            }
            Some(Err(e)) if !cancel.is_cancelled() => {
                self.inner.store.abandon_load_older(ticket);
                warn!("Older page fetch for channel {} failed: {}", channel_id, e);
                Err(e.into())
            }
            _ => {
                self.inner.store.abandon_load_older(ticket);
                warn!("Dropping older page of channel {}: no longer selected", channel_id);
                Err(ChatError::Cancelled { channel_id })
            }
        }
    }

    /// Refetch the newest page of the selected channel, e.g. after the user
    /// acted on it or came back online. Dropped like any other fetch when
    /// another channel gets selected meanwhile.
    pub async fn refresh_channel(&self, channel_id: Uuid) -> Result<usize> {
        if !matches!(self.inner.store.get(channel_id), CacheLookup::Ready(_)) {
            return Err(ChatError::ChannelNotLoaded(channel_id));
        }
        let cancel = self.fetch_token(channel_id);

        let fetch = self
            .inner
            .transport
            .fetch_page(channel_id, None, self.inner.config.page_size);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = fetch => Some(result),
        };

        let page = match result {
            Some(Ok(page)) if !cancel.is_cancelled() => page,
            Some(Err(e)) if !cancel.is_cancelled() => {
                warn!("Refetch of channel {} failed: {}", channel_id, e);
                return Err(e.into());
            }
            _ => {
                warn!("Dropping refetch of channel {}: no longer selected", channel_id);
                return Err(ChatError::Cancelled { channel_id });
            }
        };
        let messages = page.messages.into_iter().map(Message::from).collect();
        let added = self.inner.store.merge_latest(channel_id, messages, page.has_more);
        self.emit(SessionEvent::ChannelChanged { channel_id });
        Ok(added)
    }

    /// Drop a channel's cache; it is refetched on next selection.
    pub fn invalidate(&self, channel_id: Uuid) {
        if self.inner.store.invalidate(channel_id) {
            debug!("Invalidated channel {}", channel_id);
            self.emit(SessionEvent::ChannelChanged { channel_id });
        }
    }

    // -- Sending --

    /// Send into a cached channel. The message shows up immediately as
    /// pending and is reconciled in place once the server answers.
    pub async fn send(&self, channel_id: Uuid, draft: Draft) -> Result<SendOutcome> {
        if !draft.is_sendable() {
            return Err(ValidationError::EmptyMessage.into());
        }
        let correlation_id = self.enqueue(channel_id, draft.clone())?;
        Ok(self
            .dispatch(channel_id, SendTarget::Channel(channel_id), correlation_id, &draft)
            .await)
    }

    /// Send a direct message to `other_user`, resolving (or creating) the DM
    /// channel first when it is not cached yet.
    pub async fn send_direct(&self, other_user: Uuid, draft: Draft) -> Result<SendOutcome> {
        if !draft.is_sendable() {
            return Err(ValidationError::EmptyMessage.into());
        }
        let known = lock(&self.inner.directory)
            .find_direct(other_user)
            .map(|channel| channel.id);
        let channel_id = match known {
            Some(channel_id) if self.inner.store.snapshot(channel_id).is_some() => channel_id,
            _ => self.open_direct(other_user).await?.id,
        };
        let correlation_id = self.enqueue(channel_id, draft.clone())?;
        Ok(self
            .dispatch(channel_id, SendTarget::Direct(other_user), correlation_id, &draft)
            .await)
    }

    /// Resolve the DM channel with `other_user` and cache its newest page.
    pub async fn open_direct(&self, other_user: Uuid) -> Result<Channel> {
        let direct = self
            .inner
            .transport
            .fetch_direct_page(other_user, self.inner.config.page_size)
            .await?;
        let channel_id = direct.channel.id;
        lock(&self.inner.directory).upsert(direct.channel);

        if let Some(ticket) = self.inner.store.begin_initial_load(channel_id) {
            let messages = direct.page.messages.into_iter().map(Message::from).collect();
            self.inner
                .store
                .complete_initial_load(ticket, messages, direct.page.has_more);
        }
        self.emit(SessionEvent::DirectoryChanged);
        self.emit(SessionEvent::ChannelChanged { channel_id });

        self.channel(channel_id)
            .ok_or(ChatError::NotFound(format!("direct channel with {}", other_user)))
    }

    /// Retry a failed send. The old entry is replaced by a fresh pending one
    /// at the tail.
    pub async fn retry_failed(&self, channel_id: Uuid, correlation_id: CorrelationId) -> Result<SendOutcome> {
        let draft = self
            .inner
            .store
            .take_failed(channel_id, correlation_id)
            .ok_or(ChatError::UnknownMessage { channel_id })?;
        self.emit(SessionEvent::ChannelChanged { channel_id });
        self.send(channel_id, draft).await
    }

    /// Remove a failed send and hand its draft back for editing.
    pub fn discard_failed(&self, channel_id: Uuid, correlation_id: CorrelationId) -> Option<Draft> {
        let draft = self.inner.store.take_failed(channel_id, correlation_id)?;
        self.emit(SessionEvent::ChannelChanged { channel_id });
        Some(draft)
    }

    fn enqueue(&self, channel_id: Uuid, draft: Draft) -> Result<CorrelationId> {
        let correlation_id = self
            .inner
            .store
            .append_optimistic(channel_id, &self.inner.viewer, draft, Utc::now())?;
        lock(&self.inner.typing).message_sent(channel_id);
        self.emit(SessionEvent::ChannelChanged { channel_id });
        Ok(correlation_id)
    }

    async fn dispatch(
        &self,
        channel_id: Uuid,
        target: SendTarget,
        correlation_id: CorrelationId,
        draft: &Draft,
    ) -> SendOutcome {
        let request = SendMessageRequest {
            body: draft.body.clone(),
            attachment: draft.attachment.as_ref().map(|file| file.to_outgoing()),
            reply_to_id: draft.reply_to.as_ref().map(|reply| reply.id),
            correlation_id: correlation_id.as_uuid(),
        };

        match self.inner.transport.send_message(target, request).await {
            Ok(response) => {
                if response.channel_id != channel_id {
                    warn!(
                        "Send {} answered for channel {}, keeping it in {}",
                        correlation_id, response.channel_id, channel_id
                    );
                }
                let mut message = Message::from(response);
                message.channel_id = channel_id;
                let reconciled = self
                    .inner
                    .store
                    .reconcile(channel_id, correlation_id, Ok(message.clone()));
                debug!("Send {} reconciled: {:?}", correlation_id, reconciled);

                lock(&self.inner.directory).record_message(channel_id, message.summary(), false);
                self.emit(SessionEvent::ChannelChanged { channel_id });
                self.emit(SessionEvent::DirectoryChanged);
                SendOutcome::Delivered(message)
            }
            Err(e) => {
                let error = ChatError::from(e);
                warn!("Send {} to channel {} failed: {}", correlation_id, channel_id, error);
                let reconciled = self
                    .inner
                    .store
                    .reconcile(channel_id, correlation_id, Err(error.to_string()));
                // Without a cached failed entry the caller is the only one
                // left holding the draft
                let draft = (reconciled == Reconciled::Unknown).then(|| {
                    debug!("Failed send {} no longer cached, returning its draft", correlation_id);
                    draft.clone()
                });
                self.emit(SessionEvent::ChannelChanged { channel_id });
                self.raise_notice(Some(channel_id), format!("Message not sent: {}", error));
                SendOutcome::Failed {
                    correlation_id,
                    error,
                    draft,
                }
            }
        }
    }

    // -- Reactions --

    /// Toggle the viewer's `emoji` on a delivered message. Toggles of the same
    /// pair run one at a time in call order.
    pub async fn toggle_reaction(&self, channel_id: Uuid, message_id: Uuid, emoji: &str) -> Result<ToggleOutcome> {
        let inner = &self.inner;
        let viewer = inner.viewer.user_id;
        let key = ReactionKey::new(message_id, emoji);
        let _slot = inner.reactions.acquire(&key).await;

        let phase = inner
            .store
            .with_message(channel_id, message_id, |message| {
                inner.reactions.begin(&key, &mut message.reactions, viewer)
            })
            .ok_or(ChatError::UnknownMessage { channel_id })?;
        self.emit(SessionEvent::ChannelChanged { channel_id });

        let result = inner.transport.toggle_reaction(channel_id, message_id, emoji).await;
        let outcome = match result {
            Ok(groups) => {
                let server = ReactionSet::from_groups(groups);
                inner.store.with_message(channel_id, message_id, |message| {
                    inner
                        .reactions
                        .settle(&key, phase, &mut message.reactions, server, viewer)
                })
            }
            Err(e) => {
                let error = ChatError::from(e);
                warn!("Reaction {} on {} failed: {}", emoji, message_id, error);
                self.raise_notice(Some(channel_id), format!("Reaction failed: {}", error));
                inner
                    .store
                    .with_message(channel_id, message_id, |message| {
                        inner.reactions.rollback(&key, phase, &mut message.reactions, viewer)
                    })
                    .map(|()| ToggleOutcome::RolledBack { error })
            }
        };

        let Some(outcome) = outcome else {
            // Message left the cache while the call was out
            inner.reactions.forget(&key);
            return Err(ChatError::UnknownMessage { channel_id });
        };
        self.emit(SessionEvent::ChannelChanged { channel_id });
        Ok(outcome)
    }

    // -- Typing --

    /// Report a keystroke in `channel_id`'s composer. Returns true when a
    /// typing signal went out.
    pub async fn note_keystroke(&self, channel_id: Uuid) -> bool {
        if !lock(&self.inner.typing).keystroke(channel_id, Instant::now()) {
            return false;
        }
        if let Err(e) = self.inner.transport.notify_typing(channel_id).await {
            debug!("Typing signal for channel {} not delivered: {}", channel_id, e);
        }
        true
    }

    pub fn typing_summary(&self, channel_id: Uuid) -> TypingSummary {
        lock(&self.inner.typing).summary(channel_id, Instant::now())
    }

    /// Prune expired typing signals everywhere.
    pub fn sweep_typing(&self) -> usize {
        lock(&self.inner.typing).sweep(Instant::now())
    }

    /// When the next typing signal runs out, for scheduling [`Self::sweep_typing`].
    pub fn next_typing_expiry(&self) -> Option<Instant> {
        lock(&self.inner.typing).next_expiry()
    }

    // -- Notices --

    fn raise_notice(&self, channel_id: Option<Uuid>, text: String) {
        let notice = {
            let mut board = lock(&self.inner.notices);
            let now = Instant::now();
            let id = board.push(channel_id, text, now);
            board.active(now).into_iter().find(|notice| notice.id == id)
        };
        if let Some(notice) = notice {
            self.emit(SessionEvent::NoticeRaised(notice));
        }
    }

    pub fn notices(&self) -> Vec<Notice> {
        lock(&self.inner.notices).active(Instant::now())
    }

    pub fn dismiss_notice(&self, id: u64) -> bool {
        lock(&self.inner.notices).dismiss(id)
    }

    // -- Server push --

    /// Apply an event pushed by the server.
    pub fn apply_event(&self, event: ChatEvent) {
        debug!("Applying pushed event for channel {}", event.channel_id());
        match event {
            ChatEvent::MessageCreate { message } => {
                let channel_id = message.channel_id;
                let own = message.author_id == self.inner.viewer.user_id;
                let correlation_id = message
                    .correlation_id
                    .filter(|_| own)
                    .map(CorrelationId::from_uuid);
                let message = Message::from(message);

                lock(&self.inner.typing).clear_user(channel_id, message.author_id);
                let unread = !own && self.active_channel() != Some(channel_id);
                lock(&self.inner.directory).record_message(channel_id, message.summary(), unread);

                let ingested = self.inner.store.ingest(channel_id, message, correlation_id);
                if ingested != Ingested::Ignored {
                    self.emit(SessionEvent::ChannelChanged { channel_id });
                }
                self.emit(SessionEvent::TypingChanged { channel_id });
                self.emit(SessionEvent::DirectoryChanged);
            }
            ChatEvent::TypingStart {
                channel_id,
                user_id,
                username,
            } => {
                lock(&self.inner.typing).receive(channel_id, user_id, &username, Instant::now());
                self.emit(SessionEvent::TypingChanged { channel_id });
            }
            ChatEvent::ReactionsUpdate {
                channel_id,
                message_id,
                reactions,
            } => {
                let inner = &self.inner;
                let server = ReactionSet::from_groups(reactions);
                let viewer = inner.viewer.user_id;
                let applied = inner.store.with_message(channel_id, message_id, |message| {
                    inner
                        .reactions
                        .adopt_server(message_id, &mut message.reactions, server, viewer)
                });
                if applied.is_some() {
                    self.emit(SessionEvent::ChannelChanged { channel_id });
                }
            }
            ChatEvent::ChannelUpdate { channel } => {
                lock(&self.inner.directory).upsert(channel);
                self.emit(SessionEvent::DirectoryChanged);
            }
        }
    }
}
