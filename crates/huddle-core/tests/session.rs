//! Orchestrator tests against a scripted in-memory transport.
//!
//! Gates (semaphores with no permits) hold individual calls open so the
//! tests can interleave completions deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::Semaphore;
use uuid::Uuid;

use huddle_core::error::TransportError;
use huddle_core::mention::MentionKey;
use huddle_core::reactions::ToggleOutcome;
use huddle_core::store::CacheLookup;
use huddle_core::typing::TypingSummary;
use huddle_core::{ChatConfig, ChatError, ChatSession, ChatTransport, Draft, MessageStatus, SendOutcome, Viewer};
use huddle_types::api::{DirectPage, MessagePage, MessageResponse, ReactionGroup, SendMessageRequest, SendTarget};
use huddle_types::events::ChatEvent;
use huddle_types::models::{Channel, ChannelKind, RosterMember};

#[derive(Default)]
struct FakeState {
    channels: Vec<Channel>,
    /// channel_id -> history, oldest first
    history: HashMap<Uuid, Vec<MessageResponse>>,
    /// message_id -> emoji -> users
    reactions: HashMap<Uuid, Vec<(String, Vec<Uuid>)>>,
    direct: HashMap<Uuid, Channel>,
    roster: Option<Vec<RosterMember>>,
    fetch_gates: HashMap<Uuid, Arc<Semaphore>>,
    send_gate: Option<Arc<Semaphore>>,
    reaction_gate: Option<Arc<Semaphore>>,
    fail_sends: bool,
    fail_reactions: bool,
    sends: usize,
}

struct FakeTransport {
    viewer: Uuid,
    state: Mutex<FakeState>,
}

impl FakeTransport {
    fn new(viewer: Uuid) -> Arc<Self> {
        Arc::new(Self {
            viewer,
            state: Mutex::new(FakeState::default()),
        })
    }

    fn add_channel(&self, name: &str, history_len: i64) -> Uuid {
        let id = Uuid::new_v4();
        let mut state = self.state.lock().unwrap();
        state.channels.push(Channel {
            id,
            kind: ChannelKind::GroupChat,
            display_name: name.to_string(),
            counterpart_user_id: None,
            avatar_ref: None,
            last_message_summary: None,
            unread_count: 2,
            member_count: Some(12),
        });
        let history = (0..history_len)
            .map(|i| response(id, Uuid::new_v4(), &format!("{} #{}", name, i), i))
            .collect();
        state.history.insert(id, history);
        id
    }

    fn hold_fetches(&self, channel_id: Uuid) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.state.lock().unwrap().fetch_gates.insert(channel_id, gate.clone());
        gate
    }

    fn hold_sends(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.state.lock().unwrap().send_gate = Some(gate.clone());
        gate
    }

    fn hold_reactions(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.state.lock().unwrap().reaction_gate = Some(gate.clone());
        gate
    }

    fn newest_id(&self, channel_id: Uuid) -> Uuid {
        self.state.lock().unwrap().history[&channel_id]
            .last()
            .map(|m| m.id)
            .unwrap()
    }
}

fn response(channel_id: Uuid, author_id: Uuid, body: &str, secs: i64) -> MessageResponse {
    MessageResponse {
        id: Uuid::new_v4(),
        channel_id,
        author_id,
        author_name: "Someone".into(),
        body: Some(body.to_string()),
        attachment: None,
        reply_to: None,
        reactions: vec![],
        created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        edited_at: None,
        correlation_id: None,
    }
}

async fn pass(gate: Option<Arc<Semaphore>>) {
    if let Some(gate) = gate {
        gate.acquire().await.unwrap().forget();
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn list_channels(&self) -> Result<Vec<Channel>, TransportError> {
        Ok(self.state.lock().unwrap().channels.clone())
    }

    async fn fetch_page(
        &self,
        channel_id: Uuid,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<MessagePage, TransportError> {
        let gate = self.state.lock().unwrap().fetch_gates.get(&channel_id).cloned();
        pass(gate).await;

        let state = self.state.lock().unwrap();
        let history = state
            .history
            .get(&channel_id)
            .ok_or_else(|| TransportError::NotFound(format!("channel {}", channel_id)))?;
        let end = match before {
            Some(id) => history.iter().position(|m| m.id == id).unwrap_or(0),
            None => history.len(),
        };
        let start = end.saturating_sub(limit as usize);
        Ok(MessagePage {
            messages: history[start..end].to_vec(),
            has_more: start > 0,
        })
    }

    async fn fetch_direct_page(&self, other_user: Uuid, _limit: u32) -> Result<DirectPage, TransportError> {
        let mut state = self.state.lock().unwrap();
        let channel = state
            .direct
            .entry(other_user)
            .or_insert_with(|| Channel {
                id: Uuid::new_v4(),
                kind: ChannelKind::DirectMessage,
                display_name: "Bert".into(),
                counterpart_user_id: Some(other_user),
                avatar_ref: None,
                last_message_summary: None,
                unread_count: 0,
                member_count: Some(2),
            })
            .clone();
        state.history.entry(channel.id).or_default();
        Ok(DirectPage {
            channel,
            page: MessagePage {
                messages: vec![],
                has_more: false,
            },
        })
    }

    async fn send_message(
        &self,
        target: SendTarget,
        request: SendMessageRequest,
    ) -> Result<MessageResponse, TransportError> {
        // The message is stored before the gate, so a held send can be
        // echoed back before its response arrives.
        let (result, gate) = {
            let mut state = self.state.lock().unwrap();
            state.sends += 1;
            let gate = state.send_gate.clone();
            if state.fail_sends {
                (Err(TransportError::Network("offline".into())), gate)
            } else {
                let channel_id = match target {
                    SendTarget::Channel(id) => id,
                    SendTarget::Direct(user) => state.direct[&user].id,
                };
                let secs = 10_000 + state.sends as i64;
                let mut message = response(channel_id, self.viewer, request.body.as_deref().unwrap_or(""), secs);
                message.author_name = "Me".into();
                message.correlation_id = Some(request.correlation_id);
                state.history.entry(channel_id).or_default().push(message.clone());
                (Ok(message), gate)
            }
        };
        pass(gate).await;
        result
    }

    async fn toggle_reaction(
        &self,
        _channel_id: Uuid,
        message_id: Uuid,
        emoji: &str,
    ) -> Result<Vec<ReactionGroup>, TransportError> {
        let gate = self.state.lock().unwrap().reaction_gate.clone();
        pass(gate).await;

        let mut state = self.state.lock().unwrap();
        if state.fail_reactions {
            return Err(TransportError::Rejected {
                status: 500,
                message: "boom".into(),
            });
        }
        let groups = state.reactions.entry(message_id).or_default();
        match groups.iter_mut().find(|(e, _)| e == emoji) {
            Some((_, users)) => {
                if let Some(idx) = users.iter().position(|u| *u == self.viewer) {
                    users.remove(idx);
                } else {
                    users.push(self.viewer);
                }
            }
            None => groups.push((emoji.to_string(), vec![self.viewer])),
        }
        groups.retain(|(_, users)| !users.is_empty());
        Ok(groups
            .iter()
            .map(|(emoji, users)| ReactionGroup {
                emoji: emoji.clone(),
                count: users.len(),
                user_ids: users.clone(),
            })
            .collect())
    }

    async fn fetch_roster(&self, institution_id: Uuid) -> Result<Vec<RosterMember>, TransportError> {
        self.state
            .lock()
            .unwrap()
            .roster
            .clone()
            .ok_or_else(|| TransportError::NotFound(format!("institution {}", institution_id)))
    }
}

fn setup(page_size: u32) -> (Arc<FakeTransport>, ChatSession) {
    let viewer = Viewer {
        user_id: Uuid::new_v4(),
        display_name: "Me".into(),
    };
    let transport = FakeTransport::new(viewer.user_id);
    let config = ChatConfig {
        page_size,
        ..ChatConfig::default()
    };
    let session = ChatSession::new(transport.clone(), viewer, config);
    (transport, session)
}

fn bodies(session: &ChatSession, channel_id: Uuid) -> Vec<String> {
    match session.view(channel_id) {
        CacheLookup::Ready(snapshot) => snapshot
            .messages
            .iter()
            .map(|m| m.body.clone().unwrap_or_default())
            .collect(),
        other => panic!("channel not ready: {:?}", other),
    }
}

#[tokio::test]
async fn selecting_a_channel_loads_newest_page_and_clears_unread() {
    let (transport, session) = setup(2);
    let class = transport.add_channel("class", 3);
    session.refresh_directory().await.unwrap();
    assert_eq!(session.channel(class).unwrap().unread_count, 2);

    let snapshot = session.select_channel(class).await.unwrap();
    assert!(snapshot.has_more);
    assert_eq!(bodies(&session, class), vec!["class #1", "class #2"]);
    assert_eq!(session.channel(class).unwrap().unread_count, 0);
    assert_eq!(session.active_channel(), Some(class));

    assert_eq!(session.load_older(class).await.unwrap(), 1);
    assert_eq!(session.load_older(class).await.unwrap(), 0);
    assert_eq!(bodies(&session, class), vec!["class #0", "class #1", "class #2"]);
}

#[tokio::test]
async fn switching_channels_drops_the_stale_fetch() {
    let (transport, session) = setup(50);
    let first = transport.add_channel("first", 3);
    let second = transport.add_channel("second", 1);
    let gate = transport.hold_fetches(first);

    let (stale, fresh) = tokio::join!(session.select_channel(first), async {
        tokio::task::yield_now().await;
        session.select_channel(second).await
    });

    assert_eq!(stale.unwrap_err(), ChatError::Cancelled { channel_id: first });
    assert!(fresh.is_ok());
    assert!(matches!(session.view(first), CacheLookup::Missing));
    assert_eq!(session.active_channel(), Some(second));

    // A later selection fetches again
    gate.add_permits(1);
    session.select_channel(first).await.unwrap();
    assert_eq!(bodies(&session, first).len(), 3);
}

#[tokio::test]
async fn optimistic_order_holds_while_older_pages_land() {
    let (transport, session) = setup(2);
    let class = transport.add_channel("class", 4);
    session.refresh_directory().await.unwrap();
    session.select_channel(class).await.unwrap();
    let gate = transport.hold_sends();

    let (sent, added) = tokio::join!(session.send(class, Draft::text("mine")), async {
        tokio::task::yield_now().await;
        assert_eq!(bodies(&session, class), vec!["class #2", "class #3", "mine"]);
        let added = session.load_older(class).await.unwrap();
        gate.add_permits(1);
        added
    });

    assert_eq!(added, 2);
    assert!(matches!(sent.unwrap(), SendOutcome::Delivered(_)));
    assert_eq!(
        bodies(&session, class),
        vec!["class #0", "class #1", "class #2", "class #3", "mine"]
    );
    assert_eq!(
        session.channel(class).unwrap().last_message_summary.as_deref(),
        Some("mine")
    );
}

#[tokio::test]
async fn failed_send_keeps_one_entry_and_a_recoverable_draft() {
    let (transport, session) = setup(50);
    let class = transport.add_channel("class", 1);
    session.select_channel(class).await.unwrap();
    transport.state.lock().unwrap().fail_sends = true;

    let outcome = session.send(class, Draft::text("hello")).await.unwrap();
    let SendOutcome::Failed {
        correlation_id,
        error,
        draft,
    } = outcome
    else {
        panic!("send should fail");
    };
    assert_eq!(error, ChatError::Network("offline".into()));
    assert!(draft.is_none());

    let CacheLookup::Ready(snapshot) = session.view(class) else {
        panic!("channel not ready");
    };
    let failed: Vec<_> = snapshot.messages.iter().filter(|m| m.is_failed()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(snapshot.messages.len(), 2);
    assert_eq!(session.notices().len(), 1);

    transport.state.lock().unwrap().fail_sends = false;
    let retried = session.retry_failed(class, correlation_id).await.unwrap();
    assert!(matches!(retried, SendOutcome::Delivered(_)));
    assert_eq!(bodies(&session, class), vec!["class #0", "hello"]);
    assert!(matches!(
        session.retry_failed(class, correlation_id).await,
        Err(ChatError::UnknownMessage { .. })
    ));
}

#[tokio::test]
async fn discarded_send_hands_back_its_draft() {
    let (transport, session) = setup(50);
    let class = transport.add_channel("class", 0);
    session.select_channel(class).await.unwrap();
    transport.state.lock().unwrap().fail_sends = true;

    let SendOutcome::Failed { correlation_id, .. } =
        session.send(class, Draft::text("draft me")).await.unwrap()
    else {
        panic!("send should fail");
    };
    let draft = session.discard_failed(class, correlation_id).unwrap();

    let mut composer = session.new_composer();
    composer.restore(draft);
    assert_eq!(composer.text(), "draft me");
    assert!(bodies(&session, class).is_empty());
}

#[tokio::test]
async fn failed_send_into_a_dropped_cache_returns_its_draft() {
    let (transport, session) = setup(50);
    let class = transport.add_channel("class", 0);
    session.select_channel(class).await.unwrap();
    transport.state.lock().unwrap().fail_sends = true;
    let gate = transport.hold_sends();

    let (outcome, ()) = tokio::join!(session.send(class, Draft::text("keep me")), async {
        tokio::task::yield_now().await;
        session.invalidate(class);
        gate.add_permits(1);
    });

    let SendOutcome::Failed {
        correlation_id,
        draft,
        ..
    } = outcome.unwrap()
    else {
        panic!("send should fail");
    };
    assert_eq!(draft.unwrap().body.as_deref(), Some("keep me"));
    assert!(session.discard_failed(class, correlation_id).is_none());
}

#[tokio::test]
async fn empty_draft_never_reaches_the_server() {
    let (transport, session) = setup(50);
    let class = transport.add_channel("class", 0);
    session.select_channel(class).await.unwrap();

    let err = session.send(class, Draft::text("  ")).await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));
    assert_eq!(transport.state.lock().unwrap().sends, 0);
}

#[tokio::test]
async fn toggling_twice_restores_the_original_reactions() {
    let (transport, session) = setup(50);
    let class = transport.add_channel("class", 1);
    let message_id = transport.newest_id(class);
    session.select_channel(class).await.unwrap();

    assert_eq!(
        session.toggle_reaction(class, message_id, "👍").await.unwrap(),
        ToggleOutcome::Added
    );
    assert_eq!(
        session.toggle_reaction(class, message_id, "👍").await.unwrap(),
        ToggleOutcome::Removed
    );
    let CacheLookup::Ready(snapshot) = session.view(class) else {
        panic!("channel not ready");
    };
    assert!(snapshot.messages[0].reactions.is_empty());
}

#[tokio::test]
async fn concurrent_toggles_of_one_emoji_run_in_order() {
    let (transport, session) = setup(50);
    let class = transport.add_channel("class", 1);
    let message_id = transport.newest_id(class);
    session.select_channel(class).await.unwrap();
    let gate = transport.hold_reactions();
    let viewer = session.viewer().user_id;

    let (first, second, ()) = tokio::join!(
        session.toggle_reaction(class, message_id, "🎉"),
        session.toggle_reaction(class, message_id, "🎉"),
        async {
            tokio::task::yield_now().await;
            let CacheLookup::Ready(snapshot) = session.view(class) else {
                panic!("channel not ready");
            };
            // Only the first toggle has been applied optimistically
            assert!(snapshot.messages[0].reactions.has_reacted("🎉", viewer));
            gate.add_permits(2);
        }
    );

    assert_eq!(first.unwrap(), ToggleOutcome::Added);
    assert_eq!(second.unwrap(), ToggleOutcome::Removed);
    let CacheLookup::Ready(snapshot) = session.view(class) else {
        panic!("channel not ready");
    };
    assert!(snapshot.messages[0].reactions.get("🎉").is_none());
}

#[tokio::test]
async fn failed_toggle_rolls_back_and_raises_a_notice() {
    let (transport, session) = setup(50);
    let class = transport.add_channel("class", 1);
    let message_id = transport.newest_id(class);
    session.select_channel(class).await.unwrap();
    transport.state.lock().unwrap().fail_reactions = true;
    let mut events = session.subscribe();

    let outcome = session.toggle_reaction(class, message_id, "👍").await.unwrap();
    assert!(matches!(outcome, ToggleOutcome::RolledBack { .. }));

    let CacheLookup::Ready(snapshot) = session.view(class) else {
        panic!("channel not ready");
    };
    assert!(snapshot.messages[0].reactions.is_empty());

    let mut saw_notice = false;
    while let Ok(event) = events.try_recv() {
        saw_notice |= matches!(event, huddle_core::SessionEvent::NoticeRaised(_));
    }
    assert!(saw_notice);
}

#[tokio::test]
async fn toggle_on_unknown_message_is_an_error() {
    let (transport, session) = setup(50);
    let class = transport.add_channel("class", 0);
    session.select_channel(class).await.unwrap();

    let err = session
        .toggle_reaction(class, Uuid::new_v4(), "👍")
        .await
        .unwrap_err();
    assert_eq!(err, ChatError::UnknownMessage { channel_id: class });
}

#[tokio::test]
async fn pushed_echo_and_send_response_yield_one_message() {
    let (transport, session) = setup(50);
    let class = transport.add_channel("class", 0);
    session.select_channel(class).await.unwrap();
    let gate = transport.hold_sends();

    let (outcome, ()) = tokio::join!(session.send(class, Draft::text("echo")), async {
        tokio::task::yield_now().await;
        let pushed = transport.state.lock().unwrap().history[&class].last().cloned().unwrap();
        session.apply_event(ChatEvent::MessageCreate { message: pushed });

        let CacheLookup::Ready(snapshot) = session.view(class) else {
            panic!("channel not ready");
        };
        assert_eq!(snapshot.messages.len(), 1);
        assert!(!snapshot.messages[0].is_optimistic());
        gate.add_permits(1);
    });

    assert!(matches!(outcome.unwrap(), SendOutcome::Delivered(_)));
    assert_eq!(bodies(&session, class), vec!["echo"]);
}

#[tokio::test]
async fn pushed_message_in_background_channel_counts_as_unread() {
    let (transport, session) = setup(50);
    let class = transport.add_channel("class", 0);
    let other = transport.add_channel("other", 0);
    session.refresh_directory().await.unwrap();
    session.select_channel(class).await.unwrap();

    session.apply_event(ChatEvent::MessageCreate {
        message: response(other, Uuid::new_v4(), "psst", 5),
    });
    session.apply_event(ChatEvent::MessageCreate {
        message: response(class, Uuid::new_v4(), "hello", 6),
    });

    assert_eq!(session.channel(other).unwrap().unread_count, 3);
    assert_eq!(session.channel(class).unwrap().unread_count, 0);
    assert_eq!(
        session.channel(class).unwrap().last_message_summary.as_deref(),
        Some("hello")
    );
    assert_eq!(bodies(&session, class), vec!["hello"]);
}

#[tokio::test]
async fn direct_send_resolves_the_dm_channel() {
    let (_transport, session) = setup(50);
    let bert = Uuid::new_v4();

    let outcome = session.send_direct(bert, Draft::text("hi Bert")).await.unwrap();
    let SendOutcome::Delivered(message) = outcome else {
        panic!("send should succeed");
    };
    let channel = session.channels().into_iter().find(|c| c.is_direct()).unwrap();
    assert_eq!(channel.counterpart_user_id, Some(bert));
    assert_eq!(message.channel_id, channel.id);
    assert_eq!(bodies(&session, channel.id), vec!["hi Bert"]);

    session.send_direct(bert, Draft::text("again")).await.unwrap();
    assert_eq!(session.channels().len(), 1);
    assert_eq!(bodies(&session, channel.id), vec!["hi Bert", "again"]);
}

#[tokio::test(start_paused = true)]
async fn typing_signals_expire() {
    let (transport, session) = setup(50);
    let class = transport.add_channel("class", 0);
    let anna = Uuid::new_v4();

    session.apply_event(ChatEvent::TypingStart {
        channel_id: class,
        user_id: anna,
        username: "Anna".into(),
    });
    assert_eq!(session.typing_summary(class), TypingSummary::One("Anna".into()));

    tokio::time::advance(Duration::from_secs(7)).await;
    assert_eq!(session.typing_summary(class), TypingSummary::Nobody);
}

#[tokio::test(start_paused = true)]
async fn keystrokes_emit_at_most_once_per_interval() {
    let (transport, session) = setup(50);
    let class = transport.add_channel("class", 0);

    assert!(session.note_keystroke(class).await);
    assert!(!session.note_keystroke(class).await);
    tokio::time::advance(Duration::from_millis(3100)).await;
    assert!(session.note_keystroke(class).await);
}

#[tokio::test(start_paused = true)]
async fn notices_expire_after_their_ttl() {
    let (transport, session) = setup(50);
    let class = transport.add_channel("class", 0);
    session.select_channel(class).await.unwrap();
    transport.state.lock().unwrap().fail_sends = true;

    session.send(class, Draft::text("x")).await.unwrap();
    session.send(class, Draft::text("y")).await.unwrap();
    let notices = session.notices();
    assert_eq!(notices.len(), 2);
    assert!(session.dismiss_notice(notices[0].id));
    assert_eq!(session.notices().len(), 1);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(session.notices().is_empty());
}

#[tokio::test]
async fn missing_roster_disables_mentions() {
    let (transport, session) = setup(50);
    assert!(!session.load_roster(Uuid::new_v4()).await);
    let mut composer = session.new_composer();
    composer.input("@An", 3);
    assert!(composer.mention_popup().is_none());

    transport.state.lock().unwrap().roster = Some(vec![RosterMember {
        id: Uuid::new_v4(),
        name: "Anna".into(),
        role: "teacher".into(),
        avatar_ref: None,
    }]);
    assert!(session.load_roster(Uuid::new_v4()).await);
    let mut composer = session.new_composer();
    composer.input("@An", 3);
    assert!(composer.mention_popup().is_some());
    assert!(matches!(
        composer.handle_key(MentionKey::Tab),
        huddle_core::mention::KeyOutcome::Committed(_)
    ));
    assert_eq!(composer.text(), "@Anna ");
}

#[tokio::test]
async fn invalidated_channel_is_refetched() {
    let (transport, session) = setup(50);
    let class = transport.add_channel("class", 2);
    session.select_channel(class).await.unwrap();
    session.invalidate(class);
    assert!(matches!(session.view(class), CacheLookup::Missing));

    let snapshot = session.select_channel(class).await.unwrap();
    assert_eq!(snapshot.messages.len(), 2);
    assert!(snapshot.messages.iter().all(|m| m.status == MessageStatus::Delivered));
}

#[tokio::test]
async fn refresh_merges_new_messages() {
    let (transport, session) = setup(50);
    let class = transport.add_channel("class", 1);
    session.select_channel(class).await.unwrap();

    let late = response(class, Uuid::new_v4(), "late", 500);
    transport.state.lock().unwrap().history.get_mut(&class).unwrap().push(late);

    assert_eq!(session.refresh_channel(class).await.unwrap(), 1);
    assert_eq!(bodies(&session, class), vec!["class #0", "late"]);
}

#[tokio::test]
async fn refresh_is_dropped_after_switching_channels() {
    let (transport, session) = setup(50);
    let class = transport.add_channel("class", 1);
    let other = transport.add_channel("other", 1);
    session.select_channel(class).await.unwrap();

    let late = response(class, Uuid::new_v4(), "late", 500);
    transport.state.lock().unwrap().history.get_mut(&class).unwrap().push(late);
    let gate = transport.hold_fetches(class);

    let (refreshed, ()) = tokio::join!(session.refresh_channel(class), async {
        tokio::task::yield_now().await;
        session.select_channel(other).await.unwrap();
        gate.add_permits(1);
    });

    assert_eq!(refreshed.unwrap_err(), ChatError::Cancelled { channel_id: class });
    assert_eq!(bodies(&session, class), vec!["class #0"]);
    assert_eq!(session.active_channel(), Some(other));
}
