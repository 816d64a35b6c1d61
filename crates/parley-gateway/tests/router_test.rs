//! End-to-end router behavior against an in-memory store: fan-out,
//! authorization, reaction upserts, read-receipt targeting, presence.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use parley_gateway::connection::close_session;
use parley_gateway::push::PushDispatcher;
use parley_gateway::registry::{Outbound, SessionHandle};
use parley_gateway::router::Router;
use parley_gateway::session::SessionContext;
use parley_gateway::store::{MessageRef, NewMessage, Store, StoreError};
use parley_types::events::{ClientEvent, ServerEvent};
use parley_types::models::{Message, MessageKind, PresenceStatus, Reaction};

#[derive(Default)]
struct MemState {
    // user -> chats
    memberships: HashMap<Uuid, Vec<Uuid>>,
    // chat -> participants
    participants: HashMap<Uuid, Vec<Uuid>>,
    messages: HashMap<Uuid, MessageRef>,
    // message -> user -> emoji
    reactions: HashMap<Uuid, HashMap<Uuid, String>>,
    reads: HashSet<(Uuid, Uuid)>,
    presence: HashMap<Uuid, PresenceStatus>,
}

#[derive(Default)]
struct MemStore {
    state: Mutex<MemState>,
}

impl MemStore {
    fn add_chat(&self, chat_id: Uuid, members: &[Uuid]) {
        let mut state = self.state.lock().unwrap();
        state.participants.insert(chat_id, members.to_vec());
        for member in members {
            state.memberships.entry(*member).or_default().push(chat_id);
        }
    }

    fn reaction_count(&self, message_id: Uuid) -> usize {
        self.state
            .lock()
            .unwrap()
            .reactions
            .get(&message_id)
            .map_or(0, |set| set.len())
    }
}

impl Store for MemStore {
    fn create_message(&self, draft: NewMessage) -> Result<Message, StoreError> {
        let id = Uuid::new_v4();
        self.state.lock().unwrap().messages.insert(
            id,
            MessageRef {
                chat_id: draft.chat_id,
                sender_id: draft.sender_id,
            },
        );
        Ok(Message {
            id,
            chat_id: draft.chat_id,
            sender_id: draft.sender_id,
            sender_username: "someone".into(),
            kind: draft.kind,
            content: draft.content,
            reply_to: draft.reply_to,
            is_edited: false,
            is_pinned: false,
            is_deleted: false,
            created_at: Utc::now(),
        })
    }

    fn message_ref(&self, message_id: Uuid) -> Result<MessageRef, StoreError> {
        self.state
            .lock()
            .unwrap()
            .messages
            .get(&message_id)
            .copied()
            .ok_or(StoreError::NotFound("message"))
    }

    fn upsert_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    ) -> Result<Vec<Reaction>, StoreError> {
        let mut state = self.state.lock().unwrap();
        if !state.messages.contains_key(&message_id) {
            return Err(StoreError::NotFound("message"));
        }
        let set = state.reactions.entry(message_id).or_default();
        set.insert(user_id, emoji);
        Ok(set
            .iter()
            .map(|(user_id, emoji)| Reaction {
                user_id: *user_id,
                emoji: emoji.clone(),
                timestamp: Utc::now(),
            })
            .collect())
    }

    fn mark_read(&self, message_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if !state.messages.contains_key(&message_id) {
            return Err(StoreError::NotFound("message"));
        }
        state.reads.insert((message_id, user_id));
        Ok(())
    }

    fn load_memberships(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .memberships
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    fn chat_participants(&self, chat_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .participants
            .get(&chat_id)
            .cloned()
            .unwrap_or_default())
    }

    fn update_presence(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
        _last_seen: chrono::DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.state.lock().unwrap().presence.insert(user_id, status);
        Ok(())
    }
}

struct RecordingPush {
    tx: mpsc::UnboundedSender<Vec<Uuid>>,
}

impl PushDispatcher for RecordingPush {
    fn notify(&self, recipients: &[Uuid], _message: &Message) {
        let _ = self.tx.send(recipients.to_vec());
    }
}

struct TestClient {
    ctx: SessionContext,
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl TestClient {
    fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(outbound) = self.rx.try_recv() {
            if let Outbound::Event(event) = outbound {
                events.push(event);
            }
        }
        events
    }
}

/// Mimics the Active transition of the connection lifecycle: register,
/// load the membership cache, join rooms, go online.
async fn connect(router: &Router, user_id: Uuid, username: &str) -> TestClient {
    let conn_id = Uuid::new_v4();
    let (tx, rx) = mpsc::unbounded_channel();
    let (epoch, _) = router
        .registry
        .register(
            user_id,
            SessionHandle {
                conn_id,
                tx: tx.clone(),
                connected_at: Utc::now(),
            },
        )
        .await;
    let chats = router.load_memberships(user_id).await.unwrap();
    router.rooms.join_all(&chats, user_id, conn_id, epoch).await;
    router.presence.set_online(user_id).await;
    TestClient {
        ctx: SessionContext::new(
            user_id,
            username.into(),
            conn_id,
            chats.into_iter().collect(),
            tx,
        ),
        rx,
    }
}

fn setup() -> (Router, Arc<MemStore>, mpsc::UnboundedReceiver<Vec<Uuid>>) {
    let store = Arc::new(MemStore::default());
    let (push_tx, push_rx) = mpsc::unbounded_channel();
    let router = Router::new(store.clone(), Arc::new(RecordingPush { tx: push_tx }));
    (router, store, push_rx)
}

#[tokio::test]
async fn send_fans_out_to_room_including_sender() {
    let (router, store, mut push_rx) = setup();
    let chat = Uuid::new_v4();
    let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    store.add_chat(chat, &[alice, bob, carol]);

    let mut a = connect(&router, alice, "alice").await;
    let mut b = connect(&router, bob, "bob").await;
    // carol stays offline

    router
        .dispatch(
            &a.ctx,
            ClientEvent::MessageSend {
                chat_id: chat,
                content: "hi".into(),
                kind: MessageKind::Text,
                reply_to: None,
            },
        )
        .await;

    let a_events = a.drain();
    let news: Vec<_> = a_events
        .iter()
        .filter(|e| matches!(e, ServerEvent::MessageNew { .. }))
        .collect();
    assert_eq!(news.len(), 1, "sender receives exactly one message:new");
    match news[0] {
        ServerEvent::MessageNew { message, chat_id } => {
            assert_eq!(*chat_id, chat);
            assert_eq!(message.content, "hi");
            assert_eq!(message.sender_id, alice);
        }
        _ => unreachable!(),
    }
    assert!(
        a_events
            .iter()
            .any(|e| matches!(e, ServerEvent::MessageSent { chat_id, .. } if *chat_id == chat)),
        "sender receives the direct ack"
    );

    let b_events = b.drain();
    assert_eq!(
        b_events
            .iter()
            .filter(|e| matches!(e, ServerEvent::MessageNew { .. }))
            .count(),
        1,
        "each member receives exactly one message:new"
    );
    assert!(
        !b_events
            .iter()
            .any(|e| matches!(e, ServerEvent::MessageSent { .. })),
        "the ack goes to the originator only"
    );

    // offline participant gets the push notification, connected ones don't
    let pushed = tokio::time::timeout(Duration::from_secs(1), push_rx.recv())
        .await
        .expect("push dispatch")
        .unwrap();
    assert_eq!(pushed, vec![carol]);
}

#[tokio::test]
async fn non_member_events_are_rejected_without_broadcast() {
    let (router, store, _push) = setup();
    let chat = Uuid::new_v4();
    let (alice, mallory) = (Uuid::new_v4(), Uuid::new_v4());
    store.add_chat(chat, &[alice]);

    let mut a = connect(&router, alice, "alice").await;
    let mut m = connect(&router, mallory, "mallory").await;

    router
        .dispatch(
            &m.ctx,
            ClientEvent::MessageSend {
                chat_id: chat,
                content: "let me in".into(),
                kind: MessageKind::Text,
                reply_to: None,
            },
        )
        .await;
    router
        .dispatch(&m.ctx, ClientEvent::TypingStart { chat_id: chat })
        .await;

    let rejections = m.drain();
    assert_eq!(rejections.len(), 2);
    assert!(
        rejections
            .iter()
            .all(|e| matches!(e, ServerEvent::Error { .. })),
        "originator gets message:error for each attempt"
    );
    assert!(a.drain().is_empty(), "members see nothing");
}

#[tokio::test]
async fn reaction_upsert_is_idempotent_per_user() {
    let (router, store, _push) = setup();
    let chat = Uuid::new_v4();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    store.add_chat(chat, &[alice, bob]);

    let mut a = connect(&router, alice, "alice").await;
    let mut b = connect(&router, bob, "bob").await;

    router
        .dispatch(
            &a.ctx,
            ClientEvent::MessageSend {
                chat_id: chat,
                content: "react to me".into(),
                kind: MessageKind::Text,
                reply_to: None,
            },
        )
        .await;
    let message_id = a
        .drain()
        .iter()
        .find_map(|e| match e {
            ServerEvent::MessageNew { message, .. } => Some(message.id),
            _ => None,
        })
        .unwrap();
    b.drain();

    for emoji in ["👍", "👍", "❤️"] {
        router
            .dispatch(
                &b.ctx,
                ClientEvent::MessageReact {
                    message_id,
                    emoji: emoji.into(),
                },
            )
            .await;
    }

    assert_eq!(store.reaction_count(message_id), 1, "one entry per (message, user)");

    let last_set = a
        .drain()
        .iter()
        .rev()
        .find_map(|e| match e {
            ServerEvent::MessageReaction { reactions, .. } => Some(reactions.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_set.len(), 1);
    assert_eq!(last_set[0].user_id, bob);
    assert_eq!(last_set[0].emoji, "❤️", "last write wins");
}

#[tokio::test]
async fn read_receipt_targets_sender_only() {
    let (router, store, _push) = setup();
    let chat = Uuid::new_v4();
    let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    store.add_chat(chat, &[alice, bob, carol]);

    let mut a = connect(&router, alice, "alice").await;
    let mut b = connect(&router, bob, "bob").await;
    let mut c = connect(&router, carol, "carol").await;

    router
        .dispatch(
            &a.ctx,
            ClientEvent::MessageSend {
                chat_id: chat,
                content: "read me".into(),
                kind: MessageKind::Text,
                reply_to: None,
            },
        )
        .await;
    let message_id = b
        .drain()
        .iter()
        .find_map(|e| match e {
            ServerEvent::MessageNew { message, .. } => Some(message.id),
            _ => None,
        })
        .unwrap();
    a.drain();
    c.drain();

    router
        .dispatch(
            &b.ctx,
            ClientEvent::MessageRead {
                message_id,
                chat_id: chat,
            },
        )
        .await;

    let receipts = a.drain();
    assert_eq!(receipts.len(), 1, "sender gets exactly one receipt");
    match &receipts[0] {
        ServerEvent::MessageRead {
            message_id: mid,
            read_by,
            chat_id,
        } => {
            assert_eq!(*mid, message_id);
            assert_eq!(*read_by, bob);
            assert_eq!(*chat_id, chat);
        }
        other => panic!("expected message:read, got {:?}", other),
    }
    assert!(c.drain().is_empty(), "receipts are not room broadcasts");

    // re-reading is a no-op at the store level but still re-notifies nobody new
    router
        .dispatch(
            &b.ctx,
            ClientEvent::MessageRead {
                message_id,
                chat_id: chat,
            },
        )
        .await;
    assert!(b.drain().iter().all(|e| !matches!(e, ServerEvent::Error { .. })));
}

#[tokio::test]
async fn read_receipt_dropped_when_sender_offline() {
    let (router, store, _push) = setup();
    let chat = Uuid::new_v4();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    store.add_chat(chat, &[alice, bob]);

    let mut a = connect(&router, alice, "alice").await;
    let mut b = connect(&router, bob, "bob").await;

    router
        .dispatch(
            &a.ctx,
            ClientEvent::MessageSend {
                chat_id: chat,
                content: "bye".into(),
                kind: MessageKind::Text,
                reply_to: None,
            },
        )
        .await;
    let message_id = b
        .drain()
        .iter()
        .find_map(|e| match e {
            ServerEvent::MessageNew { message, .. } => Some(message.id),
            _ => None,
        })
        .unwrap();

    // clear alice's own message:new and message:sent before she goes away
    a.drain();
    close_session(&router, alice, a.ctx.conn_id).await;
    b.drain();

    router
        .dispatch(
            &b.ctx,
            ClientEvent::MessageRead {
                message_id,
                chat_id: chat,
            },
        )
        .await;

    // routing miss: no error, nothing delivered anywhere
    assert!(b.drain().iter().all(|e| !matches!(e, ServerEvent::Error { .. })));
    assert!(a.drain().is_empty());
}

#[tokio::test]
async fn status_change_is_broadcast_globally() {
    let (router, store, _push) = setup();
    let chat = Uuid::new_v4();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    // bob shares no chat with alice; presence still reaches him
    store.add_chat(chat, &[alice]);

    let mut a = connect(&router, alice, "alice").await;
    let mut b = connect(&router, bob, "bob").await;

    router
        .dispatch(&a.ctx, ClientEvent::UserStatus { status: PresenceStatus::Busy })
        .await;

    let seen = b.drain();
    assert!(
        seen.iter().any(|e| matches!(
            e,
            ServerEvent::UserStatus { user_id, status: PresenceStatus::Busy, .. } if *user_id == alice
        )),
        "status fan-out is global, not room-scoped"
    );
    assert!(
        a.drain().iter().all(|e| !matches!(e, ServerEvent::UserStatus { .. })),
        "originator is excluded"
    );
}

#[tokio::test]
async fn disconnect_clears_registry_and_presence() {
    let (router, store, _push) = setup();
    let chat = Uuid::new_v4();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    store.add_chat(chat, &[alice, bob]);

    let a = connect(&router, alice, "alice").await;
    let mut b = connect(&router, bob, "bob").await;
    b.drain();

    close_session(&router, alice, a.ctx.conn_id).await;

    assert!(!router.registry.is_connected(alice).await);
    assert!(router.rooms.members(chat).await == vec![bob]);
    assert_eq!(
        router.presence.get(alice).await.unwrap().status,
        PresenceStatus::Offline
    );
    assert!(
        b.drain().iter().any(|e| matches!(
            e,
            ServerEvent::UserStatus { user_id, status: PresenceStatus::Offline, .. } if *user_id == alice
        )),
        "offline transition is announced"
    );
    assert_eq!(
        *store.state.lock().unwrap().presence.get(&alice).unwrap(),
        PresenceStatus::Offline
    );
}

#[tokio::test]
async fn reconnect_displaces_stale_session() {
    let (router, store, _push) = setup();
    let chat = Uuid::new_v4();
    let alice = Uuid::new_v4();
    store.add_chat(chat, &[alice]);

    let mut first = connect(&router, alice, "alice").await;
    let (_, displaced) = router
        .registry
        .register(
            alice,
            SessionHandle {
                conn_id: Uuid::new_v4(),
                tx: mpsc::unbounded_channel().0,
                connected_at: Utc::now(),
            },
        )
        .await;

    // closing the displaced handle tells the first connection to shut down
    displaced.unwrap().close();
    assert!(matches!(first.rx.try_recv(), Ok(Outbound::Shutdown)));

    // the stale teardown must not clear the new registration
    close_session(&router, alice, first.ctx.conn_id).await;
    assert!(router.registry.is_connected(alice).await);
}

#[tokio::test]
async fn slow_handshake_cannot_strip_newer_session_rooms() {
    let (router, store, _push) = setup();
    let chat = Uuid::new_v4();
    let alice = Uuid::new_v4();
    store.add_chat(chat, &[alice]);

    // first connection registers, then stalls before joining its rooms
    let first_conn = Uuid::new_v4();
    let (tx1, _rx1) = mpsc::unbounded_channel();
    let (first_epoch, _) = router
        .registry
        .register(
            alice,
            SessionHandle {
                conn_id: first_conn,
                tx: tx1,
                connected_at: Utc::now(),
            },
        )
        .await;

    // a reconnect completes its whole handshake in the meantime
    let second_conn = Uuid::new_v4();
    let (tx2, _rx2) = mpsc::unbounded_channel();
    let (second_epoch, displaced) = router
        .registry
        .register(
            alice,
            SessionHandle {
                conn_id: second_conn,
                tx: tx2,
                connected_at: Utc::now(),
            },
        )
        .await;
    displaced.unwrap().close();
    router
        .rooms
        .join_all(&[chat], alice, second_conn, second_epoch)
        .await;

    // the stalled first connection finally joins, then tears down
    router
        .rooms
        .join_all(&[chat], alice, first_conn, first_epoch)
        .await;
    close_session(&router, alice, first_conn).await;

    // the newer session stays registered AND subscribed
    assert!(router.registry.is_connected(alice).await);
    assert_eq!(router.rooms.members(chat).await, vec![alice]);
}
