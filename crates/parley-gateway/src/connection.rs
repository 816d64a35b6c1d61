use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use parley_types::api::Claims;
use parley_types::events::{ClientEvent, ServerEvent};
use parley_types::models::PresenceStatus;

use crate::registry::{Outbound, SessionHandle};
use crate::router::Router;
use crate::session::SessionContext;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Grace period for the identify handshake. Connections that have not
/// authenticated by then are forcibly closed so half-open sockets cannot
/// accumulate.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Drive one WebSocket connection through its whole lifecycle:
/// Connecting -> Authenticating -> Active -> Closing -> Closed.
pub async fn handle_connection(socket: WebSocket, router: Router, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    // Authenticating: first frame must be identify{token} within the grace
    // period. Failure terminates the connection without ever going Active.
    let (user_id, username) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(identity) => identity,
        None => {
            warn!("WebSocket client failed to identify, closing");
            let failure = ServerEvent::Error {
                message: "authentication failed".into(),
            };
            let _ = sender
                .send(Message::Text(
                    serde_json::to_string(&failure).unwrap().into(),
                ))
                .await;
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    let conn_id = Uuid::new_v4();
    let (tx, mut user_rx) = mpsc::unbounded_channel();

    let ready = ServerEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    // Going Active: take over the registry slot and close any session this
    // connection displaced. The epoch guards the room joins below against a
    // reconnect racing this handshake.
    let (epoch, displaced) = router
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
    if let Some(stale) = displaced {
        info!("{} ({}) reconnected, displacing previous session", username, user_id);
        stale.close();
    }

    // Membership cache, loaded once. A load failure degrades the session to
    // zero rooms; it does not terminate the connection.
    let chat_ids: Vec<Uuid> = match router.load_memberships(user_id).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!("{} ({}): failed to load chat memberships: {}", username, user_id, e);
            Vec::new()
        }
    };
    router.rooms.join_all(&chat_ids, user_id, conn_id, epoch).await;

    let ctx = SessionContext::new(
        user_id,
        username.clone(),
        conn_id,
        chat_ids.iter().copied().collect::<HashSet<_>>(),
        tx.clone(),
    );

    // Send current presence to this client so it sees who is already here.
    for (peer_id, entry) in router.presence.online_snapshot().await {
        if peer_id == user_id {
            continue;
        }
        let event = ServerEvent::UserStatus {
            user_id: peer_id,
            status: entry.status,
            last_seen: entry.last_seen,
        };
        if sender
            .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
            .await
            .is_err()
        {
            return;
        }
    }

    // Mark presence online and announce it to everyone else.
    let entry = router.presence.set_online(user_id).await;
    router
        .persist_presence(user_id, PresenceStatus::Online, entry.last_seen)
        .await;
    router
        .registry
        .broadcast_all(
            &ServerEvent::UserStatus {
                user_id,
                status: PresenceStatus::Online,
                last_seen: entry.last_seen,
            },
            Some(user_id),
        )
        .await;

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward routed events -> client, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = user_rx.recv() => {
                    let event = match result {
                        Some(Outbound::Event(event)) => event,
                        Some(Outbound::Shutdown) | None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read events from the client and hand them to the router. Events are
    // handled in arrival order on this task; cross-kind ordering beyond the
    // transport's per-connection ordering is not guaranteed.
    let router_recv = router.clone();
    let ctx_recv = ctx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => router_recv.dispatch(&ctx_recv, event).await,
                    Err(e) => {
                        let snippet = text.get(..200).unwrap_or(&text);
                        warn!(
                            "{} ({}) bad event: {} -- raw: {}",
                            ctx_recv.username, ctx_recv.user_id, e, snippet
                        );
                        router_recv.reject(&ctx_recv, "unrecognized event");
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Active until either task finishes (socket death or displacement).
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    close_session(&router, user_id, conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

/// Closing -> Closed: release room subscriptions owned by this connection,
/// and only if the registry entry is still ours, clear it and go offline.
/// A session displaced by a newer reconnect must not touch presence.
pub async fn close_session(router: &Router, user_id: Uuid, conn_id: Uuid) {
    router.rooms.leave_all(user_id, conn_id).await;

    if !router.registry.unregister(user_id, conn_id).await {
        return;
    }

    let entry = router.presence.set_offline(user_id).await;
    router
        .persist_presence(user_id, PresenceStatus::Offline, entry.last_seen)
        .await;
    router
        .registry
        .broadcast_all(
            &ServerEvent::UserStatus {
                user_id,
                status: PresenceStatus::Offline,
                last_seen: entry.last_seen,
            },
            Some(user_id),
        )
        .await;
}

async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(ClientEvent::Identify { token }) =
                    serde_json::from_str::<ClientEvent>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.username));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}
