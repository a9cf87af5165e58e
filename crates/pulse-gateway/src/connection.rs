use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use pulse_db::Database;
use pulse_types::frames::{ClientFrame, ServerFrame};

use crate::presence::PresenceRegistry;
use crate::relay::MessageRelay;
use crate::typing::TypingChannel;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A fresh connection must identify itself with a `Join` frame within this
/// long or the socket is closed.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a connection session needs: shared by the server binary and
/// every live socket task.
#[derive(Clone)]
pub struct Gateway {
    pub presence: PresenceRegistry,
    pub relay: MessageRelay,
    pub typing: TypingChannel,
    pub db: Arc<Database>,
}

impl Gateway {
    pub fn new(db: Arc<Database>) -> Self {
        let presence = PresenceRegistry::new();
        Self {
            relay: MessageRelay::new(db.clone(), presence.clone()),
            typing: TypingChannel::new(presence.clone()),
            presence,
            db,
        }
    }
}

/// Handle a single WebSocket connection from handshake to cleanup.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: the first frame must be Join.
    let Some((user_id, display_name)) = wait_for_join(&mut receiver).await else {
        warn!("WebSocket client failed to join, closing");
        return;
    };

    // Refresh the identity mirror off the async runtime.
    {
        let db = gateway.db.clone();
        let uid = user_id.to_string();
        let name = display_name.clone();
        let upserted = tokio::task::spawn_blocking(move || db.upsert_user(&uid, &name)).await;
        match upserted {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("identity upsert failed for {}: {}", user_id, e);
                return;
            }
            Err(e) => {
                warn!("spawn_blocking join error: {}", e);
                return;
            }
        }
    }

    info!("{} ({}) connected to gateway", display_name, user_id);

    let connection_id = Uuid::new_v4();
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<ServerFrame>();

    // Acknowledge the join, then seed the client with who is already online.
    // The snapshot is taken before our own registration so announcing
    // ourselves reaches everyone else but not this socket.
    let joined = ServerFrame::Joined { user_id };
    if send_frame(&mut sender, &joined).await.is_err() {
        return;
    }
    let snapshot = ServerFrame::PresenceSnapshot {
        user_ids: gateway.presence.snapshot(),
    };
    if send_frame(&mut sender, &snapshot).await.is_err() {
        return;
    }

    gateway.presence.join(user_id, connection_id, conn_tx.clone());

    // Last recipient this socket said `is_typing = true` toward; cleared by
    // an explicit stop and replayed as a synthetic stop on disconnect.
    let active_typing: Arc<Mutex<Option<Uuid>>> = Arc::new(Mutex::new(None));

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Outbound half: registry-fanned frames plus heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                frame = conn_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if send_frame(&mut sender, &frame).await.is_err() {
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

    // Inbound half: parse and dispatch client frames.
    let gateway_recv = gateway.clone();
    let reply_tx = conn_tx.clone();
    let typing_state = active_typing.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => {
                        handle_frame(
                            &gateway_recv,
                            user_id,
                            connection_id,
                            frame,
                            &reply_tx,
                            &typing_state,
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!("{} bad frame: {} -- raw: {}", user_id, e, frame_preview(&text));
                        let _ = reply_tx.send(ServerFrame::Error {
                            code: "validation".into(),
                            message: format!("malformed frame: {}", e),
                        });
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

    // Wait for either half to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Transport disconnects are lifecycle, not errors: drop presence and
    // clear any stuck typing indicator.
    gateway.presence.leave(connection_id);
    let stuck = active_typing.lock().expect("typing state lock poisoned").take();
    if let Some(to) = stuck {
        gateway.typing.set_typing(user_id, to, false);
    }

    info!("{} ({}) disconnected from gateway", display_name, user_id);
}

async fn send_frame(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    sender
        .send(Message::Text(serde_json::to_string(frame).unwrap().into()))
        .await
}

async fn wait_for_join(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
) -> Option<(Uuid, String)> {
    let deadline = tokio::time::timeout(JOIN_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            // Control frames (ping/pong) may precede the handshake; the
            // first text frame must be Join or the socket is closed.
            if let Message::Text(text) = msg {
                return parse_join(&text);
            }
        }
        None
    });

    deadline.await.ok().flatten()
}

fn parse_join(text: &str) -> Option<(Uuid, String)> {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Join {
            user_id,
            display_name,
        }) => Some((user_id, display_name)),
        _ => None,
    }
}

/// Clip a raw frame for logging without splitting a multibyte character.
fn frame_preview(text: &str) -> String {
    text.chars().take(200).collect()
}

async fn handle_frame(
    gateway: &Gateway,
    user_id: Uuid,
    connection_id: Uuid,
    frame: ClientFrame,
    reply_tx: &mpsc::UnboundedSender<ServerFrame>,
    typing_state: &Arc<Mutex<Option<Uuid>>>,
) {
    match frame {
        ClientFrame::Join { .. } => {
            // Already joined; re-binding a live connection is not supported.
            warn!("{} sent Join on an established connection", user_id);
        }

        ClientFrame::SendMessage { to_user_id, text } => {
            match gateway
                .relay
                .send(user_id, to_user_id, text, Some(connection_id))
                .await
            {
                Ok(message) => {
                    // Confirmed frame back to the originating connection so
                    // the client can reconcile its optimistic placeholder.
                    let _ = reply_tx.send(ServerFrame::message(&message));
                }
                Err(e) => {
                    warn!("{} send failed: {}", user_id, e);
                    let _ = reply_tx.send(ServerFrame::error(&e));
                }
            }
        }

        ClientFrame::Typing {
            to_user_id,
            is_typing,
        } => {
            {
                let mut state = typing_state.lock().expect("typing state lock poisoned");
                *state = if is_typing { Some(to_user_id) } else { None };
            }
            gateway.typing.set_typing(user_id, to_user_id, is_typing);
        }
    }
}
