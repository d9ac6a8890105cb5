//! Axum WebSocket transport for the Signal Broadcaster (§4.6, §6).
//! Keeps the axum-specific plumbing out of `broadcaster.rs` so that
//! module's fan-out logic stays testable without a running server.

use crate::broadcaster::{pong_event, welcome_event, CloseCode, StreamKind, WsClientMessage};
use crate::models::WsServerEvent;
use crate::orchestrator::PipelineHandles;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

fn to_message(event: &WsServerEvent) -> Message {
    // Serialization failures here would be a programmer error in the
    // `WsServerEvent` shape, not a runtime condition to recover from.
    Message::Text(serde_json::to_string(event).expect("WsServerEvent always serializes"))
}

/// `/ws/<stream>` (§6): `stream` selects whether the subscriber
/// receives whale alerts or price ticks. An unknown stream name is
/// rejected before the upgrade completes.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(stream): Path<String>,
    State(handles): State<Arc<PipelineHandles>>,
) -> axum::response::Response {
    match StreamKind::parse(&stream) {
        Some(stream) => ws.on_upgrade(move |socket| handle_socket(socket, handles, stream)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Awaits the client's `{type:"auth", token}` message within
/// `authTimeout` (§4.6). Returns `None` on timeout, a missing/invalid
/// token, or an early close — any of which closes the connection with
/// 1008 rather than registering a subscriber.
async fn await_auth(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    handles: &Arc<PipelineHandles>,
) -> Option<(bool, Vec<String>)> {
    let deadline = handles.auth_timeout;
    loop {
        let next = tokio::time::timeout(deadline, receiver.next()).await;
        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            _ => return None, // timeout elapsed, stream closed, or a transport error
        };
        match msg {
            Message::Text(text) => {
                let Ok(client_msg) = serde_json::from_str::<WsClientMessage>(&text) else {
                    continue;
                };
                if client_msg.kind != "auth" {
                    continue;
                }
                return match client_msg.token.as_deref().map(|t| handles.auth.verify(t)) {
                    Some(Ok(claims)) => Some((true, claims.permissions)),
                    _ => None,
                };
            }
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn handle_socket(socket: WebSocket, handles: Arc<PipelineHandles>, stream: StreamKind) {
    let (mut sender, mut receiver) = socket.split();

    let (authenticated, permissions) = if !handles.auth_enabled {
        (true, vec!["read".to_string()])
    } else {
        match await_auth(&mut receiver, &handles).await {
            Some(result) => result,
            None => {
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::AuthFailure as u16,
                        reason: "auth timed out or token rejected".into(),
                    })))
                    .await;
                return;
            }
        }
    };

    let handle = handles.broadcaster.register(authenticated, stream);
    let subscriber_id = handle.id.clone();

    let welcome = welcome_event(&subscriber_id, authenticated, permissions);
    if sender.send(to_message(&welcome)).await.is_err() {
        handles.broadcaster.unregister(&subscriber_id);
        return;
    }

    info!(component = "broadcaster", subscriber_id = %subscriber_id, authenticated, "subscriber connected");

    let mut outbound = handle.receiver;
    let write_task = tokio::spawn(async move {
        // Server-initiated ping every 30s (§4.6); a transport-level pong
        // from the client feeds `touch_pong` via the read loop below.
        let mut ping_ticker = tokio::time::interval(Duration::from_secs(30));
        ping_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_ticker.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                event = outbound.recv() => {
                    match event {
                        Some(event) => {
                            if sender.send(to_message(&event)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_ticker.tick() => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                if let Ok(client_msg) = serde_json::from_str::<WsClientMessage>(&text) {
                    if client_msg.kind == "ping" {
                        handles.broadcaster.touch_pong(&subscriber_id);
                        handles.broadcaster.send_to(&subscriber_id, pong_event());
                    }
                }
            }
            Message::Pong(_) => handles.broadcaster.touch_pong(&subscriber_id),
            Message::Close(_) => break,
            _ => {}
        }
    }

    write_task.abort();
    handles.broadcaster.unregister(&subscriber_id);
    info!(component = "broadcaster", subscriber_id = %subscriber_id, "subscriber disconnected");
}

/// Periodic liveness sweep: disconnects subscribers that haven't
/// ponged within `ping_timeout` (§4.6).
pub async fn run_liveness_sweep(
    handles: Arc<PipelineHandles>,
    ping_timeout: Duration,
    mut cancel: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                for id in handles.broadcaster.unresponsive_subscribers(ping_timeout) {
                    warn!(component = "broadcaster", subscriber_id = %id, "evicting unresponsive subscriber");
                    handles.broadcaster.unregister(&id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_frame_uses_auth_failure_code() {
        assert_eq!(CloseCode::AuthFailure as u16, 1008);
    }
}
