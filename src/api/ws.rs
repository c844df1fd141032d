//! Event subscription channel.
//!
//! On connect the client receives a snapshot (system status + current
//! queue), then a stream of `{type, data, timestamp}` envelopes. The
//! channel is bidirectional only for keepalives: if no Pong arrives within
//! [`PONG_TIMEOUT`] after a Ping, the connection is considered dead.

use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::SharedState;
use crate::events::{UiEvent, envelope_json};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (mut sender, receiver) = socket.split();
    let rx = state.store.events().subscribe();

    if send_snapshot(&mut sender, &state).await.is_err() {
        return;
    }
    run_socket_loop(sender, receiver, rx).await;
}

/// Current state so a fresh client renders without waiting for changes.
async fn send_snapshot(
    sender: &mut SplitSink<WebSocket, Message>,
    state: &SharedState,
) -> Result<(), axum::Error> {
    let config = state.config.get();
    let counts = state.store.queue_counts().await.unwrap_or_default();
    let active = state.store.active_phases().await.unwrap_or_default();

    let events = [
        UiEvent::SystemStatus {
            paused: config.paused,
            max_concurrent: config.max_concurrent,
            counts,
        },
        UiEvent::QueueUpdate { counts, active },
    ];
    for event in &events {
        match envelope_json(event) {
            Ok(json) => sender.send(Message::Text(json.into())).await?,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize snapshot event");
            }
        }
    }
    Ok(())
}

/// Core socket loop: broadcast forwarding, client keepalives, and periodic
/// pings in a single select. A subscriber that falls behind the broadcast
/// buffer is resynced by dropping the lagged messages; one that stops
/// answering pings is disconnected without affecting other subscribers.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "subscriber lagged, continuing");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Clients only speak keepalives; ignore the rest.
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
