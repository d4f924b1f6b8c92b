//! WebSocket handler: one socket, one session coordinator.
//!
//! Text frames carry JSON events; binary frames carry raw terminal bytes in
//! both directions.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use berth_protocol::{ClientEvent, Frame, ServerEvent};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::session::SessionManager;

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// Inbound events buffered ahead of the coordinator.
const INBOUND_BUFFER_SIZE: usize = 256;

/// How long queued output may take to flush after the session ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// WebSocket upgrade handler.
///
/// GET /ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let sessions = state.sessions.clone();
    ws.on_upgrade(move |socket| handle_ws_connection(socket, sessions))
}

async fn handle_ws_connection(socket: WebSocket, sessions: Arc<SessionManager>) {
    let (coordinator, mut outbound) = sessions.open();
    let connection_id = coordinator.connection_id().to_string();
    let cancel = coordinator.cancel_token();
    let terminated = coordinator.terminated();
    let errors = coordinator.outbound();
    info!(connection_id = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel::<ClientEvent>(INBOUND_BUFFER_SIZE);

    let flush = CancellationToken::new();
    let send_flush = flush.clone();
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping_interval.tick().await;

        loop {
            tokio::select! {
                event = outbound.recv() => match event {
                    Some(event) => {
                        if send_event(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
                _ = send_flush.cancelled() => {
                    while let Ok(event) = outbound.try_recv() {
                        if send_event(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let run_task = tokio::spawn(coordinator.run(inbound_rx));

    loop {
        tokio::select! {
            _ = terminated.cancelled() => break,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    forward(&inbound_tx, &errors, &connection_id, Frame::Text(text.to_string())).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    forward(&inbound_tx, &errors, &connection_id, Frame::Binary(data)).await;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    info!(connection_id = %connection_id, "WebSocket closed by client");
                    break;
                }
                Some(Err(e)) => {
                    warn!(connection_id = %connection_id, error = %e, "WebSocket error");
                    break;
                }
            },
        }
    }

    // Disconnect drives the coordinator to teardown.
    cancel.cancel();
    drop(inbound_tx);
    if let Err(e) = run_task.await {
        warn!(connection_id = %connection_id, error = %e, "Coordinator task failed");
    }

    flush.cancel();
    drop(errors);
    if tokio::time::timeout(FLUSH_TIMEOUT, send_task).await.is_err() {
        debug!(connection_id = %connection_id, "Timed out flushing output");
    }
    info!(connection_id = %connection_id, "WebSocket connection finished");
}

/// Decode a frame and hand it to the coordinator. Malformed frames are
/// answered with an error event.
async fn forward(
    inbound: &mpsc::Sender<ClientEvent>,
    errors: &mpsc::Sender<ServerEvent>,
    connection_id: &str,
    frame: Frame,
) {
    match ClientEvent::decode(frame) {
        Ok(event) => {
            if inbound.send(event).await.is_err() {
                debug!(connection_id = %connection_id, "Coordinator gone, dropping event");
            }
        }
        Err(e) => {
            warn!(connection_id = %connection_id, error = %e, "Malformed client event");
            let _ = errors.try_send(ServerEvent::error(e.to_string()));
        }
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let message = match event.encode() {
        Ok(Frame::Text(text)) => Message::Text(text.into()),
        Ok(Frame::Binary(bytes)) => Message::Binary(bytes),
        Err(e) => {
            warn!(error = %e, "Failed to encode event");
            return Ok(());
        }
    };
    sender.send(message).await
}
