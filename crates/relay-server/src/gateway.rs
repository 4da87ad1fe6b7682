//! WebSocket side of a relay connection.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use relay_core::{ClientCommand, ConnectionId, RelayError};
use tokio::sync::mpsc;

use crate::server::AppState;
use crate::session::{Outbound, Session, SessionInput};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const INBOUND_QUEUE: usize = 16;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Serve one WebSocket connection until the client leaves or the relay
/// terminates the session. Returns after the session's transcoder has been
/// reaped and the session removed from the registry.
pub async fn handle_ws_connection(socket: WebSocket, state: AppState) {
    let conn_id = ConnectionId::new();
    let (status, terminate) = state.registry.register(conn_id.clone());
    state.metrics.counter_inc("relay.sessions_opened", &[], 1);
    state
        .metrics
        .gauge_set("relay.active_sessions", &[], state.registry.count() as f64);
    tracing::info!(conn_id = %conn_id, "Client connected");

    let (out_tx, mut out_rx) = mpsc::channel::<String>(state.max_send_queue);
    let (in_tx, in_rx) = mpsc::channel::<SessionInput>(INBOUND_QUEUE);

    let session = Session::new(
        conn_id.clone(),
        Arc::clone(&state.settings),
        Arc::clone(&state.transcoder),
        Outbound::new(out_tx),
        status,
        Arc::clone(&state.metrics),
    );
    let session_task = tokio::spawn(session.run(in_rx, terminate.clone()));

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: outbound queue to socket, plus heartbeat. Ends once the session
    // drops its sender and the queue is drained.
    let writer_id = conn_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = out_rx.recv() => match msg {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                },
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(bytes::Bytes::new())).await.is_err() {
                        break;
                    }
                    tracing::trace!(conn_id = %writer_id, "Sent ping");
                }
            }
        }
    });

    // Reader: socket to session inputs.
    loop {
        let msg = tokio::select! {
            _ = terminate.cancelled() => break,
            msg = ws_rx.next() => msg,
        };

        let input = match msg {
            Some(Ok(WsMessage::Text(text))) => match ClientCommand::decode(text.as_str()) {
                Ok(cmd) => SessionInput::Command(cmd),
                Err(err) => {
                    tracing::debug!(conn_id = %conn_id, error = %err, "Undecodable client message");
                    SessionInput::Rejected(err)
                }
            },
            Some(Ok(WsMessage::Binary(_))) => SessionInput::Rejected(RelayError::InvalidCommand(
                "binary messages are not supported".into(),
            )),
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket read failed");
                break;
            }
        };

        if in_tx.send(input).await.is_err() {
            break;
        }
    }

    let _ = in_tx.send(SessionInput::Disconnected).await;
    drop(in_tx);
    if let Err(e) = session_task.await {
        tracing::error!(conn_id = %conn_id, error = %e, "Session task failed");
    }

    state.registry.remove(&conn_id);
    state
        .metrics
        .gauge_set("relay.active_sessions", &[], state.registry.count() as f64);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    tracing::info!(conn_id = %conn_id, "Client disconnected");
}
