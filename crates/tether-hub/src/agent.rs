use crate::{
    connection::{next_tick, ping_ticker, write_loop},
    server::AppState,
};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{stream::SplitStream, StreamExt};
use std::{net::SocketAddr, time::Duration};
use tether_core::{
    discovery::is_safe_session_id,
    protocol::{decode_json_frame, encode_json_frame, AgentFrame, ServerFrame},
    SessionEvent,
};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

const AGENT_QUEUE: usize = 32;
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

fn queue_frame(tx: &mpsc::Sender<Message>, frame: &ServerFrame) {
    if let Ok(text) = encode_json_frame(frame) {
        let _ = tx.try_send(Message::Text(text));
    }
}

/// One agent process publishing a single session's events.
pub async fn run_agent(state: AppState, socket: WebSocket, remote: SocketAddr) {
    let conn_id = state.next_conn_id();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(AGENT_QUEUE);
    let (_never_evicted, evicted) = watch::channel(None);
    let write_task = tokio::spawn(write_loop(
        ws_sender,
        rx,
        evicted,
        state.config.write_timeout,
        conn_id.clone(),
    ));
    let max_frame_bytes = state.config.max_frame_bytes;

    let Some(session_id) = handshake(&state, &mut ws_receiver, &tx, &conn_id, remote).await else {
        drop(tx);
        let _ = write_task.await;
        return;
    };
    info!(event = "handshake_ok", conn_id = %conn_id, session_id = %session_id, remote = %remote);

    let mut ping = ping_ticker(state.config.ping_interval);
    let reason = loop {
        let incoming = tokio::select! {
            _ = next_tick(&mut ping) => {
                if tx.try_send(Message::Ping(Vec::new())).is_err() {
                    warn!(event = "ping_failed", conn_id = %conn_id);
                    break "agent_unresponsive";
                }
                continue;
            }
            incoming = ws_receiver.next() => incoming,
        };
        let text = match incoming {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(_))) => {
                queue_frame(
                    &tx,
                    &ServerFrame::error("invalid_frame", "agent frames are JSON text"),
                );
                continue;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => break "agent_disconnected",
            Some(Err(err)) => {
                warn!(event = "read_error", conn_id = %conn_id, error = %err);
                break "agent_disconnected";
            }
        };
        match decode_json_frame::<AgentFrame>(text.as_bytes(), max_frame_bytes) {
            Ok(AgentFrame::Event(frame)) => match SessionEvent::from_value(frame.event) {
                Ok(event) => {
                    state.hub.ingest(&session_id, event).await;
                }
                Err(err) => {
                    warn!(event = "event_invalid", conn_id = %conn_id, error = %err);
                    queue_frame(
                        &tx,
                        &ServerFrame::session_error(&session_id, "invalid_event", err.to_string()),
                    );
                }
            },
            Ok(AgentFrame::Exit(exit)) => {
                info!(
                    event = "agent_exit",
                    conn_id = %conn_id,
                    session_id = %session_id,
                    code = ?exit.code
                );
                break "agent_exit";
            }
            Ok(AgentFrame::Hello(_)) => {
                queue_frame(&tx, &ServerFrame::error("unexpected_hello", "already attached"));
            }
            Err(err) => {
                warn!(event = "message_invalid", conn_id = %conn_id, error = %err);
                queue_frame(&tx, &ServerFrame::error(err.code(), err.to_string()));
            }
        }
    };

    state.hub.end_session(&session_id, Some(conn_id.as_str()), reason).await;
    drop(tx);
    let _ = write_task.await;
}

async fn handshake(
    state: &AppState,
    ws_receiver: &mut SplitStream<WebSocket>,
    tx: &mpsc::Sender<Message>,
    conn_id: &str,
    remote: SocketAddr,
) -> Option<String> {
    let first = match tokio::time::timeout(HELLO_TIMEOUT, ws_receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => {
            warn!(event = "expected_hello", conn_id = conn_id, remote = %remote);
            queue_frame(tx, &ServerFrame::error("expected_hello", "first frame must be hello"));
            return None;
        }
        Err(_) => {
            warn!(event = "hello_timeout", conn_id = conn_id, remote = %remote);
            return None;
        }
    };
    let decoded = decode_json_frame::<AgentFrame>(first.as_bytes(), state.config.max_frame_bytes);
    let session_id = match decoded {
        Ok(AgentFrame::Hello(hello)) => hello.session_id,
        Ok(_) => {
            warn!(event = "expected_hello", conn_id = conn_id, remote = %remote);
            queue_frame(tx, &ServerFrame::error("expected_hello", "first frame must be hello"));
            return None;
        }
        Err(err) => {
            warn!(event = "hello_parse", conn_id = conn_id, error = %err);
            queue_frame(tx, &ServerFrame::error(err.code(), err.to_string()));
            return None;
        }
    };
    if !is_safe_session_id(&session_id) {
        queue_frame(
            tx,
            &ServerFrame::session_error(&session_id, "invalid_session_id", "invalid session id"),
        );
        return None;
    }
    if let Err(err) = state.hub.attach_agent(&session_id, conn_id).await {
        warn!(
            event = "publisher_rejected",
            conn_id = conn_id,
            session_id = %session_id,
            error = %err
        );
        queue_frame(
            tx,
            &ServerFrame::session_error(&session_id, err.code(), err.to_string()),
        );
        return None;
    }
    Some(session_id)
}
