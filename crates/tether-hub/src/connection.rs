use crate::{
    client::{ClientHandle, Delivery},
    hub::HubError,
    server::AppState,
    terminal::{TerminalMux, TerminalOutput, TerminalSpec, DEFAULT_COLS, DEFAULT_ROWS},
};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::{borrow::Cow, collections::HashSet, net::SocketAddr, path::PathBuf, time::Duration};
use tether_core::{
    discovery::is_safe_session_id,
    protocol::{
        decode_json_frame, decode_terminal_frame, encode_json_frame, encode_terminal_frame,
        ClientFrame, FrameError, ServerFrame, TerminalExited, TerminalOpened, MAX_TERMINAL_ID_BYTES,
    },
};
use tokio::{
    sync::{mpsc, watch},
    time::{Instant, Interval},
};
use tracing::{debug, info, warn};

const TERMINAL_OUTPUT_QUEUE: usize = 64;

/// Drains one connection's outbound queue into the socket. An eviction signal jumps the queue
/// and closes the socket with the eviction reason.
pub(crate) async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    mut evicted: watch::Receiver<Option<String>>,
    write_timeout: Duration,
    conn_id: String,
) {
    let mut watching = true;
    loop {
        let msg = tokio::select! {
            biased;
            changed = evicted.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let reason = evicted.borrow().clone();
                match reason {
                    Some(reason) => Message::Close(Some(CloseFrame {
                        code: close_code::POLICY,
                        reason: Cow::Owned(reason),
                    })),
                    None => continue,
                }
            }
            next = rx.recv() => match next {
                Some(msg) => msg,
                None => return,
            },
        };
        let closing = matches!(msg, Message::Close(_));
        match tokio::time::timeout(write_timeout, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(event = "write_error", conn_id = %conn_id, error = %err);
                return;
            }
            Err(_) => {
                warn!(event = "write_timeout", conn_id = %conn_id);
                return;
            }
        }
        if closing {
            return;
        }
    }
}

pub(crate) fn ping_ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    Some(tokio::time::interval_at(Instant::now() + period, period))
}

pub(crate) async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

struct ClientConnection {
    state: AppState,
    client: ClientHandle,
    tx: mpsc::Sender<Message>,
    terminals: TerminalMux,
    subscriptions: HashSet<String>,
}

pub async fn run_client(state: AppState, socket: WebSocket, remote: SocketAddr) {
    let conn_id = state.next_conn_id();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(state.config.queue_capacity);
    let (client, mut evicted) = ClientHandle::new(conn_id.as_str(), tx.clone());
    let write_task = tokio::spawn(write_loop(
        ws_sender,
        rx,
        evicted.clone(),
        state.config.write_timeout,
        conn_id.clone(),
    ));

    let (term_tx, mut term_rx) = mpsc::channel::<TerminalOutput>(TERMINAL_OUTPUT_QUEUE);
    let terminals = TerminalMux::new(
        state.terminals.clone(),
        term_tx,
        state.config.max_terminals,
    );
    let mut ping = ping_ticker(state.config.ping_interval);
    info!(event = "client_connected", conn_id = %conn_id, remote = %remote);

    let mut conn = ClientConnection {
        state,
        client,
        tx,
        terminals,
        subscriptions: HashSet::new(),
    };

    let reason = loop {
        tokio::select! {
            changed = evicted.changed() => {
                let reason = if changed.is_ok() { evicted.borrow().clone() } else { None };
                if let Some(reason) = reason {
                    break reason;
                }
            }
            _ = next_tick(&mut ping) => {
                if conn.client.offer(Message::Ping(Vec::new())) != Delivery::Queued {
                    conn.client.evict("slow_consumer");
                }
            }
            Some(output) = term_rx.recv() => conn.forward_terminal(output).await,
            incoming = ws_receiver.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => {
                        warn!(event = "read_error", conn_id = %conn_id, error = %err);
                        break "read_error".to_string();
                    }
                    None => break "disconnect".to_string(),
                };
                match msg {
                    Message::Text(text) => conn.handle_text(text.as_bytes()).await,
                    Message::Binary(bytes) => conn.handle_binary(&bytes),
                    Message::Close(_) => break "client_close".to_string(),
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    };

    conn.shutdown().await;
    drop(conn);
    info!(event = "client_disconnected", conn_id = %conn_id, reason = %reason);
    let _ = write_task.await;
}

impl ClientConnection {
    fn send_frame(&self, frame: &ServerFrame) {
        match encode_json_frame(frame) {
            Ok(text) => {
                if self.client.offer_text(text) == Delivery::Full {
                    self.client.evict("slow_consumer");
                }
            }
            Err(err) => {
                warn!(event = "frame_encode_error", conn_id = self.client.conn_id(), error = %err);
            }
        }
    }

    fn send_frame_error(&self, err: &FrameError) {
        warn!(event = "frame_invalid", conn_id = self.client.conn_id(), error = %err);
        self.send_frame(&ServerFrame::error(err.code(), err.to_string()));
    }

    async fn handle_text(&mut self, raw: &[u8]) {
        let frame = match decode_json_frame::<ClientFrame>(raw, self.state.config.max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                self.send_frame_error(&err);
                return;
            }
        };
        match frame {
            ClientFrame::Subscribe(request) => {
                if !is_safe_session_id(&request.session_id) {
                    self.send_frame(&ServerFrame::session_error(
                        &request.session_id,
                        "invalid_session_id",
                        "session id is empty or contains path separators",
                    ));
                    return;
                }
                let result = self
                    .state
                    .hub
                    .subscribe(
                        &request.session_id,
                        self.client.clone(),
                        request.resume_cursor,
                        request.epoch.as_deref(),
                    )
                    .await;
                match result {
                    Ok(_) => {
                        self.subscriptions.insert(request.session_id);
                    }
                    // Eviction is already in flight.
                    Err(HubError::Backpressure(_)) => {}
                    Err(err) => {
                        self.send_frame(&ServerFrame::session_error(
                            &request.session_id,
                            err.code(),
                            err.to_string(),
                        ));
                    }
                }
            }
            ClientFrame::Unsubscribe(request) => {
                self.subscriptions.remove(&request.session_id);
                self.state
                    .hub
                    .unsubscribe(&request.session_id, self.client.conn_id())
                    .await;
            }
            ClientFrame::Open(request) => {
                let id_len = request.terminal_id.len();
                if id_len == 0 || id_len > MAX_TERMINAL_ID_BYTES {
                    self.send_frame_error(&FrameError::InvalidTerminalIdLength(id_len));
                    return;
                }
                let terminal_id = request.terminal_id.clone();
                let spec = TerminalSpec {
                    terminal_id: request.terminal_id,
                    cols: request.cols.filter(|cols| *cols > 0).unwrap_or(DEFAULT_COLS),
                    rows: request.rows.filter(|rows| *rows > 0).unwrap_or(DEFAULT_ROWS),
                    cwd: request.cwd.map(PathBuf::from),
                };
                match self.terminals.open(spec) {
                    Ok(()) => self.send_frame(&ServerFrame::TerminalOpened(TerminalOpened {
                        terminal_id,
                    })),
                    Err(err) => self.send_frame(&ServerFrame::terminal_error(
                        &terminal_id,
                        err.code(),
                        err.to_string(),
                    )),
                }
            }
            ClientFrame::Input(request) => {
                let written = self
                    .terminals
                    .write(&request.terminal_id, request.data.as_bytes());
                if let Err(err) = written {
                    self.send_frame(&ServerFrame::terminal_error(
                        &request.terminal_id,
                        err.code(),
                        err.to_string(),
                    ));
                }
            }
            ClientFrame::Resize(request) => {
                let resized = self
                    .terminals
                    .resize(&request.terminal_id, request.cols, request.rows);
                if let Err(err) = resized {
                    self.send_frame(&ServerFrame::terminal_error(
                        &request.terminal_id,
                        err.code(),
                        err.to_string(),
                    ));
                }
            }
            ClientFrame::Exit(request) => match self.terminals.close(&request.terminal_id) {
                Ok(()) => self.send_frame(&ServerFrame::TerminalExit(TerminalExited {
                    terminal_id: request.terminal_id,
                    code: None,
                })),
                Err(err) => self.send_frame(&ServerFrame::terminal_error(
                    &request.terminal_id,
                    err.code(),
                    err.to_string(),
                )),
            },
            ClientFrame::Ping => self.send_frame(&ServerFrame::Pong),
        }
    }

    fn handle_binary(&mut self, raw: &[u8]) {
        let max = self.state.config.max_frame_bytes;
        if raw.len() > max {
            self.send_frame_error(&FrameError::OversizedFrame {
                size: raw.len(),
                max,
            });
            return;
        }
        let (terminal_id, payload) = match decode_terminal_frame(raw) {
            Ok(parts) => parts,
            Err(err) => {
                self.send_frame_error(&err);
                return;
            }
        };
        if let Err(err) = self.terminals.write(terminal_id, payload) {
            self.send_frame(&ServerFrame::terminal_error(terminal_id, err.code(), err.to_string()));
        }
    }

    /// Terminal output waits for queue space, up to the write timeout, so a busy shell slows
    /// down instead of evicting the connection.
    async fn forward_terminal(&mut self, output: TerminalOutput) {
        let msg = match output {
            TerminalOutput::Data {
                terminal_id,
                generation,
                bytes,
            } => {
                if !self.terminals.is_current(&terminal_id, generation) {
                    return;
                }
                match encode_terminal_frame(&terminal_id, &bytes) {
                    Ok(frame) => Message::Binary(frame),
                    Err(err) => {
                        warn!(
                            event = "terminal_frame_error",
                            terminal_id = %terminal_id,
                            error = %err
                        );
                        return;
                    }
                }
            }
            TerminalOutput::Exited {
                terminal_id,
                generation,
                code,
            } => {
                if !self.terminals.on_exit(&terminal_id, generation) {
                    return;
                }
                info!(
                    event = "terminal_exited",
                    conn_id = self.client.conn_id(),
                    terminal_id = %terminal_id,
                    code = ?code
                );
                match encode_json_frame(&ServerFrame::TerminalExit(TerminalExited {
                    terminal_id,
                    code,
                })) {
                    Ok(text) => Message::Text(text),
                    Err(_) => return,
                }
            }
        };
        let sent = tokio::time::timeout(self.state.config.write_timeout, self.tx.send(msg)).await;
        if !matches!(sent, Ok(Ok(()))) {
            self.client.evict("slow_consumer");
        }
    }

    async fn shutdown(&mut self) {
        for session_id in self.subscriptions.drain() {
            self.state
                .hub
                .unsubscribe(&session_id, self.client.conn_id())
                .await;
        }
        self.terminals.close_all();
    }
}
