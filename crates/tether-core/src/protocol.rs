use crate::event::SessionEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const MAX_TERMINAL_ID_BYTES: usize = u8::MAX as usize;

/// Frames a browser sends on the client socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    Open(OpenTerminal),
    Input(TerminalInput),
    Resize(TerminalResize),
    Exit(TerminalExitRequest),
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_cursor: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTerminal {
    pub terminal_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInput {
    pub terminal_id: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalResize {
    pub terminal_id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalExitRequest {
    pub terminal_id: String,
}

/// Control frames the hub sends to a browser. Live events are [`SequencedEvent`]s and carry
/// their own `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed(Subscribed),
    Replay(ReplayBatch),
    History(HistoryBatch),
    SessionEnded(SessionEnded),
    TerminalOpened(TerminalOpened),
    TerminalExit(TerminalExited),
    Error(ErrorFrame),
    Pong,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscribed {
    pub session_id: String,
    pub epoch: String,
    pub cursor: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayBatch {
    pub session_id: String,
    pub events: Vec<SequencedEvent>,
    pub gap: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryBatch {
    pub session_id: String,
    pub messages: Vec<Value>,
    /// Older messages did not fit the history read window.
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEnded {
    pub session_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOpened {
    pub terminal_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalExited {
    pub terminal_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_id: Option<String>,
}

impl ServerFrame {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error(ErrorFrame {
            code: code.to_string(),
            message: message.into(),
            session_id: None,
            terminal_id: None,
        })
    }

    pub fn session_error(session_id: &str, code: &str, message: impl Into<String>) -> Self {
        Self::Error(ErrorFrame {
            code: code.to_string(),
            message: message.into(),
            session_id: Some(session_id.to_string()),
            terminal_id: None,
        })
    }

    pub fn terminal_error(terminal_id: &str, code: &str, message: impl Into<String>) -> Self {
        Self::Error(ErrorFrame {
            code: code.to_string(),
            message: message.into(),
            session_id: None,
            terminal_id: Some(terminal_id.to_string()),
        })
    }
}

/// A session event as delivered to browsers: the event fields flattened alongside
/// `sessionId` and `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedEvent {
    pub session_id: String,
    pub seq: u64,
    #[serde(flatten)]
    pub event: SessionEvent,
}

/// Frames an agent process sends on the publisher socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    Hello(AgentHello),
    Event(AgentEvent),
    Exit(AgentExit),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHello {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub event: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentExit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("terminal frame is empty")]
    EmptyTerminalFrame,
    #[error("terminal frame truncated: id needs {needed} bytes, {available} available")]
    TruncatedTerminalFrame { needed: usize, available: usize },
    #[error("terminal id must be 1..=255 bytes, got {0}")]
    InvalidTerminalIdLength(usize),
    #[error("terminal id is not valid utf-8")]
    InvalidTerminalId,
}

impl FrameError {
    /// Stable code for the error frame sent back to the peer.
    pub fn code(&self) -> &'static str {
        match self {
            FrameError::OversizedFrame { .. } => "frame_too_large",
            FrameError::Encode(_) => "encode_failed",
            FrameError::Decode(_) => "invalid_frame",
            FrameError::EmptyTerminalFrame
            | FrameError::TruncatedTerminalFrame { .. }
            | FrameError::InvalidTerminalIdLength(_)
            | FrameError::InvalidTerminalId => "invalid_terminal_frame",
        }
    }
}

pub fn decode_json_frame<T: for<'de> Deserialize<'de>>(
    raw: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

pub fn encode_json_frame<T: Serialize>(value: &T) -> Result<String, FrameError> {
    serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))
}

/// Binary terminal frame layout: `[id_len: u8][terminal id][payload]`.
pub fn encode_terminal_frame(terminal_id: &str, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let id = terminal_id.as_bytes();
    if id.is_empty() || id.len() > MAX_TERMINAL_ID_BYTES {
        return Err(FrameError::InvalidTerminalIdLength(id.len()));
    }
    let mut frame = Vec::with_capacity(1 + id.len() + payload.len());
    frame.push(id.len() as u8);
    frame.extend_from_slice(id);
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub fn decode_terminal_frame(frame: &[u8]) -> Result<(&str, &[u8]), FrameError> {
    let Some((&id_len, rest)) = frame.split_first() else {
        return Err(FrameError::EmptyTerminalFrame);
    };
    let id_len = usize::from(id_len);
    if id_len == 0 {
        return Err(FrameError::InvalidTerminalIdLength(0));
    }
    if rest.len() < id_len {
        return Err(FrameError::TruncatedTerminalFrame {
            needed: id_len,
            available: rest.len(),
        });
    }
    let (id, payload) = rest.split_at(id_len);
    let id = std::str::from_utf8(id).map_err(|_| FrameError::InvalidTerminalId)?;
    Ok((id, payload))
}
