use serde_json::Value;
use std::{io, path::PathBuf};
use tether_core::{
    discovery::{is_safe_session_id, locate_transcript},
    transcript::read_transcript_tail,
};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
    #[error("no transcript for session {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("history task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LoadedHistory {
    pub messages: Vec<Value>,
    pub truncated: bool,
}

impl LoadedHistory {
    pub fn complete(messages: Vec<Value>) -> Self {
        Self {
            messages,
            truncated: false,
        }
    }
}

/// Persisted message history for a session, newest records always included. Calls may block
/// on disk I/O; the hub runs them on the blocking pool.
pub trait HistorySource: Send + Sync + 'static {
    fn load(&self, session_id: &str) -> Result<LoadedHistory, HistoryError>;
}

#[derive(Debug, Clone)]
pub struct TranscriptHistory {
    root: PathBuf,
    max_bytes: u64,
}

impl TranscriptHistory {
    pub fn new(root: PathBuf, max_bytes: u64) -> Self {
        Self { root, max_bytes }
    }
}

impl HistorySource for TranscriptHistory {
    fn load(&self, session_id: &str) -> Result<LoadedHistory, HistoryError> {
        if !is_safe_session_id(session_id) {
            return Err(HistoryError::InvalidSessionId(session_id.to_string()));
        }
        let path = locate_transcript(&self.root, session_id)
            .ok_or_else(|| HistoryError::NotFound(session_id.to_string()))?;
        let tail = read_transcript_tail(&path, self.max_bytes)?;
        if tail.truncated {
            warn!(
                event = "history_truncated",
                session_id = session_id,
                max_bytes = self.max_bytes,
                kept = tail.records.len()
            );
        }
        Ok(LoadedHistory {
            messages: tail.records,
            truncated: tail.truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tether_core::transcript::DEFAULT_HISTORY_BYTES;

    #[test]
    fn loads_records_from_named_transcript() {
        let root = tempfile::tempdir().expect("tempdir");
        let proj = root.path().join("-home-me-repo");
        fs::create_dir_all(&proj).expect("mkdir");
        fs::write(
            proj.join("s1.jsonl"),
            concat!(
                "{\"sessionId\":\"s1\",\"cwd\":\"/repo\",\"type\":\"user\"}\n",
                "{\"sessionId\":\"s1\",\"type\":\"assistant\"}\n",
                "{\"type\":\"system_event\",\"subtype\":\"compact_boundary\"}\n",
            ),
        )
        .expect("write");

        let history = TranscriptHistory::new(root.path().to_path_buf(), DEFAULT_HISTORY_BYTES);
        let loaded = history.load("s1").expect("load");
        assert!(!loaded.truncated);
        assert_eq!(loaded.messages.len(), 3);
        assert_eq!(loaded.messages[2]["subtype"], "compact_boundary");
    }

    #[test]
    fn long_transcript_keeps_newest_records_and_reports_truncation() {
        let root = tempfile::tempdir().expect("tempdir");
        let proj = root.path().join("-home-me-repo");
        fs::create_dir_all(&proj).expect("mkdir");
        let body: String = (0..100)
            .map(|n| format!("{{\"sessionId\":\"s1\",\"type\":\"user\",\"n\":{n}}}\n"))
            .collect();
        fs::write(proj.join("s1.jsonl"), &body).expect("write");

        let history = TranscriptHistory::new(root.path().to_path_buf(), body.len() as u64 / 2);
        let loaded = history.load("s1").expect("load");
        assert!(loaded.truncated);
        assert!(loaded.messages.len() < 100);
        assert_eq!(
            loaded.messages.last().and_then(|m| m["n"].as_u64()),
            Some(99)
        );
    }

    #[test]
    fn missing_and_unsafe_ids_are_errors() {
        let root = tempfile::tempdir().expect("tempdir");
        let history = TranscriptHistory::new(root.path().to_path_buf(), DEFAULT_HISTORY_BYTES);
        assert!(matches!(history.load("nope"), Err(HistoryError::NotFound(_))));
        assert!(matches!(
            history.load("../secrets"),
            Err(HistoryError::InvalidSessionId(_))
        ));
    }
}
