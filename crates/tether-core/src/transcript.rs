use serde_json::Value;
use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};
use thiserror::Error;

pub const TRANSCRIPT_EXTENSION: &str = "jsonl";
pub const DEFAULT_HEAD_BYTES: u64 = 1024 * 1024;
pub const DEFAULT_HISTORY_BYTES: u64 = 64 * 1024 * 1024;

/// Session metadata taken from the first qualifying transcript line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptHead {
    pub session_id: String,
    pub cwd: String,
    pub git_branch: Option<String>,
    pub slug: Option<String>,
}

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("no line with sessionId and cwd in the first {0} bytes")]
    NoQualifyingLine(u64),
}

pub fn read_transcript_head(path: &Path, max_bytes: u64) -> Option<TranscriptHead> {
    try_read_transcript_head(path, max_bytes).ok()
}

pub fn try_read_transcript_head(path: &Path, max_bytes: u64) -> Result<TranscriptHead, HeadError> {
    let (buf, cut) = read_bounded(path, max_bytes)?;
    let head = complete_lines(&buf, cut).find_map(parse_head_line);
    head.ok_or(HeadError::NoQualifyingLine(max_bytes))
}

pub fn parse_head_line(line: &[u8]) -> Option<TranscriptHead> {
    let value: Value = serde_json::from_slice(line).ok()?;
    let object = value.as_object()?;
    let session_id = object.get("sessionId")?.as_str()?;
    let cwd = object.get("cwd")?.as_str()?;
    let optional = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    Some(TranscriptHead {
        session_id: session_id.trim().to_string(),
        cwd: cwd.to_string(),
        git_branch: optional("gitBranch"),
        slug: optional("slug"),
    })
}

/// The newest records of a transcript, read from a window at the end of the file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TranscriptTail {
    pub records: Vec<Value>,
    /// Older records fell outside the window.
    pub truncated: bool,
}

/// Every JSON object line in the last `max_bytes` of the file. A line cut by the window start
/// is dropped, as are malformed lines.
pub fn read_transcript_tail(path: &Path, max_bytes: u64) -> io::Result<TranscriptTail> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let truncated = len > max_bytes;
    let mut buf = Vec::new();
    let body: &[u8] = if truncated {
        // Start one byte early so a window that begins on a line boundary keeps that line.
        file.seek(SeekFrom::Start(len - max_bytes - 1))?;
        file.take(max_bytes + 1).read_to_end(&mut buf)?;
        match buf.iter().position(|byte| *byte == b'\n') {
            Some(idx) => &buf[idx + 1..],
            None => &buf[..0],
        }
    } else {
        file.take(max_bytes).read_to_end(&mut buf)?;
        &buf
    };
    let records = complete_lines(body, false)
        .filter_map(|line| serde_json::from_slice::<Value>(line).ok())
        .filter(Value::is_object)
        .collect();
    Ok(TranscriptTail { records, truncated })
}

fn read_bounded(path: &Path, max_bytes: u64) -> io::Result<(Vec<u8>, bool)> {
    let file = File::open(path)?;
    let mut buf = Vec::new();
    file.take(max_bytes).read_to_end(&mut buf)?;
    let cut = buf.len() as u64 >= max_bytes;
    Ok((buf, cut))
}

/// Lines of `buf`, dropping the trailing segment when the read stopped at the byte limit.
fn complete_lines(buf: &[u8], cut: bool) -> impl Iterator<Item = &[u8]> {
    let body = if cut && !buf.ends_with(b"\n") {
        match buf.iter().rposition(|byte| *byte == b'\n') {
            Some(idx) => &buf[..idx],
            None => &buf[..0],
        }
    } else {
        buf
    };
    body.split(|byte| *byte == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
}
