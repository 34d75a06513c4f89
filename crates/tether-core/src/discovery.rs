use crate::transcript::{read_transcript_head, DEFAULT_HEAD_BYTES, TRANSCRIPT_EXTENSION};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::debug;

pub const DEFAULT_DISCOVERY_LIMIT: usize = 200;
pub const MAX_DISCOVERY_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredSession {
    pub session_id: String,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    /// File modification time, milliseconds since the Unix epoch.
    pub last_activity_at: i64,
    pub source_file: PathBuf,
}

pub fn default_projects_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("projects")
}

/// Non-finite or non-positive values fall back to the default; the rest clamp to the ceiling.
pub fn resolve_limit(raw: Option<f64>) -> usize {
    match raw {
        Some(value) if value.is_finite() && value >= 1.0 => {
            (value.floor() as usize).min(MAX_DISCOVERY_LIMIT)
        }
        _ => DEFAULT_DISCOVERY_LIMIT,
    }
}

pub fn discover(root: &Path, limit: usize) -> Vec<DiscoveredSession> {
    discover_with_head_bytes(root, limit, DEFAULT_HEAD_BYTES)
}

pub fn discover_with_head_bytes(
    root: &Path,
    limit: usize,
    head_bytes: u64,
) -> Vec<DiscoveredSession> {
    let limit = if limit == 0 {
        DEFAULT_DISCOVERY_LIMIT
    } else {
        limit.min(MAX_DISCOVERY_LIMIT)
    };

    let mut candidates = collect_transcripts(root);
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut by_id: HashMap<String, DiscoveredSession> = HashMap::new();
    for (path, mtime) in candidates {
        if by_id.len() >= limit {
            break;
        }
        let Some(head) = read_transcript_head(&path, head_bytes) else {
            debug!(event = "discovery_skip", path = %path.display());
            continue;
        };
        let session_id = if head.session_id.is_empty() {
            session_id_from_path(&path)
        } else {
            head.session_id
        };
        if let Some(existing) = by_id.get(&session_id) {
            if mtime <= existing.last_activity_at {
                continue;
            }
        }
        by_id.insert(
            session_id.clone(),
            DiscoveredSession {
                session_id,
                cwd: head.cwd,
                git_branch: head.git_branch,
                slug: head.slug,
                last_activity_at: mtime,
                source_file: path,
            },
        );
    }

    let mut sessions = by_id.into_values().collect::<Vec<_>>();
    sessions.sort_by(|a, b| {
        b.last_activity_at
            .cmp(&a.last_activity_at)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
    sessions.truncate(limit);
    sessions
}

/// Finds the newest transcript for `session_id`, preferring the `<id>.jsonl` naming
/// convention before falling back to head scans.
pub fn locate_transcript(root: &Path, session_id: &str) -> Option<PathBuf> {
    if !is_safe_session_id(session_id) {
        return None;
    }
    let file_name = format!("{session_id}.{TRANSCRIPT_EXTENSION}");
    let named = project_dirs(root)
        .into_iter()
        .map(|dir| dir.join(&file_name))
        .filter_map(|path| modified_ms(&path).map(|mtime| (path, mtime)))
        .max_by_key(|(_, mtime)| *mtime)
        .map(|(path, _)| path);
    if named.is_some() {
        return named;
    }
    discover(root, MAX_DISCOVERY_LIMIT)
        .into_iter()
        .find(|session| session.session_id == session_id)
        .map(|session| session.source_file)
}

pub fn is_safe_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id != "."
        && session_id != ".."
        && !session_id.contains(|c| matches!(c, '/' | '\\' | '\0'))
}

pub fn session_id_from_path(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("unknown")
        .to_string()
}

fn collect_transcripts(root: &Path) -> Vec<(PathBuf, i64)> {
    let mut out = Vec::new();
    for dir in project_dirs(root) {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(event = "discovery_dir_error", dir = %dir.display(), error = %err);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_transcript(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            if let Some(mtime) = meta.modified().ok().and_then(system_time_ms) {
                out.push((path, mtime));
            }
        }
    }
    out
}

fn project_dirs(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|entry| entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect()
}

fn is_transcript(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(TRANSCRIPT_EXTENSION))
}

fn modified_ms(path: &Path) -> Option<i64> {
    let meta = fs::metadata(path).ok()?;
    if !meta.is_file() {
        return None;
    }
    meta.modified().ok().and_then(system_time_ms)
}

fn system_time_ms(time: SystemTime) -> Option<i64> {
    let elapsed = time.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(elapsed.as_millis()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::time::Duration;

    fn transcript(dir: &Path, name: &str, session_id: &str, cwd: &str, mtime_secs: u64) -> PathBuf {
        fs::create_dir_all(dir).expect("mkdir");
        let path = dir.join(name);
        let mut file = File::create(&path).expect("create");
        writeln!(
            file,
            "{}",
            serde_json::json!({"sessionId": session_id, "cwd": cwd, "type": "user"})
        )
        .expect("write");
        file.set_modified(UNIX_EPOCH + Duration::from_secs(mtime_secs))
            .expect("set mtime");
        path
    }

    #[test]
    fn duplicate_session_ids_keep_the_newest_file() {
        let root = tempfile::tempdir().expect("tempdir");
        transcript(&root.path().join("proj-a"), "old.jsonl", "s1", "/a", 100);
        let newer = transcript(&root.path().join("proj-b"), "new.jsonl", "s1", "/b", 200);

        let sessions = discover(root.path(), 10);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "s1");
        assert_eq!(sessions[0].last_activity_at, 200_000);
        assert_eq!(sessions[0].cwd, "/b");
        assert_eq!(sessions[0].source_file, newer);
    }

    #[test]
    fn results_are_most_recent_first_and_limited() {
        let root = tempfile::tempdir().expect("tempdir");
        let proj = root.path().join("proj");
        for n in 1..=5u64 {
            transcript(&proj, &format!("s{n}.jsonl"), &format!("s{n}"), "/w", n * 10);
        }
        let sessions = discover(root.path(), 3);
        let ids = sessions.iter().map(|s| s.session_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["s5", "s4", "s3"]);
    }

    #[test]
    fn empty_session_id_falls_back_to_file_stem() {
        let root = tempfile::tempdir().expect("tempdir");
        transcript(&root.path().join("proj"), "legacy-id.jsonl", "", "/w", 50);
        let sessions = discover(root.path(), 10);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "legacy-id");
    }

    #[test]
    fn bad_files_and_foreign_entries_are_skipped() {
        let root = tempfile::tempdir().expect("tempdir");
        let proj = root.path().join("proj");
        transcript(&proj, "good.jsonl", "good", "/w", 10);
        fs::write(proj.join("garbage.jsonl"), "not json\n").expect("write garbage");
        fs::write(proj.join("notes.txt"), "{\"sessionId\":\"txt\",\"cwd\":\"/\"}\n").expect("txt");
        fs::write(
            root.path().join("top-level.jsonl"),
            "{\"sessionId\":\"top\",\"cwd\":\"/\"}\n",
        )
        .expect("top");
        fs::create_dir_all(proj.join("nested.jsonl")).expect("dir named like transcript");

        let sessions = discover(root.path(), 10);
        let ids = sessions.iter().map(|s| s.session_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["good"]);
    }

    #[test]
    fn missing_root_is_empty() {
        let root = tempfile::tempdir().expect("tempdir");
        assert!(discover(&root.path().join("nope"), 10).is_empty());
    }

    #[test]
    fn limit_resolution_clamps_and_defaults() {
        assert_eq!(resolve_limit(None), DEFAULT_DISCOVERY_LIMIT);
        assert_eq!(resolve_limit(Some(f64::NAN)), DEFAULT_DISCOVERY_LIMIT);
        assert_eq!(resolve_limit(Some(f64::INFINITY)), DEFAULT_DISCOVERY_LIMIT);
        assert_eq!(resolve_limit(Some(0.0)), DEFAULT_DISCOVERY_LIMIT);
        assert_eq!(resolve_limit(Some(-5.0)), DEFAULT_DISCOVERY_LIMIT);
        assert_eq!(resolve_limit(Some(1.0)), 1);
        assert_eq!(resolve_limit(Some(42.9)), 42);
        assert_eq!(resolve_limit(Some(5_000.0)), MAX_DISCOVERY_LIMIT);
    }

    #[test]
    fn locate_prefers_named_file_and_rejects_traversal() {
        let root = tempfile::tempdir().expect("tempdir");
        transcript(&root.path().join("a"), "abc.jsonl", "abc", "/a", 10);
        let newer = transcript(&root.path().join("b"), "abc.jsonl", "abc", "/b", 20);
        let renamed = transcript(&root.path().join("b"), "other-name.jsonl", "xyz", "/b", 30);

        assert_eq!(locate_transcript(root.path(), "abc"), Some(newer));
        assert_eq!(locate_transcript(root.path(), "xyz"), Some(renamed));
        assert_eq!(locate_transcript(root.path(), "missing"), None);
        assert_eq!(locate_transcript(root.path(), "../etc/passwd"), None);
        assert!(!is_safe_session_id(".."));
    }
}
