use crate::config::HubConfig;
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

const LOG_FILE_PREFIX: &str = "tether-hub";

/// Keeps the optional log file alive for the life of the process.
pub struct LogGuard {
    file: Option<Arc<File>>,
    pub path: Option<PathBuf>,
}

pub fn init_logging(config: &HubConfig) -> Option<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(config)));
    let guard = match open_log_file(&config.log_dir, &config.addr) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard {
                file: None,
                path: None,
            }
        }
    };
    let writer = match guard.file.clone() {
        Some(file) => BoxMakeWriter::new(io::stdout.and(file)),
        None => BoxMakeWriter::new(io::stdout),
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

fn default_level(config: &HubConfig) -> String {
    match std::env::var("TETHER_LOG_LEVEL") {
        Ok(level) if !level.trim().is_empty() => level,
        _ if config.debug => "debug".to_string(),
        _ => "info".to_string(),
    }
}

/// One file per listen address, so hubs sharing a log dir never interleave.
pub fn log_file_name(addr: &str) -> String {
    let mut key = String::with_capacity(addr.len());
    for ch in addr.chars() {
        let ch = if ch.is_ascii_alphanumeric() || ch == '.' { ch } else { '-' };
        if ch == '-' && key.ends_with('-') {
            continue;
        }
        key.push(ch);
    }
    let key = key.trim_matches('-');
    if key.is_empty() {
        format!("{LOG_FILE_PREFIX}.log")
    } else {
        format!("{LOG_FILE_PREFIX}-{key}.log")
    }
}

fn open_log_file(log_dir: &str, addr: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard {
            file: None,
            path: None,
        });
    }
    let dir = Path::new(log_dir);
    std::fs::create_dir_all(dir)?;
    let path = dir.join(log_file_name(addr));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(LogGuard {
        file: Some(Arc::new(file)),
        path: Some(path),
    })
}
