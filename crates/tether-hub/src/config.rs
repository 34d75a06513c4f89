use crate::{hub::HubSettings, terminal::DEFAULT_MAX_TERMINALS};
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use tether_core::{
    discovery::default_projects_root,
    protocol::DEFAULT_MAX_FRAME_BYTES,
    replay::DEFAULT_REPLAY_CAPACITY,
    transcript::DEFAULT_HISTORY_BYTES,
};
use thiserror::Error;

pub const DEFAULT_ADDR: &str = "127.0.0.1:7421";
pub const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Parser, Debug, Clone)]
#[command(name = "tether-hub", about = "Bridges agent session events and terminals to browsers")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long, default_value = "")]
    pub token: String,
    #[arg(long, default_value_t = false)]
    pub insecure_no_auth: bool,
    #[arg(long, default_value = "")]
    pub projects_root: String,
    #[arg(long, default_value_t = DEFAULT_REPLAY_CAPACITY)]
    pub replay_capacity: usize,
    #[arg(long, default_value_t = 256)]
    pub queue_capacity: usize,
    #[arg(long, default_value_t = 30)]
    pub grace_seconds: u64,
    #[arg(long, default_value_t = 10)]
    pub ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    pub write_timeout: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_TERMINALS)]
    pub max_terminals: usize,
    #[arg(long, default_value = "")]
    pub shell: String,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no token configured; pass --token, set TETHER_TOKEN, or use --insecure-no-auth")]
    MissingToken,
    #[error("invalid listen address {0}")]
    InvalidAddr(String),
    #[error("auth is disabled, refusing to listen on non-loopback address {0}")]
    InsecurePublicBind(String),
    #[error("{0} must be at least 1")]
    ZeroCapacity(&'static str),
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub addr: String,
    /// `None` only when auth was explicitly disabled.
    pub token: Option<String>,
    pub projects_root: PathBuf,
    pub replay_capacity: usize,
    pub queue_capacity: usize,
    pub grace: Duration,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub max_terminals: usize,
    pub max_frame_bytes: usize,
    pub history_max_bytes: u64,
    pub shell: String,
    pub log_dir: String,
    pub debug: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            token: None,
            projects_root: default_projects_root(),
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            queue_capacity: 256,
            grace: Duration::from_secs(30),
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            max_terminals: DEFAULT_MAX_TERMINALS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            history_max_bytes: DEFAULT_HISTORY_BYTES,
            shell: DEFAULT_SHELL.to_string(),
            log_dir: String::new(),
            debug: false,
        }
    }
}

impl HubConfig {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let addr =
            resolve_value(&args.addr, "TETHER_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let socket: SocketAddr = addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddr(addr.clone()))?;
        let token = resolve_value(&args.token, "TETHER_TOKEN");
        let token = match (token, args.insecure_no_auth) {
            (_, true) => {
                if !socket.ip().is_loopback() {
                    return Err(ConfigError::InsecurePublicBind(addr));
                }
                None
            }
            (Some(token), false) => Some(token),
            (None, false) => return Err(ConfigError::MissingToken),
        };
        for (name, value) in [
            ("replay-capacity", args.replay_capacity),
            ("queue-capacity", args.queue_capacity),
            ("max-terminals", args.max_terminals),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroCapacity(name));
            }
        }

        Ok(Self {
            addr,
            token,
            projects_root: resolve_value(&args.projects_root, "TETHER_PROJECTS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(default_projects_root),
            replay_capacity: args.replay_capacity,
            queue_capacity: args.queue_capacity,
            grace: Duration::from_secs(args.grace_seconds),
            ping_interval: Duration::from_secs(args.ping_interval),
            write_timeout: Duration::from_secs(args.write_timeout),
            max_terminals: args.max_terminals,
            shell: resolve_value(&args.shell, "SHELL").unwrap_or_else(|| DEFAULT_SHELL.to_string()),
            log_dir: resolve_value(&args.log_dir, "TETHER_LOG_DIR").unwrap_or_default(),
            debug: args.debug || env_true("TETHER_DEBUG"),
            ..Self::default()
        })
    }

    /// Live frames held during a history replay are capped at half the outbound queue so the
    /// flush that follows fits alongside the replay frames.
    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            replay_capacity: self.replay_capacity,
            held_limit: std::cmp::max(1, self.queue_capacity / 2),
            grace: self.grace,
        }
    }

    pub fn reaper_interval(&self) -> Duration {
        std::cmp::max(Duration::from_secs(1), self.grace / 2)
    }
}

pub fn load_config() -> Result<HubConfig, ConfigError> {
    HubConfig::from_args(Args::parse())
}

/// Flag first, then the environment. Blank values count as unset.
fn resolve_value(flag: &str, env_key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    match std::env::var(env_key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

pub(crate) fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
