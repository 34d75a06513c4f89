//! The tether hub: fans agent session events out to browser subscribers with cursor-based
//! replay, and multiplexes interactive terminals over the same socket.

pub mod agent;
pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod history;
pub mod hub;
pub mod logging;
pub mod pty;
pub mod server;
pub mod session;
pub mod terminal;

pub use config::HubConfig;
pub use hub::{BridgeHub, HubError, HubSettings};
pub use server::{router, serve, AppState};
