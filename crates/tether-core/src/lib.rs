//! Shared building blocks for the tether session bridge: transcript scanning, session
//! discovery, event classification, the replay buffer and the wire protocol.

pub mod discovery;
pub mod event;
pub mod protocol;
pub mod replay;
pub mod transcript;

pub use discovery::{discover, resolve_limit, DiscoveredSession};
pub use event::{classify, is_history_backed, ReplayClass, SessionEvent};
pub use replay::{ReplayBuffer, ReplayEntry, ReplayGap, ReplaySlice};
