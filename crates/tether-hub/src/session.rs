use crate::client::{ClientHandle, Delivery};
use axum::extract::ws::Message;
use std::time::{Duration, Instant};
use tether_core::{
    protocol::SequencedEvent,
    replay::{ReplayBuffer, ReplayEntry, ReplayGap},
    SessionEvent,
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentLink {
    Detached,
    Attached { conn_id: String },
    Ended { reason: String },
}

#[derive(Debug)]
pub(crate) enum SubscriberState {
    Live,
    /// History replay in flight; live frames wait here until it is delivered.
    CatchingUp { held: Vec<HeldFrame> },
}

/// A live frame waiting on a history replay.
#[derive(Debug)]
pub(crate) struct HeldFrame {
    pub(crate) msg: Message,
    /// Transcript record `uuid` of a history-backed event. The loaded history may already
    /// contain that record.
    pub(crate) record_uuid: Option<String>,
}

#[derive(Debug)]
pub(crate) struct Subscriber {
    pub(crate) client: ClientHandle,
    pub(crate) state: SubscriberState,
}

/// What a subscribing connection is owed before it joins live fan-out.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayPlan {
    LiveOnly,
    Buffered(Vec<ReplayEntry>),
    History {
        entries: Vec<ReplayEntry>,
        gap: ReplayGap,
    },
}

/// Per-session state. Only reachable through the hub, which holds it behind a per-session
/// mutex.
#[derive(Debug)]
pub struct BridgeSession {
    pub(crate) session_id: String,
    pub(crate) epoch: String,
    pub(crate) buffer: ReplayBuffer,
    pub(crate) subscribers: Vec<Subscriber>,
    pub(crate) agent: AgentLink,
    pub(crate) idle_since: Option<Instant>,
    pub(crate) closed: bool,
}

impl BridgeSession {
    pub fn new(session_id: &str, replay_capacity: usize) -> Self {
        Self {
            session_id: session_id.to_string(),
            epoch: Uuid::new_v4().to_string(),
            buffer: ReplayBuffer::new(replay_capacity),
            subscribers: Vec::new(),
            agent: AgentLink::Detached,
            idle_since: Some(Instant::now()),
            closed: false,
        }
    }

    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    pub fn last_seq(&self) -> u64 {
        self.buffer.last_seq()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn agent(&self) -> &AgentLink {
        &self.agent
    }

    pub(crate) fn plan_replay(&self, cursor: Option<u64>, epoch: Option<&str>) -> ReplayPlan {
        let Some(cursor) = cursor else {
            return ReplayPlan::LiveOnly;
        };
        if let Some(epoch) = epoch {
            if epoch != self.epoch {
                let slice = self.buffer.since(0);
                return ReplayPlan::History {
                    entries: slice.entries,
                    gap: ReplayGap::UnknownCursor {
                        cursor,
                        last_seq: self.buffer.last_seq(),
                    },
                };
            }
        }
        let slice = self.buffer.since(cursor);
        match slice.gap {
            None => ReplayPlan::Buffered(slice.entries),
            Some(gap) => ReplayPlan::History {
                entries: slice.entries,
                gap,
            },
        }
    }

    pub(crate) fn position(&self, conn_id: &str) -> Option<usize> {
        self.subscribers
            .iter()
            .position(|sub| sub.client.conn_id() == conn_id)
    }

    pub(crate) fn add_subscriber(&mut self, client: ClientHandle, state: SubscriberState) {
        self.subscribers.push(Subscriber { client, state });
        self.idle_since = None;
    }

    pub(crate) fn remove_subscriber(&mut self, conn_id: &str) -> Option<Subscriber> {
        let idx = self.position(conn_id)?;
        let removed = self.subscribers.remove(idx);
        if self.subscribers.is_empty() {
            self.idle_since = Some(Instant::now());
        }
        Some(removed)
    }

    /// Assigns a sequence number and fans the event out in registration order. Returns the
    /// sequence number plus the subscribers that could not keep up.
    pub(crate) fn ingest(
        &mut self,
        event: SessionEvent,
        held_limit: usize,
    ) -> (u64, Vec<ClientHandle>) {
        let seq = self.buffer.append(&event);
        let record_uuid = event
            .is_history_backed()
            .then(|| event.payload.get("uuid").and_then(|v| v.as_str()))
            .flatten()
            .map(str::to_string);
        let frame = SequencedEvent {
            session_id: self.session_id.clone(),
            seq,
            event,
        };
        let Ok(text) = serde_json::to_string(&frame) else {
            return (seq, Vec::new());
        };
        let lagging = self.deliver(Message::Text(text), record_uuid, held_limit);
        (seq, lagging)
    }

    pub(crate) fn fan_out(&mut self, msg: Message, held_limit: usize) -> Vec<ClientHandle> {
        self.deliver(msg, None, held_limit)
    }

    fn deliver(
        &mut self,
        msg: Message,
        record_uuid: Option<String>,
        held_limit: usize,
    ) -> Vec<ClientHandle> {
        let mut lagging = Vec::new();
        for sub in &mut self.subscribers {
            match &mut sub.state {
                SubscriberState::Live => {
                    if sub.client.offer(msg.clone()) != Delivery::Queued {
                        lagging.push(sub.client.clone());
                    }
                }
                SubscriberState::CatchingUp { held } => {
                    if held.len() >= held_limit {
                        lagging.push(sub.client.clone());
                    } else {
                        held.push(HeldFrame {
                            msg: msg.clone(),
                            record_uuid: record_uuid.clone(),
                        });
                    }
                }
            }
        }
        for client in &lagging {
            self.remove_subscriber(client.conn_id());
        }
        lagging
    }

    pub(crate) fn is_reapable(&self, now: Instant, grace: Duration) -> bool {
        if !self.subscribers.is_empty() {
            return false;
        }
        if matches!(self.agent, AgentLink::Attached { .. }) {
            return false;
        }
        self.idle_since
            .map(|since| now.duration_since(since) >= grace)
            .unwrap_or(false)
    }
}
