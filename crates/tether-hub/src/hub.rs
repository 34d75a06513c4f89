use crate::{
    client::{ClientHandle, Delivery},
    history::{HistoryError, HistorySource, LoadedHistory},
    session::{AgentLink, BridgeSession, HeldFrame, ReplayPlan, SubscriberState},
};
use axum::extract::ws::Message;
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};
use tether_core::{
    protocol::{
        encode_json_frame, HistoryBatch, ReplayBatch, SequencedEvent, ServerFrame, SessionEnded,
        Subscribed,
    },
    replay::ReplayEntry,
    SessionEvent,
};
use thiserror::Error;
use tokio::sync::{watch, Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub replay_capacity: usize,
    /// Live frames a connection may accumulate while its history replay is in flight.
    pub held_limit: usize,
    pub grace: Duration,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("session {0} already has an attached agent")]
    PublisherConflict(String),
    #[error("connection {0} could not keep up with the subscription")]
    Backpressure(String),
    #[error("connection {0} left before replay completed")]
    Detached(String),
}

impl HubError {
    pub fn code(&self) -> &'static str {
        match self {
            HubError::PublisherConflict(_) => "publisher_conflict",
            HubError::Backpressure(_) => "slow_consumer",
            HubError::Detached(_) => "subscription_detached",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub epoch: String,
    pub cursor: u64,
    pub replayed: usize,
    pub gap: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub epoch: String,
    pub last_seq: u64,
    pub subscribers: usize,
    pub agent: AgentLink,
}

/// Routes agent events to browser subscribers. Each session sits behind its own mutex; the
/// session map lock is only held for lookup, insert and reaping.
pub struct BridgeHub {
    settings: HubSettings,
    history: Arc<dyn HistorySource>,
    sessions: RwLock<HashMap<String, Arc<Mutex<BridgeSession>>>>,
}

impl BridgeHub {
    pub fn new(settings: HubSettings, history: Arc<dyn HistorySource>) -> Self {
        Self {
            settings,
            history,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    async fn entry(&self, session_id: &str) -> Arc<Mutex<BridgeSession>> {
        if let Some(entry) = self.sessions.read().await.get(session_id) {
            return Arc::clone(entry);
        }
        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(session_id.to_string()).or_insert_with(|| {
            info!(event = "session_created", session_id = session_id);
            Arc::new(Mutex::new(BridgeSession::new(
                session_id,
                self.settings.replay_capacity,
            )))
        });
        Arc::clone(entry)
    }

    async fn existing(&self, session_id: &str) -> Option<Arc<Mutex<BridgeSession>>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Locks the live session for `session_id`, creating it if needed. A session the reaper
    /// closed between lookup and lock is replaced by a fresh one.
    async fn lock_open(&self, session_id: &str) -> OwnedMutexGuard<BridgeSession> {
        loop {
            let guard = self.entry(session_id).await.lock_owned().await;
            if !guard.closed {
                return guard;
            }
        }
    }

    pub async fn subscribe(
        &self,
        session_id: &str,
        client: ClientHandle,
        resume_cursor: Option<u64>,
        epoch: Option<&str>,
    ) -> Result<SubscribeOutcome, HubError> {
        let mut session = self.lock_open(session_id).await;
        session.remove_subscriber(client.conn_id());

        let mut outcome = SubscribeOutcome {
            epoch: session.epoch.clone(),
            cursor: session.last_seq(),
            replayed: 0,
            gap: false,
        };
        let ack = ServerFrame::Subscribed(Subscribed {
            session_id: session_id.to_string(),
            epoch: outcome.epoch.clone(),
            cursor: outcome.cursor,
        });
        if !offer_frame(&client, &ack) {
            drop(session);
            client.evict("slow_consumer");
            return Err(HubError::Backpressure(client.conn_id().to_string()));
        }

        match session.plan_replay(resume_cursor, epoch) {
            ReplayPlan::LiveOnly => {
                session.add_subscriber(client.clone(), SubscriberState::Live);
            }
            ReplayPlan::Buffered(entries) => {
                outcome.replayed = entries.len();
                let replay = replay_frame(session_id, entries, false);
                if outcome.replayed > 0 && !offer_frame(&client, &replay) {
                    drop(session);
                    client.evict("slow_consumer");
                    return Err(HubError::Backpressure(client.conn_id().to_string()));
                }
                session.add_subscriber(client.clone(), SubscriberState::Live);
            }
            ReplayPlan::History { entries, gap } => {
                session.add_subscriber(
                    client.clone(),
                    SubscriberState::CatchingUp { held: Vec::new() },
                );
                drop(session);
                info!(
                    event = "replay_gap",
                    session_id = session_id,
                    conn_id = client.conn_id(),
                    gap = ?gap
                );
                outcome.gap = true;
                outcome.replayed = entries.len();
                let history = self.load_history(session_id).await;
                self.finish_catch_up(session_id, &client, &outcome.epoch, history, entries)
                    .await?;
            }
        }

        info!(
            event = "client_subscribed",
            session_id = session_id,
            conn_id = client.conn_id(),
            cursor = outcome.cursor,
            replayed = outcome.replayed,
            gap = outcome.gap
        );
        Ok(outcome)
    }

    async fn load_history(&self, session_id: &str) -> Result<LoadedHistory, HistoryError> {
        let history = Arc::clone(&self.history);
        let session_id = session_id.to_string();
        match tokio::task::spawn_blocking(move || history.load(&session_id)).await {
            Ok(result) => result,
            Err(err) => Err(HistoryError::Task(err.to_string())),
        }
    }

    async fn finish_catch_up(
        &self,
        session_id: &str,
        client: &ClientHandle,
        epoch: &str,
        history: Result<LoadedHistory, HistoryError>,
        entries: Vec<ReplayEntry>,
    ) -> Result<(), HubError> {
        let detached = || HubError::Detached(client.conn_id().to_string());
        let entry = self.existing(session_id).await.ok_or_else(detached)?;
        let mut session = entry.lock_owned().await;
        if session.closed || session.epoch != epoch {
            return Err(detached());
        }
        let idx = session.position(client.conn_id()).ok_or_else(detached)?;
        let state = std::mem::replace(&mut session.subscribers[idx].state, SubscriberState::Live);
        let mut held = match state {
            SubscriberState::CatchingUp { held } => held,
            SubscriberState::Live => Vec::new(),
        };

        let history_frame = match history {
            Ok(loaded) => {
                let skipped = drop_persisted(&mut held, &loaded.messages);
                if skipped > 0 {
                    debug!(
                        event = "held_frames_in_history",
                        session_id = session_id,
                        conn_id = client.conn_id(),
                        skipped = skipped
                    );
                }
                ServerFrame::History(HistoryBatch {
                    session_id: session_id.to_string(),
                    messages: loaded.messages,
                    truncated: loaded.truncated,
                })
            }
            Err(err) => {
                warn!(event = "history_unavailable", session_id = session_id, error = %err);
                ServerFrame::session_error(session_id, "history_unavailable", err.to_string())
            }
        };
        let mut queued = vec![history_frame, replay_frame(session_id, entries, true)]
            .iter()
            .all(|frame| offer_frame(client, frame));
        if queued {
            queued = held
                .into_iter()
                .all(|frame| client.offer(frame.msg) == Delivery::Queued);
        }
        if !queued {
            session.remove_subscriber(client.conn_id());
            drop(session);
            client.evict("slow_consumer");
            return Err(HubError::Backpressure(client.conn_id().to_string()));
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, session_id: &str, conn_id: &str) -> bool {
        let Some(entry) = self.existing(session_id).await else {
            return false;
        };
        let removed = entry.lock().await.remove_subscriber(conn_id).is_some();
        if removed {
            info!(event = "client_unsubscribed", session_id = session_id, conn_id = conn_id);
        }
        removed
    }

    /// Called once per agent emission. Duplicates are not collapsed.
    pub async fn ingest(&self, session_id: &str, event: SessionEvent) -> u64 {
        let mut session = self.lock_open(session_id).await;
        let (seq, lagging) = session.ingest(event, self.settings.held_limit);
        drop(session);
        for client in lagging {
            client.evict("slow_consumer");
        }
        debug!(event = "event_ingested", session_id = session_id, seq = seq);
        seq
    }

    pub async fn attach_agent(&self, session_id: &str, conn_id: &str) -> Result<String, HubError> {
        let mut session = self.lock_open(session_id).await;
        if let AgentLink::Attached { conn_id: current } = &session.agent {
            if current != conn_id {
                return Err(HubError::PublisherConflict(session_id.to_string()));
            }
        }
        session.agent = AgentLink::Attached {
            conn_id: conn_id.to_string(),
        };
        info!(event = "agent_attached", session_id = session_id, conn_id = conn_id);
        Ok(session.epoch.clone())
    }

    /// Marks the agent stream finished and tells every subscriber. With `conn_id` set, only
    /// that publisher may end the session.
    pub async fn end_session(&self, session_id: &str, conn_id: Option<&str>, reason: &str) -> bool {
        let Some(entry) = self.existing(session_id).await else {
            return false;
        };
        let mut session = entry.lock().await;
        if let Some(conn_id) = conn_id {
            match &session.agent {
                AgentLink::Attached { conn_id: current } if current == conn_id => {}
                _ => return false,
            }
        }
        session.agent = AgentLink::Ended {
            reason: reason.to_string(),
        };
        let frame = ServerFrame::SessionEnded(SessionEnded {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
        });
        let lagging = match encode_json_frame(&frame) {
            Ok(text) => session.fan_out(Message::Text(text), self.settings.held_limit),
            Err(_) => Vec::new(),
        };
        if session.subscribers.is_empty() {
            session.idle_since = Some(Instant::now());
        }
        drop(session);
        for client in lagging {
            client.evict("slow_consumer");
        }
        info!(event = "session_ended", session_id = session_id, reason = reason);
        true
    }

    pub async fn reap_idle(&self, now: Instant) -> Vec<String> {
        let grace = self.settings.grace;
        let mut removed = Vec::new();
        self.sessions.write().await.retain(|session_id, entry| {
            let Ok(mut session) = entry.try_lock() else {
                return true;
            };
            if session.is_reapable(now, grace) {
                session.closed = true;
                removed.push(session_id.clone());
                return false;
            }
            true
        });
        for session_id in &removed {
            info!(event = "session_reaped", session_id = %session_id);
        }
        removed
    }

    pub fn spawn_reaper(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let tick = std::cmp::max(Duration::from_millis(100), interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.reap_idle(Instant::now()).await;
                    }
                }
            }
        });
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let entry = self.existing(session_id).await?;
        let session = entry.lock().await;
        Some(SessionSnapshot {
            epoch: session.epoch.clone(),
            last_seq: session.last_seq(),
            subscribers: session.subscriber_count(),
            agent: session.agent.clone(),
        })
    }
}

fn replay_frame(session_id: &str, entries: Vec<ReplayEntry>, gap: bool) -> ServerFrame {
    ServerFrame::Replay(ReplayBatch {
        session_id: session_id.to_string(),
        events: entries
            .into_iter()
            .map(|entry| SequencedEvent {
                session_id: session_id.to_string(),
                seq: entry.seq,
                event: entry.event,
            })
            .collect(),
        gap,
    })
}

/// Removes held history-backed frames whose transcript record is already in `messages`.
/// Frames without a record uuid stay, so a missing record repeats rather than vanishes.
fn drop_persisted(held: &mut Vec<HeldFrame>, messages: &[Value]) -> usize {
    let persisted: HashSet<&str> = messages
        .iter()
        .filter_map(|message| message.get("uuid").and_then(Value::as_str))
        .collect();
    let before = held.len();
    held.retain(|frame| match frame.record_uuid.as_deref() {
        Some(uuid) => !persisted.contains(uuid),
        None => true,
    });
    before - held.len()
}

fn offer_frame(client: &ClientHandle, frame: &ServerFrame) -> bool {
    match encode_json_frame(frame) {
        Ok(text) => client.offer_text(text) == Delivery::Queued,
        Err(err) => {
            warn!(event = "frame_encode_error", conn_id = client.conn_id(), error = %err);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex as StdMutex;
    use tether_core::event::SYSTEM_EVENT_TYPE;
    use tokio::sync::mpsc;

    struct FixedHistory(Vec<Value>);

    impl HistorySource for FixedHistory {
        fn load(&self, _session_id: &str) -> Result<LoadedHistory, HistoryError> {
            Ok(LoadedHistory::complete(self.0.clone()))
        }
    }

    /// Blocks `load` until the test releases it, then returns `records`.
    struct GatedHistory {
        gate: StdMutex<std_mpsc::Receiver<()>>,
        records: Vec<Value>,
    }

    impl GatedHistory {
        fn new(gate: std_mpsc::Receiver<()>, records: Vec<Value>) -> Self {
            Self {
                gate: StdMutex::new(gate),
                records,
            }
        }
    }

    impl HistorySource for GatedHistory {
        fn load(&self, _session_id: &str) -> Result<LoadedHistory, HistoryError> {
            let gate = self.gate.lock().map_err(|err| HistoryError::Task(err.to_string()))?;
            let _ = gate.recv();
            Ok(LoadedHistory::complete(self.records.clone()))
        }
    }

    async fn wait_for_subscribers(hub: &BridgeHub, session_id: &str, count: usize) {
        for _ in 0..100 {
            if hub.snapshot(session_id).await.map(|s| s.subscribers) == Some(count) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subscriber never registered");
    }

    fn settings(replay_capacity: usize) -> HubSettings {
        HubSettings {
            replay_capacity,
            held_limit: 16,
            grace: Duration::from_secs(30),
        }
    }

    fn hub(replay_capacity: usize) -> BridgeHub {
        BridgeHub::new(settings(replay_capacity), Arc::new(FixedHistory(Vec::new())))
    }

    fn client(
        id: &str,
        capacity: usize,
    ) -> (
        ClientHandle,
        mpsc::Receiver<Message>,
        watch::Receiver<Option<String>>,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        let (handle, evicted) = ClientHandle::new(id, tx);
        (handle, rx, evicted)
    }

    fn progress(n: u64) -> SessionEvent {
        SessionEvent::new(SYSTEM_EVENT_TYPE, Some("hook_progress")).with_field("n", json!(n))
    }

    fn boundary() -> SessionEvent {
        SessionEvent::new(SYSTEM_EVENT_TYPE, Some("compact_boundary"))
    }

    async fn next_json(rx: &mut mpsc::Receiver<Message>) -> Value {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame timeout")
            .expect("channel closed");
        let Message::Text(text) = msg else {
            panic!("expected text frame")
        };
        serde_json::from_str(&text).expect("json frame")
    }

    fn assert_drained(rx: &mut mpsc::Receiver<Message>) {
        assert!(rx.try_recv().is_err(), "unexpected extra frame");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn subscribe_without_cursor_receives_only_live_events() {
        let hub = hub(8);
        hub.ingest("s1", progress(1)).await;
        hub.ingest("s1", progress(2)).await;

        let (handle, mut rx, _evicted) = client("c1", 16);
        let outcome = hub.subscribe("s1", handle, None, None).await.expect("subscribe");
        assert_eq!(outcome.cursor, 2);
        assert_eq!(outcome.replayed, 0);

        let ack = next_json(&mut rx).await;
        assert_eq!(ack["type"], "subscribed");
        assert_eq!(ack["cursor"], 2);
        assert_drained(&mut rx);

        hub.ingest("s1", progress(3)).await;
        let live = next_json(&mut rx).await;
        assert_eq!(live["seq"], 3);
        assert_eq!(live["sessionId"], "s1");
        assert_eq!(live["subtype"], "hook_progress");
        assert_drained(&mut rx);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reconnect_with_observed_cursor_has_no_duplicates_or_gaps() {
        let hub = hub(8);
        let (first, mut rx, _evicted) = client("tab-1", 16);
        let outcome = hub.subscribe("s1", first, None, None).await.expect("subscribe");
        let _ = next_json(&mut rx).await;

        hub.ingest("s1", progress(1)).await;
        hub.ingest("s1", boundary()).await;
        hub.ingest("s1", progress(3)).await;
        let mut observed = 0;
        for expected in 1..=3 {
            let live = next_json(&mut rx).await;
            assert_eq!(live["seq"], expected);
            observed = expected;
        }
        assert!(hub.unsubscribe("s1", "tab-1").await);

        hub.ingest("s1", progress(4)).await;
        hub.ingest("s1", boundary()).await;
        hub.ingest("s1", progress(6)).await;

        let (second, mut rx, _evicted) = client("tab-1b", 16);
        let resumed = hub
            .subscribe("s1", second, Some(observed), Some(&outcome.epoch))
            .await
            .expect("resubscribe");
        assert!(!resumed.gap);
        assert_eq!(resumed.replayed, 2);

        let ack = next_json(&mut rx).await;
        assert_eq!(ack["type"], "subscribed");
        let replay = next_json(&mut rx).await;
        assert_eq!(replay["type"], "replay");
        assert_eq!(replay["gap"], false);
        let seqs = replay["events"]
            .as_array()
            .expect("events")
            .iter()
            .map(|event| event["seq"].as_u64().expect("seq"))
            .collect::<Vec<_>>();
        assert_eq!(seqs, vec![4, 6]);

        hub.ingest("s1", progress(7)).await;
        assert_eq!(next_json(&mut rx).await["seq"], 7);
        assert_drained(&mut rx);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn gap_falls_back_to_history_and_holds_live_events_until_replayed() {
        let (release, gate) = std_mpsc::channel();
        let hub = Arc::new(BridgeHub::new(
            settings(2),
            Arc::new(GatedHistory::new(
                gate,
                vec![json!({"type": "user", "sessionId": "s1"})],
            )),
        ));
        for n in 1..=5 {
            hub.ingest("s1", progress(n)).await;
        }
        let epoch = hub.snapshot("s1").await.expect("session").epoch;

        let (handle, mut rx, _evicted) = client("c1", 16);
        let subscribing = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.subscribe("s1", handle, Some(1), Some(&epoch)).await })
        };
        wait_for_subscribers(&hub, "s1", 1).await;
        hub.ingest("s1", progress(6)).await;
        release.send(()).expect("release history");

        let outcome = subscribing.await.expect("join").expect("subscribe");
        assert!(outcome.gap);

        assert_eq!(next_json(&mut rx).await["type"], "subscribed");
        let history = next_json(&mut rx).await;
        assert_eq!(history["type"], "history");
        assert_eq!(history["messages"][0]["type"], "user");
        assert_eq!(history["truncated"], false);
        let replay = next_json(&mut rx).await;
        assert_eq!(replay["type"], "replay");
        assert_eq!(replay["gap"], true);
        let seqs = replay["events"]
            .as_array()
            .expect("events")
            .iter()
            .map(|event| event["seq"].as_u64().expect("seq"))
            .collect::<Vec<_>>();
        assert_eq!(seqs, vec![4, 5]);
        assert_eq!(next_json(&mut rx).await["seq"], 6);
        assert_drained(&mut rx);

        hub.ingest("s1", progress(7)).await;
        assert_eq!(next_json(&mut rx).await["seq"], 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_consumer_is_evicted_without_stalling_others() {
        let hub = hub(8);
        let (slow, _slow_rx, slow_evicted) = client("slow", 2);
        let (fast, mut fast_rx, fast_evicted) = client("fast", 64);
        hub.subscribe("s1", slow, None, None).await.expect("slow");
        hub.subscribe("s1", fast, None, None).await.expect("fast");

        for n in 1..=4 {
            hub.ingest("s1", progress(n)).await;
        }

        assert_eq!(slow_evicted.borrow().as_deref(), Some("slow_consumer"));
        assert!(fast_evicted.borrow().is_none());
        assert_eq!(hub.snapshot("s1").await.expect("session").subscribers, 1);

        assert_eq!(next_json(&mut fast_rx).await["type"], "subscribed");
        for n in 1..=4 {
            assert_eq!(next_json(&mut fast_rx).await["seq"], n);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_emissions_are_delivered_in_order() {
        let hub = hub(8);
        let (handle, mut rx, _evicted) = client("c1", 16);
        hub.subscribe("s1", handle, None, None).await.expect("subscribe");
        let _ = next_json(&mut rx).await;

        let event = progress(1);
        assert_eq!(hub.ingest("s1", event.clone()).await, 1);
        assert_eq!(hub.ingest("s1", event).await, 2);

        let first = next_json(&mut rx).await;
        let second = next_json(&mut rx).await;
        assert_eq!(first["seq"], 1);
        assert_eq!(second["seq"], 2);
        assert_eq!(first["n"], second["n"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn agent_end_notifies_subscribers_and_session_is_reaped_after_grace() {
        let hub = hub(8);
        hub.attach_agent("s1", "agent-1").await.expect("attach");
        let (handle, mut rx, _evicted) = client("c1", 16);
        hub.subscribe("s1", handle, None, None).await.expect("subscribe");
        let _ = next_json(&mut rx).await;

        assert!(hub.reap_idle(Instant::now() + Duration::from_secs(60)).await.is_empty());
        assert!(!hub.end_session("s1", Some("agent-other"), "agent_exit").await);
        assert!(hub.end_session("s1", Some("agent-1"), "agent_exit").await);
        let ended = next_json(&mut rx).await;
        assert_eq!(ended["type"], "session_ended");
        assert_eq!(ended["reason"], "agent_exit");

        assert!(hub.reap_idle(Instant::now() + Duration::from_secs(60)).await.is_empty());
        hub.unsubscribe("s1", "c1").await;
        assert!(hub.reap_idle(Instant::now()).await.is_empty());
        assert_eq!(
            hub.reap_idle(Instant::now() + Duration::from_secs(31)).await,
            vec!["s1".to_string()]
        );
        assert_eq!(hub.session_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_publisher_is_rejected() {
        let hub = hub(8);
        hub.attach_agent("s1", "agent-1").await.expect("attach");
        assert_eq!(
            hub.attach_agent("s1", "agent-2").await,
            Err(HubError::PublisherConflict("s1".to_string()))
        );
        hub.end_session("s1", Some("agent-1"), "agent_exit").await;
        assert!(hub.attach_agent("s1", "agent-2").await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recreated_session_treats_old_cursor_as_gap() {
        let hub = BridgeHub::new(
            settings(8),
            Arc::new(FixedHistory(vec![json!({"type": "assistant"})])),
        );
        hub.ingest("s1", progress(1)).await;
        let old_epoch = hub.snapshot("s1").await.expect("session").epoch;
        hub.reap_idle(Instant::now() + Duration::from_secs(31)).await;
        hub.ingest("s1", progress(1)).await;

        let (handle, mut rx, _evicted) = client("c1", 16);
        let outcome = hub
            .subscribe("s1", handle, Some(1), Some(&old_epoch))
            .await
            .expect("subscribe");
        assert!(outcome.gap);
        assert_ne!(outcome.epoch, old_epoch);
        assert_eq!(next_json(&mut rx).await["type"], "subscribed");
        assert_eq!(next_json(&mut rx).await["type"], "history");
        let replay = next_json(&mut rx).await;
        assert_eq!(replay["events"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn history_backed_events_during_catch_up_are_not_delivered_twice() {
        let (release, gate) = std_mpsc::channel();
        let hub = Arc::new(BridgeHub::new(
            settings(2),
            Arc::new(GatedHistory::new(
                gate,
                vec![
                    json!({"type": "user", "uuid": "rec-1"}),
                    json!({"type": "system_event", "subtype": "compact_boundary", "uuid": "rec-2"}),
                ],
            )),
        ));
        for n in 1..=3 {
            hub.ingest("s1", progress(n)).await;
        }

        let (handle, mut rx, _evicted) = client("c1", 16);
        let subscribing = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.subscribe("s1", handle, Some(0), Some("other")).await })
        };
        wait_for_subscribers(&hub, "s1", 1).await;
        // Persisted before the history read, so the history batch already carries it.
        let persisted = hub
            .ingest("s1", boundary().with_field("uuid", json!("rec-2")))
            .await;
        // Written after the read.
        let fresh = hub
            .ingest("s1", boundary().with_field("uuid", json!("rec-3")))
            .await;
        let transient = hub.ingest("s1", progress(9)).await;
        release.send(()).expect("release history");
        subscribing.await.expect("join").expect("subscribe");

        assert_eq!(next_json(&mut rx).await["type"], "subscribed");
        let history = next_json(&mut rx).await;
        assert_eq!(history["type"], "history");
        assert_eq!(history["messages"][1]["uuid"], "rec-2");
        assert_eq!(next_json(&mut rx).await["type"], "replay");

        let held: Vec<u64> = vec![
            next_json(&mut rx).await["seq"].as_u64().expect("seq"),
            next_json(&mut rx).await["seq"].as_u64().expect("seq"),
        ];
        assert_eq!(held, vec![fresh, transient]);
        assert!(persisted < fresh);
        assert_drained(&mut rx);
    }
}
