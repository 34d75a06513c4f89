use axum::extract::ws::Message;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    Full,
    Closed,
}

/// The hub's view of one browser connection: a bounded outbound queue drained by the
/// connection's writer task, plus an eviction signal the connection loop watches.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    conn_id: Arc<str>,
    sender: mpsc::Sender<Message>,
    evict: Arc<watch::Sender<Option<String>>>,
}

impl ClientHandle {
    pub fn new(
        conn_id: impl Into<Arc<str>>,
        sender: mpsc::Sender<Message>,
    ) -> (Self, watch::Receiver<Option<String>>) {
        let (evict, evicted) = watch::channel(None);
        (
            Self {
                conn_id: conn_id.into(),
                sender,
                evict: Arc::new(evict),
            },
            evicted,
        )
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Never waits: fan-out must not stall on one slow consumer.
    pub fn offer(&self, msg: Message) -> Delivery {
        match self.sender.try_send(msg) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub fn offer_text(&self, text: String) -> Delivery {
        self.offer(Message::Text(text))
    }

    pub fn evict(&self, reason: &str) {
        warn!(event = "client_evicted", conn_id = %self.conn_id, reason = reason);
        self.evict.send_replace(Some(reason.to_string()));
    }

    pub fn is_evicted(&self) -> bool {
        self.evict.borrow().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_reports_full_and_closed_queues() {
        let (tx, rx) = mpsc::channel(1);
        let (client, _evicted) = ClientHandle::new("conn-1", tx);
        assert_eq!(client.offer_text("a".to_string()), Delivery::Queued);
        assert_eq!(client.offer_text("b".to_string()), Delivery::Full);
        drop(rx);
        assert_eq!(client.offer_text("c".to_string()), Delivery::Closed);
    }

    #[test]
    fn evict_is_observed_by_receiver() {
        let (tx, _rx) = mpsc::channel(1);
        let (client, evicted) = ClientHandle::new("conn-2", tx);
        assert!(!client.is_evicted());
        client.evict("slow_consumer");
        assert!(client.is_evicted());
        assert_eq!(evicted.borrow().as_deref(), Some("slow_consumer"));
    }
}
