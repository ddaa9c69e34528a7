use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Mirrors the handful of event names the original event queue published:
/// `request_complete` on parser completion, plus the subscribe/unsubscribe
/// control records a multi-process event bus needs. Since this proxy runs
/// events through a single in-process channel rather than a cross-process
/// queue, `Subscribe`/`Unsubscribe` are kept only so `EventName` stays a
/// faithful superset of what a publisher may ever emit.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    RequestComplete,
    Subscribe,
    Unsubscribe,
}

#[derive(Clone, Debug, Serialize)]
pub struct EventRecord {
    pub request_id: Uuid,
    pub process_id: u32,
    pub thread_id: u64,
    pub event_timestamp: f64,
    pub event_name: EventName,
    pub event_payload: serde_json::Value,
    pub publisher_id: Option<String>,
}

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

/// A per-connection counter standing in for the OS thread id the original
/// queue records; under tokio there is no stable thread affinity per
/// connection, so each protocol handler is handed a distinct sequence number
/// at construction instead.
pub fn next_thread_id() -> u64 {
    NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed) as u64
}

pub trait EventPublisher: Send + Sync {
    fn publish(&self, record: EventRecord);
}

/// Default publisher used when `enable_events` is false. Every call is a
/// no-op so call sites never need to branch on whether events are enabled.
#[derive(Default)]
pub struct NullPublisher;

impl EventPublisher for NullPublisher {
    fn publish(&self, _record: EventRecord) {}
}

/// Publishes onto an in-process channel. The multi-worker-process event
/// queue of the original is collapsed to this since the acceptor here is a
/// single process; a consumer drains `rx` to persist or forward events.
pub struct ChannelPublisher {
    tx: UnboundedSender<EventRecord>,
}

impl ChannelPublisher {
    pub fn new(tx: UnboundedSender<EventRecord>) -> Self {
        Self { tx }
    }
}

impl EventPublisher for ChannelPublisher {
    fn publish(&self, record: EventRecord) {
        // A full or closed receiver means nobody is listening for events;
        // dropping the record is preferable to blocking the connection on it.
        let _ = self.tx.send(record);
    }
}

pub fn timestamp_secs(now: std::time::SystemTime) -> f64 {
    now.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_publisher_accepts_any_record() {
        let publisher = NullPublisher;
        publisher.publish(EventRecord {
            request_id: Uuid::nil(),
            process_id: 0,
            thread_id: 0,
            event_timestamp: 0.0,
            event_name: EventName::RequestComplete,
            event_payload: serde_json::json!({}),
            publisher_id: None,
        });
    }

    #[tokio::test]
    async fn channel_publisher_delivers_record() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let publisher = ChannelPublisher::new(tx);
        publisher.publish(EventRecord {
            request_id: Uuid::nil(),
            process_id: std::process::id(),
            thread_id: next_thread_id(),
            event_timestamp: timestamp_secs(std::time::SystemTime::now()),
            event_name: EventName::RequestComplete,
            event_payload: serde_json::json!({"method": "GET"}),
            publisher_id: Some("proxy".to_string()),
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_name, EventName::RequestComplete);
    }
}
