use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::types::{ActivityEvent, Event};

/// Fans events out to subscribers and keeps a bounded activity history.
/// Holds no business logic.
pub struct Broadcaster {
    sinks: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
    activity: Mutex<VecDeque<ActivityEvent>>,
    max_activity: usize,
}

impl Broadcaster {
    pub fn new(max_activity: usize) -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
            activity: Mutex::new(VecDeque::with_capacity(max_activity)),
            max_activity: max_activity.max(1),
        }
    }

    /// Register a new sink. Dropping the receiver unsubscribes it on the next
    /// broadcast.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn broadcast(&self, event: Event) {
        trace!(event = event.kind(), "Broadcasting");
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        let before = sinks.len();
        sinks.retain(|tx| tx.send(event.clone()).is_ok());
        if sinks.len() < before {
            debug!(removed = before - sinks.len(), "Dropped closed subscribers");
        }
    }

    /// Prepend an activity record (evicting the oldest past the cap) and
    /// broadcast it.
    pub fn log_activity(
        &self,
        event_type: &str,
        instance_id: &str,
        port: Option<u16>,
        fields: Map<String, Value>,
    ) {
        let record = ActivityEvent {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            instance_id: instance_id.to_string(),
            port,
            fields,
        };
        {
            let mut activity = self.activity.lock().unwrap_or_else(|e| e.into_inner());
            activity.push_front(record.clone());
            activity.truncate(self.max_activity);
        }
        self.broadcast(Event::Activity { event: record });
    }

    /// Newest first.
    pub fn recent_activity(&self, limit: usize) -> Vec<ActivityEvent> {
        self.activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let broadcaster = Broadcaster::new(10);
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();

        broadcaster.broadcast(Event::AgentRemoved { instance_id: "x".into() });

        assert_eq!(a.recv().await.unwrap().kind(), "agent_removed");
        assert_eq!(b.recv().await.unwrap().kind(), "agent_removed");
    }

    #[test]
    fn test_closed_sink_removed() {
        let broadcaster = Broadcaster::new(10);
        let rx = broadcaster.subscribe();
        let _keep = broadcaster.subscribe();
        drop(rx);

        broadcaster.broadcast(Event::PipelineComplete { failure_id: "f".into() });
        assert_eq!(broadcaster.subscriber_count(), 1);
    }

    #[test]
    fn test_activity_ring_evicts_oldest() {
        let broadcaster = Broadcaster::new(3);
        for i in 0..5 {
            broadcaster.log_activity(&format!("e{}", i), "a1", None, Map::new());
        }
        let recent = broadcaster.recent_activity(10);
        let types: Vec<_> = recent.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["e4", "e3", "e2"]);
    }

    #[tokio::test]
    async fn test_log_activity_broadcasts() {
        let broadcaster = Broadcaster::new(5);
        let mut rx = broadcaster.subscribe();
        broadcaster.log_activity("agent_connected", "a1", Some(9100), Map::new());
        match rx.recv().await.unwrap() {
            Event::Activity { event } => {
                assert_eq!(event.event_type, "agent_connected");
                assert_eq!(event.port, Some(9100));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
