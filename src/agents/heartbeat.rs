use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::Health;
use super::pool::AgentPool;
use crate::events::{Broadcaster, Event};

/// Health after one probe.
///
/// Success always yields `Healthy`. A failed probe demotes to `Stale` only once
/// more than `threshold` has passed since the last successful heartbeat.
/// `Disconnected` is owned by the connection and never changes here.
pub fn next_health(
    current: Health,
    probe_ok: bool,
    last_heartbeat: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: chrono::Duration,
) -> Health {
    if current == Health::Disconnected {
        return current;
    }
    if probe_ok {
        return Health::Healthy;
    }
    let overdue = match last_heartbeat {
        Some(at) => now - at > threshold,
        None => true,
    };
    if overdue {
        Health::Stale
    } else {
        current
    }
}

/// Probes every connected agent on a fixed interval.
pub struct HeartbeatMonitor {
    pool: Arc<AgentPool>,
    broadcaster: Arc<Broadcaster>,
    interval: Duration,
    stale_threshold: chrono::Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        pool: Arc<AgentPool>,
        broadcaster: Arc<Broadcaster>,
        interval: Duration,
        stale_threshold: chrono::Duration,
    ) -> Self {
        Self {
            pool,
            broadcaster,
            interval,
            stale_threshold,
        }
    }

    /// Probe all connected agents once. Returns how many were probed.
    pub async fn check_all(&self) -> usize {
        let connections: Vec<_> = self
            .pool
            .connections()
            .await
            .into_iter()
            .filter(|c| c.is_connected())
            .collect();

        let probes = connections.iter().map(|conn| async move {
            let before = conn.health();
            let ok = conn.heartbeat().await;
            let after = next_health(before, ok, conn.last_heartbeat(), Utc::now(), self.stale_threshold);
            if !ok && after != before {
                conn.set_health(after);
            }
            if after != before {
                if after == Health::Stale {
                    warn!(instance_id = %conn.instance_id(), "Agent heartbeat stale");
                } else {
                    info!(instance_id = %conn.instance_id(), health = %after, "Agent health changed");
                }
                let mut changes = Map::new();
                changes.insert("health".into(), Value::String(after.to_string()));
                changes.insert("last_heartbeat".into(), json!(conn.last_heartbeat()));
                self.broadcaster.broadcast(Event::AgentDelta {
                    instance_id: conn.instance_id().to_string(),
                    changes,
                });
            }
        });
        join_all(probes).await;

        connections.len()
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Heartbeat monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            let probed = self.check_all().await;
            debug!(probed, "Heartbeat cycle complete");
        }
        info!("Heartbeat monitor stopped");
    }
}
