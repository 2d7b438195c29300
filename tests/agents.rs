mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, test_config, write_registry, Behavior, MockAgent};
use mender::agents::{AgentPool, Health, HeartbeatMonitor};
use mender::errors::MenderError;
use mender::events::{Broadcaster, Event};
use mender::registry::{FileRegistry, Reconciler, RegistrySource};

fn pool(broadcaster: &Arc<Broadcaster>, prompt_timeout_secs: u64) -> Arc<AgentPool> {
    let mut settings = test_config(std::path::Path::new("/unused")).agents;
    settings.prompt_timeout_secs = prompt_timeout_secs;
    Arc::new(AgentPool::new(broadcaster.clone(), settings, Duration::from_secs(1)))
}

#[tokio::test]
async fn test_reconciler_follows_registry() {
    let home = tempfile::tempdir().unwrap();
    let project = home.path().join("shop");
    let agent = MockAgent::start(Behavior::reply("ok")).await;
    write_registry(home.path(), &[("shop-1", agent.entry(&project))]);

    let broadcaster = Arc::new(Broadcaster::new(20));
    let pool = pool(&broadcaster, 5);
    let source: Arc<dyn RegistrySource> = Arc::new(FileRegistry::new(home.path().join("registry.json")));
    let reconciler = Reconciler::new(source, pool.clone(), broadcaster.clone(), Duration::from_secs(1));
    let mut events = broadcaster.subscribe();

    let report = reconciler.reconcile_once().await;
    assert_eq!(report.added, vec!["shop-1"]);
    assert_eq!(pool.connected_ids().await, vec!["shop-1"]);
    let summary = pool.get_agents_summary().await;
    assert_eq!(summary[0].project_name, "shop");
    assert_eq!(summary[0].health, Health::Healthy);
    let mut added = false;
    while let Ok(event) = events.try_recv() {
        if let Event::AgentAdded { agent } = event {
            added = agent.instance_id == "shop-1" && agent.connected;
        }
    }
    assert!(added);

    let mut entry = agent.entry(&project);
    entry.role = Some("fixer".into());
    write_registry(home.path(), &[("shop-1", entry)]);
    let report = reconciler.reconcile_once().await;
    assert_eq!(report.updated, vec!["shop-1"]);
    assert!(report.added.is_empty());
    assert_eq!(pool.get_agents_summary().await[0].role.as_deref(), Some("fixer"));

    write_registry(home.path(), &[]);
    let report = reconciler.reconcile_once().await;
    assert_eq!(report.removed, vec!["shop-1"]);
    assert!(pool.connections().await.is_empty());

    let mut removed = false;
    while let Ok(event) = events.try_recv() {
        if let Event::AgentRemoved { instance_id } = event {
            removed = instance_id == "shop-1";
        }
    }
    assert!(removed);
}

#[tokio::test]
async fn test_unreachable_agent_reconnects_when_it_comes_up() {
    let home = tempfile::tempdir().unwrap();
    let project = home.path().join("shop");
    let agent = MockAgent::start(Behavior::reply("ok")).await;
    let mut entry = agent.entry(&project);
    entry.address = Some("127.0.0.1:1".into());
    write_registry(home.path(), &[("shop-1", entry)]);

    let broadcaster = Arc::new(Broadcaster::new(20));
    let pool = pool(&broadcaster, 5);
    let source: Arc<dyn RegistrySource> = Arc::new(FileRegistry::new(home.path().join("registry.json")));
    let reconciler = Reconciler::new(source, pool.clone(), broadcaster, Duration::from_secs(1));

    let report = reconciler.reconcile_once().await;
    assert_eq!(report.added, vec!["shop-1"]);
    assert!(pool.connected_ids().await.is_empty());
    assert_eq!(pool.connections().await.len(), 1);

    write_registry(home.path(), &[("shop-1", agent.entry(&project))]);
    let report = reconciler.reconcile_once().await;
    assert_eq!(report.reconnected, vec!["shop-1"]);
    assert_eq!(pool.connected_ids().await, vec!["shop-1"]);
}

#[tokio::test]
async fn test_prompt_round_trip_and_timeout_cleanup() {
    let project = std::path::Path::new("/w/shop");
    let fast = MockAgent::start(Behavior::reply("done")).await;
    let slow = MockAgent::start(Behavior::slow("late", Duration::from_secs(3))).await;

    let broadcaster = Arc::new(Broadcaster::new(20));
    let pool = pool(&broadcaster, 1);
    assert!(pool.connect_agent("fast", fast.entry(project)).await);
    assert!(pool.connect_agent("slow", slow.entry(project)).await);

    let conn = pool.get_connection("fast").await.unwrap();
    let reply = conn.send_prompt("hello").await.unwrap();
    assert_eq!(reply.content, "done");
    assert_eq!(reply.status_or_default(), "success");
    assert_eq!(fast.prompts(), vec!["hello"]);

    let slow_conn = pool.get_connection("slow").await.unwrap();
    let err = slow_conn.send_prompt("hello").await.unwrap_err();
    assert!(matches!(err, MenderError::RequestTimeout(_)));
    assert_eq!(slow_conn.pending_count(), 0);
    assert!(!slow_conn.is_busy());

    let activity = broadcaster.recent_activity(10);
    assert!(activity.iter().any(|a| a.event_type == "prompt_response" && a.instance_id == "fast"));
    assert!(activity.iter().any(|a| a.event_type == "prompt_sent" && a.instance_id == "slow"));

    pool.disconnect_all().await;
}

#[tokio::test]
async fn test_busy_agent_hands_off_to_peer() {
    let project = std::path::Path::new("/w/shop");
    let busy = MockAgent::start(Behavior::slow("first", Duration::from_millis(800))).await;
    let idle = MockAgent::start(Behavior::reply("second")).await;

    let broadcaster = Arc::new(Broadcaster::new(20));
    let pool = pool(&broadcaster, 5);
    assert!(pool.connect_agent("busy", busy.entry(project)).await);
    assert!(pool.connect_agent("idle", idle.entry(project)).await);

    let target = pool.get_connection("busy").await.unwrap();
    let in_flight = {
        let target = target.clone();
        tokio::spawn(async move { target.send_prompt("long task").await })
    };
    assert!(eventually(Duration::from_secs(2), || {
        let target = target.clone();
        async move { target.is_busy() }
    })
    .await);

    let reply = pool.send_prompt_with_handoff("busy", "quick task").await.unwrap();
    assert_eq!(reply.instance_id, "idle");
    assert_eq!(reply.handed_off_from.as_deref(), Some("busy"));
    assert_eq!(reply.response.content, "second");

    let first = in_flight.await.unwrap().unwrap();
    assert_eq!(first.content, "first");

    let direct = pool.send_prompt_with_handoff("busy", "next").await.unwrap();
    assert_eq!(direct.instance_id, "busy");
    assert!(direct.handed_off_from.is_none());

    pool.disconnect_all().await;
}

#[tokio::test]
async fn test_agent_loss_marks_disconnected() {
    let project = std::path::Path::new("/w/shop");
    let agent = MockAgent::start(Behavior::reply("ok")).await;

    let broadcaster = Arc::new(Broadcaster::new(20));
    let pool = pool(&broadcaster, 5);
    let monitor = HeartbeatMonitor::new(
        pool.clone(),
        broadcaster.clone(),
        Duration::from_secs(1),
        chrono::Duration::seconds(3),
    );
    assert!(pool.connect_agent("shop-1", agent.entry(project)).await);
    assert_eq!(monitor.check_all().await, 1);

    let conn = pool.get_connection("shop-1").await.unwrap();
    assert_eq!(conn.health(), Health::Healthy);
    assert!(conn.last_heartbeat().is_some());

    let mut events = broadcaster.subscribe();
    agent.stop();
    assert!(eventually(Duration::from_secs(3), || {
        let conn = conn.clone();
        async move { !conn.is_connected() }
    })
    .await);
    assert_eq!(conn.health(), Health::Disconnected);
    assert!(matches!(
        conn.send_prompt("anyone?").await,
        Err(MenderError::NotConnected(_))
    ));
    assert_eq!(monitor.check_all().await, 0);

    let mut saw_delta = false;
    while let Ok(event) = events.try_recv() {
        if let Event::AgentDelta { instance_id, changes } = event {
            saw_delta |= instance_id == "shop-1"
                && changes.get("connected").and_then(|v| v.as_bool()) == Some(false);
        }
    }
    assert!(saw_delta);
}

#[tokio::test]
async fn test_silent_agent_goes_stale_then_recovers() {
    let project = std::path::Path::new("/w/shop");
    let agent = MockAgent::start(Behavior::reply("ok")).await;

    let broadcaster = Arc::new(Broadcaster::new(20));
    let pool = pool(&broadcaster, 5);
    let monitor = HeartbeatMonitor::new(
        pool.clone(),
        broadcaster.clone(),
        Duration::from_secs(1),
        chrono::Duration::milliseconds(500),
    );
    assert!(pool.connect_agent("shop-1", agent.entry(project)).await);
    monitor.check_all().await;
    let conn = pool.get_connection("shop-1").await.unwrap();
    assert_eq!(conn.health(), Health::Healthy);

    let mut events = broadcaster.subscribe();
    agent.silence(true);
    // The frame already being awaited may still be answered.
    monitor.check_all().await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    monitor.check_all().await;
    assert_eq!(conn.health(), Health::Stale);
    assert!(conn.is_connected());
    monitor.check_all().await;
    assert_eq!(conn.health(), Health::Stale);

    agent.silence(false);
    let recovering = &monitor;
    let recovered = conn.clone();
    assert!(eventually(Duration::from_secs(5), move || {
        let conn = recovered.clone();
        async move {
            recovering.check_all().await;
            conn.health() == Health::Healthy
        }
    })
    .await);
    assert!(conn.is_connected());

    let mut healths = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::AgentDelta { instance_id, changes } = event {
            if let Some(health) = changes.get("health").and_then(|v| v.as_str()) {
                assert_eq!(instance_id, "shop-1");
                healths.push(health.to_string());
            }
        }
    }
    assert_eq!(healths, vec!["stale", "healthy"]);

    pool.disconnect_all().await;
}

#[tokio::test]
async fn test_duplicate_command_rejected_while_in_flight() {
    let project = std::path::Path::new("/w/shop");
    let agent = MockAgent::start(Behavior::slow_commands(Duration::from_millis(500))).await;

    let broadcaster = Arc::new(Broadcaster::new(20));
    let pool = pool(&broadcaster, 5);
    assert!(pool.connect_agent("shop-1", agent.entry(project)).await);
    let conn = pool.get_connection("shop-1").await.unwrap();

    let first = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send_command("newAgentSession", Duration::from_secs(3)).await })
    };
    assert!(eventually(Duration::from_secs(2), || {
        let conn = conn.clone();
        async move { conn.pending_count() == 1 }
    })
    .await);

    let second = conn.send_command("newAgentSession", Duration::from_secs(3)).await;
    assert!(matches!(second, Err(MenderError::InvalidState(_))));

    let reply = first.await.unwrap().unwrap();
    assert_eq!(reply["success"], true);
    assert_eq!(conn.pending_count(), 0);

    pool.disconnect_all().await;
}
