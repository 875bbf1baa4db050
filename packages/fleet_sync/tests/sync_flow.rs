//! End-to-end flows through mounted consumers over the in-memory transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;

use fleet_sync::consumer::detail::DetailConsumer;
use fleet_sync::consumer::list::ListConsumer;
use fleet_sync::transport::memory::{MemoryRemote, MemoryServer, Outgoing};
use fleet_sync::{
    AggregateConsumer, AggregateStats, AtmRecord, AtmStatus, ConnectionState, MemoryConnector,
    NotificationLevel, Resync, StatsSource, SyncConfig, SyncError,
};

fn sample(atm: &str, n: u32, cash: f64) -> serde_json::Value {
    json!({
        "time": format!("2024-05-01T10:{:02}:00Z", n),
        "atm_id": atm,
        "status": "online",
        "cash_level_percent": cash,
        "temperature_celsius": 30.0,
    })
}

fn telemetry(atm: &str, n: u32, cash: f64) -> String {
    json!({"type": "telemetry_update", "atm_id": atm, "data": sample(atm, n, cash)}).to_string()
}

fn status_change(atm: &str, old: &str, new: &str) -> String {
    json!({
        "type": "status_change",
        "data": {"atm_id": atm, "old_status": old, "new_status": new},
    })
    .to_string()
}

fn record(id: &str, status: &str) -> AtmRecord {
    serde_json::from_value(json!({"atm_id": id, "name": id, "status": status})).unwrap()
}

async fn accept(server: &mut MemoryServer) -> MemoryRemote {
    server.accept().await.expect("connector dropped")
}

#[tokio::test(start_paused = true)]
async fn test_detail_hydration_then_updates() {
    let (connector, mut server) = MemoryConnector::new();
    let consumer = DetailConsumer::mount("ATM-7", &SyncConfig::default(), connector).unwrap();
    let remote = accept(&mut server).await;
    assert!(remote.url.ends_with("/ws/atm/ATM-7"));

    let history: Vec<_> = (0..3).map(|n| sample("ATM-7", n, 80.0)).rev().collect();
    remote.push_frame(
        json!({
            "type": "atm_initial",
            "atm_id": "ATM-7",
            "data": {"telemetry_history": history},
        })
        .to_string(),
    );
    for n in 10..15 {
        remote.push_frame(telemetry("ATM-7", n, 80.0));
    }

    let mut snapshots = consumer.subscribe();
    let snap = snapshots
        .wait_for(|s| s.history.len() == 8)
        .await
        .unwrap()
        .clone();
    assert!(!snap.is_loading);
    assert_eq!(snap.history[0].time.to_rfc3339(), "2024-05-01T10:14:00+00:00");
    assert_eq!(snap.latest.as_ref(), Some(&snap.history[0]));
}

#[tokio::test(start_paused = true)]
async fn test_detail_history_is_bounded() {
    let mut config = SyncConfig::default();
    config.detail.history_capacity = 3;
    let (connector, mut server) = MemoryConnector::new();
    let consumer = DetailConsumer::mount("ATM-1", &config, connector).unwrap();
    let remote = accept(&mut server).await;

    for n in 0..5 {
        remote.push_frame(telemetry("ATM-1", n, 80.0));
    }
    let mut snapshots = consumer.subscribe();
    let snap = snapshots
        .wait_for(|s| s.latest.as_ref().is_some_and(|l| l.time.format("%M").to_string() == "04"))
        .await
        .unwrap()
        .clone();
    let minutes: Vec<_> = snap
        .history
        .iter()
        .map(|s| s.time.format("%M").to_string())
        .collect();
    assert_eq!(minutes, vec!["04", "03", "02"]);
}

#[tokio::test(start_paused = true)]
async fn test_detail_ignores_other_atms_and_flags_low_cash() {
    let (connector, mut server) = MemoryConnector::new();
    let consumer = DetailConsumer::mount("ATM-1", &SyncConfig::default(), connector).unwrap();
    let mut notes = consumer.notifications();
    let remote = accept(&mut server).await;

    remote.push_frame(telemetry("ATM-2", 1, 5.0));
    remote.push_frame(telemetry("ATM-1", 2, 50.0));
    remote.push_frame(telemetry("ATM-1", 3, 10.0));

    let note = notes.recv().await.unwrap();
    assert_eq!(note.level, NotificationLevel::Warning);
    assert_eq!(note.title, "Low cash level: 10%");
    assert_eq!(consumer.snapshot().history.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_detail_request_history_reaches_server() {
    let (connector, mut server) = MemoryConnector::new();
    let consumer = DetailConsumer::mount("ATM-1", &SyncConfig::default(), connector).unwrap();
    let mut remote = accept(&mut server).await;
    consumer
        .connection()
        .subscribe()
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await
        .unwrap();

    consumer.request_history();
    assert_eq!(
        remote.recv_sent().await,
        Some(Outgoing::Text("request_history".into()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_ceiling_surfaces_failed_in_snapshot() {
    let mut config = SyncConfig::default();
    config.connection.max_reconnect_attempts = 3;
    let (connector, mut server) = MemoryConnector::new();
    let consumer = ListConsumer::mount(&config, connector.clone()).unwrap();
    let remote = accept(&mut server).await;
    consumer
        .connection()
        .subscribe()
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await
        .unwrap();

    connector.refuse_next(3, "connection refused").await;
    remote.close(1006);

    let mut snapshots = consumer.subscribe();
    let snap = snapshots
        .wait_for(|s| s.connection.state == ConnectionState::Failed)
        .await
        .unwrap()
        .clone();
    assert_eq!(snap.connection.attempt, 3);
    assert_eq!(connector.attempts(), 4);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(connector.attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_list_marker_survives_refetch_and_expires_on_sweep() {
    let (connector, mut server) = MemoryConnector::new();
    let consumer = ListConsumer::mount(&SyncConfig::default(), connector).unwrap();
    let remote = accept(&mut server).await;
    consumer.merge(vec![record("A", "online"), record("B", "online")]);

    remote.push_frame(status_change("A", "online", "offline"));
    let mut snapshots = consumer.subscribe();
    snapshots
        .wait_for(|s| s.is_recently_changed("A"))
        .await
        .unwrap();
    assert_eq!(consumer.snapshot().atms[0].status, AtmStatus::Offline);

    tokio::time::sleep(Duration::from_secs(5)).await;
    consumer.merge(vec![record("A", "offline"), record("B", "online"), record("C", "error")]);
    let snap = snapshots
        .wait_for(|s| s.atms.len() == 3)
        .await
        .unwrap()
        .clone();
    assert!(snap.is_recently_changed("A"));
    assert!(!snap.is_recently_changed("B"));

    // First sweep tick lands at 60s
    tokio::time::sleep(Duration::from_secs(60)).await;
    snapshots
        .wait_for(|s| s.recently_changed.is_empty())
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_list_notifies_on_offline() {
    let (connector, mut server) = MemoryConnector::new();
    let consumer = ListConsumer::mount(&SyncConfig::default(), connector).unwrap();
    let mut notes = consumer.notifications();
    let remote = accept(&mut server).await;

    remote.push_frame(status_change("Z", "online", "offline"));
    let note = notes.recv().await.unwrap();
    assert_eq!(note.level, NotificationLevel::Warning);
    assert_eq!(note.title, "Z changed from online to offline");
}

#[tokio::test(start_paused = true)]
async fn test_unmount_cancels_pending_reconnect() {
    let (connector, mut server) = MemoryConnector::new();
    let consumer = ListConsumer::mount(&SyncConfig::default(), connector.clone()).unwrap();
    let remote = accept(&mut server).await;
    consumer
        .connection()
        .subscribe()
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await
        .unwrap();

    remote.close(1011);
    consumer
        .connection()
        .subscribe()
        .wait_for(|s| s.state == ConnectionState::Reconnecting)
        .await
        .unwrap();
    consumer.unmount();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts(), 1);
    assert!(server.try_accept().is_none());
}

struct CountingSource {
    calls: Arc<AtomicUsize>,
}

impl StatsSource for CountingSource {
    async fn fetch(&self) -> Result<Resync, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Resync {
            stats: AggregateStats {
                total_atms: 12,
                online_atms: 10,
                offline_atms: 2,
                error_atms: 0,
                ..Default::default()
            },
            alerts: Some(Vec::new()),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_aggregate_delta_and_alerts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (connector, mut server) = MemoryConnector::new();
    let consumer = AggregateConsumer::mount(
        &SyncConfig::default(),
        connector,
        CountingSource {
            calls: calls.clone(),
        },
    )
    .unwrap();
    let mut notes = consumer.notifications();

    let first = accept(&mut server).await;
    let second = accept(&mut server).await;
    let (dashboard, alerts) = if first.url.ends_with("/ws/dashboard") {
        (first, second)
    } else {
        (second, first)
    };
    assert!(alerts.url.ends_with("/ws/alerts"));

    let mut snapshots = consumer.subscribe();
    snapshots.wait_for(|s| s.stats.is_some()).await.unwrap();

    dashboard.push_frame(status_change("ATM-3", "online", "error"));
    let snap = snapshots
        .wait_for(|s| s.stats.as_ref().is_some_and(|st| st.error_atms == 1))
        .await
        .unwrap()
        .clone();
    let stats = snap.stats.unwrap();
    assert_eq!((stats.online_atms, stats.offline_atms, stats.error_atms), (9, 2, 1));
    assert_eq!(notes.recv().await.unwrap().level, NotificationLevel::Error);

    alerts.push_frame(
        json!({
            "type": "new_alert",
            "data": {
                "id": "al-1",
                "atm_id": "ATM-3",
                "severity": "critical",
                "title": "Cash jam",
                "message": "Dispenser jammed",
            },
        })
        .to_string(),
    );
    let note = notes.recv().await.unwrap();
    assert_eq!(note.title, "New critical alert: Cash jam");
    snapshots.wait_for(|s| s.alerts.len() == 1).await.unwrap();

    consumer.mark_read("al-1");
    snapshots.wait_for(|s| s.alerts.is_empty()).await.unwrap();

    // Next pull corrects the pushed adjustment
    tokio::time::sleep(Duration::from_secs(15)).await;
    snapshots
        .wait_for(|s| s.stats.as_ref().is_some_and(|st| st.error_atms == 0))
        .await
        .unwrap();
    assert!(calls.load(Ordering::SeqCst) >= 2);

    consumer.unmount();
    let settled = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(calls.load(Ordering::SeqCst), settled);
}
