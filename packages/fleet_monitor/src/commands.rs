//! `fleet` subcommands: mount a consumer, follow it until Ctrl-C, unmount.

use anyhow::{Context, Result};
use fleet_sync::connection::ConnectionManager;
use fleet_sync::{
    AggregateConsumer, AggregateSnapshot, ConnectionState, DetailConsumer, DetailSnapshot,
    AtmRecord, ListConsumer, ListSnapshot, Notification, NotificationLevel, WsConnector,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::ApiClient;
use crate::config::MonitorConfig;

/// Follow the aggregate dashboard (counters and alerts).
pub async fn dashboard_command(config: &MonitorConfig) -> Result<()> {
    let api = ApiClient::new(config.sync.backend.clone(), config.request_timeout)?;
    let consumer = AggregateConsumer::mount(&config.sync, WsConnector, api)
        .context("Failed to open dashboard channels")?;
    info!("Following dashboard at {}", config.sync.backend.base_url);

    follow(consumer.subscribe(), consumer.notifications(), summarize_dashboard).await?;
    consumer.unmount();
    Ok(())
}

/// Follow the ATM list, refetching the page periodically.
pub async fn atms_command(config: &MonitorConfig) -> Result<()> {
    let api = ApiClient::new(config.sync.backend.clone(), config.request_timeout)?;
    let consumer =
        ListConsumer::mount(&config.sync, WsConnector).context("Failed to open list channel")?;

    let mut snapshots = consumer.subscribe();
    let mut notes = consumer.notifications();
    let mut refresh = tokio::time::interval(config.page_refresh);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let (fetched_tx, mut fetched_rx) = mpsc::unbounded_channel();
    let mut fetching = false;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut last_line = String::new();

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res.context("Failed to listen for Ctrl-C")?;
                info!("Received shutdown signal, cleaning up...");
                break;
            }
            _ = refresh.tick() => {
                if !start_page_fetch(&api, &mut fetching, &fetched_tx) {
                    debug!("ATM page fetch still running, skipping refresh");
                }
            }
            Some(fetched) = fetched_rx.recv() => {
                fetching = false;
                match fetched {
                    Ok(page) => {
                        debug!(rows = page.len(), "Fetched ATM page");
                        consumer.merge(page);
                    }
                    Err(e) => warn!("ATM page fetch failed: {e:#}"),
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let line = summarize_list(&snapshots.borrow_and_update());
                print_if_new(&mut last_line, line);
            }
            note = notes.recv() => {
                if !handle_notification(note) {
                    break;
                }
            }
        }
    }
    consumer.unmount();
    Ok(())
}

/// Fetch the ATM page off the follow loop. At most one fetch runs at a time;
/// returns false when one is already in flight.
fn start_page_fetch(
    api: &ApiClient,
    in_flight: &mut bool,
    done: &mpsc::UnboundedSender<Result<Vec<AtmRecord>>>,
) -> bool {
    if *in_flight {
        return false;
    }
    *in_flight = true;
    let api = api.clone();
    let done = done.clone();
    tokio::spawn(async move {
        let _ = done.send(api.fetch_atms().await);
    });
    true
}

/// Follow one ATM's telemetry.
pub async fn atm_command(config: &MonitorConfig, atm_id: &str, request_history: bool) -> Result<()> {
    let consumer = DetailConsumer::mount(atm_id, &config.sync, WsConnector)
        .with_context(|| format!("Failed to open detail channel for {atm_id}"))?;

    if request_history {
        if wait_connected(consumer.connection(), config).await {
            consumer.request_history();
        } else {
            warn!(atm = %atm_id, "Not connected, history request skipped");
        }
    }

    follow(consumer.subscribe(), consumer.notifications(), summarize_detail).await?;
    consumer.unmount();
    Ok(())
}

async fn wait_connected(connection: &ConnectionManager, config: &MonitorConfig) -> bool {
    let mut status = connection.subscribe();
    let connected = status.wait_for(|s| s.state == ConnectionState::Connected);
    matches!(
        tokio::time::timeout_at(Instant::now() + config.request_timeout, connected).await,
        Ok(Ok(_))
    )
}

/// Print a summary line per distinct snapshot and log notifications until
/// Ctrl-C or the consumer goes away.
async fn follow<T>(
    mut snapshots: watch::Receiver<T>,
    mut notes: broadcast::Receiver<Notification>,
    summarize: fn(&T) -> String,
) -> Result<()> {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut last_line = String::new();

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res.context("Failed to listen for Ctrl-C")?;
                info!("Received shutdown signal, cleaning up...");
                return Ok(());
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let line = summarize(&snapshots.borrow_and_update());
                print_if_new(&mut last_line, line);
            }
            note = notes.recv() => {
                if !handle_notification(note) {
                    return Ok(());
                }
            }
        }
    }
}

fn print_if_new(last: &mut String, line: String) {
    if *last != line {
        println!("{line}");
        *last = line;
    }
}

/// Returns false once the notification channel is closed.
fn handle_notification(note: Result<Notification, broadcast::error::RecvError>) -> bool {
    match note {
        Ok(n) => {
            log_notification(&n);
            true
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "Notifications dropped");
            true
        }
        Err(broadcast::error::RecvError::Closed) => false,
    }
}

fn log_notification(n: &Notification) {
    let description = n.description.as_deref().unwrap_or("");
    match n.level {
        NotificationLevel::Error => error!(description, "{}", n.title),
        NotificationLevel::Warning => warn!(description, "{}", n.title),
        NotificationLevel::Success | NotificationLevel::Info => info!(description, "{}", n.title),
    }
}

fn summarize_dashboard(s: &AggregateSnapshot) -> String {
    let counters = match &s.stats {
        Some(st) => format!(
            "total={} online={} offline={} error={} maintenance={}",
            st.total_atms, st.online_atms, st.offline_atms, st.error_atms, st.maintenance_atms
        ),
        None => "loading".to_string(),
    };
    format!(
        "{counters} alerts={} [dashboard: {}, alerts: {}]",
        s.alerts.len(),
        s.dashboard_connection.state,
        s.alerts_connection.state
    )
}

fn summarize_list(s: &ListSnapshot) -> String {
    let mut changed: Vec<&str> = s.recently_changed.keys().map(String::as_str).collect();
    changed.truncate(5);
    format!(
        "{} ATMs, {} recently changed {:?} [{}]",
        s.atms.len(),
        s.recently_changed.len(),
        changed,
        s.connection.state
    )
}

fn summarize_detail(s: &DetailSnapshot) -> String {
    let Some(latest) = &s.latest else {
        return format!("ATM {}: no telemetry yet [{}]", s.atm_id, s.connection.state);
    };
    let r = &latest.readings;
    let fmt = |v: Option<f64>, unit: &str| v.map_or("-".to_string(), |v| format!("{v:.1}{unit}"));
    format!(
        "ATM {}: {} cash={} temp={} cpu={} history={} [{}]",
        s.atm_id,
        latest.status,
        fmt(r.cash_level_percent, "%"),
        fmt(r.temperature_celsius, "°C"),
        fmt(r.cpu_usage_percent, "%"),
        s.history.len(),
        s.connection.state
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_sync::config::BackendConfig;
    use fleet_sync::{AggregateStats, ConnectionStatus};
    use std::time::Duration;

    #[test]
    fn test_dashboard_summary() {
        let snapshot = AggregateSnapshot {
            stats: Some(AggregateStats {
                total_atms: 12,
                online_atms: 9,
                offline_atms: 2,
                error_atms: 1,
                ..Default::default()
            }),
            alerts: Vec::new(),
            is_loading: false,
            last_update: None,
            last_stats_update: None,
            dashboard_connection: ConnectionStatus::default(),
            alerts_connection: ConnectionStatus::default(),
        };
        assert_eq!(
            summarize_dashboard(&snapshot),
            "total=12 online=9 offline=2 error=1 maintenance=0 alerts=0 [dashboard: disconnected, alerts: disconnected]"
        );
    }

    #[test]
    fn test_print_if_new_dedups() {
        let mut last = String::new();
        print_if_new(&mut last, "a".into());
        assert_eq!(last, "a");
        print_if_new(&mut last, "a".into());
        assert_eq!(last, "a");
    }

    #[tokio::test]
    async fn test_page_fetch_runs_one_at_a_time() {
        let mut backend = BackendConfig::default();
        backend.base_url = "http://127.0.0.1:1".into();
        let api = ApiClient::new(backend, Duration::from_secs(2)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut fetching = false;

        assert!(start_page_fetch(&api, &mut fetching, &tx));
        assert!(!start_page_fetch(&api, &mut fetching, &tx));
        assert!(rx.recv().await.unwrap().is_err());
        assert!(rx.try_recv().is_err());

        fetching = false;
        assert!(start_page_fetch(&api, &mut fetching, &tx));
        assert!(rx.recv().await.unwrap().is_err());
    }

    #[test]
    fn test_closed_notifications_stop_following() {
        assert!(!handle_notification(Err(broadcast::error::RecvError::Closed)));
        assert!(handle_notification(Err(broadcast::error::RecvError::Lagged(3))));
    }
}
