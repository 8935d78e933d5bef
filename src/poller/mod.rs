//! # Poller Module
//!
//! Scheduled refresh of the device snapshot.
//!
//! This module handles:
//! - One mandatory baseline refresh at startup (failure aborts setup)
//! - Interval-driven refreshes on a single background task
//! - Atomic snapshot publication over a watch channel
//! - Stale-data retention and error recording on failed cycles
//! - Coalesced on-demand refresh requests and graceful shutdown

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PollConfig;
use crate::api::ApiRequester;
use crate::error::Result;
use crate::snapshot::{build_snapshot, Snapshot, SnapshotOptions};

/// Refresh scheduler owning the current snapshot
///
/// Exactly one refresh is in flight at any time: the background task
/// serializes the interval tick and on-demand requests. Consumers read the
/// current snapshot through [`Poller::snapshot`] or subscribe to
/// [`Poller::subscribe`]; a failed cycle leaves the previous snapshot in
/// place and records the error.
pub struct Poller {
    snapshot_rx: watch::Receiver<Arc<Snapshot>>,
    status_rx: watch::Receiver<Option<String>>,
    refresh_tx: mpsc::Sender<()>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Poller {
    /// Start the poller with a mandatory baseline refresh
    ///
    /// # Errors
    ///
    /// Returns the baseline refresh's error: without one good snapshot the
    /// poller has nothing to serve, so startup fails rather than retrying.
    pub async fn start(requester: Arc<dyn ApiRequester>, config: PollConfig) -> Result<Self> {
        let options = SnapshotOptions {
            fetch_extended: config.fetch_extended,
            max_pages: config.max_pages,
        };

        let baseline = build_snapshot(Arc::clone(&requester), &options).await?;
        info!(
            "baseline refresh complete: {} devices, extended fetch {}",
            baseline.devices.len(),
            if config.fetch_extended { "on" } else { "off" }
        );

        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(baseline));
        let (status_tx, status_rx) = watch::channel(None);
        // Capacity 1: a second request while one is queued coalesces with it.
        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(refresh_loop(
            requester,
            options,
            config.scan_interval_s,
            snapshot_tx,
            status_tx,
            refresh_rx,
            shutdown_rx,
        ));

        Ok(Self {
            snapshot_rx,
            status_rx,
            refresh_tx,
            shutdown_tx,
            task,
        })
    }

    /// Current snapshot; always the most recent successful refresh
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// Subscribe to snapshot publications
    ///
    /// The receiver is notified once per successful refresh. Failed cycles
    /// publish nothing.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot_rx.clone()
    }

    /// Error message of the most recent refresh, `None` after a success
    pub fn last_error(&self) -> Option<String> {
        self.status_rx.borrow().clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.last_error().is_none()
    }

    /// Request a refresh ahead of the next interval tick
    ///
    /// Requests coalesce: while a refresh is queued or in flight, further
    /// requests fold into it.
    pub fn request_refresh(&self) {
        let _ = self.refresh_tx.try_send(());
    }

    /// Stop the background task
    ///
    /// An in-flight refresh finishes first; it publishes either a complete
    /// snapshot or nothing.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
        debug!("poller shut down");
    }
}

/// The single background refresh task
async fn refresh_loop(
    requester: Arc<dyn ApiRequester>,
    options: SnapshotOptions,
    scan_interval_s: u64,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    status_tx: watch::Sender<Option<String>>,
    mut refresh_rx: mpsc::Receiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = interval(Duration::from_secs(scan_interval_s));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the baseline refresh already
    // covered it.
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                debug!("interval refresh");
            }
            request = refresh_rx.recv() => {
                if request.is_none() {
                    break;
                }
                debug!("on-demand refresh");
            }
            _ = shutdown_rx.changed() => {
                break;
            }
        }

        match build_snapshot(Arc::clone(&requester), &options).await {
            Ok(snapshot) => {
                info!(
                    "refresh complete: {} devices, {} extended bundles",
                    snapshot.devices.len(),
                    snapshot.extended.len()
                );
                let _ = status_tx.send(None);
                // Single atomic swap; readers see either the old snapshot or
                // this one, never a partial state.
                let _ = snapshot_tx.send(Arc::new(snapshot));
            }
            Err(error) => {
                warn!("refresh failed, keeping previous snapshot: {}", error);
                let _ = status_tx.send(Some(error.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mocks::MockRequester;
    use crate::api::DEVICES_INFO_PATH;
    use serde_json::json;
    use tokio::time::timeout;

    /// Long interval so only baseline + on-demand refreshes run in tests
    fn test_config() -> PollConfig {
        PollConfig {
            scan_interval_s: 3600,
            fetch_extended: false,
            ..PollConfig::default()
        }
    }

    fn listing(ids: &[&str]) -> serde_json::Value {
        let devices: Vec<_> = ids.iter().map(|id| json!({"id": id})).collect();
        json!({"success": true, "data": {"devices": devices}})
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_performs_baseline_refresh() {
        let mock = MockRequester::new();
        mock.script_get(DEVICES_INFO_PATH, listing(&["d1"]));

        let poller = Poller::start(Arc::new(mock), test_config()).await.unwrap();

        assert_eq!(poller.snapshot().devices.len(), 1);
        assert!(poller.is_healthy());
        poller.shutdown().await;
    }

    #[tokio::test]
    async fn test_baseline_failure_aborts_startup() {
        let mock = MockRequester::new();
        mock.script_get(DEVICES_INFO_PATH, json!({"success": false, "error": "bad token"}));

        let result = Poller::start(Arc::new(mock), test_config()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_on_demand_refresh_publishes_and_notifies() {
        let mock = MockRequester::new();
        mock.script_get(DEVICES_INFO_PATH, listing(&["d1"]));
        mock.script_get(DEVICES_INFO_PATH, listing(&["d1", "d2"]));

        let poller = Poller::start(Arc::new(mock), test_config()).await.unwrap();
        let mut subscriber = poller.subscribe();

        poller.request_refresh();
        timeout(Duration::from_secs(5), subscriber.changed())
            .await
            .expect("no notification")
            .unwrap();

        assert_eq!(subscriber.borrow().devices.len(), 2);
        assert_eq!(poller.snapshot().devices.len(), 2);
        assert!(poller.is_healthy());
        poller.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_refresh_retains_previous_snapshot() {
        let mock = MockRequester::new();
        mock.script_get(DEVICES_INFO_PATH, listing(&["d1"]));
        mock.script_get(DEVICES_INFO_PATH, json!({"success": false, "error": "rate limited"}));

        let poller = Poller::start(Arc::new(mock), test_config()).await.unwrap();
        let before = poller.snapshot();

        poller.request_refresh();
        wait_until(|| !poller.is_healthy()).await;

        // Stale but valid data keeps serving.
        assert_eq!(poller.snapshot().fetched_at, before.fetched_at);
        assert_eq!(poller.snapshot().devices.len(), 1);
        assert!(poller.last_error().unwrap().contains("rate limited"));
        poller.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovery_clears_last_error() {
        let mock = MockRequester::new();
        mock.script_get(DEVICES_INFO_PATH, listing(&["d1"]));
        mock.script_get(DEVICES_INFO_PATH, json!({"success": false, "error": "blip"}));
        mock.script_get(DEVICES_INFO_PATH, listing(&["d1"]));

        let poller = Poller::start(Arc::new(mock), test_config()).await.unwrap();

        poller.request_refresh();
        wait_until(|| !poller.is_healthy()).await;

        poller.request_refresh();
        wait_until(|| poller.is_healthy()).await;

        assert!(poller.last_error().is_none());
        poller.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_task() {
        let mock = MockRequester::new();
        mock.script_get(DEVICES_INFO_PATH, listing(&["d1"]));

        let poller = Poller::start(Arc::new(mock), test_config()).await.unwrap();
        timeout(Duration::from_secs(5), poller.shutdown())
            .await
            .expect("shutdown hung");
    }
}
