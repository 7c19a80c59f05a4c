//! Capture scheduler.
//!
//! Drives the duty cycle: restart check, one capture window, merge, then the
//! maintenance tasks whose own intervals have elapsed, then the idle sleep.
//! Everything runs on this one loop, so a window is merged and persisted
//! before the next one starts and never interleaves with a reset.

use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use futures_util::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::sleep;

use crate::alert::AlertSink;
use crate::config::Config;
use crate::error::{Result, TrackerError};
use crate::geo::{self, GeoCache, GeoLookup, Resolver};
use crate::history::HistoryRecorder;
use crate::lifecycle::{RestartOutcome, StartMarker, StateManager};
use crate::merge::Merger;
use crate::runtime::ContainerRuntime;
use crate::sampler::Capture;
use crate::store::StatePaths;
use crate::types::{unix_now, DutyCycle, PeerCount, SampleDelta};
use crate::watchdog::{Verdict, Watchdog};

/// Age of the comparison sample logged with each history record.
const HISTORY_COMPARE_SECS: u64 = 24 * 3600;

/// A task that runs at most once per interval.
#[derive(Debug, Clone, Copy)]
struct Periodic {
    interval: u64,
    last: Option<u64>,
}

impl Periodic {
    fn new(interval: u64, last: Option<u64>) -> Self {
        Self { interval, last }
    }

    /// Returns true and marks the task as run if its interval has elapsed.
    fn due(&mut self, now: u64) -> bool {
        let due = self
            .last
            .map_or(true, |last| now.saturating_sub(last) >= self.interval);
        if due {
            self.last = Some(now);
        }
        due
    }
}

pub struct Tracker {
    config: Config,
    duty: DutyCycle,
    capture: Box<dyn Capture>,
    runtime: Arc<dyn ContainerRuntime>,
    alerts: Arc<dyn AlertSink>,
    resolver: Resolver,
    merger: Merger,
    state: StateManager,
    history: HistoryRecorder,
    watchdog: Watchdog,
    http: reqwest::Client,
    geo_refresh: Periodic,
    backup: Periodic,
    watchdog_check: Periodic,
    history_record: Periodic,
}

impl Tracker {
    pub fn new(
        config: Config,
        capture: Box<dyn Capture>,
        lookup: Box<dyn GeoLookup>,
        runtime: Arc<dyn ContainerRuntime>,
        alerts: Arc<dyn AlertSink>,
        http: reqwest::Client,
    ) -> Result<Self> {
        let paths = StatePaths::new(&config.data_dir);
        paths.create_dirs()?;

        let duty = config
            .duty_cycle()
            .ok_or_else(|| TrackerError::Config("capture_secs must be greater than zero".into()))?;
        let cache = GeoCache::load(&paths.geo_cache, config.geo_cache_limit)?;
        info!("Loaded {} cached geolocations", cache.len());
        let resolver = Resolver::new(lookup, cache, paths.geo_cache.clone());
        let history =
            HistoryRecorder::open(paths.history.clone(), config.history_retention_secs)?;
        let state = StateManager::new(paths.clone(), config.archive_keep)?;

        Ok(Self {
            duty,
            capture,
            runtime,
            alerts,
            resolver,
            merger: Merger::new(&paths),
            state,
            history,
            watchdog: Watchdog::new(config.idle_threshold_secs, config.restart_cooldown_secs),
            http,
            geo_refresh: Periodic::new(config.geo_refresh_secs, modified_at(&config.geo_db_path)),
            backup: Periodic::new(config.backup_secs, Some(unix_now())),
            watchdog_check: Periodic::new(config.watchdog_secs, None),
            history_record: Periodic::new(config.history_secs, None),
            config,
        })
    }

    /// Runs until `shutdown` flips to true or its sender is dropped.  The
    /// signal is observed during capture and during the idle sleep only.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Tracker running: capture {}s, idle {}s (x{:.2})",
            self.config.capture_secs,
            self.config.idle_secs,
            self.duty.multiplier()
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.check_restart(unix_now()).await;

            let captured = tokio::select! {
                res = self.capture_window() => res,
                _ = shutdown.changed() => {
                    info!("Shutdown requested during capture; discarding partial window");
                    break;
                }
            };
            self.finish_window(captured, unix_now()).await;

            tokio::select! {
                _ = sleep(self.config.idle_duration()) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Tracker stopped");
    }

    /// One full iteration without the idle sleep.
    pub async fn tick(&mut self, now: u64) {
        self.check_restart(now).await;
        let captured = self.capture_window().await;
        self.finish_window(captured, now).await;
    }

    async fn capture_window(&self) -> Result<Vec<SampleDelta>> {
        self.capture
            .capture(self.config.capture_duration(), &self.config.capture_exclude)
            .await
    }

    async fn finish_window(&mut self, captured: Result<Vec<SampleDelta>>, now: u64) {
        self.aggregate(captured);
        self.maintenance(now).await;
    }

    /// Instance whose start marker is tracked.  A configured primary wins;
    /// otherwise the instance pinned by an earlier run, and only on the very
    /// first run the first listed instance.  A pinned instance that is not
    /// running yields `None` rather than a switch to another instance.
    async fn primary_instance(&self) -> Option<String> {
        if let Some(name) = &self.config.primary_instance {
            return Some(name.clone());
        }
        let instances = match self.runtime.list_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                warn!("Cannot list instances: {}", e);
                return None;
            }
        };
        match self.state.pinned_instance() {
            Some(pinned) if instances.iter().any(|i| i == pinned) => Some(pinned.to_string()),
            Some(pinned) => {
                debug!("Monitored instance {} is not running", pinned);
                None
            }
            None => instances.into_iter().next(),
        }
    }

    async fn check_restart(&mut self, now: u64) {
        let marker = match self.primary_instance().await {
            Some(instance) => match self.runtime.start_marker(&instance).await {
                Ok(marker) => Some(StartMarker { instance, marker }),
                Err(e) => {
                    warn!("Cannot read start marker of {}: {}", instance, e);
                    None
                }
            },
            None => None,
        };

        match self.state.check_restart(marker.as_ref(), now) {
            Ok(RestartOutcome::Reset { restored }) => {
                self.merger.discard_pending();
                self.alerts
                    .emit(&format!(
                        "Instance restart detected; traffic totals reset{}",
                        if restored { " and restored from backup" } else { "" }
                    ))
                    .await;
            }
            Ok(_) => {}
            Err(e) => error!("Restart check failed: {}", e),
        }
    }

    fn aggregate(&mut self, captured: Result<Vec<SampleDelta>>) {
        let deltas = match captured {
            Ok(deltas) => deltas,
            Err(e) => {
                warn!("Skipping window: {}", e);
                return;
            }
        };

        if deltas.is_empty() {
            debug!("Window produced no remote traffic");
            if self.merger.has_pending() {
                if let Err(e) = self.merger.flush() {
                    warn!("Retry of pending merge failed: {}", e);
                }
            }
            return;
        }

        if let Err(e) = self.merger.merge(&deltas, self.duty, &mut self.resolver) {
            warn!("Merge not persisted, will retry next window: {}", e);
        }
        if let Err(e) = self.resolver.persist() {
            warn!("Failed to persist geolocation cache: {}", e);
        }
    }

    async fn maintenance(&mut self, now: u64) {
        if self.geo_refresh.due(now) {
            self.refresh_geo_database().await;
        }

        if self.backup.due(now) {
            if let Err(e) = self.state.routine_backup() {
                warn!("Routine backup failed: {}", e);
            }
        }

        let check_watchdog = self.watchdog_check.due(now);
        let record_history = self.history_record.due(now);
        if !check_watchdog && !record_history {
            return;
        }

        let instances = match self.runtime.list_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                warn!("Cannot list instances for status checks: {}", e);
                return;
            }
        };
        let observed = fetch_peer_counts(
            self.runtime.as_ref(),
            &instances,
            self.config.status_concurrency,
        )
        .await;

        if check_watchdog {
            let verdicts = self
                .watchdog
                .check(
                    &instances,
                    &observed,
                    self.runtime.as_ref(),
                    self.alerts.as_ref(),
                    now,
                )
                .await;
            for (instance, verdict) in verdicts {
                if let Verdict::Idle { for_secs } = verdict {
                    if for_secs > 0 {
                        info!("{} has had no peers for {}s", instance, for_secs);
                    }
                }
            }
        }

        if record_history {
            self.record_history(&observed, now);
        }
    }

    async fn refresh_geo_database(&self) {
        let Some(url) = self.config.geo_db_url.as_deref() else {
            return;
        };
        match geo::refresh_database(
            &self.http,
            url,
            &self.config.geo_db_path,
            self.config.geo_db_min_bytes,
            self.config.geo_db_max_bytes,
        )
        .await
        {
            Ok(_) => {
                if let Err(e) = self.resolver.reload_database() {
                    warn!("Refreshed geolocation database failed to load: {}", e);
                }
            }
            Err(e) => warn!("Geolocation database refresh failed: {}", e),
        }
    }

    fn record_history(&mut self, observed: &[(String, PeerCount)], now: u64) {
        if observed.is_empty() {
            debug!("No instance reported status; skipping history sample");
            return;
        }
        let connected = observed.iter().map(|(_, p)| p.connected).sum();
        let connecting = observed.iter().map(|(_, p)| p.connecting).sum();
        if let Err(e) = self.history.record(connected, connecting, now) {
            warn!("Failed to record connection history: {}", e);
            return;
        }
        match self
            .history
            .nearest(HISTORY_COMPARE_SECS, self.config.history_secs, now)
        {
            Some(then) => info!(
                "Peers: {} connected, {} connecting (24h ago: {} connected)",
                connected, connecting, then.connected
            ),
            None => info!("Peers: {} connected, {} connecting", connected, connecting),
        }
    }
}

/// Queries every instance's status with at most `concurrency` requests in
/// flight and waits for all of them.  Instances that fail are left out.
pub async fn fetch_peer_counts(
    runtime: &dyn ContainerRuntime,
    instances: &[String],
    concurrency: usize,
) -> Vec<(String, PeerCount)> {
    let mut observed: Vec<(String, PeerCount)> = stream::iter(instances.iter().cloned())
        .map(|instance| async move {
            let result = runtime.peer_count(&instance).await;
            (instance, result)
        })
        .buffer_unordered(concurrency.max(1))
        .filter_map(|(instance, result)| async move {
            match result {
                Ok(count) => Some((instance, count)),
                Err(e) => {
                    warn!("Status of {} unavailable: {}", instance, e);
                    None
                }
            }
        })
        .collect()
        .await;
    observed.sort_by(|a, b| a.0.cmp(&b.0));
    observed
}

fn modified_at(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    modified.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::net::IpAddr;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::alert::tests::RecordingAlerts;
    use crate::geo::tests::FakeLookup;
    use crate::merge::{load_totals, CountryTotals};
    use crate::runtime::tests::FakeRuntime;
    use crate::store;
    use crate::types::{Direction, Traffic};

    #[derive(Default)]
    struct FakeCapture {
        windows: Mutex<VecDeque<Result<Vec<SampleDelta>>>>,
    }

    impl FakeCapture {
        fn push(&self, window: Result<Vec<SampleDelta>>) {
            self.windows.lock().unwrap().push_back(window);
        }
    }

    #[async_trait]
    impl Capture for Arc<FakeCapture> {
        async fn capture(&self, _duration: Duration, _exclude: &str) -> Result<Vec<SampleDelta>> {
            self.windows
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    struct Harness {
        _dir: TempDir,
        paths: StatePaths,
        capture: Arc<FakeCapture>,
        runtime: Arc<FakeRuntime>,
        alerts: Arc<RecordingAlerts>,
        tracker: Tracker,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            geo_db_path: dir.path().join("country.mmdb"),
            capture_secs: 10,
            idle_secs: 20,
            ..Config::default()
        };
        let capture = Arc::new(FakeCapture::default());
        let runtime = Arc::new(FakeRuntime::with_instances(&["conduit-1", "conduit-2"]));
        runtime
            .markers
            .lock()
            .unwrap()
            .insert("conduit-1".into(), "run-a".into());
        runtime.set_peers("conduit-1", 4, 1);
        runtime.set_peers("conduit-2", 2, 0);
        let alerts = Arc::new(RecordingAlerts::default());

        let tracker = Tracker::new(
            config,
            Box::new(Arc::clone(&capture)),
            Box::new(FakeLookup::with(&[("1.2.3.4", "Germany"), ("5.6.7.8", "Japan")])),
            runtime.clone(),
            alerts.clone(),
            reqwest::Client::new(),
        )
        .unwrap();

        Harness {
            paths: StatePaths::new(dir.path()),
            _dir: dir,
            capture,
            runtime,
            alerts,
            tracker,
        }
    }

    fn delta(direction: Direction, remote: &str, bytes: u64) -> SampleDelta {
        SampleDelta {
            direction,
            remote: remote.parse::<IpAddr>().unwrap(),
            bytes,
        }
    }

    #[test]
    fn periodic_fires_once_per_interval() {
        let mut p = Periodic::new(300, None);
        assert!(p.due(1000));
        assert!(!p.due(1299));
        assert!(p.due(1300));
        assert!(!p.due(1301));
    }

    #[tokio::test]
    async fn tick_merges_window_and_runs_maintenance() {
        let mut h = harness();
        h.capture.push(Ok(vec![
            delta(Direction::In, "1.2.3.4", 500),
            delta(Direction::Out, "5.6.7.8", 300),
        ]));

        h.tracker.tick(1_000_000).await;

        let totals = load_totals(&h.paths.totals).unwrap();
        assert_eq!(totals["Germany"].bytes_in, 1500);
        assert_eq!(totals["Japan"].bytes_out, 900);
        assert!(h.paths.geo_cache.exists());
        assert!(h.paths.marker.exists());

        let history = h.tracker.history.entries();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].connected, 6);
        assert_eq!(history[0].connecting, 1);
        assert_eq!(h.runtime.restart_count(), 0);
    }

    #[tokio::test]
    async fn capture_failure_skips_window() {
        let mut h = harness();
        h.capture
            .push(Err(TrackerError::CaptureUnavailable("no tcpdump".into())));
        h.tracker.tick(1_000_000).await;
        assert!(load_totals(&h.paths.totals).unwrap().is_empty());

        h.capture.push(Ok(vec![delta(Direction::In, "1.2.3.4", 1)]));
        h.tracker.tick(1_000_030).await;
        assert_eq!(load_totals(&h.paths.totals).unwrap()["Germany"].bytes_in, 3);
    }

    #[tokio::test]
    async fn restart_marker_change_restores_backup() {
        let mut h = harness();
        h.capture.push(Ok(vec![delta(Direction::In, "1.2.3.4", 100)]));
        h.tracker.tick(1_000_000).await;

        let backup: CountryTotals = [(
            "Germany".to_string(),
            Traffic {
                bytes_in: 500,
                bytes_out: 0,
            },
        )]
        .into_iter()
        .collect();
        store::save(&StatePaths::backup_of(&h.paths.totals), &backup).unwrap();

        h.runtime
            .markers
            .lock()
            .unwrap()
            .insert("conduit-1".into(), "run-b".into());
        h.tracker.tick(1_000_030).await;

        assert_eq!(load_totals(&h.paths.totals).unwrap(), backup);
        assert_eq!(h.alerts.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreadable_marker_keeps_totals() {
        let mut h = harness();
        h.capture.push(Ok(vec![delta(Direction::In, "1.2.3.4", 100)]));
        h.tracker.tick(1_000_000).await;

        h.runtime.markers.lock().unwrap().clear();
        h.tracker.tick(1_000_030).await;

        assert_eq!(load_totals(&h.paths.totals).unwrap()["Germany"].bytes_in, 300);
        assert!(h.alerts.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn instance_set_changes_do_not_reset_totals() {
        let mut h = harness();
        *h.runtime.instances.lock().unwrap() = vec!["conduit-2".into()];
        h.runtime
            .markers
            .lock()
            .unwrap()
            .insert("conduit-2".into(), "run-x".into());
        h.capture.push(Ok(vec![delta(Direction::In, "1.2.3.4", 100)]));
        h.tracker.tick(1_000_000).await;

        // conduit-1 sorts first once it starts.
        *h.runtime.instances.lock().unwrap() = vec!["conduit-1".into(), "conduit-2".into()];
        h.tracker.tick(1_000_030).await;
        assert_eq!(h.tracker.state.pinned_instance(), Some("conduit-2"));

        // The pinned instance stops; no other instance takes its place.
        *h.runtime.instances.lock().unwrap() = vec!["conduit-1".into()];
        h.tracker.tick(1_000_060).await;

        assert_eq!(load_totals(&h.paths.totals).unwrap()["Germany"].bytes_in, 300);
        assert!(h.alerts.messages.lock().unwrap().is_empty());
        assert_eq!(h.tracker.state.pinned_instance(), Some("conduit-2"));

        // A real restart of the pinned instance still resets.
        *h.runtime.instances.lock().unwrap() = vec!["conduit-1".into(), "conduit-2".into()];
        h.runtime
            .markers
            .lock()
            .unwrap()
            .insert("conduit-2".into(), "run-y".into());
        h.tracker.tick(1_000_090).await;
        assert!(load_totals(&h.paths.totals).unwrap().is_empty());
        assert_eq!(h.alerts.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_window_retries_pending_merge() {
        let mut h = harness();
        let blocker = store::with_suffix(&h.paths.totals, ".tmp");
        std::fs::create_dir(&blocker).unwrap();
        h.capture.push(Ok(vec![delta(Direction::In, "1.2.3.4", 100)]));
        h.tracker.tick(1_000_000).await;
        assert!(load_totals(&h.paths.totals).unwrap().is_empty());
        assert!(h.tracker.merger.has_pending());

        std::fs::remove_dir(&blocker).unwrap();
        h.tracker.tick(1_000_030).await;

        assert!(!h.tracker.merger.has_pending());
        assert_eq!(load_totals(&h.paths.totals).unwrap()["Germany"].bytes_in, 300);
    }

    #[tokio::test]
    async fn watchdog_restarts_idle_instance() {
        let mut h = harness();
        h.runtime.set_peers("conduit-2", 0, 0);

        h.tracker.tick(1_000_000).await;
        h.tracker.tick(1_000_000 + 7201).await;
        h.tracker.tick(1_000_000 + 7201 + 900).await;

        assert_eq!(
            h.runtime.restarts.lock().unwrap().as_slice(),
            &["conduit-2".to_string()]
        );
        assert_eq!(h.alerts.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn peer_counts_skip_failed_instances() {
        let runtime = FakeRuntime::with_instances(&["a", "b", "c"]);
        runtime.set_peers("c", 1, 0);
        runtime.set_peers("a", 2, 2);
        let names: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();

        let observed = fetch_peer_counts(&runtime, &names, 2).await;
        assert_eq!(
            observed,
            vec![
                (
                    "a".to_string(),
                    PeerCount {
                        connected: 2,
                        connecting: 2
                    }
                ),
                (
                    "c".to_string(),
                    PeerCount {
                        connected: 1,
                        connecting: 0
                    }
                ),
            ]
        );
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let h = harness();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.tracker.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("tracker did not stop")
            .unwrap();
    }
}
