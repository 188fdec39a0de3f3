//! TTL-bounded reuse of node inventories.
//!
//! Per node the scanner moves through
//! `NoEntry -> Fresh -> Stale -> Recomputing -> Fresh | Failed`:
//!
//! - a fresh entry (younger than the TTL) is returned without scanning
//! - otherwise all concurrent callers for the node share one scan, running
//!   on its own task so that a caller giving up doesn't cancel it for the
//!   others
//! - a successful scan is kept in memory and persisted to disk, replacing
//!   the previous entry
//! - a failed scan is not cached; the next attempt for that node first
//!   waits `min(backoff_min * 2^(failures - 1), backoff_max)`
//!
//! On construction, a persisted entry that is still fresh is loaded so that
//! a restart doesn't force an immediate rescan.

use super::{InventoryScan, NodeInventorizer};
use crate::cache::{CacheEntry, DiskCache};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_TTL: Duration = Duration::from_secs(3 * 60 * 60);
pub const DEFAULT_BACKOFF_MIN: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Waits for the given duration before a retry.
pub type DelayFn = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Delay backed by the tokio timer.
pub fn sleep_delay() -> DelayFn {
    Arc::new(|duration: Duration| tokio::time::sleep(duration).boxed())
}

fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

type FlightResult = std::result::Result<InventoryScan, Arc<Error>>;
type Flight = Shared<BoxFuture<'static, FlightResult>>;

#[derive(Default)]
struct NodeState {
    entry: Option<CacheEntry<InventoryScan>>,
    failures: u32,
    flight: Option<Flight>,
}

struct Core {
    inner: Arc<dyn NodeInventorizer>,
    disk: DiskCache,
    backoff_min: Duration,
    backoff_max: Duration,
    delay: DelayFn,
    clock: Clock,
    nodes: Mutex<HashMap<String, NodeState>>,
    /// Production time of the entry on disk. Held across a store so that
    /// writes are serialized and an older scan never replaces a newer one.
    persisted: tokio::sync::Mutex<Option<DateTime<Utc>>>,
}

impl Core {
    fn nodes(&self) -> MutexGuard<'_, HashMap<String, NodeState>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn backoff(&self, failures: u32) -> Option<Duration> {
        if failures == 0 {
            return None;
        }
        let factor = 2u32.saturating_pow(failures - 1);
        Some(self.backoff_min.saturating_mul(factor).min(self.backoff_max))
    }

    async fn run(self: Arc<Self>, node: String, failures: u32) -> FlightResult {
        if let Some(wait) = self.backoff(failures) {
            info!(node = %node, failures, wait_secs = wait.as_secs_f64(), "waiting before retrying inventory scan");
            (self.delay)(wait).await;
        }

        let result = match AssertUnwindSafe(self.inner.scan(&node)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(Error::Scan {
                node: node.clone(),
                reason: "inventory scan panicked".to_string(),
            }),
        };

        match result {
            Ok(scan) => {
                let entry = CacheEntry::new(node.clone(), (self.clock)(), scan);
                self.persist(&entry).await;
                info!(node = %node, components = entry.value.components.len(), "inventory scan completed");
                let scan = entry.value.clone();
                self.record_success(&node, entry);
                Ok(scan)
            }
            Err(e) => {
                let failures = self.record_failure(&node);
                warn!(node = %node, failures, error = %e, "inventory scan failed");
                Err(Arc::new(e))
            }
        }
    }

    async fn persist(&self, entry: &CacheEntry<InventoryScan>) {
        let mut persisted = self.persisted.lock().await;
        if persisted.is_some_and(|at| at > entry.produced_at) {
            debug!(node = %entry.key, "newer inventory already persisted");
            return;
        }

        let produced_at = entry.produced_at;
        let disk = self.disk.clone();
        let entry = entry.clone();
        match tokio::task::spawn_blocking(move || disk.store(&entry)).await {
            Ok(Ok(())) => {
                *persisted = Some(produced_at);
                debug!(path = %self.disk.path().display(), "persisted inventory");
            }
            Ok(Err(e)) => warn!(error = %e, "could not persist inventory"),
            Err(e) => warn!(error = %e, "inventory persistence task failed"),
        }
    }

    fn record_success(&self, node: &str, entry: CacheEntry<InventoryScan>) {
        let mut nodes = self.nodes();
        let state = nodes.entry(node.to_string()).or_default();
        state.entry = Some(entry);
        state.failures = 0;
        state.flight = None;
    }

    fn record_failure(&self, node: &str) -> u32 {
        let mut nodes = self.nodes();
        let state = nodes.entry(node.to_string()).or_default();
        state.failures = state.failures.saturating_add(1);
        state.flight = None;
        state.failures
    }
}

/// A [`NodeInventorizer`] that caches the results of another one.
#[derive(Clone)]
pub struct CachingScanner {
    core: Arc<Core>,
    ttl: Duration,
}

impl CachingScanner {
    /// Starts configuring a caching scanner around `inner`.
    pub fn builder(inner: Arc<dyn NodeInventorizer>) -> CachingScannerBuilder {
        CachingScannerBuilder {
            inner,
            cache_path: None,
            ttl: DEFAULT_TTL,
            backoff_min: DEFAULT_BACKOFF_MIN,
            backoff_max: DEFAULT_BACKOFF_MAX,
            delay: sleep_delay(),
            clock: system_clock(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached entry for `node`, fresh or not.
    pub fn cached(&self, node: &str) -> Option<CacheEntry<InventoryScan>> {
        self.core.nodes().get(node).and_then(|s| s.entry.clone())
    }

    fn start_flight(&self, node: &str, failures: u32) -> Flight {
        let task = tokio::spawn(self.core.clone().run(node.to_string(), failures));
        let node = node.to_string();
        async move {
            task.await.unwrap_or_else(|e| {
                Err(Arc::new(Error::Scan {
                    node,
                    reason: format!("inventory scan task failed: {}", e),
                }))
            })
        }
        .boxed()
        .shared()
    }
}

#[async_trait]
impl NodeInventorizer for CachingScanner {
    async fn scan(&self, node: &str) -> Result<InventoryScan> {
        let flight = {
            let now = (self.core.clock)();
            let mut nodes = self.core.nodes();

            let existing = nodes.get(node);
            if let Some(entry) = existing
                .and_then(|state| state.entry.as_ref())
                .filter(|e| e.is_fresh(now, self.ttl))
            {
                debug!(node, produced_at = %entry.produced_at, "serving cached inventory");
                return Ok(entry.value.clone());
            }

            match existing.and_then(|state| state.flight.clone()) {
                Some(flight) => {
                    debug!(node, "joining in-flight inventory scan");
                    flight
                }
                // Nodes are only tracked once a scan for them starts.
                None => {
                    let state = nodes.entry(node.to_string()).or_default();
                    let flight = self.start_flight(node, state.failures);
                    state.flight = Some(flight.clone());
                    flight
                }
            }
        };

        flight.await.map_err(|source| Error::SharedScan {
            node: node.to_string(),
            source,
        })
    }
}

/// Configuration for a [`CachingScanner`].
pub struct CachingScannerBuilder {
    inner: Arc<dyn NodeInventorizer>,
    cache_path: Option<PathBuf>,
    ttl: Duration,
    backoff_min: Duration,
    backoff_max: Duration,
    delay: DelayFn,
    clock: Clock,
}

impl CachingScannerBuilder {
    /// File holding the persisted entry. Defaults to the platform cache
    /// directory.
    pub fn cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Bounds of the wait before retrying a failed scan. `max` is raised to
    /// `min` if lower.
    pub fn backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min;
        self.backoff_max = max.max(min);
        self
    }

    pub fn delay(mut self, delay: DelayFn) -> Self {
        self.delay = delay;
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the scanner, loading the persisted entry if still fresh.
    pub fn build(self) -> CachingScanner {
        let disk = match self.cache_path {
            Some(path) => DiskCache::new(path, self.ttl),
            None => DiskCache::with_default_path(self.ttl),
        };

        let mut nodes = HashMap::new();
        let mut persisted = None;
        if let Some(entry) = disk.load_fresh::<InventoryScan>((self.clock)()) {
            persisted = Some(entry.produced_at);
            info!(
                node = %entry.key,
                produced_at = %entry.produced_at,
                path = %disk.path().display(),
                "loaded persisted inventory"
            );
            nodes.insert(
                entry.key.clone(),
                NodeState {
                    entry: Some(entry),
                    ..NodeState::default()
                },
            );
        }

        CachingScanner {
            core: Arc::new(Core {
                inner: self.inner,
                disk,
                backoff_min: self.backoff_min,
                backoff_max: self.backoff_max,
                delay: self.delay,
                clock: self.clock,
                nodes: Mutex::new(nodes),
                persisted: tokio::sync::Mutex::new(persisted),
            }),
            ttl: self.ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Component, SourceType};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Scripted scanner: each call pops the next outcome (`true` = success),
    /// succeeding once the script is exhausted.
    struct FakeScanner {
        calls: AtomicUsize,
        outcomes: Mutex<VecDeque<bool>>,
        latency: Duration,
    }

    impl FakeScanner {
        fn new(outcomes: &[bool], latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                latency,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NodeInventorizer for FakeScanner {
        async fn scan(&self, node: &str) -> Result<InventoryScan> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let succeed = self.outcomes.lock().unwrap().pop_front().unwrap_or(true);
            if !succeed {
                return Err(Error::Scan {
                    node: node.to_string(),
                    reason: format!("attempt {} failed", call),
                });
            }
            Ok(InventoryScan {
                namespace: Some("debian:12".to_string()),
                components: vec![Component::new("bash", format!("5.2-{}", call), SourceType::Dpkg)],
                notes: Vec::new(),
            })
        }
    }

    fn recording_delay() -> (DelayFn, Arc<Mutex<Vec<Duration>>>) {
        let waits = Arc::new(Mutex::new(Vec::new()));
        let recorded = waits.clone();
        let delay: DelayFn = Arc::new(move |d: Duration| {
            recorded.lock().unwrap().push(d);
            async {}.boxed()
        });
        (delay, waits)
    }

    fn manual_clock() -> (Clock, Arc<Mutex<DateTime<Utc>>>) {
        let now = Arc::new(Mutex::new(Utc::now()));
        let handle = now.clone();
        let clock: Clock = Arc::new(move || *handle.lock().unwrap());
        (clock, now)
    }

    fn scanner(dir: &TempDir, inner: Arc<FakeScanner>, delay: DelayFn, clock: Clock) -> CachingScanner {
        CachingScanner::builder(inner)
            .cache_path(dir.path().join("inventory-cache"))
            .backoff(Duration::from_secs(30), Duration::from_secs(300))
            .delay(delay)
            .clock(clock)
            .build()
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let dir = TempDir::new().unwrap();
        let (delay, _) = recording_delay();
        let scanner = scanner(&dir, FakeScanner::new(&[], Duration::ZERO), delay, system_clock());

        let core = &scanner.core;
        assert_eq!(core.backoff(0), None);
        assert_eq!(core.backoff(1), Some(Duration::from_secs(30)));
        assert_eq!(core.backoff(2), Some(Duration::from_secs(60)));
        assert_eq!(core.backoff(4), Some(Duration::from_secs(240)));
        assert_eq!(core.backoff(5), Some(Duration::from_secs(300)));
        assert_eq!(core.backoff(40), Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn test_concurrent_cold_calls_share_one_scan() {
        let dir = TempDir::new().unwrap();
        let inner = FakeScanner::new(&[], Duration::from_millis(50));
        let (delay, _) = recording_delay();
        let scanner = scanner(&dir, inner.clone(), delay, system_clock());

        let results = futures::future::join_all((0..8).map(|_| scanner.scan("node-a"))).await;

        assert_eq!(inner.calls(), 1);
        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert_eq!(result.as_ref().unwrap(), first);
        }
    }

    #[tokio::test]
    async fn test_fresh_entry_skips_scan() {
        let dir = TempDir::new().unwrap();
        let inner = FakeScanner::new(&[], Duration::ZERO);
        let (delay, _) = recording_delay();
        let (clock, now) = manual_clock();
        let scanner = scanner(&dir, inner.clone(), delay, clock);

        let first = scanner.scan("node-a").await.unwrap();
        *now.lock().unwrap() += chrono::Duration::minutes(179);
        let second = scanner.scan("node-a").await.unwrap();

        assert_eq!(inner.calls(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_stale_entry_rescanned_once() {
        let dir = TempDir::new().unwrap();
        let inner = FakeScanner::new(&[], Duration::from_millis(20));
        let (delay, _) = recording_delay();
        let (clock, now) = manual_clock();
        let scanner = scanner(&dir, inner.clone(), delay, clock);

        let first = scanner.scan("node-a").await.unwrap();
        *now.lock().unwrap() += chrono::Duration::hours(3);

        let results = futures::future::join_all((0..4).map(|_| scanner.scan("node-a"))).await;
        assert_eq!(inner.calls(), 2);
        for result in results {
            let scan = result.unwrap();
            assert_ne!(scan, first);
            assert_eq!(scan.components[0].version, "5.2-2");
        }
    }

    #[tokio::test]
    async fn test_nodes_are_cached_independently() {
        let dir = TempDir::new().unwrap();
        let inner = FakeScanner::new(&[], Duration::ZERO);
        let (delay, _) = recording_delay();
        let scanner = scanner(&dir, inner.clone(), delay, system_clock());

        scanner.scan("node-a").await.unwrap();
        scanner.scan("node-b").await.unwrap();
        scanner.scan("node-a").await.unwrap();
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_not_cached_and_retried_after_backoff() {
        let dir = TempDir::new().unwrap();
        let inner = FakeScanner::new(&[false, false, true], Duration::ZERO);
        let (delay, waits) = recording_delay();
        let scanner = scanner(&dir, inner.clone(), delay, system_clock());

        let err = scanner.scan("node-a").await.unwrap_err();
        assert!(err.to_string().contains("attempt 1 failed"));
        assert!(waits.lock().unwrap().is_empty());
        assert!(scanner.cached("node-a").is_none());

        assert!(scanner.scan("node-a").await.is_err());
        assert_eq!(*waits.lock().unwrap(), vec![Duration::from_secs(30)]);

        let scan = scanner.scan("node-a").await.unwrap();
        assert_eq!(scan.components[0].version, "5.2-3");
        assert_eq!(
            *waits.lock().unwrap(),
            vec![Duration::from_secs(30), Duration::from_secs(60)]
        );

        // Success resets the failure count and the result is now cached.
        scanner.scan("node-a").await.unwrap();
        assert_eq!(inner.calls(), 3);
        assert_eq!(waits.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_after_stale_entry_is_not_masked() {
        let dir = TempDir::new().unwrap();
        let inner = FakeScanner::new(&[true, false], Duration::ZERO);
        let (delay, _) = recording_delay();
        let (clock, now) = manual_clock();
        let scanner = scanner(&dir, inner.clone(), delay, clock);

        scanner.scan("node-a").await.unwrap();
        *now.lock().unwrap() += chrono::Duration::hours(4);

        assert!(scanner.scan("node-a").await.is_err());
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_failure() {
        let dir = TempDir::new().unwrap();
        let inner = FakeScanner::new(&[false], Duration::from_millis(30));
        let (delay, _) = recording_delay();
        let scanner = scanner(&dir, inner.clone(), delay, system_clock());

        let results = futures::future::join_all((0..3).map(|_| scanner.scan("node-a"))).await;
        assert_eq!(inner.calls(), 1);
        for result in results {
            match result {
                Err(Error::SharedScan { node, source }) => {
                    assert_eq!(node, "node-a");
                    assert!(matches!(*source, Error::Scan { .. }));
                }
                other => panic!("expected a shared scan error, got {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_at_least_min_delay() {
        let dir = TempDir::new().unwrap();
        let inner = FakeScanner::new(&[false, false], Duration::ZERO);
        let scanner = CachingScanner::builder(inner.clone())
            .cache_path(dir.path().join("inventory-cache"))
            .backoff(Duration::from_secs(30), Duration::from_secs(300))
            .build();

        assert!(scanner.scan("node-a").await.is_err());

        let started = tokio::time::Instant::now();
        assert!(scanner.scan("node-a").await.is_err());
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_cancel_scan() {
        let dir = TempDir::new().unwrap();
        let inner = FakeScanner::new(&[], Duration::from_millis(100));
        let (delay, _) = recording_delay();
        let scanner = scanner(&dir, inner.clone(), delay, system_clock());

        let abandoned = tokio::time::timeout(Duration::from_millis(10), scanner.scan("node-a")).await;
        assert!(abandoned.is_err());

        scanner.scan("node-a").await.unwrap();
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn test_restart_loads_persisted_entry() {
        let dir = TempDir::new().unwrap();
        let (delay, _) = recording_delay();

        let first = FakeScanner::new(&[], Duration::ZERO);
        let expected = scanner(&dir, first.clone(), delay.clone(), system_clock())
            .scan("node-a")
            .await
            .unwrap();
        assert!(dir.path().join("inventory-cache").exists());

        let second = FakeScanner::new(&[], Duration::ZERO);
        let restarted = scanner(&dir, second.clone(), delay, system_clock());
        assert_eq!(restarted.scan("node-a").await.unwrap(), expected);
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn test_restart_ignores_stale_persisted_entry() {
        let dir = TempDir::new().unwrap();
        let (delay, _) = recording_delay();
        let (clock, now) = manual_clock();

        let first = FakeScanner::new(&[], Duration::ZERO);
        scanner(&dir, first, delay.clone(), clock.clone())
            .scan("node-a")
            .await
            .unwrap();

        *now.lock().unwrap() += chrono::Duration::hours(3) + chrono::Duration::seconds(1);
        let second = FakeScanner::new(&[], Duration::ZERO);
        let restarted = scanner(&dir, second.clone(), delay, clock);
        assert!(restarted.cached("node-a").is_none());
        restarted.scan("node-a").await.unwrap();
        assert_eq!(second.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_nodes_persist_a_whole_entry() {
        let dir = TempDir::new().unwrap();
        let inner = FakeScanner::new(&[], Duration::ZERO);
        let (delay, _) = recording_delay();
        let scanner = scanner(&dir, inner.clone(), delay, system_clock());

        let nodes: Vec<String> = (0..16).map(|i| format!("node-{}", i)).collect();
        let results = futures::future::join_all(nodes.iter().map(|node| {
            let scanner = scanner.clone();
            let node = node.clone();
            tokio::spawn(async move { scanner.scan(&node).await })
        }))
        .await;
        for result in results {
            result.unwrap().unwrap();
        }
        assert_eq!(inner.calls(), nodes.len());

        let disk = DiskCache::new(dir.path().join("inventory-cache"), DEFAULT_TTL);
        let entry = disk.load::<InventoryScan>().unwrap();
        assert!(nodes.contains(&entry.key));
        assert_eq!(scanner.cached(&entry.key).unwrap(), entry);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_older_scan_does_not_replace_persisted_entry() {
        let dir = TempDir::new().unwrap();
        let (delay, _) = recording_delay();
        let (clock, now) = manual_clock();
        let scanner = scanner(&dir, FakeScanner::new(&[], Duration::ZERO), delay, clock);

        scanner.scan("node-a").await.unwrap();
        let newer = scanner.cached("node-a").unwrap();

        let older = CacheEntry::new(
            "node-b",
            newer.produced_at - chrono::Duration::minutes(1),
            InventoryScan::default(),
        );
        scanner.core.persist(&older).await;

        let disk = DiskCache::new(dir.path().join("inventory-cache"), DEFAULT_TTL);
        assert_eq!(disk.load::<InventoryScan>().unwrap().key, "node-a");

        *now.lock().unwrap() += chrono::Duration::minutes(1);
        scanner.scan("node-b").await.unwrap();
        assert_eq!(disk.load::<InventoryScan>().unwrap().key, "node-b");
    }

    #[tokio::test]
    async fn test_only_scanned_nodes_are_tracked() {
        let dir = TempDir::new().unwrap();
        let (delay, _) = recording_delay();
        let scanner = scanner(&dir, FakeScanner::new(&[], Duration::ZERO), delay, system_clock());

        assert!(scanner.cached("node-a").is_none());
        assert!(scanner.core.nodes().is_empty());

        scanner.scan("node-a").await.unwrap();
        scanner.scan("node-a").await.unwrap();
        assert_eq!(scanner.core.nodes().len(), 1);
        assert!(scanner.core.nodes()["node-a"].flight.is_none());
    }
}
