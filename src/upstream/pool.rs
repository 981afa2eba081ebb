use crate::config::UpstreamConfig;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// One pool member. Declarative fields are immutable after construction;
/// runtime state lives in per-field atomics so readers never take a lock.
///
/// Health transitions are published with a single Release store on
/// `healthy`; readers use Acquire loads and observe either the pre- or
/// post-transition value consistently.
pub struct Upstream {
    pub name: String,
    /// Pre-computed "host:port" — the connection-pool key and log label.
    pub address: String,
    pub weight: u32,
    pub max_fails: u32,
    /// Minimum time Unhealthy after crossing `max_fails` (seconds).
    pub fail_timeout: u64,
    pub backup: bool,

    current_fails: AtomicU32,
    /// Monotonic microseconds of the most recent failure; 0 = never.
    last_fail: AtomicU64,
    healthy: AtomicBool,
    pub active_connections: AtomicU32,
    pub total_requests: AtomicU64,
}

impl Upstream {
    pub fn from_config(cfg: &UpstreamConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            address: format!("{}:{}", cfg.address, cfg.port),
            weight: cfg.weight.max(1),
            max_fails: cfg.max_fails.max(1),
            fail_timeout: cfg.fail_timeout,
            backup: cfg.backup,
            current_fails: AtomicU32::new(0),
            last_fail: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            active_connections: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn current_fails(&self) -> u32 {
        self.current_fails.load(Ordering::Relaxed)
    }

    /// Healthy + failure: bump the streak; crossing `max_fails` turns the
    /// member Unhealthy. Unhealthy + failure: refresh the fail window.
    pub fn record_failure(&self) {
        let now = now_us();
        self.last_fail.store(now, Ordering::Relaxed);

        if !self.is_healthy() {
            return;
        }

        let fails = self.current_fails.fetch_add(1, Ordering::AcqRel) + 1;
        if fails >= self.max_fails {
            self.healthy.store(false, Ordering::Release);
            tracing::warn!(
                "upstream: marked unhealthy, name={}, addr={}, consecutive_fails={}",
                self.name,
                self.address,
                fails
            );
            metrics::gauge!(
                "wraith_upstream_health_status",
                "upstream" => self.address.clone(),
            )
            .set(0.0);
        }
    }

    /// A completed request (any HTTP status — the upstream answered).
    pub fn record_success(&self) {
        if self.is_healthy() {
            self.current_fails.store(0, Ordering::Release);
        }
    }

    /// A health probe succeeded. An Unhealthy member only returns to
    /// Healthy once `fail_timeout` has elapsed since its last failure.
    pub fn probe_success(&self) {
        if self.is_healthy() {
            self.current_fails.store(0, Ordering::Release);
            return;
        }

        let last = self.last_fail.load(Ordering::Relaxed);
        let elapsed_us = now_us().saturating_sub(last);
        if elapsed_us >= self.fail_timeout * 1_000_000 {
            self.current_fails.store(0, Ordering::Release);
            self.healthy.store(true, Ordering::Release);
            tracing::info!(
                "upstream: recovered, name={}, addr={}",
                self.name,
                self.address
            );
            metrics::gauge!(
                "wraith_upstream_health_status",
                "upstream" => self.address.clone(),
            )
            .set(1.0);
        }
    }

    pub fn probe_failure(&self) {
        self.record_failure();
    }
}

/// RAII guard for one dispatched request: increments
/// `active_connections` on creation and decrements exactly once on drop,
/// whatever the outcome.
pub struct ActiveGuard {
    upstream: Arc<Upstream>,
}

impl ActiveGuard {
    pub fn new(upstream: Arc<Upstream>) -> Self {
        upstream.active_connections.fetch_add(1, Ordering::AcqRel);
        Self { upstream }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.upstream
            .active_connections
            .fetch_sub(1, Ordering::AcqRel);
    }
}

/// The upstream pool. Membership lives behind an `ArcSwap` so readers
/// take a consistent snapshot without blocking; mutation (reload merge)
/// swaps the whole vector.
pub struct UpstreamPool {
    members: ArcSwap<Vec<Arc<Upstream>>>,
}

impl UpstreamPool {
    pub fn new(configs: &[UpstreamConfig]) -> Self {
        let members: Vec<Arc<Upstream>> = configs
            .iter()
            .map(|c| Arc::new(Upstream::from_config(c)))
            .collect();
        tracing::info!("upstream: pool initialized, members={}", members.len());
        Self {
            members: ArcSwap::from_pointee(members),
        }
    }

    /// Consistent snapshot of all members.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Upstream>>> {
        self.members.load_full()
    }

    /// Healthy members eligible for selection. Backups are included only
    /// when every primary is out — deterministic primary/backup tiering.
    pub fn healthy_set(&self) -> Vec<Arc<Upstream>> {
        let members = self.members.load();

        let primaries: Vec<Arc<Upstream>> = members
            .iter()
            .filter(|u| !u.backup && u.is_healthy())
            .cloned()
            .collect();
        if !primaries.is_empty() {
            return primaries;
        }

        members
            .iter()
            .filter(|u| u.backup && u.is_healthy())
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Upstream>> {
        self.members.load().iter().find(|u| u.name == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.members.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.load().is_empty()
    }

    /// Reload merge: members are matched by name so health state and
    /// counters survive a config reload; new members start Healthy,
    /// removed members drop out of the snapshot (in-flight requests keep
    /// their `Arc` until they finish).
    pub fn merge(&self, configs: &[UpstreamConfig]) {
        let old = self.members.load();
        let merged: Vec<Arc<Upstream>> = configs
            .iter()
            .map(|cfg| {
                match old
                    .iter()
                    .find(|u| u.name == cfg.name && u.address == format!("{}:{}", cfg.address, cfg.port))
                {
                    Some(existing) => existing.clone(),
                    None => Arc::new(Upstream::from_config(cfg)),
                }
            })
            .collect();
        tracing::info!(
            "upstream: pool merged, before={}, after={}",
            old.len(),
            merged.len()
        );
        self.members.store(Arc::new(merged));
    }
}

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    /// fail_timeout 0 lets revival tests run without sleeping; the
    /// window semantics themselves are covered with an explicit timeout.
    fn upstream_config(name: &str, port: u16) -> UpstreamConfig {
        UpstreamConfig {
            name: name.into(),
            address: "127.0.0.1".into(),
            port,
            weight: 1,
            max_fails: 3,
            fail_timeout: 0,
            backup: false,
        }
    }

    #[test]
    fn test_failure_streak_turns_unhealthy() {
        let up = Upstream::from_config(&upstream_config("a", 9001));
        assert!(up.is_healthy());

        up.record_failure();
        up.record_failure();
        assert!(up.is_healthy());
        assert_eq!(up.current_fails(), 2);

        up.record_failure();
        assert!(!up.is_healthy());
    }

    #[test]
    fn test_success_resets_streak() {
        let up = Upstream::from_config(&upstream_config("a", 9001));
        up.record_failure();
        up.record_failure();
        up.record_success();
        assert_eq!(up.current_fails(), 0);

        // The streak starts over: two more failures do not trip it.
        up.record_failure();
        up.record_failure();
        assert!(up.is_healthy());
    }

    #[test]
    fn test_probe_success_respects_fail_timeout() {
        // A long fail_timeout: probe success alone must not revive.
        let mut cfg = upstream_config("a", 9001);
        cfg.fail_timeout = 600;
        let up = Upstream::from_config(&cfg);
        for _ in 0..3 {
            up.record_failure();
        }
        assert!(!up.is_healthy());
        up.probe_success();
        assert!(!up.is_healthy());

        // With the window already elapsed, a probe success revives.
        let up = Upstream::from_config(&upstream_config("b", 9002));
        for _ in 0..3 {
            up.record_failure();
        }
        up.probe_success();
        assert!(up.is_healthy());
        assert_eq!(up.current_fails(), 0);
    }

    #[test]
    fn test_active_guard_decrements_exactly_once() {
        let up = Arc::new(Upstream::from_config(&upstream_config("a", 9001)));
        {
            let _g1 = ActiveGuard::new(up.clone());
            let _g2 = ActiveGuard::new(up.clone());
            assert_eq!(up.active_connections.load(Ordering::Acquire), 2);
        }
        assert_eq!(up.active_connections.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_healthy_set_excludes_unhealthy() {
        let pool = UpstreamPool::new(&[
            upstream_config("a", 9001),
            upstream_config("b", 9002),
        ]);
        assert_eq!(pool.healthy_set().len(), 2);

        let a = pool.get("a").unwrap();
        for _ in 0..3 {
            a.record_failure();
        }
        let healthy = pool.healthy_set();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].name, "b");
    }

    #[test]
    fn test_backup_tiering() {
        let mut backup = upstream_config("backup", 9003);
        backup.backup = true;
        let pool = UpstreamPool::new(&[upstream_config("primary", 9001), backup]);

        // Backups are invisible while a primary is healthy.
        let healthy = pool.healthy_set();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].name, "primary");

        let primary = pool.get("primary").unwrap();
        for _ in 0..3 {
            primary.record_failure();
        }
        let healthy = pool.healthy_set();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].name, "backup");

        // Primary recovery puts the backup back on the bench.
        primary.probe_success();
        let healthy = pool.healthy_set();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].name, "primary");
    }

    #[test]
    fn test_merge_preserves_runtime_state() {
        let pool = UpstreamPool::new(&[upstream_config("a", 9001)]);
        let a = pool.get("a").unwrap();
        a.total_requests.fetch_add(7, Ordering::Relaxed);
        for _ in 0..3 {
            a.record_failure();
        }
        assert!(!a.is_healthy());

        pool.merge(&[upstream_config("a", 9001), upstream_config("b", 9002)]);

        let a2 = pool.get("a").unwrap();
        assert_eq!(a2.total_requests.load(Ordering::Relaxed), 7);
        assert!(!a2.is_healthy());
        assert!(pool.get("b").unwrap().is_healthy());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_merge_drops_removed_members() {
        let pool = UpstreamPool::new(&[
            upstream_config("a", 9001),
            upstream_config("b", 9002),
        ]);
        pool.merge(&[upstream_config("b", 9002)]);
        assert!(pool.get("a").is_none());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_merge_replaces_readdressed_member() {
        let pool = UpstreamPool::new(&[upstream_config("a", 9001)]);
        let a = pool.get("a").unwrap();
        for _ in 0..3 {
            a.record_failure();
        }

        // Same name but a new address is a different origin — it starts
        // with fresh (healthy) state.
        pool.merge(&[upstream_config("a", 9005)]);
        let a2 = pool.get("a").unwrap();
        assert!(a2.is_healthy());
        assert_eq!(a2.address, "127.0.0.1:9005");
    }
}
