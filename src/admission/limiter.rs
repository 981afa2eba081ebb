use crate::config::RateLimitConfig;
use crate::error::{WraithError, RETRY_AFTER_FOREVER};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Why a request was turned away at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Blocked,
    Blacklisted,
    GlobalLimit,
    RateLimited,
    RequestTooLarge,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Blocked => "blocked",
            DenyReason::Blacklisted => "blacklisted",
            DenyReason::GlobalLimit => "global_limit",
            DenyReason::RateLimited => "rate_limited",
            DenyReason::RequestTooLarge => "request_too_large",
        }
    }
}

/// Outcome of one admission check.
#[derive(Debug)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    /// Seconds until a retry might succeed. `RETRY_AFTER_FOREVER` for
    /// permanent denials.
    pub retry_after: u64,
    /// Whole tokens left in the client's bucket after this request.
    pub remaining: u64,
}

impl Decision {
    fn allow(remaining: u64) -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after: 0,
            remaining,
        }
    }

    fn deny(reason: DenyReason, retry_after: u64) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            retry_after,
            remaining: 0,
        }
    }

    pub fn into_error(self) -> Option<WraithError> {
        match self.reason? {
            DenyReason::Blocked => Some(WraithError::Blocked {
                retry_after: self.retry_after,
            }),
            DenyReason::Blacklisted => Some(WraithError::Blacklisted),
            DenyReason::GlobalLimit => Some(WraithError::GlobalLimit {
                retry_after: self.retry_after,
            }),
            DenyReason::RateLimited => Some(WraithError::RateLimited {
                retry_after: self.retry_after,
            }),
            DenyReason::RequestTooLarge => Some(WraithError::RequestTooLarge),
        }
    }
}

/// A client that crossed the auto-block threshold.
#[derive(Debug, Clone)]
pub struct BlockedClient {
    pub blocked_at: u64,
    pub unblock_at: u64,
    pub reason: &'static str,
}

/// Token bucket — `tokio::sync::Mutex`-protected inner state so a refill
/// computed against timestamp `t` is never replayed against an earlier
/// one: refills happen under the lock against the stored `last_refill`.
struct Bucket {
    inner: Mutex<BucketInner>,
    /// Last access timestamp in microseconds (for GC). Updated outside the lock.
    last_access: AtomicU64,
}

struct BucketInner {
    tokens: u64,
    last_refill: u64,
}

/// Scaled token units: 1 request = PRECISION units, so fractional refill
/// accumulates without float drift in the stored count.
const PRECISION: u64 = 1_000_000;

/// Client buckets idle longer than this are evicted by the sweep.
const BUCKET_IDLE_SECS: u64 = 300;

struct ClientState {
    bucket: Bucket,
    violations: AtomicU32,
}

struct AccessLists {
    allow: HashSet<IpAddr>,
    deny: HashSet<IpAddr>,
}

/// The admission controller: per-client token buckets, one global bucket,
/// static allow/deny lists, and the auto-block map.
///
/// Check order (each step can short-circuit): active block → allowlist →
/// denylist → global bucket → per-client bucket (violations feed
/// auto-block) → request size.
pub struct AdmissionControl {
    clients: DashMap<IpAddr, Arc<ClientState>>,
    blocked: DashMap<IpAddr, BlockedClient>,
    global: Bucket,
    lists: ArcSwap<AccessLists>,
}

impl AdmissionControl {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        let now = now_us();
        Self {
            clients: DashMap::new(),
            blocked: DashMap::new(),
            global: Bucket {
                inner: Mutex::new(BucketInner {
                    tokens: cfg.global_requests_per_minute.saturating_mul(PRECISION),
                    last_refill: now,
                }),
                last_access: AtomicU64::new(now),
            },
            lists: ArcSwap::from_pointee(parse_lists(cfg)),
        }
    }

    /// Re-parse the allow/deny lists after a config reload. Bucket and
    /// block state is deliberately preserved.
    pub fn update_access_lists(&self, cfg: &RateLimitConfig) {
        self.lists.store(Arc::new(parse_lists(cfg)));
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    pub async fn check(
        &self,
        cfg: &RateLimitConfig,
        client: IpAddr,
        request_size: u64,
    ) -> Decision {
        let now = now_us();

        // 1. Active auto-block.
        if let Some(entry) = self.blocked.get(&client) {
            if now < entry.unblock_at {
                let secs = (entry.unblock_at - now).div_ceil(1_000_000);
                return Decision::deny(DenyReason::Blocked, secs);
            }
            drop(entry);
            self.blocked.remove(&client);
            tracing::debug!("admission: block expired, client={}", client);
        }

        let lists = self.lists.load();

        // 2. Allowlist — unconditional, no buckets consumed. Operators
        // rely on this for health scrapers.
        if lists.allow.contains(&client) {
            return Decision::allow(u64::MAX);
        }

        // 3. Denylist.
        if lists.deny.contains(&client) {
            return Decision::deny(DenyReason::Blacklisted, RETRY_AFTER_FOREVER);
        }

        // 4. Global bucket.
        if cfg.global_requests_per_minute > 0 {
            let rate_per_us = cfg.global_requests_per_minute as f64 / 60_000_000.0;
            let max = cfg.global_requests_per_minute.saturating_mul(PRECISION);
            let (ok, _, retry) = self.global.try_acquire(now, rate_per_us, max).await;
            if !ok {
                return Decision::deny(DenyReason::GlobalLimit, retry);
            }
        }

        // 5. Per-client bucket. Capacity is `burst` when set (the admit
        // ceiling for a cold client), refill rate is requests_per_minute.
        let capacity = if cfg.burst > 0 {
            cfg.burst as u64
        } else {
            cfg.requests_per_minute as u64
        };
        let rate_per_us = cfg.requests_per_minute as f64 / 60_000_000.0;
        let max = capacity.saturating_mul(PRECISION);

        let state = self.client_state(client, max, now);
        state.bucket.last_access.store(now, Ordering::Relaxed);
        let (ok, remaining, retry) = state.bucket.try_acquire(now, rate_per_us, max).await;

        if !ok {
            let violations = state.violations.fetch_add(1, Ordering::Relaxed) + 1;
            if cfg.auto_block_enabled && violations >= cfg.auto_block_threshold {
                let unblock_at = now + cfg.block_duration.saturating_mul(1_000_000);
                self.blocked.insert(
                    client,
                    BlockedClient {
                        blocked_at: now,
                        unblock_at,
                        reason: "rate limit violations",
                    },
                );
                state.violations.store(0, Ordering::Relaxed);
                tracing::warn!(
                    "admission: client auto-blocked, client={}, violations={}, duration={}s",
                    client,
                    violations,
                    cfg.block_duration
                );
                metrics::counter!("wraith_admission_autoblocks_total").increment(1);
                return Decision::deny(DenyReason::Blocked, cfg.block_duration);
            }
            return Decision::deny(DenyReason::RateLimited, retry);
        }
        state.violations.store(0, Ordering::Relaxed);

        // 6. Size check.
        if request_size > cfg.max_request_size {
            return Decision::deny(DenyReason::RequestTooLarge, 0);
        }

        // 7. Admitted.
        Decision::allow(remaining)
    }

    fn client_state(&self, client: IpAddr, max_tokens: u64, now: u64) -> Arc<ClientState> {
        if let Some(entry) = self.clients.get(&client) {
            return entry.value().clone();
        }
        self.clients
            .entry(client)
            .or_insert_with(|| {
                Arc::new(ClientState {
                    bucket: Bucket {
                        inner: Mutex::new(BucketInner {
                            tokens: max_tokens,
                            last_refill: now,
                        }),
                        last_access: AtomicU64::new(now),
                    },
                    violations: AtomicU32::new(0),
                })
            })
            .clone()
    }

    /// Evict expired blocks and idle client buckets. Run no less often
    /// than once per 60 seconds.
    pub fn sweep(&self) {
        let now = now_us();
        let before = self.blocked.len();
        self.blocked.retain(|_, b| b.unblock_at > now);
        let expired = before - self.blocked.len();
        if expired > 0 {
            tracing::debug!("admission: sweep removed {} expired blocks", expired);
        }

        let idle_us = BUCKET_IDLE_SECS * 1_000_000;
        self.clients.retain(|_, s| {
            now.saturating_sub(s.bucket.last_access.load(Ordering::Relaxed)) < idle_us
        });

        metrics::gauge!("wraith_admission_blocked_clients").set(self.blocked.len() as f64);
    }
}

fn parse_lists(cfg: &RateLimitConfig) -> AccessLists {
    let parse = |list: &[String]| {
        list.iter()
            .filter_map(|s| s.parse::<IpAddr>().ok())
            .collect::<HashSet<_>>()
    };
    AccessLists {
        allow: parse(&cfg.whitelist),
        deny: parse(&cfg.blacklist),
    }
}

impl Bucket {
    /// Refill against the stored `last_refill` and try to consume one
    /// token. Returns (allowed, whole tokens remaining, retry-after secs).
    async fn try_acquire(&self, now: u64, rate_per_us: f64, max_tokens: u64) -> (bool, u64, u64) {
        let mut b = self.inner.lock().await;

        let elapsed = now.saturating_sub(b.last_refill);
        if elapsed > 0 {
            let refill = (elapsed as f64 * rate_per_us * PRECISION as f64) as u64;
            b.tokens = (b.tokens.saturating_add(refill)).min(max_tokens);
            b.last_refill = now;
        }

        let cost = PRECISION;
        if b.tokens >= cost {
            b.tokens -= cost;
            (true, b.tokens / PRECISION, 0)
        } else {
            // Projected time until one whole token is available.
            let needed = cost - b.tokens;
            let us = needed as f64 / (rate_per_us * PRECISION as f64);
            let secs = ((us / 1_000_000.0).ceil() as u64).max(1);
            (false, 0, secs)
        }
    }
}

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}
