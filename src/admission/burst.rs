use crate::config::DdosConfig;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Burst-rate DDoS tracker, independent of the rate limiter.
///
/// Two fixed windows per client: a connection window (`window_size`
/// seconds, counting new connections, consulted by the accept loop) and a
/// one-second packet window (counting requests, consulted by the pipeline
/// before admission touches any bucket). Windows reset lazily when they
/// roll over. A per-client concurrent-connection ceiling rides along.
pub struct BurstTracker {
    entries: DashMap<IpAddr, Arc<BurstEntry>>,
}

struct BurstEntry {
    windows: Mutex<Windows>,
    active_connections: AtomicU32,
    last_seen: AtomicU64,
}

struct Windows {
    conn_window_start: u64,
    conn_count: u32,
    packet_window_start: u64,
    packet_count: u32,
}

const PACKET_WINDOW_US: u64 = 1_000_000;

impl Default for BurstTracker {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl BurstTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection from `client`. Returns `false` when the
    /// client is over its concurrent ceiling or its connection-rate
    /// window; the caller drops the socket without serving it.
    pub async fn connection_opened(&self, cfg: &DdosConfig, client: IpAddr) -> bool {
        let now = now_us();
        let entry = self.entry(client, now);
        entry.last_seen.store(now, Ordering::Relaxed);

        if entry.active_connections.load(Ordering::Relaxed) >= cfg.max_connections_per_ip {
            tracing::debug!(
                "ddos: concurrent connection ceiling hit, client={}, max={}",
                client,
                cfg.max_connections_per_ip
            );
            return false;
        }

        let window_us = cfg.window_size.max(1) * 1_000_000;
        let mut w = entry.windows.lock().await;
        if now.saturating_sub(w.conn_window_start) >= window_us {
            w.conn_window_start = now;
            w.conn_count = 0;
        }
        if w.conn_count >= cfg.connection_rate_limit {
            tracing::debug!(
                "ddos: connection rate exceeded, client={}, limit={}/{}s",
                client,
                cfg.connection_rate_limit,
                cfg.window_size
            );
            return false;
        }
        w.conn_count += 1;
        drop(w);

        entry.active_connections.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// The accept loop calls this exactly once per connection admitted by
    /// `connection_opened`.
    pub fn connection_closed(&self, client: IpAddr) {
        if let Some(entry) = self.entries.get(&client) {
            let _ = entry
                .active_connections
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
    }

    /// Count one request against the client's one-second packet window.
    /// Returns `false` when the window is over its ceiling.
    pub async fn packet_allowed(&self, cfg: &DdosConfig, client: IpAddr) -> bool {
        let now = now_us();
        let entry = self.entry(client, now);
        entry.last_seen.store(now, Ordering::Relaxed);

        let mut w = entry.windows.lock().await;
        if now.saturating_sub(w.packet_window_start) >= PACKET_WINDOW_US {
            w.packet_window_start = now;
            w.packet_count = 0;
        }
        if w.packet_count >= cfg.packet_rate_limit {
            return false;
        }
        w.packet_count += 1;
        true
    }

    fn entry(&self, client: IpAddr, now: u64) -> Arc<BurstEntry> {
        if let Some(entry) = self.entries.get(&client) {
            return entry.value().clone();
        }
        self.entries
            .entry(client)
            .or_insert_with(|| {
                Arc::new(BurstEntry {
                    windows: Mutex::new(Windows {
                        conn_window_start: now,
                        conn_count: 0,
                        packet_window_start: now,
                        packet_count: 0,
                    }),
                    active_connections: AtomicU32::new(0),
                    last_seen: AtomicU64::new(now),
                })
            })
            .clone()
    }

    /// Evict entries idle for more than 10x the connection window with no
    /// live connections.
    pub fn sweep(&self, window_size: u64) {
        let now = now_us();
        let idle_us = window_size * 10 * 1_000_000;
        self.entries.retain(|_, e| {
            e.active_connections.load(Ordering::Relaxed) > 0
                || now.saturating_sub(e.last_seen.load(Ordering::Relaxed)) < idle_us
        });
    }

    pub fn tracked_clients(&self) -> usize {
        self.entries.len()
    }
}

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}
