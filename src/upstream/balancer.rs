use crate::config::LoadBalancingPolicy;
use crate::upstream::pool::Upstream;
use rand::Rng;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Enum-based load balancer — no trait objects, no dynamic dispatch.
///
/// `select` is total over any non-empty snapshot; the pipeline handles
/// the empty case as 502 before calling. The snapshot passed in is the
/// same one whose counters are inspected, so least-connections reads a
/// consistent view.
pub enum LoadBalancer {
    /// Single fetch-add counter, modulo snapshot length. The emitted
    /// index may skip a member when the snapshot shrinks between calls,
    /// which is tolerable.
    RoundRobin { counter: AtomicU64 },
    /// Smallest `active_connections`; ties broken by lowest name.
    LeastConnections,
    /// Stable FNV-1a hash of the client address — same client, same
    /// upstream, for a fixed snapshot.
    IpHash,
    Random,
    /// Cumulative-weight random: P(u) = weight(u) / Σ weights.
    Weighted,
}

impl LoadBalancer {
    pub fn new(policy: LoadBalancingPolicy) -> Self {
        match policy {
            LoadBalancingPolicy::RoundRobin => Self::RoundRobin {
                counter: AtomicU64::new(0),
            },
            LoadBalancingPolicy::LeastConnections => Self::LeastConnections,
            LoadBalancingPolicy::IpHash => Self::IpHash,
            LoadBalancingPolicy::Random => Self::Random,
            LoadBalancingPolicy::Weighted => Self::Weighted,
        }
    }

    pub fn policy_name(&self) -> &'static str {
        match self {
            Self::RoundRobin { .. } => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::IpHash => "ip_hash",
            Self::Random => "random",
            Self::Weighted => "weighted",
        }
    }

    pub fn select(
        &self,
        snapshot: &[Arc<Upstream>],
        client: &IpAddr,
    ) -> Option<Arc<Upstream>> {
        if snapshot.is_empty() {
            return None;
        }

        match self {
            Self::RoundRobin { counter } => {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                Some(snapshot[(n % snapshot.len() as u64) as usize].clone())
            }
            Self::LeastConnections => snapshot
                .iter()
                .min_by(|a, b| {
                    let ca = a.active_connections.load(Ordering::Acquire);
                    let cb = b.active_connections.load(Ordering::Acquire);
                    ca.cmp(&cb).then_with(|| a.name.cmp(&b.name))
                })
                .cloned(),
            Self::IpHash => {
                let hash = fnv1a_64(client.to_string().as_bytes());
                Some(snapshot[(hash % snapshot.len() as u64) as usize].clone())
            }
            Self::Random => {
                let idx = rand::thread_rng().gen_range(0..snapshot.len());
                Some(snapshot[idx].clone())
            }
            Self::Weighted => {
                let mut prefix_sum = Vec::with_capacity(snapshot.len());
                let mut sum: u64 = 0;
                for u in snapshot {
                    sum += u.weight.max(1) as u64;
                    prefix_sum.push(sum);
                }
                let target = rand::thread_rng().gen_range(0..sum);
                let idx = prefix_sum.partition_point(|&s| s <= target);
                Some(snapshot[idx].clone())
            }
        }
    }
}

#[inline]
fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
