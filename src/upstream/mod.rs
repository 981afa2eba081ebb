pub mod balancer;
pub mod health;
pub mod pool;

pub use balancer::LoadBalancer;
pub use health::{build_probe_client, run_health_probes};
pub use pool::{ActiveGuard, Upstream, UpstreamPool};
