use crate::admission::{AdmissionControl, BurstTracker};
use crate::config::WraithConfig;
use crate::error::WraithError;
use crate::metrics::Metrics;
use crate::proxy::connection::ConnectionPool;
use crate::routing::RouteTable;
use crate::staticfiles::FileCache;
use crate::upstream::{LoadBalancer, UpstreamPool};
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::info;

/// The service record handed to the pipeline — every collaborator is an
/// explicitly constructed object, cheaply cloneable, with no process
/// globals beyond the tracing subscriber and the metrics recorder their
/// crates require.
///
/// Immutable-after-load state (config, route table, balancer policy,
/// connection-pool settings) lives behind `ArcSwap` so a reload replaces
/// it wholesale while in-flight requests drain against the snapshot they
/// loaded.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<ArcSwap<WraithConfig>>,
    pub routing: Arc<ArcSwap<RouteTable>>,
    pub admission: Arc<AdmissionControl>,
    pub burst: Arc<BurstTracker>,
    pub upstreams: Arc<UpstreamPool>,
    pub balancer: Arc<ArcSwap<LoadBalancer>>,
    pub connections: Arc<ArcSwap<ConnectionPool>>,
    pub static_cache: Arc<FileCache>,
    pub metrics: Metrics,
    pub started: Instant,
    /// Serializes reloads so concurrent signals cannot interleave the
    /// table/pool/config swaps.
    reload_mu: Arc<Mutex<()>>,
}

impl Services {
    pub fn new(config: WraithConfig, metrics: Metrics) -> Result<Self, WraithError> {
        let routing = RouteTable::from_config(&config)?;
        let upstreams = UpstreamPool::new(&config.proxy.upstreams);
        let balancer = LoadBalancer::new(config.proxy.load_balancing);
        let connections =
            ConnectionPool::new(&config.proxy.connection_pool, &config.proxy.timeout);
        let admission = AdmissionControl::new(&config.security.rate_limiting);

        Ok(Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            routing: Arc::new(ArcSwap::from_pointee(routing)),
            admission: Arc::new(admission),
            burst: Arc::new(BurstTracker::new()),
            upstreams: Arc::new(upstreams),
            balancer: Arc::new(ArcSwap::from_pointee(balancer)),
            connections: Arc::new(ArcSwap::from_pointee(connections)),
            static_cache: Arc::new(FileCache::new()),
            metrics,
            started: Instant::now(),
            reload_mu: Arc::new(Mutex::new(())),
        })
    }

    /// Apply a validated config. The new route table is built off the hot
    /// path first; any error leaves the running configuration untouched.
    /// On success the table and config swap atomically, the upstream pool
    /// merges by name (health state survives), and the balancer /
    /// connection pool are rebuilt only when their settings changed.
    pub async fn reload(&self, new: WraithConfig) -> Result<(), WraithError> {
        let _guard = self.reload_mu.lock().await;

        let routing = RouteTable::from_config(&new)?;

        let old = self.config.load_full();

        self.upstreams.merge(&new.proxy.upstreams);

        if new.proxy.load_balancing != old.proxy.load_balancing {
            self.balancer
                .store(Arc::new(LoadBalancer::new(new.proxy.load_balancing)));
            info!(
                "reload: load balancing policy changed to {:?}",
                new.proxy.load_balancing
            );
        }

        if new.proxy.connection_pool != old.proxy.connection_pool
            || new.proxy.timeout != old.proxy.timeout
        {
            self.connections.store(Arc::new(ConnectionPool::new(
                &new.proxy.connection_pool,
                &new.proxy.timeout,
            )));
            info!("reload: connection pool rebuilt");
        }

        self.admission
            .update_access_lists(&new.security.rate_limiting);

        self.routing.store(Arc::new(routing));
        self.config.store(Arc::new(new));

        metrics::counter!("wraith_config_reloads_total", "result" => "success").increment(1);
        info!("reload: configuration applied");
        Ok(())
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started.elapsed()
    }
}
