use crate::config::{ConnectionPoolConfig, ProxyTimeoutConfig};
use crate::error::WraithError;
use crate::proxy::context::BoxBody;
use dashmap::DashMap;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// One live upstream connection checked out of (or destined for) the pool.
#[derive(Debug)]
pub struct PooledConnection {
    sender: http1::SendRequest<BoxBody>,
    last_used: Instant,
}

impl PooledConnection {
    /// A connection is reusable while its driver is alive, it is ready
    /// for the next request, and it has not idled past `max_idle`.
    fn is_reusable(&self, max_idle: Duration) -> bool {
        !self.sender.is_closed() && self.sender.is_ready() && self.last_used.elapsed() <= max_idle
    }

    pub fn sender(&mut self) -> &mut http1::SendRequest<BoxBody> {
        &mut self.sender
    }
}

/// Keyed idle-connection pool for upstream origins.
///
/// Key: "host:port". Each key holds a bounded FIFO of idle connections.
/// `acquire` evicts closed/expired entries before a hit is declared; a
/// miss opens a TCP connection and performs an HTTP/1.1 handshake, with
/// the connection driver spawned onto the runtime. On transport errors
/// the caller drops the connection instead of releasing it, so a broken
/// connection never re-enters the pool.
pub struct ConnectionPool {
    idle: DashMap<String, VecDeque<PooledConnection>>,
    max_idle_per_host: usize,
    max_idle: Duration,
    connect_timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ConnectionPool {
    pub fn new(cfg: &ConnectionPoolConfig, timeouts: &ProxyTimeoutConfig) -> Self {
        Self {
            idle: DashMap::new(),
            max_idle_per_host: cfg.max_idle_per_host,
            max_idle: Duration::from_secs(cfg.max_idle_secs),
            connect_timeout: Duration::from_secs_f64(timeouts.connect),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Check out a connection to `addr`, reusing an idle one when
    /// possible. Timeout on connect maps to `UpstreamTimeout` (504),
    /// refusal/unreachability to `UpstreamConnect` (502).
    pub async fn acquire(&self, addr: &str) -> Result<PooledConnection, WraithError> {
        if let Some(mut entry) = self.idle.get_mut(addr) {
            while let Some(conn) = entry.value_mut().pop_front() {
                if conn.is_reusable(self.max_idle) {
                    drop(entry);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("wraith_connection_pool_hits_total").increment(1);
                    return Ok(conn);
                }
                // Closed or idle-expired — fall out of the pool here.
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("wraith_connection_pool_misses_total").increment(1);

        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
        {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(WraithError::UpstreamConnect(format!("{}: {}", addr, e))),
            Err(_) => return Err(WraithError::UpstreamTimeout),
        };
        stream.set_nodelay(true).ok();

        let (sender, driver) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| WraithError::UpstreamConnect(format!("{}: handshake: {}", addr, e)))?;

        let addr_owned = addr.to_string();
        tokio::spawn(async move {
            if let Err(e) = driver.await {
                debug!("connection: driver ended, addr={}, error={}", addr_owned, e);
            }
        });

        Ok(PooledConnection {
            sender,
            last_used: Instant::now(),
        })
    }

    /// Return a connection after a fully-relayed response. Full per-key
    /// lists close and discard the connection instead.
    pub fn release(&self, addr: &str, mut conn: PooledConnection) {
        if conn.sender.is_closed() {
            return;
        }
        conn.last_used = Instant::now();

        let mut entry = self.idle.entry(addr.to_string()).or_default();
        if entry.len() >= self.max_idle_per_host {
            return;
        }
        entry.push_back(conn);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.iter().map(|e| e.value().len()).sum()
    }

    /// Teardown: drop every idle connection.
    pub fn clear(&self) {
        self.idle.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::empty_body;
    use http_body_util::Full;
    use hyper::service::service_fn;
    use tokio::net::TcpListener;

    fn pool_config(max_idle_per_host: usize, max_idle_secs: u64) -> ConnectionPoolConfig {
        ConnectionPoolConfig {
            max_idle_per_host,
            max_idle_secs,
        }
    }

    fn timeouts() -> ProxyTimeoutConfig {
        ProxyTimeoutConfig {
            connect: 2.0,
            read: 5.0,
            request: 10.0,
        }
    }

    /// Loopback origin answering every request with 200 "pong".
    async fn spawn_origin() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let svc = service_fn(|_req: hyper::Request<hyper::body::Incoming>| async {
                        Ok::<_, std::convert::Infallible>(
                            hyper::Response::new(Full::new(bytes::Bytes::from_static(b"pong"))),
                        )
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        });
        addr
    }

    async fn roundtrip(conn: &mut PooledConnection, addr: &str) {
        let req = hyper::Request::builder()
            .uri("/")
            .header(http::header::HOST, addr)
            .body(empty_body())
            .unwrap();
        let resp = conn.sender().send_request(req).await.unwrap();
        // Drain the body and wait for readiness so the connection is
        // observably reusable before it goes back to the pool.
        let _ = http_body_util::BodyExt::collect(resp.into_body()).await;
        conn.sender().ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_connection() {
        let addr = spawn_origin().await;
        let pool = ConnectionPool::new(&pool_config(4, 60), &timeouts());

        let mut conn = pool.acquire(&addr).await.unwrap();
        assert_eq!(pool.misses(), 1);
        roundtrip(&mut conn, &addr).await;
        pool.release(&addr, conn);
        assert_eq!(pool.idle_count(), 1);

        let mut conn = pool.acquire(&addr).await.unwrap();
        assert_eq!(pool.hits(), 1);
        roundtrip(&mut conn, &addr).await;
        pool.release(&addr, conn);
    }

    #[tokio::test]
    async fn test_hits_plus_misses_equals_acquires() {
        let addr = spawn_origin().await;
        let pool = ConnectionPool::new(&pool_config(4, 60), &timeouts());

        for _ in 0..6 {
            let mut conn = pool.acquire(&addr).await.unwrap();
            roundtrip(&mut conn, &addr).await;
            pool.release(&addr, conn);
        }
        assert_eq!(pool.hits() + pool.misses(), 6);
    }

    #[tokio::test]
    async fn test_per_key_ceiling() {
        let addr = spawn_origin().await;
        let pool = ConnectionPool::new(&pool_config(2, 60), &timeouts());

        let mut conns = Vec::new();
        for _ in 0..4 {
            let mut c = pool.acquire(&addr).await.unwrap();
            roundtrip(&mut c, &addr).await;
            conns.push(c);
        }
        for c in conns {
            pool.release(&addr, c);
        }
        // Releases beyond the ceiling are discarded.
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn test_idle_expiry_evicts_on_acquire() {
        let addr = spawn_origin().await;
        // max_idle of zero seconds: everything is expired on the next acquire.
        let pool = ConnectionPool::new(&pool_config(4, 0), &timeouts());

        let mut conn = pool.acquire(&addr).await.unwrap();
        roundtrip(&mut conn, &addr).await;
        pool.release(&addr, conn);
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let _conn = pool.acquire(&addr).await.unwrap();
        assert_eq!(pool.misses(), 2);
        assert_eq!(pool.hits(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused_classifies_as_connect_error() {
        let pool = ConnectionPool::new(&pool_config(4, 60), &timeouts());
        // Port 1 on loopback: immediate refusal.
        let err = pool.acquire("127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, WraithError::UpstreamConnect(_)));
    }

    #[tokio::test]
    async fn test_clear_drops_idle() {
        let addr = spawn_origin().await;
        let pool = ConnectionPool::new(&pool_config(4, 60), &timeouts());

        let mut conn = pool.acquire(&addr).await.unwrap();
        roundtrip(&mut conn, &addr).await;
        pool.release(&addr, conn);
        assert_eq!(pool.idle_count(), 1);

        pool.clear();
        assert_eq!(pool.idle_count(), 0);
    }
}
