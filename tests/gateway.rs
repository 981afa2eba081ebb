//! End-to-end tests: a real listener, the full pipeline, and live
//! loopback origins.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use wraith::config::{RouteConfig, UpstreamConfig, WraithConfig};
use wraith::metrics::Metrics;
use wraith::server::{run_proxy_server, Services};

/// The prometheus recorder can only install once per process.
fn test_metrics() -> Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::install).clone()
}

struct Gateway {
    base: String,
    services: Services,
    shutdown: Arc<Notify>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Gateway {
    async fn start(config: WraithConfig) -> Self {
        let services = Services::new(config, test_metrics()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(run_proxy_server(
            listener,
            services.clone(),
            shutdown.clone(),
        ));

        Self {
            base,
            services,
            shutdown,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn stop(self) {
        self.shutdown.notify_waiters();
        self.handle.abort();
    }
}

fn upstream(name: &str, port: u16) -> UpstreamConfig {
    UpstreamConfig {
        name: name.into(),
        address: "127.0.0.1".into(),
        port,
        weight: 1,
        max_fails: 3,
        fail_timeout: 10,
        backup: false,
    }
}

fn route(path: &str, kind: &str) -> RouteConfig {
    RouteConfig {
        path: path.into(),
        host: None,
        method: "ANY".into(),
        priority: 0,
        kind: kind.into(),
        upstream: None,
        location: None,
        redirect_code: 301,
        handler: None,
        headers: vec![],
    }
}

/// Loopback origin that counts requests and answers after `delay`.
async fn spawn_origin(delay: Duration) -> (u16, Arc<AtomicU32>) {
    use http_body_util::Full;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let counter = Arc::new(AtomicU32::new(0));
    let counter_outer = counter.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let counter = counter.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |_req: hyper::Request<hyper::body::Incoming>| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(delay).await;
                        Ok::<_, std::convert::Infallible>(hyper::Response::new(Full::new(
                            bytes::Bytes::from_static(b"origin"),
                        )))
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    (port, counter_outer)
}

/// A loopback port with nothing listening behind it.
fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn static_hit_with_etag_revalidation() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("index.html"), b"hello wraith").unwrap();

    let mut config = WraithConfig::default();
    config.static_files.enabled = true;
    config.static_files.root = dir.path().to_path_buf();

    let gw = Gateway::start(config).await;
    let client = reqwest::Client::new();

    let resp = client.get(gw.url("/")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let etag = resp
        .headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_owned();
    assert!(etag.starts_with('"') && etag.ends_with('"'));
    assert_eq!(resp.headers().get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(resp.text().await.unwrap(), "hello wraith");

    // Revalidation with the returned ETag yields 304 and an empty body.
    let resp = client
        .get(gw.url("/"))
        .header("if-none-match", &etag)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 304);
    assert!(resp.text().await.unwrap().is_empty());

    gw.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn route_miss_is_not_found() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = WraithConfig::default();
    config.static_files.enabled = true;
    config.static_files.root = dir.path().to_path_buf();
    config.routes = vec![route("/assets/*", "static")];

    let gw = Gateway::start(config).await;

    let resp = reqwest::get(gw.url("/nope")).await.unwrap();
    assert_eq!(resp.status(), 404);
    assert!(resp.text().await.unwrap().contains("Not Found"));

    gw.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limit_trips_after_burst() {
    let (port, _counter) = spawn_origin(Duration::ZERO).await;

    let mut config = WraithConfig::default();
    config.proxy.enabled = true;
    config.proxy.upstreams = vec![upstream("app", port)];
    config.security.rate_limiting.requests_per_minute = 60;
    config.security.rate_limiting.burst = 10;
    config.security.rate_limiting.auto_block_enabled = false;

    let gw = Gateway::start(config).await;
    let client = reqwest::Client::new();

    let mut ok = 0;
    let mut limited = 0;
    for _ in 0..12 {
        let resp = client.get(gw.url("/")).send().await.unwrap();
        match resp.status().as_u16() {
            200 => ok += 1,
            429 => {
                let retry: u64 = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap();
                assert!(retry >= 1);
                limited += 1;
            }
            other => panic!("unexpected status {}", other),
        }
    }
    assert_eq!(ok, 10);
    assert_eq!(limited, 2);

    gw.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auto_block_expires_after_duration() {
    let (port, _counter) = spawn_origin(Duration::ZERO).await;

    let mut config = WraithConfig::default();
    config.proxy.enabled = true;
    config.proxy.upstreams = vec![upstream("app", port)];
    config.security.rate_limiting.requests_per_minute = 60;
    config.security.rate_limiting.burst = 2;
    config.security.rate_limiting.auto_block_enabled = true;
    config.security.rate_limiting.auto_block_threshold = 1;
    config.security.rate_limiting.block_duration = 1;

    let gw = Gateway::start(config).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        assert_eq!(client.get(gw.url("/")).send().await.unwrap().status(), 200);
    }

    // The violating request trips the auto-block.
    let resp = client.get(gw.url("/")).send().await.unwrap();
    assert_eq!(resp.status(), 429);
    let retry: u64 = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap();
    assert!(retry <= 1);

    // Still blocked while the window lasts.
    let resp = client.get(gw.url("/")).send().await.unwrap();
    assert_eq!(resp.status(), 429);

    // Past the block duration the client re-enters admission (and the
    // refilled bucket admits it).
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let resp = client.get(gw.url("/")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    gw.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failover_to_healthy_upstream() {
    let (live_port, live_counter) = spawn_origin(Duration::ZERO).await;
    let dead = dead_port();

    let mut config = WraithConfig::default();
    config.proxy.enabled = true;
    config.proxy.upstreams = vec![upstream("dead", dead), upstream("live", live_port)];
    config.security.rate_limiting.enabled = false;

    let gw = Gateway::start(config).await;
    let client = reqwest::Client::new();

    let mut ok = 0;
    let mut failed = 0;
    for _ in 0..20 {
        let resp = client.get(gw.url("/")).send().await.unwrap();
        match resp.status().as_u16() {
            200 => ok += 1,
            502 => failed += 1,
            other => panic!("unexpected status {}", other),
        }
    }

    // Round-robin hits the dead member until its failure streak crosses
    // max_fails; every request after that lands on the live one.
    assert_eq!(failed, 3);
    assert_eq!(ok, 17);
    assert!(!gw.services.upstreams.get("dead").unwrap().is_healthy());
    assert_eq!(live_counter.load(Ordering::SeqCst), 17);

    gw.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn least_connections_spreads_concurrent_load() {
    let (port_a, counter_a) = spawn_origin(Duration::from_millis(400)).await;
    let (port_b, counter_b) = spawn_origin(Duration::from_millis(400)).await;

    let mut config = WraithConfig::default();
    config.proxy.enabled = true;
    config.proxy.load_balancing = wraith::config::LoadBalancingPolicy::LeastConnections;
    config.proxy.upstreams = vec![upstream("a", port_a), upstream("b", port_b)];
    config.security.rate_limiting.enabled = false;

    let gw = Gateway::start(config).await;
    let client = reqwest::Client::new();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let client = client.clone();
        let url = gw.url("/");
        handles.push(tokio::spawn(async move {
            client.get(url).send().await.unwrap().status().as_u16()
        }));
        // Small stagger so each selection observes the previous one's
        // active-connection increment.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    for h in handles {
        assert_eq!(h.await.unwrap(), 200);
    }

    let a = counter_a.load(Ordering::SeqCst);
    let b = counter_b.load(Ordering::SeqCst);
    assert_eq!(a + b, 4);
    assert!((1..=3).contains(&a), "a={}, b={}", a, b);
    assert!((1..=3).contains(&b), "a={}, b={}", a, b);

    gw.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_and_status_endpoints() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = WraithConfig::default();
    config.static_files.enabled = true;
    config.static_files.root = dir.path().to_path_buf();

    let gw = Gateway::start(config).await;

    let resp = reqwest::get(gw.url("/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["protocol"], "HTTP/3");
    assert_eq!(body["transport"], "QUIC");

    let resp = reqwest::get(gw.url("/status")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["server"].is_string());
    assert!(body["version"].is_string());
    assert!(body["uptime"].is_string());
    assert_eq!(body["tls"]["auto_cert"], false);

    gw.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forwarded_response_is_hop_header_free_and_stamped() {
    let (port, _counter) = spawn_origin(Duration::ZERO).await;

    let mut config = WraithConfig::default();
    config.proxy.enabled = true;
    config.proxy.upstreams = vec![upstream("app", port)];
    config.security.rate_limiting.enabled = false;

    let gw = Gateway::start(config).await;

    let resp = reqwest::get(gw.url("/anything")).await.unwrap();
    assert_eq!(resp.status(), 200);
    for name in [
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "upgrade",
    ] {
        assert!(
            resp.headers().get(name).is_none(),
            "hop-by-hop header {} leaked",
            name
        );
    }
    assert_eq!(resp.text().await.unwrap(), "origin");

    gw.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_preserves_inflight_and_swaps_routes() {
    let (port, _counter) = spawn_origin(Duration::from_millis(300)).await;

    let mut config = WraithConfig::default();
    config.proxy.enabled = true;
    config.proxy.upstreams = vec![upstream("app", port)];
    config.security.rate_limiting.enabled = false;

    let gw = Gateway::start(config.clone()).await;
    let client = reqwest::Client::new();

    // Fire a slow request, reload mid-flight, then check both that the
    // in-flight response lands intact and that the new table is active.
    let inflight = {
        let client = client.clone();
        let url = gw.url("/slow");
        tokio::spawn(async move { client.get(url).send().await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut new_config = config.clone();
    new_config.routes = vec![
        route("/only/*", "proxy"),
    ];
    gw.services.reload(new_config).await.unwrap();

    let resp = inflight.await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "origin");

    // The old catch-all is gone; the new table routes only /only/*.
    let resp = client.get(gw.url("/slow")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    let resp = client.get(gw.url("/only/thing")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    gw.stop().await;
}
