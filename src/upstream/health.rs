use crate::config::HealthCheckConfig;
use crate::upstream::pool::UpstreamPool;
use futures_util::stream::{self, StreamExt};
use std::time::Duration;
use tracing::debug;

/// Probes issued concurrently per round. One slow member must not block
/// the others; the per-probe timeout is already strictly below the
/// interval, this just bounds the fan-out.
const PROBE_CONCURRENCY: usize = 16;

/// Build the shared HTTP client for health probes.
pub fn build_probe_client(cfg: &HealthCheckConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.timeout))
        .no_proxy()
        .build()
        .expect("failed to build health probe client")
}

/// Run a single round of active health probes across the pool.
///
/// The caller owns the loop / scheduling. Every member — healthy or not —
/// is probed, so Unhealthy members can be revived once their fail window
/// elapses.
pub async fn run_health_probes(
    pool: &UpstreamPool,
    cfg: &HealthCheckConfig,
    client: &reqwest::Client,
) {
    let members = pool.snapshot();
    if members.is_empty() {
        return;
    }

    stream::iter(members.iter().cloned())
        .map(|upstream| {
            let client = client.clone();
            let path = cfg.path.clone();
            let expected = cfg.expected_status;
            let timeout = cfg.timeout;
            async move {
                let url = format!("http://{}{}", upstream.address, path);

                let result = client
                    .get(&url)
                    .timeout(Duration::from_secs(timeout))
                    .send()
                    .await;

                let passed = match result {
                    Ok(resp) => resp.status().as_u16() == expected,
                    Err(_) => false,
                };

                if passed {
                    upstream.probe_success();
                    debug!(
                        "health: probe passed, upstream={}, addr={}",
                        upstream.name, upstream.address
                    );
                } else {
                    upstream.probe_failure();
                    debug!(
                        "health: probe failed, upstream={}, addr={}",
                        upstream.name, upstream.address
                    );
                }

                metrics::counter!(
                    "wraith_health_check_total",
                    "upstream" => upstream.address.clone(),
                    "result" => if passed { "success" } else { "failure" },
                )
                .increment(1);
            }
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .collect::<()>()
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use http_body_util::Full;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    /// Minimal loopback origin answering every request with `status`.
    async fn spawn_origin(status: u16) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let svc = service_fn(move |_req: hyper::Request<hyper::body::Incoming>| async move {
                        Ok::<_, std::convert::Infallible>(
                            hyper::Response::builder()
                                .status(status)
                                .body(Full::new(bytes::Bytes::from_static(b"ok")))
                                .unwrap(),
                        )
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        });
        port
    }

    fn hc_config() -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: true,
            interval: 10,
            timeout: 2,
            path: "/health".into(),
            expected_status: 200,
        }
    }

    fn member(name: &str, port: u16, fail_timeout: u64) -> UpstreamConfig {
        UpstreamConfig {
            name: name.into(),
            address: "127.0.0.1".into(),
            port,
            weight: 1,
            max_fails: 2,
            fail_timeout,
            backup: false,
        }
    }

    #[tokio::test]
    async fn test_probe_failure_marks_unhealthy() {
        // Nothing listens on the member's port: probes fail, and after
        // max_fails rounds the member is Unhealthy.
        let pool = UpstreamPool::new(&[member("dead", 1, 10)]);
        let cfg = hc_config();
        let client = build_probe_client(&cfg);

        run_health_probes(&pool, &cfg, &client).await;
        assert!(pool.get("dead").unwrap().is_healthy());

        run_health_probes(&pool, &cfg, &client).await;
        assert!(!pool.get("dead").unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_probe_success_revives_after_window() {
        let port = spawn_origin(200).await;
        let pool = UpstreamPool::new(&[member("app", port, 0)]);
        let cfg = hc_config();
        let client = build_probe_client(&cfg);

        let up = pool.get("app").unwrap();
        up.record_failure();
        up.record_failure();
        assert!(!up.is_healthy());

        run_health_probes(&pool, &cfg, &client).await;
        assert!(up.is_healthy());
    }

    #[tokio::test]
    async fn test_unexpected_status_counts_as_failure() {
        let port = spawn_origin(500).await;
        let pool = UpstreamPool::new(&[member("flaky", port, 10)]);
        let cfg = hc_config();
        let client = build_probe_client(&cfg);

        run_health_probes(&pool, &cfg, &client).await;
        run_health_probes(&pool, &cfg, &client).await;
        assert!(!pool.get("flaky").unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_expected_status_is_configurable() {
        let port = spawn_origin(204).await;
        let pool = UpstreamPool::new(&[member("app", port, 0)]);
        let mut cfg = hc_config();
        cfg.expected_status = 204;
        let client = build_probe_client(&cfg);

        let up = pool.get("app").unwrap();
        up.record_failure();
        up.record_failure();

        run_health_probes(&pool, &cfg, &client).await;
        assert!(up.is_healthy());
    }
}
