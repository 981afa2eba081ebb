mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::Services;

use crate::proxy;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Run the main proxy server with graceful shutdown support.
///
/// When `shutdown` is notified the server stops accepting new connections
/// and waits up to `DRAIN_TIMEOUT` for in-flight requests to complete
/// before forcibly dropping them.
///
/// The listener is bound by the caller (bootstrap) so bind failures can
/// map to their own exit code.
pub async fn run_proxy_server(
    listener: TcpListener,
    state: Services,
    shutdown: Arc<Notify>,
) -> Result<()> {
    const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

    info!(
        "server: proxy listening, addr={}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    // Atomic counter for reading active connection count (metrics crate
    // gauges are write-only).
    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: proxy: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!(
                    "wraith_connections_total",
                    "status" => "accepted",
                )
                .increment(1);
                v
            }
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                metrics::counter!(
                    "wraith_connections_total",
                    "status" => "error",
                )
                .increment(1);
                continue;
            }
        };

        // Global connection ceiling.
        let max_connections = state.config.load().server.max_connections as i64;
        if active_conns.load(Ordering::Relaxed) >= max_connections {
            metrics::counter!(
                "wraith_connections_total",
                "status" => "over_limit",
            )
            .increment(1);
            drop(stream);
            continue;
        }

        // Per-IP ceilings from the burst tracker: over-limit clients are
        // dropped at accept, before any HTTP parsing.
        let ddos_cfg = state.config.load().security.ddos_protection.clone();
        if !state
            .burst
            .connection_opened(&ddos_cfg, peer_addr.ip())
            .await
        {
            metrics::counter!("wraith_ddos_dropped_connections_total").increment(1);
            drop(stream);
            continue;
        }

        metrics::gauge!("wraith_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let state_inner = state.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state_inner.clone();
                async move { proxy::handle_request(req, state, peer_addr).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: proxy: connection error, peer={}, error={}",
                        peer_addr, e
                    );
                }
            }

            state.burst.connection_closed(peer_addr.ip());
            metrics::gauge!("wraith_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase: wait for all in-flight connections to finish (or time out).
    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!(
            "server: proxy: waiting for {} active connections to drain",
            active
        );
        let drain = async {
            loop {
                if active_conns.load(Ordering::Relaxed) == 0 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("server: proxy: all connections drained"),
            Err(_) => {
                let remaining = active_conns.load(Ordering::Relaxed);
                info!(
                    "server: proxy: drain timeout ({}s), {} connections still active",
                    DRAIN_TIMEOUT.as_secs(),
                    remaining
                );
            }
        }
    }

    // Idle upstream connections go with the server.
    state.connections.load().clear();

    Ok(())
}

/// Run the admin server for health/readiness checks and metrics.
pub async fn run_admin_server(listener: TcpListener, state: Services) -> Result<()> {
    info!(
        "server: admin listening, addr={}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
