use crate::config::WraithConfig;
use crate::error::WraithError;
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use crate::proxy::forwarder;
use crate::routing::{ApiHandler, RouteDecision, RouteKind, RoutingRequest};
use crate::server::Services;
use http::header::{CONTENT_LENGTH, HOST, LOCATION};
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Handle one incoming request through the phased lifecycle:
///
/// 1. BURST       — packet-rate window (before admission touches buckets)
/// 2. ADMISSION   — token buckets, blocklist, size ceiling
/// 3. ROUTE_MATCH — priority table scan
/// 4. DISPATCH    — static | redirect | api | websocket | proxy
/// 5. LOG         — access line + metrics finalization
///
/// Every short-circuit still emits a response and releases whatever the
/// earlier phases acquired.
pub async fn handle_request(
    req: Request<Incoming>,
    state: Services,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let cfg = state.config.load_full();

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let uri_path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();

    // Real client IP: trust the left-most X-Forwarded-For entry when a
    // front terminator added one, else the TCP peer.
    let client_ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip());

    let mut ctx = RequestContext::new(host, uri_path, method, client_ip);

    // Burst tracker runs before admission consults any bucket.
    if !state
        .burst
        .packet_allowed(&cfg.security.ddos_protection, client_ip)
        .await
    {
        debug!("pipeline: packet window exceeded, client={}", client_ip);
        metrics::counter!("wraith_admission_rejected_total", "reason" => "burst")
            .increment(1);
        return Ok(ctx.wraith_error_response(&WraithError::BurstLimit));
    }

    // Admission.
    if cfg.security.rate_limiting.enabled {
        let request_size = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let decision = state
            .admission
            .check(&cfg.security.rate_limiting, client_ip, request_size)
            .await;
        if !decision.allowed {
            let reason = decision.reason.map(|r| r.as_str()).unwrap_or("unknown");
            debug!(
                "pipeline: admission denied, client={}, reason={}",
                client_ip, reason
            );
            metrics::counter!("wraith_admission_rejected_total", "reason" => reason)
                .increment(1);
            let err = decision
                .into_error()
                .unwrap_or_else(|| WraithError::Internal("denied without reason".into()));
            return Ok(ctx.wraith_error_response(&err));
        }
    }

    // Route match.
    let decision = {
        let table = state.routing.load();
        table.match_route(&RoutingRequest {
            method: req.method(),
            path: &ctx.uri_path,
            host: &ctx.host,
            headers: req.headers(),
            client_addr: client_ip,
        })
    };
    let decision = match decision {
        Some(d) => d,
        None => {
            debug!(
                "pipeline: no route matched, host={}, path={}",
                ctx.host, ctx.uri_path
            );
            return Ok(ctx.wraith_error_response(&WraithError::NoRouteMatch));
        }
    };

    ctx.route_name = decision.route.name.clone();
    metrics::gauge!(
        "wraith_http_requests_in_flight",
        "route" => ctx.route_name.clone(),
    )
    .increment(1.0);

    let resp = dispatch(req, &mut ctx, &state, &cfg, &decision).await;

    phase_log(&ctx, &resp);
    ctx.finalize_metrics(resp.status().as_u16());

    Ok(resp)
}

async fn dispatch(
    req: Request<Incoming>,
    ctx: &mut RequestContext,
    state: &Services,
    cfg: &WraithConfig,
    decision: &RouteDecision,
) -> Response<BoxBody> {
    match &decision.route.kind {
        RouteKind::Static => {
            match state
                .static_cache
                .serve(
                    &cfg.static_files,
                    &cfg.security.headers,
                    &ctx.uri_path,
                    req.headers(),
                )
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    if matches!(e, WraithError::StaticRead(_)) {
                        warn!("pipeline: static read failed, path={}, error={}", ctx.uri_path, e);
                    }
                    error_response(&e)
                }
            }
        }

        RouteKind::Redirect { location, code } => Response::builder()
            .status(*code)
            .header(LOCATION, location)
            .body(full_body(""))
            .unwrap_or_else(|_| plain_json(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")),

        RouteKind::Api { handler } => match handler {
            ApiHandler::Health => health_response(cfg),
            ApiHandler::Status => status_response(cfg, state),
        },

        RouteKind::WebSocket => {
            // Upgrade tunneling lives at the transport boundary.
            plain_json(StatusCode::NOT_IMPLEMENTED, "websocket upgrade not supported")
        }

        RouteKind::Proxy { upstream } => proxy_dispatch(req, ctx, state, cfg, upstream.as_deref()).await,
    }
}

async fn proxy_dispatch(
    req: Request<Incoming>,
    ctx: &mut RequestContext,
    state: &Services,
    cfg: &WraithConfig,
    pinned: Option<&str>,
) -> Response<BoxBody> {
    if !cfg.proxy.enabled {
        warn!("pipeline: proxy route hit with proxy disabled, route={}", ctx.route_name);
        return error_response(&WraithError::ResourceExhausted);
    }

    let healthy = state.upstreams.healthy_set();

    let upstream = match pinned {
        Some(name) => healthy.iter().find(|u| u.name == name).cloned(),
        None => state.balancer.load().select(&healthy, &ctx.client_ip),
    };
    let upstream = match upstream {
        Some(u) => u,
        None => {
            warn!("pipeline: no healthy upstream, route={}", ctx.route_name);
            return error_response(&WraithError::NoHealthyUpstreams);
        }
    };

    ctx.upstream_addr = upstream.address.clone();
    ctx.upstream_start = Some(Instant::now());

    // Re-box the streaming client body for the upstream hop; headers and
    // target pass through untouched (the forwarder owns the hop-by-hop
    // filter and the x-proxied-by stamp).
    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(parts.uri);
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }
    let upstream_req = match builder.body(body.boxed()) {
        Ok(r) => r,
        Err(e) => {
            warn!("pipeline: building upstream request failed, error={}", e);
            return plain_json(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
        }
    };

    let pool = state.connections.load_full();
    let read_timeout = Duration::from_secs_f64(cfg.proxy.timeout.read);
    let deadline = Duration::from_secs_f64(cfg.proxy.timeout.request);

    // The full-request deadline bounds the wait for upstream response
    // headers; body streaming afterwards is paced by the client.
    let result = tokio::time::timeout(
        deadline,
        forwarder::forward(pool, upstream.clone(), upstream_req, read_timeout),
    )
    .await;

    match result {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => error_response(&e),
        Err(_) => {
            upstream.record_failure();
            warn!(
                "pipeline: request deadline exceeded, route={}, upstream={}",
                ctx.route_name, ctx.upstream_addr
            );
            error_response(&WraithError::UpstreamTimeout)
        }
    }
}

fn plain_json(status: StatusCode, msg: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
        .unwrap()
}

/// Error response without touching the in-flight gauge or counters — the
/// dispatch caller finalizes metrics for every outcome exactly once.
fn error_response(err: &WraithError) -> Response<BoxBody> {
    let mut resp = plain_json(err.status(), err.public_message());
    if let Some(secs) = err.retry_after() {
        if secs != crate::error::RETRY_AFTER_FOREVER {
            if let Ok(v) = http::HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert(http::header::RETRY_AFTER, v);
            }
        }
    }
    resp
}

fn health_response(cfg: &WraithConfig) -> Response<BoxBody> {
    let (protocol, transport) = protocol_surface(cfg);
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(full_body(format!(
            r#"{{"status":"ok","protocol":"{}","transport":"{}"}}"#,
            protocol, transport
        )))
        .unwrap()
}

fn status_response(cfg: &WraithConfig, state: &Services) -> Response<BoxBody> {
    let (protocol, transport) = protocol_surface(cfg);
    let uptime_secs = state.uptime().as_secs();
    let body = serde_json::json!({
        "server": format!("{}:{}", cfg.server.bind_address, cfg.server.port),
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": protocol,
        "transport": transport,
        "tls": {
            "min_version": cfg.tls.min_version,
            "max_version": cfg.tls.max_version,
            "auto_cert": cfg.tls.auto_cert,
        },
        "uptime": humantime::format_duration(Duration::from_secs(uptime_secs)).to_string(),
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(full_body(body.to_string()))
        .unwrap()
}

/// The wire protocol the configured transport surface advertises. The
/// data plane itself is protocol-agnostic.
fn protocol_surface(cfg: &WraithConfig) -> (&'static str, &'static str) {
    if cfg.server.enable_http3 {
        ("HTTP/3", "QUIC")
    } else if cfg.server.enable_http2 {
        ("HTTP/2", "TCP")
    } else {
        ("HTTP/1.1", "TCP")
    }
}

/// Structured access log — one line per routed request at info level.
fn phase_log(ctx: &RequestContext, resp: &Response<BoxBody>) {
    let total_ms = ctx.start.elapsed().as_millis();
    let upstream_ms = ctx
        .upstream_start
        .map(|s| s.elapsed().as_millis())
        .unwrap_or(0);

    tracing::info!(
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        host = %ctx.host,
        path = %ctx.uri_path,
        status = resp.status().as_u16(),
        route = %ctx.route_name,
        upstream = %ctx.upstream_addr,
        latency_ms = %total_ms,
        upstream_ms = %upstream_ms,
        "access"
    );
}
