use super::Services;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::sync::atomic::Ordering;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn handle_admin(
    req: Request<Incoming>,
    state: Services,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        "/upstreams" => {
            let members: Vec<serde_json::Value> = state
                .upstreams
                .snapshot()
                .iter()
                .map(|u| {
                    serde_json::json!({
                        "name": u.name,
                        "address": u.address,
                        "weight": u.weight,
                        "backup": u.backup,
                        "healthy": u.is_healthy(),
                        "current_fails": u.current_fails(),
                        "active_connections": u.active_connections.load(Ordering::Acquire),
                        "total_requests": u.total_requests.load(Ordering::Acquire),
                    })
                })
                .collect();

            let pool = state.connections.load();
            let body = serde_json::json!({
                "upstreams": members,
                "connection_pool": {
                    "hits": pool.hits(),
                    "misses": pool.misses(),
                    "idle": pool.idle_count(),
                },
            });
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(
                    serde_json::to_string_pretty(&body).unwrap_or_default(),
                ))
                .unwrap())
        }

        "/routes" => {
            let table = state.routing.load();
            let routes: Vec<serde_json::Value> = table
                .all_routes()
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "name": r.name,
                        "kind": r.kind.label(),
                        "priority": r.priority,
                        "host": r.host,
                    })
                })
                .collect();

            let body = serde_json::to_string_pretty(&routes).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
