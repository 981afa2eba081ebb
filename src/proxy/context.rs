use crate::error::{WraithError, RETRY_AFTER_FOREVER};
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request context that flows through all pipeline stages. Carries
/// request metadata and accumulates state for the access log and metrics.
pub struct RequestContext {
    pub host: String,
    pub uri_path: String,
    pub method: String,
    pub route_name: String,
    pub upstream_addr: String,
    /// The downstream client IP (TCP peer or trusted X-Forwarded-For).
    pub client_ip: IpAddr,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl RequestContext {
    pub fn new(host: String, uri_path: String, method: String, client_ip: IpAddr) -> Self {
        Self {
            host,
            uri_path,
            method,
            route_name: String::new(),
            upstream_addr: String::new(),
            client_ip,
            start: Instant::now(),
            upstream_start: None,
        }
    }

    /// Build a JSON error response and record metrics in one place —
    /// the single exit point for every error path.
    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status.as_u16());

        metrics::counter!(
            "wraith_http_requests_total",
            "route" => self.route_name.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "upstream_addr" => self.upstream_addr.clone(),
        )
        .increment(1);

        metrics::histogram!(
            "wraith_http_request_duration_seconds",
            "route" => self.route_name.clone(),
            "upstream_addr" => self.upstream_addr.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if !self.route_name.is_empty() {
            metrics::gauge!(
                "wraith_http_requests_in_flight",
                "route" => self.route_name.clone(),
            )
            .decrement(1.0);
        }

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "wraith_upstream_request_duration_seconds",
                "route" => self.route_name.clone(),
                "upstream_addr" => self.upstream_addr.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }

        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
            .unwrap()
    }

    /// Error response for a classified `WraithError`, carrying
    /// `Retry-After` when the error projects one.
    pub fn wraith_error_response(&self, err: &WraithError) -> hyper::Response<BoxBody> {
        let mut resp = self.error_response(err.status(), err.public_message());
        if let Some(secs) = err.retry_after() {
            if secs != RETRY_AFTER_FOREVER {
                if let Ok(v) = http::HeaderValue::from_str(&secs.to_string()) {
                    resp.headers_mut().insert(http::header::RETRY_AFTER, v);
                }
            }
        }
        resp
    }

    /// Record final metrics for a delivered response.
    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "wraith_http_requests_total",
            "route" => self.route_name.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "upstream_addr" => self.upstream_addr.clone(),
        )
        .increment(1);

        metrics::histogram!(
            "wraith_http_request_duration_seconds",
            "route" => self.route_name.clone(),
            "upstream_addr" => self.upstream_addr.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "wraith_upstream_request_duration_seconds",
                "route" => self.route_name.clone(),
                "upstream_addr" => self.upstream_addr.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }

        metrics::gauge!(
            "wraith_http_requests_in_flight",
            "route" => self.route_name.clone(),
        )
        .decrement(1.0);
    }
}
