use crate::error::WraithError;
use crate::proxy::connection::{ConnectionPool, PooledConnection};
use crate::proxy::context::BoxBody;
use crate::upstream::{ActiveGuard, Upstream};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONNECTION, TRANSFER_ENCODING};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming};
use hyper::{Request, Response};
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, warn};

static PROXIED_BY: &str = concat!("Wraith/", env!("CARGO_PKG_VERSION"));

/// Forward a client request to `upstream`, streaming both bodies.
///
/// Counter discipline: `total_requests` is bumped before dispatch;
/// `active_connections` is held by an RAII guard that travels with the
/// response body, so it is decremented exactly once — when the body is
/// fully relayed, errors out, or is dropped by a client cancellation.
///
/// The pooled connection is released only after the response body
/// completes; every error path drops it instead, so a broken connection
/// never re-enters the pool.
pub async fn forward(
    pool: Arc<ConnectionPool>,
    upstream: Arc<Upstream>,
    req: Request<BoxBody>,
    read_timeout: Duration,
) -> Result<Response<BoxBody>, WraithError> {
    upstream.total_requests.fetch_add(1, Ordering::AcqRel);
    let guard = ActiveGuard::new(upstream.clone());

    let (parts, body) = req.into_parts();

    // Origin-form request target for the upstream hop.
    let uri_pq = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());

    let mut headers = parts.headers;
    remove_hop_headers(&mut headers);
    headers.insert(
        HeaderName::from_static("x-proxied-by"),
        HeaderValue::from_static(PROXIED_BY),
    );

    let mut builder = Request::builder().method(parts.method.clone()).uri(&uri_pq);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let upstream_req = builder
        .body(body)
        .map_err(|e| WraithError::Internal(format!("building upstream request: {}", e)))?;

    let mut conn = match pool.acquire(&upstream.address).await {
        Ok(c) => c,
        Err(e) => {
            upstream.record_failure();
            warn!(
                "forward: acquire failed, upstream={}, addr={}, error={}",
                upstream.name, upstream.address, e
            );
            return Err(e);
        }
    };

    // Read timeout covers readiness, request write, and the wait for
    // response headers. Body stalls afterwards surface as stream errors
    // at the transport layer.
    let result = tokio::time::timeout(read_timeout, async {
        conn.sender().ready().await?;
        conn.sender().send_request(upstream_req).await
    })
    .await;

    let resp = match result {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            upstream.record_failure();
            warn!(
                "forward: upstream error, upstream={}, addr={}, error={}",
                upstream.name, upstream.address, e
            );
            // Partial response then drop reads as an incomplete message.
            if e.is_incomplete_message() {
                return Err(WraithError::PeerReset);
            }
            return Err(WraithError::UpstreamConnect(e.to_string()));
        }
        Err(_) => {
            upstream.record_failure();
            warn!(
                "forward: upstream timeout, upstream={}, addr={}",
                upstream.name, upstream.address
            );
            return Err(WraithError::UpstreamTimeout);
        }
    };

    // The upstream answered — any status, 5xx included, is a success for
    // the health state machine and is forwarded unchanged.
    upstream.record_success();

    let (mut parts, body) = resp.into_parts();
    remove_hop_headers(&mut parts.headers);

    let addr = upstream.address.clone();
    let reclaim_body = ReclaimBody {
        inner: body,
        reclaim: Some(Reclaim {
            pool,
            addr,
            conn,
            _active: guard,
        }),
    };

    Ok(Response::from_parts(parts, reclaim_body.boxed()))
}

/// Hop-by-hop headers are scoped to one connection and stripped in both
/// directions.
pub(crate) fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

struct Reclaim {
    pool: Arc<ConnectionPool>,
    addr: String,
    conn: PooledConnection,
    _active: ActiveGuard,
}

/// Response-body passthrough that returns the pooled connection when the
/// upstream body ends cleanly. Errors and drops (client cancellation)
/// discard the connection and the active-connection guard with it —
/// backpressure is inherited from the inner body's polling.
struct ReclaimBody {
    inner: Incoming,
    reclaim: Option<Reclaim>,
}

impl Body for ReclaimBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame))),
            Poll::Ready(Some(Err(e))) => {
                // Broken mid-stream: the connection must not be reused.
                if this.reclaim.take().is_some() {
                    debug!("forward: response stream error, connection discarded");
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(r) = this.reclaim.take() {
                    r.pool.release(&r.addr, r.conn);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        self.inner.size_hint()
    }
}
