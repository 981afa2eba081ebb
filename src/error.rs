use http::StatusCode;
use std::fmt;

/// Sentinel retry-after for permanent denials (blacklist). The pipeline
/// suppresses the `Retry-After` header when it sees this value.
pub const RETRY_AFTER_FOREVER: u64 = u64::MAX;

#[derive(Debug)]
pub enum WraithError {
    RateLimited { retry_after: u64 },
    Blocked { retry_after: u64 },
    Blacklisted,
    GlobalLimit { retry_after: u64 },
    RequestTooLarge,
    BurstLimit,
    NoRouteMatch,
    UnsafePath,
    StaticNotFound,
    StaticRead(std::io::Error),
    NoHealthyUpstreams,
    UpstreamConnect(String),
    UpstreamTimeout,
    PeerReset,
    ResourceExhausted,
    Bind(String),
    Config(String),
    Internal(String),
}

impl fmt::Display for WraithError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WraithError::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {}s", retry_after)
            }
            WraithError::Blocked { retry_after } => {
                write!(f, "client blocked, retry after {}s", retry_after)
            }
            WraithError::Blacklisted => write!(f, "client blacklisted"),
            WraithError::GlobalLimit { retry_after } => {
                write!(f, "global rate limit, retry after {}s", retry_after)
            }
            WraithError::RequestTooLarge => write!(f, "request too large"),
            WraithError::BurstLimit => write!(f, "burst limit exceeded"),
            WraithError::NoRouteMatch => write!(f, "no route matched"),
            WraithError::UnsafePath => write!(f, "unsafe path"),
            WraithError::StaticNotFound => write!(f, "file not found"),
            WraithError::StaticRead(e) => write!(f, "file read error: {}", e),
            WraithError::NoHealthyUpstreams => write!(f, "no healthy upstreams"),
            WraithError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            WraithError::UpstreamTimeout => write!(f, "upstream timeout"),
            WraithError::PeerReset => write!(f, "upstream reset mid-response"),
            WraithError::ResourceExhausted => write!(f, "resource exhausted"),
            WraithError::Bind(msg) => write!(f, "bind failed: {}", msg),
            WraithError::Config(msg) => write!(f, "config error: {}", msg),
            WraithError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for WraithError {}

impl WraithError {
    /// The status code surfaced to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            WraithError::RateLimited { .. }
            | WraithError::Blocked { .. }
            | WraithError::Blacklisted
            | WraithError::GlobalLimit { .. }
            | WraithError::RequestTooLarge
            | WraithError::BurstLimit => StatusCode::TOO_MANY_REQUESTS,
            WraithError::NoRouteMatch | WraithError::UnsafePath | WraithError::StaticNotFound => {
                StatusCode::NOT_FOUND
            }
            WraithError::StaticRead(_) => StatusCode::INTERNAL_SERVER_ERROR,
            WraithError::NoHealthyUpstreams
            | WraithError::UpstreamConnect(_)
            | WraithError::PeerReset => StatusCode::BAD_GATEWAY,
            WraithError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            WraithError::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
            WraithError::Bind(_) | WraithError::Config(_) | WraithError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Client-facing message. Never contains paths, addresses, or any
    /// internal detail — those stay in the log line.
    pub fn public_message(&self) -> &'static str {
        match self {
            WraithError::RateLimited { .. } => "rate limited",
            WraithError::Blocked { .. } => "blocked",
            WraithError::Blacklisted => "forbidden",
            WraithError::GlobalLimit { .. } => "rate limited",
            WraithError::RequestTooLarge => "request too large",
            WraithError::BurstLimit => "too many requests",
            WraithError::NoRouteMatch | WraithError::UnsafePath | WraithError::StaticNotFound => {
                "Not Found"
            }
            WraithError::StaticRead(_) => "internal server error",
            WraithError::NoHealthyUpstreams | WraithError::UpstreamConnect(_) => "bad gateway",
            WraithError::UpstreamTimeout => "gateway timeout",
            WraithError::PeerReset => "bad gateway",
            WraithError::ResourceExhausted => "service unavailable",
            WraithError::Bind(_) | WraithError::Config(_) | WraithError::Internal(_) => {
                "internal server error"
            }
        }
    }

    /// Seconds the client should wait before retrying, when meaningful.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            WraithError::RateLimited { retry_after }
            | WraithError::Blocked { retry_after }
            | WraithError::GlobalLimit { retry_after } => Some(*retry_after),
            WraithError::RequestTooLarge => Some(0),
            WraithError::BurstLimit => Some(1),
            WraithError::Blacklisted => Some(RETRY_AFTER_FOREVER),
            _ => None,
        }
    }
}
