use crate::config::{HeaderMatcherConfig, RouteConfig, WraithConfig};
use crate::error::WraithError;
use http::Method;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Path pattern compiled from config.
///
/// - `Literal`: full string equality.
/// - `Prefix`: pattern ended with `/*`; matches when the request path
///   starts with the stored prefix. The remainder is not captured — the
///   static handler consumes the request path directly.
/// - `Params`: `:name` segments capture the raw request segment; literal
///   segments equal-compare; segment counts must match exactly.
#[derive(Debug, Clone)]
pub enum PathPattern {
    Literal(String),
    Prefix(String),
    Params(Vec<PatternSegment>),
}

#[derive(Debug, Clone)]
pub enum PatternSegment {
    Literal(String),
    Param(String),
}

impl PathPattern {
    pub fn parse(raw: &str) -> Self {
        if let Some(prefix) = raw.strip_suffix("/*") {
            // "/*" keeps "/" as its prefix so it matches everything.
            let prefix = if prefix.is_empty() { "/" } else { prefix };
            return PathPattern::Prefix(prefix.to_string());
        }
        if raw.split('/').any(|s| s.starts_with(':')) {
            let segments = raw
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.strip_prefix(':') {
                    Some(name) => PatternSegment::Param(name.to_string()),
                    None => PatternSegment::Literal(s.to_string()),
                })
                .collect();
            return PathPattern::Params(segments);
        }
        PathPattern::Literal(raw.to_string())
    }

    /// Match a request path. `Some` carries captured params (empty for
    /// literal and prefix patterns).
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        match self {
            PathPattern::Literal(lit) => (path == lit).then(HashMap::new),
            PathPattern::Prefix(prefix) => path.starts_with(prefix.as_str()).then(HashMap::new),
            PathPattern::Params(segments) => {
                let req_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
                if req_segments.len() != segments.len() {
                    return None;
                }
                let mut params = HashMap::new();
                for (pat, req) in segments.iter().zip(req_segments.iter()) {
                    match pat {
                        PatternSegment::Literal(lit) => {
                            if lit != req {
                                return None;
                            }
                        }
                        PatternSegment::Param(name) => {
                            if req.is_empty() {
                                return None;
                            }
                            params.insert(name.clone(), (*req).to_string());
                        }
                    }
                }
                Some(params)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum MethodFilter {
    Any,
    Exact(Method),
}

impl MethodFilter {
    fn parse(raw: &str) -> Result<Self, WraithError> {
        let upper = raw.to_uppercase();
        if upper == "ANY" {
            return Ok(MethodFilter::Any);
        }
        upper
            .parse::<Method>()
            .map(MethodFilter::Exact)
            .map_err(|_| WraithError::Config(format!("invalid method {raw:?}")))
    }

    pub fn matches(&self, method: &Method) -> bool {
        match self {
            MethodFilter::Any => true,
            MethodFilter::Exact(m) => m == method,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiHandler {
    Health,
    Status,
}

/// Handler selector — a tagged sum so the route table stays a plain
/// copyable value that can be swapped wholesale on reload.
#[derive(Debug, Clone)]
pub enum RouteKind {
    Static,
    Proxy { upstream: Option<String> },
    Redirect { location: String, code: http::StatusCode },
    Api { handler: ApiHandler },
    WebSocket,
}

impl RouteKind {
    pub fn label(&self) -> &'static str {
        match self {
            RouteKind::Static => "static",
            RouteKind::Proxy { .. } => "proxy",
            RouteKind::Redirect { .. } => "redirect",
            RouteKind::Api { .. } => "api",
            RouteKind::WebSocket => "websocket",
        }
    }
}

/// Compiled header matcher. AND semantics across a route's matchers.
#[derive(Debug)]
pub struct HeaderMatcher {
    pub name: String,
    kind: HeaderMatchKind,
    invert: bool,
}

#[derive(Debug)]
enum HeaderMatchKind {
    Exact(String),
    Prefix(String),
    Regex(regex::Regex),
    Present,
}

impl HeaderMatcher {
    fn compile(cfg: &HeaderMatcherConfig) -> Result<Self, WraithError> {
        let kind = match cfg.match_type.as_str() {
            "exact" => HeaderMatchKind::Exact(cfg.value.clone()),
            "prefix" => HeaderMatchKind::Prefix(cfg.value.clone()),
            "regex" => HeaderMatchKind::Regex(regex::Regex::new(&cfg.value).map_err(|e| {
                WraithError::Config(format!("invalid header regex {:?}: {}", cfg.value, e))
            })?),
            "present" => HeaderMatchKind::Present,
            other => {
                return Err(WraithError::Config(format!(
                    "unknown header match_type {other:?}"
                )))
            }
        };
        Ok(Self {
            name: cfg.name.to_ascii_lowercase(),
            kind,
            invert: cfg.invert,
        })
    }

    pub fn matches(&self, value: Option<&str>) -> bool {
        let hit = match (&self.kind, value) {
            (HeaderMatchKind::Exact(want), Some(v)) => v == want,
            (HeaderMatchKind::Prefix(want), Some(v)) => v.starts_with(want.as_str()),
            (HeaderMatchKind::Regex(re), Some(v)) => re.is_match(v),
            (HeaderMatchKind::Present, Some(_)) => true,
            (_, None) => false,
        };
        hit != self.invert
    }
}

/// One compiled route. Immutable after the table is built.
#[derive(Debug)]
pub struct Route {
    pub pattern: PathPattern,
    pub host: Option<String>,
    pub method: MethodFilter,
    pub priority: u8,
    pub kind: RouteKind,
    pub header_matchers: Vec<HeaderMatcher>,
    /// Label used in logs and metrics: "<kind> <path>".
    pub name: String,
}

impl Route {
    fn compile(cfg: &RouteConfig) -> Result<Self, WraithError> {
        let kind = match cfg.kind.as_str() {
            "static" => RouteKind::Static,
            "proxy" => RouteKind::Proxy {
                upstream: cfg.upstream.clone(),
            },
            "redirect" => RouteKind::Redirect {
                location: cfg
                    .location
                    .clone()
                    .ok_or_else(|| WraithError::Config("redirect route without location".into()))?,
                code: http::StatusCode::from_u16(cfg.redirect_code).map_err(|_| {
                    WraithError::Config(format!("invalid redirect code {}", cfg.redirect_code))
                })?,
            },
            "api" => RouteKind::Api {
                handler: match cfg.handler.as_deref() {
                    Some("health") => ApiHandler::Health,
                    Some("status") => ApiHandler::Status,
                    other => {
                        return Err(WraithError::Config(format!(
                            "unknown api handler {other:?}"
                        )))
                    }
                },
            },
            "websocket" => RouteKind::WebSocket,
            other => return Err(WraithError::Config(format!("unknown route kind {other:?}"))),
        };

        let header_matchers = cfg
            .headers
            .iter()
            .map(HeaderMatcher::compile)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: format!("{} {}", cfg.kind, cfg.path),
            pattern: PathPattern::parse(&cfg.path),
            host: cfg.host.as_ref().map(|h| h.to_ascii_lowercase()),
            method: MethodFilter::parse(&cfg.method)?,
            priority: cfg.priority,
            kind,
            header_matchers,
        })
    }
}

/// Snapshot of one incoming request as presented to the router.
pub struct RoutingRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub host: &'a str,
    pub headers: &'a http::HeaderMap,
    pub client_addr: IpAddr,
}

/// Result of a successful match.
pub struct RouteDecision {
    pub route: Arc<Route>,
    pub params: HashMap<String, String>,
}

/// The active route table — a totally ordered sequence, higher priority
/// first, ties broken by declaration order. Matching is a linear scan
/// returning the first hit; for a given table the same request always
/// yields the same decision. Built once at load, swapped wholesale on
/// reload behind an `ArcSwap`.
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new(configs: &[RouteConfig]) -> Result<Self, WraithError> {
        let mut routes = configs
            .iter()
            .map(Route::compile)
            .collect::<Result<Vec<_>, _>>()?;

        // Stable sort keeps declaration order within a priority tier.
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));

        tracing::info!("routing: compiled route table, count={}", routes.len());

        Ok(Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        })
    }

    /// Build the table from the loaded config, synthesizing the default
    /// table when no routes are declared.
    pub fn from_config(cfg: &WraithConfig) -> Result<Self, WraithError> {
        if !cfg.routes.is_empty() {
            return Self::new(&cfg.routes);
        }
        Self::new(&synthesize_default_routes(cfg))
    }

    pub fn match_route(&self, req: &RoutingRequest<'_>) -> Option<RouteDecision> {
        // Host header may carry a port; the match is on the name alone.
        let req_host = req.host.split(':').next().unwrap_or(req.host);

        for route in &self.routes {
            if !route.method.matches(req.method) {
                continue;
            }
            if let Some(ref want) = route.host {
                if !req_host.eq_ignore_ascii_case(want) {
                    continue;
                }
            }
            if !route.header_matchers.is_empty() {
                let all = route.header_matchers.iter().all(|hm| {
                    let value = req.headers.get(&hm.name).and_then(|v| v.to_str().ok());
                    hm.matches(value)
                });
                if !all {
                    continue;
                }
            }
            if let Some(params) = route.pattern.matches(req.path) {
                return Some(RouteDecision {
                    route: route.clone(),
                    params,
                });
            }
        }
        None
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn all_routes(&self) -> &[Arc<Route>] {
        &self.routes
    }
}

/// Default table when the config declares no routes: reserved api
/// endpoints first, then the broadest enabled handler.
fn synthesize_default_routes(cfg: &WraithConfig) -> Vec<RouteConfig> {
    let mut routes = Vec::new();

    for (path, handler) in [("/health", "health"), ("/status", "status")] {
        routes.push(RouteConfig {
            path: path.to_string(),
            host: None,
            method: "GET".to_string(),
            priority: 255,
            kind: "api".to_string(),
            upstream: None,
            location: None,
            redirect_code: 301,
            handler: Some(handler.to_string()),
            headers: vec![],
        });
    }

    if cfg.proxy.enabled {
        routes.push(RouteConfig {
            path: "/*".to_string(),
            host: None,
            method: "ANY".to_string(),
            priority: 0,
            kind: "proxy".to_string(),
            upstream: None,
            location: None,
            redirect_code: 301,
            handler: None,
            headers: vec![],
        });
    } else if cfg.static_files.enabled {
        routes.push(RouteConfig {
            path: "/*".to_string(),
            host: None,
            method: "GET".to_string(),
            priority: 0,
            kind: "static".to_string(),
            upstream: None,
            location: None,
            redirect_code: 301,
            handler: None,
            headers: vec![],
        });
    }

    routes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_route(path: &str, kind: &str, priority: u8) -> RouteConfig {
        RouteConfig {
            path: path.to_string(),
            host: None,
            method: "ANY".to_string(),
            priority,
            kind: kind.to_string(),
            upstream: None,
            location: if kind == "redirect" {
                Some("/new".to_string())
            } else {
                None
            },
            redirect_code: 301,
            handler: if kind == "api" {
                Some("health".to_string())
            } else {
                None
            },
            headers: vec![],
        }
    }

    fn empty_headers() -> http::HeaderMap {
        http::HeaderMap::new()
    }

    fn request<'a>(
        method: &'a Method,
        path: &'a str,
        host: &'a str,
        headers: &'a http::HeaderMap,
    ) -> RoutingRequest<'a> {
        RoutingRequest {
            method,
            path,
            host,
            headers,
            client_addr: "127.0.0.1".parse().unwrap(),
        }
    }

    #[test]
    fn test_literal_match() {
        let table = RouteTable::new(&[make_route("/api/login", "proxy", 0)]).unwrap();
        let headers = empty_headers();

        let decision = table
            .match_route(&request(&Method::GET, "/api/login", "any.com", &headers))
            .unwrap();
        assert_eq!(decision.route.name, "proxy /api/login");
        assert!(decision.params.is_empty());

        assert!(table
            .match_route(&request(&Method::GET, "/api/login/extra", "any.com", &headers))
            .is_none());
    }

    #[test]
    fn test_prefix_wildcard_match() {
        let table = RouteTable::new(&[make_route("/assets/*", "static", 0)]).unwrap();
        let headers = empty_headers();

        assert!(table
            .match_route(&request(&Method::GET, "/assets/css/app.css", "h", &headers))
            .is_some());
        assert!(table
            .match_route(&request(&Method::GET, "/other", "h", &headers))
            .is_none());
    }

    #[test]
    fn test_catchall_matches_everything() {
        let table = RouteTable::new(&[make_route("/*", "static", 0)]).unwrap();
        let headers = empty_headers();
        assert!(table
            .match_route(&request(&Method::GET, "/", "h", &headers))
            .is_some());
        assert!(table
            .match_route(&request(&Method::GET, "/deep/nested/path", "h", &headers))
            .is_some());
    }

    #[test]
    fn test_param_capture() {
        let table = RouteTable::new(&[make_route("/users/:id/posts/:post", "proxy", 0)]).unwrap();
        let headers = empty_headers();

        let decision = table
            .match_route(&request(&Method::GET, "/users/42/posts/7", "h", &headers))
            .unwrap();
        assert_eq!(decision.params["id"], "42");
        assert_eq!(decision.params["post"], "7");

        // Segment counts must match exactly — no residual segments.
        assert!(table
            .match_route(&request(&Method::GET, "/users/42/posts", "h", &headers))
            .is_none());
        assert!(table
            .match_route(&request(&Method::GET, "/users/42/posts/7/extra", "h", &headers))
            .is_none());
    }

    #[test]
    fn test_param_literal_segments_must_equal() {
        let table = RouteTable::new(&[make_route("/users/:id/posts", "proxy", 0)]).unwrap();
        let headers = empty_headers();
        assert!(table
            .match_route(&request(&Method::GET, "/users/42/comments", "h", &headers))
            .is_none());
    }

    #[test]
    fn test_method_filter() {
        let mut post_only = make_route("/api/submit", "proxy", 10);
        post_only.method = "POST".to_string();
        let table = RouteTable::new(&[post_only, make_route("/*", "static", 0)]).unwrap();
        let headers = empty_headers();

        let decision = table
            .match_route(&request(&Method::POST, "/api/submit", "h", &headers))
            .unwrap();
        assert_eq!(decision.route.name, "proxy /api/submit");

        // GET falls through to the catch-all.
        let decision = table
            .match_route(&request(&Method::GET, "/api/submit", "h", &headers))
            .unwrap();
        assert_eq!(decision.route.name, "static /*");
    }

    #[test]
    fn test_host_filter_case_insensitive() {
        let mut hosted = make_route("/*", "proxy", 10);
        hosted.host = Some("API.Example.com".to_string());
        let table = RouteTable::new(&[hosted, make_route("/*", "static", 0)]).unwrap();
        let headers = empty_headers();

        let decision = table
            .match_route(&request(&Method::GET, "/x", "api.example.COM:8443", &headers))
            .unwrap();
        assert_eq!(decision.route.name, "proxy /*");

        let decision = table
            .match_route(&request(&Method::GET, "/x", "other.com", &headers))
            .unwrap();
        assert_eq!(decision.route.name, "static /*");
    }

    #[test]
    fn test_priority_order() {
        let table = RouteTable::new(&[
            make_route("/api/*", "static", 0),
            make_route("/api/*", "proxy", 10),
        ])
        .unwrap();
        let headers = empty_headers();
        let decision = table
            .match_route(&request(&Method::GET, "/api/x", "h", &headers))
            .unwrap();
        assert_eq!(decision.route.name, "proxy /api/*");
    }

    #[test]
    fn test_equal_priority_keeps_declaration_order() {
        let table = RouteTable::new(&[
            make_route("/api/*", "proxy", 5),
            make_route("/api/*", "static", 5),
        ])
        .unwrap();
        let headers = empty_headers();
        let decision = table
            .match_route(&request(&Method::GET, "/api/x", "h", &headers))
            .unwrap();
        assert_eq!(decision.route.name, "proxy /api/*");
    }

    #[test]
    fn test_determinism_swapping_non_conflicting_equal_priority() {
        // Two equal-priority routes with disjoint patterns: order must not
        // affect which requests match which route.
        let a = make_route("/a/*", "proxy", 5);
        let b = make_route("/b/*", "static", 5);
        let headers = empty_headers();

        let t1 = RouteTable::new(&[a.clone(), b.clone()]).unwrap();
        let t2 = RouteTable::new(&[b, a]).unwrap();

        for path in ["/a/x", "/b/y"] {
            let d1 = t1
                .match_route(&request(&Method::GET, path, "h", &headers))
                .unwrap();
            let d2 = t2
                .match_route(&request(&Method::GET, path, "h", &headers))
                .unwrap();
            assert_eq!(d1.route.name, d2.route.name);
        }
    }

    #[test]
    fn test_no_match_returns_none() {
        let table = RouteTable::new(&[make_route("/api/*", "proxy", 0)]).unwrap();
        let headers = empty_headers();
        assert!(table
            .match_route(&request(&Method::GET, "/nope", "h", &headers))
            .is_none());
    }

    #[test]
    fn test_header_matchers() {
        let mut canary = make_route("/api/*", "proxy", 10);
        canary.headers = vec![HeaderMatcherConfig {
            name: "X-Canary".to_string(),
            value: String::new(),
            match_type: "present".to_string(),
            invert: false,
        }];
        let table = RouteTable::new(&[canary, make_route("/api/*", "static", 0)]).unwrap();

        let mut headers = empty_headers();
        headers.insert("x-canary", "1".parse().unwrap());
        let decision = table
            .match_route(&request(&Method::GET, "/api/x", "h", &headers))
            .unwrap();
        assert_eq!(decision.route.name, "proxy /api/*");

        let headers = empty_headers();
        let decision = table
            .match_route(&request(&Method::GET, "/api/x", "h", &headers))
            .unwrap();
        assert_eq!(decision.route.name, "static /api/*");
    }

    #[test]
    fn test_redirect_route_compiles() {
        let table = RouteTable::new(&[make_route("/old", "redirect", 0)]).unwrap();
        let headers = empty_headers();
        let decision = table
            .match_route(&request(&Method::GET, "/old", "h", &headers))
            .unwrap();
        match &decision.route.kind {
            RouteKind::Redirect { location, code } => {
                assert_eq!(location, "/new");
                assert_eq!(*code, http::StatusCode::MOVED_PERMANENTLY);
            }
            other => panic!("expected redirect, got {:?}", other),
        }
    }

    #[test]
    fn test_synthesized_default_table() {
        let mut cfg = WraithConfig::default();
        cfg.static_files.enabled = true;
        let table = RouteTable::from_config(&cfg).unwrap();
        let headers = empty_headers();

        let decision = table
            .match_route(&request(&Method::GET, "/health", "h", &headers))
            .unwrap();
        assert!(matches!(decision.route.kind, RouteKind::Api { .. }));

        let decision = table
            .match_route(&request(&Method::GET, "/anything", "h", &headers))
            .unwrap();
        assert!(matches!(decision.route.kind, RouteKind::Static));
    }
}
