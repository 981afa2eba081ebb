use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WraithConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub static_files: StaticFilesConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Declarative routing table. When empty, a default table is
    /// synthesized: `/health` + `/status` api routes, then a `/*` proxy
    /// route (when the proxy is enabled) or a `/*` static route (when
    /// static files are enabled).
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound on simultaneously accepted connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_true")]
    pub enable_http3: bool,

    #[serde(default = "default_true")]
    pub enable_http2: bool,

    #[serde(default = "default_true")]
    pub enable_http1: bool,

    /// Admin API listen address (health/metrics introspection).
    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,

    /// Written by `serve`, consumed by the `reload` / `stop` subcommands.
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_connections: default_max_connections(),
            enable_http3: true,
            enable_http2: true,
            enable_http1: true,
            admin_listen: default_admin_listen(),
            pidfile: None,
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_connections() -> usize {
    10_000
}

fn default_admin_listen() -> String {
    "127.0.0.1:9091".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub auto_cert: bool,

    /// "tls12" or "tls13".
    #[serde(default = "default_tls_min")]
    pub min_version: String,

    #[serde(default = "default_tls_max")]
    pub max_version: String,

    /// Ordered ALPN identifiers offered by the transport.
    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,

    /// Directory for the ACME account key and issued-certificate cache.
    #[serde(default)]
    pub cert_dir: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            auto_cert: false,
            min_version: default_tls_min(),
            max_version: default_tls_max(),
            alpn: default_alpn(),
            cert_dir: None,
        }
    }
}

fn default_tls_min() -> String {
    "tls12".to_string()
}

fn default_tls_max() -> String {
    "tls13".to_string()
}

fn default_alpn() -> Vec<String> {
    vec!["h3".to_string(), "h2".to_string(), "http/1.1".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticFilesConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_static_root")]
    pub root: PathBuf,

    #[serde(default = "default_true")]
    pub compression: bool,

    #[serde(default = "default_cache_control")]
    pub cache_control: String,

    #[serde(default = "default_true")]
    pub etag: bool,

    #[serde(default)]
    pub autoindex: bool,

    /// Tried in order when the resolved path is a directory.
    #[serde(default = "default_index_files")]
    pub index_files: Vec<String>,
}

impl Default for StaticFilesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            root: default_static_root(),
            compression: true,
            cache_control: default_cache_control(),
            etag: true,
            autoindex: false,
            index_files: default_index_files(),
        }
    }
}

fn default_static_root() -> PathBuf {
    PathBuf::from("./public")
}

fn default_cache_control() -> String {
    "public, max-age=3600".to_string()
}

fn default_index_files() -> Vec<String> {
    vec!["index.html".to_string(), "index.htm".to_string()]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub rate_limiting: RateLimitConfig,

    #[serde(default)]
    pub ddos_protection: DdosConfig,

    #[serde(default)]
    pub headers: SecurityHeadersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-client refill rate (tokens per minute).
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Per-client bucket capacity. 0 falls back to `requests_per_minute`.
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Process-wide refill rate shared by all clients. 0 disables the
    /// global bucket.
    #[serde(default = "default_global_rpm")]
    pub global_requests_per_minute: u64,

    #[serde(default = "default_max_request_size")]
    pub max_request_size: u64,

    #[serde(default = "default_true")]
    pub auto_block_enabled: bool,

    /// Consecutive bucket violations before a client is auto-blocked.
    #[serde(default = "default_auto_block_threshold")]
    pub auto_block_threshold: u32,

    /// Seconds a client stays blocked.
    #[serde(default = "default_block_duration")]
    pub block_duration: u64,

    /// Client IPs admitted unconditionally (no buckets consumed).
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub whitelist: Vec<String>,

    /// Client IPs denied unconditionally.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub blacklist: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: default_requests_per_minute(),
            burst: default_burst(),
            global_requests_per_minute: default_global_rpm(),
            max_request_size: default_max_request_size(),
            auto_block_enabled: true,
            auto_block_threshold: default_auto_block_threshold(),
            block_duration: default_block_duration(),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

fn default_requests_per_minute() -> u32 {
    300
}

fn default_burst() -> u32 {
    50
}

fn default_global_rpm() -> u64 {
    10_000
}

fn default_max_request_size() -> u64 {
    10 * 1024 * 1024
}

fn default_auto_block_threshold() -> u32 {
    1
}

fn default_block_duration() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdosConfig {
    /// Concurrent connection ceiling per client IP.
    #[serde(default = "default_max_conns_per_ip")]
    pub max_connections_per_ip: u32,

    /// New connections allowed per `window_size` seconds per client IP.
    #[serde(default = "default_connection_rate")]
    pub connection_rate_limit: u32,

    /// Requests allowed per one-second window per client IP.
    #[serde(default = "default_packet_rate")]
    pub packet_rate_limit: u32,

    /// Connection-window length in seconds.
    #[serde(default = "default_window_size")]
    pub window_size: u64,
}

impl Default for DdosConfig {
    fn default() -> Self {
        Self {
            max_connections_per_ip: default_max_conns_per_ip(),
            connection_rate_limit: default_connection_rate(),
            packet_rate_limit: default_packet_rate(),
            window_size: default_window_size(),
        }
    }
}

fn default_max_conns_per_ip() -> u32 {
    100
}

fn default_connection_rate() -> u32 {
    120
}

fn default_packet_rate() -> u32 {
    1000
}

fn default_window_size() -> u64 {
    60
}

/// HSTS and CSP are injected on static responses only when configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityHeadersConfig {
    #[serde(default)]
    pub hsts: Option<String>,

    #[serde(default)]
    pub csp: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub load_balancing: LoadBalancingPolicy,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub upstreams: Vec<UpstreamConfig>,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub timeout: ProxyTimeoutConfig,

    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingPolicy {
    #[default]
    RoundRobin,
    LeastConnections,
    IpHash,
    Random,
    Weighted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,

    pub address: String,

    pub port: u16,

    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Consecutive failures before the member turns Unhealthy.
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,

    /// Minimum seconds a member stays Unhealthy after crossing max_fails.
    #[serde(default = "default_fail_timeout")]
    pub fail_timeout: u64,

    /// Backup members are selected only when no primary is healthy.
    #[serde(default)]
    pub backup: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_max_fails() -> u32 {
    3
}

fn default_fail_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Probe interval in seconds.
    #[serde(default = "default_hc_interval")]
    pub interval: u64,

    /// Per-probe timeout in seconds. Must be strictly less than `interval`.
    #[serde(default = "default_hc_timeout")]
    pub timeout: u64,

    #[serde(default = "default_hc_path")]
    pub path: String,

    #[serde(default = "default_hc_status")]
    pub expected_status: u16,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_hc_interval(),
            timeout: default_hc_timeout(),
            path: default_hc_path(),
            expected_status: default_hc_status(),
        }
    }
}

fn default_hc_interval() -> u64 {
    10
}

fn default_hc_timeout() -> u64 {
    5
}

fn default_hc_path() -> String {
    "/health".to_string()
}

fn default_hc_status() -> u16 {
    200
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyTimeoutConfig {
    /// Upstream connection establishment (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect: f64,

    /// Upstream idle/read — first response byte and body stalls (seconds).
    #[serde(default = "default_read_timeout")]
    pub read: f64,

    /// Full-request deadline from admission to upstream response headers
    /// (seconds).
    #[serde(default = "default_request_timeout")]
    pub request: f64,
}

impl Default for ProxyTimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            read: default_read_timeout(),
            request: default_request_timeout(),
        }
    }
}

fn default_connect_timeout() -> f64 {
    5.0
}

fn default_read_timeout() -> f64 {
    30.0
}

fn default_request_timeout() -> f64 {
    60.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    /// Idle connections retained per upstream address.
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,

    /// Idle connections older than this are evicted on acquire (seconds).
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_max_idle_per_host(),
            max_idle_secs: default_max_idle_secs(),
        }
    }
}

fn default_max_idle_per_host() -> usize {
    8
}

fn default_max_idle_secs() -> u64 {
    60
}

/// One route table entry. Higher priority wins; ties keep declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Path pattern: literal (`/api/login`), prefix (`/assets/*`), or
    /// parameterized (`/users/:id/posts`).
    pub path: String,

    /// Case-insensitive exact host match. `None` matches any host.
    #[serde(default)]
    pub host: Option<String>,

    /// HTTP method or "ANY".
    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub priority: u8,

    /// "static", "proxy", "redirect", "api", "websocket".
    pub kind: String,

    /// Pins proxy routes to a named upstream, bypassing the balancer.
    #[serde(default)]
    pub upstream: Option<String>,

    /// Redirect target (required for redirect routes).
    #[serde(default)]
    pub location: Option<String>,

    #[serde(default = "default_redirect_code")]
    pub redirect_code: u16,

    /// Built-in handler for api routes: "health" or "status".
    #[serde(default)]
    pub handler: Option<String>,

    /// Header matchers (AND semantics).
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub headers: Vec<HeaderMatcherConfig>,
}

fn default_method() -> String {
    "ANY".to_string()
}

fn default_redirect_code() -> u16 {
    301
}

/// Supports exact (default), prefix, regex, and presence-only match.
/// Multiple matchers on a route use AND semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderMatcherConfig {
    pub name: String,

    /// Ignored when `match_type` is "present".
    #[serde(default)]
    pub value: String,

    /// "exact" (default), "prefix", "regex", "present".
    #[serde(default = "default_header_match_type")]
    pub match_type: String,

    #[serde(default)]
    pub invert: bool,
}

fn default_header_match_type() -> String {
    "exact".to_string()
}
