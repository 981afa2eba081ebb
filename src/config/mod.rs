pub mod types;


pub use types::*;

use crate::error::WraithError;
use std::path::Path;

impl WraithConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. When the file does not
    /// exist, built-in defaults are used — allowing the gateway to start with
    /// zero configuration for local development.
    pub fn load(path: &Path) -> Result<Self, WraithError> {
        let mut config: WraithConfig = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| WraithError::Config(format!("{}: {}", path.display(), e)))?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)
                    .map_err(|e| WraithError::Config(format!("{}: {}", path.display(), e)))?,
                Some("json") => serde_json::from_str(&content)
                    .map_err(|e| WraithError::Config(format!("{}: {}", path.display(), e)))?,
                Some(ext) => {
                    return Err(WraithError::Config(format!(
                        "unsupported config format: .{ext}, use .toml or .json"
                    )))
                }
                None => {
                    return Err(WraithError::Config(
                        "config file has no extension, use .toml or .json".to_string(),
                    ))
                }
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            WraithConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides for listener settings. Business
    /// config (routes, upstreams, limits) comes from the file only.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WRAITH_BIND_ADDRESS") {
            self.server.bind_address = v;
        }
        if let Ok(v) = std::env::var("WRAITH_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.server.port = n;
            }
        }
        if let Ok(v) = std::env::var("WRAITH_ADMIN_LISTEN") {
            self.server.admin_listen = v;
        }
        if let Ok(v) = std::env::var("WRAITH_STATIC_ROOT") {
            self.static_files.root = v.into();
        }
    }

    pub fn validate(&self) -> Result<(), WraithError> {
        if self.server.port == 0 {
            return Err(WraithError::Config("server.port must be 1-65535".into()));
        }
        if self.server.max_connections == 0 {
            return Err(WraithError::Config(
                "server.max_connections must be positive".into(),
            ));
        }
        if !self.server.enable_http1 && !self.server.enable_http2 && !self.server.enable_http3 {
            return Err(WraithError::Config(
                "at least one protocol must be enabled".into(),
            ));
        }

        for v in [&self.tls.min_version, &self.tls.max_version] {
            if v != "tls12" && v != "tls13" {
                return Err(WraithError::Config(format!(
                    "tls version must be tls12 or tls13, got {v:?}"
                )));
            }
        }
        if self.tls.min_version == "tls13" && self.tls.max_version == "tls12" {
            return Err(WraithError::Config(
                "tls.min_version exceeds tls.max_version".into(),
            ));
        }

        if self.static_files.enabled && self.static_files.root.as_os_str().is_empty() {
            return Err(WraithError::Config(
                "static_files.root must be set when static_files.enabled".into(),
            ));
        }

        let rl = &self.security.rate_limiting;
        if rl.enabled && rl.requests_per_minute == 0 {
            return Err(WraithError::Config(
                "security.rate_limiting.requests_per_minute must be positive".into(),
            ));
        }
        for ip in rl.whitelist.iter().chain(rl.blacklist.iter()) {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err(WraithError::Config(format!(
                    "invalid IP in rate_limiting access list: {ip:?}"
                )));
            }
        }

        if self.proxy.enabled {
            if self.proxy.upstreams.is_empty() {
                return Err(WraithError::Config(
                    "proxy.enabled requires at least one upstream".into(),
                ));
            }
            let mut seen = std::collections::HashSet::new();
            for up in &self.proxy.upstreams {
                if up.name.is_empty() {
                    return Err(WraithError::Config("upstream name cannot be empty".into()));
                }
                if !seen.insert(up.name.as_str()) {
                    return Err(WraithError::Config(format!(
                        "duplicate upstream name {:?}",
                        up.name
                    )));
                }
                if up.port == 0 {
                    return Err(WraithError::Config(format!(
                        "upstream {:?}: port must be 1-65535",
                        up.name
                    )));
                }
                if up.weight == 0 {
                    return Err(WraithError::Config(format!(
                        "upstream {:?}: weight must be >= 1",
                        up.name
                    )));
                }
            }
            let hc = &self.proxy.health_check;
            if hc.enabled && hc.timeout >= hc.interval {
                return Err(WraithError::Config(
                    "proxy.health_check.timeout must be strictly less than interval".into(),
                ));
            }
        }

        for route in &self.routes {
            validate_route(route, &self.proxy)?;
        }

        Ok(())
    }
}

fn validate_route(route: &RouteConfig, proxy: &ProxyConfig) -> Result<(), WraithError> {
    if route.path.is_empty() || !route.path.starts_with('/') {
        return Err(WraithError::Config(format!(
            "route path must start with '/', got {:?}",
            route.path
        )));
    }
    match route.kind.as_str() {
        "static" | "websocket" => {}
        "proxy" => {
            if let Some(ref name) = route.upstream {
                if !proxy.upstreams.iter().any(|u| &u.name == name) {
                    return Err(WraithError::Config(format!(
                        "route {:?} pins unknown upstream {:?}",
                        route.path, name
                    )));
                }
            }
        }
        "redirect" => {
            if route.location.is_none() {
                return Err(WraithError::Config(format!(
                    "redirect route {:?} requires a location",
                    route.path
                )));
            }
            if !(300..400).contains(&route.redirect_code) {
                return Err(WraithError::Config(format!(
                    "redirect route {:?}: code {} is not a 3xx status",
                    route.path, route.redirect_code
                )));
            }
        }
        "api" => match route.handler.as_deref() {
            Some("health") | Some("status") => {}
            other => {
                return Err(WraithError::Config(format!(
                    "api route {:?}: unknown handler {:?}",
                    route.path, other
                )))
            }
        },
        other => {
            return Err(WraithError::Config(format!(
                "route {:?}: unknown kind {:?}",
                route.path, other
            )))
        }
    }

    let method = route.method.to_uppercase();
    if method != "ANY" && method.parse::<http::Method>().is_err() {
        return Err(WraithError::Config(format!(
            "route {:?}: invalid method {:?}",
            route.path, route.method
        )));
    }

    for hm in &route.headers {
        match hm.match_type.as_str() {
            "exact" | "prefix" | "present" => {}
            "regex" => {
                regex::Regex::new(&hm.value).map_err(|e| {
                    WraithError::Config(format!(
                        "route {:?}: invalid header regex {:?}: {}",
                        route.path, hm.value, e
                    ))
                })?;
            }
            other => {
                return Err(WraithError::Config(format!(
                    "route {:?}: unknown header match_type {:?}",
                    route.path, other
                )))
            }
        }
    }

    Ok(())
}
