use crate::config::{SecurityHeadersConfig, StaticFilesConfig};
use crate::error::WraithError;
use crate::proxy::context::{empty_body, full_body, BoxBody};
use bytes::Bytes;
use dashmap::DashMap;
use http::header::{
    HeaderValue, ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE, ETAG,
    IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, VARY,
};
use http::StatusCode;
use hyper::Response;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Sanitize a request path into a root-relative path.
///
/// Segments are split on `/`; empty and `.` segments are dropped; `..`
/// pops the stack but never below the root. Control characters reject
/// the whole path — the caller answers 404, never 500, so the root is
/// not probeable.
pub fn sanitize_path(raw: &str) -> Option<PathBuf> {
    if raw.bytes().any(|b| b < 0x20 || b == 0x7f) {
        return None;
    }

    let mut stack: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            s => stack.push(s),
        }
    }
    Some(stack.iter().collect())
}

/// One cached file, raw and optionally pre-compressed. `(mtime, size)`
/// is revalidated against the filesystem on every hit.
pub struct CachedFile {
    pub body: Bytes,
    pub gzip: Option<Bytes>,
    pub content_type: String,
    pub etag: String,
    pub mtime: SystemTime,
    pub size: u64,
}

/// Validation cache for the static file subsystem.
///
/// Key: canonical absolute file path. A hit whose `(mtime, size)` no
/// longer matches the file's current stat is invalidated and reloaded
/// before serving, so two concurrent requests at the same mtime always
/// see identical bytes and an identical ETag.
pub struct FileCache {
    entries: DashMap<PathBuf, std::sync::Arc<CachedFile>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for FileCache {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serve `request_path` from under the configured root.
    pub async fn serve(
        &self,
        cfg: &StaticFilesConfig,
        headers_cfg: &SecurityHeadersConfig,
        request_path: &str,
        req_headers: &http::HeaderMap,
    ) -> Result<Response<BoxBody>, WraithError> {
        let rel = sanitize_path(request_path).ok_or(WraithError::UnsafePath)?;

        let root = tokio::fs::canonicalize(&cfg.root)
            .await
            .map_err(|_| WraithError::StaticNotFound)?;
        let candidate = root.join(&rel);

        let meta = tokio::fs::metadata(&candidate)
            .await
            .map_err(|_| WraithError::StaticNotFound)?;

        let file_path = if meta.is_dir() {
            match resolve_index(&candidate, &cfg.index_files).await {
                Some(p) => p,
                None if cfg.autoindex => {
                    return autoindex_listing(&candidate, request_path, headers_cfg).await;
                }
                None => return Err(WraithError::StaticNotFound),
            }
        } else {
            candidate
        };

        // Symlinks may point anywhere; the canonical path must stay under
        // the root or the file does not exist as far as clients know.
        let canonical = tokio::fs::canonicalize(&file_path)
            .await
            .map_err(|_| WraithError::StaticNotFound)?;
        if !canonical.starts_with(&root) {
            debug!(
                "static: path escapes root, path={}, root={}",
                canonical.display(),
                root.display()
            );
            return Err(WraithError::UnsafePath);
        }

        let entry = self.load(cfg, &canonical).await?;

        // Conditional requests.
        if cfg.etag {
            if let Some(inm) = req_headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
                if inm == entry.etag {
                    return Ok(not_modified(&entry, cfg, headers_cfg));
                }
            }
        }
        if let Some(ims) = req_headers
            .get(IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
        {
            // Parse failures mean "modified" — serve the full body.
            if let Ok(since) = httpdate::parse_http_date(ims) {
                let mtime_secs = truncate_to_secs(entry.mtime);
                if mtime_secs <= since {
                    return Ok(not_modified(&entry, cfg, headers_cfg));
                }
            }
        }

        // Content negotiation: the compressed variant is chosen at serve
        // time from Accept-Encoding; gzip is the only supported coding.
        let accept = req_headers
            .get(ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let use_gzip = entry.gzip.is_some() && accepts_gzip(accept);

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, &entry.content_type)
            .header(CACHE_CONTROL, &cfg.cache_control)
            .header(
                LAST_MODIFIED,
                httpdate::fmt_http_date(truncate_to_secs(entry.mtime)),
            );
        if cfg.etag {
            builder = builder.header(ETAG, &entry.etag);
        }
        if entry.gzip.is_some() {
            builder = builder.header(VARY, "accept-encoding");
        }
        if use_gzip {
            builder = builder.header(CONTENT_ENCODING, "gzip");
        }
        builder = apply_security_headers(builder, headers_cfg);

        let body = if use_gzip {
            entry.gzip.clone().unwrap()
        } else {
            entry.body.clone()
        };

        builder
            .body(full_body(body))
            .map_err(|e| WraithError::Internal(e.to_string()))
    }

    /// Fetch from cache, revalidating `(mtime, size)` against the current
    /// stat; a mismatch invalidates and reloads.
    async fn load(
        &self,
        cfg: &StaticFilesConfig,
        canonical: &Path,
    ) -> Result<std::sync::Arc<CachedFile>, WraithError> {
        let meta = tokio::fs::metadata(canonical)
            .await
            .map_err(|_| WraithError::StaticNotFound)?;
        let mtime = meta.modified().map_err(WraithError::StaticRead)?;
        let size = meta.len();

        if let Some(entry) = self.entries.get(canonical) {
            if entry.mtime == mtime && entry.size == size {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("wraith_static_cache_hits_total").increment(1);
                return Ok(entry.value().clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("wraith_static_cache_misses_total").increment(1);

        let bytes = match tokio::fs::read(canonical).await {
            Ok(b) => Bytes::from(b),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.entries.remove(canonical);
                return Err(WraithError::StaticNotFound);
            }
            Err(e) => return Err(WraithError::StaticRead(e)),
        };

        let content_type = mime_guess::from_path(canonical)
            .first_or_octet_stream()
            .to_string();

        let etag = compute_etag(canonical, size, mtime);

        let gzip = if cfg.compression && is_compressible(&content_type) {
            let compressed = gzip_bytes(&bytes).await?;
            // Keep the variant only when it actually saves bytes.
            (compressed.len() < bytes.len()).then(|| Bytes::from(compressed))
        } else {
            None
        };

        let entry = std::sync::Arc::new(CachedFile {
            body: bytes,
            gzip,
            content_type,
            etag,
            mtime,
            size,
        });
        self.entries.insert(canonical.to_path_buf(), entry.clone());
        debug!(
            "static: cached, path={}, size={}, compressed={}",
            canonical.display(),
            size,
            entry.gzip.is_some()
        );
        Ok(entry)
    }
}

/// ETag: quoted lowercase hex of sha256(path ‖ size ‖ mtime seconds).
fn compute_etag(path: &Path, size: u64, mtime: SystemTime) -> String {
    let mtime_secs = mtime
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut hasher = Sha256::new();
    hasher.update(path.display().to_string().as_bytes());
    hasher.update(size.to_string().as_bytes());
    hasher.update(mtime_secs.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(66);
    out.push('"');
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out.push('"');
    out
}

/// HTTP dates carry second precision; compare mtimes at the same grain.
fn truncate_to_secs(t: SystemTime) -> SystemTime {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(d.as_secs()),
        Err(_) => SystemTime::UNIX_EPOCH,
    }
}

async fn resolve_index(dir: &Path, index_files: &[String]) -> Option<PathBuf> {
    for name in index_files {
        let candidate = dir.join(name);
        if let Ok(meta) = tokio::fs::metadata(&candidate).await {
            if meta.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Names-only HTML listing. No sizes, owners, or mtimes.
async fn autoindex_listing(
    dir: &Path,
    request_path: &str,
    headers_cfg: &SecurityHeadersConfig,
) -> Result<Response<BoxBody>, WraithError> {
    let mut reader = tokio::fs::read_dir(dir)
        .await
        .map_err(|_| WraithError::StaticNotFound)?;

    let mut names: Vec<String> = Vec::new();
    while let Ok(Some(entry)) = reader.next_entry().await {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();

    let mut html = String::with_capacity(256 + names.len() * 48);
    html.push_str("<!DOCTYPE html>\n<html><head><title>Index of ");
    html.push_str(&escape_html(request_path));
    html.push_str("</title></head>\n<body><h1>Index of ");
    html.push_str(&escape_html(request_path));
    html.push_str("</h1>\n<ul>\n");
    for name in &names {
        let escaped = escape_html(name);
        html.push_str("<li><a href=\"");
        html.push_str(&escaped);
        html.push_str("\">");
        html.push_str(&escaped);
        html.push_str("</a></li>\n");
    }
    html.push_str("</ul>\n</body></html>\n");

    let builder = apply_security_headers(
        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/html; charset=utf-8"),
        headers_cfg,
    );
    builder
        .body(full_body(html))
        .map_err(|e| WraithError::Internal(e.to_string()))
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn not_modified(
    entry: &CachedFile,
    cfg: &StaticFilesConfig,
    headers_cfg: &SecurityHeadersConfig,
) -> Response<BoxBody> {
    let mut builder = Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .header(CACHE_CONTROL, &cfg.cache_control);
    if cfg.etag {
        builder = builder.header(ETAG, &entry.etag);
    }
    builder = apply_security_headers(builder, headers_cfg);
    builder.body(empty_body()).unwrap()
}

/// Every static response carries nosniff and frame denial; HSTS and CSP
/// only when configured.
fn apply_security_headers(
    mut builder: http::response::Builder,
    headers_cfg: &SecurityHeadersConfig,
) -> http::response::Builder {
    builder = builder
        .header("x-content-type-options", "nosniff")
        .header("x-frame-options", "DENY");
    if let Some(ref hsts) = headers_cfg.hsts {
        if let Ok(v) = HeaderValue::from_str(hsts) {
            builder = builder.header("strict-transport-security", v);
        }
    }
    if let Some(ref csp) = headers_cfg.csp {
        if let Ok(v) = HeaderValue::from_str(csp) {
            builder = builder.header("content-security-policy", v);
        }
    }
    builder
}

fn is_compressible(content_type: &str) -> bool {
    content_type.starts_with("text/")
        || content_type.starts_with("application/json")
        || content_type.starts_with("application/javascript")
        || content_type.starts_with("application/xml")
        || content_type.starts_with("image/svg+xml")
}

/// Accept-Encoding negotiation, gzip only. Quality values are honored:
/// `gzip;q=0` does not select gzip.
fn accepts_gzip(accept_encoding: &str) -> bool {
    for part in accept_encoding.split(',') {
        let part = part.trim();
        let mut tokens = part.splitn(2, ';');
        let encoding = tokens.next().unwrap_or("").trim().to_ascii_lowercase();

        let q: f32 = tokens
            .next()
            .and_then(|params| {
                params.split(';').find_map(|p| {
                    let p = p.trim();
                    p.strip_prefix("q=")
                        .and_then(|v| v.trim().parse::<f32>().ok())
                })
            })
            .unwrap_or(1.0);

        if q <= 0.0 {
            continue;
        }
        if encoding == "gzip" || encoding == "*" {
            return true;
        }
    }
    false
}

async fn gzip_bytes(input: &Bytes) -> Result<Vec<u8>, WraithError> {
    let mut encoder =
        async_compression::tokio::bufread::GzipEncoder::new(tokio::io::BufReader::new(&input[..]));
    let mut out = Vec::with_capacity(input.len() / 2);
    encoder
        .read_to_end(&mut out)
        .await
        .map_err(WraithError::StaticRead)?;
    Ok(out)
}
