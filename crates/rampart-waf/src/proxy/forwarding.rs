//! Forwarding requests to upstreams.
//!
//! Upstream selection walks a fixed priority: the `X-Next-Upstream` header
//! (when trusted), a per-call override, the domain default, then the global
//! default; any unparseable step falls through. Each retry attempt uses a
//! freshly acquired connection with linear backoff, a failed connection is
//! closed on the spot, and exhausting the budget synthesizes a 502 JSON
//! body with the retry diagnostics.

use super::client::UpstreamTarget;
use super::pool::{PoolKey, PoolManager};
use crate::error::WafError;
use crate::responses::{full_body, upstream_failure_json, ResponseBody};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{HeaderMap, Method, Response};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const RETRY_BACKOFF_STEP: Duration = Duration::from_millis(50);

/// Hop-by-hop request headers that never travel upstream.
const STRIPPED_REQUEST_HEADERS: [&str; 4] = ["connection", "keep-alive", "accept-encoding", "host"];

/// Response headers owned by the relay, not copied from the upstream.
const STRIPPED_RESPONSE_HEADERS: [&str; 3] = ["transfer-encoding", "connection", "content-length"];

/// Everything the forwarder needs to know beyond the request itself.
#[derive(Debug, Clone, Default)]
pub struct ForwardOptions {
    /// `X-Next-Upstream` value, already gated by the trust setting.
    pub header_override: Option<String>,
    /// Per-call override (admin/test hook).
    pub call_override: Option<String>,
    pub domain_upstream: Option<String>,
    pub global_upstream: Option<String>,
    pub preserve_original_host: bool,
    pub custom_host_header: Option<String>,
    pub verify_tls: bool,
    pub max_retries: u32,
    pub read_timeout: Duration,
}

/// Resolve the upstream by priority, skipping unparseable candidates.
pub fn select_upstream(options: &ForwardOptions) -> Option<UpstreamTarget> {
    [
        options.header_override.as_deref(),
        options.call_override.as_deref(),
        options.domain_upstream.as_deref(),
        options.global_upstream.as_deref(),
    ]
    .into_iter()
    .flatten()
    .find_map(UpstreamTarget::parse)
}

/// The Host header to send upstream.
pub fn upstream_host_header(
    options: &ForwardOptions,
    target: &UpstreamTarget,
    original_host: Option<&str>,
) -> String {
    if options.preserve_original_host {
        if let Some(host) = original_host {
            return host.to_string();
        }
    }
    if let Some(custom) = options.custom_host_header.as_deref() {
        if !custom.is_empty() {
            return custom.to_string();
        }
    }
    target.authority()
}

fn build_upstream_request(
    method: &Method,
    path_and_query: &str,
    headers: &HeaderMap,
    host_header: &str,
    body: Bytes,
) -> Result<hyper::Request<Full<Bytes>>, WafError> {
    let mut builder = hyper::Request::builder()
        .method(method.clone())
        .uri(path_and_query);

    // Copy headers verbatim minus the hop-by-hop set; Host is set per
    // policy below.
    for (name, value) in headers.iter() {
        if STRIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if name.as_str() == "x-next-upstream" {
            continue; // never leaks upstream
        }
        builder = builder.header(name, value);
    }
    builder = builder.header(hyper::header::HOST, host_header);

    builder
        .body(Full::new(body))
        .map_err(|e| WafError::UpstreamIo(format!("building upstream request: {e}")))
}

/// Forward with retries. Returns the relayed (or synthesized 502) response
/// plus the number of attempts that failed.
pub async fn forward(
    manager: &Arc<PoolManager>,
    method: &Method,
    path_and_query: &str,
    headers: &HeaderMap,
    original_host: Option<&str>,
    body: Bytes,
    options: &ForwardOptions,
) -> (Response<ResponseBody>, u32) {
    let target = match select_upstream(options) {
        Some(t) => t,
        None => {
            warn!("no upstream configured for request");
            return (
                upstream_failure_json("no upstream configured", 0),
                0,
            );
        }
    };

    let host_header = upstream_host_header(options, &target, original_host);
    let key = PoolKey {
        target: target.clone(),
        verify_tls: options.verify_tls,
    };
    let max_attempts = options.max_retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            crate::metrics::record_backend_retry();
            tokio::time::sleep(RETRY_BACKOFF_STEP * (attempt - 1)).await;
        }

        let request = match build_upstream_request(
            method,
            path_and_query,
            headers,
            &host_header,
            body.clone(),
        ) {
            Ok(r) => r,
            Err(e) => {
                // Structural, not transient: retrying cannot help.
                warn!(error = %e, "failed to build upstream request");
                return (upstream_failure_json(&e.to_string(), attempt - 1), attempt - 1);
            }
        };

        // Every attempt acquires its own connection.
        let mut lease = match manager.acquire(key.clone()).await {
            Ok(l) => l,
            Err(e) => {
                debug!(attempt, error = %e, upstream = %target, "upstream connect failed");
                last_error = e.to_string();
                continue;
            }
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(options.read_timeout, async {
            let response = lease.connection().send(request).await?;
            let (parts, incoming) = response.into_parts();
            let collected = incoming
                .collect()
                .await
                .map_err(|e| WafError::UpstreamIo(e.to_string()))?;
            Ok::<_, WafError>((parts, collected.to_bytes()))
        })
        .await;

        match outcome {
            Ok(Ok((parts, response_body))) => {
                crate::metrics::record_backend_request(started.elapsed().as_secs_f64());
                lease.release();
                return (relay_response(parts, response_body), attempt - 1);
            }
            Ok(Err(e)) => {
                debug!(attempt, error = %e, upstream = %target, "upstream request failed");
                last_error = e.to_string();
                // Lease drops here: the connection is closed, never pooled.
            }
            Err(_) => {
                debug!(attempt, upstream = %target, "upstream read timed out");
                last_error = format!("read timeout after {:?}", options.read_timeout);
            }
        }
    }

    crate::metrics::record_backend_error();
    warn!(upstream = %target, retries = max_attempts, error = %last_error, "upstream unreachable after retries");
    (upstream_failure_json(&last_error, max_attempts), max_attempts)
}

/// Copy status and headers (minus relay-owned ones) and pipe the body.
fn relay_response(
    parts: hyper::http::response::Parts,
    body: Bytes,
) -> Response<ResponseBody> {
    let mut response = Response::builder().status(parts.status);
    for (name, value) in parts.headers.iter() {
        if STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        response = response.header(name, value);
    }
    response
        .body(full_body(body))
        .unwrap_or_else(|_| upstream_failure_json("invalid upstream response", 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionPoolingConfig;
    use crate::memory::MemoryTracker;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn options(upstream: &str) -> ForwardOptions {
        ForwardOptions {
            global_upstream: Some(upstream.to_string()),
            verify_tls: true,
            max_retries: 3,
            read_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn manager() -> Arc<PoolManager> {
        PoolManager::new(
            ConnectionPoolingConfig {
                pool_size: 2,
                acquire_timeout_ms: 50,
                idle_timeout_secs: 300,
                connect_timeout_secs: 1,
                read_timeout_secs: 5,
                max_retries: 3,
            },
            Arc::new(MemoryTracker::new()),
        )
    }

    #[test]
    fn test_select_upstream_priority() {
        let mut opts = ForwardOptions {
            header_override: Some("http://header:1/".into()),
            call_override: Some("http://call:2/".into()),
            domain_upstream: Some("http://domain:3/".into()),
            global_upstream: Some("http://global:4/".into()),
            ..Default::default()
        };
        assert_eq!(select_upstream(&opts).unwrap().host, "header");

        opts.header_override = None;
        assert_eq!(select_upstream(&opts).unwrap().host, "call");

        opts.call_override = None;
        assert_eq!(select_upstream(&opts).unwrap().host, "domain");

        opts.domain_upstream = None;
        assert_eq!(select_upstream(&opts).unwrap().host, "global");

        opts.global_upstream = None;
        assert!(select_upstream(&opts).is_none());
    }

    #[test]
    fn test_select_upstream_skips_unparseable() {
        let opts = ForwardOptions {
            header_override: Some("not a url".into()),
            domain_upstream: Some("http://domain:3/".into()),
            ..Default::default()
        };
        assert_eq!(select_upstream(&opts).unwrap().host, "domain");
    }

    #[test]
    fn test_host_header_policy() {
        let target = UpstreamTarget::parse("http://backend:8080/").unwrap();

        // (a) preserve original host
        let opts = ForwardOptions {
            preserve_original_host: true,
            custom_host_header: Some("custom.example".into()),
            ..Default::default()
        };
        assert_eq!(
            upstream_host_header(&opts, &target, Some("client.example")),
            "client.example"
        );

        // (b) custom header when not preserving
        let opts = ForwardOptions {
            custom_host_header: Some("custom.example".into()),
            ..Default::default()
        };
        assert_eq!(
            upstream_host_header(&opts, &target, Some("client.example")),
            "custom.example"
        );

        // (c) upstream authority fallback
        let opts = ForwardOptions::default();
        assert_eq!(
            upstream_host_header(&opts, &target, Some("client.example")),
            "backend:8080"
        );

        // (a) with no original host falls through to (b)/(c)
        let opts = ForwardOptions {
            preserve_original_host: true,
            ..Default::default()
        };
        assert_eq!(upstream_host_header(&opts, &target, None), "backend:8080");
    }

    #[test]
    fn test_request_header_hygiene() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("accept-encoding", "gzip".parse().unwrap());
        headers.insert("host", "client.example".parse().unwrap());
        headers.insert("x-next-upstream", "http://evil:1/".parse().unwrap());
        headers.insert("x-custom", "kept".parse().unwrap());
        headers.insert("user-agent", "curl/8.0".parse().unwrap());

        let req = build_upstream_request(
            &Method::GET,
            "/path?q=1",
            &headers,
            "backend:8080",
            Bytes::new(),
        )
        .unwrap();

        assert!(req.headers().get("connection").is_none());
        assert!(req.headers().get("keep-alive").is_none());
        assert!(req.headers().get("accept-encoding").is_none());
        assert!(req.headers().get("x-next-upstream").is_none());
        assert_eq!(req.headers().get("host").unwrap(), "backend:8080");
        assert_eq!(req.headers().get("x-custom").unwrap(), "kept");
        assert_eq!(req.headers().get("user-agent").unwrap(), "curl/8.0");
        assert_eq!(req.uri().to_string(), "/path?q=1");
    }

    async fn spawn_upstream(response: &'static [u8]) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {
                                let _ = socket.write_all(response).await;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_forward_relays_upstream_response() {
        let addr = spawn_upstream(
            b"HTTP/1.1 201 Created\r\ncontent-length: 7\r\nx-app: yes\r\nconnection: close\r\n\r\ncreated",
        )
        .await;
        let manager = manager();
        let opts = options(&format!("http://{addr}/"));

        let (response, failed) = forward(
            &manager,
            &Method::POST,
            "/items",
            &HeaderMap::new(),
            None,
            Bytes::from_static(b"{}"),
            &opts,
        )
        .await;

        assert_eq!(failed, 0);
        assert_eq!(response.status(), 201);
        assert_eq!(response.headers().get("x-app").unwrap(), "yes");
        // Relay-owned headers are not copied through.
        assert!(response.headers().get("connection").is_none());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"created");
    }

    #[tokio::test]
    async fn test_forward_unreachable_synthesizes_502() {
        let manager = manager();
        let opts = options("http://127.0.0.1:1/");

        let (response, failed) = forward(
            &manager,
            &Method::GET,
            "/",
            &HeaderMap::new(),
            None,
            Bytes::new(),
            &opts,
        )
        .await;

        assert_eq!(response.status(), 502);
        assert_eq!(failed, 3);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["retries"], 3);
        assert_eq!(parsed["error"], "upstream unavailable");
    }

    #[tokio::test]
    async fn test_forward_without_upstream_is_502() {
        let manager = manager();
        let opts = ForwardOptions {
            max_retries: 3,
            read_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let (response, _) = forward(
            &manager,
            &Method::GET,
            "/",
            &HeaderMap::new(),
            None,
            Bytes::new(),
            &opts,
        )
        .await;
        assert_eq!(response.status(), 502);
    }
}
