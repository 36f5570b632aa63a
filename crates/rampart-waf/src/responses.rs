//! Canned responses: block pages, rate-limit pages, gateway errors, and
//! the health endpoint body.

use crate::ratelimit::RateLimitResult;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::Response;
use std::convert::Infallible;

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Wrap a fixed body into the pipeline's response body type.
pub fn full_body<B: Into<Bytes>>(body: B) -> ResponseBody {
    BoxBody::new(Full::new(body.into()).map_err(|never: Infallible| match never {}))
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// 403 HTML for a WAF rule block (or observe-mode annotation page).
/// `score` carries `(total, threshold)` when scoring mode decided.
pub fn waf_block_response(
    rule_id: u32,
    message: &str,
    mode: &str,
    ray_id: &str,
    score: Option<(i32, i32)>,
) -> Response<ResponseBody> {
    let timestamp = Utc::now().to_rfc3339();
    let score_line = match score {
        Some((total, threshold)) => format!("<p>Score: {total}/{threshold}</p>"),
        None => String::new(),
    };
    let body = format!(
        r#"<!DOCTYPE html>
<html>
<head><title>403 Forbidden</title></head>
<body>
<h1>Request Blocked</h1>
<p>This request was blocked by the web application firewall.</p>
<p>Rule: {rule_id}</p>
<p>{msg}</p>
{score_line}<p>Mode: {mode}</p>
<p>Ray ID: {ray_id}</p>
<p>{timestamp}</p>
</body>
</html>
"#,
        msg = html_escape(message),
    );
    Response::builder()
        .status(403)
        .header("content-type", "text/html; charset=utf-8")
        .body(full_body(body))
        .expect("static response builds")
}

/// 403 JSON for IP-filter and GeoIP denials. `source` is "blacklist" for
/// the IP filter or "geoip" for the country gate.
pub fn forbidden_json(reason: &str, source: &str) -> Response<ResponseBody> {
    let body = serde_json::json!({
        "error": "Forbidden",
        "reason": reason,
        "source": source,
    })
    .to_string();
    Response::builder()
        .status(403)
        .header("content-type", "application/json")
        .body(full_body(body))
        .expect("static response builds")
}

/// 429 HTML with the rate-limit headers.
pub fn rate_limited_response(result: &RateLimitResult) -> Response<ResponseBody> {
    let body = format!(
        r#"<!DOCTYPE html>
<html>
<head><title>429 Too Many Requests</title></head>
<body>
<h1>Too Many Requests</h1>
<p>Rate limit of {limit} requests exceeded. Try again after {reset}.</p>
</body>
</html>
"#,
        limit = result.limit,
        reset = result.reset_at,
    );
    let mut builder = Response::builder()
        .status(429)
        .header("content-type", "text/html; charset=utf-8");
    builder = apply_rate_limit_headers(builder, result);
    builder.body(full_body(body)).expect("static response builds")
}

/// Attach `X-RateLimit-*` headers to any response builder.
pub fn apply_rate_limit_headers(
    builder: hyper::http::response::Builder,
    result: &RateLimitResult,
) -> hyper::http::response::Builder {
    let mut builder = builder
        .header("x-ratelimit-limit", result.limit.to_string())
        .header("x-ratelimit-remaining", result.remaining.to_string())
        .header("x-ratelimit-reset", result.reset_at.to_string());
    if let Some(until) = result.blocked_until {
        builder = builder.header("x-ratelimit-blocked-until", until.to_string());
    }
    builder
}

/// Attach `X-RateLimit-*` headers to an already-built response.
pub fn set_rate_limit_headers<B>(response: &mut Response<B>, result: &RateLimitResult) {
    let headers = response.headers_mut();
    if let Ok(v) = result.limit.to_string().parse() {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = result.remaining.to_string().parse() {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Ok(v) = result.reset_at.to_string().parse() {
        headers.insert("x-ratelimit-reset", v);
    }
    if let Some(until) = result.blocked_until {
        if let Ok(v) = until.to_string().parse() {
            headers.insert("x-ratelimit-blocked-until", v);
        }
    }
}

/// 502 HTML for unknown domains and unreachable upstreams.
pub fn bad_gateway_response(domain: &str, upstream: &str, message: &str) -> Response<ResponseBody> {
    let body = format!(
        r#"<!DOCTYPE html>
<html>
<head><title>502 Bad Gateway</title></head>
<body>
<h1>Bad Gateway</h1>
<p>Domain: {domain}</p>
<p>Upstream: {upstream}</p>
<p>{msg}</p>
</body>
</html>
"#,
        domain = html_escape(domain),
        upstream = html_escape(upstream),
        msg = html_escape(message),
    );
    Response::builder()
        .status(502)
        .header("content-type", "text/html; charset=utf-8")
        .body(full_body(body))
        .expect("static response builds")
}

/// 502 JSON carrying the retry diagnostics, synthesized when the proxy
/// exhausts its retries.
pub fn upstream_failure_json(detail: &str, retries: u32) -> Response<ResponseBody> {
    let body = serde_json::json!({
        "error": "upstream unavailable",
        "detail": detail,
        "retries": retries,
    })
    .to_string();
    Response::builder()
        .status(502)
        .header("content-type", "application/json")
        .body(full_body(body))
        .expect("static response builds")
}

/// 200 JSON for `/health`.
pub fn health_response(rules_loaded: usize, observe_mode: bool) -> Response<ResponseBody> {
    let body = serde_json::json!({
        "status": "healthy",
        "rules_loaded": rules_loaded,
        "observe_mode": observe_mode,
    })
    .to_string();
    Response::builder()
        .status(200)
        .header("content-type", "application/json")
        .body(full_body(body))
        .expect("static response builds")
}

/// Plain 404 for unregistered challenge tokens and the like.
pub fn not_found() -> Response<ResponseBody> {
    Response::builder()
        .status(404)
        .header("content-type", "text/plain")
        .body(full_body("Not Found\n"))
        .expect("static response builds")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_string(response: Response<ResponseBody>) -> String {
        let collected = response.into_body().collect().await.unwrap();
        String::from_utf8(collected.to_bytes().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_waf_block_contains_rule_and_score() {
        let resp = waf_block_response(942100, "SQL Injection", "enforce", "ray-1", Some((7, 5)));
        assert_eq!(resp.status(), 403);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/html; charset=utf-8"
        );
        let body = body_string(resp).await;
        assert!(body.contains("942100"));
        assert!(body.contains("SQL Injection"));
        assert!(body.contains("Score: 7/5"));
        assert!(body.contains("ray-1"));
    }

    #[tokio::test]
    async fn test_waf_block_without_score() {
        let resp = waf_block_response(1, "msg", "enforce", "ray", None);
        let body = body_string(resp).await;
        assert!(!body.contains("Score:"));
    }

    #[tokio::test]
    async fn test_block_page_escapes_message() {
        let resp = waf_block_response(1, "<script>alert(1)</script>", "enforce", "ray", None);
        let body = body_string(resp).await;
        assert!(!body.contains("<script>alert(1)"));
        assert!(body.contains("&lt;script&gt;"));
    }

    #[tokio::test]
    async fn test_forbidden_json_source() {
        let resp = forbidden_json("ip 10.2.3.4 blocked", "blacklist");
        assert_eq!(resp.status(), 403);
        let body = body_string(resp).await;
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["source"], "blacklist");
    }

    #[tokio::test]
    async fn test_rate_limited_response_headers() {
        let result = RateLimitResult {
            allowed: false,
            limit: 3,
            remaining: 0,
            reset_at: 1_700_000_060,
            blocked_until: None,
            key: "1.2.3.4:default".into(),
        };
        let resp = rate_limited_response(&result);
        assert_eq!(resp.status(), 429);
        assert_eq!(resp.headers().get("x-ratelimit-limit").unwrap(), "3");
        assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(
            resp.headers().get("x-ratelimit-reset").unwrap(),
            "1700000060"
        );
        assert!(resp.headers().get("x-ratelimit-blocked-until").is_none());
    }

    #[tokio::test]
    async fn test_blocked_until_header_when_blocked() {
        let result = RateLimitResult {
            allowed: false,
            limit: 3,
            remaining: 0,
            reset_at: 1_700_000_600,
            blocked_until: Some(1_700_000_600),
            key: "k".into(),
        };
        let resp = rate_limited_response(&result);
        assert_eq!(
            resp.headers().get("x-ratelimit-blocked-until").unwrap(),
            "1700000600"
        );
    }

    #[tokio::test]
    async fn test_set_headers_on_existing_response() {
        let mut resp: Response<ResponseBody> = Response::new(full_body("ok"));
        let result = RateLimitResult {
            allowed: true,
            limit: 100,
            remaining: 42,
            reset_at: 1_700_000_000,
            blocked_until: None,
            key: "k".into(),
        };
        set_rate_limit_headers(&mut resp, &result);
        assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "42");
    }

    #[tokio::test]
    async fn test_bad_gateway_references_domain() {
        let resp = bad_gateway_response("other.com", "-", "no upstream configured");
        assert_eq!(resp.status(), 502);
        let body = body_string(resp).await;
        assert!(body.contains("other.com"));
    }

    #[tokio::test]
    async fn test_upstream_failure_json_retries() {
        let resp = upstream_failure_json("connect timeout", 3);
        let body = body_string(resp).await;
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["retries"], 3);
        assert_eq!(parsed["error"], "upstream unavailable");
    }

    #[tokio::test]
    async fn test_health_body() {
        let resp = health_response(12, true);
        let body = body_string(resp).await;
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["status"], "healthy");
        assert_eq!(parsed["rules_loaded"], 12);
        assert_eq!(parsed["observe_mode"], true);
    }
}
