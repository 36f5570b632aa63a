//! The request pipeline.
//!
//! Strict composition order, first denial wins: bypass endpoints, client-IP
//! derivation, IP filter, GeoIP gate, rate limiter, body read, domain
//! resolution, rule evaluation, then the proxy forward. Rate-limit headers
//! ride on every response whose request was checked, allowed or denied.

use super::context::TracePoint;
use super::forwarding::{forward, ForwardOptions};
use crate::acme::ChallengeCache;
use crate::logging::{timestamp_now, AuditEvent, AuditKind, LogEvent};
use crate::responses::{self, ResponseBody};
use crate::rules::DomainEvalConfig;
use crate::runtime::WafRuntime;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{HeaderMap, Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Derive the client IP: first `X-Forwarded-For` token, then `X-Real-IP`,
/// then the "unknown" placeholder.
pub fn derive_client_ip(headers: &HeaderMap) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real = real.trim();
        if !real.is_empty() {
            return real.to_string();
        }
    }
    "unknown".to_string()
}

/// Normalize a Host header value: strip the port, lowercase.
pub fn normalize_host(host: &str) -> String {
    let stripped = match host.rfind(':') {
        // Keep bracketed IPv6 literals intact.
        Some(idx) if !host[idx..].contains(']') => &host[..idx],
        _ => host,
    };
    stripped.to_ascii_lowercase()
}

/// Handle one request end to end.
pub async fn handle_request(
    runtime: &Arc<WafRuntime>,
    req: Request<Incoming>,
) -> Response<ResponseBody> {
    let config = runtime.config();
    let path = req.uri().path().to_string();

    // 1. Bypass endpoints never enter the pipeline.
    if path == "/health" {
        return responses::health_response(
            runtime.evaluator.rules_loaded(),
            config.observe_mode(),
        );
    }
    if path == "/metrics" {
        if !config.metrics.enabled {
            return responses::not_found();
        }
        crate::metrics::set_uptime(runtime.uptime_secs());
        crate::metrics::set_memory_usage(runtime.memory_tracker.total_usage());
        return Response::builder()
            .status(200)
            .header("content-type", crate::metrics::TEXT_FORMAT)
            .body(responses::full_body(crate::metrics::collect_metrics()))
            .expect("static response builds");
    }
    if let Some(token) = ChallengeCache::token_from_path(&path) {
        return match runtime.challenge_cache.lookup(token) {
            Some(authorization) => Response::builder()
                .status(200)
                .header("content-type", "text/plain")
                .body(responses::full_body(authorization))
                .expect("static response builds"),
            None => responses::not_found(),
        };
    }

    let mut trace = runtime.trace_pool.acquire();
    let sampled = config.logging.trace_sample_rate >= 1.0
        || rand::random::<f64>() < config.logging.trace_sample_rate;

    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let query = req.uri().query().unwrap_or("").to_string();
    let headers = req.headers().clone();
    let user_agent = headers
        .get(hyper::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    // 2. Client IP.
    let client_ip = derive_client_ip(&headers);

    // 3. IP filter.
    let ip_decision = runtime.ip_filter().check(&client_ip);
    if !ip_decision.allowed {
        debug!(%client_ip, "request denied by ip filter");
        runtime.audit(AuditEvent {
            kind: AuditKind::IpBlocked,
            client_ip: client_ip.clone(),
            detail: format!("source={} path={}", ip_decision.source, path),
        });
        crate::metrics::record_blocked();
        let response = responses::forbidden_json(
            &format!("ip {client_ip} is blocked"),
            ip_decision.source,
        );
        emit_request_log(
            runtime, &trace, &client_ip, &method, &path, &query, &user_agent, true, false, None,
            None, 403, "",
        );
        trace.mark(TracePoint::End);
        return response;
    }

    // 4. GeoIP gate.
    if let Ok(ip_addr) = client_ip.parse::<std::net::IpAddr>() {
        let geo = runtime.geoip().decision(ip_addr);
        if geo.blocked {
            let country = geo.country_code.as_deref().unwrap_or("??").to_string();
            debug!(%client_ip, %country, "request denied by geoip gate");
            runtime.audit(AuditEvent {
                kind: AuditKind::GeoipBlocked,
                client_ip: client_ip.clone(),
                detail: format!("country={country} path={path}"),
            });
            crate::metrics::record_blocked();
            let response = responses::forbidden_json(
                geo.reason.as_deref().unwrap_or("country blocked"),
                "geoip",
            );
            emit_request_log(
                runtime, &trace, &client_ip, &method, &path, &query, &user_agent, true, false,
                None, None, 403, "",
            );
            trace.mark(TracePoint::End);
            return response;
        }
    }

    // 5. Rate limiter. Headers ride on the response either way.
    let rate_result = runtime.rate_limiter().check(&client_ip, &path);
    if !rate_result.allowed {
        runtime.audit(AuditEvent {
            kind: AuditKind::RateLimitExceeded,
            client_ip: client_ip.clone(),
            detail: format!(
                "path={} limit={} reset_at={}",
                path, rate_result.limit, rate_result.reset_at
            ),
        });
        crate::metrics::record_rate_limited();
        runtime.request_logger.enqueue(LogEvent::RateLimitExceeded {
            timestamp: timestamp_now(),
            client_ip: client_ip.clone(),
            path: path.clone(),
            limit: rate_result.limit,
            reset_at: rate_result.reset_at,
        });
        trace.mark(TracePoint::End);
        return responses::rate_limited_response(&rate_result);
    }

    // 6. Body, buffered. Only the first `body_limit` bytes are inspected;
    //    the upstream receives the payload as sent.
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "failed to read request body");
            bytes::Bytes::new()
        }
    };

    // 7. Domain resolution.
    let host = headers
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(normalize_host);
    let domain_cfg = host.as_deref().and_then(|h| config.domain(h));
    if domain_cfg.is_none() && !config.domains.is_empty() {
        if let Some(host) = host.as_deref() {
            debug!(%host, "request for unknown domain");
            let response = responses::bad_gateway_response(
                host,
                "-",
                "no upstream is configured for this domain",
            );
            emit_request_log(
                runtime, &trace, &client_ip, &method, &path, &query, &user_agent, false, false,
                None, None, 502, host,
            );
            trace.mark(TracePoint::End);
            return response;
        }
    }
    let domain_name = host.unwrap_or_default();
    let eval_cfg: Option<DomainEvalConfig> = domain_cfg.map(|d| d.eval_config());

    // 8. Rule evaluation.
    trace.mark(TracePoint::WafStart);
    let observe = config.observe_mode();
    let evaluation = runtime.evaluator.evaluate(
        method.as_str(),
        &path_and_query,
        &headers,
        &body,
        config.body_limit_bytes,
        eval_cfg.as_ref(),
        observe,
    );
    trace.mark(TracePoint::WafComplete);

    for matched in &evaluation.matched_rules {
        runtime.request_logger.enqueue(LogEvent::RuleMatch {
            timestamp: timestamp_now(),
            request_id: trace.ray_id().to_string(),
            client_ip: client_ip.clone(),
            rule_id: matched.id,
            rule_message: matched.msg.clone(),
            variable: matched.variable.to_string(),
            value: matched.value.clone(),
            score: matched.score,
        });
    }

    if evaluation.blocked {
        let block_rule = evaluation.block_rule();
        let (rule_id, rule_msg) = block_rule
            .map(|r| (r.id, r.msg.clone()))
            .unwrap_or((0, "request blocked".to_string()));
        runtime.audit(AuditEvent {
            kind: AuditKind::Block,
            client_ip: client_ip.clone(),
            detail: format!(
                "rule_id={} score={}/{} path={}",
                rule_id, evaluation.total_score, evaluation.threshold, path
            ),
        });
        crate::metrics::record_blocked();
        let score = evaluation
            .scoring_mode
            .then_some((evaluation.total_score, evaluation.threshold));
        let mut response =
            responses::waf_block_response(rule_id, &rule_msg, "enforce", trace.ray_id(), score);
        responses::set_rate_limit_headers(&mut response, &rate_result);
        emit_request_log(
            runtime,
            &trace,
            &client_ip,
            &method,
            &path,
            &query,
            &user_agent,
            true,
            false,
            Some(rule_id),
            Some(rule_msg),
            403,
            &domain_name,
        );
        trace.mark(TracePoint::End);
        return response;
    }
    if evaluation.observed {
        crate::metrics::record_observed();
    }

    // 9. Proxy forward.
    let options = build_forward_options(&config, domain_cfg, &headers);
    trace.mark(TracePoint::BackendStart);
    let (mut response, _failed_attempts) = forward(
        &runtime.pool_manager,
        &method,
        &path_and_query,
        &headers,
        headers
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok()),
        body.clone(),
        &options,
    )
    .await;
    trace.mark(TracePoint::BackendComplete);
    trace.mark(TracePoint::ResponseStart);
    responses::set_rate_limit_headers(&mut response, &rate_result);
    trace.mark(TracePoint::ResponseComplete);

    // 10. Logs and metrics.
    let status = response.status().as_u16();
    let (rule_id, rule_msg) = match evaluation.block_rule() {
        Some(r) if evaluation.observed => (Some(r.id), Some(r.msg.clone())),
        _ => (None, None),
    };
    emit_request_log(
        runtime,
        &trace,
        &client_ip,
        &method,
        &path,
        &query,
        &user_agent,
        false,
        evaluation.observed,
        rule_id,
        rule_msg,
        status,
        &domain_name,
    );
    trace.mark(TracePoint::End);
    let durations = trace.durations();
    crate::metrics::record_request(durations.total_ms / 1000.0, body.len());
    if sampled {
        debug!(
            ray_id = trace.ray_id(),
            total_ms = durations.total_ms,
            waf_ms = durations.waf_ms,
            backend_ms = durations.backend_ms,
            "request trace"
        );
    }

    response
}

fn build_forward_options(
    config: &crate::config::WafConfig,
    domain_cfg: Option<&crate::config::DomainConfig>,
    headers: &HeaderMap,
) -> ForwardOptions {
    let header_override = if config.server.trust_upstream_override {
        headers
            .get("x-next-upstream")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    } else {
        None
    };

    ForwardOptions {
        header_override,
        call_override: None,
        domain_upstream: domain_cfg.map(|d| d.default_upstream.clone()),
        global_upstream: config.upstream.clone(),
        preserve_original_host: domain_cfg
            .map(|d| d.preserve_original_host)
            .unwrap_or(config.preserve_original_host),
        custom_host_header: domain_cfg
            .and_then(|d| d.upstream_host_header.clone())
            .or_else(|| config.upstream_host_header.clone()),
        verify_tls: domain_cfg.map(|d| d.verify_upstream_tls).unwrap_or(true),
        max_retries: config.connection_pooling.max_retries,
        read_timeout: Duration::from_secs(config.connection_pooling.read_timeout_secs),
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_request_log(
    runtime: &Arc<WafRuntime>,
    trace: &super::context::TraceLease,
    client_ip: &str,
    method: &hyper::Method,
    path: &str,
    query: &str,
    user_agent: &str,
    blocked: bool,
    observed: bool,
    rule_id: Option<u32>,
    rule_message: Option<String>,
    status_code: u16,
    domain: &str,
) {
    let durations = trace.durations();
    runtime.request_logger.enqueue(LogEvent::WafRequest {
        timestamp: timestamp_now(),
        request_id: trace.ray_id().to_string(),
        client_ip: client_ip.to_string(),
        method: method.to_string(),
        path: path.to_string(),
        query: query.to_string(),
        user_agent: user_agent.to_string(),
        blocked,
        observed,
        rule_id,
        rule_message,
        duration_ms: durations.total_ms,
        status_code,
        domain: domain.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_client_ip_priority() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "5.6.7.8".parse().unwrap());
        assert_eq!(derive_client_ip(&headers), "1.2.3.4");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "5.6.7.8".parse().unwrap());
        assert_eq!(derive_client_ip(&headers), "5.6.7.8");

        assert_eq!(derive_client_ip(&HeaderMap::new()), "unknown");
    }

    #[test]
    fn test_derive_client_ip_trims_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "  9.9.9.9 , 8.8.8.8".parse().unwrap());
        assert_eq!(derive_client_ip(&headers), "9.9.9.9");
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Example.COM"), "example.com");
        assert_eq!(normalize_host("example.com:8080"), "example.com");
        assert_eq!(normalize_host("[::1]:443"), "[::1]");
        assert_eq!(normalize_host("localhost"), "localhost");
    }
}
