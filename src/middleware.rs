use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{ErrorResponse, TarotError};
use crate::key_generator::KeyGenerator;
use crate::rate_limit_config::RouteLimitRule;
use crate::rate_limiter::{Decision, KeyedRateLimiter};

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

fn client_ip(request: &Request) -> String {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    KeyGenerator::extract_client_ip(request.headers(), peer)
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = client_ip(&request);
    let start = Instant::now();

    info!(
        target: "tarot::middleware",
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let response = next.run(request).await;

    info!(
        target: "tarot::middleware",
        method = %method,
        uri = %uri,
        status = %response.status(),
        latency_ms = start.elapsed().as_millis() as u64,
        "Request completed"
    );

    response
}

/// One inbound limit bound to the routes it protects. A rule that is
/// disabled or fails to parse lets every request through.
#[derive(Clone)]
pub struct RouteLimiter {
    name: String,
    limiter: Option<Arc<KeyedRateLimiter>>,
    keys: KeyGenerator,
}

impl RouteLimiter {
    pub fn from_rule(rule: &RouteLimitRule) -> Self {
        let limiter = if !rule.is_enabled() {
            info!(rule = %rule.name, "Rate limit disabled");
            None
        } else {
            match KeyedRateLimiter::from_spec(&rule.limit, rule.burst) {
                Ok(limiter) => Some(Arc::new(limiter)),
                Err(e) => {
                    tracing::error!(
                        rule = %rule.name,
                        limit = %rule.limit,
                        error = %e,
                        "Invalid rate limit, requests will not be limited"
                    );
                    None
                }
            }
        };

        Self {
            name: rule.name.clone(),
            limiter,
            keys: KeyGenerator::new(rule.scope),
        }
    }

    pub fn limiter(&self) -> Option<Arc<KeyedRateLimiter>> {
        self.limiter.clone()
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: u64) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, value);
    }
}

/// Unix time at which the bucket is full again.
fn reset_at(limiter: &KeyedRateLimiter, decision: &Decision) -> u64 {
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    let rate = limiter.rate().per_second;
    let missing = limiter.burst().saturating_sub(decision.remaining);
    if missing == 0 || rate <= 0.0 {
        return now;
    }
    now + (f64::from(missing) / rate).ceil() as u64
}

/// Token-bucket rate limiting keyed per client (and route, depending on the rule).
pub async fn rate_limit(State(route_limiter): State<RouteLimiter>, request: Request, next: Next) -> Response {
    let Some(limiter) = route_limiter.limiter.as_deref() else {
        return next.run(request).await;
    };

    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let key = route_limiter.keys.generate_key(&client_ip(&request), &route);
    let decision = limiter.check(&key);

    if !decision.allowed {
        warn!(rule = %route_limiter.name, key = %key, "Rate limit exceeded");
        let body = ErrorResponse::from_error(&TarotError::RateLimited);
        let mut response = (body.status(), Json(body)).into_response();
        let headers = response.headers_mut();
        insert_header(headers, X_RATELIMIT_LIMIT, u64::from(limiter.burst()));
        insert_header(headers, X_RATELIMIT_REMAINING, 0);
        if let Some(wait) = decision.retry_after.filter(|wait| *wait != Duration::MAX) {
            insert_header(headers, axum::http::header::RETRY_AFTER, ceil_secs(wait));
        }
        return response;
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    insert_header(headers, X_RATELIMIT_LIMIT, u64::from(limiter.burst()));
    insert_header(headers, X_RATELIMIT_REMAINING, u64::from(decision.remaining));
    insert_header(headers, X_RATELIMIT_RESET, reset_at(limiter, &decision));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit_config::KeyScope;
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Router};
    use tower::ServiceExt;

    fn app(rule: RouteLimitRule) -> Router {
        Router::new()
            .route("/v1/things/:id", get(|| async { "ok" }))
            .route_layer(middleware::from_fn_with_state(
                RouteLimiter::from_rule(&rule),
                rate_limit,
            ))
    }

    fn get_from(uri: &str, ip: &str) -> Request {
        axum::http::Request::builder()
            .uri(uri)
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_rejects_after_burst() {
        let app = app(RouteLimitRule::new("test", "1-H", 2, KeyScope::Ip));

        for remaining in ["1", "0"] {
            let response = app.clone().oneshot(get_from("/v1/things/1", "10.0.0.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["x-ratelimit-limit"], "2");
            assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
            assert!(response.headers().contains_key("x-ratelimit-reset"));
        }

        let response = app.clone().oneshot(get_from("/v1/things/1", "10.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = response.headers()["retry-after"].to_str().unwrap().parse().unwrap();
        assert!(retry_after > 3500 && retry_after <= 3600, "{}", retry_after);

        // Another client has its own bucket.
        let response = app.oneshot(get_from("/v1/things/1", "10.0.0.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_route_scope_shares_bucket_across_ids() {
        let app = app(RouteLimitRule::new("test", "1-H", 1, KeyScope::RouteWithIp));
        let first = app.clone().oneshot(get_from("/v1/things/1", "10.0.0.1")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.oneshot(get_from("/v1/things/2", "10.0.0.1")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_invalid_rule_passes_everything() {
        let rule = RouteLimitRule::new("broken", "ten-per-hour", 1, KeyScope::Ip);
        assert!(RouteLimiter::from_rule(&rule).limiter().is_none());

        let app = app(rule);
        for _ in 0..5 {
            let response = app.clone().oneshot(get_from("/v1/things/1", "10.0.0.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key("x-ratelimit-limit"));
        }
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_secs(2)), 2);
        assert_eq!(ceil_secs(Duration::from_millis(2001)), 3);
    }
}
