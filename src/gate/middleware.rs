//! The rate limiting gate in front of the downstream handler.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use super::routes::{ResolvedRoute, RouteTable};
use crate::ratelimit::{
    retry_after, ClientRequestIdentity, RateLimitHeaders, RateLimitOptions, RateLimiter,
    ANONYMOUS_CLIENT_ID,
};

const X_RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// What the gate decided for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Limiting does not apply; pass through.
    Disabled,
    /// The client bypasses limiting; pass through uncharged.
    Whitelisted,
    /// A required client id is missing; reject with 503.
    Unidentified { message: String },
    /// Within quota; pass through, attaching `headers` when present.
    Admitted { headers: Option<RateLimitHeaders> },
    /// Over quota; reject.
    Blocked {
        status: u16,
        message: String,
        /// Seconds until the ban ends, when headers are enabled
        retry_after: Option<f64>,
    },
}

impl IntoResponse for GateDecision {
    fn into_response(self) -> Response {
        match self {
            GateDecision::Unidentified { message } => rejection(
                StatusCode::SERVICE_UNAVAILABLE,
                message,
                Some(format_retry_after(-1.0)),
            ),
            GateDecision::Blocked {
                status,
                message,
                retry_after,
            } => rejection(
                StatusCode::from_u16(status).unwrap_or(StatusCode::TOO_MANY_REQUESTS),
                message,
                retry_after.map(format_retry_after),
            ),
            _ => StatusCode::OK.into_response(),
        }
    }
}

fn rejection(status: StatusCode, message: String, retry_after: Option<String>) -> Response {
    let mut response = (status, message).into_response();
    if let Some(value) = retry_after.and_then(|v| HeaderValue::from_str(&v).ok()) {
        response
            .headers_mut()
            .insert(axum::http::header::RETRY_AFTER, value);
    }
    response
}

/// Seconds rounded to milliseconds, without trailing zeros (`0.99`, `1`, `-1`).
fn format_retry_after(seconds: f64) -> String {
    let rounded = (seconds * 1000.0).round() / 1000.0;
    format!("{}", rounded)
}

fn apply_headers(headers: &mut HeaderMap, limits: &RateLimitHeaders) {
    headers.insert(X_RATE_LIMIT_LIMIT, HeaderValue::from(limits.limit));
    headers.insert(X_RATE_LIMIT_REMAINING, HeaderValue::from(limits.remaining));
    if let Ok(reset) = HeaderValue::from_str(&limits.reset_header()) {
        headers.insert(X_RATE_LIMIT_RESET, reset);
    }
}

/// Read the client id for `options` from request headers.
///
/// Returns `None` only when a header is configured and the request lacks it.
fn client_id(headers: &HeaderMap, options: &RateLimitOptions) -> Option<String> {
    let value = headers
        .get(options.client_id_header_name())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match value {
        Some(v) => Some(v.to_string()),
        None if options.requires_client_id() => None,
        None => Some(ANONYMOUS_CLIENT_ID.to_string()),
    }
}

/// The gate: resolves the route of a request and admits or rejects it.
#[derive(Clone)]
pub struct Gate {
    limiter: Arc<RateLimiter>,
    routes: Arc<RouteTable>,
}

impl Gate {
    /// Create a new gate.
    pub fn new(limiter: Arc<RateLimiter>, routes: Arc<RouteTable>) -> Self {
        Self { limiter, routes }
    }

    /// Decide what happens to a request on `route`.
    ///
    /// Counting runs on its own task so that dropping this future, for
    /// example when the client disconnects, does not abort a storage write
    /// halfway through.
    #[instrument(skip(self, route, headers, now), fields(route = %route.name))]
    pub async fn evaluate(
        &self,
        route: &ResolvedRoute,
        headers: &HeaderMap,
        path: &str,
        verb: &str,
        now: DateTime<Utc>,
    ) -> GateDecision {
        let options = &route.options;
        if !options.enabled {
            debug!("Rate limiting is disabled for route");
            return GateDecision::Disabled;
        }

        let Some(client_id) = client_id(headers, options) else {
            let message = format!(
                "Rate limiting client could not be identified for the route '{}' due to a missing or unknown client ID header required by rule '{}'!",
                route.name, options.rule
            );
            warn!(rule = %options.rule, "Client could not be identified");
            return GateDecision::Unidentified { message };
        };

        let identity = ClientRequestIdentity::new(client_id, path, verb);
        if self.limiter.is_whitelisted(&identity, options) {
            debug!(client_id = %identity.client_id, "Client is whitelisted, bypassing rate limiting");
            return GateDecision::Whitelisted;
        }

        if options.rule.limit() == 0 {
            warn!(rule = %options.rule, "Rate limiting is misconfigured: limit is zero, not limiting");
            return GateDecision::Disabled;
        }

        let limiter = self.limiter.clone();
        let task_options = options.clone();
        let task_identity = identity.clone();
        let admitted = tokio::spawn(async move {
            limiter.admit(&task_identity, &task_options, now).await
        })
        .await;

        let result = match admitted {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Counting task failed, admitting request");
                return GateDecision::Admitted { headers: None };
            }
        };

        let rule = &options.rule;
        if result.blocked {
            let retry = retry_after(&result.counter, rule, now);
            info!(
                verb = %identity.verb,
                path = %identity.path,
                client_id = %identity.client_id,
                quota = %format!("{}/{}", rule.limit(), rule.period()),
                total = result.counter.total,
                rule = %rule,
                "Blocked request"
            );
            return GateDecision::Blocked {
                status: options.status_code,
                message: options.quota_exceeded_message(),
                retry_after: options.enable_headers.then_some(retry),
            };
        }

        let headers = options
            .enable_headers
            .then(|| RateLimitHeaders::for_counter(&result.counter, rule));
        GateDecision::Admitted { headers }
    }
}

/// Axum middleware applying the gate to every request.
///
/// Use with `axum::middleware::from_fn_with_state(gate, rate_limit)`.
pub async fn rate_limit(State(gate): State<Gate>, request: Request, next: Next) -> Response {
    let now = Utc::now();
    let path = request.uri().path().to_string();
    let verb = request.method().as_str().to_string();

    let Some(route) = gate.routes.resolve(&path, &verb) else {
        return next.run(request).await;
    };

    let (parts, body) = request.into_parts();
    let decision = gate
        .evaluate(&route, &parts.headers, &path, &verb, now)
        .await;
    let request = Request::from_parts(parts, body);

    match decision {
        GateDecision::Disabled | GateDecision::Whitelisted => next.run(request).await,
        GateDecision::Admitted { headers } => {
            let mut response = next.run(request).await;
            if let Some(limits) = headers {
                apply_headers(response.headers_mut(), &limits);
            }
            response
        }
        rejected => rejected.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::Route;
    use crate::ratelimit::{MemoryCounterStore, RateLimitRule};
    use axum::body::Body;
    use axum::middleware::from_fn_with_state;
    use axum::Router;
    use tower::ServiceExt;

    fn options(period: &str, timespan: f64, limit: u64) -> RateLimitOptions {
        RateLimitOptions::new(RateLimitRule::new(period, timespan, limit).unwrap())
    }

    fn setup(routes: Vec<Route>) -> (Router, Arc<MemoryCounterStore>) {
        let store = Arc::new(MemoryCounterStore::default());
        let limiter = Arc::new(RateLimiter::new(store.clone()));
        let gate = Gate::new(limiter, Arc::new(RouteTable::new(routes)));

        let app = Router::new()
            .fallback(|| async { "downstream" })
            .layer(from_fn_with_state(gate, rate_limit));
        (app, store)
    }

    fn request(path: &str, client: Option<(&str, &str)>) -> Request {
        let mut builder = axum::http::Request::builder().uri(path);
        if let Some((name, value)) = client {
            builder = builder.header(name, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
        response.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[test]
    fn test_format_retry_after() {
        assert_eq!(format_retry_after(-1.0), "-1");
        assert_eq!(format_retry_after(1.0), "1");
        assert_eq!(format_retry_after(0.99), "0.99");
        assert_eq!(format_retry_after(2.123456), "2.123");
    }

    #[test]
    fn test_client_id_resolution() {
        let mut headers = HeaderMap::new();
        let default = options("1s", 1.0, 3);
        assert_eq!(client_id(&headers, &default).as_deref(), Some(ANONYMOUS_CLIENT_ID));

        headers.insert("clientid", HeaderValue::from_static("alice"));
        assert_eq!(client_id(&headers, &default).as_deref(), Some("alice"));

        let mut custom = options("1s", 1.0, 3);
        custom.client_id_header = Some("X-Api-Key".to_string());
        assert_eq!(client_id(&headers, &custom), None);

        headers.insert("x-api-key", HeaderValue::from_static("   "));
        assert_eq!(client_id(&headers, &custom), None);

        headers.insert("x-api-key", HeaderValue::from_static("key-1"));
        assert_eq!(client_id(&headers, &custom).as_deref(), Some("key-1"));
    }

    #[tokio::test]
    async fn test_three_per_second_then_blocked() {
        let (app, _store) = setup(vec![Route::new(
            "/api/limited",
            ["GET"],
            options("1s", 1.0, 3),
        )]);

        for remaining in ["2", "1", "0"] {
            let response = app
                .clone()
                .oneshot(request("/api/limited", Some(("ClientId", "alice"))))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(header(&response, "x-ratelimit-limit"), Some("3"));
            assert_eq!(header(&response, "x-ratelimit-remaining"), Some(remaining));
            assert!(header(&response, "x-ratelimit-reset").unwrap().ends_with('Z'));
            assert_eq!(body_text(response).await, "downstream");
        }

        let response = app
            .clone()
            .oneshot(request("/api/limited", Some(("ClientId", "alice"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry: f64 = header(&response, "retry-after").unwrap().parse().unwrap();
        assert!(retry > 0.0 && retry <= 1.0);
        assert!(header(&response, "x-ratelimit-limit").is_none());
        assert_eq!(
            body_text(response).await,
            "API calls quota exceeded! maximum admitted 3 per 1s."
        );

        // Another client has its own quota
        let response = app
            .oneshot(request("/api/limited", Some(("ClientId", "bob"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unidentified_client_is_rejected() {
        let mut limited = options("1s", 1.0, 3);
        limited.client_id_header = Some("bla-bla-header".to_string());
        let (app, store) = setup(vec![Route::new("/api/limited", ["GET"], limited)]);

        let response = app
            .clone()
            .oneshot(request("/api/limited", Some(("ClientId", "alice"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(header(&response, "retry-after"), Some("-1"));

        let body = body_text(response).await;
        assert!(body.contains("/api/limited"));
        assert!(body.contains("3/1s/w1s"));
        assert!(store.is_empty());

        let response = app
            .oneshot(request("/api/limited", Some(("bla-bla-header", "alice"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_whitelisted_client_is_never_charged() {
        let rule = RateLimitRule::new("1s", 1.0, 1)
            .unwrap()
            .with_whitelist(["admin"]);
        let (app, store) = setup(vec![Route::new(
            "/api/{everything}",
            Vec::<String>::new(),
            RateLimitOptions::new(rule),
        )]);

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(request("/api/a/b", Some(("ClientId", "admin"))))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(header(&response, "x-ratelimit-limit").is_none());
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_and_zero_limit_pass_through() {
        let mut disabled = options("1s", 1.0, 1);
        disabled.enabled = false;
        let (app, store) = setup(vec![
            Route::new("/disabled", ["GET"], disabled),
            Route::new("/zero", ["GET"], options("1s", 1.0, 0)),
        ]);

        for path in ["/disabled", "/zero", "/unrouted"] {
            for _ in 0..3 {
                let response = app.clone().oneshot(request(path, None)).await.unwrap();
                assert_eq!(response.status(), StatusCode::OK, "{} should pass", path);
                assert!(header(&response, "x-ratelimit-limit").is_none());
            }
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_custom_status_and_headers_disabled() {
        let mut custom = options("1m", 30.0, 1);
        custom.status_code = 418;
        custom.enable_headers = false;
        custom.quota_message = "Slow down: {0} per {1}".to_string();
        let (app, _store) = setup(vec![Route::new("/api/tea", ["GET"], custom)]);

        let response = app.clone().oneshot(request("/api/tea", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, "x-ratelimit-limit").is_none());

        let response = app.oneshot(request("/api/tea", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert!(header(&response, "retry-after").is_none());
        assert_eq!(body_text(response).await, "Slow down: 1 per 1m");
    }

    #[tokio::test]
    async fn test_evaluate_decisions() {
        let store = Arc::new(MemoryCounterStore::default());
        let gate = Gate::new(
            Arc::new(RateLimiter::new(store)),
            Arc::new(RouteTable::default()),
        );
        let route = ResolvedRoute {
            name: "/api/users".to_string(),
            options: Arc::new(options("1s", 1.0, 1)),
        };
        let now = Utc::now();
        let headers = HeaderMap::new();

        let first = gate.evaluate(&route, &headers, "/api/users", "GET", now).await;
        match first {
            GateDecision::Admitted { headers: Some(limits) } => {
                assert_eq!(limits.limit, 1);
                assert_eq!(limits.remaining, 0);
            }
            other => panic!("expected admission, got {:?}", other),
        }

        let second = gate.evaluate(&route, &headers, "/api/users", "GET", now).await;
        assert_eq!(
            second,
            GateDecision::Blocked {
                status: 429,
                message: "API calls quota exceeded! maximum admitted 1 per 1s.".to_string(),
                retry_after: Some(1.0),
            }
        );
    }
}
