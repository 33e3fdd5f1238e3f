//! Admission middleware: runs the rate limiter in front of a router.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, instrument, warn};

use crate::ratelimit::{Identity, IdentityResolver, RateLimiterBackend, Verdict};

/// Message returned to rate-limited clients.
pub const RATE_LIMITED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
}

/// Admission control for an axum router.
pub struct Admission {
    /// The rate limiter deciding each request
    limiter: Arc<dyn RateLimiterBackend>,
    /// Picks the identity a request is counted against
    resolver: IdentityResolver,
    /// Whether admitted responses carry `x-ratelimit-remaining`
    rate_limit_headers: bool,
}

impl Admission {
    /// Create admission control over the given limiter.
    pub fn new(limiter: Arc<dyn RateLimiterBackend>, resolver: IdentityResolver) -> Self {
        Self {
            limiter,
            resolver,
            rate_limit_headers: false,
        }
    }

    /// Report the remaining quota on admitted responses.
    pub fn with_rate_limit_headers(mut self, enabled: bool) -> Self {
        self.rate_limit_headers = enabled;
        self
    }

    /// Put every route of `router` behind admission control.
    pub fn protect(self: Arc<Self>, router: Router) -> Router {
        router.layer(middleware::from_fn_with_state(self, admit))
    }

    async fn decide(&self, request: Request, next: Next) -> Response {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_default();
        let identity = self.resolver.resolve(request.headers(), &peer);

        match self.limiter.check(&identity.key, identity.kind).await {
            Ok(Verdict::Allow) => {
                let remaining = if self.rate_limit_headers {
                    self.remaining(&identity).await
                } else {
                    None
                };

                let mut response = next.run(request).await;
                if let Some(remaining) = remaining {
                    response
                        .headers_mut()
                        .insert("x-ratelimit-remaining", HeaderValue::from(remaining));
                }
                response
            }
            Ok(Verdict::Deny) => {
                warn!(identity = %identity, "Request rejected by rate limit");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(ErrorResponse {
                        error: RATE_LIMITED_MESSAGE,
                    }),
                )
                    .into_response()
            }
            Err(e) => {
                // Storage details stay in the logs, never in the response.
                error!(identity = %identity, error = %e, "Admission check failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }

    async fn remaining(&self, identity: &Identity) -> Option<u64> {
        match self
            .limiter
            .remaining_requests(&identity.key, identity.kind)
            .await
        {
            Ok(remaining) => Some(remaining),
            Err(e) => {
                warn!(identity = %identity, error = %e, "Could not read remaining quota");
                None
            }
        }
    }
}

/// Middleware entry point for [`axum::middleware::from_fn_with_state`].
#[instrument(
    skip_all,
    fields(
        method = %request.method(),
        path = %request.uri().path()
    )
)]
pub async fn admit(
    State(admission): State<Arc<Admission>>,
    request: Request,
    next: Next,
) -> Response {
    admission.decide(request, next).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GatekeeperError, Result, StorageOperation, StorageUnavailable};
    use crate::ratelimit::{IdentityKind, LimitConfig, RateLimiter};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::routing::get;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Limiter returning a fixed answer and recording what it was asked.
    struct StubLimiter {
        verdict: Option<Verdict>,
        remaining: u64,
        calls: Mutex<Vec<(String, IdentityKind)>>,
    }

    impl StubLimiter {
        fn answering(verdict: Option<Verdict>) -> Arc<Self> {
            Arc::new(Self {
                verdict,
                remaining: 7,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RateLimiterBackend for StubLimiter {
        async fn check(&self, key: &str, kind: IdentityKind) -> Result<Verdict> {
            self.calls.lock().push((key.to_string(), kind));
            self.verdict.ok_or_else(|| {
                GatekeeperError::storage(
                    StorageOperation::IsBlocked,
                    StorageUnavailable::new("connection refused by 10.1.1.1:6379"),
                )
            })
        }

        async fn remaining_requests(&self, _key: &str, _kind: IdentityKind) -> Result<u64> {
            Ok(self.remaining)
        }
    }

    fn app(limiter: Arc<dyn RateLimiterBackend>, rate_limit_headers: bool) -> Router {
        let admission = Admission::new(limiter, IdentityResolver::new("API_KEY").unwrap())
            .with_rate_limit_headers(rate_limit_headers);
        Arc::new(admission).protect(Router::new().route("/", get(|| async { "Hello, World!" })))
    }

    fn request(token: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri("/");
        if let Some(token) = token {
            builder = builder.header("API_KEY", token);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo("192.168.1.1:54321".parse::<SocketAddr>().unwrap()));
        request
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_allowed_request_passes_through() {
        let limiter = StubLimiter::answering(Some(Verdict::Allow));

        let response = app(limiter.clone(), false).oneshot(request(None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-remaining").is_none());
        assert_eq!(body_string(response).await, "Hello, World!");
        assert_eq!(
            limiter.calls.lock().as_slice(),
            &[("192.168.1.1".to_string(), IdentityKind::Ip)]
        );
    }

    #[tokio::test]
    async fn test_token_identity_sent_to_limiter() {
        let limiter = StubLimiter::answering(Some(Verdict::Allow));

        app(limiter.clone(), false)
            .oneshot(request(Some("test-token")))
            .await
            .unwrap();

        assert_eq!(
            limiter.calls.lock().as_slice(),
            &[("test-token".to_string(), IdentityKind::Token)]
        );
    }

    #[tokio::test]
    async fn test_denied_request_gets_json_429() {
        let limiter = StubLimiter::answering(Some(Verdict::Deny));

        let response = app(limiter, false).oneshot(request(None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body, serde_json::json!({ "error": RATE_LIMITED_MESSAGE }));
    }

    #[tokio::test]
    async fn test_limiter_error_hides_details() {
        let limiter = StubLimiter::answering(None);

        let response = app(limiter, false).oneshot(request(None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_string(response).await;
        assert_eq!(body, "Internal Server Error");
        assert!(!body.contains("6379"));
    }

    #[tokio::test]
    async fn test_remaining_header_when_enabled() {
        let limiter = StubLimiter::answering(Some(Verdict::Allow));

        let response = app(limiter, true).oneshot(request(None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "7");
    }

    #[tokio::test]
    async fn test_missing_connect_info_uses_forwarded_headers() {
        let limiter = StubLimiter::answering(Some(Verdict::Allow));
        let request = axum::http::Request::builder()
            .uri("/")
            .header("X-Real-IP", "198.51.100.4")
            .body(Body::empty())
            .unwrap();

        app(limiter.clone(), false).oneshot(request).await.unwrap();

        assert_eq!(
            limiter.calls.lock().as_slice(),
            &[("198.51.100.4".to_string(), IdentityKind::Ip)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_real_limiter_blocks_after_limit() {
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryStore::new()),
            LimitConfig::new(2, Duration::from_secs(60)),
        ));
        let app = app(limiter, true);

        let first = app.clone().oneshot(request(None)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers().get("x-ratelimit-remaining").unwrap(), "1");

        let second = app.clone().oneshot(request(None)).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.headers().get("x-ratelimit-remaining").unwrap(), "0");

        let third = app.clone().oneshot(request(None)).await.unwrap();
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);

        // A token is a separate identity from the IP it arrives on.
        let token = app.oneshot(request(Some("abc"))).await.unwrap();
        assert_eq!(token.status(), StatusCode::OK);
    }
}
