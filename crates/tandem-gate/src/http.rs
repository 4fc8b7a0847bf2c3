//! Rate limiting middleware for axum routers.
//!
//! ```ignore
//! let state = RateLimitState::new(chat_limiter, "chat-send");
//! let router = Router::new()
//!     .route("/api/messages", post(send_message))
//!     .layer(axum::middleware::from_fn_with_state(state, rate_limit));
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::extract::ConnectInfo;
use axum::extract::Request;
use axum::extract::State;
use axum::http::HeaderName;
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::http::header;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use serde_json::json;
use tandem_ratelimit::Admission;
use tandem_ratelimit::TokenBucket;
use tandem_ratelimit::pure::retry_after_header_secs;
use tracing::debug;

use crate::identity::derive_identity;

/// Response header reporting whole tokens left after an admitted request.
pub const RATE_LIMIT_REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Tokens left after this request was admitted. Inserted as a request extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRemaining(pub u64);

/// State for [`rate_limit`]: which limiter guards the routes, and under which scope.
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<TokenBucket>,
    scope: Arc<str>,
    trust_forwarded_for: bool,
}

impl RateLimitState {
    pub fn new(limiter: Arc<TokenBucket>, scope: impl Into<Arc<str>>) -> Self {
        Self {
            limiter,
            scope: scope.into(),
            trust_forwarded_for: false,
        }
    }

    /// Identify callers by the first `x-forwarded-for` hop. Only safe behind a trusted proxy.
    pub fn with_trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn limiter(&self) -> &Arc<TokenBucket> {
        &self.limiter
    }
}

/// Responses produced instead of running the guarded handler.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitRejection {
    /// 429 with `Retry-After`.
    TooManyRequests { retry_after_seconds: f64 },
    /// 503: the store failed and the limiter is fail-closed.
    Unavailable,
    /// 400: no usable identity for the caller.
    BadIdentity { reason: String },
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        match self {
            RateLimitRejection::TooManyRequests { retry_after_seconds } => (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after_header_secs(retry_after_seconds).to_string())],
                Json(json!({
                    "detail": format!("Rate limit exceeded. Retry in {retry_after_seconds:.2}s."),
                    "retry_after_seconds": retry_after_seconds,
                })),
            )
                .into_response(),
            RateLimitRejection::Unavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "detail": "rate limiter unavailable" }))).into_response()
            }
            RateLimitRejection::BadIdentity { reason } => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "detail": format!("cannot rate limit request: {reason}") })),
            )
                .into_response(),
        }
    }
}

/// Admit or reject a request before it reaches the handler.
///
/// Peer addresses come from `ConnectInfo<SocketAddr>` when the server was
/// started with `into_make_service_with_connect_info`; without it only
/// `x-user-id` (or a trusted `x-forwarded-for`) identifies the caller.
pub async fn rate_limit(State(state): State<RateLimitState>, mut request: Request, next: Next) -> Response {
    let peer = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(addr)| addr.ip());
    let Some(identity) = derive_identity(request.headers(), peer, state.trust_forwarded_for) else {
        debug!(scope = %state.scope, "request carries no identity");
        return RateLimitRejection::BadIdentity {
            reason: "no user id or peer address".to_string(),
        }
        .into_response();
    };

    match state.limiter.admit(&state.scope, &identity).await {
        Admission::Allowed { tokens_remaining } => {
            request.extensions_mut().insert(RateRemaining(tokens_remaining));
            let mut response = next.run(request).await;
            response.headers_mut().insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(tokens_remaining));
            response
        }
        Admission::FailedOpen { .. } => next.run(request).await,
        Admission::Denied { retry_after_seconds } => {
            RateLimitRejection::TooManyRequests { retry_after_seconds }.into_response()
        }
        Admission::FailedClosed { .. } => RateLimitRejection::Unavailable.into_response(),
        Admission::Rejected { reason } => RateLimitRejection::BadIdentity { reason }.into_response(),
    }
}
