//! HTTP surface of `tandem-node`.
//!
//! Routes:
//! - `GET  /health` - liveness, never rate limited
//! - `POST /api/messages` - chat send, guarded by the `chat-send` scope
//! - `GET  /api/ping` - guarded by the `api` scope
//! - `GET  /admin/buckets/{scope}/{identity}` - peek at a bucket without taking a token

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Extension;
use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use snafu::ResultExt;
use snafu::Snafu;
use tandem_gate::RateLimitState;
use tandem_gate::RateRemaining;
use tandem_gate::rate_limit;
use tandem_kv::DeterministicKeyValueStore;
use tandem_ratelimit::BucketStore;
use tandem_ratelimit::CasBucketStore;
use tandem_ratelimit::LocalBucketStore;
use tandem_ratelimit::RateLimitError;
use tandem_ratelimit::RedisBucketStore;
use tandem_ratelimit::TokenBucket;
use tandem_time::TimeProvider;
use tracing::info;

use crate::config::API_SCOPE;
use crate::config::CHAT_SEND_SCOPE;
use crate::config::NodeConfig;
use crate::config::StoreBackend;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ServerError {
    #[snafu(display("failed to build limiter for scope '{scope}': {source}"))]
    BuildLimiter {
        scope: String,
        source: tandem_ratelimit::ConfigError,
    },

    #[snafu(display("no rate limit policy configured for scope '{scope}'"))]
    MissingScope { scope: String },

    #[snafu(display("failed to open {backend} bucket store: {source}"))]
    OpenStore {
        backend: StoreBackend,
        source: tandem_ratelimit::ConfigError,
    },
}

/// One limiter per configured scope, all sharing a single bucket store.
pub struct LimiterRegistry {
    limiters: BTreeMap<String, Arc<TokenBucket>>,
    store: Arc<dyn BucketStore>,
}

impl LimiterRegistry {
    /// Build limiters for every scope in `config` on top of `store`.
    pub fn new(
        config: &NodeConfig,
        store: Arc<dyn BucketStore>,
        time: Arc<dyn TimeProvider>,
    ) -> Result<Self, ServerError> {
        let mut limiters = BTreeMap::new();
        for (scope, limiter_config) in config.limiter_configs() {
            let limiter = TokenBucket::with_time_provider(store.clone(), limiter_config, time.clone())
                .context(BuildLimiterSnafu { scope: scope.clone() })?;
            info!(
                scope = %scope,
                capacity = limiter.policy().capacity(),
                refill_rate = limiter.policy().refill_rate(),
                "rate limiter configured"
            );
            limiters.insert(scope, Arc::new(limiter));
        }
        Ok(Self { limiters, store })
    }

    pub fn get(&self, scope: &str) -> Option<&Arc<TokenBucket>> {
        self.limiters.get(scope)
    }

    fn require(&self, scope: &str) -> Result<Arc<TokenBucket>, ServerError> {
        self.get(scope).cloned().ok_or_else(|| ServerError::MissingScope {
            scope: scope.to_string(),
        })
    }

    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }

    pub fn store(&self) -> &Arc<dyn BucketStore> {
        &self.store
    }
}

/// Bucket store selected by `config.store`.
///
/// Only the `redis` backend shares buckets across processes. Its connection
/// is opened lazily, so an unreachable server does not stop the node from
/// starting; requests follow the failure policy until it comes up.
pub fn build_store(config: &NodeConfig, time: Arc<dyn TimeProvider>) -> Result<Arc<dyn BucketStore>, ServerError> {
    let backend = config.store_backend();
    let store: Arc<dyn BucketStore> = match backend {
        StoreBackend::Local => Arc::new(LocalBucketStore::new()),
        StoreBackend::Kv => Arc::new(CasBucketStore::new(DeterministicKeyValueStore::with_time(time))),
        StoreBackend::Redis => Arc::new(RedisBucketStore::open(config.redis_url()).context(OpenStoreSnafu { backend })?),
    };
    Ok(store)
}

/// Assemble the node's router.
pub fn build_router(registry: Arc<LimiterRegistry>, trust_forwarded_for: bool) -> Result<Router, ServerError> {
    let guard = |scope: &str| -> Result<RateLimitState, ServerError> {
        Ok(RateLimitState::new(registry.require(scope)?, scope).with_trust_forwarded_for(trust_forwarded_for))
    };

    let chat = Router::new()
        .route("/api/messages", post(send_message))
        .layer(from_fn_with_state(guard(CHAT_SEND_SCOPE)?, rate_limit));
    let api = Router::new().route("/api/ping", get(ping)).layer(from_fn_with_state(guard(API_SCOPE)?, rate_limit));

    Ok(Router::new()
        .route("/health", get(health))
        .route("/admin/buckets/{scope}/{identity}", get(inspect_bucket))
        .with_state(registry)
        .merge(chat)
        .merge(api))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

// The extension is absent when a fail-open limiter let the request through.
fn remaining(extension: Option<Extension<RateRemaining>>) -> Option<u64> {
    extension.map(|Extension(RateRemaining(n))| n)
}

async fn ping(rate: Option<Extension<RateRemaining>>) -> Json<serde_json::Value> {
    Json(json!({ "pong": true, "rate_remaining": remaining(rate) }))
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessage {
    pub room: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageAccepted {
    pub room: String,
    pub length: usize,
    pub rate_remaining: Option<u64>,
}

async fn send_message(
    rate: Option<Extension<RateRemaining>>,
    Json(message): Json<SendMessage>,
) -> (StatusCode, Json<MessageAccepted>) {
    // Delivery to the room belongs to the realtime transport.
    let accepted = MessageAccepted {
        length: message.text.chars().count(),
        room: message.room,
        rate_remaining: remaining(rate),
    };
    (StatusCode::ACCEPTED, Json(accepted))
}

async fn inspect_bucket(
    State(registry): State<Arc<LimiterRegistry>>,
    Path((scope, identity)): Path<(String, String)>,
) -> Response {
    let Some(limiter) = registry.get(&scope) else {
        return (StatusCode::NOT_FOUND, Json(json!({ "detail": format!("unknown scope '{scope}'") }))).into_response();
    };

    match limiter.tokens_available(&scope, &identity).await {
        Ok(tokens) => Json(json!({
            "scope": scope,
            "identity": identity,
            "tokens_available": tokens,
            "capacity": limiter.policy().capacity(),
            "refill_rate": limiter.policy().refill_rate(),
        }))
        .into_response(),
        Err(RateLimitError::InvalidKey { reason }) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "detail": reason }))).into_response()
        }
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "detail": e.to_string() }))).into_response(),
    }
}
