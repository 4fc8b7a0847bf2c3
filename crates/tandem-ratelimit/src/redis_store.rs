//! Bucket store on a Redis server.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::Client;
use redis::RedisError;
use redis::Script;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::info;

use crate::cas::decode_state;
use crate::config::TokenBucketPolicy;
use crate::error::ConfigError;
use crate::error::RateLimitError;
use crate::key::BucketKey;
use crate::store::BucketStore;
use crate::types::BucketOutcome;
use crate::types::BucketState;

/// One limiter step, executed atomically by the server.
///
/// Same arithmetic as [`crate::pure::evaluate_bucket`], in the same order, so
/// both backends reach identical decisions. State is the JSON document the
/// other stores write. Tokens are formatted with 17 significant digits to
/// survive the round trip exactly.
///
/// Reply: `{allowed (0|1), retry_after_ms, state_json}`, or
/// `{-1, 0, reason}` when the stored value cannot be decoded.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local ttl_ms = tonumber(ARGV[4])

local tokens = capacity
local last_ms = now_ms
local raw = redis.call('GET', KEYS[1])
if raw then
  local ok, state = pcall(cjson.decode, raw)
  if not ok or type(state) ~= 'table' then
    return {-1, 0, 'invalid bucket state JSON'}
  end
  local t = state['tokens']
  local ts = state['last_update_ms']
  if type(t) ~= 'number' or type(ts) ~= 'number' or t ~= t or t < 0 or t == math.huge or ts < 0 then
    return {-1, 0, 'bucket state fields out of range'}
  end
  tokens = t
  last_ms = ts
end

local elapsed_ms = math.max(0, now_ms - last_ms)
tokens = math.min(capacity, math.max(tokens, 0) + (elapsed_ms / 1000.0) * rate)

local allowed = 0
local retry_ms = 0
if tokens >= 1.0 then
  tokens = tokens - 1.0
  allowed = 1
else
  retry_ms = math.ceil(((1.0 - tokens) / rate) * 1000.0)
  for _ = 1, 4 do
    if tokens + (retry_ms / 1000.0) * rate >= 1.0 then
      break
    end
    retry_ms = retry_ms + 1
  end
end

local encoded = string.format('{"tokens":%.17g,"last_update_ms":%d}', tokens, math.max(last_ms, now_ms))
redis.call('SET', KEYS[1], encoded, 'PX', ttl_ms)
return {allowed, retry_ms, encoded}
"#;

const CORRUPTED_REPLY: i64 = -1;

/// Holds bucket state in Redis so separate processes share one bucket per key.
///
/// Each [`BucketStore::apply`] is a single `EVALSHA` of the token bucket
/// script (falling back to `EVAL` once if the server has not cached it). The
/// server runs scripts one at a time, which makes the step atomic without
/// client-side retries. Key expiry is the server's `PX` TTL.
///
/// The connection is opened on first use and re-established by
/// [`ConnectionManager`] after failures. Until it is up, every call fails with
/// [`RateLimitError::StoreUnavailable`] and the limiter's failure policy
/// decides.
pub struct RedisBucketStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    script: Script,
}

impl RedisBucketStore {
    /// Parse `url` (e.g. `redis://localhost:6379/0`) without connecting.
    pub fn open(url: &str) -> Result<Self, ConfigError> {
        let client = Client::open(url).map_err(|e| ConfigError::InvalidStoreUrl { reason: e.to_string() })?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            script: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, RateLimitError> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                let connection = ConnectionManager::new(self.client.clone()).await?;
                info!("connected to redis bucket store");
                Ok::<_, RedisError>(connection)
            })
            .await
            .map_err(unavailable)?;
        Ok(connection.clone())
    }
}

fn unavailable(source: RedisError) -> RateLimitError {
    RateLimitError::StoreUnavailable {
        reason: format!("redis: {source}"),
    }
}

fn outcome_from_reply(
    key: &BucketKey,
    (status, retry_after_ms, payload): (i64, u64, String),
    ttl_ms: u64,
) -> Result<BucketOutcome, RateLimitError> {
    if status == CORRUPTED_REPLY {
        return Err(RateLimitError::CorruptedState {
            key: key.to_string(),
            reason: payload,
        });
    }
    Ok(BucketOutcome {
        state: decode_state(key, &payload)?,
        allowed: status == 1,
        retry_after_ms,
        ttl_ms,
    })
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn apply(
        &self,
        key: &BucketKey,
        policy: &TokenBucketPolicy,
        now_ms: u64,
    ) -> Result<BucketOutcome, RateLimitError> {
        let ttl_ms = policy.idle_ttl_ms();
        let mut connection = self.connection().await?;
        let reply: (i64, u64, String) = self
            .script
            .key(key.as_str())
            .arg(policy.capacity())
            .arg(policy.refill_rate())
            .arg(now_ms)
            .arg(ttl_ms)
            .invoke_async(&mut connection)
            .await
            .map_err(unavailable)?;
        outcome_from_reply(key, reply, ttl_ms)
    }

    async fn load(&self, key: &BucketKey, _now_ms: u64) -> Result<Option<BucketState>, RateLimitError> {
        let mut connection = self.connection().await?;
        let raw: Option<String> = connection.get(key.as_str()).await.map_err(unavailable)?;
        raw.as_deref().map(|value| decode_state(key, value)).transpose()
    }
}
