//! Token buckets shared through Redis.
//!
//! Each bucket is a Redis hash updated by a Lua script, so refill and
//! consumption are one atomic step even with many limiter processes. The
//! script applies the same formula as [`TokenBucket::refill`](super::bucket::TokenBucket::refill).

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use redis::{Client, Commands, Connection, Script};
use tracing::{debug, info};

use super::bucket::BucketPolicy;
use super::store::{BucketSnapshot, BucketStore};
use crate::error::{GatehouseError, Result};

const ACQUIRE_SCRIPT: &str = r#"
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl_ms = tonumber(ARGV[5])
local peek = tonumber(ARGV[6])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill', 'request_count')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
local count = tonumber(state[3]) or 0
if tokens == nil or last_refill == nil then
  tokens = burst
  last_refill = now
end

local elapsed = now - last_refill
if elapsed < 0 then elapsed = 0 end
tokens = math.min(burst, tokens + elapsed * rate)
if now > last_refill then last_refill = now end

local admitted = 0
if peek == 0 and tokens >= cost then
  tokens = tokens - cost
  count = count + 1
  admitted = 1
end

redis.call('HMSET', KEYS[1], 'tokens', tostring(tokens), 'last_refill', tostring(last_refill), 'request_count', count)
redis.call('PEXPIRE', KEYS[1], ttl_ms)
return {admitted, tostring(tokens), count}
"#;

/// Connection settings for [`RedisBucketStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub url: String,
    /// Prefix for bucket keys
    pub key_prefix: String,
    /// Connect, read and write timeout
    pub timeout: Duration,
    /// Buckets untouched for this long expire in Redis
    pub idle_ttl: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "gatehouse:bucket:".to_string(),
            timeout: Duration::from_millis(250),
            idle_ttl: Duration::from_secs(3600),
        }
    }
}

/// Bucket store backed by a Redis server.
pub struct RedisBucketStore {
    connection: Mutex<Connection>,
    script: Script,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisBucketStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBucketStore")
            .field("url", &self.config.url)
            .field("key_prefix", &self.config.key_prefix)
            .finish()
    }
}

impl RedisBucketStore {
    /// Connect to Redis.
    pub fn connect(config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let connection = client.get_connection_with_timeout(config.timeout)?;
        connection.set_read_timeout(Some(config.timeout))?;
        connection.set_write_timeout(Some(config.timeout))?;

        info!(url = %config.url, prefix = %config.key_prefix, "Connected to Redis bucket store");

        Ok(Self {
            connection: Mutex::new(connection),
            script: Script::new(ACQUIRE_SCRIPT),
            config,
        })
    }

    fn bucket_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn run(
        &self,
        key: &str,
        cost: f64,
        peek: bool,
        policy: &BucketPolicy,
        now: Duration,
    ) -> Result<BucketSnapshot> {
        let ttl_ms = self.config.idle_ttl.as_millis().max(1) as u64;
        let mut connection = self.connection.lock();
        let (admitted, tokens, request_count): (i64, String, u64) = self
            .script
            .key(self.bucket_key(key))
            .arg(policy.rate)
            .arg(policy.burst_size)
            .arg(cost)
            .arg(now.as_secs_f64())
            .arg(ttl_ms)
            .arg(u8::from(peek))
            .invoke(&mut *connection)?;

        let tokens = tokens.parse::<f64>().map_err(|e| {
            GatehouseError::Corrupt(format!("Redis returned malformed token count {:?}: {}", tokens, e))
        })?;

        Ok(BucketSnapshot {
            admitted: admitted == 1,
            tokens,
            request_count,
        })
    }
}

impl BucketStore for RedisBucketStore {
    fn acquire(
        &self,
        key: &str,
        cost: f64,
        policy: &BucketPolicy,
        now: Duration,
    ) -> Result<BucketSnapshot> {
        self.run(key, cost, false, policy, now)
    }

    fn peek(&self, key: &str, policy: &BucketPolicy, now: Duration) -> Result<BucketSnapshot> {
        self.run(key, 0.0, true, policy, now)
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let mut connection = self.connection.lock();
        let removed: u64 = connection.del(self.bucket_key(key))?;
        Ok(removed > 0)
    }

    fn evict_idle(&self, _cutoff: Duration) -> Result<usize> {
        // Redis expires idle buckets itself through the TTL set on every access.
        debug!("Idle eviction delegated to Redis key expiry");
        Ok(0)
    }

    fn len(&self) -> Result<usize> {
        let mut connection = self.connection.lock();
        let pattern = format!("{}*", self.config.key_prefix);
        let keys: Vec<String> = connection.scan_match::<_, String>(pattern)?.collect();
        Ok(keys.len())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
