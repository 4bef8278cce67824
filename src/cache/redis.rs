//! Redis cache backend.

use super::{ttl_seconds, Cache, CacheError};
use ::redis::aio::ConnectionManager;
use ::redis::{Client, Script};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Swap `KEYS[1]` to `ARGV[3]` if it currently holds `ARGV[2]`, or is absent
/// when `ARGV[1]` is "1". Runs atomically on the server.
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= false then
    return 0
  end
elseif current ~= ARGV[2] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

/// Redis-backed cache shared by every gateway replica.
///
/// The connection is opened on first use and re-established by the
/// connection manager after drops. A server that is down at startup is not
/// fatal: commands fail with [`CacheError::NotConnected`] until it comes back.
pub struct RedisCache {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    timeout: Duration,
    cas_script: Script,
}

impl RedisCache {
    /// Create a Redis cache. Only the URL is checked here.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, CacheError> {
        let client = Client::open(url)?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            timeout,
            cas_script: Script::new(COMPARE_AND_SWAP_SCRIPT),
        })
    }

    /// Create the cache and try to connect right away.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, CacheError> {
        let cache = Self::new(url, timeout)?;

        match cache.ping().await {
            Ok(()) => info!("Connected to Redis"),
            Err(e) => warn!(error = %e, "Redis unavailable at startup (will retry on use)"),
        }

        Ok(cache)
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                debug!("Opening Redis connection");
                let connect = ConnectionManager::new(self.client.clone());
                match tokio::time::timeout(self.timeout, connect).await {
                    Ok(Ok(manager)) => Ok(manager),
                    Ok(Err(e)) => Err(CacheError::NotConnected(e.to_string())),
                    Err(_) => Err(CacheError::NotConnected("connect timed out".to_string())),
                }
            })
            .await?;

        Ok(manager.clone())
    }

    /// Run a command future under the configured timeout.
    async fn bounded<T, F>(&self, command: F) -> Result<T, CacheError>
    where
        F: Future<Output = ::redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, command).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Timeout),
        }
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let mut cmd = ::redis::cmd("GET");
        cmd.arg(key);
        self.bounded(cmd.query_async(&mut conn)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_seconds(ttl));
        }
        self.bounded(cmd.query_async(&mut conn)).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_seconds(ttl));
        }
        let reply: ::redis::Value = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(!matches!(reply, ::redis::Value::Nil))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let mut invocation = self.cas_script.prepare_invoke();
        invocation
            .key(key)
            .arg(if expected.is_none() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(value);
        let swapped: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(swapped == 1)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let mut cmd = ::redis::cmd("EXISTS");
        cmd.arg(key);
        let count: i64 = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(count > 0)
    }

    async fn ttl(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.connection().await?;
        let mut cmd = ::redis::cmd("TTL");
        cmd.arg(key);
        self.bounded(cmd.query_async(&mut conn)).await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let cmd = ::redis::cmd("PING");
        let _: String = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "redis"
    }
}
