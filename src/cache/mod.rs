//! Key-value cache holding reputation and ban state.
//!
//! The tracker only talks to the [`Cache`] trait. Two backends exist: an
//! in-process map for single-node deployments and tests, and Redis for
//! deployments where several replicas share state.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

/// `ttl` result for a key that does not exist.
pub const TTL_KEY_ABSENT: i64 = -2;

/// `ttl` result for a key that exists without an expiry.
pub const TTL_NO_EXPIRY: i64 = -1;

/// Error from a cache backend.
#[derive(Debug)]
pub enum CacheError {
    /// No connection to the backend could be established.
    NotConnected(String),
    /// The command did not complete within the configured timeout.
    Timeout,
    /// Redis reported an error.
    Redis(::redis::RedisError),
    /// Other backend failure.
    Backend(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::NotConnected(msg) => write!(f, "Cache not connected: {}", msg),
            CacheError::Timeout => write!(f, "Cache command timed out"),
            CacheError::Redis(e) => write!(f, "Redis error: {}", e),
            CacheError::Backend(msg) => write!(f, "Cache backend error: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<::redis::RedisError> for CacheError {
    fn from(e: ::redis::RedisError) -> Self {
        if e.is_timeout() {
            CacheError::Timeout
        } else if e.is_connection_refusal() || e.is_connection_dropped() {
            CacheError::NotConnected(e.to_string())
        } else {
            CacheError::Redis(e)
        }
    }
}

/// Operations the reputation tracker needs from its store.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Read a value. `None` when the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Write a value unconditionally, replacing any previous TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Write a value only if the key is absent. Returns whether it was written.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError>;

    /// Atomically replace the value if it still equals `expected`
    /// (`None` meaning the key must be absent). The written key has no expiry.
    /// Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, CacheError>;

    /// Check whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Remaining lifetime in whole seconds, [`TTL_NO_EXPIRY`] or [`TTL_KEY_ABSENT`].
    async fn ttl(&self, key: &str) -> Result<i64, CacheError>;

    /// Round-trip to the backend.
    async fn ping(&self) -> Result<(), CacheError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// Whole seconds for a TTL, rounded up and never zero.
pub(crate) fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}
