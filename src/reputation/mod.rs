//! Per-identity reputation records and ban state.
//!
//! Both live in the shared cache under a fixed key scheme that other
//! services read as well:
//!
//! - `reputation:<identity>`: JSON [`ReputationRecord`], no expiry
//! - `ban:<identity>`: the marker `"banned"`, expiring after the ban duration

pub mod tracker;

pub use tracker::ReputationTracker;

use crate::cache::CacheError;
use crate::config::ReputationConfig;
use serde::{Deserialize, Serialize};

/// Value stored under a ban key. Only its presence matters.
pub const BAN_MARKER: &str = "banned";

/// Cache key of an identity's reputation record.
pub fn reputation_key(identity: &str) -> String {
    format!("reputation:{}", identity)
}

/// Cache key of an identity's ban entry.
pub fn ban_key(identity: &str) -> String {
    format!("ban:{}", identity)
}

/// Reputation state of one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationRecord {
    /// Unbounded in both directions.
    pub score: i64,
    /// Consecutive failures since the last success.
    pub failed_attempts_streak: u32,
    /// Unix seconds.
    pub last_successful_attempt_ts: Option<i64>,
    /// Unix seconds.
    pub last_failed_attempt_ts: Option<i64>,
    pub total_requests: u64,
    pub total_failures: u64,
}

impl ReputationRecord {
    /// Record of an identity that has never been seen.
    pub fn new(policy: &ReputationConfig) -> Self {
        Self {
            score: policy.initial_score,
            failed_attempts_streak: 0,
            last_successful_attempt_ts: None,
            last_failed_attempt_ts: None,
            total_requests: 0,
            total_failures: 0,
        }
    }

    /// Apply a successful attempt at time `now`.
    pub fn record_success(&mut self, policy: &ReputationConfig, now: i64) {
        self.score = self.score.saturating_add(policy.score_increment);
        self.failed_attempts_streak = 0;
        self.last_successful_attempt_ts = Some(now);
        self.total_requests += 1;
    }

    /// Apply a failed attempt at time `now`.
    pub fn record_failure(&mut self, policy: &ReputationConfig, now: i64) {
        self.score = self.score.saturating_sub(policy.score_decrement);
        self.failed_attempts_streak = self.failed_attempts_streak.saturating_add(1);
        self.last_failed_attempt_ts = Some(now);
        self.total_requests += 1;
        self.total_failures += 1;
    }

    /// Whether this record calls for a ban.
    pub fn should_ban(&self, policy: &ReputationConfig) -> bool {
        self.score < policy.ban_threshold_score
            || self.failed_attempts_streak >= policy.max_failed_streak
    }
}

/// Where a looked-up record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    /// Decoded from the cache.
    Stored,
    /// Nothing stored yet; the default record.
    Default,
    /// Stored value could not be decoded; the default record.
    Malformed,
    /// Cache unreachable; the default record.
    Unavailable,
}

impl RecordSource {
    /// True when the record is a fallback for a cache or data problem.
    pub fn is_degraded(&self) -> bool {
        matches!(self, RecordSource::Malformed | RecordSource::Unavailable)
    }
}

/// A reputation record together with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReputationLookup {
    pub record: ReputationRecord,
    pub source: RecordSource,
}

/// Ban state of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanStatus {
    /// A ban entry exists. `ttl_seconds` uses the cache's TTL convention.
    Banned { ttl_seconds: i64 },
    NotBanned,
    /// The cache could not be read.
    Unknown,
}

/// What a failure update did about bans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanOutcome {
    /// The ban condition does not hold.
    NotTriggered,
    /// A new ban entry was written.
    Imposed,
    /// The condition holds but a ban is already active and was left alone.
    AlreadyActive,
    /// The condition holds and the active ban was restarted.
    Extended,
}

/// Result of a committed reputation update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReputationUpdate {
    /// The record as written.
    pub record: ReputationRecord,
    pub ban: BanOutcome,
}

/// Error from a reputation update.
#[derive(Debug)]
pub enum TrackerError {
    /// Cache read or write failed.
    Cache(CacheError),
    /// Record could not be serialized.
    Encode(serde_json::Error),
    /// Concurrent writers kept winning the compare-and-swap.
    Contention { identity: String, attempts: u32 },
}

impl std::fmt::Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerError::Cache(e) => write!(f, "{}", e),
            TrackerError::Encode(e) => write!(f, "Failed to encode reputation record: {}", e),
            TrackerError::Contention { identity, attempts } => write!(
                f,
                "Reputation update for {} lost {} consecutive races",
                identity, attempts
            ),
        }
    }
}

impl std::error::Error for TrackerError {}

impl From<CacheError> for TrackerError {
    fn from(e: CacheError) -> Self {
        TrackerError::Cache(e)
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(e: serde_json::Error) -> Self {
        TrackerError::Encode(e)
    }
}
