//! Reputation tracker: score updates, ban decisions, ban lookups.

use super::{
    ban_key, reputation_key, BanOutcome, BanStatus, RecordSource, ReputationLookup,
    ReputationRecord, ReputationUpdate, TrackerError, BAN_MARKER,
};
use crate::cache::{Cache, TTL_KEY_ABSENT};
use crate::config::{FailAction, ReputationConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
enum Attempt {
    Success,
    Failure,
}

/// Tracks reputation and bans for arbitrary identity strings.
///
/// Holds no per-identity state of its own; everything lives in the injected
/// cache, so any number of trackers (and replicas) can share one backend.
/// Updates use compare-and-swap with retries, so concurrent updates of the
/// same identity are never lost.
pub struct ReputationTracker {
    cache: Arc<dyn Cache>,
    policy: ReputationConfig,
    fail_action: FailAction,
    log_bans: bool,
}

impl ReputationTracker {
    /// Create a tracker over `cache`. Fails open by default.
    pub fn new(cache: Arc<dyn Cache>, policy: ReputationConfig) -> Self {
        Self {
            cache,
            policy,
            fail_action: FailAction::Allow,
            log_bans: true,
        }
    }

    /// Set what `is_banned` reports when the cache cannot be read.
    pub fn with_fail_action(mut self, fail_action: FailAction) -> Self {
        self.fail_action = fail_action;
        self
    }

    /// Enable or disable the log line for every imposed ban.
    pub fn with_ban_logging(mut self, enabled: bool) -> Self {
        self.log_bans = enabled;
        self
    }

    /// Configured fail action.
    pub fn fail_action(&self) -> FailAction {
        self.fail_action
    }

    /// The backing cache.
    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    /// Whether a ban entry exists for `identity`.
    ///
    /// Never fails: if the cache cannot be read the configured fail action
    /// decides.
    pub async fn is_banned(&self, identity: &str) -> bool {
        match self.cache.exists(&ban_key(identity)).await {
            Ok(banned) => banned,
            Err(e) => {
                let assumed = self.fail_action == FailAction::Block;
                warn!(
                    identity = %identity,
                    error = %e,
                    assumed_banned = assumed,
                    "Ban lookup failed"
                );
                assumed
            }
        }
    }

    /// Ban state including remaining lifetime, or `Unknown` if the cache
    /// cannot be read.
    pub async fn ban_status(&self, identity: &str) -> BanStatus {
        match self.cache.ttl(&ban_key(identity)).await {
            Ok(TTL_KEY_ABSENT) => BanStatus::NotBanned,
            Ok(ttl_seconds) => BanStatus::Banned { ttl_seconds },
            Err(e) => {
                warn!(identity = %identity, error = %e, "Ban lookup failed");
                BanStatus::Unknown
            }
        }
    }

    /// Remaining ban lifetime in seconds.
    ///
    /// Returns `-2` when no ban exists (or the cache cannot be read) and `-1`
    /// for a ban entry without expiry.
    pub async fn get_ban_ttl(&self, identity: &str) -> i64 {
        match self.cache.ttl(&ban_key(identity)).await {
            Ok(ttl) => ttl,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Ban TTL lookup failed");
                TTL_KEY_ABSENT
            }
        }
    }

    /// Stored record, or the default record if there is none.
    ///
    /// Read-only: the default record is never written back.
    pub async fn get_reputation_data(&self, identity: &str) -> ReputationRecord {
        self.lookup(identity).await.record
    }

    /// Like [`get_reputation_data`](Self::get_reputation_data), but says
    /// whether the record was stored, new, or a fallback.
    pub async fn lookup(&self, identity: &str) -> ReputationLookup {
        match self.cache.get(&reputation_key(identity)).await {
            Ok(raw) => self.decode(identity, raw.as_deref()),
            Err(e) => {
                warn!(identity = %identity, error = %e, "Reputation lookup failed, using defaults");
                ReputationLookup {
                    record: ReputationRecord::new(&self.policy),
                    source: RecordSource::Unavailable,
                }
            }
        }
    }

    /// Reward a successful attempt and reset the failure streak.
    pub async fn update_reputation_on_success(
        &self,
        identity: &str,
    ) -> Result<ReputationUpdate, TrackerError> {
        let record = self.apply(identity, Attempt::Success).await?;

        debug!(identity = %identity, score = record.score, "Reputation increased");

        Ok(ReputationUpdate {
            record,
            ban: BanOutcome::NotTriggered,
        })
    }

    /// Penalise a failed attempt and ban the identity if the committed record
    /// crosses the score threshold or the streak limit.
    pub async fn update_reputation_on_failure(
        &self,
        identity: &str,
    ) -> Result<ReputationUpdate, TrackerError> {
        let record = self.apply(identity, Attempt::Failure).await?;

        debug!(
            identity = %identity,
            score = record.score,
            streak = record.failed_attempts_streak,
            "Reputation decreased"
        );

        let ban = if record.should_ban(&self.policy) {
            self.impose_ban(identity, &record).await?
        } else {
            BanOutcome::NotTriggered
        };

        Ok(ReputationUpdate { record, ban })
    }

    fn decode(&self, identity: &str, raw: Option<&str>) -> ReputationLookup {
        let Some(raw) = raw else {
            return ReputationLookup {
                record: ReputationRecord::new(&self.policy),
                source: RecordSource::Default,
            };
        };

        match serde_json::from_str(raw) {
            Ok(record) => ReputationLookup {
                record,
                source: RecordSource::Stored,
            },
            Err(e) => {
                warn!(
                    identity = %identity,
                    error = %e,
                    "Malformed reputation record, using defaults"
                );
                ReputationLookup {
                    record: ReputationRecord::new(&self.policy),
                    source: RecordSource::Malformed,
                }
            }
        }
    }

    /// Optimistic read-modify-write of the reputation record.
    async fn apply(
        &self,
        identity: &str,
        attempt: Attempt,
    ) -> Result<ReputationRecord, TrackerError> {
        let key = reputation_key(identity);
        let max_attempts = self.policy.max_update_retries.max(1);

        for round in 1..=max_attempts {
            let raw = self.cache.get(&key).await?;
            let mut record = self.decode(identity, raw.as_deref()).record;

            let now = chrono::Utc::now().timestamp();
            match attempt {
                Attempt::Success => record.record_success(&self.policy, now),
                Attempt::Failure => record.record_failure(&self.policy, now),
            }

            let encoded = serde_json::to_string(&record)?;
            if self
                .cache
                .compare_and_swap(&key, raw.as_deref(), &encoded)
                .await?
            {
                return Ok(record);
            }

            debug!(
                identity = %identity,
                attempt = round,
                "Reputation record changed concurrently, retrying"
            );
        }

        Err(TrackerError::Contention {
            identity: identity.to_string(),
            attempts: max_attempts,
        })
    }

    async fn impose_ban(
        &self,
        identity: &str,
        record: &ReputationRecord,
    ) -> Result<BanOutcome, TrackerError> {
        let key = ban_key(identity);
        let duration = Duration::from_secs(self.policy.ban_duration_seconds);

        let outcome = if self.policy.refresh_ban_on_repeat_offense {
            let active = self.cache.exists(&key).await?;
            self.cache.set(&key, BAN_MARKER, Some(duration)).await?;
            if active {
                BanOutcome::Extended
            } else {
                BanOutcome::Imposed
            }
        } else if self
            .cache
            .set_if_absent(&key, BAN_MARKER, Some(duration))
            .await?
        {
            BanOutcome::Imposed
        } else {
            BanOutcome::AlreadyActive
        };

        if self.log_bans && outcome != BanOutcome::AlreadyActive {
            info!(
                identity = %identity,
                score = record.score,
                streak = record.failed_attempts_streak,
                ttl_seconds = self.policy.ban_duration_seconds,
                extended = outcome == BanOutcome::Extended,
                "Identity banned"
            );
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, MemoryCache};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tracker_with(policy: ReputationConfig) -> (Arc<MemoryCache>, ReputationTracker) {
        let cache = Arc::new(MemoryCache::new(1000));
        let tracker = ReputationTracker::new(cache.clone(), policy);
        (cache, tracker)
    }

    fn tracker() -> (Arc<MemoryCache>, ReputationTracker) {
        tracker_with(ReputationConfig::default())
    }

    /// Cache whose every operation fails.
    struct DownCache;

    #[async_trait]
    impl Cache for DownCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::NotConnected("down".to_string()))
        }

        async fn set(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Option<Duration>,
        ) -> Result<(), CacheError> {
            Err(CacheError::NotConnected("down".to_string()))
        }

        async fn set_if_absent(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Option<Duration>,
        ) -> Result<bool, CacheError> {
            Err(CacheError::NotConnected("down".to_string()))
        }

        async fn compare_and_swap(
            &self,
            _key: &str,
            _expected: Option<&str>,
            _value: &str,
        ) -> Result<bool, CacheError> {
            Err(CacheError::NotConnected("down".to_string()))
        }

        async fn exists(&self, _key: &str) -> Result<bool, CacheError> {
            Err(CacheError::Timeout)
        }

        async fn ttl(&self, _key: &str) -> Result<i64, CacheError> {
            Err(CacheError::Timeout)
        }

        async fn ping(&self) -> Result<(), CacheError> {
            Err(CacheError::NotConnected("down".to_string()))
        }

        fn name(&self) -> &str {
            "down"
        }
    }

    /// Memory cache where another writer slips a failure update in before
    /// each of the first `races` compare-and-swaps.
    struct RacingCache {
        inner: MemoryCache,
        races: AtomicU32,
        always_lose: bool,
    }

    impl RacingCache {
        fn new(races: u32) -> Self {
            Self {
                inner: MemoryCache::new(1000),
                races: AtomicU32::new(races),
                always_lose: false,
            }
        }

        fn always_losing() -> Self {
            Self {
                always_lose: true,
                ..Self::new(0)
            }
        }
    }

    #[async_trait]
    impl Cache for RacingCache {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.get(key).await
        }

        async fn set(
            &self,
            key: &str,
            value: &str,
            ttl: Option<Duration>,
        ) -> Result<(), CacheError> {
            self.inner.set(key, value, ttl).await
        }

        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            ttl: Option<Duration>,
        ) -> Result<bool, CacheError> {
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<&str>,
            value: &str,
        ) -> Result<bool, CacheError> {
            if self.always_lose {
                return Ok(false);
            }

            let pending = self.races.load(Ordering::SeqCst);
            if pending > 0 {
                self.races.store(pending - 1, Ordering::SeqCst);
                let policy = ReputationConfig::default();
                let mut other = match self.inner.get(key).await? {
                    Some(raw) => serde_json::from_str(&raw).unwrap(),
                    None => ReputationRecord::new(&policy),
                };
                other.record_failure(&policy, 1);
                let encoded = serde_json::to_string(&other).unwrap();
                self.inner.set(key, &encoded, None).await?;
            }

            self.inner.compare_and_swap(key, expected, value).await
        }

        async fn exists(&self, key: &str) -> Result<bool, CacheError> {
            self.inner.exists(key).await
        }

        async fn ttl(&self, key: &str) -> Result<i64, CacheError> {
            self.inner.ttl(key).await
        }

        async fn ping(&self) -> Result<(), CacheError> {
            self.inner.ping().await
        }

        fn name(&self) -> &str {
            "racing"
        }
    }

    #[tokio::test]
    async fn test_unknown_identity_gets_defaults() {
        let (cache, tracker) = tracker();

        let lookup = tracker.lookup("0xnew").await;
        assert_eq!(lookup.source, RecordSource::Default);
        assert_eq!(lookup.record, ReputationRecord::new(&ReputationConfig::default()));
        assert_eq!(lookup.record.score, 100);

        // Reading never materialises a record
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_three_failures_ban_on_streak() {
        let (_cache, tracker) = tracker();

        let first = tracker.update_reputation_on_failure("X").await.unwrap();
        assert_eq!(first.ban, BanOutcome::NotTriggered);
        let second = tracker.update_reputation_on_failure("X").await.unwrap();
        assert_eq!(second.ban, BanOutcome::NotTriggered);
        assert!(!tracker.is_banned("X").await);

        let before = chrono::Utc::now().timestamp();
        let third = tracker.update_reputation_on_failure("X").await.unwrap();
        let after = chrono::Utc::now().timestamp();
        assert_eq!(third.ban, BanOutcome::Imposed);

        let record = tracker.get_reputation_data("X").await;
        assert_eq!(record.failed_attempts_streak, 3);
        assert_eq!(record.score, 70);
        assert_eq!(record.total_requests, 3);
        assert_eq!(record.total_failures, 3);
        let failed_at = record.last_failed_attempt_ts.unwrap();
        assert!(before <= failed_at && failed_at <= after);
        assert_eq!(record.last_successful_attempt_ts, None);
        assert!(tracker.is_banned("X").await);

        let ttl = tracker.get_ban_ttl("X").await;
        assert!(ttl > 295 && ttl <= 300, "unexpected ttl {}", ttl);
        assert_eq!(
            tracker.ban_status("X").await,
            BanStatus::Banned { ttl_seconds: ttl }
        );
    }

    #[tokio::test]
    async fn test_failure_then_success() {
        let (_cache, tracker) = tracker();

        let before = chrono::Utc::now().timestamp();
        tracker.update_reputation_on_failure("Y").await.unwrap();
        let between = chrono::Utc::now().timestamp();
        let update = tracker.update_reputation_on_success("Y").await.unwrap();
        let after = chrono::Utc::now().timestamp();
        assert_eq!(update.ban, BanOutcome::NotTriggered);

        let record = tracker.get_reputation_data("Y").await;
        assert_eq!(record.failed_attempts_streak, 0);
        assert_eq!(record.score, 95);
        assert_eq!(record.total_requests, 2);
        assert_eq!(record.total_failures, 1);
        let failed_at = record.last_failed_attempt_ts.unwrap();
        let succeeded_at = record.last_successful_attempt_ts.unwrap();
        assert!(before <= failed_at && failed_at <= between);
        assert!(between <= succeeded_at && succeeded_at <= after);
        assert_eq!(tracker.lookup("Y").await.source, RecordSource::Stored);
    }

    #[tokio::test]
    async fn test_success_resets_streak() {
        let policy = ReputationConfig {
            max_failed_streak: 10,
            ban_threshold_score: -1000,
            ..ReputationConfig::default()
        };
        let (_cache, tracker) = tracker_with(policy);

        for _ in 0..6 {
            tracker.update_reputation_on_failure("Z").await.unwrap();
        }
        assert_eq!(tracker.get_reputation_data("Z").await.failed_attempts_streak, 6);

        tracker.update_reputation_on_success("Z").await.unwrap();
        assert_eq!(tracker.get_reputation_data("Z").await.failed_attempts_streak, 0);
        assert!(!tracker.is_banned("Z").await);
    }

    #[tokio::test]
    async fn test_ban_on_score_threshold() {
        let policy = ReputationConfig {
            max_failed_streak: 100,
            ..ReputationConfig::default()
        };
        let (_cache, tracker) = tracker_with(policy);

        for _ in 0..5 {
            let update = tracker.update_reputation_on_failure("S").await.unwrap();
            assert_eq!(update.ban, BanOutcome::NotTriggered);
        }
        assert_eq!(tracker.get_reputation_data("S").await.score, 50);
        assert!(!tracker.is_banned("S").await);

        let update = tracker.update_reputation_on_failure("S").await.unwrap();
        assert_eq!(update.record.score, 40);
        assert_eq!(update.ban, BanOutcome::Imposed);
        assert!(tracker.is_banned("S").await);
    }

    #[tokio::test]
    async fn test_success_never_bans_even_below_threshold() {
        let policy = ReputationConfig {
            initial_score: 0,
            ..ReputationConfig::default()
        };
        let (_cache, tracker) = tracker_with(policy);

        let update = tracker.update_reputation_on_success("low").await.unwrap();
        assert_eq!(update.record.score, 5);
        assert_eq!(update.ban, BanOutcome::NotTriggered);
        assert!(!tracker.is_banned("low").await);
    }

    #[tokio::test]
    async fn test_ban_is_not_refreshed_by_default() {
        let (_cache, tracker) = tracker();

        for _ in 0..3 {
            tracker.update_reputation_on_failure("R").await.unwrap();
        }
        let before = tracker.get_ban_ttl("R").await;

        let update = tracker.update_reputation_on_failure("R").await.unwrap();
        assert_eq!(update.ban, BanOutcome::AlreadyActive);
        assert_eq!(update.record.failed_attempts_streak, 4);
        assert!(tracker.get_ban_ttl("R").await <= before);
    }

    #[tokio::test]
    async fn test_ban_refreshed_when_configured() {
        let policy = ReputationConfig {
            refresh_ban_on_repeat_offense: true,
            ..ReputationConfig::default()
        };
        let (_cache, tracker) = tracker_with(policy);

        for _ in 0..3 {
            tracker.update_reputation_on_failure("R").await.unwrap();
        }
        let update = tracker.update_reputation_on_failure("R").await.unwrap();
        assert_eq!(update.ban, BanOutcome::Extended);
        assert!(tracker.get_ban_ttl("R").await > 295);
    }

    #[tokio::test]
    async fn test_ban_expires() {
        let policy = ReputationConfig {
            max_failed_streak: 1,
            ban_duration_seconds: 1,
            ..ReputationConfig::default()
        };
        let (_cache, tracker) = tracker_with(policy);

        tracker.update_reputation_on_failure("E").await.unwrap();
        assert!(tracker.is_banned("E").await);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(!tracker.is_banned("E").await);
        assert_eq!(tracker.get_ban_ttl("E").await, TTL_KEY_ABSENT);
        assert_eq!(tracker.ban_status("E").await, BanStatus::NotBanned);

        // Still over the limit, so the next failure bans again
        let update = tracker.update_reputation_on_failure("E").await.unwrap();
        assert_eq!(update.ban, BanOutcome::Imposed);
    }

    #[tokio::test]
    async fn test_ban_ttl_counts_down() {
        let policy = ReputationConfig {
            max_failed_streak: 1,
            ban_duration_seconds: 5,
            ..ReputationConfig::default()
        };
        let (_cache, tracker) = tracker_with(policy);

        tracker.update_reputation_on_failure("T").await.unwrap();
        let first = tracker.get_ban_ttl("T").await;
        assert_eq!(first, 5);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let second = tracker.get_ban_ttl("T").await;
        assert!(second > 0 && second < first, "ttl went {} -> {}", first, second);
        assert!(tracker.is_banned("T").await);
    }

    #[tokio::test]
    async fn test_ban_survives_identity_churn() {
        let cache = Arc::new(MemoryCache::new(4));
        let tracker = ReputationTracker::new(cache.clone(), ReputationConfig::default());

        for _ in 0..3 {
            tracker.update_reputation_on_failure("X").await.unwrap();
        }
        assert!(tracker.is_banned("X").await);

        // Fresh identities push the cache past capacity
        for i in 0..8 {
            let identity = format!("rot{}", i);
            tracker.update_reputation_on_success(&identity).await.unwrap();
        }

        assert!(tracker.is_banned("X").await);
        let ttl = tracker.get_ban_ttl("X").await;
        assert!(ttl > 295 && ttl <= 300, "unexpected ttl {}", ttl);
        assert!(cache.len() <= 4);
    }

    #[tokio::test]
    async fn test_reads_do_not_mutate() {
        let (cache, tracker) = tracker();

        tracker.update_reputation_on_failure("I").await.unwrap();
        let stored = cache.get("reputation:I").await.unwrap();

        for _ in 0..5 {
            tracker.get_reputation_data("I").await;
            tracker.is_banned("I").await;
            tracker.get_ban_ttl("I").await;
            tracker.get_reputation_data("other").await;
            tracker.is_banned("other").await;
        }

        assert_eq!(cache.get("reputation:I").await.unwrap(), stored);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_record_falls_back_to_defaults() {
        let (cache, tracker) = tracker();
        cache.set("reputation:M", "{not json", None).await.unwrap();

        let lookup = tracker.lookup("M").await;
        assert_eq!(lookup.source, RecordSource::Malformed);
        assert_eq!(lookup.record.score, 100);

        // The next update replaces the corrupt value
        let update = tracker.update_reputation_on_success("M").await.unwrap();
        assert_eq!(update.record.score, 105);
        assert_eq!(tracker.lookup("M").await.source, RecordSource::Stored);
    }

    #[tokio::test]
    async fn test_cache_down_fail_open() {
        let tracker = ReputationTracker::new(Arc::new(DownCache), ReputationConfig::default());

        assert!(!tracker.is_banned("D").await);
        assert_eq!(tracker.ban_status("D").await, BanStatus::Unknown);
        assert_eq!(tracker.get_ban_ttl("D").await, TTL_KEY_ABSENT);

        let lookup = tracker.lookup("D").await;
        assert_eq!(lookup.source, RecordSource::Unavailable);
        assert_eq!(lookup.record.score, 100);

        assert!(matches!(
            tracker.update_reputation_on_failure("D").await,
            Err(TrackerError::Cache(_))
        ));
        assert!(matches!(
            tracker.update_reputation_on_success("D").await,
            Err(TrackerError::Cache(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_down_fail_closed() {
        let tracker = ReputationTracker::new(Arc::new(DownCache), ReputationConfig::default())
            .with_fail_action(FailAction::Block);

        assert!(tracker.is_banned("D").await);
        assert_eq!(tracker.fail_action(), FailAction::Block);
    }

    #[tokio::test]
    async fn test_concurrent_writer_is_not_lost() {
        let cache = Arc::new(RacingCache::new(2));
        let tracker = ReputationTracker::new(cache.clone(), ReputationConfig::default());

        let update = tracker.update_reputation_on_success("C").await.unwrap();

        // Two interleaved failures plus our success
        assert_eq!(update.record.total_requests, 3);
        assert_eq!(update.record.total_failures, 2);
        assert_eq!(update.record.failed_attempts_streak, 0);
        assert_eq!(update.record.score, 85);
        assert_eq!(tracker.get_reputation_data("C").await, update.record);
    }

    #[tokio::test]
    async fn test_contention_exhausts_retries() {
        let policy = ReputationConfig {
            max_update_retries: 3,
            ..ReputationConfig::default()
        };
        let tracker = ReputationTracker::new(Arc::new(RacingCache::always_losing()), policy);

        match tracker.update_reputation_on_failure("C").await {
            Err(TrackerError::Contention { identity, attempts }) => {
                assert_eq!(identity, "C");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected contention error, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_failures_all_counted() {
        let policy = ReputationConfig {
            max_update_retries: 1000,
            ..ReputationConfig::default()
        };
        let cache = Arc::new(MemoryCache::new(1000));
        let tracker = Arc::new(ReputationTracker::new(cache, policy).with_ban_logging(false));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.update_reputation_on_failure("P").await })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let record = tracker.get_reputation_data("P").await;
        assert_eq!(record.total_failures, 20);
        assert_eq!(record.failed_attempts_streak, 20);
        assert_eq!(record.score, -100);
        assert!(tracker.is_banned("P").await);
    }
}
