//! Configuration types for the access gateway.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

/// Longest ban the gateway accepts: one year.
pub const MAX_BAN_DURATION_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Root configuration for the access gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings.
    #[serde(default)]
    pub settings: Settings,

    /// HTTP listener configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared key-value cache holding reputation and ban state.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Reputation scoring and ban policy.
    #[serde(default)]
    pub reputation: ReputationConfig,

    /// Blockchain RPC endpoint and access-control contract.
    pub chain: ChainConfig,

    /// Identities exempt from reputation tracking and bans.
    #[serde(default)]
    pub allowlist: Vec<String>,
}

/// Global settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// What to assume about ban state when the cache cannot be read.
    #[serde(default)]
    pub fail_action: FailAction,

    /// Log every ban that is imposed.
    #[serde(default = "default_true")]
    pub log_bans: bool,

    /// Log granted access checks.
    #[serde(default)]
    pub log_allowed: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fail_action: FailAction::default(),
            log_bans: true,
            log_allowed: false,
        }
    }
}

/// Action to take when ban state cannot be determined.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailAction {
    /// Treat the identity as not banned (fail-open).
    #[default]
    Allow,
    /// Treat the identity as banned (fail-closed).
    Block,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Socket address to bind.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
        }
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:8000".to_string()
}

/// Cache backend selection.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// In-process cache. State is lost on restart and not shared between replicas.
    Memory,
    /// Redis server shared by every replica.
    #[default]
    Redis,
}

/// Cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,

    /// Redis connection URL (supports ${ENV_VAR} syntax).
    #[serde(default = "default_cache_url")]
    pub url: String,

    /// Upper bound for a single cache command in milliseconds.
    #[serde(default = "default_cache_timeout")]
    pub timeout_ms: u64,

    /// Capacity of the memory backend.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            url: default_cache_url(),
            timeout_ms: default_cache_timeout(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_cache_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_cache_timeout() -> u64 {
    2000
}

fn default_max_entries() -> usize {
    100_000
}

/// Reputation scoring and ban policy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReputationConfig {
    /// Starting score for identities with no stored record.
    #[serde(default = "default_initial_score")]
    pub initial_score: i64,

    /// Added to the score on every successful access.
    #[serde(default = "default_score_increment")]
    pub score_increment: i64,

    /// Subtracted from the score on every failed access.
    #[serde(default = "default_score_decrement")]
    pub score_decrement: i64,

    /// Consecutive failures that trigger a ban.
    #[serde(default = "default_max_failed_streak")]
    pub max_failed_streak: u32,

    /// A score strictly below this value triggers a ban.
    #[serde(default = "default_ban_threshold_score")]
    pub ban_threshold_score: i64,

    /// Lifetime of a ban entry.
    #[serde(default = "default_ban_duration")]
    pub ban_duration_seconds: u64,

    /// Attempts of the optimistic read-modify-write loop before giving up.
    #[serde(default = "default_max_update_retries")]
    pub max_update_retries: u32,

    /// Restart the ban TTL when an already banned identity fails again.
    #[serde(default)]
    pub refresh_ban_on_repeat_offense: bool,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            initial_score: default_initial_score(),
            score_increment: default_score_increment(),
            score_decrement: default_score_decrement(),
            max_failed_streak: default_max_failed_streak(),
            ban_threshold_score: default_ban_threshold_score(),
            ban_duration_seconds: default_ban_duration(),
            max_update_retries: default_max_update_retries(),
            refresh_ban_on_repeat_offense: false,
        }
    }
}

fn default_initial_score() -> i64 {
    100
}

fn default_score_increment() -> i64 {
    5
}

fn default_score_decrement() -> i64 {
    10
}

fn default_max_failed_streak() -> u32 {
    3
}

fn default_ban_threshold_score() -> i64 {
    50
}

fn default_ban_duration() -> u64 {
    300
}

fn default_max_update_retries() -> u32 {
    8
}

/// Blockchain endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainConfig {
    /// JSON-RPC endpoint (supports ${ENV_VAR} syntax).
    pub rpc_url: String,

    /// Address of the access-control NFT contract.
    pub contract_address: String,

    /// RPC request timeout in milliseconds.
    #[serde(default = "default_chain_timeout")]
    pub timeout_ms: u64,
}

fn default_chain_timeout() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content);
        let mut config: Config = serde_yaml::from_str(&expanded)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply the `REDIS_URL` and `REPUTATION_*` overrides.
    ///
    /// `lookup` resolves a variable name to its value. Values that fail to
    /// parse are logged and skipped.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let rep = &mut self.reputation;
        override_from(&lookup, "REDIS_URL", &mut self.cache.url);
        override_from(&lookup, "REPUTATION_INITIAL_SCORE", &mut rep.initial_score);
        override_from(&lookup, "REPUTATION_SCORE_INCREMENT", &mut rep.score_increment);
        override_from(&lookup, "REPUTATION_SCORE_DECREMENT", &mut rep.score_decrement);
        override_from(&lookup, "REPUTATION_MAX_FAILED_STREAK", &mut rep.max_failed_streak);
        override_from(&lookup, "REPUTATION_BAN_THRESHOLD_SCORE", &mut rep.ban_threshold_score);
        override_from(&lookup, "REPUTATION_BAN_DURATION_SECONDS", &mut rep.ban_duration_seconds);
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let rep = &self.reputation;

        if rep.max_failed_streak == 0 {
            anyhow::bail!("max_failed_streak must be at least 1");
        }
        if rep.ban_duration_seconds == 0 {
            anyhow::bail!("ban_duration_seconds must be at least 1");
        }
        if rep.ban_duration_seconds > MAX_BAN_DURATION_SECONDS {
            anyhow::bail!(
                "ban_duration_seconds ({}) exceeds the maximum of {}",
                rep.ban_duration_seconds,
                MAX_BAN_DURATION_SECONDS
            );
        }
        if rep.score_increment < 0 {
            anyhow::bail!("score_increment ({}) must not be negative", rep.score_increment);
        }
        if rep.score_decrement < 0 {
            anyhow::bail!("score_decrement ({}) must not be negative", rep.score_decrement);
        }
        if rep.max_update_retries == 0 {
            anyhow::bail!("max_update_retries must be at least 1");
        }

        if self.cache.backend == CacheBackend::Redis && self.cache.url.trim().is_empty() {
            anyhow::bail!("Redis cache backend selected but cache url is empty");
        }

        if self.chain.rpc_url.trim().is_empty() {
            anyhow::bail!("chain.rpc_url is empty");
        }
        if !is_address(&self.chain.contract_address) {
            anyhow::bail!(
                "chain.contract_address is not a valid address: {}",
                self.chain.contract_address
            );
        }

        for entry in &self.allowlist {
            if !is_address(entry) {
                anyhow::bail!("Invalid allowlist entry: {}", entry);
            }
        }

        Ok(())
    }

    /// Allowlist entries in normalised (lower-case) form.
    pub fn parse_allowlist(&self) -> Vec<String> {
        self.allowlist
            .iter()
            .filter(|entry| is_address(entry))
            .map(|entry| entry.to_ascii_lowercase())
            .collect()
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# IoT Access Gateway Configuration

settings:
  fail_action: allow           # allow or block when ban state cannot be read
  log_bans: true
  log_allowed: false

server:
  listen_address: "0.0.0.0:8000"

# Reputation and ban state live here; share it between replicas
cache:
  backend: redis               # redis or memory
  url: "redis://localhost:6379/0"   # REDIS_URL overrides this
  timeout_ms: 2000
  max_entries: 100000          # memory backend only

reputation:
  initial_score: 100
  score_increment: 5           # added on granted access
  score_decrement: 10          # subtracted on denied access
  max_failed_streak: 3         # consecutive denials before a ban
  ban_threshold_score: 50      # ban when score drops below this
  ban_duration_seconds: 300
  max_update_retries: 8
  refresh_ban_on_repeat_offense: false

chain:
  rpc_url: "https://polygon-mainnet.g.alchemy.com/v2/${ALCHEMY_API_KEY}"
  contract_address: "0x0000000000000000000000000000000000000000"
  timeout_ms: 10000

# Identities never banned and never scored
allowlist:
  - "0x000000000000000000000000000000000000dead"
"#
        .to_string()
    }
}

fn override_from<F, T>(lookup: &F, name: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = lookup(name) else {
        return;
    };

    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => warn!(variable = name, value = %raw, "Ignoring unparsable environment override"),
    }
}

/// Parse a `0x`-prefixed address. Checksum casing is not enforced.
pub fn parse_address(value: &str) -> Option<Address> {
    if !value.starts_with("0x") {
        return None;
    }
    Address::from_str(value).ok()
}

/// Check for a `0x`-prefixed, 20-byte hex address.
pub fn is_address(value: &str) -> bool {
    parse_address(value).is_some()
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        let var_value = std::env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
