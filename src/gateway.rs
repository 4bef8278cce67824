//! Access-check workflow.
//!
//! Every check consults the ban list first, then asks the chain, then feeds
//! the answer back into the identity's reputation.

use crate::config::{is_address, FailAction};
use crate::oracle::{AccessOracle, OracleError};
use crate::reputation::{BanOutcome, BanStatus, ReputationTracker};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of an access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Granted,
    Denied,
    /// The identity is banned; retry after this many seconds.
    RateLimited { retry_after: u64 },
}

/// Error from an access check. Neither variant touches reputation.
#[derive(Debug)]
pub enum GatewayError {
    /// The user is not a well-formed address.
    InvalidIdentity(String),
    /// The chain could not be asked.
    Oracle(OracleError),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::InvalidIdentity(value) => write!(f, "Invalid address: {}", value),
            GatewayError::Oracle(e) => write!(f, "Access lookup failed: {}", e),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<OracleError> for GatewayError {
    fn from(e: OracleError) -> Self {
        GatewayError::Oracle(e)
    }
}

/// Access gateway.
pub struct AccessGateway {
    tracker: Arc<ReputationTracker>,
    oracle: Arc<dyn AccessOracle>,
    allowlist: HashSet<String>,
    log_allowed: bool,
}

impl AccessGateway {
    pub fn new(tracker: Arc<ReputationTracker>, oracle: Arc<dyn AccessOracle>) -> Self {
        Self {
            tracker,
            oracle,
            allowlist: HashSet::new(),
            log_allowed: false,
        }
    }

    /// Identities that skip ban checks and reputation tracking.
    pub fn with_allowlist(mut self, identities: Vec<String>) -> Self {
        self.allowlist = identities
            .into_iter()
            .map(|identity| identity.to_ascii_lowercase())
            .collect();
        self
    }

    /// Log granted checks at info level.
    pub fn with_allowed_logging(mut self, enabled: bool) -> Self {
        self.log_allowed = enabled;
        self
    }

    pub fn tracker(&self) -> &Arc<ReputationTracker> {
        &self.tracker
    }

    pub fn oracle(&self) -> &Arc<dyn AccessOracle> {
        &self.oracle
    }

    fn is_allowlisted(&self, identity: &str) -> bool {
        self.allowlist.contains(identity)
    }

    /// Check whether `user` may access `token_id` and record the result.
    pub async fn check_access(
        &self,
        token_id: u64,
        user: &str,
    ) -> Result<AccessDecision, GatewayError> {
        let identity = normalize_identity(user)?;

        if self.is_allowlisted(&identity) {
            debug!(identity = %identity, "Identity is allowlisted");
            let granted = self.oracle.has_access(token_id, &identity).await?;
            return Ok(decision_for(granted));
        }

        match self.tracker.ban_status(&identity).await {
            BanStatus::Banned { ttl_seconds } => {
                debug!(identity = %identity, ttl_seconds, "Rejecting banned identity");
                return Ok(AccessDecision::RateLimited {
                    retry_after: ttl_seconds.max(1) as u64,
                });
            }
            BanStatus::Unknown if self.tracker.fail_action() == FailAction::Block => {
                return Ok(AccessDecision::RateLimited { retry_after: 1 });
            }
            BanStatus::Unknown | BanStatus::NotBanned => {}
        }

        let granted = match self.oracle.has_access(token_id, &identity).await {
            Ok(granted) => granted,
            Err(e) => {
                warn!(
                    oracle = self.oracle.name(),
                    token_id,
                    identity = %identity,
                    error = %e,
                    "Access lookup failed"
                );
                return Err(GatewayError::Oracle(e));
            }
        };

        let update = if granted {
            self.tracker.update_reputation_on_success(&identity).await
        } else {
            self.tracker.update_reputation_on_failure(&identity).await
        };

        match update {
            Ok(update) => {
                if update.ban == BanOutcome::Imposed {
                    debug!(identity = %identity, "Ban takes effect from the next request");
                }
            }
            // Reputation is best effort; the answer from the chain still stands
            Err(e) => warn!(identity = %identity, error = %e, "Reputation update failed"),
        }

        if granted && self.log_allowed {
            info!(token_id, identity = %identity, "Access granted");
        }

        Ok(decision_for(granted))
    }
}

fn decision_for(granted: bool) -> AccessDecision {
    if granted {
        AccessDecision::Granted
    } else {
        AccessDecision::Denied
    }
}

/// Validate a wallet address and return the identity it is tracked under.
///
/// Addresses are case-insensitive, so checksummed and lower-case spellings
/// share one reputation.
pub fn normalize_identity(user: &str) -> Result<String, GatewayError> {
    let trimmed = user.trim();
    if !is_address(trimmed) {
        return Err(GatewayError::InvalidIdentity(user.to_string()));
    }
    Ok(trimmed.to_ascii_lowercase())
}
