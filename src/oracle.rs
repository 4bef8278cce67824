//! Read-only view of the access-control NFT contract.

use crate::config::{parse_address, ChainConfig};
use alloy::primitives::{Address, U256};
use alloy::providers::{ProviderBuilder, RootProvider};
use alloy::sol;
use alloy::transports::http::{Client, Http};
use alloy::transports::RpcError;
use async_trait::async_trait;
use serde::Serialize;
use std::future::IntoFuture;
use std::time::Duration;
use tracing::debug;

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract IoTAccessNFT {
        function hasAccess(uint256 tokenId, address user) external view returns (bool);
        function accessControl(uint256 tokenId)
            external
            view
            returns (address delegatee, uint256 expiresAt);
    }
}

type HttpProvider = RootProvider<Http<Client>>;

/// Current delegation of a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessDetails {
    /// Lower-case hex address.
    pub delegatee: String,
    /// Unix seconds.
    pub expires_at: u64,
}

/// Error from the access oracle.
#[derive(Debug)]
pub enum OracleError {
    /// Transport failed (connection refused, bad status, ...).
    Transport(String),
    /// Timeout.
    Timeout,
    /// Node returned a JSON-RPC error (reverts included).
    Rpc { code: i64, message: String },
    /// Invalid response.
    InvalidResponse(String),
    /// Argument could not be encoded.
    InvalidInput(String),
}

impl std::fmt::Display for OracleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OracleError::Transport(msg) => write!(f, "Transport error: {}", msg),
            OracleError::Timeout => write!(f, "Request timed out"),
            OracleError::Rpc { code, message } => write!(f, "RPC error {}: {}", code, message),
            OracleError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
            OracleError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
        }
    }
}

impl std::error::Error for OracleError {}

impl From<alloy::contract::Error> for OracleError {
    fn from(e: alloy::contract::Error) -> Self {
        match e {
            alloy::contract::Error::TransportError(RpcError::ErrorResp(payload)) => {
                OracleError::Rpc {
                    code: payload.code,
                    message: payload.message.to_string(),
                }
            }
            alloy::contract::Error::TransportError(e) => OracleError::Transport(e.to_string()),
            other => OracleError::InvalidResponse(other.to_string()),
        }
    }
}

/// Source of truth for token access.
#[async_trait]
pub trait AccessOracle: Send + Sync {
    /// Whether `user` may currently use the device behind `token_id`.
    async fn has_access(&self, token_id: u64, user: &str) -> Result<bool, OracleError>;

    /// Current delegation of `token_id`, `None` if it has never been delegated.
    async fn access_details(&self, token_id: u64) -> Result<Option<AccessDetails>, OracleError>;

    /// Oracle name for logging.
    fn name(&self) -> &str;
}

/// Oracle backed by `eth_call` against a JSON-RPC node.
pub struct JsonRpcAccessOracle {
    contract: IoTAccessNFT::IoTAccessNFTInstance<Http<Client>, HttpProvider>,
    timeout: Duration,
}

impl JsonRpcAccessOracle {
    /// Create a new JSON-RPC oracle. No request is made until the first call.
    pub fn new(config: ChainConfig) -> Result<Self, OracleError> {
        let url = config
            .rpc_url
            .parse()
            .map_err(|e| OracleError::InvalidInput(format!("rpc url {}: {}", config.rpc_url, e)))?;
        let address = parse_address(&config.contract_address).ok_or_else(|| {
            OracleError::InvalidInput(format!("contract address {}", config.contract_address))
        })?;

        let provider = ProviderBuilder::new().on_http(url);

        Ok(Self {
            contract: IoTAccessNFT::new(address, provider),
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    /// Run a contract call under the configured timeout.
    async fn bounded<T, F>(&self, call: F) -> Result<T, OracleError>
    where
        F: IntoFuture<Output = Result<T, alloy::contract::Error>>,
    {
        match tokio::time::timeout(self.timeout, call.into_future()).await {
            Ok(result) => result.map_err(OracleError::from),
            Err(_) => Err(OracleError::Timeout),
        }
    }
}

#[async_trait]
impl AccessOracle for JsonRpcAccessOracle {
    async fn has_access(&self, token_id: u64, user: &str) -> Result<bool, OracleError> {
        let account = parse_address(user)
            .ok_or_else(|| OracleError::InvalidInput(format!("address {}", user)))?;

        let call = self.contract.hasAccess(U256::from(token_id), account);
        let granted = self.bounded(call.call()).await?._0;

        debug!(token_id, user = %user, granted, "hasAccess call complete");

        Ok(granted)
    }

    async fn access_details(&self, token_id: u64) -> Result<Option<AccessDetails>, OracleError> {
        let call = self.contract.accessControl(U256::from(token_id));
        let reply = self.bounded(call.call()).await?;
        Ok(delegation(reply.delegatee, reply.expiresAt))
    }

    fn name(&self) -> &str {
        "json-rpc"
    }
}

/// Zero delegatee means the token was never delegated. Expiries past `u64`
/// are effectively "never".
fn delegation(delegatee: Address, expires_at: U256) -> Option<AccessDetails> {
    if delegatee == Address::ZERO {
        return None;
    }

    Some(AccessDetails {
        delegatee: format!("0x{}", alloy::hex::encode(delegatee)),
        expires_at: u64::try_from(expires_at).unwrap_or(u64::MAX),
    })
}
