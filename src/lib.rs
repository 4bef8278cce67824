//! IoT Access Gateway.
//!
//! HTTP front for an NFT-based IoT access-control contract. Every access
//! check passes through a reputation tracker that scores wallets on granted
//! and denied attempts and temporarily bans the ones that keep failing.
//!
//! # Features
//!
//! - **Reputation Scoring** - Score goes up on granted access, down on denied access
//! - **Temporary Bans** - Ban on low score or a streak of consecutive denials, expiring by TTL
//! - **Shared State** - Reputation and bans live in Redis, so replicas agree
//! - **Lost-Update Safe** - Record updates use compare-and-swap with retries
//! - **Fail-Open/Closed** - Configurable behavior when the cache is unreachable
//! - **Chain Lookups** - `hasAccess` / `accessControl` via JSON-RPC `eth_call`
//!
//! # Example Configuration
//!
//! ```yaml
//! settings:
//!   fail_action: allow
//!
//! cache:
//!   backend: redis
//!   url: "redis://localhost:6379/0"
//!
//! reputation:
//!   max_failed_streak: 3
//!   ban_threshold_score: 50
//!   ban_duration_seconds: 300
//!
//! chain:
//!   rpc_url: "https://polygon-mainnet.g.alchemy.com/v2/${ALCHEMY_API_KEY}"
//!   contract_address: "0x5FbDB2315678afecb367f032d93F642f64180aa3"
//! ```

pub mod cache;
pub mod config;
pub mod gateway;
pub mod oracle;
pub mod reputation;
pub mod server;

pub use config::Config;
pub use gateway::AccessGateway;
pub use reputation::ReputationTracker;
