//! Client configuration.
//!
//! The binary fills this from command-line flags and environment variables;
//! tests build it directly.

use crate::retry::RetryPolicy;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:50051";
pub const SEPOLIA_CHAIN_ID: u64 = 11_155_111;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("endpoint must be an http(s) URL, got '{0}'")]
    Endpoint(String),
    #[error("chain id must be non-zero")]
    ChainId,
    #[error("poll interval must be positive")]
    PollInterval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u32,
}

/// Everything a wallet needs to add a chain it does not know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainParams {
    pub chain_id: u64,
    pub chain_name: String,
    pub native_currency: NativeCurrency,
    pub rpc_urls: Vec<String>,
    pub block_explorer_urls: Vec<String>,
}

impl ChainParams {
    pub fn sepolia() -> Self {
        Self {
            chain_id: SEPOLIA_CHAIN_ID,
            chain_name: "Sepolia Test Network".to_string(),
            native_currency: NativeCurrency {
                name: "SepoliaETH".to_string(),
                symbol: "ETH".to_string(),
                decimals: 18,
            },
            rpc_urls: vec!["https://sepolia.infura.io/v3/".to_string()],
            block_explorer_urls: vec!["https://sepolia.etherscan.io".to_string()],
        }
    }

    /// Chain id in the `0x`-prefixed form wallets expect.
    pub fn chain_id_hex(&self) -> String {
        format!("{:#x}", self.chain_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub endpoint: String,
    pub chain: ChainParams,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    /// `None` waits for confirmation indefinitely.
    pub confirmation_timeout: Option<Duration>,
    pub read_retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            chain: ChainParams::sepolia(),
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            confirmation_timeout: None,
            read_retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(ConfigError::Endpoint(self.endpoint.clone()));
        }
        if self.chain.chain_id == 0 {
            return Err(ConfigError::ChainId);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::PollInterval);
        }
        Ok(())
    }
}
