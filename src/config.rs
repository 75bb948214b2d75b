/// Runtime configuration.
///
/// Every setting is a CLI flag with an environment variable fallback, so the
/// service can be configured from a `.env`-style deployment or the command
/// line alike.
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::Address;
use clap::Args;

use crate::anchor::AnchorConfig;
use crate::chain::{ChainConfig, FeeConfig};
use crate::error::{ProofError, Result};
use crate::generation::OpenAiConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Args)]
pub struct Config {
    /// JSON-RPC endpoint of the EVM chain.
    #[arg(long, env = "WEB3_PROVIDER_URL")]
    pub rpc_url: Option<String>,

    /// Address of the proof anchor contract.
    #[arg(long, env = "CONTRACT_ADDRESS")]
    pub contract_address: Option<String>,

    /// Hex private key of the signing account. Without it the chain is read-only.
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,

    /// Expected chain id; startup fails if the node reports another.
    #[arg(long, env = "CHAIN_ID")]
    pub chain_id: Option<u64>,

    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://proofs.db")]
    pub database_url: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    /// Priority fee in gwei.
    #[arg(long, env = "MAX_PRIORITY_FEE_PER_GAS", default_value_t = 2)]
    pub priority_fee_gwei: u64,

    /// Max fee in gwei, used when the base fee is unavailable.
    #[arg(long, env = "MAX_FEE_PER_GAS", default_value_t = 25)]
    pub max_fee_gwei: u64,

    #[arg(long, env = "RECEIPT_TIMEOUT_SECS", default_value_t = 120)]
    pub receipt_timeout_secs: u64,

    #[arg(long, env = "EXPLORER_TX_URL", default_value = "https://sepolia.etherscan.io/tx/")]
    pub explorer_tx_url: String,
}

impl Config {
    /// Chain settings, `None` when no endpoint or contract is configured.
    pub fn chain_config(&self) -> Result<Option<ChainConfig>> {
        let (Some(rpc_url), Some(contract)) = (&self.rpc_url, &self.contract_address) else {
            return Ok(None);
        };

        let contract_address = Address::from_str(contract.trim())
            .map_err(|e| ProofError::Config(format!("CONTRACT_ADDRESS {contract:?}: {e}")))?;

        let mut config = ChainConfig::new(rpc_url.trim(), contract_address);
        config.expected_chain_id = self.chain_id;
        config.fees = FeeConfig::from_gwei(self.priority_fee_gwei, self.max_fee_gwei);
        Ok(Some(config))
    }

    pub fn anchor_config(&self) -> AnchorConfig {
        AnchorConfig {
            receipt_timeout: Duration::from_secs(self.receipt_timeout_secs),
            submission_retry: RetryPolicy::submission(),
        }
    }

    /// Generation settings, `None` without an API key.
    pub fn openai_config(&self) -> Option<OpenAiConfig> {
        let key = self.openai_api_key.as_deref()?.trim();
        if key.is_empty() {
            return None;
        }
        let mut config = OpenAiConfig::new(key);
        config.base_url = self.openai_base_url.clone();
        Some(config)
    }
}
