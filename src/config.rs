use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    Sled,
    Http,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub solana_rpc_url: String,
    pub solana_private_key: String,
    pub market_program_id: String,
    pub payment_mint: String,
    pub commitment: String, // "confirmed" or "finalized"

    // Confirmation polling
    pub confirmation_timeout_secs: u64,
    pub confirmation_poll_ms: u64,

    // Trade parameters
    pub default_slippage_bps: u32,

    // Read retry policy (reads only, mutations are never retried)
    pub read_retry_attempts: usize,
    pub read_retry_base_ms: u64,
    pub read_retry_max_ms: u64,

    // Off-chain index
    pub index_backend: IndexBackend,
    pub index_path: String,
    pub index_backend_url: Option<String>,
    pub index_api_key: Option<String>,

    // Backfill job, 0 disables it
    pub backfill_interval_secs: u64,
    pub backfill_signature_limit: usize,

    pub api_host: Option<String>,
    pub api_port: Option<u16>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let index_backend = match env::var("INDEX_BACKEND")
            .unwrap_or_else(|_| "sled".to_string())
            .to_lowercase()
            .as_str()
        {
            "sled" => IndexBackend::Sled,
            "http" => IndexBackend::Http,
            other => return Err(anyhow!("Unsupported INDEX_BACKEND: {}", other)),
        };

        let config = Self {
            solana_rpc_url: env::var("SOLANA_RPC_URL")
                .context("SOLANA_RPC_URL not set in environment")?,
            solana_private_key: env::var("WALLET_PRIVATE_KEY")
                .context("WALLET_PRIVATE_KEY not set in environment")?,
            market_program_id: env::var("MARKET_PROGRAM_ID")
                .context("MARKET_PROGRAM_ID not set in environment")?,
            payment_mint: env::var("PAYMENT_MINT")
                .context("PAYMENT_MINT not set in environment")?,
            commitment: env::var("COMMITMENT").unwrap_or_else(|_| "confirmed".to_string()),

            confirmation_timeout_secs: env::var("CONFIRMATION_TIMEOUT_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("Failed to parse CONFIRMATION_TIMEOUT_SECS")?,
            confirmation_poll_ms: env::var("CONFIRMATION_POLL_MS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()
                .context("Failed to parse CONFIRMATION_POLL_MS")?,

            default_slippage_bps: env::var("DEFAULT_SLIPPAGE_BPS")
                .unwrap_or_else(|_| "100".to_string()) // Default 1%
                .parse()
                .context("Failed to parse DEFAULT_SLIPPAGE_BPS")?,

            read_retry_attempts: env::var("READ_RETRY_ATTEMPTS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .unwrap_or(4),
            read_retry_base_ms: env::var("READ_RETRY_BASE_MS")
                .unwrap_or_else(|_| "250".to_string())
                .parse()
                .unwrap_or(250),
            read_retry_max_ms: env::var("READ_RETRY_MAX_MS")
                .unwrap_or_else(|_| "4000".to_string())
                .parse()
                .unwrap_or(4000),

            index_backend,
            index_path: env::var("INDEX_PATH").unwrap_or_else(|_| "data/index".to_string()),
            index_backend_url: env::var("INDEX_BACKEND_URL").ok(),
            index_api_key: env::var("INDEX_API_KEY").ok(),

            backfill_interval_secs: env::var("BACKFILL_INTERVAL_SECS")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("Failed to parse BACKFILL_INTERVAL_SECS")?,
            backfill_signature_limit: env::var("BACKFILL_SIGNATURE_LIMIT")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .unwrap_or(100),

            api_host: env::var("API_HOST").ok(),
            api_port: env::var("API_PORT").ok().and_then(|p| p.parse().ok()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_slippage_bps > 10_000 {
            return Err(anyhow!(
                "DEFAULT_SLIPPAGE_BPS must be <= 10000, got {}",
                self.default_slippage_bps
            ));
        }
        if !matches!(self.commitment.as_str(), "confirmed" | "finalized") {
            return Err(anyhow!(
                "COMMITMENT must be 'confirmed' or 'finalized', got '{}'",
                self.commitment
            ));
        }
        if self.index_backend == IndexBackend::Http && self.index_backend_url.is_none() {
            return Err(anyhow!("INDEX_BACKEND=http requires INDEX_BACKEND_URL"));
        }
        Ok(())
    }
}
