use anyhow::{Context, Result};
use dotenv::dotenv;
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use token_market_client::config::{Config, IndexBackend};
use token_market_client::index::{BackendIndexClient, OffchainIndex, SledIndex};
use token_market_client::market::gateway::LedgerGateway;
use token_market_client::market::retry::RetryPolicy;
use token_market_client::market::{
    FreebieCoordinator, MarketReader, SettlementReconciler, SolanaLedgerGateway, TransactionOrchestrator,
};
use token_market_client::solana::client::SolanaClient;
use token_market_client::solana::wallet::WalletManager;
use token_market_client::web::{server::start_server, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load()?;
    info!("Configuration loaded successfully");

    let commitment = match config.commitment.as_str() {
        "finalized" => CommitmentConfig::finalized(),
        _ => CommitmentConfig::confirmed(),
    };
    let solana_client = Arc::new(
        SolanaClient::new(&config.solana_rpc_url, commitment).context("Failed to initialize Solana client")?,
    );
    info!("Solana client initialized successfully");

    let wallet_manager = WalletManager::new(&config.solana_private_key, solana_client.clone())
        .context("Failed to initialize wallet")?;
    info!("Wallet initialized with address: {}", wallet_manager.get_public_key());

    let program_id = Pubkey::from_str(&config.market_program_id).context("Invalid MARKET_PROGRAM_ID")?;
    let payment_mint = Pubkey::from_str(&config.payment_mint).context("Invalid PAYMENT_MINT")?;
    let ledger: Arc<dyn LedgerGateway> = Arc::new(SolanaLedgerGateway::new(
        solana_client,
        wallet_manager,
        program_id,
        payment_mint,
        Duration::from_secs(config.confirmation_timeout_secs),
        Duration::from_millis(config.confirmation_poll_ms),
    ));
    info!("Ledger gateway ready for program {}", program_id);

    let index: Arc<dyn OffchainIndex> = match config.index_backend {
        IndexBackend::Sled => Arc::new(SledIndex::open(&config.index_path).context("Failed to open sled index")?),
        IndexBackend::Http => {
            let url = config
                .index_backend_url
                .as_deref()
                .context("INDEX_BACKEND_URL missing")?;
            info!("Using remote index backend at {}", url);
            Arc::new(
                BackendIndexClient::new(url, config.index_api_key.clone())
                    .context("Failed to create index backend client")?,
            )
        }
    };

    let retry = RetryPolicy::new(
        config.read_retry_attempts,
        config.read_retry_base_ms,
        config.read_retry_max_ms,
        0.2,
    );
    let reader = MarketReader::new(ledger.clone(), retry);
    let reconciler = Arc::new(SettlementReconciler::new(
        index.clone(),
        ledger.clone(),
        config.backfill_signature_limit,
    ));
    let orchestrator = Arc::new(TransactionOrchestrator::new(
        ledger,
        reader,
        reconciler.clone(),
        index.clone(),
        config.default_slippage_bps,
    ));
    let freebies = Arc::new(FreebieCoordinator::new(index.clone(), orchestrator.clone()));

    if config.backfill_interval_secs > 0 {
        reconciler
            .clone()
            .start_backfill_loop(Duration::from_secs(config.backfill_interval_secs))
            .await;
    } else {
        warn!("Backfill disabled (BACKFILL_INTERVAL_SECS=0); deferred records need a manual recheck");
    }

    let state = AppState::new(orchestrator, freebies, index, reconciler.clone());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
    };
    let served = start_server(state, &config, shutdown).await;

    if reconciler.is_running().await {
        reconciler.stop_backfill_loop().await;
    }
    info!("Token market client stopped");
    served
}
