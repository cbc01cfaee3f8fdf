// src/market/gateway.rs
//
// The boundary to the ledger. Reads return fresh state tagged with the slot
// it was observed at; writes are signed by the process signer and return a
// handle immediately, finalization is awaited separately.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use spl_associated_token_account::get_associated_token_address;
use spl_token::solana_program::program_option::COption;
use std::{str::FromStr, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::error::MarketError;
use crate::market::program::{
    self, BuyArgs, ErrorScope, CreateMarketArgs, MarketAccount, MarketState, PortfolioAccount, PortfolioState, SellArgs,
};
use crate::models::FinalizedReceipt;
use crate::solana::{client::SolanaClient, wallet::WalletManager};

/// Returned as soon as a transaction is accepted for inclusion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionHandle {
    pub signature: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip)]
    pub scope: ErrorScope,
}

impl SubmissionHandle {
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            submitted_at: Utc::now(),
            scope: ErrorScope::default(),
        }
    }

    pub fn with_scope(mut self, scope: ErrorScope) -> Self {
        self.scope = scope;
        self
    }
}

/// Point-in-time status of a previously submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptStatus {
    Finalized(FinalizedReceipt),
    Failed(MarketError),
    /// Not (yet) visible at the configured commitment.
    Pending,
}

/// Ledger operations the orchestrator, reader and reconciler depend on.
///
/// Submissions carry no retry: a mutation is sent at most once per call.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Address every submission is signed by.
    fn signer(&self) -> Pubkey;

    fn program_id(&self) -> Pubkey;

    /// Fresh existence probe, never answered from a cache.
    async fn exists(&self, uuid: &str) -> Result<bool, MarketError> {
        Ok(self.market_state(uuid).await?.is_some())
    }

    async fn market_state(&self, uuid: &str) -> Result<Option<MarketState>, MarketError>;

    async fn portfolio_state(&self, uuid: &str, holder: &Pubkey) -> Result<Option<PortfolioState>, MarketError>;

    /// Payment-token balance of `holder`.
    async fn payment_balance(&self, holder: &Pubkey) -> Result<u64, MarketError>;

    /// Payment tokens `holder` has delegated to the market's spending authority.
    async fn payment_allowance(&self, holder: &Pubkey) -> Result<u64, MarketError>;

    async fn submit_create(&self, args: CreateMarketArgs) -> Result<SubmissionHandle, MarketError>;

    async fn submit_buy(&self, uuid: &str, amount: u64, max_total_cost: u64) -> Result<SubmissionHandle, MarketError>;

    async fn submit_sell(&self, uuid: &str, amount: u64, min_payout: u64) -> Result<SubmissionHandle, MarketError>;

    async fn submit_claim_freebie(&self, uuid: &str) -> Result<SubmissionHandle, MarketError>;

    async fn submit_distribute_fees(&self, uuid: &str, owner: &Pubkey) -> Result<SubmissionHandle, MarketError>;

    /// Sets the signer's delegated allowance to exactly `amount`.
    async fn submit_approve(&self, amount: u64) -> Result<SubmissionHandle, MarketError>;

    /// Waits for finalization. A timeout is `UnknownOutcome`, never failure.
    async fn await_finalization(&self, handle: &SubmissionHandle) -> Result<FinalizedReceipt, MarketError>;

    async fn fetch_receipt(&self, signature: &str) -> Result<ReceiptStatus, MarketError>;

    /// Recent successful signatures that touched the market account.
    async fn recent_signatures(&self, uuid: &str, limit: usize) -> Result<Vec<String>, MarketError>;
}

fn parse_signature(signature: &str) -> Result<Signature, MarketError> {
    Signature::from_str(signature).map_err(|e| MarketError::Decode(format!("Invalid signature {}: {}", signature, e)))
}

/// `LedgerGateway` backed by the market program over JSON-RPC.
pub struct SolanaLedgerGateway {
    solana_client: Arc<SolanaClient>,
    wallet: Arc<WalletManager>,
    program_id: Pubkey,
    payment_mint: Pubkey,
    confirmation_timeout: Duration,
    poll_interval: Duration,
}

impl SolanaLedgerGateway {
    pub fn new(
        solana_client: Arc<SolanaClient>,
        wallet: Arc<WalletManager>,
        program_id: Pubkey,
        payment_mint: Pubkey,
        confirmation_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            solana_client,
            wallet,
            program_id,
            payment_mint,
            confirmation_timeout,
            poll_interval,
        }
    }

    fn spender(&self) -> Pubkey {
        program::derive_spender_pda(&self.program_id).0
    }

    async fn program_account(&self, address: &Pubkey) -> Result<Option<(u64, Vec<u8>)>, MarketError> {
        let (slot, account) = self.solana_client.get_account_with_slot(address).await?;
        match account {
            Some(account) if account.owner != self.program_id => Err(MarketError::Decode(format!(
                "Account {} is owned by {}, not the market program",
                address, account.owner
            ))),
            Some(account) => Ok(Some((slot, account.data))),
            None => Ok(None),
        }
    }

    async fn send(&self, label: &str, instruction: solana_sdk::instruction::Instruction) -> Result<SubmissionHandle, MarketError> {
        let instructions = [instruction];
        let scope = ErrorScope::for_instructions(self.program_id, &instructions);
        let signature = self.wallet.sign_and_send(&instructions, &scope).await?;
        info!("Submitted {} transaction {}", label, signature);
        Ok(SubmissionHandle::new(signature.to_string()).with_scope(scope))
    }
}

#[async_trait]
impl LedgerGateway for SolanaLedgerGateway {
    fn signer(&self) -> Pubkey {
        self.wallet.get_public_key()
    }

    fn program_id(&self) -> Pubkey {
        self.program_id
    }

    async fn market_state(&self, uuid: &str) -> Result<Option<MarketState>, MarketError> {
        let (address, _) = program::derive_market_pda(&self.program_id, uuid);
        let Some((slot, data)) = self.program_account(&address).await? else {
            return Ok(None);
        };
        Ok(Some(MarketState {
            address,
            account: MarketAccount::decode(&data)?,
            observed_slot: slot,
        }))
    }

    async fn portfolio_state(&self, uuid: &str, holder: &Pubkey) -> Result<Option<PortfolioState>, MarketError> {
        let (market, _) = program::derive_market_pda(&self.program_id, uuid);
        let (address, _) = program::derive_portfolio_pda(&self.program_id, &market, holder);
        let Some((slot, data)) = self.program_account(&address).await? else {
            return Ok(None);
        };
        Ok(Some(PortfolioState {
            address,
            account: PortfolioAccount::decode(&data)?,
            observed_slot: slot,
        }))
    }

    async fn payment_balance(&self, holder: &Pubkey) -> Result<u64, MarketError> {
        let ata = get_associated_token_address(holder, &self.payment_mint);
        Ok(self
            .solana_client
            .get_token_account(&ata)
            .await?
            .map(|account| account.amount)
            .unwrap_or(0))
    }

    async fn payment_allowance(&self, holder: &Pubkey) -> Result<u64, MarketError> {
        let ata = get_associated_token_address(holder, &self.payment_mint);
        let spender = self.spender();
        Ok(match self.solana_client.get_token_account(&ata).await? {
            Some(account) if account.delegate == COption::Some(spender) => account.delegated_amount,
            _ => 0,
        })
    }

    async fn submit_create(&self, args: CreateMarketArgs) -> Result<SubmissionHandle, MarketError> {
        let ix = program::create_market_ix(&self.program_id, &self.signer(), &args);
        self.send("create_market", ix).await
    }

    async fn submit_buy(&self, uuid: &str, amount: u64, max_total_cost: u64) -> Result<SubmissionHandle, MarketError> {
        let ix = program::buy_ix(
            &self.program_id,
            &self.payment_mint,
            &self.signer(),
            uuid,
            &BuyArgs { amount, max_total_cost },
        );
        self.send("buy", ix).await
    }

    async fn submit_sell(&self, uuid: &str, amount: u64, min_payout: u64) -> Result<SubmissionHandle, MarketError> {
        let ix = program::sell_ix(
            &self.program_id,
            &self.payment_mint,
            &self.signer(),
            uuid,
            &SellArgs { amount, min_payout },
        );
        self.send("sell", ix).await
    }

    async fn submit_claim_freebie(&self, uuid: &str) -> Result<SubmissionHandle, MarketError> {
        let ix = program::claim_freebie_ix(&self.program_id, &self.payment_mint, &self.signer(), uuid);
        self.send("claim_freebie", ix).await
    }

    async fn submit_distribute_fees(&self, uuid: &str, owner: &Pubkey) -> Result<SubmissionHandle, MarketError> {
        let ix = program::distribute_fees_ix(&self.program_id, &self.payment_mint, &self.signer(), owner, uuid);
        self.send("distribute_fees", ix).await
    }

    async fn submit_approve(&self, amount: u64) -> Result<SubmissionHandle, MarketError> {
        let owner = self.signer();
        let source = get_associated_token_address(&owner, &self.payment_mint);
        let ix = spl_token::instruction::approve(&spl_token::id(), &source, &self.spender(), &owner, &[], amount)
            .map_err(|e| MarketError::TransactionFailed(format!("Failed to build approve instruction: {}", e)))?;
        self.send("approve", ix).await
    }

    async fn await_finalization(&self, handle: &SubmissionHandle) -> Result<FinalizedReceipt, MarketError> {
        let signature = parse_signature(&handle.signature)?;
        self.solana_client
            .confirm_transaction(&signature, &handle.scope, self.confirmation_timeout, self.poll_interval)
            .await?;
        // Confirmed but unreadable receipt: the effect happened, details are unknown.
        self.solana_client.get_receipt(&signature).await.map_err(|e| {
            warn!("Receipt for confirmed transaction {} unavailable: {}", signature, e);
            MarketError::UnknownOutcome {
                signature: handle.signature.clone(),
                reason: format!("confirmed but receipt unavailable: {}", e),
            }
        })
    }

    async fn fetch_receipt(&self, signature: &str) -> Result<ReceiptStatus, MarketError> {
        let sig = parse_signature(signature)?;
        let Some(status) = self.solana_client.signature_status(&sig).await? else {
            return Ok(ReceiptStatus::Pending);
        };
        if let Some(err) = &status.err {
            let programs = match self.solana_client.instruction_programs(&sig).await {
                Ok(programs) => programs,
                Err(e) => {
                    debug!("Instructions of failed transaction {} unavailable: {}", signature, e);
                    Vec::new()
                }
            };
            let scope = ErrorScope::new(self.program_id, programs);
            return Ok(ReceiptStatus::Failed(program::classify_transaction_error(err, signature, &scope)));
        }
        if !status.satisfies_commitment(self.solana_client.commitment()) {
            debug!("Transaction {} seen at slot {} but not yet at commitment", signature, status.slot);
            return Ok(ReceiptStatus::Pending);
        }
        Ok(ReceiptStatus::Finalized(self.solana_client.get_receipt(&sig).await?))
    }

    async fn recent_signatures(&self, uuid: &str, limit: usize) -> Result<Vec<String>, MarketError> {
        let (market, _) = program::derive_market_pda(&self.program_id, uuid);
        self.solana_client.signatures_for_address(&market, limit).await
    }
}
