// src/market/reader.rs
//
// Read-side view of the ledger. Every call is a fresh read, retried on
// transport errors, and normalized so an unresolved market reads as a
// zero-valued state instead of an error.

use solana_sdk::pubkey::Pubkey;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::MarketError;
use crate::market::gateway::LedgerGateway;
use crate::market::pricing;
use crate::market::program::{MarketState, PortfolioState};
use crate::market::retry::RetryPolicy;
use crate::models::{MarketStats, Portfolio};

#[derive(Clone)]
pub struct MarketReader {
    ledger: Arc<dyn LedgerGateway>,
    retry: RetryPolicy,
}

impl MarketReader {
    pub fn new(ledger: Arc<dyn LedgerGateway>, retry: RetryPolicy) -> Self {
        Self { ledger, retry }
    }

    async fn read<T, F, Fut>(&self, op: F) -> Result<T, MarketError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, MarketError>>,
    {
        self.retry
            .retry_when(|_| op(), MarketError::is_retriable_read)
            .await
    }

    pub fn signer(&self) -> Pubkey {
        self.ledger.signer()
    }

    pub async fn market_state(&self, uuid: &str) -> Result<Option<MarketState>, MarketError> {
        self.read(|| self.ledger.market_state(uuid)).await
    }

    pub async fn portfolio_state(&self, uuid: &str, holder: &Pubkey) -> Result<Option<PortfolioState>, MarketError> {
        self.read(|| self.ledger.portfolio_state(uuid, holder)).await
    }

    pub async fn payment_allowance(&self, holder: &Pubkey) -> Result<u64, MarketError> {
        self.read(|| self.ledger.payment_allowance(holder)).await
    }

    pub async fn payment_balance(&self, holder: &Pubkey) -> Result<u64, MarketError> {
        self.read(|| self.ledger.payment_balance(holder)).await
    }

    pub async fn exists(&self, uuid: &str) -> Result<bool, MarketError> {
        self.read(|| self.ledger.exists(uuid)).await
    }

    /// Supply and divisor of the market, or `None` if it does not exist.
    async fn curve(&self, uuid: &str) -> Result<Option<(u64, u64)>, MarketError> {
        Ok(self.market_state(uuid).await?.map(|s| (s.supply(), s.divisor())))
    }

    /// What the signer would pay for one unit right now: zero while they are
    /// still eligible for the market's freebie.
    pub async fn current_price(&self, uuid: &str) -> Result<u64, MarketError> {
        let Some(state) = self.market_state(uuid).await? else {
            return Ok(0);
        };
        if self.can_claim_in(&state, &self.signer()).await? {
            debug!("{} is freebie-eligible in {}, current price is 0", self.signer(), uuid);
            return Ok(0);
        }
        Ok(pricing::unit_price(state.supply(), state.divisor()))
    }

    /// Curve price of the next unit, ignoring freebie eligibility.
    pub async fn actual_price(&self, uuid: &str) -> Result<u64, MarketError> {
        Ok(self
            .curve(uuid)
            .await?
            .map(|(supply, divisor)| pricing::unit_price(supply, divisor))
            .unwrap_or(0))
    }

    /// Fee-inclusive cost of one unit.
    pub async fn buy_price(&self, uuid: &str) -> Result<u64, MarketError> {
        self.buy_price_for_amount(uuid, 1).await
    }

    /// Fee-deducted payout for one paid unit.
    pub async fn sell_price(&self, uuid: &str) -> Result<u64, MarketError> {
        self.sell_payout_for_amount(uuid, 1).await
    }

    pub async fn freebie_sell_price(&self, uuid: &str) -> Result<u64, MarketError> {
        Ok(self
            .curve(uuid)
            .await?
            .map(|(supply, divisor)| pricing::freebie_sell_price(supply, divisor))
            .unwrap_or(0))
    }

    pub async fn buy_price_for_amount(&self, uuid: &str, amount: u64) -> Result<u64, MarketError> {
        Ok(self
            .curve(uuid)
            .await?
            .map(|(supply, divisor)| pricing::buy_total(supply, divisor, amount).total)
            .unwrap_or(0))
    }

    pub async fn sell_payout_for_amount(&self, uuid: &str, amount: u64) -> Result<u64, MarketError> {
        Ok(self
            .curve(uuid)
            .await?
            .and_then(|(supply, divisor)| pricing::sell_total(supply, divisor, amount))
            .map(|quote| quote.payout)
            .unwrap_or(0))
    }

    pub async fn market_stats(&self, uuid: &str) -> Result<Option<MarketStats>, MarketError> {
        Ok(self.market_state(uuid).await?.map(|state| state.to_stats()))
    }

    /// Holdings of `holder`, zero-valued when either the market or the
    /// holder's position does not exist.
    pub async fn portfolio(&self, uuid: &str, holder: &Pubkey) -> Result<Portfolio, MarketError> {
        match self.portfolio_state(uuid, holder).await? {
            Some(state) => Ok(state.to_portfolio(uuid)),
            None => Ok(Portfolio::empty(uuid, &holder.to_string())),
        }
    }

    pub async fn remaining_freebies(&self, uuid: &str) -> Result<u32, MarketError> {
        Ok(self
            .market_state(uuid)
            .await?
            .map(|state| state.account.remaining_freebies())
            .unwrap_or(0))
    }

    pub async fn can_claim_freebie(&self, uuid: &str, holder: &Pubkey) -> Result<bool, MarketError> {
        match self.market_state(uuid).await? {
            Some(state) => self.can_claim_in(&state, holder).await,
            None => Ok(false),
        }
    }

    async fn can_claim_in(&self, state: &MarketState, holder: &Pubkey) -> Result<bool, MarketError> {
        let remaining = state.account.remaining_freebies();
        if remaining == 0 {
            return Ok(false);
        }
        let claimed = self
            .portfolio_state(&state.account.uuid, holder)
            .await?
            .map(|p| p.account.has_claimed_freebie)
            .unwrap_or(false);
        Ok(pricing::can_claim_freebie(remaining, claimed))
    }
}
