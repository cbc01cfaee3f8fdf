// src/market/orchestrator.rs
//
// Drives buy, sell and freebie claims from quote to settlement:
// quote -> (allowance) -> submit -> confirm -> decode -> reconcile -> re-read.
// Mutations are sent once and never retried. A confirmation that cannot be
// observed is reported as `UnknownOutcome`, never as success or failure.

use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::MarketError;
use crate::index::OffchainIndex;
use crate::market::allowance::{AllowanceManager, AllowanceOutcome};
use crate::market::events::{self, MarketEvent, RealizedTrade};
use crate::market::gateway::{LedgerGateway, ReceiptStatus, SubmissionHandle};
use crate::market::inflight::{ActionKey, ActionKind, InFlightGuard, InFlightRegistry};
use crate::market::lifecycle::{ActionEvent, ActionLifecycle, ActionState};
use crate::market::mirror::{OptimisticChange, PortfolioMirror};
use crate::market::pricing;
use crate::market::program::{CreateMarketArgs, MarketState};
use crate::market::reader::MarketReader;
use crate::market::reconciler::{ReconcileStatus, SettlementReconciler};
use crate::models::{FinalizedReceipt, MarketStats, Portfolio, Token, TokenKind, TokenMetadata, TransactionOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Advisory price estimate for the signer. Never used as the realized price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarketQuote {
    pub token_uuid: String,
    pub side: TradeSide,
    pub amount: u64,
    pub exists: bool,
    pub freebie_eligible: bool,
    pub total: u64,        // What the signer would pay, or receive on a sell
    pub actual_total: u64, // Same, ignoring freebie eligibility and holdings
    pub creator_fee: u64,
    pub platform_fee: u64,
    pub unit_price: u64, // Curve price of the next unit
    pub supply: u64,
    pub observed_slot: u64,
}

impl MarketQuote {
    fn zero(token_uuid: &str, side: TradeSide, amount: u64) -> Self {
        Self {
            token_uuid: token_uuid.to_string(),
            side,
            amount,
            exists: false,
            freebie_eligible: false,
            total: 0,
            actual_total: 0,
            creator_fee: 0,
            platform_fee: 0,
            unit_price: 0,
            supply: 0,
            observed_slot: 0,
        }
    }
}

/// Outcome of a settled buy, sell or claim.
#[derive(Debug, Clone, Serialize)]
pub struct ActionReport {
    pub action: ActionKind,
    pub token_uuid: String,
    pub state: ActionState,
    pub trail: Vec<ActionState>,
    pub quoted_total: u64,
    pub approval: Option<AllowanceOutcome>,
    pub signature: String,
    pub slot: u64,
    /// `None` when the receipt carried no recognizable trade event.
    pub realized: Option<RealizedTrade>,
    pub reconciliation: ReconcileStatus,
    pub portfolio: Option<Portfolio>,
    pub stats: Option<MarketStats>,
    pub current_price: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedMarket {
    pub token: Token,
    pub signature: String,
    pub slot: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeDistribution {
    pub token_uuid: String,
    pub signature: String,
    pub slot: u64,
    pub creator_amount: Option<u64>,
    pub platform_amount: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecheckState {
    Finalized,
    Failed,
    Pending,
}

/// Answer to an explicit status recheck of a previously submitted signature.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub signature: String,
    pub status: RecheckState,
    pub slot: Option<u64>,
    pub error: Option<String>,
    pub token_uuid: Option<String>,
    pub realized: Option<RealizedTrade>,
    pub reconciliation: Option<ReconcileStatus>,
}

/// A quoted action, ready to be submitted.
struct TradePlan {
    kind: ActionKind,
    uuid: String,
    amount: u64,
    quoted_total: u64,
    bound: u64,    // max_total_cost for buys, min_payout for sells
    approval: u64, // Allowance the spend needs, 0 for none
    change: OptimisticChange,
}

pub struct TransactionOrchestrator {
    ledger: Arc<dyn LedgerGateway>,
    reader: MarketReader,
    allowance: AllowanceManager,
    reconciler: Arc<SettlementReconciler>,
    index: Arc<dyn OffchainIndex>,
    in_flight: InFlightRegistry,
    mirror: Arc<PortfolioMirror>,
    slippage_bps: u32,
}

impl TransactionOrchestrator {
    pub fn new(
        ledger: Arc<dyn LedgerGateway>,
        reader: MarketReader,
        reconciler: Arc<SettlementReconciler>,
        index: Arc<dyn OffchainIndex>,
        slippage_bps: u32,
    ) -> Self {
        Self {
            allowance: AllowanceManager::new(ledger.clone(), reader.clone()),
            ledger,
            reader,
            reconciler,
            index,
            in_flight: InFlightRegistry::new(),
            mirror: Arc::new(PortfolioMirror::new()),
            slippage_bps,
        }
    }

    pub fn reader(&self) -> &MarketReader {
        &self.reader
    }

    pub fn mirror(&self) -> Arc<PortfolioMirror> {
        self.mirror.clone()
    }

    pub fn signer(&self) -> Pubkey {
        self.ledger.signer()
    }

    fn acquire(&self, uuid: &str, kind: ActionKind) -> Result<InFlightGuard, MarketError> {
        self.in_flight
            .try_acquire(ActionKey::new(uuid, &self.signer().to_string(), kind))
    }

    async fn open_market(&self, uuid: &str) -> Result<MarketState, MarketError> {
        let state = self
            .reader
            .market_state(uuid)
            .await?
            .ok_or_else(|| MarketError::NotFound(uuid.to_string()))?;
        if state.account.paused {
            return Err(MarketError::Paused(uuid.to_string()));
        }
        Ok(state)
    }

    // ------------------------------------------------------------------
    // Quotes
    // ------------------------------------------------------------------

    pub async fn get_quote(&self, uuid: &str, side: TradeSide, amount: u64) -> Result<MarketQuote, MarketError> {
        if amount == 0 {
            return Err(MarketError::InvalidAmount("amount must be at least 1".into()));
        }
        let Some(state) = self.reader.market_state(uuid).await? else {
            return Ok(MarketQuote::zero(uuid, side, amount));
        };
        let signer = self.signer();
        let holding = self.reader.portfolio_state(uuid, &signer).await?;
        let (supply, divisor) = (state.supply(), state.divisor());
        let mut quote = MarketQuote {
            exists: true,
            unit_price: pricing::unit_price(supply, divisor),
            supply,
            observed_slot: state.observed_slot,
            ..MarketQuote::zero(uuid, side, amount)
        };

        match side {
            TradeSide::Buy => {
                let paid = pricing::buy_total(supply, divisor, amount);
                let claimed = holding.as_ref().map(|h| h.account.has_claimed_freebie).unwrap_or(false);
                quote.freebie_eligible = pricing::can_claim_freebie(state.account.remaining_freebies(), claimed);
                quote.actual_total = paid.total;
                if !(quote.freebie_eligible && amount == 1) {
                    quote.total = paid.total;
                    quote.creator_fee = paid.creator_fee;
                    quote.platform_fee = paid.platform_fee;
                }
            }
            TradeSide::Sell => {
                let generic = pricing::sell_total(supply, divisor, amount);
                let held = holding.as_ref().and_then(|h| {
                    pricing::holder_sell_total(supply, divisor, amount, h.account.balance, h.account.freebie_balance)
                });
                quote.actual_total = generic.map(|q| q.payout).unwrap_or(0);
                if let Some(sell) = held.or(generic) {
                    quote.total = sell.payout;
                    quote.creator_fee = sell.creator_fee;
                    quote.platform_fee = sell.platform_fee;
                }
            }
        }
        Ok(quote)
    }

    async fn plan_buy(&self, uuid: &str, amount: u64) -> Result<TradePlan, MarketError> {
        let state = self.open_market(uuid).await?;
        let claimed = self
            .reader
            .portfolio_state(uuid, &self.signer())
            .await?
            .map(|h| h.account.has_claimed_freebie)
            .unwrap_or(false);
        let as_freebie = amount == 1 && pricing::can_claim_freebie(state.account.remaining_freebies(), claimed);
        let quote = if as_freebie {
            pricing::BuyQuote::free(1)
        } else {
            pricing::buy_total(state.supply(), state.divisor(), amount)
        };
        let bound = pricing::with_slippage_up(quote.total, self.slippage_bps);
        debug!(
            "Quoted buy of {} x{} at supply {}: {} (max {}, freebie {})",
            uuid,
            amount,
            state.supply(),
            quote.total,
            bound,
            as_freebie
        );
        Ok(TradePlan {
            kind: ActionKind::Buy,
            uuid: uuid.to_string(),
            amount,
            quoted_total: quote.total,
            bound,
            approval: bound,
            change: if as_freebie {
                OptimisticChange::Freebie
            } else {
                OptimisticChange::Buy { amount }
            },
        })
    }

    async fn plan_sell(&self, uuid: &str, amount: u64) -> Result<TradePlan, MarketError> {
        let state = self.open_market(uuid).await?;
        let holding = self.reader.portfolio(uuid, &self.signer()).await?;
        let quote = pricing::holder_sell_total(
            state.supply(),
            state.divisor(),
            amount,
            holding.balance,
            holding.freebie_balance,
        )
        .ok_or_else(|| {
            MarketError::InsufficientBalance(format!("{} holds {} of {}, cannot sell {}", holding.holder_address, holding.balance, uuid, amount))
        })?;
        let bound = pricing::with_slippage_down(quote.payout, self.slippage_bps);
        debug!("Quoted sell of {} x{}: {} (min {})", uuid, amount, quote.payout, bound);
        Ok(TradePlan {
            kind: ActionKind::Sell,
            uuid: uuid.to_string(),
            amount,
            quoted_total: quote.payout,
            bound,
            approval: 0,
            change: OptimisticChange::Sell { amount },
        })
    }

    async fn plan_claim(&self, uuid: &str) -> Result<TradePlan, MarketError> {
        let state = self.open_market(uuid).await?;
        let holding = self.reader.portfolio(uuid, &self.signer()).await?;
        if holding.has_claimed_freebie {
            return Err(MarketError::AlreadyClaimed(format!("{} in {}", holding.holder_address, uuid)));
        }
        if state.account.remaining_freebies() == 0 {
            return Err(MarketError::QuotaExhausted(uuid.to_string()));
        }
        Ok(TradePlan {
            kind: ActionKind::ClaimFreebie,
            uuid: uuid.to_string(),
            amount: 1,
            quoted_total: 0,
            bound: 0,
            approval: 0,
            change: OptimisticChange::Freebie,
        })
    }

    // ------------------------------------------------------------------
    // Trades
    // ------------------------------------------------------------------

    pub async fn buy(&self, uuid: &str, amount: u64, user_id: Option<&str>) -> Result<ActionReport, MarketError> {
        if amount == 0 {
            return Err(MarketError::InvalidAmount("amount must be at least 1".into()));
        }
        self.run(ActionKind::Buy, uuid, user_id, self.plan_buy(uuid, amount))
            .await
    }

    pub async fn sell(&self, uuid: &str, amount: u64, user_id: Option<&str>) -> Result<ActionReport, MarketError> {
        if amount == 0 {
            return Err(MarketError::InvalidAmount("amount must be at least 1".into()));
        }
        self.run(ActionKind::Sell, uuid, user_id, self.plan_sell(uuid, amount))
            .await
    }

    pub async fn claim_freebie(&self, uuid: &str, user_id: Option<&str>) -> Result<ActionReport, MarketError> {
        self.run(ActionKind::ClaimFreebie, uuid, user_id, self.plan_claim(uuid))
            .await
    }

    async fn run<F>(
        &self,
        kind: ActionKind,
        uuid: &str,
        user_id: Option<&str>,
        plan: F,
    ) -> Result<ActionReport, MarketError>
    where
        F: Future<Output = Result<TradePlan, MarketError>>,
    {
        let _guard = self.acquire(uuid, kind)?;
        let mut lifecycle = ActionLifecycle::new();
        info!("Starting {} on {}", kind, uuid);

        let result = match plan.await {
            Ok(plan) => self.drive(plan, user_id, &mut lifecycle).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            lifecycle.abort(e);
            warn!("{} on {} ended {} via {:?}: {}", kind, uuid, lifecycle.state(), lifecycle.trail(), e);
        }
        result
    }

    async fn submit(&self, plan: &TradePlan) -> Result<SubmissionHandle, MarketError> {
        match plan.kind {
            ActionKind::Buy => self.ledger.submit_buy(&plan.uuid, plan.amount, plan.bound).await,
            ActionKind::Sell => self.ledger.submit_sell(&plan.uuid, plan.amount, plan.bound).await,
            ActionKind::ClaimFreebie => self.ledger.submit_claim_freebie(&plan.uuid).await,
            other => Err(MarketError::InvalidState(format!("{} is not a trade", other))),
        }
    }

    async fn drive(
        &self,
        plan: TradePlan,
        user_id: Option<&str>,
        lifecycle: &mut ActionLifecycle,
    ) -> Result<ActionReport, MarketError> {
        let signer = self.signer();
        let holder = signer.to_string();

        let approval = if plan.approval > 0 {
            lifecycle.consume(ActionEvent::ApprovalRequired)?;
            let outcome = self.allowance.ensure_allowance(plan.approval).await?;
            lifecycle.consume(ActionEvent::Approved)?;
            Some(outcome)
        } else {
            lifecycle.consume(ActionEvent::Quoted)?;
            None
        };

        let handle = self.submit(&plan).await?;
        lifecycle.consume(ActionEvent::Submitted)?;
        info!("Submitted {} on {}: {}", plan.kind, plan.uuid, handle.signature);
        let ticket = self.mirror.apply_optimistic(&plan.uuid, &holder, plan.change).await;

        let receipt = match self.ledger.await_finalization(&handle).await {
            Ok(receipt) => receipt,
            Err(e) => {
                if e.is_ledger_effect_unknown() {
                    self.mirror.abandon(&ticket).await;
                } else {
                    self.mirror.revert(&ticket).await;
                }
                return Err(e);
            }
        };
        lifecycle.consume(ActionEvent::Finalized)?;

        let decoded = events::decode_logs(&receipt.logs, &self.ledger.program_id());
        let trade = events::find_trade(&decoded, &plan.uuid, Some(&signer)).cloned();
        match &trade {
            Some(t) if t.is_freebie && plan.kind == ActionKind::Buy => {
                info!("Buy on {} was resolved by the ledger as a freebie", plan.uuid)
            }
            Some(_) => {}
            None => warn!(
                "No trade event for {} in {}; realized price unknown",
                plan.uuid, receipt.signature
            ),
        }

        let (portfolio, stats, current_price) = self.fresh_reads(&plan.uuid, &signer).await;
        let outcome = TransactionOutcome {
            token_uuid: plan.uuid.clone(),
            receipt: receipt.clone(),
            trade: trade.clone(),
            user_id: user_id.map(str::to_string),
        };
        let reconciliation = self.reconciler.reconcile_with_stats(&outcome, stats.as_ref()).await;
        lifecycle.consume(ActionEvent::Reconciled)?;
        self.mirror.settle(&ticket, portfolio.clone()).await;

        info!(
            "{} on {} done at slot {}: {:?}",
            plan.kind, plan.uuid, receipt.slot, reconciliation
        );
        Ok(ActionReport {
            action: plan.kind,
            token_uuid: plan.uuid,
            state: lifecycle.state(),
            trail: lifecycle.trail().to_vec(),
            quoted_total: plan.quoted_total,
            approval,
            signature: receipt.signature,
            slot: receipt.slot,
            realized: trade.as_ref().map(RealizedTrade::from),
            reconciliation,
            portfolio,
            stats,
            current_price,
        })
    }

    /// Post-settlement reads. A failure here does not undo the action, it
    /// just leaves the field empty.
    async fn fresh_reads(&self, uuid: &str, holder: &Pubkey) -> (Option<Portfolio>, Option<MarketStats>, Option<u64>) {
        let portfolio = self
            .reader
            .portfolio(uuid, holder)
            .await
            .map_err(|e| warn!("Post-action portfolio read for {} failed: {}", uuid, e))
            .ok();
        let stats = self
            .reader
            .market_stats(uuid)
            .await
            .map_err(|e| warn!("Post-action stats read for {} failed: {}", uuid, e))
            .ok()
            .flatten();
        let price = self
            .reader
            .current_price(uuid)
            .await
            .map_err(|e| warn!("Post-action price read for {} failed: {}", uuid, e))
            .ok();
        (portfolio, stats, price)
    }

    // ------------------------------------------------------------------
    // Market administration
    // ------------------------------------------------------------------

    pub async fn create_market(
        &self,
        uuid: &str,
        kind: TokenKind,
        metadata: TokenMetadata,
        quadratic_divisor: u64,
    ) -> Result<CreatedMarket, MarketError> {
        if uuid.trim().is_empty() {
            return Err(MarketError::InvalidAmount("uuid must not be empty".into()));
        }
        if quadratic_divisor == 0 {
            return Err(MarketError::InvalidAmount("quadratic divisor must be at least 1".into()));
        }
        let _guard = self.acquire(uuid, ActionKind::Create)?;
        if self.reader.exists(uuid).await? {
            return Err(MarketError::MarketAlreadyExists(uuid.to_string()));
        }

        info!("Creating {} market {}", kind, uuid);
        let handle = self
            .ledger
            .submit_create(CreateMarketArgs {
                uuid: uuid.to_string(),
                kind,
                metadata: metadata.clone(),
                quadratic_divisor,
            })
            .await?;
        let receipt = self.ledger.await_finalization(&handle).await?;

        let decoded = events::decode_logs(&receipt.logs, &self.ledger.program_id());
        let mut token = Token::new(uuid, kind, &self.signer().to_string(), metadata, quadratic_divisor);
        match events::find_created(&decoded, uuid) {
            Some(created) => {
                token.internal_id = Some(created.internal_id);
                token.owner_address = created.owner.to_string();
                token.freebie_quota = created.freebie_quota;
            }
            None => warn!("No TokenCreated event for {} in {}", uuid, receipt.signature),
        }

        if let Err(e) = self.index.upsert_token(&token).await {
            warn!("Market {} created but the index write failed: {}", uuid, e);
        }
        info!("Created market {} (internal id {:?}) at slot {}", uuid, token.internal_id, receipt.slot);
        Ok(CreatedMarket {
            token,
            signature: receipt.signature,
            slot: receipt.slot,
        })
    }

    /// Pays out accumulated creator and platform fees of a market.
    pub async fn distribute_fees(&self, uuid: &str) -> Result<FeeDistribution, MarketError> {
        let _guard = self.acquire(uuid, ActionKind::DistributeFees)?;
        let state = self.open_market(uuid).await?;
        let handle = self
            .ledger
            .submit_distribute_fees(uuid, &state.account.owner)
            .await?;
        let receipt = self.ledger.await_finalization(&handle).await?;

        let decoded = events::decode_logs(&receipt.logs, &self.ledger.program_id());
        let distributed = events::find_fees_distributed(&decoded, uuid);
        if distributed.is_none() {
            warn!("No FeesDistributed event for {} in {}", uuid, receipt.signature);
        }
        info!("Distributed fees of {} at slot {}", uuid, receipt.slot);
        Ok(FeeDistribution {
            token_uuid: uuid.to_string(),
            signature: receipt.signature.clone(),
            slot: receipt.slot,
            creator_amount: distributed.map(|e| e.creator_amount),
            platform_amount: distributed.map(|e| e.platform_amount),
        })
    }

    // ------------------------------------------------------------------
    // Status recheck
    // ------------------------------------------------------------------

    /// User-initiated recheck of a transaction, typically one that ended in
    /// `UnknownOutcome`. A finalized trade is reconciled.
    pub async fn recheck_status(&self, signature: &str) -> Result<StatusReport, MarketError> {
        let mut report = StatusReport {
            signature: signature.to_string(),
            status: RecheckState::Pending,
            slot: None,
            error: None,
            token_uuid: None,
            realized: None,
            reconciliation: None,
        };
        match self.ledger.fetch_receipt(signature).await? {
            ReceiptStatus::Pending => {
                debug!("Recheck of {}: still pending", signature);
            }
            ReceiptStatus::Failed(err) => {
                report.status = RecheckState::Failed;
                report.error = Some(err.to_string());
            }
            ReceiptStatus::Finalized(receipt) => {
                report.status = RecheckState::Finalized;
                report.slot = Some(receipt.slot);
                self.reconcile_rechecked(receipt, &mut report).await;
            }
        }
        info!("Recheck of {}: {:?}", signature, report.status);
        Ok(report)
    }

    async fn reconcile_rechecked(&self, receipt: FinalizedReceipt, report: &mut StatusReport) {
        let decoded = events::decode_logs(&receipt.logs, &self.ledger.program_id());
        let Some(trade) = decoded.iter().find_map(|event| match event {
            MarketEvent::Trade(trade) => Some(trade.clone()),
            _ => None,
        }) else {
            report.token_uuid = decoded.iter().find_map(|event| match event {
                MarketEvent::TokenCreated(e) => Some(e.uuid.clone()),
                MarketEvent::FeesDistributed(e) => Some(e.uuid.clone()),
                _ => None,
            });
            return;
        };

        let uuid = trade.uuid.clone();
        if let Ok(Some(portfolio)) = self
            .reader
            .portfolio_state(&uuid, &trade.trader)
            .await
            .map(|state| state.map(|s| s.to_portfolio(&uuid)))
        {
            self.mirror.observe(portfolio).await;
        }
        let outcome = TransactionOutcome {
            token_uuid: uuid.clone(),
            receipt,
            trade: Some(trade.clone()),
            user_id: None,
        };
        report.reconciliation = Some(self.reconciler.reconcile(&outcome).await);
        report.realized = Some(RealizedTrade::from(&trade));
        report.token_uuid = Some(uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SledIndex;
    use crate::market::mock::MockLedger;
    use crate::market::retry::RetryPolicy;
    use crate::models::TradeType;

    struct Harness {
        ledger: Arc<MockLedger>,
        index: Arc<SledIndex>,
        orchestrator: Arc<TransactionOrchestrator>,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(MockLedger::new());
        let index = Arc::new(SledIndex::temporary().unwrap());
        let gateway: Arc<dyn LedgerGateway> = ledger.clone();
        let reader = MarketReader::new(gateway.clone(), RetryPolicy::no_retry());
        let reconciler = Arc::new(SettlementReconciler::new(index.clone(), gateway.clone(), 50));
        let orchestrator = Arc::new(TransactionOrchestrator::new(gateway, reader, reconciler, index.clone(), 100));
        Harness {
            ledger,
            index,
            orchestrator,
        }
    }

    fn metadata() -> TokenMetadata {
        TokenMetadata {
            name: "Ada".into(),
            image_url: None,
            description: Some("first post".into()),
        }
    }

    #[tokio::test]
    async fn test_first_buy_on_new_creator_token_is_a_freebie() {
        let h = harness();
        h.ledger.seed_market("creator-1", TokenKind::Creator, 1);
        let holder = h.ledger.signer();

        let report = h.orchestrator.buy("creator-1", 1, Some("user-1")).await.unwrap();
        let realized = report.realized.unwrap();
        assert!(realized.is_freebie);
        assert_eq!(realized.total_cost, 0);
        assert_eq!(report.state, ActionState::Done);
        assert!(report.approval.is_none());
        assert_eq!(h.ledger.submissions(), vec!["buy"]);

        let reader = h.orchestrator.reader();
        assert_eq!(reader.remaining_freebies("creator-1").await.unwrap(), 49);
        assert!(!reader.can_claim_freebie("creator-1", &holder).await.unwrap());
        assert!(report.portfolio.unwrap().has_claimed_freebie);

        let record = h.index.get_transaction(&report.signature).await.unwrap().unwrap();
        assert!(record.is_freebie);
        assert_eq!(record.user_id.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn test_buy_records_realized_cost_after_one_approval() {
        let h = harness();
        h.ledger.seed_market("post-1", TokenKind::Post, 1);
        h.ledger.fund(10_000_000);

        let report = h.orchestrator.buy("post-1", 5, None).await.unwrap();
        assert_eq!(h.ledger.submissions(), vec!["approve", "buy"]);
        assert!(matches!(report.approval, Some(AllowanceOutcome::Approved { .. })));
        assert_eq!(
            report.trail,
            vec![
                ActionState::Quoting,
                ActionState::Approving,
                ActionState::Submitting,
                ActionState::Confirming,
                ActionState::Reconciling,
                ActionState::Done
            ]
        );

        let realized = report.realized.unwrap();
        assert!(!realized.is_freebie);
        assert!(realized.total_cost > 5 * pricing::unit_price(0, 1));
        let portfolio = report.portfolio.unwrap();
        assert_eq!(portfolio.balance, 5);
        assert_eq!(portfolio.total_bought, 5);

        let records = h.index.transactions_for_token("post-1", 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].amount, 5);
        assert_eq!(records[0].total_cost, realized.total_cost);
        assert_eq!(records[0].trade_type, TradeType::Buy);
        assert!(h.index.cached_stats("post-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sufficient_allowance_skips_approval() {
        let h = harness();
        h.ledger.seed_market("post-1", TokenKind::Post, 1);
        h.ledger.fund(10_000_000);
        h.ledger.set_allowance(10_000_000);

        let report = h.orchestrator.buy("post-1", 2, None).await.unwrap();
        assert!(matches!(report.approval, Some(AllowanceOutcome::Sufficient { .. })));
        assert_eq!(h.ledger.submissions(), vec!["buy"]);
    }

    #[tokio::test]
    async fn test_sell_pays_out_and_records() {
        let h = harness();
        h.ledger.seed_market("post-1", TokenKind::Post, 1);
        h.ledger.fund(10_000_000);
        h.ledger.set_allowance(10_000_000);
        h.orchestrator.buy("post-1", 3, None).await.unwrap();
        let before = h.ledger.balance();

        let report = h.orchestrator.sell("post-1", 2, None).await.unwrap();
        let realized = report.realized.unwrap();
        assert!(!realized.is_buy);
        assert_eq!(h.ledger.balance(), before + realized.total_cost);
        assert_eq!(report.portfolio.unwrap().balance, 1);
        assert!(report.approval.is_none());

        let err = h.orchestrator.sell("post-1", 5, None).await.unwrap_err();
        assert!(matches!(err, MarketError::InsufficientBalance(_)));
        assert_eq!(h.ledger.submissions(), vec!["buy", "sell"]);
    }

    #[tokio::test]
    async fn test_short_balance_fails_before_any_submission() {
        let h = harness();
        h.ledger.seed_market("post-1", TokenKind::Post, 1);
        h.ledger.fund(100);
        h.ledger.set_allowance(10_000);

        let err = h.orchestrator.buy("post-1", 2, None).await.unwrap_err();
        assert!(matches!(err, MarketError::InsufficientBalance(_)));
        assert!(h.ledger.submissions().is_empty());
        assert!(h.index.transactions_for_token("post-1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_curve_move_before_inclusion_is_recorded_at_realized_cost() {
        let h = harness();
        h.ledger.seed_market("post-1", TokenKind::Post, 100);
        h.ledger.fund(10_000_000);
        h.ledger.set_allowance(10_000_000);
        h.ledger.front_run_next_trade("post-1", 1);

        let report = h.orchestrator.buy("post-1", 2, None).await.unwrap();
        let quoted = pricing::buy_total(0, 100, 2).total;
        let landed = pricing::buy_total(1, 100, 2).total;
        assert_ne!(quoted, landed);
        assert_eq!(report.quoted_total, quoted);

        let realized = report.realized.unwrap();
        assert_eq!(realized.total_cost, landed);
        assert_eq!(realized.supply_after, 3);

        let record = h.index.get_transaction(&report.signature).await.unwrap().unwrap();
        assert_eq!(record.total_cost, landed);
        assert_eq!(record.amount, 2);
        assert_eq!(h.ledger.balance(), 10_000_000 - landed);
    }

    #[tokio::test]
    async fn test_buy_quoted_as_paid_can_land_as_freebie() {
        let h = harness();
        h.ledger.seed_market("creator-1", TokenKind::Creator, 1);
        h.ledger.set_remaining_freebies("creator-1", 0);
        h.ledger.fund(10_000_000);
        h.ledger.set_allowance(10_000_000);
        h.ledger.reopen_freebies_before_next_trade("creator-1", 1);

        let report = h.orchestrator.buy("creator-1", 1, Some("user-1")).await.unwrap();
        assert!(report.quoted_total > 0);

        let realized = report.realized.unwrap();
        assert!(realized.is_freebie);
        assert_eq!(realized.total_cost, 0);

        let record = h.index.get_transaction(&report.signature).await.unwrap().unwrap();
        assert!(record.is_freebie);
        assert_eq!(record.total_cost, 0);
        assert_eq!(h.ledger.balance(), 10_000_000);
        let portfolio = report.portfolio.unwrap();
        assert!(portfolio.has_claimed_freebie);
        assert_eq!(portfolio.freebie_balance, 1);
    }

    #[tokio::test]
    async fn test_local_failures_never_reach_the_ledger() {
        let h = harness();
        let err = h.orchestrator.buy("post-123", 1, None).await.unwrap_err();
        assert!(matches!(err, MarketError::NotFound(_)));

        h.ledger.seed_market("creator-1", TokenKind::Creator, 1);
        h.ledger.set_paused("creator-1", true);
        let err = h.orchestrator.buy("creator-1", 1, None).await.unwrap_err();
        assert!(matches!(err, MarketError::Paused(_)));

        let err = h.orchestrator.buy("creator-1", 0, None).await.unwrap_err();
        assert!(matches!(err, MarketError::InvalidAmount(_)));
        assert!(h.ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_claim_twice_is_already_claimed() {
        let h = harness();
        h.ledger.seed_market("creator-1", TokenKind::Creator, 1);

        let report = h.orchestrator.claim_freebie("creator-1", None).await.unwrap();
        assert!(report.realized.unwrap().is_freebie);
        let err = h.orchestrator.claim_freebie("creator-1", None).await.unwrap_err();
        assert!(matches!(err, MarketError::AlreadyClaimed(_)));
        assert_eq!(h.ledger.submissions(), vec!["claim"]);

        h.ledger.seed_market("creator-2", TokenKind::Creator, 1);
        h.ledger.set_remaining_freebies("creator-2", 0);
        let err = h.orchestrator.claim_freebie("creator-2", None).await.unwrap_err();
        assert!(matches!(err, MarketError::QuotaExhausted(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_unknown_and_drops_mirror() {
        let h = harness();
        h.ledger.seed_market("post-1", TokenKind::Post, 1);
        h.ledger.fund(10_000_000);
        h.ledger.set_allowance(10_000_000);
        let holder = h.ledger.signer().to_string();
        h.ledger.time_out_next_finalization();

        let err = h.orchestrator.buy("post-1", 2, None).await.unwrap_err();
        let MarketError::UnknownOutcome { signature, .. } = err else {
            panic!("expected UnknownOutcome, got {:?}", err);
        };
        assert!(h.orchestrator.mirror().view("post-1", &holder).await.is_none());
        assert!(h.index.get_transaction(&signature).await.unwrap().is_none());

        // The transaction did land; an explicit recheck settles it.
        let status = h.orchestrator.recheck_status(&signature).await.unwrap();
        assert_eq!(status.status, RecheckState::Finalized);
        assert_eq!(status.reconciliation, Some(ReconcileStatus::Recorded));
        assert_eq!(status.token_uuid.as_deref(), Some("post-1"));
        let again = h.orchestrator.recheck_status(&signature).await.unwrap();
        assert_eq!(again.reconciliation, Some(ReconcileStatus::AlreadyRecorded));
        assert_eq!(h.orchestrator.mirror().view("post-1", &holder).await.unwrap().balance, 2);
    }

    #[tokio::test]
    async fn test_recheck_of_unknown_signature_is_pending() {
        let h = harness();
        let status = h.orchestrator.recheck_status("never-sent").await.unwrap();
        assert_eq!(status.status, RecheckState::Pending);
        assert!(status.reconciliation.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_is_rejected() {
        let h = harness();
        h.ledger.seed_market("post-1", TokenKind::Post, 1);
        h.ledger.fund(10_000_000);
        h.ledger.set_allowance(10_000_000);
        let gate = h.ledger.gate_finalization();

        let first = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.buy("post-1", 1, None).await })
        };
        while h.ledger.submissions().is_empty() {
            tokio::task::yield_now().await;
        }

        let err = h.orchestrator.buy("post-1", 1, None).await.unwrap_err();
        assert!(matches!(err, MarketError::AlreadyInFlight(_)));
        // A different action on the same market is independent.
        assert!(h.orchestrator.get_quote("post-1", TradeSide::Sell, 1).await.is_ok());

        gate.notify_one();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.state, ActionState::Done);
        assert!(h.orchestrator.buy("post-1", 1, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_unrecognized_event_defers_reconciliation() {
        let h = harness();
        h.ledger.seed_market("post-1", TokenKind::Post, 1);
        h.ledger.fund(10_000_000);
        h.ledger.set_allowance(10_000_000);
        h.ledger.emit_unrecognized_next();

        let report = h.orchestrator.buy("post-1", 1, None).await.unwrap();
        assert!(report.realized.is_none());
        assert!(matches!(report.reconciliation, ReconcileStatus::Deferred(_)));
        assert_eq!(report.state, ActionState::Done);
        assert!(h.index.get_transaction(&report.signature).await.unwrap().is_none());
        // The holding still moved on the ledger.
        assert_eq!(report.portfolio.unwrap().balance, 1);
    }

    #[tokio::test]
    async fn test_rejected_submission_fails_without_effect() {
        let h = harness();
        h.ledger.seed_market("post-1", TokenKind::Post, 1);
        h.ledger.fund(10_000_000);
        h.ledger.set_allowance(10_000_000);
        h.ledger
            .fail_next_submission(MarketError::TransactionFailed("slippage".into()));

        let err = h.orchestrator.buy("post-1", 1, None).await.unwrap_err();
        assert!(matches!(err, MarketError::TransactionFailed(_)));
        assert!(!err.is_ledger_effect_unknown());
        assert_eq!(h.ledger.market("post-1").unwrap().circulating_supply, 0);
    }

    #[tokio::test]
    async fn test_quotes() {
        let h = harness();
        let missing = h.orchestrator.get_quote("post-123", TradeSide::Buy, 3).await.unwrap();
        assert!(!missing.exists);
        assert_eq!(missing.total, 0);

        h.ledger.seed_market("creator-1", TokenKind::Creator, 1);
        let one = h.orchestrator.get_quote("creator-1", TradeSide::Buy, 1).await.unwrap();
        assert!(one.freebie_eligible);
        assert_eq!(one.total, 0);
        assert_eq!(one.actual_total, pricing::buy_total(0, 1, 1).total);

        let five = h.orchestrator.get_quote("creator-1", TradeSide::Buy, 5).await.unwrap();
        assert_eq!(five.total, pricing::buy_total(0, 1, 5).total);

        let sell = h.orchestrator.get_quote("creator-1", TradeSide::Sell, 1).await.unwrap();
        assert_eq!(sell.total, 0);
        assert!(h.orchestrator.get_quote("creator-1", TradeSide::Sell, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_create_market_indexes_token() {
        let h = harness();
        let created = h
            .orchestrator
            .create_market("creator-9", TokenKind::Creator, metadata(), 2)
            .await
            .unwrap();
        assert!(created.token.internal_id.is_some());
        assert_eq!(created.token.freebie_quota, 50);

        let indexed = h.index.get_token("creator-9").await.unwrap().unwrap();
        assert_eq!(indexed.internal_id, created.token.internal_id);
        assert_eq!(indexed.quadratic_divisor, 2);

        let err = h
            .orchestrator
            .create_market("creator-9", TokenKind::Creator, metadata(), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::MarketAlreadyExists(_)));
        assert_eq!(h.ledger.submissions(), vec!["create"]);
    }

    #[tokio::test]
    async fn test_distribute_fees_reports_amounts() {
        let h = harness();
        h.ledger.seed_market("post-1", TokenKind::Post, 1);
        h.ledger.fund(10_000_000);
        h.ledger.set_allowance(10_000_000);
        let report = h.orchestrator.buy("post-1", 2, None).await.unwrap();
        let fees = report.realized.unwrap().fees_paid;

        let distribution = h.orchestrator.distribute_fees("post-1").await.unwrap();
        let paid = distribution.creator_amount.unwrap() + distribution.platform_amount.unwrap();
        assert_eq!(paid, fees);
        assert_eq!(h.ledger.market("post-1").unwrap().creator_fees, 0);
    }
}
