//! In-memory ledger for tests.
//!
//! Executes the market program's rules against local state so orchestrator,
//! reconciler and freebie flows can be exercised end to end. Failures,
//! timeouts and missing events can be injected per call.

use async_trait::async_trait;
use chrono::Utc;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::error::MarketError;
use crate::market::events::{self, FeesDistributedEvent, MarketEvent, TokenCreatedEvent, TradeEvent};
use crate::market::gateway::{LedgerGateway, ReceiptStatus, SubmissionHandle};
use crate::market::pricing::{self, BuyQuote};
use crate::market::program::{
    self, CreateMarketArgs, MarketAccount, MarketState, PortfolioAccount, PortfolioState, ProgramErrorCode,
};
use crate::models::{FinalizedReceipt, TokenKind};

/// State change made by other traders between a quote and the next trade's
/// inclusion.
struct MarketShift {
    uuid: String,
    extra_supply: u64,
    remaining_freebies: Option<u32>,
}

#[derive(Default)]
struct LedgerBook {
    markets: HashMap<String, MarketAccount>,
    portfolios: HashMap<(String, Pubkey), PortfolioAccount>,
    balance: u64,
    allowance: u64,
    slot: u64,
    next_internal_id: u64,
    receipts: HashMap<String, FinalizedReceipt>,
    /// Newest first, like `getSignaturesForAddress`
    market_signatures: HashMap<String, Vec<String>>,
    submissions: Vec<String>,
    fail_next_submission: Option<MarketError>,
    time_out_next: bool,
    unrecognized_next: bool,
    failing_reads: usize,
    shift_before_next_trade: Option<MarketShift>,
    finalization_gate: Option<Arc<Notify>>,
}

pub struct MockLedger {
    signer: Pubkey,
    program_id: Pubkey,
    book: Mutex<LedgerBook>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            signer: Pubkey::new_unique(),
            program_id: Pubkey::new_unique(),
            book: Mutex::new(LedgerBook {
                slot: 100,
                next_internal_id: 1,
                ..Default::default()
            }),
        }
    }

    fn with_book<T>(&self, f: impl FnOnce(&mut LedgerBook) -> T) -> T {
        f(&mut self.book.lock().unwrap())
    }

    /// Creates a market directly, bypassing submission.
    pub fn seed_market(&self, uuid: &str, kind: TokenKind, divisor: u64) {
        self.with_book(|book| {
            let account = new_market_account(book, uuid, kind, Pubkey::new_unique(), divisor);
            book.markets.insert(uuid.to_string(), account);
        });
    }

    pub fn fund(&self, amount: u64) {
        self.with_book(|book| book.balance = amount);
    }

    pub fn set_allowance(&self, amount: u64) {
        self.with_book(|book| book.allowance = amount);
    }

    pub fn set_paused(&self, uuid: &str, paused: bool) {
        self.with_book(|book| {
            if let Some(market) = book.markets.get_mut(uuid) {
                market.paused = paused;
            }
        });
    }

    pub fn set_remaining_freebies(&self, uuid: &str, remaining: u32) {
        self.with_book(|book| {
            if let Some(market) = book.markets.get_mut(uuid) {
                market.freebies_claimed = market.freebie_quota.saturating_sub(remaining);
            }
        });
    }

    pub fn fail_next_submission(&self, err: MarketError) {
        self.with_book(|book| book.fail_next_submission = Some(err));
    }

    /// The next transaction still lands, but finalization is never observed.
    pub fn time_out_next_finalization(&self) {
        self.with_book(|book| book.time_out_next = true);
    }

    /// The next transaction's logs carry only an unknown event.
    pub fn emit_unrecognized_next(&self) {
        self.with_book(|book| book.unrecognized_next = true);
    }

    /// Another trader's buy of `units` lands just before the next
    /// submission on `uuid`.
    pub fn front_run_next_trade(&self, uuid: &str, units: u64) {
        self.with_book(|book| {
            book.shift_before_next_trade = Some(MarketShift {
                uuid: uuid.to_string(),
                extra_supply: units,
                remaining_freebies: None,
            })
        });
    }

    /// The freebie quota of `uuid` changes just before the next submission
    /// on it.
    pub fn reopen_freebies_before_next_trade(&self, uuid: &str, remaining: u32) {
        self.with_book(|book| {
            book.shift_before_next_trade = Some(MarketShift {
                uuid: uuid.to_string(),
                extra_supply: 0,
                remaining_freebies: Some(remaining),
            })
        });
    }

    pub fn fail_next_reads(&self, count: usize) {
        self.with_book(|book| book.failing_reads = count);
    }

    /// Finalization waits until the returned handle is notified.
    pub fn gate_finalization(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.with_book(|book| book.finalization_gate = Some(gate.clone()));
        gate
    }

    /// Labels of every accepted submission, in order.
    pub fn submissions(&self) -> Vec<String> {
        self.with_book(|book| book.submissions.clone())
    }

    pub fn balance(&self) -> u64 {
        self.with_book(|book| book.balance)
    }

    pub fn allowance(&self) -> u64 {
        self.with_book(|book| book.allowance)
    }

    pub fn market(&self, uuid: &str) -> Option<MarketAccount> {
        self.with_book(|book| book.markets.get(uuid).cloned())
    }

    pub fn holding(&self, uuid: &str) -> Option<PortfolioAccount> {
        let key = (uuid.to_string(), self.signer);
        self.with_book(|book| book.portfolios.get(&key).cloned())
    }

    fn check_read(&self) -> Result<u64, MarketError> {
        self.with_book(|book| {
            if book.failing_reads > 0 {
                book.failing_reads -= 1;
                return Err(MarketError::TransientTransport("injected read failure".into()));
            }
            Ok(book.slot)
        })
    }

    /// Applies a mutation and records its receipt, the way the ledger would
    /// once the transaction is included.
    fn execute<F>(&self, label: &str, uuid: Option<&str>, apply: F) -> Result<SubmissionHandle, MarketError>
    where
        F: FnOnce(&mut LedgerBook, &Pubkey, &Pubkey) -> Result<Vec<MarketEvent>, MarketError>,
    {
        let signer = self.signer;
        let program_id = self.program_id;
        self.with_book(|book| {
            if let Some(err) = book.fail_next_submission.take() {
                return Err(err);
            }
            if let Some(uuid) = uuid {
                let shifts_this = matches!(&book.shift_before_next_trade, Some(shift) if shift.uuid == uuid);
                if let Some(shift) = shifts_this.then(|| book.shift_before_next_trade.take()).flatten() {
                    if let Some(market) = book.markets.get_mut(uuid) {
                        market.circulating_supply += shift.extra_supply;
                        market.total_minted += shift.extra_supply;
                        if let Some(remaining) = shift.remaining_freebies {
                            market.freebies_claimed = market.freebie_quota.saturating_sub(remaining);
                        }
                    }
                }
            }
            let mut emitted = apply(book, &signer, &program_id)?;
            if std::mem::take(&mut book.unrecognized_next) {
                emitted = vec![MarketEvent::Unrecognized { discriminator: [7u8; 8] }];
            }

            book.slot += 1;
            let signature = Signature::new_unique().to_string();
            book.receipts.insert(
                signature.clone(),
                FinalizedReceipt {
                    signature: signature.clone(),
                    slot: book.slot,
                    block_time: Some(Utc::now().timestamp()),
                    fee_lamports: 5_000,
                    compute_units: Some(42_000),
                    logs: events::program_logs(&program_id, &emitted),
                },
            );
            if let Some(uuid) = uuid {
                book.market_signatures
                    .entry(uuid.to_string())
                    .or_default()
                    .insert(0, signature.clone());
            }
            book.submissions.push(label.to_string());
            Ok(SubmissionHandle::new(signature))
        })
    }
}

fn new_market_account(
    book: &mut LedgerBook,
    uuid: &str,
    kind: TokenKind,
    owner: Pubkey,
    divisor: u64,
) -> MarketAccount {
    let internal_id = book.next_internal_id;
    book.next_internal_id += 1;
    MarketAccount {
        internal_id,
        uuid: uuid.to_string(),
        kind,
        owner,
        quadratic_divisor: divisor.max(1),
        freebie_quota: kind.freebie_quota(),
        freebies_claimed: 0,
        freebies_outstanding: 0,
        circulating_supply: 0,
        total_minted: 0,
        total_buyers: 0,
        paying_buyers: 0,
        highest_price: 0,
        reward_pool: 0,
        creator_fees: 0,
        platform_fees: 0,
        paused: false,
        created_at: Utc::now().timestamp(),
    }
}

fn open_market(book: &LedgerBook, uuid: &str) -> Result<MarketAccount, MarketError> {
    let market = book
        .markets
        .get(uuid)
        .cloned()
        .ok_or_else(|| ProgramErrorCode::MarketNotFound.into_error(uuid))?;
    if market.paused {
        return Err(ProgramErrorCode::Paused.into_error(uuid));
    }
    Ok(market)
}

fn holding_of(book: &LedgerBook, program_id: &Pubkey, uuid: &str, holder: &Pubkey) -> PortfolioAccount {
    book.portfolios
        .get(&(uuid.to_string(), *holder))
        .cloned()
        .unwrap_or_else(|| PortfolioAccount::new(program::derive_market_pda(program_id, uuid).0, *holder))
}

/// Shared by freebie-eligible buys and explicit claims.
fn apply_purchase(
    book: &mut LedgerBook,
    program_id: &Pubkey,
    trader: &Pubkey,
    mut market: MarketAccount,
    mut holding: PortfolioAccount,
    amount: u64,
    quote: BuyQuote,
    is_freebie: bool,
) -> MarketEvent {
    let now = Utc::now().timestamp();
    let fees = quote.creator_fee + quote.platform_fee;
    let first_purchase = holding.total_bought == 0;
    let first_paid = !is_freebie && holding.total_bought == u64::from(holding.has_claimed_freebie);

    market.circulating_supply += amount;
    market.total_minted += amount;
    market.reward_pool += quote.curve_cost;
    market.creator_fees += quote.creator_fee;
    market.platform_fees += quote.platform_fee;
    market.highest_price = market
        .highest_price
        .max(pricing::unit_price(market.circulating_supply - 1, market.quadratic_divisor));
    if first_purchase {
        market.total_buyers += 1;
    }
    if first_paid {
        market.paying_buyers += 1;
    }
    if is_freebie {
        market.freebies_claimed += 1;
        market.freebies_outstanding += 1;
        holding.freebie_balance += 1;
        holding.has_claimed_freebie = true;
    }

    holding.balance += amount;
    holding.total_bought += amount;
    holding.total_fees_paid += fees;
    holding.transaction_count += 1;
    holding.last_transaction_time = now;

    let event = TradeEvent {
        uuid: market.uuid.clone(),
        market: program::derive_market_pda(program_id, &market.uuid).0,
        trader: *trader,
        is_buy: true,
        is_freebie,
        amount,
        unit_price: quote.curve_cost / amount,
        total_cost: quote.total,
        creator_fee: quote.creator_fee,
        platform_fee: quote.platform_fee,
        supply_after: market.circulating_supply,
        timestamp: now,
    };
    book.portfolios.insert((market.uuid.clone(), *trader), holding);
    book.markets.insert(market.uuid.clone(), market);
    MarketEvent::Trade(event)
}

#[async_trait]
impl LedgerGateway for MockLedger {
    fn signer(&self) -> Pubkey {
        self.signer
    }

    fn program_id(&self) -> Pubkey {
        self.program_id
    }

    async fn market_state(&self, uuid: &str) -> Result<Option<MarketState>, MarketError> {
        let slot = self.check_read()?;
        let address = program::derive_market_pda(&self.program_id, uuid).0;
        Ok(self.market(uuid).map(|account| MarketState {
            address,
            account,
            observed_slot: slot,
        }))
    }

    async fn portfolio_state(&self, uuid: &str, holder: &Pubkey) -> Result<Option<PortfolioState>, MarketError> {
        let slot = self.check_read()?;
        let key = (uuid.to_string(), *holder);
        Ok(self.with_book(|book| book.portfolios.get(&key).cloned()).map(|account| PortfolioState {
            address: Pubkey::new_unique(),
            account,
            observed_slot: slot,
        }))
    }

    async fn payment_balance(&self, holder: &Pubkey) -> Result<u64, MarketError> {
        self.check_read()?;
        Ok(if *holder == self.signer { self.balance() } else { 0 })
    }

    async fn payment_allowance(&self, holder: &Pubkey) -> Result<u64, MarketError> {
        self.check_read()?;
        Ok(if *holder == self.signer { self.allowance() } else { 0 })
    }

    async fn submit_create(&self, args: CreateMarketArgs) -> Result<SubmissionHandle, MarketError> {
        let uuid = args.uuid.clone();
        self.execute("create", Some(&uuid), |book, signer, program_id| {
            if book.markets.contains_key(&args.uuid) {
                return Err(ProgramErrorCode::MarketAlreadyExists.into_error(&args.uuid));
            }
            let account = new_market_account(book, &args.uuid, args.kind, *signer, args.quadratic_divisor);
            let event = TokenCreatedEvent {
                uuid: account.uuid.clone(),
                internal_id: account.internal_id,
                market: program::derive_market_pda(program_id, &account.uuid).0,
                owner: account.owner,
                kind: account.kind,
                quadratic_divisor: account.quadratic_divisor,
                freebie_quota: account.freebie_quota,
                timestamp: account.created_at,
            };
            book.markets.insert(args.uuid.clone(), account);
            Ok(vec![MarketEvent::TokenCreated(event)])
        })
    }

    async fn submit_buy(&self, uuid: &str, amount: u64, max_total_cost: u64) -> Result<SubmissionHandle, MarketError> {
        self.execute("buy", Some(uuid), |book, signer, program_id| {
            let market = open_market(book, uuid)?;
            if amount == 0 {
                return Err(MarketError::InvalidAmount(uuid.to_string()));
            }
            let holding = holding_of(book, program_id, uuid, signer);
            let is_freebie =
                amount == 1 && pricing::can_claim_freebie(market.remaining_freebies(), holding.has_claimed_freebie);
            let quote = if is_freebie {
                BuyQuote::free(1)
            } else {
                pricing::buy_total(market.circulating_supply, market.quadratic_divisor, amount)
            };
            if quote.total > max_total_cost {
                return Err(ProgramErrorCode::SlippageExceeded.into_error(uuid));
            }
            if quote.total > book.balance {
                return Err(MarketError::InsufficientBalance(uuid.to_string()));
            }
            if quote.total > book.allowance {
                return Err(MarketError::InsufficientAllowance(uuid.to_string()));
            }
            book.balance -= quote.total;
            book.allowance -= quote.total;
            Ok(vec![apply_purchase(book, program_id, signer, market, holding, amount, quote, is_freebie)])
        })
    }

    async fn submit_sell(&self, uuid: &str, amount: u64, min_payout: u64) -> Result<SubmissionHandle, MarketError> {
        self.execute("sell", Some(uuid), |book, signer, program_id| {
            let mut market = open_market(book, uuid)?;
            let mut holding = holding_of(book, program_id, uuid, signer);
            let quote = pricing::holder_sell_total(
                market.circulating_supply,
                market.quadratic_divisor,
                amount,
                holding.balance,
                holding.freebie_balance,
            )
            .filter(|_| amount > 0)
            .ok_or_else(|| MarketError::InsufficientBalance(uuid.to_string()))?;
            if quote.payout < min_payout {
                return Err(ProgramErrorCode::SlippageExceeded.into_error(uuid));
            }

            let now = Utc::now().timestamp();
            let paid_held = holding.balance - holding.freebie_balance;
            let freebie_sold = amount.saturating_sub(paid_held);
            market.reward_pool = market.reward_pool.saturating_sub(quote.gross);
            market.creator_fees += quote.creator_fee;
            market.platform_fees += quote.platform_fee;
            market.circulating_supply -= amount;
            market.freebies_outstanding = market.freebies_outstanding.saturating_sub(freebie_sold);
            holding.balance -= amount;
            holding.freebie_balance -= freebie_sold;
            holding.total_sold += amount;
            holding.total_fees_paid += quote.creator_fee + quote.platform_fee;
            holding.transaction_count += 1;
            holding.last_transaction_time = now;
            book.balance += quote.payout;

            let event = TradeEvent {
                uuid: uuid.to_string(),
                market: program::derive_market_pda(program_id, uuid).0,
                trader: *signer,
                is_buy: false,
                is_freebie: freebie_sold > 0,
                amount,
                unit_price: quote.gross / amount,
                total_cost: quote.payout,
                creator_fee: quote.creator_fee,
                platform_fee: quote.platform_fee,
                supply_after: market.circulating_supply,
                timestamp: now,
            };
            book.portfolios.insert((uuid.to_string(), *signer), holding);
            book.markets.insert(uuid.to_string(), market);
            Ok(vec![MarketEvent::Trade(event)])
        })
    }

    async fn submit_claim_freebie(&self, uuid: &str) -> Result<SubmissionHandle, MarketError> {
        self.execute("claim", Some(uuid), |book, signer, program_id| {
            let market = open_market(book, uuid)?;
            let holding = holding_of(book, program_id, uuid, signer);
            if holding.has_claimed_freebie {
                return Err(ProgramErrorCode::AlreadyClaimed.into_error(uuid));
            }
            if market.remaining_freebies() == 0 {
                return Err(ProgramErrorCode::QuotaExhausted.into_error(uuid));
            }
            Ok(vec![apply_purchase(book, program_id, signer, market, holding, 1, BuyQuote::free(1), true)])
        })
    }

    async fn submit_distribute_fees(&self, uuid: &str, owner: &Pubkey) -> Result<SubmissionHandle, MarketError> {
        let owner = *owner;
        self.execute("distribute_fees", Some(uuid), |book, _, program_id| {
            let mut market = open_market(book, uuid)?;
            if market.owner != owner {
                return Err(MarketError::TransactionFailed(format!("{}: owner mismatch", uuid)));
            }
            let event = FeesDistributedEvent {
                uuid: uuid.to_string(),
                market: program::derive_market_pda(program_id, uuid).0,
                creator_amount: std::mem::take(&mut market.creator_fees),
                platform_amount: std::mem::take(&mut market.platform_fees),
                timestamp: Utc::now().timestamp(),
            };
            book.markets.insert(uuid.to_string(), market);
            Ok(vec![MarketEvent::FeesDistributed(event)])
        })
    }

    async fn submit_approve(&self, amount: u64) -> Result<SubmissionHandle, MarketError> {
        self.execute("approve", None, |book, _, _| {
            book.allowance = amount;
            Ok(Vec::new())
        })
    }

    async fn await_finalization(&self, handle: &SubmissionHandle) -> Result<FinalizedReceipt, MarketError> {
        let gate = self.with_book(|book| book.finalization_gate.take());
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.with_book(|book| {
            if std::mem::take(&mut book.time_out_next) {
                return Err(MarketError::UnknownOutcome {
                    signature: handle.signature.clone(),
                    reason: "injected finalization timeout".into(),
                });
            }
            book.receipts
                .get(&handle.signature)
                .cloned()
                .ok_or_else(|| MarketError::TransactionFailed(format!("unknown signature {}", handle.signature)))
        })
    }

    async fn fetch_receipt(&self, signature: &str) -> Result<ReceiptStatus, MarketError> {
        self.check_read()?;
        Ok(self.with_book(|book| match book.receipts.get(signature) {
            Some(receipt) => ReceiptStatus::Finalized(receipt.clone()),
            None => ReceiptStatus::Pending,
        }))
    }

    async fn recent_signatures(&self, uuid: &str, limit: usize) -> Result<Vec<String>, MarketError> {
        self.check_read()?;
        Ok(self.with_book(|book| {
            book.market_signatures
                .get(uuid)
                .map(|sigs| sigs.iter().take(limit).cloned().collect())
                .unwrap_or_default()
        }))
    }
}
