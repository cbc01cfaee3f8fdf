// src/market/program.rs
//
// Market program bindings: PDA derivation, on-chain account layouts,
// instruction builders and program error classification.

use borsh::{BorshDeserialize, BorshSerialize};
use chrono::{TimeZone, Utc};
use solana_sdk::{
    hash::hash,
    instruction::{AccountMeta, Instruction, InstructionError},
    pubkey::Pubkey,
    system_program,
    transaction::TransactionError,
};
use spl_associated_token_account::get_associated_token_address;

use crate::error::MarketError;
use crate::market::pricing;
use crate::models::{MarketStats, Portfolio, TokenKind, TokenMetadata};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Market account PDA seed: `["market", sha256(uuid)]`.
pub const MARKET_SEED: &[u8] = b"market";

/// Portfolio account PDA seed: `["portfolio", market, holder]`.
pub const PORTFOLIO_SEED: &[u8] = b"portfolio";

/// Spending authority the holder delegates payment tokens to.
pub const SPENDER_SEED: &[u8] = b"spender";

/// Anchor prefixes every account and instruction with an 8-byte discriminator.
pub const DISCRIMINATOR_LEN: usize = 8;

/// First custom error code of the market program.
const PROGRAM_ERROR_BASE: u32 = 6000;

// SPL Token error codes surfaced through CPI failures.
const TOKEN_ERROR_INSUFFICIENT_FUNDS: u32 = 1;
const TOKEN_ERROR_OWNER_MISMATCH: u32 = 4;

/// `sha256("<namespace>:<name>")[..8]`, the Anchor discriminator scheme.
pub fn discriminator(namespace: &str, name: &str) -> [u8; DISCRIMINATOR_LEN] {
    let digest = hash(format!("{}:{}", namespace, name).as_bytes());
    let mut out = [0u8; DISCRIMINATOR_LEN];
    out.copy_from_slice(&digest.to_bytes()[..DISCRIMINATOR_LEN]);
    out
}

// ============================================================================
// PDA DERIVATION
// ============================================================================

/// Seeds are capped at 32 bytes, so the uuid is hashed first.
pub fn uuid_seed(uuid: &str) -> [u8; 32] {
    hash(uuid.as_bytes()).to_bytes()
}

pub fn derive_market_pda(program_id: &Pubkey, uuid: &str) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[MARKET_SEED, &uuid_seed(uuid)], program_id)
}

pub fn derive_portfolio_pda(program_id: &Pubkey, market: &Pubkey, holder: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[PORTFOLIO_SEED, market.as_ref(), holder.as_ref()], program_id)
}

pub fn derive_spender_pda(program_id: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[SPENDER_SEED], program_id)
}

/// Payment-token vault owned by the spender PDA.
pub fn derive_vault(program_id: &Pubkey, payment_mint: &Pubkey) -> Pubkey {
    let (spender, _) = derive_spender_pda(program_id);
    get_associated_token_address(&spender, payment_mint)
}

// ============================================================================
// ACCOUNT LAYOUTS
// ============================================================================

/// On-chain state of one token market.
#[derive(BorshDeserialize, BorshSerialize, Debug, Clone, PartialEq, Eq)]
pub struct MarketAccount {
    pub internal_id: u64,
    pub uuid: String,
    pub kind: TokenKind,
    pub owner: Pubkey,
    pub quadratic_divisor: u64,
    pub freebie_quota: u32,
    pub freebies_claimed: u32,
    /// Freebie units still held by someone
    pub freebies_outstanding: u64,
    pub circulating_supply: u64,
    /// Units ever issued, sells do not reduce it
    pub total_minted: u64,
    pub total_buyers: u32,
    pub paying_buyers: u32,
    pub highest_price: u64,
    pub reward_pool: u64,
    pub creator_fees: u64,
    pub platform_fees: u64,
    pub paused: bool,
    pub created_at: i64,
}

/// Per-holder state in one market.
#[derive(BorshDeserialize, BorshSerialize, Debug, Clone, PartialEq, Eq)]
pub struct PortfolioAccount {
    pub market: Pubkey,
    pub holder: Pubkey,
    pub balance: u64,
    pub freebie_balance: u64,
    pub total_bought: u64,
    pub total_sold: u64,
    pub total_fees_paid: u64,
    pub transaction_count: u32,
    pub last_transaction_time: i64,
    pub has_claimed_freebie: bool,
}

fn decode_account<T: BorshDeserialize>(name: &str, data: &[u8]) -> Result<T, MarketError> {
    if data.len() < DISCRIMINATOR_LEN {
        return Err(MarketError::Decode(format!("{} account too short: {} bytes", name, data.len())));
    }
    if data[..DISCRIMINATOR_LEN] != discriminator("account", name) {
        return Err(MarketError::Decode(format!("{} account discriminator mismatch", name)));
    }
    // Accounts may carry trailing padding, so don't require full consumption.
    T::deserialize(&mut &data[DISCRIMINATOR_LEN..])
        .map_err(|e| MarketError::Decode(format!("Failed to deserialize {}: {}", name, e)))
}

fn encode_account<T: BorshSerialize>(name: &str, account: &T) -> Vec<u8> {
    let mut data = discriminator("account", name).to_vec();
    // Borsh serialization into a Vec cannot fail.
    data.extend(account.try_to_vec().unwrap_or_default());
    data
}

impl MarketAccount {
    pub fn decode(data: &[u8]) -> Result<Self, MarketError> {
        decode_account("MarketAccount", data)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_account("MarketAccount", self)
    }

    pub fn remaining_freebies(&self) -> u32 {
        self.freebie_quota.saturating_sub(self.freebies_claimed)
    }
}

impl PortfolioAccount {
    pub fn decode(data: &[u8]) -> Result<Self, MarketError> {
        decode_account("PortfolioAccount", data)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_account("PortfolioAccount", self)
    }

    pub fn new(market: Pubkey, holder: Pubkey) -> Self {
        Self {
            market,
            holder,
            balance: 0,
            freebie_balance: 0,
            total_bought: 0,
            total_sold: 0,
            total_fees_paid: 0,
            transaction_count: 0,
            last_transaction_time: 0,
            has_claimed_freebie: false,
        }
    }
}

/// A market account as observed at a given slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketState {
    pub address: Pubkey,
    pub account: MarketAccount,
    pub observed_slot: u64,
}

impl MarketState {
    pub fn supply(&self) -> u64 {
        self.account.circulating_supply
    }

    pub fn divisor(&self) -> u64 {
        self.account.quadratic_divisor
    }

    pub fn to_stats(&self) -> MarketStats {
        let account = &self.account;
        let liability = pricing::liability(
            account.circulating_supply,
            account.quadratic_divisor,
            account.freebies_outstanding,
        );
        let is_post = account.kind == TokenKind::Post;
        MarketStats {
            token_uuid: account.uuid.clone(),
            total_buyers: account.total_buyers,
            paying_buyers: account.paying_buyers,
            freebie_claimed_count: account.freebies_claimed,
            freebie_quota: account.freebie_quota,
            current_price: pricing::unit_price(account.circulating_supply, account.quadratic_divisor),
            highest_price_seen: account.highest_price,
            reward_pool_balance: account.reward_pool,
            creator_fee_balance: account.creator_fees,
            platform_fee_balance: account.platform_fees,
            liability,
            break_even: account.reward_pool >= liability,
            total_supply: is_post.then_some(account.total_minted),
            circulating_supply: is_post.then_some(account.circulating_supply),
            paused: account.paused,
            observed_slot: self.observed_slot,
        }
    }
}

/// A portfolio account as observed at a given slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortfolioState {
    pub address: Pubkey,
    pub account: PortfolioAccount,
    pub observed_slot: u64,
}

impl PortfolioState {
    pub fn to_portfolio(&self, token_uuid: &str) -> Portfolio {
        let account = &self.account;
        Portfolio {
            token_uuid: token_uuid.to_string(),
            holder_address: account.holder.to_string(),
            balance: account.balance,
            freebie_balance: account.freebie_balance,
            total_bought: account.total_bought,
            total_sold: account.total_sold,
            total_fees_paid: account.total_fees_paid,
            transaction_count: account.transaction_count,
            last_transaction_time: (account.last_transaction_time > 0)
                .then(|| Utc.timestamp_opt(account.last_transaction_time, 0).single())
                .flatten(),
            has_claimed_freebie: account.has_claimed_freebie,
            observed_slot: self.observed_slot,
        }
    }
}

// ============================================================================
// INSTRUCTIONS
// ============================================================================

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct CreateMarketArgs {
    pub uuid: String,
    pub kind: TokenKind,
    pub metadata: TokenMetadata,
    pub quadratic_divisor: u64,
}

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct BuyArgs {
    pub amount: u64,
    pub max_total_cost: u64,
}

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct SellArgs {
    pub amount: u64,
    pub min_payout: u64,
}

fn instruction_data<T: BorshSerialize>(name: &str, args: &T) -> Vec<u8> {
    let mut data = discriminator("global", name).to_vec();
    data.extend(args.try_to_vec().unwrap_or_default());
    data
}

/// Accounts shared by every trade instruction.
fn trade_accounts(program_id: &Pubkey, payment_mint: &Pubkey, trader: &Pubkey, uuid: &str) -> Vec<AccountMeta> {
    let (market, _) = derive_market_pda(program_id, uuid);
    let (portfolio, _) = derive_portfolio_pda(program_id, &market, trader);
    let (spender, _) = derive_spender_pda(program_id);
    vec![
        AccountMeta::new(market, false),
        AccountMeta::new(portfolio, false),
        AccountMeta::new(*trader, true),
        AccountMeta::new(get_associated_token_address(trader, payment_mint), false),
        AccountMeta::new(derive_vault(program_id, payment_mint), false),
        AccountMeta::new_readonly(spender, false),
        AccountMeta::new_readonly(*payment_mint, false),
        AccountMeta::new_readonly(spl_token::id(), false),
        AccountMeta::new_readonly(system_program::id(), false),
    ]
}

pub fn create_market_ix(program_id: &Pubkey, creator: &Pubkey, args: &CreateMarketArgs) -> Instruction {
    let (market, _) = derive_market_pda(program_id, &args.uuid);
    Instruction::new_with_bytes(
        *program_id,
        &instruction_data("create_market", args),
        vec![
            AccountMeta::new(market, false),
            AccountMeta::new(*creator, true),
            AccountMeta::new_readonly(system_program::id(), false),
        ],
    )
}

pub fn buy_ix(program_id: &Pubkey, payment_mint: &Pubkey, buyer: &Pubkey, uuid: &str, args: &BuyArgs) -> Instruction {
    Instruction::new_with_bytes(
        *program_id,
        &instruction_data("buy", args),
        trade_accounts(program_id, payment_mint, buyer, uuid),
    )
}

pub fn sell_ix(program_id: &Pubkey, payment_mint: &Pubkey, seller: &Pubkey, uuid: &str, args: &SellArgs) -> Instruction {
    Instruction::new_with_bytes(
        *program_id,
        &instruction_data("sell", args),
        trade_accounts(program_id, payment_mint, seller, uuid),
    )
}

pub fn claim_freebie_ix(program_id: &Pubkey, payment_mint: &Pubkey, claimer: &Pubkey, uuid: &str) -> Instruction {
    Instruction::new_with_bytes(
        *program_id,
        &discriminator("global", "claim_freebie"),
        trade_accounts(program_id, payment_mint, claimer, uuid),
    )
}

pub fn distribute_fees_ix(program_id: &Pubkey, payment_mint: &Pubkey, caller: &Pubkey, owner: &Pubkey, uuid: &str) -> Instruction {
    let (market, _) = derive_market_pda(program_id, uuid);
    let (spender, _) = derive_spender_pda(program_id);
    Instruction::new_with_bytes(
        *program_id,
        &discriminator("global", "distribute_fees"),
        vec![
            AccountMeta::new(market, false),
            AccountMeta::new_readonly(*caller, true),
            AccountMeta::new(derive_vault(program_id, payment_mint), false),
            AccountMeta::new(get_associated_token_address(owner, payment_mint), false),
            AccountMeta::new_readonly(spender, false),
            AccountMeta::new_readonly(spl_token::id(), false),
        ],
    )
}

// ============================================================================
// ERROR CLASSIFICATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramErrorCode {
    Paused,
    QuotaExhausted,
    AlreadyClaimed,
    InsufficientSupply,
    SlippageExceeded,
    MarketNotFound,
    MarketAlreadyExists,
}

impl ProgramErrorCode {
    pub fn from_code(code: u32) -> Option<Self> {
        match code.checked_sub(PROGRAM_ERROR_BASE)? {
            0 => Some(Self::Paused),
            1 => Some(Self::QuotaExhausted),
            2 => Some(Self::AlreadyClaimed),
            3 => Some(Self::InsufficientSupply),
            4 => Some(Self::SlippageExceeded),
            5 => Some(Self::MarketNotFound),
            6 => Some(Self::MarketAlreadyExists),
            _ => None,
        }
    }

    pub fn code(&self) -> u32 {
        PROGRAM_ERROR_BASE
            + match self {
                Self::Paused => 0,
                Self::QuotaExhausted => 1,
                Self::AlreadyClaimed => 2,
                Self::InsufficientSupply => 3,
                Self::SlippageExceeded => 4,
                Self::MarketNotFound => 5,
                Self::MarketAlreadyExists => 6,
            }
    }

    pub fn into_error(self, context: &str) -> MarketError {
        let context = context.to_string();
        match self {
            Self::Paused => MarketError::Paused(context),
            Self::QuotaExhausted => MarketError::QuotaExhausted(context),
            Self::AlreadyClaimed => MarketError::AlreadyClaimed(context),
            Self::InsufficientSupply => MarketError::InsufficientBalance(format!("{}: insufficient supply", context)),
            Self::SlippageExceeded => MarketError::TransactionFailed(format!("{}: slippage exceeded", context)),
            Self::MarketNotFound => MarketError::NotFound(context),
            Self::MarketAlreadyExists => MarketError::MarketAlreadyExists(context),
        }
    }
}

/// Top-level programs of a transaction's instructions, in order, and the
/// market program whose instructions move payment tokens through SPL Token
/// by CPI. Lets a custom error code be attributed to the program that
/// raised it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorScope {
    market_program: Option<Pubkey>,
    instruction_programs: Vec<Pubkey>,
}

impl ErrorScope {
    pub fn new(market_program: Pubkey, instruction_programs: Vec<Pubkey>) -> Self {
        Self {
            market_program: Some(market_program),
            instruction_programs,
        }
    }

    pub fn for_instructions(market_program: Pubkey, instructions: &[Instruction]) -> Self {
        Self::new(market_program, instructions.iter().map(|ix| ix.program_id).collect())
    }

    fn program_at(&self, index: u8) -> Option<&Pubkey> {
        self.instruction_programs.get(index as usize)
    }

    fn is_market(&self, program: &Pubkey) -> bool {
        self.market_program.as_ref() == Some(program)
    }
}

/// Maps a landed or preflight-rejected transaction error onto the taxonomy.
///
/// Market program codes are trusted when the failing instruction belongs to
/// the market program or cannot be resolved. SPL Token codes are only
/// trusted when the failing instruction is SPL Token itself or a market
/// instruction (which reaches SPL Token by CPI).
pub fn classify_transaction_error(err: &TransactionError, context: &str, scope: &ErrorScope) -> MarketError {
    match err {
        TransactionError::InstructionError(index, InstructionError::Custom(code)) => {
            let failing = scope.program_at(*index);
            let from_market = failing.map_or(true, |program| scope.is_market(program));
            if from_market {
                if let Some(program_error) = ProgramErrorCode::from_code(*code) {
                    return program_error.into_error(context);
                }
            }
            let reaches_token = failing.is_some_and(|program| *program == spl_token::id() || scope.is_market(program));
            match *code {
                TOKEN_ERROR_INSUFFICIENT_FUNDS if reaches_token => MarketError::InsufficientBalance(context.to_string()),
                TOKEN_ERROR_OWNER_MISMATCH if reaches_token => MarketError::InsufficientAllowance(context.to_string()),
                other => {
                    let program = failing.map_or_else(|| "unknown program".to_string(), |p| p.to_string());
                    MarketError::TransactionFailed(format!(
                        "{}: instruction {} ({}) custom error {}",
                        context, index, program, other
                    ))
                }
            }
        }
        TransactionError::InsufficientFundsForFee => {
            MarketError::InsufficientBalance(format!("{}: cannot pay transaction fee", context))
        }
        other => MarketError::TransactionFailed(format!("{}: {:?}", context, other)),
    }
}

// ============================================================================
// TESTS
// ============================================================================
