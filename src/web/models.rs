//! Request and Response DTOs for the Web API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::market::orchestrator::TradeSide;
use crate::models::{MarketStats, Token, TokenKind, TransactionRecord};

// ============================================================================
// Health & Errors
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub signer: String,
    pub backfill_running: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: Option<String>,
    pub kind: String,
    pub retriable: bool,
    /// Where to check an action whose outcome is unknown. Never resubmit it.
    pub recheck_status: Option<String>,
}

// ============================================================================
// Markets
// ============================================================================

#[derive(Debug, Serialize)]
pub struct MarketResponse {
    pub uuid: String,
    pub exists: bool,
    pub current_price: u64,
    pub actual_price: u64,
    pub buy_price: u64,
    pub sell_price: u64,
    pub freebie_sell_price: u64,
    pub remaining_freebies: u32,
    pub token: Option<Token>,
}

#[derive(Debug, Deserialize)]
pub struct CreateMarketRequest {
    pub uuid: String,
    pub kind: TokenKind,
    pub name: String,
    pub image_url: Option<String>,
    pub description: Option<String>,
    pub quadratic_divisor: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct QuoteQuery {
    pub side: TradeSide,
    pub amount: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsSource {
    Ledger,
    Cache,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub uuid: String,
    pub source: StatsSource,
    pub stats: Option<MarketStats>,
    pub cached_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct FreebieQuery {
    pub holder: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FreebieResponse {
    pub uuid: String,
    pub holder: String,
    pub can_claim: bool,
    pub remaining_freebies: u32,
}

// ============================================================================
// Trades
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TradeRequest {
    pub amount: u64,
    pub user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClaimRequest {
    pub access_token: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct TransactionsListResponse {
    pub uuid: String,
    pub transactions: Vec<TransactionRecord>,
    pub total: usize,
}

// ============================================================================
// Access Tokens
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AccessTokenQuery {
    pub uuid: String,
}
