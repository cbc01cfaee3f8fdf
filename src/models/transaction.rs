use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::market::events::TradeEvent;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeType {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Off-chain index entry mirroring one confirmed ledger trade.
/// `signature` is the natural idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub token_uuid: String,
    pub trade_type: TradeType,
    pub amount: u64,
    pub realized_unit_price: u64,
    pub total_cost: u64,
    pub signature: String,          // Ledger transaction hash
    pub slot: u64,                  // Block height of inclusion
    pub compute_units: Option<u64>, // Execution cost consumed
    pub fee_lamports: u64,          // Fee charged for inclusion
    pub is_freebie: bool,
    pub fees_paid: u64,
    pub actor_address: String,
    pub user_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// The finalized inclusion data of a transaction, independent of what it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedReceipt {
    pub signature: String,
    pub slot: u64,
    pub block_time: Option<i64>,
    pub fee_lamports: u64,
    pub compute_units: Option<u64>,
    pub logs: Vec<String>,
}

/// What the reconciler receives for a finalized buy, sell or claim.
/// `trade` is `None` when the receipt carried no recognizable trade event,
/// in which case the realized economics are unknown.
#[derive(Debug, Clone)]
pub struct TransactionOutcome {
    pub token_uuid: String,
    pub receipt: FinalizedReceipt,
    pub trade: Option<TradeEvent>,
    pub user_id: Option<String>,
}

impl TransactionOutcome {
    /// Builds the index record from the ledger event. Returns `None` when the
    /// realized economics are unknown.
    pub fn to_record(&self) -> Option<TransactionRecord> {
        let trade = self.trade.as_ref()?;
        Some(TransactionRecord {
            id: Uuid::new_v4().to_string(),
            token_uuid: self.token_uuid.clone(),
            trade_type: if trade.is_buy { TradeType::Buy } else { TradeType::Sell },
            amount: trade.amount,
            realized_unit_price: trade.unit_price,
            total_cost: trade.total_cost,
            signature: self.receipt.signature.clone(),
            slot: self.receipt.slot,
            compute_units: self.receipt.compute_units,
            fee_lamports: self.receipt.fee_lamports,
            is_freebie: trade.is_freebie,
            fees_paid: trade.creator_fee.saturating_add(trade.platform_fee),
            actor_address: trade.trader.to_string(),
            user_id: self.user_id.clone(),
            recorded_at: Utc::now(),
        })
    }
}
