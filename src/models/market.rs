use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Derived market statistics. Recomputed on demand from the market account,
/// never stored authoritatively by this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketStats {
    pub token_uuid: String,
    pub total_buyers: u32,
    pub paying_buyers: u32,
    pub freebie_claimed_count: u32,
    pub freebie_quota: u32,
    pub current_price: u64,       // Curve price of the next unit
    pub highest_price_seen: u64,
    pub reward_pool_balance: u64, // Curve reserve backing sells
    pub creator_fee_balance: u64,
    pub platform_fee_balance: u64,
    pub liability: u64,           // Payout owed if every circulating unit were sold
    pub break_even: bool,         // reward_pool_balance >= liability
    pub total_supply: Option<u64>,       // Post tokens only
    pub circulating_supply: Option<u64>, // Post tokens only
    pub paused: bool,
    pub observed_slot: u64,
}

impl MarketStats {
    pub fn remaining_freebies(&self) -> u32 {
        self.freebie_quota.saturating_sub(self.freebie_claimed_count)
    }
}

/// Holdings of one address in one market. A read-through projection of
/// ledger state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Portfolio {
    pub token_uuid: String,
    pub holder_address: String,
    pub balance: u64,
    pub freebie_balance: u64, // Units held that were acquired as a freebie
    pub total_bought: u64,
    pub total_sold: u64,
    pub total_fees_paid: u64,
    pub transaction_count: u32,
    pub last_transaction_time: Option<DateTime<Utc>>,
    pub has_claimed_freebie: bool,
    pub observed_slot: u64,
}

impl Portfolio {
    /// Zero-valued portfolio returned for unresolved markets and fresh holders.
    pub fn empty(token_uuid: &str, holder_address: &str) -> Self {
        Self {
            token_uuid: token_uuid.to_string(),
            holder_address: holder_address.to_string(),
            balance: 0,
            freebie_balance: 0,
            total_bought: 0,
            total_sold: 0,
            total_fees_paid: 0,
            transaction_count: 0,
            last_transaction_time: None,
            has_claimed_freebie: false,
            observed_slot: 0,
        }
    }

    pub fn paid_balance(&self) -> u64 {
        self.balance.saturating_sub(self.freebie_balance)
    }
}

/// Stats snapshot kept by the off-chain index as a display fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedStats {
    pub stats: MarketStats,
    pub cached_at: DateTime<Utc>,
}
