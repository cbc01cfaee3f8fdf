//! Off-chain index: the application database that mirrors confirmed ledger
//! trades, stores token records and access-token coupons, and caches stats.

pub mod http;
pub mod sled_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MarketError;
use crate::models::{AccessToken, CachedStats, MarketStats, Token, TransactionRecord};

pub use http::BackendIndexClient;
pub use sled_store::SledIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Inserted,
    /// A record with the same signature already exists; nothing was written.
    Duplicate,
}

/// Storage operations the reconciler and the freebie coordinator rely on.
///
/// `record_transaction` is insert-once per signature and
/// `consume_access_token` is an atomic compare-and-set; every
/// implementation must keep both guarantees.
#[async_trait]
pub trait OffchainIndex: Send + Sync {
    async fn upsert_token(&self, token: &Token) -> Result<(), MarketError>;

    async fn get_token(&self, uuid: &str) -> Result<Option<Token>, MarketError>;

    async fn list_tokens(&self) -> Result<Vec<Token>, MarketError>;

    async fn record_transaction(&self, record: &TransactionRecord) -> Result<RecordOutcome, MarketError>;

    async fn get_transaction(&self, signature: &str) -> Result<Option<TransactionRecord>, MarketError>;

    /// Records of one token, oldest slot first, at most `limit`.
    async fn transactions_for_token(&self, uuid: &str, limit: usize) -> Result<Vec<TransactionRecord>, MarketError>;

    async fn put_access_token(&self, token: &AccessToken) -> Result<(), MarketError>;

    async fn get_access_token(&self, code: &str) -> Result<Option<AccessToken>, MarketError>;

    /// Marks an unused coupon as used. `AccessTokenUsed` if it already was,
    /// `InvalidAccessToken` if it does not exist.
    async fn consume_access_token(
        &self,
        code: &str,
        holder: &str,
        user_id: Option<&str>,
    ) -> Result<AccessToken, MarketError>;

    /// Returns a used coupon to the unused state.
    async fn release_access_token(&self, code: &str) -> Result<AccessToken, MarketError>;

    async fn cache_stats(&self, stats: &MarketStats) -> Result<(), MarketError>;

    async fn cached_stats(&self, uuid: &str) -> Result<Option<CachedStats>, MarketError>;
}
