use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::Tree;
use tracing::{debug, info};

use super::{OffchainIndex, RecordOutcome};
use crate::error::MarketError;
use crate::models::{AccessToken, CachedStats, MarketStats, Token, TransactionRecord};

/// Embedded index backed by sled. Every value is stored as JSON.
pub struct SledIndex {
    tokens: Tree,
    transactions: Tree,       // signature -> TransactionRecord
    token_transactions: Tree, // <len><uuid><slot><signature> -> signature
    access_tokens: Tree,      // code -> AccessToken
    stats: Tree,              // uuid -> CachedStats
}

fn index_err(e: sled::Error) -> MarketError {
    MarketError::Index(e.to_string())
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, MarketError> {
    serde_json::to_vec(value).map_err(|e| MarketError::Index(format!("Failed to encode value: {}", e)))
}

fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MarketError> {
    serde_json::from_slice(bytes).map_err(|e| MarketError::Index(format!("Failed to decode value: {}", e)))
}

/// Length-prefixed uuid, so no uuid's prefix is another uuid's key range.
fn token_prefix(uuid: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + uuid.len());
    key.extend_from_slice(&(uuid.len() as u32).to_be_bytes());
    key.extend_from_slice(uuid.as_bytes());
    key
}

fn token_transaction_key(record: &TransactionRecord) -> Vec<u8> {
    // Big-endian slot keeps the prefix scan in ledger order.
    let mut key = token_prefix(&record.token_uuid);
    key.extend_from_slice(&record.slot.to_be_bytes());
    key.extend_from_slice(record.signature.as_bytes());
    key
}

impl SledIndex {
    pub fn open(path: &str) -> Result<Self, MarketError> {
        let db = sled::open(path).map_err(index_err)?;
        info!("Opened sled index at {}", path);
        Self::from_db(&db)
    }

    /// In-memory database removed on drop.
    pub fn temporary() -> Result<Self, MarketError> {
        let db = sled::Config::new().temporary(true).open().map_err(index_err)?;
        Self::from_db(&db)
    }

    fn from_db(db: &sled::Db) -> Result<Self, MarketError> {
        Ok(Self {
            tokens: db.open_tree("tokens").map_err(index_err)?,
            transactions: db.open_tree("transactions").map_err(index_err)?,
            token_transactions: db.open_tree("token_transactions").map_err(index_err)?,
            access_tokens: db.open_tree("access_tokens").map_err(index_err)?,
            stats: db.open_tree("stats").map_err(index_err)?,
        })
    }

    fn get_json<T: DeserializeOwned>(tree: &Tree, key: &str) -> Result<Option<T>, MarketError> {
        match tree.get(key.as_bytes()).map_err(index_err)? {
            Some(bytes) => Ok(Some(from_json(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OffchainIndex for SledIndex {
    async fn upsert_token(&self, token: &Token) -> Result<(), MarketError> {
        self.tokens
            .insert(token.uuid.as_bytes(), to_json(token)?)
            .map_err(index_err)?;
        Ok(())
    }

    async fn get_token(&self, uuid: &str) -> Result<Option<Token>, MarketError> {
        Self::get_json(&self.tokens, uuid)
    }

    async fn list_tokens(&self) -> Result<Vec<Token>, MarketError> {
        self.tokens
            .iter()
            .values()
            .map(|value| from_json(&value.map_err(index_err)?))
            .collect()
    }

    async fn record_transaction(&self, record: &TransactionRecord) -> Result<RecordOutcome, MarketError> {
        let key = record.signature.as_bytes();
        let value = to_json(record)?;
        let by_token_key = token_transaction_key(record);

        let outcome = (&self.transactions, &self.token_transactions)
            .transaction(|(transactions, by_token)| {
                if transactions.get(key)?.is_some() {
                    return Ok::<_, ConflictableTransactionError<()>>(RecordOutcome::Duplicate);
                }
                transactions.insert(key, value.clone())?;
                by_token.insert(by_token_key.as_slice(), key)?;
                Ok(RecordOutcome::Inserted)
            })
            .map_err(|e: TransactionError<()>| MarketError::Index(format!("{:?}", e)))?;

        debug!("Recorded transaction {}: {:?}", record.signature, outcome);
        Ok(outcome)
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<TransactionRecord>, MarketError> {
        Self::get_json(&self.transactions, signature)
    }

    async fn transactions_for_token(&self, uuid: &str, limit: usize) -> Result<Vec<TransactionRecord>, MarketError> {
        let mut records = Vec::new();
        for entry in self.token_transactions.scan_prefix(token_prefix(uuid)).take(limit) {
            let (_, signature) = entry.map_err(index_err)?;
            if let Some(bytes) = self.transactions.get(&signature).map_err(index_err)? {
                records.push(from_json(&bytes)?);
            }
        }
        Ok(records)
    }

    async fn put_access_token(&self, token: &AccessToken) -> Result<(), MarketError> {
        self.access_tokens
            .compare_and_swap(token.code.as_bytes(), None as Option<&[u8]>, Some(to_json(token)?))
            .map_err(index_err)?
            .map_err(|_| MarketError::Index(format!("Access token code collision: {}", token.code)))
    }

    async fn get_access_token(&self, code: &str) -> Result<Option<AccessToken>, MarketError> {
        Self::get_json(&self.access_tokens, code)
    }

    async fn consume_access_token(
        &self,
        code: &str,
        holder: &str,
        user_id: Option<&str>,
    ) -> Result<AccessToken, MarketError> {
        let current = self
            .access_tokens
            .get(code.as_bytes())
            .map_err(index_err)?
            .ok_or_else(|| MarketError::InvalidAccessToken(code.to_string()))?;
        let token: AccessToken = from_json(&current)?;
        if token.is_used {
            return Err(MarketError::AccessTokenUsed(code.to_string()));
        }

        let consumed = token.consumed_by(holder, user_id);
        self.access_tokens
            .compare_and_swap(code.as_bytes(), Some(&current), Some(to_json(&consumed)?))
            .map_err(index_err)?
            // Someone else swapped it between our read and write.
            .map_err(|_| MarketError::AccessTokenUsed(code.to_string()))?;
        Ok(consumed)
    }

    async fn release_access_token(&self, code: &str) -> Result<AccessToken, MarketError> {
        let current = self
            .access_tokens
            .get(code.as_bytes())
            .map_err(index_err)?
            .ok_or_else(|| MarketError::InvalidAccessToken(code.to_string()))?;
        let token: AccessToken = from_json(&current)?;
        if !token.is_used {
            return Ok(token);
        }

        let released = token.released();
        self.access_tokens
            .compare_and_swap(code.as_bytes(), Some(&current), Some(to_json(&released)?))
            .map_err(index_err)?
            .map_err(|_| MarketError::Index(format!("Access token {} changed during release", code)))?;
        Ok(released)
    }

    async fn cache_stats(&self, stats: &MarketStats) -> Result<(), MarketError> {
        let cached = CachedStats {
            stats: stats.clone(),
            cached_at: Utc::now(),
        };
        self.stats
            .insert(stats.token_uuid.as_bytes(), to_json(&cached)?)
            .map_err(index_err)?;
        Ok(())
    }

    async fn cached_stats(&self, uuid: &str) -> Result<Option<CachedStats>, MarketError> {
        Self::get_json(&self.stats, uuid)
    }
}
