use thiserror::Error;

/// Error taxonomy shared by the ledger gateway, the orchestrator and the
/// off-chain index.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MarketError {
    #[error("Market not found: {0}")]
    NotFound(String),

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Insufficient allowance: {0}")]
    InsufficientAllowance(String),

    #[error("Freebie already claimed: {0}")]
    AlreadyClaimed(String),

    #[error("Freebie quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Market paused: {0}")]
    Paused(String),

    #[error("Transient transport error: {0}")]
    TransientTransport(String),

    /// Submitted, but finalization could not be observed. The ledger may or
    /// may not have applied it; only a status recheck can tell.
    #[error("Outcome unknown for transaction {signature}: {reason}")]
    UnknownOutcome { signature: String, reason: String },

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Action already in flight: {0}")]
    AlreadyInFlight(String),

    #[error("Market already exists: {0}")]
    MarketAlreadyExists(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid access token: {0}")]
    InvalidAccessToken(String),

    #[error("Access token already used: {0}")]
    AccessTokenUsed(String),

    #[error("Access token belongs to another market: {0}")]
    WrongMarket(String),

    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MarketError {
    /// Stable machine-readable name, used by the HTTP layer.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InsufficientBalance(_) => "insufficient_balance",
            Self::InsufficientAllowance(_) => "insufficient_allowance",
            Self::AlreadyClaimed(_) => "already_claimed",
            Self::QuotaExhausted(_) => "quota_exhausted",
            Self::Paused(_) => "paused",
            Self::TransientTransport(_) => "transient_transport",
            Self::UnknownOutcome { .. } => "unknown_outcome",
            Self::TransactionFailed(_) => "transaction_failed",
            Self::AlreadyInFlight(_) => "already_in_flight",
            Self::MarketAlreadyExists(_) => "market_already_exists",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::InvalidAccessToken(_) => "invalid_access_token",
            Self::AccessTokenUsed(_) => "access_token_used",
            Self::WrongMarket(_) => "wrong_market",
            Self::InvalidState(_) => "invalid_state",
            Self::Decode(_) => "decode",
            Self::Index(_) => "index",
            Self::Wallet(_) => "wallet",
            Self::Config(_) => "config",
        }
    }

    /// Only transport hiccups on reads may be retried automatically.
    pub fn is_retriable_read(&self) -> bool {
        matches!(self, Self::TransientTransport(_))
    }

    pub fn is_ledger_effect_unknown(&self) -> bool {
        matches!(self, Self::UnknownOutcome { .. })
    }
}
