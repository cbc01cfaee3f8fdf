pub mod token;
pub mod market;
pub mod transaction;
pub mod access_token;

// Re-export commonly used types
pub use access_token::AccessToken;
pub use market::{CachedStats, MarketStats, Portfolio};
pub use token::{Token, TokenKind, TokenMetadata};
pub use transaction::{FinalizedReceipt, TradeType, TransactionOutcome, TransactionRecord};
