//! Client side of the bonding-curve token market: ledger access, pricing,
//! the transaction lifecycle and off-chain settlement.

pub mod allowance;
pub mod events;
pub mod freebie;
pub mod gateway;
pub mod inflight;
pub mod lifecycle;
pub mod mirror;
pub mod orchestrator;
pub mod pricing;
pub mod program;
pub mod reader;
pub mod reconciler;
pub mod retry;

#[cfg(test)]
pub mod mock;

pub use freebie::FreebieCoordinator;
pub use gateway::{LedgerGateway, SolanaLedgerGateway};
pub use orchestrator::{TradeSide, TransactionOrchestrator};
pub use reader::MarketReader;
pub use reconciler::SettlementReconciler;
