//! HTTP API over the market client.

pub mod handlers;
pub mod models;
pub mod routes;
pub mod server;

use std::sync::Arc;

use crate::index::OffchainIndex;
use crate::market::{FreebieCoordinator, MarketReader, SettlementReconciler, TransactionOrchestrator};

/// Shared application state for all API handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TransactionOrchestrator>,
    pub reader: MarketReader,
    pub freebies: Arc<FreebieCoordinator>,
    pub index: Arc<dyn OffchainIndex>,
    pub reconciler: Arc<SettlementReconciler>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<TransactionOrchestrator>,
        freebies: Arc<FreebieCoordinator>,
        index: Arc<dyn OffchainIndex>,
        reconciler: Arc<SettlementReconciler>,
    ) -> Self {
        Self {
            reader: orchestrator.reader().clone(),
            orchestrator,
            freebies,
            index,
            reconciler,
        }
    }
}
