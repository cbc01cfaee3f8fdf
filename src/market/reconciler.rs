// src/market/reconciler.rs
//
// Mirrors finalized ledger trades into the off-chain index. Idempotent on
// the transaction signature, never retries or reverses the ledger side, and
// never fails the user-visible action: index problems are logged and
// reported as `Deferred`. A backfill pass heals rows that were deferred or
// lost.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::error::MarketError;
use crate::index::{OffchainIndex, RecordOutcome};
use crate::market::events::{decode_logs, find_trade};
use crate::market::gateway::{LedgerGateway, ReceiptStatus};
use crate::models::{MarketStats, TransactionOutcome};

/// Markets backfilled at the same time within one cycle.
const BACKFILL_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ReconcileStatus {
    Recorded,
    AlreadyRecorded,
    /// Not written now; backfill will pick it up.
    Deferred(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub scanned: usize,
    pub healed: usize,
    pub already_indexed: usize,
    pub skipped: usize, // Pending, failed, or not a trade
    pub failed: usize,
}

impl BackfillReport {
    fn merge(&mut self, other: &BackfillReport) {
        self.scanned += other.scanned;
        self.healed += other.healed;
        self.already_indexed += other.already_indexed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

pub struct SettlementReconciler {
    index: Arc<dyn OffchainIndex>,
    ledger: Arc<dyn LedgerGateway>,
    signature_limit: usize,
    running: Arc<RwLock<bool>>,
    task_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    shutdown: Arc<Notify>,
}

impl SettlementReconciler {
    pub fn new(index: Arc<dyn OffchainIndex>, ledger: Arc<dyn LedgerGateway>, signature_limit: usize) -> Self {
        Self {
            index,
            ledger,
            signature_limit: signature_limit.max(1),
            running: Arc::new(RwLock::new(false)),
            task_handle: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub async fn reconcile(&self, outcome: &TransactionOutcome) -> ReconcileStatus {
        let signature = &outcome.receipt.signature;
        let Some(record) = outcome.to_record() else {
            warn!(
                "Transaction {} on {} finalized without a trade event; realized economics unknown, deferring to backfill",
                signature, outcome.token_uuid
            );
            return ReconcileStatus::Deferred("no trade event in receipt".to_string());
        };

        match self.index.record_transaction(&record).await {
            Ok(RecordOutcome::Inserted) => {
                info!(
                    "Recorded {} {} x{} on {} at slot {} (total {})",
                    record.trade_type, signature, record.amount, record.token_uuid, record.slot, record.total_cost
                );
                ReconcileStatus::Recorded
            }
            Ok(RecordOutcome::Duplicate) => {
                debug!("Transaction {} already indexed", signature);
                ReconcileStatus::AlreadyRecorded
            }
            Err(e) => {
                error!("Failed to index transaction {}: {}", signature, e);
                ReconcileStatus::Deferred(e.to_string())
            }
        }
    }

    /// Reconciles, then refreshes the cached stats if a new record landed.
    pub async fn reconcile_with_stats(
        &self,
        outcome: &TransactionOutcome,
        stats: Option<&MarketStats>,
    ) -> ReconcileStatus {
        let status = self.reconcile(outcome).await;
        if let (ReconcileStatus::Recorded, Some(stats)) = (&status, stats) {
            self.refresh_cached_stats(stats).await;
        }
        status
    }

    /// Best-effort refresh of the index's display cache.
    pub async fn refresh_cached_stats(&self, stats: &MarketStats) {
        if let Err(e) = self.index.cache_stats(stats).await {
            warn!("Failed to cache stats for {}: {}", stats.token_uuid, e);
        }
    }

    /// Indexes any recent finalized trade of `uuid` the index is missing.
    pub async fn backfill_market(&self, uuid: &str) -> Result<BackfillReport, MarketError> {
        let signatures = self.ledger.recent_signatures(uuid, self.signature_limit).await?;
        let program_id = self.ledger.program_id();
        let mut report = BackfillReport::default();

        // Oldest first, so records land in ledger order.
        for signature in signatures.iter().rev() {
            report.scanned += 1;
            match self.index.get_transaction(signature).await {
                Ok(Some(_)) => {
                    report.already_indexed += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Backfill lookup of {} failed: {}", signature, e);
                    report.failed += 1;
                    continue;
                }
            }

            let receipt = match self.ledger.fetch_receipt(signature).await {
                Ok(ReceiptStatus::Finalized(receipt)) => receipt,
                Ok(status) => {
                    debug!("Backfill skipping {}: {:?}", signature, status);
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Backfill receipt fetch for {} failed: {}", signature, e);
                    report.failed += 1;
                    continue;
                }
            };

            let events = decode_logs(&receipt.logs, &program_id);
            let Some(trade) = find_trade(&events, uuid, None).cloned() else {
                report.skipped += 1;
                continue;
            };
            let outcome = TransactionOutcome {
                token_uuid: uuid.to_string(),
                receipt,
                trade: Some(trade),
                user_id: None,
            };
            match self.reconcile(&outcome).await {
                ReconcileStatus::Recorded => report.healed += 1,
                ReconcileStatus::AlreadyRecorded => report.already_indexed += 1,
                ReconcileStatus::Deferred(_) => report.failed += 1,
            }
        }

        if report.healed > 0 {
            info!("Backfill healed {} missing record(s) for {}", report.healed, uuid);
        }
        Ok(report)
    }

    /// One backfill pass over every token the index knows about.
    pub async fn run_backfill_cycle(&self) -> Result<BackfillReport, MarketError> {
        let tokens = self.index.list_tokens().await?;
        let mut results = stream::iter(tokens)
            .map(|token| async move {
                let result = self.backfill_market(&token.uuid).await;
                (result, token.uuid)
            })
            .buffer_unordered(BACKFILL_CONCURRENCY);

        let mut total = BackfillReport::default();
        while let Some((result, uuid)) = results.next().await {
            match result {
                Ok(report) => total.merge(&report),
                Err(e) => {
                    warn!("Backfill of {} failed: {}", uuid, e);
                    total.failed += 1;
                }
            }
        }
        debug!("Backfill cycle finished: {:?}", total);
        Ok(total)
    }

    // --- Backfill Task ---

    pub async fn start_backfill_loop(self: Arc<Self>, every: Duration) {
        let mut running_guard = self.running.write().await;
        if *running_guard {
            warn!("Backfill loop start requested but already running.");
            return;
        }
        *running_guard = true;
        drop(running_guard);

        info!("Starting backfill loop every {:?}...", every);

        let self_clone = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval_timer = interval(every);
            interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                if !*self_clone.running.read().await {
                    break;
                }
                tokio::select! {
                    _ = interval_timer.tick() => {}
                    _ = self_clone.shutdown.notified() => break,
                }
                if let Err(e) = self_clone.run_backfill_cycle().await {
                    error!("Error during backfill cycle: {}", e);
                }
            }
            info!("Backfill loop finished.");
        });

        *self.task_handle.lock().await = Some(handle);
    }

    pub async fn stop_backfill_loop(&self) {
        let mut running_guard = self.running.write().await;
        if !*running_guard {
            warn!("Backfill loop stop requested but not running.");
            return;
        }
        info!("Stopping backfill loop...");
        *running_guard = false;
        drop(running_guard);
        self.shutdown.notify_one();

        if let Some(handle) = self.task_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Error waiting for backfill task: {:?}", e);
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
