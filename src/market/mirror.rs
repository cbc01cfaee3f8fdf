// src/market/mirror.rs
//
// Client-side cache of portfolios for display. Entries are slot-versioned:
// an authoritative read never replaces a newer one. Optimistic changes are
// layered on top and removed when the action settles or fails.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::Portfolio;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimisticChange {
    Buy { amount: u64 },
    Sell { amount: u64 },
    Freebie,
}

impl OptimisticChange {
    fn apply(&self, portfolio: &mut Portfolio) {
        match *self {
            Self::Buy { amount } => {
                portfolio.balance = portfolio.balance.saturating_add(amount);
                portfolio.total_bought = portfolio.total_bought.saturating_add(amount);
            }
            Self::Sell { amount } => {
                portfolio.balance = portfolio.balance.saturating_sub(amount);
                portfolio.total_sold = portfolio.total_sold.saturating_add(amount);
            }
            Self::Freebie => {
                portfolio.balance = portfolio.balance.saturating_add(1);
                portfolio.freebie_balance = portfolio.freebie_balance.saturating_add(1);
                portfolio.total_bought = portfolio.total_bought.saturating_add(1);
                portfolio.has_claimed_freebie = true;
            }
        }
    }
}

/// Identifies one optimistic change so it can be reverted or settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticTicket {
    id: u64,
    key: (String, String),
}

#[derive(Debug, Clone)]
struct MirrorEntry {
    /// `None` until an authoritative read has been observed.
    confirmed: Option<Portfolio>,
    pending: Vec<(u64, OptimisticChange)>,
}

#[derive(Default)]
pub struct PortfolioMirror {
    entries: RwLock<HashMap<(String, String), MirrorEntry>>,
    next_ticket: AtomicU64,
}

fn key_of(token_uuid: &str, holder: &str) -> (String, String) {
    (token_uuid.to_string(), holder.to_string())
}

impl PortfolioMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confirmed state with any pending optimistic changes applied. Nothing
    /// is returned for a holder that was never read from the ledger.
    pub async fn view(&self, token_uuid: &str, holder: &str) -> Option<Portfolio> {
        let entries = self.entries.read().await;
        let entry = entries.get(&key_of(token_uuid, holder))?;
        let mut portfolio = entry.confirmed.clone()?;
        for (_, change) in &entry.pending {
            change.apply(&mut portfolio);
        }
        Some(portfolio)
    }

    /// Stores an authoritative read unless a newer one is already held.
    /// Returns whether it was stored.
    pub async fn observe(&self, portfolio: Portfolio) -> bool {
        let mut entries = self.entries.write().await;
        let key = key_of(&portfolio.token_uuid, &portfolio.holder_address);
        let entry = entries.entry(key).or_insert_with(|| MirrorEntry {
            confirmed: None,
            pending: Vec::new(),
        });
        let held_slot = entry.confirmed.as_ref().map(|held| held.observed_slot);
        if let Some(held_slot) = held_slot.filter(|held_slot| *held_slot > portfolio.observed_slot) {
            debug!(
                "Ignoring stale portfolio for {} at slot {} (have {})",
                portfolio.holder_address, portfolio.observed_slot, held_slot
            );
            return false;
        }
        entry.confirmed = Some(portfolio);
        true
    }

    pub async fn apply_optimistic(&self, token_uuid: &str, holder: &str, change: OptimisticChange) -> OptimisticTicket {
        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let key = key_of(token_uuid, holder);
        let mut entries = self.entries.write().await;
        entries
            .entry(key.clone())
            .or_insert_with(|| MirrorEntry {
                confirmed: None,
                pending: Vec::new(),
            })
            .pending
            .push((id, change));
        OptimisticTicket { id, key }
    }

    /// Drops an optimistic change whose action did not take effect.
    pub async fn revert(&self, ticket: &OptimisticTicket) {
        let mut entries = self.entries.write().await;
        let unobserved = match entries.get_mut(&ticket.key) {
            Some(entry) => {
                entry.pending.retain(|(id, _)| *id != ticket.id);
                entry.confirmed.is_none() && entry.pending.is_empty()
            }
            None => false,
        };
        if unobserved {
            entries.remove(&ticket.key);
        }
    }

    /// Drops an optimistic change whose action may or may not have taken
    /// effect. The confirmed state can no longer be trusted either.
    pub async fn abandon(&self, ticket: &OptimisticTicket) {
        self.invalidate(&ticket.key.0, &ticket.key.1).await;
    }

    /// Replaces an optimistic change with the authoritative post-action read.
    pub async fn settle(&self, ticket: &OptimisticTicket, authoritative: Option<Portfolio>) {
        self.revert(ticket).await;
        match authoritative {
            Some(portfolio) => {
                self.observe(portfolio).await;
            }
            // The change happened but we could not read it back: force a refetch.
            None => self.invalidate(&ticket.key.0, &ticket.key.1).await,
        }
    }

    pub async fn invalidate(&self, token_uuid: &str, holder: &str) {
        self.entries.write().await.remove(&key_of(token_uuid, holder));
    }
}
