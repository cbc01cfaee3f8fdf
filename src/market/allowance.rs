use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::MarketError;
use crate::market::gateway::LedgerGateway;
use crate::market::reader::MarketReader;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AllowanceOutcome {
    /// Existing delegation already covers the spend.
    Sufficient { allowance: u64 },
    /// A finalized approval raised the delegation to `amount`.
    Approved { signature: String, amount: u64 },
}

/// Keeps the signer's payment-token delegation to the market program at or
/// above what the next spend needs.
#[derive(Clone)]
pub struct AllowanceManager {
    ledger: Arc<dyn LedgerGateway>,
    reader: MarketReader,
}

impl AllowanceManager {
    pub fn new(ledger: Arc<dyn LedgerGateway>, reader: MarketReader) -> Self {
        Self { ledger, reader }
    }

    /// Fails fast when the balance cannot cover `required`. Otherwise
    /// approves exactly `required` when the current allowance falls short
    /// and waits for that approval to finalize.
    pub async fn ensure_allowance(&self, required: u64) -> Result<AllowanceOutcome, MarketError> {
        let holder = self.ledger.signer();
        let balance = self.reader.payment_balance(&holder).await?;
        if balance < required {
            return Err(MarketError::InsufficientBalance(format!(
                "{} holds {} payment units, {} required",
                holder, balance, required
            )));
        }

        let allowance = self.reader.payment_allowance(&holder).await?;
        if allowance >= required {
            debug!("Allowance {} covers required {}", allowance, required);
            return Ok(AllowanceOutcome::Sufficient { allowance });
        }

        info!("Raising allowance for {} from {} to {}", holder, allowance, required);
        let handle = self.ledger.submit_approve(required).await?;
        let receipt = self.ledger.await_finalization(&handle).await?;
        Ok(AllowanceOutcome::Approved {
            signature: receipt.signature,
            amount: required,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::mock::MockLedger;
    use crate::market::retry::RetryPolicy;

    fn manager(ledger: Arc<MockLedger>) -> AllowanceManager {
        let reader = MarketReader::new(ledger.clone(), RetryPolicy::no_retry());
        AllowanceManager::new(ledger, reader)
    }

    #[tokio::test]
    async fn test_sufficient_allowance_submits_nothing() {
        let ledger = Arc::new(MockLedger::new());
        ledger.fund(1_000);
        ledger.set_allowance(500);

        let outcome = manager(ledger.clone()).ensure_allowance(500).await.unwrap();
        assert_eq!(outcome, AllowanceOutcome::Sufficient { allowance: 500 });
        assert!(ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_shortfall_approves_exact_amount() {
        let ledger = Arc::new(MockLedger::new());
        ledger.fund(1_000);
        ledger.set_allowance(10);

        let outcome = manager(ledger.clone()).ensure_allowance(700).await.unwrap();
        assert!(matches!(outcome, AllowanceOutcome::Approved { amount: 700, .. }));
        assert_eq!(ledger.allowance(), 700);
        assert_eq!(ledger.submissions(), vec!["approve"]);
    }

    #[tokio::test]
    async fn test_unfunded_holder_is_rejected_before_approval() {
        let ledger = Arc::new(MockLedger::new());
        ledger.fund(100);

        let err = manager(ledger.clone()).ensure_allowance(700).await.unwrap_err();
        assert!(matches!(err, MarketError::InsufficientBalance(_)));
        assert!(ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_standing_allowance_does_not_hide_short_balance() {
        let ledger = Arc::new(MockLedger::new());
        ledger.fund(100);
        ledger.set_allowance(10_000);

        let err = manager(ledger.clone()).ensure_allowance(700).await.unwrap_err();
        assert!(matches!(err, MarketError::InsufficientBalance(_)));
        assert!(ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_approval_timeout_is_unknown_outcome() {
        let ledger = Arc::new(MockLedger::new());
        ledger.fund(1_000);
        ledger.time_out_next_finalization();

        let err = manager(ledger.clone()).ensure_allowance(700).await.unwrap_err();
        assert!(err.is_ledger_effect_unknown());
    }
}
