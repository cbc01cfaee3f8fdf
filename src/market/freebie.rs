// src/market/freebie.rs
//
// Access-token coupons for freebie claims. A coupon lives in the off-chain
// index, the claim on the ledger; the two are not transactional. Claims go
// validate -> eligibility -> consume -> claim, and a claim that definitively
// did not happen gives the coupon back.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::MarketError;
use crate::index::OffchainIndex;
use crate::market::orchestrator::{ActionReport, TransactionOrchestrator};
use crate::market::reader::MarketReader;
use crate::models::AccessToken;
use solana_sdk::pubkey::Pubkey;

pub struct FreebieCoordinator {
    index: Arc<dyn OffchainIndex>,
    reader: MarketReader,
    orchestrator: Arc<TransactionOrchestrator>,
}

impl FreebieCoordinator {
    pub fn new(index: Arc<dyn OffchainIndex>, orchestrator: Arc<TransactionOrchestrator>) -> Self {
        Self {
            index,
            reader: orchestrator.reader().clone(),
            orchestrator,
        }
    }

    /// Mints a new coupon for an existing market.
    pub async fn issue(&self, uuid: &str) -> Result<AccessToken, MarketError> {
        if !self.reader.exists(uuid).await? {
            return Err(MarketError::NotFound(uuid.to_string()));
        }
        let token = AccessToken::issue(uuid);
        self.index.put_access_token(&token).await?;
        info!("Issued access token for {}", uuid);
        Ok(token)
    }

    /// Read-only check that `code` is an unused coupon for `uuid`.
    pub async fn validate(&self, code: &str, uuid: &str) -> Result<AccessToken, MarketError> {
        let token = self
            .index
            .get_access_token(code)
            .await?
            .ok_or_else(|| MarketError::InvalidAccessToken(code.to_string()))?;
        if token.token_uuid != uuid {
            return Err(MarketError::WrongMarket(format!(
                "token is for {}, not {}",
                token.token_uuid, uuid
            )));
        }
        if token.is_used {
            return Err(MarketError::AccessTokenUsed(code.to_string()));
        }
        Ok(token)
    }

    /// Marks the coupon used. Of two concurrent consumers exactly one wins.
    pub async fn consume(
        &self,
        code: &str,
        uuid: &str,
        holder: &str,
        user_id: Option<&str>,
    ) -> Result<AccessToken, MarketError> {
        self.validate(code, uuid).await?;
        self.index.consume_access_token(code, holder, user_id).await
    }

    pub async fn release(&self, code: &str) -> Result<AccessToken, MarketError> {
        self.index.release_access_token(code).await
    }

    pub async fn remaining_freebies(&self, uuid: &str) -> Result<u32, MarketError> {
        self.reader.remaining_freebies(uuid).await
    }

    pub async fn can_claim_freebie(&self, uuid: &str, holder: &Pubkey) -> Result<bool, MarketError> {
        self.reader.can_claim_freebie(uuid, holder).await
    }

    /// Ledger-side eligibility of the signer, with the reason it fails.
    async fn check_eligible(&self, uuid: &str) -> Result<(), MarketError> {
        let state = self
            .reader
            .market_state(uuid)
            .await?
            .ok_or_else(|| MarketError::NotFound(uuid.to_string()))?;
        if state.account.remaining_freebies() == 0 {
            return Err(MarketError::QuotaExhausted(uuid.to_string()));
        }
        let signer = self.orchestrator.signer();
        if self.reader.portfolio(uuid, &signer).await?.has_claimed_freebie {
            return Err(MarketError::AlreadyClaimed(format!("{} in {}", signer, uuid)));
        }
        Ok(())
    }

    pub async fn claim_with_access_token(
        &self,
        code: &str,
        uuid: &str,
        user_id: Option<&str>,
    ) -> Result<ActionReport, MarketError> {
        self.validate(code, uuid).await?;
        self.check_eligible(uuid).await?;

        let holder = self.orchestrator.signer().to_string();
        self.index.consume_access_token(code, &holder, user_id).await?;

        match self.orchestrator.claim_freebie(uuid, user_id).await {
            Ok(report) => {
                info!("Access token redeemed for a freebie in {}: {}", uuid, report.signature);
                Ok(report)
            }
            Err(e) if e.is_ledger_effect_unknown() => {
                // Releasing could grant a second freebie if the claim landed.
                warn!(
                    "Freebie claim on {} has an unknown outcome, access token stays consumed: {}",
                    uuid, e
                );
                Err(e)
            }
            Err(e) => {
                if let Err(release_err) = self.release(code).await {
                    error!(
                        "Claim on {} failed ({}) and the access token could not be released: {}",
                        uuid, e, release_err
                    );
                } else {
                    info!("Claim on {} failed, access token released: {}", uuid, e);
                }
                Err(e)
            }
        }
    }
}
