use solana_client::{
    client_error::{ClientError, ClientErrorKind},
    rpc_client::{GetConfirmedSignaturesForAddress2Config, RpcClient},
    rpc_config::{RpcSendTransactionConfig, RpcTransactionConfig},
    rpc_request::RpcError,
};
use solana_sdk::{
    account::Account as SolanaAccount, // Alias to avoid conflict with spl_token::state::Account
    commitment_config::CommitmentConfig,
    hash::Hash,
    program_pack::Pack,
    pubkey::Pubkey,
    signature::Signature,
    transaction::Transaction,
};
use solana_transaction_status::{
    option_serializer::OptionSerializer, TransactionStatus, UiTransactionEncoding,
};
use spl_token::state::Account as TokenAccount;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

use crate::error::MarketError;
use crate::market::program::{classify_transaction_error, ErrorScope};
use crate::models::FinalizedReceipt;

/// Thin async wrapper over the blocking RPC client. Every call runs on the
/// blocking pool and comes back classified into `MarketError`.
#[derive(Clone)]
pub struct SolanaClient {
    rpc_client: Arc<RpcClient>,
    commitment: CommitmentConfig,
}

/// Maps an RPC client error onto the taxonomy. Transaction errors carried
/// by preflight failures are classified against the submitted instructions.
pub fn classify_client_error(err: &ClientError, context: &str, scope: &ErrorScope) -> MarketError {
    if let Some(tx_err) = err.get_transaction_error() {
        return classify_transaction_error(&tx_err, context, scope);
    }
    match err.kind() {
        ClientErrorKind::Io(_) | ClientErrorKind::Reqwest(_) => {
            MarketError::TransientTransport(format!("{}: {}", context, err))
        }
        ClientErrorKind::RpcError(RpcError::RpcResponseError { code, message, .. }) => {
            MarketError::TransactionFailed(format!("{}: RPC error {}: {}", context, code, message))
        }
        ClientErrorKind::RpcError(_) => MarketError::TransientTransport(format!("{}: {}", context, err)),
        ClientErrorKind::SerdeJson(_) => MarketError::Decode(format!("{}: {}", context, err)),
        ClientErrorKind::SigningError(_) => MarketError::Wallet(format!("{}: {}", context, err)),
        _ => MarketError::TransactionFailed(format!("{}: {}", context, err)),
    }
}

impl SolanaClient {
    pub fn new(rpc_url: &str, commitment: CommitmentConfig) -> Result<Self, MarketError> {
        let rpc_client = RpcClient::new_with_commitment(rpc_url.to_string(), commitment);
        match rpc_client.get_latest_blockhash() {
            Ok(_) => info!("Successfully connected to Solana RPC: {}", rpc_url),
            Err(e) => {
                error!("Failed to connect to Solana RPC {}: {}", rpc_url, e);
                return Err(MarketError::Config(format!("Failed to connect to RPC {}: {}", rpc_url, e)));
            }
        }

        Ok(Self {
            rpc_client: Arc::new(rpc_client),
            commitment,
        })
    }

    pub fn commitment(&self) -> CommitmentConfig {
        self.commitment
    }

    // Helper to run blocking RPC calls in a tokio task
    async fn run_blocking<F, T>(&self, context: &str, f: F) -> Result<T, MarketError>
    where
        F: FnOnce(Arc<RpcClient>) -> solana_client::client_error::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run_blocking_scoped(context, &ErrorScope::default(), f).await
    }

    async fn run_blocking_scoped<F, T>(&self, context: &str, scope: &ErrorScope, f: F) -> Result<T, MarketError>
    where
        F: FnOnce(Arc<RpcClient>) -> solana_client::client_error::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let client = self.rpc_client.clone();
        tokio::task::spawn_blocking(move || f(client))
            .await
            .map_err(|e| MarketError::TransientTransport(format!("{}: task join error: {}", context, e)))?
            .map_err(|e| {
                debug!("Solana RPC client error during {}: {:?}", context, e);
                classify_client_error(&e, context, scope)
            })
    }

    /// Fresh account read at the configured commitment, with the slot it was
    /// observed at. `None` when the account does not exist.
    pub async fn get_account_with_slot(&self, pubkey: &Pubkey) -> Result<(u64, Option<SolanaAccount>), MarketError> {
        let pubkey = *pubkey;
        let commitment = self.commitment;
        let response = self
            .run_blocking("get_account", move |client| {
                client.get_account_with_commitment(&pubkey, commitment)
            })
            .await?;
        Ok((response.context.slot, response.value))
    }

    /// SPL token account state, `None` when the account does not exist yet.
    pub async fn get_token_account(&self, pubkey: &Pubkey) -> Result<Option<TokenAccount>, MarketError> {
        let (_, account) = self.get_account_with_slot(pubkey).await?;
        match account {
            Some(account) => TokenAccount::unpack(&account.data)
                .map(Some)
                .map_err(|e| MarketError::Decode(format!("Failed to unpack token account {}: {}", pubkey, e))),
            None => Ok(None),
        }
    }

    pub async fn latest_blockhash(&self) -> Result<Hash, MarketError> {
        self.run_blocking("get_latest_blockhash", |client| client.get_latest_blockhash())
            .await
    }

    /// Sends a signed transaction with preflight checks. Does not wait.
    pub async fn send_transaction(&self, transaction: Transaction, scope: &ErrorScope) -> Result<Signature, MarketError> {
        let config = RpcSendTransactionConfig {
            skip_preflight: false,
            preflight_commitment: Some(self.commitment.commitment),
            encoding: Some(UiTransactionEncoding::Base64),
            max_retries: Some(5),
            min_context_slot: None,
        };
        let signature = self
            .run_blocking_scoped("send_transaction", scope, move |client| {
                client.send_transaction_with_config(&transaction, config)
            })
            .await?;
        debug!("Transaction sent with signature: {}", signature);
        Ok(signature)
    }

    pub async fn signature_status(&self, signature: &Signature) -> Result<Option<TransactionStatus>, MarketError> {
        let signature = *signature;
        let response = self
            .run_blocking("get_signature_statuses", move |client| {
                client.get_signature_statuses(&[signature])
            })
            .await?;
        Ok(response.value.into_iter().next().flatten())
    }

    /// Polls until the signature reaches the configured commitment.
    ///
    /// A landed failure is returned classified. Running out of time, or
    /// losing the RPC connection while polling, yields `UnknownOutcome`.
    pub async fn confirm_transaction(
        &self,
        signature: &Signature,
        scope: &ErrorScope,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<u64, MarketError> {
        let start_time = std::time::Instant::now();
        loop {
            match self.signature_status(signature).await {
                Ok(Some(status)) => {
                    if let Some(err) = &status.err {
                        error!("Transaction {} failed: {:?}", signature, err);
                        return Err(classify_transaction_error(err, &signature.to_string(), scope));
                    }
                    if status.satisfies_commitment(self.commitment) {
                        info!("Transaction {} confirmed at slot {}", signature, status.slot);
                        return Ok(status.slot);
                    }
                    debug!("Transaction {} seen at slot {}, awaiting commitment", signature, status.slot);
                }
                Ok(None) => debug!("Transaction {} status not yet available...", signature),
                Err(e) if e.is_retriable_read() => warn!("Status check for {} failed: {}", signature, e),
                Err(e) => return Err(e),
            }

            if start_time.elapsed() > timeout {
                warn!("Timeout waiting for transaction {} confirmation", signature);
                return Err(MarketError::UnknownOutcome {
                    signature: signature.to_string(),
                    reason: format!("not finalized within {:?}", timeout),
                });
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Inclusion data of a confirmed transaction.
    pub async fn get_receipt(&self, signature: &Signature) -> Result<FinalizedReceipt, MarketError> {
        let sig = *signature;
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Json),
            commitment: Some(self.commitment),
            max_supported_transaction_version: Some(0),
        };
        let tx = self
            .run_blocking("get_transaction", move |client| {
                client.get_transaction_with_config(&sig, config)
            })
            .await?;

        let meta = tx
            .transaction
            .meta
            .ok_or_else(|| MarketError::Decode(format!("Transaction {} has no status meta", signature)))?;
        let logs = match meta.log_messages {
            OptionSerializer::Some(logs) => logs,
            _ => Vec::new(),
        };
        let compute_units = match meta.compute_units_consumed {
            OptionSerializer::Some(units) => Some(units),
            _ => None,
        };

        Ok(FinalizedReceipt {
            signature: signature.to_string(),
            slot: tx.slot,
            block_time: tx.block_time,
            fee_lamports: meta.fee,
            compute_units,
            logs,
        })
    }

    /// Programs invoked by each top-level instruction of a landed
    /// transaction, in order.
    pub async fn instruction_programs(&self, signature: &Signature) -> Result<Vec<Pubkey>, MarketError> {
        let sig = *signature;
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            commitment: Some(self.commitment),
            max_supported_transaction_version: Some(0),
        };
        let tx = self
            .run_blocking("get_transaction", move |client| {
                client.get_transaction_with_config(&sig, config)
            })
            .await?;
        let decoded = tx
            .transaction
            .transaction
            .decode()
            .ok_or_else(|| MarketError::Decode(format!("Transaction {} could not be decoded", signature)))?;
        let keys = decoded.message.static_account_keys();
        Ok(decoded
            .message
            .instructions()
            .iter()
            .filter_map(|ix| keys.get(ix.program_id_index as usize).copied())
            .collect())
    }

    /// Most recent successful signatures touching `address`, newest first.
    pub async fn signatures_for_address(&self, address: &Pubkey, limit: usize) -> Result<Vec<String>, MarketError> {
        let address = *address;
        let config = GetConfirmedSignaturesForAddress2Config {
            before: None,
            until: None,
            limit: Some(limit),
            commitment: Some(self.commitment),
        };
        let entries = self
            .run_blocking("get_signatures_for_address", move |client| {
                client.get_signatures_for_address_with_config(&address, config)
            })
            .await?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.err.is_none())
            .map(|entry| entry.signature)
            .collect())
    }
}
