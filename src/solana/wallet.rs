use solana_sdk::{
    instruction::Instruction,
    pubkey::Pubkey,
    signature::{Keypair, Signature},
    signer::Signer,
    transaction::Transaction,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::MarketError;
use crate::market::program::ErrorScope;
use crate::solana::client::SolanaClient;

/// Holds the process signer and submits transactions on its behalf.
#[derive(Clone)]
pub struct WalletManager {
    keypair: Arc<Keypair>,
    solana_client: Arc<SolanaClient>,
}

impl WalletManager {
    pub fn new(private_key_bs58: &str, solana_client: Arc<SolanaClient>) -> Result<Arc<Self>, MarketError> {
        let bytes = bs58::decode(private_key_bs58).into_vec().map_err(|e| {
            error!("Failed to decode base58 private key: {}", e);
            MarketError::Wallet(format!("Invalid private key format: {}", e))
        })?;

        let keypair = Keypair::from_bytes(&bytes).map_err(|e| {
            error!("Failed to create keypair from bytes: {}", e);
            MarketError::Wallet(format!("Invalid private key data: {}", e))
        })?;

        info!("WalletManager initialized. Pubkey: {}", keypair.pubkey());

        Ok(Arc::new(Self {
            keypair: Arc::new(keypair),
            solana_client,
        }))
    }

    pub fn get_public_key(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    /// Signs `instructions` into one legacy transaction and sends it.
    ///
    /// The signature is fixed once signed, so a transport failure during the
    /// send is reported as `UnknownOutcome` carrying that signature: the node
    /// may already have forwarded it.
    pub async fn sign_and_send(&self, instructions: &[Instruction], scope: &ErrorScope) -> Result<Signature, MarketError> {
        let payer = self.get_public_key();
        let recent_blockhash = self.solana_client.latest_blockhash().await?;

        let transaction = Transaction::new_signed_with_payer(
            instructions,
            Some(&payer),
            &[self.keypair.as_ref()],
            recent_blockhash,
        );
        let signature = transaction.signatures[0];
        debug!("Signed transaction {} with blockhash {}", signature, recent_blockhash);

        match self.solana_client.send_transaction(transaction, scope).await {
            Ok(sent) => {
                info!("Transaction sent. Signature: {}, Pubkey: {}", sent, payer);
                Ok(sent)
            }
            Err(MarketError::TransientTransport(reason)) => {
                warn!("Send of {} interrupted: {}", signature, reason);
                Err(MarketError::UnknownOutcome {
                    signature: signature.to_string(),
                    reason,
                })
            }
            Err(e) => Err(e),
        }
    }
}
