use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// One outbound transfer as the GUI hands it over, before sequencing and
/// signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub to: String,
    /// Amount in the asset's smallest unit.
    pub amount: u128,
    /// `None` means the chain's native asset.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub gas_limit: u64,
    #[serde(default)]
    pub gas_price: u128,
    /// Optional prepared calldata (swaps route through a router contract).
    #[serde(default)]
    pub data: Option<String>,
}

/// Opaque signed payload plus its deterministic hash. The hash is known
/// before broadcast, which is what makes hedged submission idempotent.
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub payload: String,
    pub hash: String,
}

/// Wallet-side collaborator. Key handling and the actual signature scheme
/// live behind this seam.
#[async_trait]
pub trait Signer: Send + Sync {
    /// The sender address transactions are issued from.
    fn address(&self) -> &str;

    async fn sign_transfer(
        &self,
        request: &TransferRequest,
        nonce: u64,
    ) -> Result<SignedTx, DispatchError>;
}
