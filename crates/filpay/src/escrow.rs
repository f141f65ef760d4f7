//! Adapter over the deferred-payment escrow contract.
//!
//! Buyers deposit token balance into the escrow (with a cooldown on
//! withdrawals); sellers collect EIP-712-signed vouchers. The contract
//! enforces the monotonicity rules and pays out the aggregate delta; this
//! adapter only translates calls.

use std::time::Duration;

use alloy::primitives::{Address, TxHash, B256, U256};
use alloy::providers::Provider;
use async_trait::async_trait;
use serde::Serialize;

use crate::{DeferredPaymentEscrow, FacilitatorError, Voucher};

/// Timeout on collect receipt confirmation.
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Escrow account view: deposited balance, the slice currently thawing for
/// withdrawal, and when the thaw completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowAccount {
    pub balance: U256,
    pub thawing_amount: U256,
    pub thaw_end_time: u64,
}

/// Capability set the voucher store consumes from the escrow contract. One
/// production implementation ([`OnchainEscrow`]); tests substitute doubles.
#[async_trait]
pub trait EscrowClient: Send + Sync {
    /// Submit `collect(voucher, signature)`. The contract verifies the
    /// buyer's signature and the nonce/aggregate monotonicity, then pays
    /// the seller the delta against its last collected value.
    async fn collect(
        &self,
        voucher: &Voucher,
        signature: &[u8],
    ) -> Result<TxHash, FacilitatorError>;

    async fn get_account(&self, buyer: Address) -> Result<EscrowAccount, FacilitatorError>;

    /// Highest settled nonce for a voucher id.
    async fn get_settled_nonce(&self, id: B256) -> Result<U256, FacilitatorError>;

    /// Total collected value for a voucher id.
    async fn get_collected_value(&self, id: B256) -> Result<U256, FacilitatorError>;
}

/// Production adapter over the `DeferredPaymentEscrow` contract.
pub struct OnchainEscrow<P> {
    provider: P,
    contract_address: Address,
}

impl<P> OnchainEscrow<P> {
    pub fn new(provider: P, contract_address: Address) -> Self {
        Self {
            provider,
            contract_address,
        }
    }
}

#[async_trait]
impl<P> EscrowClient for OnchainEscrow<P>
where
    P: Provider + Send + Sync,
{
    async fn collect(
        &self,
        voucher: &Voucher,
        signature: &[u8],
    ) -> Result<TxHash, FacilitatorError> {
        let contract = DeferredPaymentEscrow::new(self.contract_address, &self.provider);
        let sol_voucher = DeferredPaymentEscrow::EscrowVoucher {
            id: voucher.id,
            buyer: voucher.buyer,
            seller: voucher.seller,
            valueAggregate: voucher.valueAggregate,
            asset: voucher.asset,
            timestamp: voucher.timestamp,
            nonce: voucher.nonce,
            escrow: voucher.escrow,
            chainId: voucher.chainId,
        };

        let pending = contract
            .collect(sol_voucher, signature.to_vec().into())
            .send()
            .await
            .map_err(|e| FacilitatorError::Escrow(format!("collect send failed: {e}")))?;

        let receipt = tokio::time::timeout(RECEIPT_TIMEOUT, pending.get_receipt())
            .await
            .map_err(|_| FacilitatorError::Escrow("collect receipt timed out".to_string()))?
            .map_err(|e| FacilitatorError::Escrow(format!("collect receipt failed: {e}")))?;

        if !receipt.status() {
            return Err(FacilitatorError::Escrow("collect reverted".to_string()));
        }
        Ok(receipt.transaction_hash)
    }

    async fn get_account(&self, buyer: Address) -> Result<EscrowAccount, FacilitatorError> {
        let contract = DeferredPaymentEscrow::new(self.contract_address, &self.provider);
        let account = contract
            .getAccount(buyer)
            .call()
            .await
            .map_err(|e| FacilitatorError::Escrow(format!("getAccount failed: {e}")))?;
        Ok(EscrowAccount {
            balance: account.balance,
            thawing_amount: account.thawingAmount,
            thaw_end_time: account.thawEndTime.try_into().unwrap_or(u64::MAX),
        })
    }

    async fn get_settled_nonce(&self, id: B256) -> Result<U256, FacilitatorError> {
        let contract = DeferredPaymentEscrow::new(self.contract_address, &self.provider);
        contract
            .settledNonce(id)
            .call()
            .await
            .map_err(|e| FacilitatorError::Escrow(format!("settledNonce failed: {e}")))
    }

    async fn get_collected_value(&self, id: B256) -> Result<U256, FacilitatorError> {
        let contract = DeferredPaymentEscrow::new(self.contract_address, &self.provider);
        contract
            .collectedValue(id)
            .call()
            .await
            .map_err(|e| FacilitatorError::Escrow(format!("collectedValue failed: {e}")))
    }
}
