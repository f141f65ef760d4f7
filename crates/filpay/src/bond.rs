//! Adapter over the on-chain payment bond contract.
//!
//! The safety contract lives on-chain: at most one resolution per payment id
//! (released by the facilitator or claimed by the provider after the
//! deadline), deadline monotonicity, and ledger conservation. This adapter
//! only translates. `commit_payment` is not safe to retry blindly (the
//! contract's id-uniqueness guard rejects the replay), while release and
//! claim fail idempotently.

use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use alloy::providers::Provider;
use async_trait::async_trait;

use crate::{FacilitatorError, PaymentBond};

/// Timeout on bond transaction receipt confirmation. The settle path waits
/// on the commit synchronously, so this bounds request latency.
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Capability set the core consumes from the bond contract. One production
/// implementation ([`OnchainBondLedger`]); tests substitute doubles.
#[async_trait]
pub trait BondLedger: Send + Sync {
    /// Commit `amount` of bond collateral to `payment_id` for `provider`.
    /// The contract reverts on a duplicate id or insufficient free bond and
    /// sets a 10-minute claim deadline.
    async fn commit_payment(
        &self,
        payment_id: B256,
        provider: Address,
        amount: U256,
    ) -> Result<(), FacilitatorError>;

    /// Release the commitment after successful settlement. Fails (rather
    /// than double-spends) on a second call.
    async fn release_payment(&self, payment_id: B256) -> Result<(), FacilitatorError>;

    /// Provider-side claim after the deadline. Exposed for completeness;
    /// the facilitator itself never claims.
    async fn claim_payment(&self, payment_id: B256) -> Result<(), FacilitatorError>;

    /// Total currently committed collateral.
    async fn get_exposure(&self) -> Result<U256, FacilitatorError>;

    /// Bond balance minus committed collateral.
    async fn get_available_bond(&self) -> Result<U256, FacilitatorError>;

    async fn has_capacity(&self, amount: U256) -> Result<bool, FacilitatorError> {
        Ok(self.get_available_bond().await? >= amount)
    }
}

/// Production adapter over the `PaymentBond` contract.
pub struct OnchainBondLedger<P> {
    provider: P,
    contract_address: Address,
    facilitator_address: Address,
}

impl<P> OnchainBondLedger<P> {
    pub fn new(provider: P, contract_address: Address, facilitator_address: Address) -> Self {
        Self {
            provider,
            contract_address,
            facilitator_address,
        }
    }
}

#[async_trait]
impl<P> BondLedger for OnchainBondLedger<P>
where
    P: Provider + Send + Sync,
{
    async fn commit_payment(
        &self,
        payment_id: B256,
        provider: Address,
        amount: U256,
    ) -> Result<(), FacilitatorError> {
        let contract = PaymentBond::new(self.contract_address, &self.provider);
        let pending = contract
            .commitPayment(payment_id, provider, amount)
            .send()
            .await
            .map_err(|e| FacilitatorError::Bond(format!("commitPayment send failed: {e}")))?;

        let receipt = tokio::time::timeout(RECEIPT_TIMEOUT, pending.get_receipt())
            .await
            .map_err(|_| FacilitatorError::Bond("commitPayment receipt timed out".to_string()))?
            .map_err(|e| FacilitatorError::Bond(format!("commitPayment receipt failed: {e}")))?;

        if !receipt.status() {
            return Err(FacilitatorError::Bond("commitPayment reverted".to_string()));
        }
        Ok(())
    }

    async fn release_payment(&self, payment_id: B256) -> Result<(), FacilitatorError> {
        let contract = PaymentBond::new(self.contract_address, &self.provider);
        let pending = contract
            .releasePayment(payment_id)
            .send()
            .await
            .map_err(|e| FacilitatorError::Bond(format!("releasePayment send failed: {e}")))?;

        let receipt = tokio::time::timeout(RECEIPT_TIMEOUT, pending.get_receipt())
            .await
            .map_err(|_| FacilitatorError::Bond("releasePayment receipt timed out".to_string()))?
            .map_err(|e| FacilitatorError::Bond(format!("releasePayment receipt failed: {e}")))?;

        if !receipt.status() {
            return Err(FacilitatorError::Bond("releasePayment reverted".to_string()));
        }
        Ok(())
    }

    async fn claim_payment(&self, payment_id: B256) -> Result<(), FacilitatorError> {
        let contract = PaymentBond::new(self.contract_address, &self.provider);
        let pending = contract
            .claimPayment(payment_id)
            .send()
            .await
            .map_err(|e| FacilitatorError::Bond(format!("claimPayment send failed: {e}")))?;

        let receipt = tokio::time::timeout(RECEIPT_TIMEOUT, pending.get_receipt())
            .await
            .map_err(|_| FacilitatorError::Bond("claimPayment receipt timed out".to_string()))?
            .map_err(|e| FacilitatorError::Bond(format!("claimPayment receipt failed: {e}")))?;

        if !receipt.status() {
            return Err(FacilitatorError::Bond("claimPayment reverted".to_string()));
        }
        Ok(())
    }

    async fn get_exposure(&self) -> Result<U256, FacilitatorError> {
        let contract = PaymentBond::new(self.contract_address, &self.provider);
        contract
            .totalCommitted(self.facilitator_address)
            .call()
            .await
            .map_err(|e| FacilitatorError::Bond(format!("totalCommitted failed: {e}")))
    }

    async fn get_available_bond(&self) -> Result<U256, FacilitatorError> {
        let contract = PaymentBond::new(self.contract_address, &self.provider);
        let balance = contract
            .bondBalance(self.facilitator_address)
            .call()
            .await
            .map_err(|e| FacilitatorError::Bond(format!("bondBalance failed: {e}")))?;
        let committed = contract
            .totalCommitted(self.facilitator_address)
            .call()
            .await
            .map_err(|e| FacilitatorError::Bond(format!("totalCommitted failed: {e}")))?;
        Ok(balance.saturating_sub(committed))
    }
}
