//! Thin typed wrapper around the chain's EVM JSON-RPC endpoint.
//!
//! The adapter never retries: retry is settlement-engine policy. Every call
//! carries its own bounded timeout so a stalled RPC cannot wedge a worker
//! tick or a request handler.

use std::time::Duration;

use alloy::primitives::{Address, TxHash, B256, U256};
use alloy::providers::Provider;
use async_trait::async_trait;

use crate::{FacilitatorError, PaymentData, Stablecoin};

/// Timeout on transaction submission to the mempool.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout on read-only contract calls.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// The slice of a transaction receipt the settlement engine consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptInfo {
    /// Execution status: `true` success, `false` reverted.
    pub success: bool,
    /// Inclusion height, when the node reports it.
    pub block_number: Option<u64>,
}

/// Capability set the core consumes from the chain. One production
/// implementation ([`EvmChainRpc`]); tests substitute doubles.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Token balance of `owner`.
    async fn balance_of(&self, token: Address, owner: Address) -> Result<U256, FacilitatorError>;

    /// EIP-3009 authorization state for `(authorizer, nonce)`. Transport
    /// errors propagate; treating them as unused is the verifier's policy.
    async fn is_authorization_used(
        &self,
        token: Address,
        authorizer: Address,
        nonce: B256,
    ) -> Result<bool, FacilitatorError>;

    /// Submit `transferWithAuthorization` to the mempool and return the
    /// transaction hash without waiting for inclusion.
    async fn submit_transfer(&self, payment: &PaymentData) -> Result<TxHash, FacilitatorError>;

    /// Poll once for the receipt of `handle`. `Ok(None)` while the
    /// transaction is still pending.
    async fn wait_for_receipt(
        &self,
        handle: TxHash,
        timeout: Duration,
    ) -> Result<Option<ReceiptInfo>, FacilitatorError>;

    /// Latest chain height.
    async fn current_height(&self) -> Result<u64, FacilitatorError>;

    /// Current gas price.
    async fn current_gas_price(&self) -> Result<U256, FacilitatorError>;
}

/// Production adapter over an alloy [`Provider`] with a wallet filler for
/// transaction signing.
pub struct EvmChainRpc<P> {
    provider: P,
}

impl<P> EvmChainRpc<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

/// Split a 65-byte raw signature into the `(v, r, s)` triple the EIP-3009
/// entrypoint takes. `v` is normalized to Electrum notation (27/28).
fn split_signature(bytes: &[u8]) -> Result<(u8, B256, B256), FacilitatorError> {
    if bytes.len() != 65 {
        return Err(FacilitatorError::Signature(format!(
            "signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }
    let r = B256::from_slice(&bytes[0..32]);
    let s = B256::from_slice(&bytes[32..64]);
    let v = match bytes[64] {
        0 | 27 => 27,
        1 | 28 => 28,
        other => {
            return Err(FacilitatorError::Signature(format!(
                "invalid recovery byte: {other}"
            )))
        }
    };
    Ok((v, r, s))
}

#[async_trait]
impl<P> ChainRpc for EvmChainRpc<P>
where
    P: Provider + Send + Sync,
{
    async fn balance_of(&self, token: Address, owner: Address) -> Result<U256, FacilitatorError> {
        let contract = Stablecoin::new(token, &self.provider);
        let balance = tokio::time::timeout(CALL_TIMEOUT, contract.balanceOf(owner).call())
            .await
            .map_err(|_| FacilitatorError::Chain("balanceOf timed out".to_string()))?
            .map_err(|e| FacilitatorError::Chain(format!("balanceOf failed: {e}")))?;
        Ok(balance)
    }

    async fn is_authorization_used(
        &self,
        token: Address,
        authorizer: Address,
        nonce: B256,
    ) -> Result<bool, FacilitatorError> {
        let contract = Stablecoin::new(token, &self.provider);
        let used = tokio::time::timeout(
            CALL_TIMEOUT,
            contract.authorizationState(authorizer, nonce).call(),
        )
        .await
        .map_err(|_| FacilitatorError::Chain("authorizationState timed out".to_string()))?
        .map_err(|e| FacilitatorError::Chain(format!("authorizationState failed: {e}")))?;
        Ok(used)
    }

    async fn submit_transfer(&self, payment: &PaymentData) -> Result<TxHash, FacilitatorError> {
        let value = payment.amount()?;
        let (v, r, s) = split_signature(&payment.signature_bytes()?)?;

        let contract = Stablecoin::new(payment.token, &self.provider);
        let call = contract.transferWithAuthorization(
            payment.from,
            payment.to,
            value,
            U256::from(payment.valid_after),
            U256::from(payment.valid_before),
            payment.nonce,
            v,
            r,
            s,
        );

        let pending = tokio::time::timeout(SEND_TIMEOUT, call.send())
            .await
            .map_err(|_| {
                FacilitatorError::Chain("transferWithAuthorization send timed out".to_string())
            })?
            .map_err(|e| {
                FacilitatorError::Chain(format!("transferWithAuthorization send failed: {e}"))
            })?;

        Ok(*pending.tx_hash())
    }

    async fn wait_for_receipt(
        &self,
        handle: TxHash,
        timeout: Duration,
    ) -> Result<Option<ReceiptInfo>, FacilitatorError> {
        let receipt = tokio::time::timeout(timeout, self.provider.get_transaction_receipt(handle))
            .await
            .map_err(|_| FacilitatorError::Chain("receipt poll timed out".to_string()))?
            .map_err(|e| FacilitatorError::Chain(format!("receipt poll failed: {e}")))?;
        Ok(receipt.map(|r| ReceiptInfo {
            success: r.status(),
            block_number: r.block_number,
        }))
    }

    async fn current_height(&self) -> Result<u64, FacilitatorError> {
        tokio::time::timeout(CALL_TIMEOUT, self.provider.get_block_number())
            .await
            .map_err(|_| FacilitatorError::Chain("blockNumber timed out".to_string()))?
            .map_err(|e| FacilitatorError::Chain(format!("blockNumber failed: {e}")))
    }

    async fn current_gas_price(&self) -> Result<U256, FacilitatorError> {
        let price = tokio::time::timeout(CALL_TIMEOUT, self.provider.get_gas_price())
            .await
            .map_err(|_| FacilitatorError::Chain("gasPrice timed out".to_string()))?
            .map_err(|e| FacilitatorError::Chain(format!("gasPrice failed: {e}")))?;
        Ok(U256::from(price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_signature_normalizes_recovery_byte() {
        let mut raw = vec![0u8; 65];
        raw[0] = 0xaa;
        raw[63] = 0xbb;

        for (input, expected) in [(0u8, 27u8), (1, 28), (27, 27), (28, 28)] {
            raw[64] = input;
            let (v, r, s) = split_signature(&raw).unwrap();
            assert_eq!(v, expected);
            assert_eq!(r[0], 0xaa);
            assert_eq!(s[31], 0xbb);
        }

        raw[64] = 29;
        assert!(split_signature(&raw).is_err());
        assert!(split_signature(&raw[..64]).is_err());
    }
}
