use alloy::primitives::{Address, FixedBytes, B256, U256};
use serde::{Deserialize, Serialize};

use crate::error::FacilitatorError;

/// Stable machine-readable rejection reasons. These strings are part of the
/// HTTP contract and must not change between releases.
pub mod reason {
    pub const TOKEN_MISMATCH: &str = "token_mismatch";
    pub const RECIPIENT_MISMATCH: &str = "recipient_mismatch";
    pub const INSUFFICIENT_AMOUNT: &str = "insufficient_amount";
    pub const INVALID_SIGNATURE: &str = "invalid_signature";
    pub const EXPIRED_OR_NOT_YET_VALID: &str = "expired_or_not_yet_valid";
    pub const EXPIRES_TOO_SOON: &str = "expires_too_soon";
    pub const NONCE_ALREADY_USED: &str = "nonce_already_used";
    pub const BALANCE_CHECK_FAILED: &str = "balance_check_failed";
    pub const INSUFFICIENT_BALANCE: &str = "insufficient_balance";
    pub const PAYMENT_ALREADY_SUBMITTED: &str = "payment_already_submitted";
    pub const INSUFFICIENT_BOND_CAPACITY: &str = "insufficient_bond_capacity";
    pub const BOND_COMMIT_FAILED: &str = "bond_commit_failed";
    pub const SUBMISSION_FAILED: &str = "submission_failed";
    pub const STALE_VOUCHER: &str = "stale_voucher";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// An off-chain-signed EIP-3009 payment authorization as it arrives on the
/// wire. `value` stays a decimal string to survive 256-bit amounts in JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentData {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub value: String,
    pub valid_after: u64,
    pub valid_before: u64,
    pub nonce: FixedBytes<32>,
    /// 65-byte ECDSA signature, 0x-prefixed hex.
    pub signature: String,
}

impl PaymentData {
    /// Parse the decimal `value` field into a 256-bit amount.
    pub fn amount(&self) -> Result<U256, FacilitatorError> {
        self.value
            .parse::<U256>()
            .map_err(|e| FacilitatorError::InvalidPayment(format!("invalid value: {e}")))
    }

    /// Decode the 0x-prefixed hex signature into raw bytes.
    pub fn signature_bytes(&self) -> Result<Vec<u8>, FacilitatorError> {
        alloy::hex::decode(self.signature.strip_prefix("0x").unwrap_or(&self.signature))
            .map_err(|e| FacilitatorError::Signature(format!("invalid hex signature: {e}")))
    }
}

/// The counter-party's demand that the payment must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub pay_to: Address,
    pub max_amount_required: String,
    pub token_address: Address,
    pub chain_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PaymentRequirements {
    pub fn required_amount(&self) -> Result<U256, FacilitatorError> {
        self.max_amount_required
            .parse::<U256>()
            .map_err(|e| FacilitatorError::InvalidPayment(format!("invalid required amount: {e}")))
    }
}

/// Request body shared by `POST /verify` and `POST /settle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub payment: PaymentData,
    pub requirements: PaymentRequirements,
}

/// Response from `POST /verify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub valid: bool,
    /// Gate severity score of the first failing gate; 0 when valid. Guides
    /// edge-layer logging and rate limiting, not a fraud probability.
    pub risk_score: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_balance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_amount: Option<String>,
}

impl VerifyResponse {
    pub fn rejected(reason: impl Into<String>, score: u32) -> Self {
        Self {
            valid: false,
            risk_score: score,
            reason: Some(reason.into()),
            wallet_balance: None,
            pending_amount: None,
        }
    }
}

/// Response from `POST /settle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    pub payment_id: B256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fcr: Option<crate::fcr::FcrInfo>,
}

impl SettleResponse {
    pub fn failure(payment_id: B256, error: impl Into<String>) -> Self {
        Self {
            success: false,
            payment_id,
            transaction_handle: None,
            error: Some(error.into()),
            fcr: None,
        }
    }
}
