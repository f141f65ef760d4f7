//! Settlement records: the per-payment state machine the engine drives.

use alloy::primitives::B256;
use serde::{Deserialize, Serialize};

use crate::f3::Phase;
use crate::fcr::ConfirmationLevel;
use crate::{PaymentData, PaymentRequirements};

/// Milliseconds since the unix epoch, UTC.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Settlement lifecycle. `Pending → Submitted → Confirmed | Failed`, with the
/// retry arc `Submitted → Retry → Submitted` while attempts remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    Submitted,
    Retry,
    Confirmed,
    Failed,
}

impl SettlementStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SettlementStatus::Confirmed | SettlementStatus::Failed)
    }
}

/// State attached to a payment id. Created by the engine right after credit
/// reservation; mutated only by the engine and its FCR updater; evicted only
/// after a TTL past the terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRecord {
    pub payment_id: B256,
    pub payment: PaymentData,
    pub requirements: PaymentRequirements,
    pub status: SettlementStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_handle: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Millis since epoch.
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    // Fast-confirmation fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tipset_height: Option<u64>,
    pub confirmation_level: ConfirmationLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub f3_instance: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub f3_round: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub f3_phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<i64>,
}

impl SettlementRecord {
    pub fn new(
        payment_id: B256,
        payment: PaymentData,
        requirements: PaymentRequirements,
        max_attempts: u32,
    ) -> Self {
        let now = now_millis();
        Self {
            payment_id,
            payment,
            requirements,
            status: SettlementStatus::Pending,
            transaction_handle: None,
            attempts: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            last_error: None,
            tipset_height: None,
            confirmation_level: ConfirmationLevel::L0,
            f3_instance: None,
            f3_round: None,
            f3_phase: None,
            confirmed_at: None,
        }
    }
}

/// Shallow field update applied under the record's own serialization.
/// `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct SettlementPatch {
    pub status: Option<SettlementStatus>,
    pub transaction_handle: Option<String>,
    pub attempts: Option<u32>,
    pub last_error: Option<String>,
    pub tipset_height: Option<u64>,
    pub confirmation_level: Option<ConfirmationLevel>,
    pub f3_instance: Option<u64>,
    pub f3_round: Option<u64>,
    pub f3_phase: Option<Phase>,
    pub confirmed_at: Option<i64>,
}

impl SettlementPatch {
    pub fn apply(self, record: &mut SettlementRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(handle) = self.transaction_handle {
            record.transaction_handle = Some(handle);
        }
        if let Some(attempts) = self.attempts {
            record.attempts = attempts;
        }
        if let Some(error) = self.last_error {
            record.last_error = Some(error);
        }
        if let Some(height) = self.tipset_height {
            record.tipset_height = Some(height);
        }
        if let Some(level) = self.confirmation_level {
            record.confirmation_level = level;
        }
        if let Some(instance) = self.f3_instance {
            record.f3_instance = Some(instance);
        }
        if let Some(round) = self.f3_round {
            record.f3_round = Some(round);
        }
        if let Some(phase) = self.f3_phase {
            record.f3_phase = Some(phase);
        }
        if let Some(at) = self.confirmed_at {
            record.confirmed_at = Some(at);
        }
        record.updated_at = now_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, FixedBytes};

    fn record() -> SettlementRecord {
        let payment = PaymentData {
            token: Address::ZERO,
            from: Address::ZERO,
            to: Address::ZERO,
            value: "1".to_string(),
            valid_after: 0,
            valid_before: u64::MAX,
            nonce: FixedBytes::ZERO,
            signature: "0x00".to_string(),
        };
        let requirements = PaymentRequirements {
            pay_to: Address::ZERO,
            max_amount_required: "1".to_string(),
            token_address: Address::ZERO,
            chain_id: 314159,
            resource: None,
            description: None,
        };
        SettlementRecord::new(B256::ZERO, payment, requirements, 3)
    }

    #[test]
    fn new_record_starts_pending_at_l0() {
        let r = record();
        assert_eq!(r.status, SettlementStatus::Pending);
        assert_eq!(r.confirmation_level, ConfirmationLevel::L0);
        assert_eq!(r.attempts, 0);
        assert!(!r.status.is_terminal());
    }

    #[test]
    fn patch_updates_only_given_fields() {
        let mut r = record();
        let before_created = r.created_at;

        SettlementPatch {
            status: Some(SettlementStatus::Submitted),
            transaction_handle: Some("0xabc".to_string()),
            attempts: Some(1),
            ..Default::default()
        }
        .apply(&mut r);

        assert_eq!(r.status, SettlementStatus::Submitted);
        assert_eq!(r.transaction_handle.as_deref(), Some("0xabc"));
        assert_eq!(r.attempts, 1);
        assert_eq!(r.created_at, before_created);
        assert!(r.last_error.is_none());
        assert!(r.updated_at >= before_created);
    }

    #[test]
    fn terminal_states() {
        assert!(SettlementStatus::Confirmed.is_terminal());
        assert!(SettlementStatus::Failed.is_terminal());
        assert!(!SettlementStatus::Retry.is_terminal());
        assert!(!SettlementStatus::Submitted.is_terminal());
    }
}
