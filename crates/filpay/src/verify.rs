//! The verification pipeline: a strictly ordered set of gates that
//! classifies a payment. Failures short-circuit with the first matching
//! reason; each gate may rely on the guarantees of the gates before it.
//!
//! The pipeline itself takes no locks. Callers that pair it with a credit
//! reservation (the settlement engine) hold the wallet lock across the call
//! so the risk gate's snapshot stays valid through `reserve_credit`.

use std::sync::Arc;

use alloy::primitives::Address;
use chrono::Utc;

use crate::chain::ChainRpc;
use crate::constants::SETTLEMENT_BUDGET_SECS;
use crate::payment::reason;
use crate::risk::RiskEngine;
use crate::{eip712, ChainConfig, FacilitatorError, PaymentData, PaymentRequirements, VerifyResponse};

/// Gate severity scores for non-risk failures. Risk gate scores (80/70/60)
/// come from the risk engine.
const SCORE_MISMATCH: u32 = 30;
const SCORE_SIGNATURE: u32 = 100;
const SCORE_WINDOW: u32 = 40;
const SCORE_NONCE: u32 = 90;
const SCORE_BALANCE_UNKNOWN: u32 = 10;
const SCORE_BALANCE: u32 = 50;

pub struct VerificationPipeline {
    chain: Arc<dyn ChainRpc>,
    config: ChainConfig,
}

impl VerificationPipeline {
    pub fn new(chain: Arc<dyn ChainRpc>, config: ChainConfig) -> Self {
        Self { chain, config }
    }

    /// Run all gates against the current clock.
    pub async fn verify(
        &self,
        payment: &PaymentData,
        requirements: &PaymentRequirements,
        risk: &RiskEngine,
    ) -> Result<VerifyResponse, FacilitatorError> {
        self.verify_at(payment, requirements, risk, Utc::now().timestamp() as u64)
            .await
    }

    /// Run all gates against an explicit `now` (unix seconds).
    pub async fn verify_at(
        &self,
        payment: &PaymentData,
        requirements: &PaymentRequirements,
        risk: &RiskEngine,
        now: u64,
    ) -> Result<VerifyResponse, FacilitatorError> {
        // 1. Token match.
        if payment.token != requirements.token_address {
            return Ok(VerifyResponse::rejected(reason::TOKEN_MISMATCH, SCORE_MISMATCH));
        }

        // 2. Recipient match.
        if payment.to != requirements.pay_to {
            return Ok(VerifyResponse::rejected(
                reason::RECIPIENT_MISMATCH,
                SCORE_MISMATCH,
            ));
        }

        // 3. Amount sufficiency.
        let amount = payment.amount()?;
        if amount < requirements.required_amount()? {
            return Ok(VerifyResponse::rejected(
                reason::INSUFFICIENT_AMOUNT,
                SCORE_MISMATCH,
            ));
        }

        // 4. Signature validity. A zero payer can never match a recovered
        // address, so reject it before the ecrecover.
        if payment.from == Address::ZERO {
            return Ok(VerifyResponse::rejected(
                reason::INVALID_SIGNATURE,
                SCORE_SIGNATURE,
            ));
        }
        match eip712::is_valid_for(payment, &self.config) {
            Ok(true) => {}
            Ok(false) => {
                return Ok(VerifyResponse::rejected(
                    reason::INVALID_SIGNATURE,
                    SCORE_SIGNATURE,
                ))
            }
            Err(FacilitatorError::Signature(e)) => {
                tracing::debug!(payer = %payment.from, error = %e, "malformed signature");
                return Ok(VerifyResponse::rejected(
                    reason::INVALID_SIGNATURE,
                    SCORE_SIGNATURE,
                ));
            }
            Err(e) => return Err(e),
        }

        // 5. Window validity.
        if !eip712::within_window(payment, now) {
            return Ok(VerifyResponse::rejected(
                reason::EXPIRED_OR_NOT_YET_VALID,
                SCORE_WINDOW,
            ));
        }

        // 6. Expiry headroom for settlement.
        if eip712::expires_within(payment, now, SETTLEMENT_BUDGET_SECS) {
            return Ok(VerifyResponse::rejected(
                reason::EXPIRES_TOO_SOON,
                SCORE_WINDOW,
            ));
        }

        // 7. Nonce uniqueness, best-effort: a flaky RPC must not
        // permanently block a valid payment. The on-chain nonce map is the
        // final authority at submission time.
        match self
            .chain
            .is_authorization_used(payment.token, payment.from, payment.nonce)
            .await
        {
            Ok(true) => {
                return Ok(VerifyResponse::rejected(
                    reason::NONCE_ALREADY_USED,
                    SCORE_NONCE,
                ))
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(payer = %payment.from, error = %e, "nonce check unavailable");
            }
        }

        // 8. Balance sufficiency.
        let balance = match self.chain.balance_of(payment.token, payment.from).await {
            Ok(balance) => balance,
            Err(e) => {
                tracing::warn!(payer = %payment.from, error = %e, "balance check failed");
                return Ok(VerifyResponse::rejected(
                    reason::BALANCE_CHECK_FAILED,
                    SCORE_BALANCE_UNKNOWN,
                ));
            }
        };
        if balance < amount {
            return Ok(VerifyResponse {
                valid: false,
                risk_score: SCORE_BALANCE,
                reason: Some(reason::INSUFFICIENT_BALANCE.to_string()),
                wallet_balance: Some(balance.to_string()),
                pending_amount: None,
            });
        }

        // 9. Risk gates.
        let decision = risk.check_payment(payment)?;
        if !decision.allowed {
            return Ok(VerifyResponse::rejected(
                decision
                    .reason
                    .unwrap_or_else(|| "risk limit exceeded".to_string()),
                decision.score,
            ));
        }

        Ok(VerifyResponse {
            valid: true,
            risk_score: 0,
            reason: None,
            wallet_balance: Some(balance.to_string()),
            pending_amount: Some(risk.pending_amount(payment.from).to_string()),
        })
    }
}
