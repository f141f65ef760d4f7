//! The settlement engine: the synchronous submit path behind `POST /settle`
//! and the background worker that drives every open settlement to a
//! terminal state.
//!
//! Ordering guarantee: for a single payment id, status and FCR updates are
//! serialized (per-id entry locks in the risk engine). Between distinct ids
//! the worker interleaves freely; the only cross-payment ordering is the
//! per-wallet risk aggregation.
//!
//! The worker never raises out of its loop: every failure becomes a retry
//! transition or a log line. On shutdown the loop stops at the next tick
//! boundary and abandons any in-flight receipt poll; no local state is
//! rolled back, because the chain is the authority and resuming is safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{TxHash, U256};
use chrono::Utc;
use tokio::sync::watch;

use crate::bond::BondLedger;
use crate::chain::ChainRpc;
use crate::fcr::{ConfirmationLevel, FcrInfo, FcrMonitor};
use crate::payment::reason;
use crate::risk::RiskEngine;
use crate::settlement::{now_millis, SettlementPatch, SettlementRecord, SettlementStatus};
use crate::verify::VerificationPipeline;
use crate::{
    eip712, ChainConfig, FacilitatorError, PaymentData, PaymentRequirements, SettleResponse,
    VerifyResponse,
};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Submission attempts per settlement, including the first.
    pub max_attempts: u32,
    /// Worker tick interval.
    pub retry_delay: Duration,
    /// Inner receipt-poll timeout; must stay short of `retry_delay` so a
    /// stalled RPC cannot make ticks overlap.
    pub receipt_timeout: Duration,
    /// Reservations still unsubmitted after this long are garbage-collected
    /// (e.g. a bond-capacity rejection left the credit reserved).
    pub reservation_ttl: Duration,
    /// Terminal settlement records are evicted after this long.
    pub settlement_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            receipt_timeout: Duration::from_secs(3),
            reservation_ttl: Duration::from_secs(600),
            settlement_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

pub struct SettlementEngine {
    chain: Arc<dyn ChainRpc>,
    risk: Arc<RiskEngine>,
    bond: Option<Arc<dyn BondLedger>>,
    fcr: Option<Arc<FcrMonitor>>,
    pipeline: VerificationPipeline,
    config: EngineConfig,
    /// Suppresses overlapping worker ticks.
    ticking: AtomicBool,
}

impl SettlementEngine {
    pub fn new(
        chain: Arc<dyn ChainRpc>,
        risk: Arc<RiskEngine>,
        chain_config: ChainConfig,
        config: EngineConfig,
    ) -> Self {
        let pipeline = VerificationPipeline::new(Arc::clone(&chain), chain_config);
        Self {
            chain,
            risk,
            bond: None,
            fcr: None,
            pipeline,
            config,
            ticking: AtomicBool::new(false),
        }
    }

    /// Enable bond collateral commitments.
    pub fn with_bond(mut self, bond: Arc<dyn BondLedger>) -> Self {
        self.bond = Some(bond);
        self
    }

    /// Enable fast-confirmation tracking.
    pub fn with_fcr(mut self, fcr: Arc<FcrMonitor>) -> Self {
        self.fcr = Some(fcr);
        self
    }

    pub fn risk(&self) -> &RiskEngine {
        &self.risk
    }

    pub fn bond(&self) -> Option<&Arc<dyn BondLedger>> {
        self.bond.as_ref()
    }

    /// Run the verification pipeline under the wallet lock, so the risk
    /// gate reads a stable snapshot.
    pub async fn verify(
        &self,
        payment: &PaymentData,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, FacilitatorError> {
        let lock = self.risk.wallet_lock(payment.from)?;
        let _guard = lock.lock().await;
        self.pipeline.verify(payment, requirements, &self.risk).await
    }

    /// The submit path: verify, reserve credit, commit bond, submit the
    /// transfer, and record the initial confirmation state.
    pub async fn settle(
        &self,
        payment: &PaymentData,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, FacilitatorError> {
        let id = eip712::payment_id(payment)?;

        // Fast path for resubmissions of a known authorization.
        if let Some(existing) = self.risk.settlement(id) {
            return Ok(Self::already_submitted(&existing));
        }

        let amount = payment.amount()?;

        {
            let lock = self.risk.wallet_lock(payment.from)?;
            let _guard = lock.lock().await;

            // A concurrent settle may have won the race for this id while
            // we waited on the lock.
            if let Some(existing) = self.risk.settlement(id) {
                return Ok(Self::already_submitted(&existing));
            }

            let verdict = self
                .pipeline
                .verify(payment, requirements, &self.risk)
                .await?;
            if !verdict.valid {
                return Ok(SettleResponse::failure(
                    id,
                    verdict
                        .reason
                        .unwrap_or_else(|| reason::INTERNAL_ERROR.to_string()),
                ));
            }

            self.risk
                .reserve_credit(id, payment, requirements, self.config.max_attempts)?;
        }

        if let Some(bond) = &self.bond {
            match bond.has_capacity(amount).await {
                Ok(true) => {}
                Ok(false) => {
                    // Credit stays reserved; the worker's garbage collector
                    // releases the stale reservation.
                    tracing::warn!(payment_id = %id, amount = %amount, "insufficient bond capacity");
                    return Ok(SettleResponse::failure(
                        id,
                        reason::INSUFFICIENT_BOND_CAPACITY,
                    ));
                }
                Err(e) => {
                    tracing::error!(payment_id = %id, error = %e, "bond capacity check failed");
                    return Ok(SettleResponse::failure(
                        id,
                        format!("{}: {e}", reason::BOND_COMMIT_FAILED),
                    ));
                }
            }

            if let Err(e) = bond.commit_payment(id, requirements.pay_to, amount).await {
                tracing::error!(payment_id = %id, error = %e, "bond commit failed");
                self.risk.update_settlement(
                    id,
                    SettlementPatch {
                        last_error: Some(format!("bond commit failed: {e}")),
                        ..Default::default()
                    },
                );
                return Ok(SettleResponse::failure(
                    id,
                    format!("{}: {e}", reason::BOND_COMMIT_FAILED),
                ));
            }
        }

        match self.chain.submit_transfer(payment).await {
            Ok(handle) => {
                let mut patch = SettlementPatch {
                    status: Some(SettlementStatus::Submitted),
                    transaction_handle: Some(format!("{handle}")),
                    attempts: Some(1),
                    ..Default::default()
                };
                self.initial_fcr_fields(&mut patch).await;
                self.risk.update_settlement(id, patch);

                tracing::info!(
                    payment_id = %id,
                    payer = %payment.from,
                    amount = %amount,
                    tx = %handle,
                    "payment submitted"
                );

                let fcr = self.risk.settlement(id).map(|r| FcrInfo::from_record(&r));
                Ok(SettleResponse {
                    success: true,
                    payment_id: id,
                    transaction_handle: Some(format!("{handle}")),
                    error: None,
                    fcr,
                })
            }
            Err(e) => {
                tracing::warn!(payment_id = %id, error = %e, "submission failed; queued for retry");
                self.risk.update_settlement(
                    id,
                    SettlementPatch {
                        status: Some(SettlementStatus::Retry),
                        attempts: Some(1),
                        last_error: Some(e.to_string()),
                        ..Default::default()
                    },
                );
                Ok(SettleResponse::failure(
                    id,
                    format!("{}: {e}", reason::SUBMISSION_FAILED),
                ))
            }
        }
    }

    fn already_submitted(existing: &SettlementRecord) -> SettleResponse {
        SettleResponse {
            success: false,
            payment_id: existing.payment_id,
            transaction_handle: existing.transaction_handle.clone(),
            error: Some(reason::PAYMENT_ALREADY_SUBMITTED.to_string()),
            fcr: Some(FcrInfo::from_record(existing)),
        }
    }

    /// Best-effort initial tipset height and confirmation level. A missing
    /// height is non-fatal: the record stays L0 until the worker learns the
    /// inclusion height from the receipt.
    async fn initial_fcr_fields(&self, patch: &mut SettlementPatch) {
        let Some(fcr) = &self.fcr else { return };
        if !fcr.config().enabled {
            return;
        }
        match self.chain.current_height().await {
            Ok(height) => {
                let status = fcr.evaluate(height);
                patch.tipset_height = Some(height);
                patch.confirmation_level = Some(status.level);
                patch.f3_instance = Some(status.instance);
                patch.f3_round = status.round;
                patch.f3_phase = status.phase;
            }
            Err(e) => {
                tracing::debug!(error = %e, "height read failed; confirmation starts at L0");
            }
        }
    }

    /// Spawn the background worker. It stops at the next tick after
    /// `shutdown` flips.
    pub fn spawn_worker(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config.retry_delay);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => engine.tick().await,
                    _ = shutdown.changed() => {
                        tracing::info!("settlement worker stopping");
                        return;
                    }
                }
            }
        });
    }

    /// One worker tick: drive every open settlement, advance confirmation
    /// levels, and collect garbage. Not reentrant.
    pub async fn tick(&self) {
        if self.ticking.swap(true, Ordering::SeqCst) {
            tracing::debug!("previous settlement tick still running; skipping");
            return;
        }

        for record in self.risk.open_settlements() {
            self.process_settlement(record).await;
        }

        self.update_confirmations();
        self.collect_garbage().await;

        self.ticking.store(false, Ordering::SeqCst);
    }

    async fn process_settlement(&self, record: SettlementRecord) {
        let id = record.payment_id;
        match record.status {
            SettlementStatus::Pending => {
                // Reserved but never submitted: a bond rejection or a crash
                // between reserve and submit. Reaped by the GC below.
            }
            SettlementStatus::Submitted => {
                let Some(handle) = record
                    .transaction_handle
                    .as_deref()
                    .and_then(|h| h.parse::<TxHash>().ok())
                else {
                    tracing::error!(payment_id = %id, "submitted settlement lacks a handle");
                    self.risk.update_settlement(
                        id,
                        SettlementPatch {
                            status: Some(SettlementStatus::Retry),
                            last_error: Some("missing transaction handle".to_string()),
                            ..Default::default()
                        },
                    );
                    return;
                };

                match self
                    .chain
                    .wait_for_receipt(handle, self.config.receipt_timeout)
                    .await
                {
                    Ok(Some(receipt)) if receipt.success => {
                        if record.tipset_height.is_none() {
                            if let Some(height) = receipt.block_number {
                                self.risk.update_settlement(
                                    id,
                                    SettlementPatch {
                                        tipset_height: Some(height),
                                        ..Default::default()
                                    },
                                );
                            }
                        }
                        if let Some(bond) = &self.bond {
                            // Best-effort: a failed release leaves the
                            // commitment claimable on-chain, which only
                            // costs the facilitator, never the provider.
                            if let Err(e) = bond.release_payment(id).await {
                                tracing::warn!(payment_id = %id, error = %e, "bond release failed");
                            }
                        }
                        if let Err(e) = self.risk.release_credit(id, true).await {
                            tracing::error!(payment_id = %id, error = %e, "credit release failed");
                        } else {
                            tracing::info!(payment_id = %id, tx = %handle, "settlement confirmed");
                        }
                    }
                    Ok(Some(_)) => {
                        tracing::warn!(payment_id = %id, tx = %handle, "transaction reverted");
                        self.risk.update_settlement(
                            id,
                            SettlementPatch {
                                status: Some(SettlementStatus::Retry),
                                last_error: Some("transaction_reverted".to_string()),
                                ..Default::default()
                            },
                        );
                    }
                    Ok(None) => {
                        // Not mined yet; check again next tick.
                    }
                    Err(e) => {
                        tracing::debug!(payment_id = %id, error = %e, "receipt poll failed");
                    }
                }
            }
            SettlementStatus::Retry => {
                if record.attempts >= record.max_attempts {
                    tracing::warn!(
                        payment_id = %id,
                        attempts = record.attempts,
                        "attempts exhausted; failing settlement"
                    );
                    self.risk.update_settlement(
                        id,
                        SettlementPatch {
                            last_error: Some("max attempts exhausted".to_string()),
                            ..Default::default()
                        },
                    );
                    if let Err(e) = self.risk.release_credit(id, false).await {
                        tracing::error!(payment_id = %id, error = %e, "credit release failed");
                    }
                    return;
                }

                let now = Utc::now().timestamp() as u64;
                if now >= record.payment.valid_before {
                    tracing::warn!(payment_id = %id, "authorization expired; failing settlement");
                    self.risk.update_settlement(
                        id,
                        SettlementPatch {
                            last_error: Some("authorization expired".to_string()),
                            ..Default::default()
                        },
                    );
                    if let Err(e) = self.risk.release_credit(id, false).await {
                        tracing::error!(payment_id = %id, error = %e, "credit release failed");
                    }
                    return;
                }

                // Resubmit the original authorization unchanged. Its nonce
                // is fixed, so a replay after a reorg is rejected by the
                // on-chain nonce map rather than double-spending.
                match self.chain.submit_transfer(&record.payment).await {
                    Ok(handle) => {
                        tracing::info!(
                            payment_id = %id,
                            attempt = record.attempts + 1,
                            tx = %handle,
                            "resubmitted"
                        );
                        self.risk.update_settlement(
                            id,
                            SettlementPatch {
                                status: Some(SettlementStatus::Submitted),
                                transaction_handle: Some(format!("{handle}")),
                                attempts: Some(record.attempts + 1),
                                ..Default::default()
                            },
                        );
                    }
                    Err(e) => {
                        tracing::warn!(payment_id = %id, error = %e, "resubmission failed");
                        self.risk.update_settlement(
                            id,
                            SettlementPatch {
                                attempts: Some(record.attempts + 1),
                                last_error: Some(e.to_string()),
                                ..Default::default()
                            },
                        );
                    }
                }
            }
            SettlementStatus::Confirmed | SettlementStatus::Failed => {}
        }
    }

    /// Advance confirmation levels. Strictly monotone per record: a lower
    /// evaluation (e.g. after a round bump) never regresses a stored level.
    fn update_confirmations(&self) {
        let Some(fcr) = &self.fcr else { return };
        if !fcr.config().enabled {
            return;
        }

        for record in self.risk.fcr_trackable() {
            let Some(height) = record.tipset_height else {
                continue;
            };
            let status = fcr.evaluate(height);
            if status.level > record.confirmation_level {
                let confirmed_at = (status.level == ConfirmationLevel::L3).then(now_millis);
                self.risk.update_settlement(
                    record.payment_id,
                    SettlementPatch {
                        confirmation_level: Some(status.level),
                        f3_instance: Some(status.instance),
                        f3_round: status.round,
                        f3_phase: status.phase,
                        confirmed_at,
                        ..Default::default()
                    },
                );
                tracing::debug!(
                    payment_id = %record.payment_id,
                    from = record.confirmation_level.as_str(),
                    to = status.level.as_str(),
                    "confirmation level advanced"
                );
            }
        }
    }

    async fn collect_garbage(&self) {
        let reservation_ttl = self.config.reservation_ttl.as_millis() as i64;
        let cutoff = now_millis() - reservation_ttl;
        for record in self.risk.open_settlements() {
            if record.status == SettlementStatus::Pending && record.created_at < cutoff {
                tracing::warn!(
                    payment_id = %record.payment_id,
                    "releasing stale reservation that never reached submission"
                );
                self.risk.update_settlement(
                    record.payment_id,
                    SettlementPatch {
                        last_error: Some("reservation expired before submission".to_string()),
                        ..Default::default()
                    },
                );
                if let Err(e) = self.risk.release_credit(record.payment_id, false).await {
                    tracing::error!(payment_id = %record.payment_id, error = %e, "credit release failed");
                }
            }
        }

        let evicted = self
            .risk
            .evict_terminal(self.config.settlement_ttl.as_millis() as i64);
        if evicted > 0 {
            tracing::debug!(evicted, "evicted terminal settlements");
        }
        self.risk.cleanup_idle_locks();
    }

    /// Exposure summary used by the health endpoint: (pending count, total
    /// pending amount, distinct pending wallets).
    pub fn pending_summary(&self) -> (usize, U256, usize) {
        self.risk.pending_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::f3::Phase;
    use crate::fcr::{FcrConfig, FcrMonitor};
    use crate::risk::RiskLimits;
    use crate::testutil::{signed_payment, MockBond, MockChain, ScriptedF3};
    use alloy::primitives::U256;
    use alloy::signers::local::PrivateKeySigner;

    fn units(usd: u64) -> U256 {
        ChainConfig::default().usd_to_units(usd)
    }

    fn risk() -> Arc<RiskEngine> {
        Arc::new(RiskEngine::new(RiskLimits::from_usd(
            &ChainConfig::default(),
            100,
            200,
            10_000,
        )))
    }

    fn engine_over(chain: &Arc<MockChain>) -> SettlementEngine {
        SettlementEngine::new(
            Arc::clone(chain) as Arc<dyn ChainRpc>,
            risk(),
            ChainConfig::default(),
            EngineConfig::default(),
        )
    }

    // Payments carry a one-hour window around the real clock, so the
    // engine's own `Utc::now()` reads stay inside it.
    fn wall_now() -> u64 {
        Utc::now().timestamp() as u64
    }

    #[tokio::test]
    async fn settle_happy_path_submits_and_reserves() {
        let signer = PrivateKeySigner::random();
        let (payment, requirements) = signed_payment(&signer, units(1), wall_now());
        let chain = Arc::new(
            MockChain::new()
                .with_balance(payment.from, units(5))
                .with_height(900),
        );

        let engine = engine_over(&chain);
        let response = engine.settle(&payment, &requirements).await.unwrap();

        assert!(response.success, "error: {:?}", response.error);
        assert!(response.transaction_handle.is_some());

        let record = engine.risk().settlement(response.payment_id).unwrap();
        assert_eq!(record.status, SettlementStatus::Submitted);
        assert_eq!(record.attempts, 1);
        assert_eq!(engine.risk().pending_amount(payment.from), units(1));
    }

    #[tokio::test]
    async fn duplicate_settle_returns_same_id_and_handle() {
        let signer = PrivateKeySigner::random();
        let (payment, requirements) = signed_payment(&signer, units(1), wall_now());
        let chain = Arc::new(MockChain::new().with_balance(payment.from, units(5)));

        let engine = engine_over(&chain);
        let first = engine.settle(&payment, &requirements).await.unwrap();
        assert!(first.success);

        let second = engine.settle(&payment, &requirements).await.unwrap();
        assert!(!second.success);
        assert_eq!(
            second.error.as_deref(),
            Some(reason::PAYMENT_ALREADY_SUBMITTED)
        );
        assert_eq!(second.payment_id, first.payment_id);
        assert_eq!(second.transaction_handle, first.transaction_handle);

        // Credit was reserved exactly once.
        assert_eq!(engine.risk().pending_amount(payment.from), units(1));
    }

    #[tokio::test]
    async fn invalid_payment_reserves_nothing() {
        let signer = PrivateKeySigner::random();
        let (payment, requirements) = signed_payment(&signer, units(1), wall_now());
        // Balance below the payment value.
        let chain = Arc::new(MockChain::new().with_balance(payment.from, U256::from(1u64)));

        let engine = engine_over(&chain);
        let response = engine.settle(&payment, &requirements).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some(reason::INSUFFICIENT_BALANCE));
        assert_eq!(engine.risk().pending_amount(payment.from), U256::ZERO);
        assert!(engine.risk().settlement(response.payment_id).is_none());
    }

    #[tokio::test]
    async fn bond_capacity_rejection_leaves_reservation_for_gc() {
        let signer = PrivateKeySigner::random();
        let (payment, requirements) = signed_payment(&signer, units(10), wall_now());
        let chain = Arc::new(MockChain::new().with_balance(payment.from, units(50)));
        let bond = Arc::new(MockBond::with_available(units(1)));

        let engine = SettlementEngine::new(
            Arc::clone(&chain) as Arc<dyn ChainRpc>,
            risk(),
            ChainConfig::default(),
            EngineConfig {
                reservation_ttl: Duration::from_millis(0),
                ..EngineConfig::default()
            },
        )
        .with_bond(Arc::clone(&bond) as Arc<dyn BondLedger>);

        let response = engine.settle(&payment, &requirements).await.unwrap();
        assert_eq!(
            response.error.as_deref(),
            Some(reason::INSUFFICIENT_BOND_CAPACITY)
        );
        // Credit is still reserved until the GC runs.
        assert_eq!(engine.risk().pending_amount(payment.from), units(10));

        engine.tick().await;
        assert_eq!(engine.risk().pending_amount(payment.from), U256::ZERO);
        let record = engine.risk().settlement(response.payment_id).unwrap();
        assert_eq!(record.status, SettlementStatus::Failed);
    }

    #[tokio::test]
    async fn bond_commit_and_release_bracket_settlement() {
        let signer = PrivateKeySigner::random();
        let (payment, requirements) = signed_payment(&signer, units(5), wall_now());
        let chain = Arc::new(MockChain::new().with_balance(payment.from, units(50)));
        let bond = Arc::new(MockBond::with_available(units(100)));

        let engine = SettlementEngine::new(
            Arc::clone(&chain) as Arc<dyn ChainRpc>,
            risk(),
            ChainConfig::default(),
            EngineConfig::default(),
        )
        .with_bond(Arc::clone(&bond) as Arc<dyn BondLedger>);

        let response = engine.settle(&payment, &requirements).await.unwrap();
        assert!(response.success);
        assert!(bond.is_committed(response.payment_id));
        assert_eq!(bond.available(), units(95));

        // Receipt arrives: the worker releases bond and credit.
        chain.set_default_receipt(true, Some(901));
        engine.tick().await;

        assert!(bond.is_released(response.payment_id));
        assert_eq!(bond.available(), units(100));
        let record = engine.risk().settlement(response.payment_id).unwrap();
        assert_eq!(record.status, SettlementStatus::Confirmed);
        // The receipt's inclusion height backfills the missing tipset
        // height.
        assert_eq!(record.tipset_height, Some(901));
        assert_eq!(engine.risk().pending_amount(payment.from), U256::ZERO);
        // Confirmed value lands in the daily bucket.
        assert_eq!(
            engine
                .risk()
                .daily_used(payment.from, Utc::now().date_naive()),
            units(5)
        );
    }

    #[tokio::test]
    async fn reverted_transaction_retries_then_fails() {
        let signer = PrivateKeySigner::random();
        let (payment, requirements) = signed_payment(&signer, units(1), wall_now());
        let chain = Arc::new(MockChain::new().with_balance(payment.from, units(5)));

        let engine = engine_over(&chain);
        let response = engine.settle(&payment, &requirements).await.unwrap();
        assert!(response.success);

        // Every receipt reports a revert.
        chain.set_default_receipt(false, None);

        engine.tick().await; // Submitted -> Retry
        let record = engine.risk().settlement(response.payment_id).unwrap();
        assert_eq!(record.status, SettlementStatus::Retry);
        assert_eq!(record.last_error.as_deref(), Some("transaction_reverted"));

        engine.tick().await; // Retry -> Submitted, attempts 2
        let record = engine.risk().settlement(response.payment_id).unwrap();
        assert_eq!(record.status, SettlementStatus::Submitted);
        assert_eq!(record.attempts, 2);

        engine.tick().await; // revert -> Retry
        engine.tick().await; // -> Submitted, attempts 3
        engine.tick().await; // revert -> Retry
        engine.tick().await; // attempts >= max: Failed

        let record = engine.risk().settlement(response.payment_id).unwrap();
        assert_eq!(record.status, SettlementStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert_eq!(engine.risk().pending_amount(payment.from), U256::ZERO);
        assert_eq!(
            engine
                .risk()
                .daily_used(payment.from, Utc::now().date_naive()),
            U256::ZERO
        );
    }

    #[tokio::test]
    async fn submission_failure_is_retried_by_the_worker() {
        let signer = PrivateKeySigner::random();
        let (payment, requirements) = signed_payment(&signer, units(1), wall_now());
        let chain = Arc::new(
            MockChain::new()
                .with_balance(payment.from, units(5))
                .with_submit_failures(1),
        );

        let engine = engine_over(&chain);
        let response = engine.settle(&payment, &requirements).await.unwrap();
        assert!(!response.success);
        assert!(response
            .error
            .as_deref()
            .unwrap()
            .starts_with(reason::SUBMISSION_FAILED));

        let record = engine.risk().settlement(response.payment_id).unwrap();
        assert_eq!(record.status, SettlementStatus::Retry);
        assert_eq!(record.attempts, 1);

        // Next tick resubmits successfully.
        engine.tick().await;
        let record = engine.risk().settlement(response.payment_id).unwrap();
        assert_eq!(record.status, SettlementStatus::Submitted);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn confirmation_levels_advance_monotonically() {
        let signer = PrivateKeySigner::random();
        let (payment, requirements) = signed_payment(&signer, units(1), wall_now());
        let chain = Arc::new(
            MockChain::new()
                .with_balance(payment.from, units(5))
                .with_height(900),
        );

        // Active instance in QUALITY: initial level L1.
        let f3 = Arc::new(ScriptedF3::stable(10, 0, Phase::Quality));
        let monitor = Arc::new(FcrMonitor::new(
            Arc::clone(&f3) as Arc<dyn crate::f3::F3Client>,
            FcrConfig::default(),
        ));
        monitor.poll_once().await;

        let engine = SettlementEngine::new(
            Arc::clone(&chain) as Arc<dyn ChainRpc>,
            risk(),
            ChainConfig::default(),
            EngineConfig::default(),
        )
        .with_fcr(Arc::clone(&monitor));

        let response = engine.settle(&payment, &requirements).await.unwrap();
        let record = engine.risk().settlement(response.payment_id).unwrap();
        assert_eq!(record.confirmation_level, ConfirmationLevel::L1);
        assert_eq!(record.tipset_height, Some(900));

        // COMMIT: the worker advances to L2.
        f3.set_progress(10, 0, Phase::Commit);
        monitor.poll_once().await;
        engine.tick().await;
        let record = engine.risk().settlement(response.payment_id).unwrap();
        assert_eq!(record.confirmation_level, ConfirmationLevel::L2);
        assert!(record.confirmed_at.is_none());

        // A round bump demotes the chain level, but the record never
        // regresses.
        f3.set_progress(10, 1, Phase::Prepare);
        monitor.poll_once().await;
        engine.tick().await;
        let record = engine.risk().settlement(response.payment_id).unwrap();
        assert_eq!(record.confirmation_level, ConfirmationLevel::L2);

        // Receipt confirms the settlement; it stays trackable for L3.
        chain.set_default_receipt(true, None);
        engine.tick().await;
        let record = engine.risk().settlement(response.payment_id).unwrap();
        assert_eq!(record.status, SettlementStatus::Confirmed);
        assert_eq!(record.confirmation_level, ConfirmationLevel::L2);

        // A certificate covering the height finalizes it.
        f3.set_certificate(10, 950);
        f3.set_progress(11, 0, Phase::Quality);
        monitor.poll_once().await;
        engine.tick().await;
        let record = engine.risk().settlement(response.payment_id).unwrap();
        assert_eq!(record.confirmation_level, ConfirmationLevel::L3);
        assert!(record.confirmed_at.is_some());
    }

    #[tokio::test]
    async fn failed_settlement_leaves_bond_claimable_exactly_once() {
        let signer = PrivateKeySigner::random();
        let (payment, requirements) = signed_payment(&signer, units(5), wall_now());
        let chain = Arc::new(
            MockChain::new()
                .with_balance(payment.from, units(50))
                .with_submit_failures(100),
        );
        let bond = Arc::new(MockBond::with_available(units(100)));

        let engine = SettlementEngine::new(
            Arc::clone(&chain) as Arc<dyn ChainRpc>,
            risk(),
            ChainConfig::default(),
            EngineConfig::default(),
        )
        .with_bond(Arc::clone(&bond) as Arc<dyn BondLedger>);

        let response = engine.settle(&payment, &requirements).await.unwrap();
        assert!(!response.success);
        assert!(bond.is_committed(response.payment_id));

        // Exhaust the remaining attempts.
        engine.tick().await; // attempts 2
        engine.tick().await; // attempts 3
        engine.tick().await; // exhausted -> Failed
        let record = engine.risk().settlement(response.payment_id).unwrap();
        assert_eq!(record.status, SettlementStatus::Failed);

        // The commitment stays locked for the provider, who claims once.
        assert!(!bond.is_released(response.payment_id));
        bond.claim_payment(response.payment_id).await.unwrap();
        assert!(bond.is_claimed(response.payment_id));

        // At most one resolution per id.
        assert!(bond.release_payment(response.payment_id).await.is_err());
        assert!(bond.claim_payment(response.payment_id).await.is_err());
        assert_eq!(bond.get_exposure().await.unwrap(), U256::ZERO);
    }

    #[tokio::test]
    async fn expired_authorization_fails_in_retry() {
        let signer = PrivateKeySigner::random();
        let (payment, requirements) = signed_payment(&signer, units(1), wall_now());
        let chain = Arc::new(
            MockChain::new()
                .with_balance(payment.from, units(5))
                .with_submit_failures(100),
        );

        let engine = engine_over(&chain);
        let response = engine.settle(&payment, &requirements).await.unwrap();
        assert!(!response.success);

        // Hand the worker a retry snapshot whose authorization has already
        // expired: it must fail the settlement rather than resubmit.
        let mut snapshot = engine.risk().settlement(response.payment_id).unwrap();
        snapshot.payment.valid_before = 1;
        engine.process_settlement(snapshot).await;

        let record = engine.risk().settlement(response.payment_id).unwrap();
        assert_eq!(record.status, SettlementStatus::Failed);
        assert_eq!(record.last_error.as_deref(), Some("authorization expired"));
        assert_eq!(engine.risk().pending_amount(payment.from), U256::ZERO);
    }
}
