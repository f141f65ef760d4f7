//! Per-wallet risk state: pending credit, daily usage, and history tiers.
//!
//! Concurrency contract: every transition of a wallet's pending/daily totals
//! happens under that wallet's mutex, and `check_payment` reads under the
//! same mutex held by the caller until the decision is either committed with
//! `reserve_credit` or abandoned, closing the check/reserve TOCTOU window.
//! Settlement records serialize per payment id through the map's entry locks.

use std::sync::Arc;

use alloy::primitives::{Address, B256, U256};
use chrono::{NaiveDate, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::settlement::{now_millis, SettlementPatch, SettlementRecord, SettlementStatus};
use crate::store::KvStore;
use crate::{ChainConfig, FacilitatorError, PaymentData, PaymentRequirements};

/// History-derived risk class of a wallet, bounding its daily transfer cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletTier {
    #[serde(rename = "UNKNOWN")]
    Unknown,
    #[serde(rename = "HISTORY_7D")]
    History7d,
    #[serde(rename = "HISTORY_30D")]
    History30d,
    #[serde(rename = "VERIFIED")]
    Verified,
}

impl WalletTier {
    /// Tier from wallet age. `Verified` is never age-derived; it requires a
    /// manual override.
    pub fn from_age_millis(age_ms: i64) -> Self {
        const DAY_MS: i64 = 86_400_000;
        if age_ms >= 30 * DAY_MS {
            WalletTier::History30d
        } else if age_ms >= 7 * DAY_MS {
            WalletTier::History7d
        } else {
            WalletTier::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WalletTier::Unknown => "UNKNOWN",
            WalletTier::History7d => "HISTORY_7D",
            WalletTier::History30d => "HISTORY_30D",
            WalletTier::Verified => "VERIFIED",
        }
    }
}

/// Configured absolute limits plus the tier table, all in token base units.
#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub max_per_transaction: U256,
    pub max_pending_per_wallet: U256,
    pub daily_limit_per_wallet: U256,
    tier_daily_caps: [U256; 4],
}

impl RiskLimits {
    /// Build from whole-dollar limits, converted with the token's decimals.
    /// The tier table is fixed: UNKNOWN $5, HISTORY_7D $50, HISTORY_30D $500,
    /// VERIFIED $5000.
    pub fn from_usd(
        config: &ChainConfig,
        max_per_transaction_usd: u64,
        max_pending_per_wallet_usd: u64,
        daily_limit_per_wallet_usd: u64,
    ) -> Self {
        Self {
            max_per_transaction: config.usd_to_units(max_per_transaction_usd),
            max_pending_per_wallet: config.usd_to_units(max_pending_per_wallet_usd),
            daily_limit_per_wallet: config.usd_to_units(daily_limit_per_wallet_usd),
            tier_daily_caps: [
                config.usd_to_units(5),
                config.usd_to_units(50),
                config.usd_to_units(500),
                config.usd_to_units(5000),
            ],
        }
    }

    pub fn tier_daily_cap(&self, tier: WalletTier) -> U256 {
        let idx = match tier {
            WalletTier::Unknown => 0,
            WalletTier::History7d => 1,
            WalletTier::History30d => 2,
            WalletTier::Verified => 3,
        };
        self.tier_daily_caps[idx]
    }

    /// `min(absolute daily limit, tier cap)`.
    pub fn effective_daily_cap(&self, tier: WalletTier) -> U256 {
        self.daily_limit_per_wallet.min(self.tier_daily_cap(tier))
    }
}

/// Outcome of the risk gates. The score ranks the severity of the first
/// failing gate; it is not a fraud probability.
#[derive(Debug, Clone)]
pub struct RiskDecision {
    pub allowed: bool,
    pub score: u32,
    pub reason: Option<String>,
}

impl RiskDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            score: 0,
            reason: None,
        }
    }

    fn deny(score: u32, reason: String) -> Self {
        Self {
            allowed: false,
            score,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DailyUsage {
    amount: U256,
    date: NaiveDate,
}

/// Maximum number of concurrent wallet locks to prevent memory exhaustion.
const MAX_WALLET_LOCKS: usize = 100_000;

/// The process-wide risk ledger and settlement map. Explicitly owned and
/// injected into the settlement engine and HTTP handlers; not a singleton.
pub struct RiskEngine {
    limits: RiskLimits,
    pending: DashMap<Address, U256>,
    daily: DashMap<Address, DailyUsage>,
    first_seen: DashMap<Address, i64>,
    tier_override: DashMap<Address, WalletTier>,
    settlements: DashMap<B256, SettlementRecord>,
    open_ids: DashSet<B256>,
    wallet_locks: DashMap<Address, Arc<Mutex<()>>>,
    store: Option<Arc<dyn KvStore>>,
}

impl RiskEngine {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            pending: DashMap::new(),
            daily: DashMap::new(),
            first_seen: DashMap::new(),
            tier_override: DashMap::new(),
            settlements: DashMap::new(),
            open_ids: DashSet::new(),
            wallet_locks: DashMap::new(),
            store: None,
        }
    }

    /// Attach a persistence backend; mutations write through and
    /// [`Self::load`] restores open settlements on startup.
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Get or create the wallet's mutex. Callers hold it across
    /// `check_payment` + `reserve_credit`.
    pub fn wallet_lock(&self, wallet: Address) -> Result<Arc<Mutex<()>>, FacilitatorError> {
        if self.wallet_locks.len() >= MAX_WALLET_LOCKS && !self.wallet_locks.contains_key(&wallet) {
            return Err(FacilitatorError::Chain(
                "too many concurrent wallets — try again later".to_string(),
            ));
        }
        Ok(self
            .wallet_locks
            .entry(wallet)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Drop wallet locks nobody holds. Checks both the Arc count and
    /// try_lock so a concurrent wallet_lock() clone between the check and
    /// the retain cannot strand two requests on different mutexes.
    pub fn cleanup_idle_locks(&self) -> usize {
        let before = self.wallet_locks.len();
        self.wallet_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
        before - self.wallet_locks.len()
    }

    fn addr_key(wallet: Address) -> String {
        format!("{wallet:#x}")
    }

    /// Record the first observation of a wallet; immutable afterwards.
    pub fn observe_wallet(&self, wallet: Address) {
        if !self.first_seen.contains_key(&wallet) {
            // Lazy restore before minting a fresh first-seen.
            if let Some(store) = &self.store {
                let key = format!("firstseen:{}", Self::addr_key(wallet));
                if let Ok(Some(ms)) = store.get(&key) {
                    if let Ok(ms) = ms.parse::<i64>() {
                        self.first_seen.insert(wallet, ms);
                        return;
                    }
                }
            }
            let now = now_millis();
            self.first_seen.entry(wallet).or_insert(now);
            if let Some(store) = &self.store {
                let key = format!("firstseen:{}", Self::addr_key(wallet));
                let _ = store.put(&key, &now.to_string());
            }
        }
    }

    /// Wallet tier: manual override wins, otherwise derived from age.
    pub fn tier_of(&self, wallet: Address) -> WalletTier {
        if let Some(tier) = self.tier_override.get(&wallet) {
            return *tier;
        }
        if let Some(store) = &self.store {
            let key = format!("tier:{}", Self::addr_key(wallet));
            if let Ok(Some(s)) = store.get(&key) {
                if let Ok(tier) = serde_json::from_value::<WalletTier>(serde_json::Value::String(s))
                {
                    self.tier_override.insert(wallet, tier);
                    return tier;
                }
            }
        }
        match self.first_seen.get(&wallet) {
            Some(seen) => WalletTier::from_age_millis(now_millis().saturating_sub(*seen)),
            None => WalletTier::Unknown,
        }
    }

    pub fn set_tier_override(&self, wallet: Address, tier: WalletTier) {
        self.tier_override.insert(wallet, tier);
        if let Some(store) = &self.store {
            let key = format!("tier:{}", Self::addr_key(wallet));
            let _ = store.put(&key, tier.as_str());
        }
    }

    pub fn pending_amount(&self, wallet: Address) -> U256 {
        self.pending.get(&wallet).map(|v| *v).unwrap_or(U256::ZERO)
    }

    /// Usage accumulated on `date`; a stale bucket reads as zero.
    pub fn daily_used(&self, wallet: Address, date: NaiveDate) -> U256 {
        match self.daily.get(&wallet) {
            Some(usage) if usage.date == date => usage.amount,
            _ => U256::ZERO,
        }
    }

    /// Pure read over the three ordered gates. The caller holds the wallet
    /// lock so the snapshot stays valid through a subsequent
    /// `reserve_credit`.
    pub fn check_payment(&self, payment: &PaymentData) -> Result<RiskDecision, FacilitatorError> {
        self.check_payment_on(payment, Utc::now().date_naive())
    }

    /// `check_payment` against an explicit UTC date (rollover tests).
    pub fn check_payment_on(
        &self,
        payment: &PaymentData,
        date: NaiveDate,
    ) -> Result<RiskDecision, FacilitatorError> {
        let amount = payment.amount()?;
        self.observe_wallet(payment.from);

        if amount > self.limits.max_per_transaction {
            return Ok(RiskDecision::deny(
                80,
                format!(
                    "amount {amount} exceeds max per transaction limit {}",
                    self.limits.max_per_transaction
                ),
            ));
        }

        let pending = self.pending_amount(payment.from);
        if pending + amount > self.limits.max_pending_per_wallet {
            return Ok(RiskDecision::deny(
                70,
                format!(
                    "pending {pending} plus amount {amount} exceeds per-wallet pending limit {}",
                    self.limits.max_pending_per_wallet
                ),
            ));
        }

        let tier = self.tier_of(payment.from);
        let cap = self.limits.effective_daily_cap(tier);
        let used = self.daily_used(payment.from, date);
        if used + amount > cap {
            return Ok(RiskDecision::deny(
                60,
                format!("daily limit {cap} exceeded for tier {} (used {used})", tier.as_str()),
            ));
        }

        Ok(RiskDecision::allow())
    }

    /// Insert the settlement record and reserve pending credit. Must be
    /// called under the wallet lock, after an allowing `check_payment` on
    /// the same snapshot.
    pub fn reserve_credit(
        &self,
        id: B256,
        payment: &PaymentData,
        requirements: &PaymentRequirements,
        max_attempts: u32,
    ) -> Result<(), FacilitatorError> {
        let amount = payment.amount()?;
        let record = SettlementRecord::new(id, payment.clone(), requirements.clone(), max_attempts);

        self.settlements.insert(id, record);
        self.open_ids.insert(id);
        let new_pending = {
            let mut entry = self.pending.entry(payment.from).or_insert(U256::ZERO);
            *entry += amount;
            *entry
        };

        self.persist_wallet_pending(payment.from, new_pending);
        self.persist_settlement(id);
        if let Some(store) = &self.store {
            let _ = store.sadd("settlements:pending", &format!("{id:#x}"));
        }
        Ok(())
    }

    /// Release reserved credit and move the settlement to its terminal
    /// state. Acquires the wallet lock internally.
    pub async fn release_credit(&self, id: B256, success: bool) -> Result<(), FacilitatorError> {
        self.release_credit_on(id, success, Utc::now().date_naive())
            .await
    }

    /// `release_credit` against an explicit UTC date (rollover tests).
    pub async fn release_credit_on(
        &self,
        id: B256,
        success: bool,
        date: NaiveDate,
    ) -> Result<(), FacilitatorError> {
        let (wallet, amount) = match self.settlements.get(&id) {
            Some(record) => (record.payment.from, record.payment.amount()?),
            None => {
                return Err(FacilitatorError::InvalidPayment(format!(
                    "unknown settlement {id:#x}"
                )))
            }
        };

        let lock = self.wallet_lock(wallet)?;
        let _guard = lock.lock().await;

        let new_pending = {
            let mut entry = self.pending.entry(wallet).or_insert(U256::ZERO);
            *entry = entry.saturating_sub(amount);
            *entry
        };
        self.persist_wallet_pending(wallet, new_pending);

        if success {
            let new_daily = {
                let mut entry = self.daily.entry(wallet).or_insert(DailyUsage {
                    amount: U256::ZERO,
                    date,
                });
                if entry.date != date {
                    // UTC rollover: yesterday's bucket resets.
                    entry.amount = U256::ZERO;
                    entry.date = date;
                }
                entry.amount += amount;
                *entry
            };
            if let Some(store) = &self.store {
                let key = format!("daily:{}:{}", Self::addr_key(wallet), new_daily.date);
                let _ = store.put(&key, &new_daily.amount.to_string());
            }
        }

        if let Some(mut record) = self.settlements.get_mut(&id) {
            SettlementPatch {
                status: Some(if success {
                    SettlementStatus::Confirmed
                } else {
                    SettlementStatus::Failed
                }),
                ..Default::default()
            }
            .apply(&mut record);
        }
        self.open_ids.remove(&id);

        self.persist_settlement(id);
        if let Some(store) = &self.store {
            let _ = store.srem("settlements:pending", &format!("{id:#x}"));
        }
        Ok(())
    }

    /// Shallow patch on a settlement record. Concurrent patches on the same
    /// id serialize on the map's entry lock.
    pub fn update_settlement(&self, id: B256, patch: SettlementPatch) -> bool {
        let updated = match self.settlements.get_mut(&id) {
            Some(mut record) => {
                patch.apply(&mut record);
                true
            }
            None => false,
        };
        if updated {
            self.persist_settlement(id);
        }
        updated
    }

    pub fn settlement(&self, id: B256) -> Option<SettlementRecord> {
        self.settlements.get(&id).map(|r| r.clone())
    }

    /// Snapshot of every non-terminal settlement, for the worker's tick.
    pub fn open_settlements(&self) -> Vec<SettlementRecord> {
        self.open_ids
            .iter()
            .filter_map(|id| self.settlements.get(&*id).map(|r| r.clone()))
            .collect()
    }

    /// Settlements whose confirmation level can still advance: a known
    /// tipset height, below L3, and not failed. Confirmed records stay
    /// trackable until finality so `confirmedAt` lands on the L3
    /// transition.
    pub fn fcr_trackable(&self) -> Vec<SettlementRecord> {
        self.settlements
            .iter()
            .filter(|r| {
                r.tipset_height.is_some()
                    && r.confirmation_level < crate::fcr::ConfirmationLevel::L3
                    && r.status != SettlementStatus::Failed
            })
            .map(|r| r.clone())
            .collect()
    }

    /// (count, total amount, distinct wallets) over non-terminal
    /// settlements, for the health endpoint.
    pub fn pending_stats(&self) -> (usize, U256, usize) {
        let records = self.open_settlements();
        let mut total = U256::ZERO;
        let mut wallets = std::collections::HashSet::new();
        for record in &records {
            if let Ok(amount) = record.payment.amount() {
                total += amount;
            }
            wallets.insert(record.payment.from);
        }
        (records.len(), total, wallets.len())
    }

    /// Evict terminal settlement records older than `ttl_millis`.
    pub fn evict_terminal(&self, ttl_millis: i64) -> usize {
        let cutoff = now_millis() - ttl_millis;
        let before = self.settlements.len();
        let store = self.store.clone();
        self.settlements.retain(|id, record| {
            let keep = !record.status.is_terminal() || record.updated_at >= cutoff;
            if !keep {
                if let Some(store) = &store {
                    let _ = store.delete(&format!("settlement:{id:#x}"));
                }
            }
            keep
        });
        before - self.settlements.len()
    }

    /// Restore open settlements and pending totals from the store. Pending
    /// amounts are recomputed from the restored non-terminal records rather
    /// than trusted from their persisted counters.
    pub fn load(&self) -> Result<usize, FacilitatorError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut restored = 0;
        for member in store.smembers("settlements:pending")? {
            let Some(json) = store.get(&format!("settlement:{member}"))? else {
                continue;
            };
            let record: SettlementRecord = serde_json::from_str(&json)?;
            if record.status.is_terminal() {
                let _ = store.srem("settlements:pending", &member);
                continue;
            }
            let amount = record.payment.amount()?;
            let wallet = record.payment.from;
            self.open_ids.insert(record.payment_id);
            self.settlements.insert(record.payment_id, record);
            *self.pending.entry(wallet).or_insert(U256::ZERO) += amount;
            restored += 1;
        }

        // Rewrite recomputed pending totals.
        for entry in self.pending.iter() {
            self.persist_wallet_pending(*entry.key(), *entry.value());
        }
        Ok(restored)
    }

    fn persist_wallet_pending(&self, wallet: Address, amount: U256) {
        if let Some(store) = &self.store {
            let key = format!("pending:{}", Self::addr_key(wallet));
            let _ = store.put(&key, &amount.to_string());
        }
    }

    fn persist_settlement(&self, id: B256) {
        if let Some(store) = &self.store {
            if let Some(record) = self.settlements.get(&id) {
                if let Ok(json) = serde_json::to_string(&*record) {
                    let _ = store.put(&format!("settlement:{id:#x}"), &json);
                }
            }
        }
    }
}
