//! Deferred-payment voucher store.
//!
//! Buyers hand sellers off-chain vouchers whose `valueAggregate` only ever
//! grows; settlement pays the delta against the escrow's last collected
//! value. The store keeps the latest voucher per `(id, buyer, seller)` with
//! a 7-day TTL and refuses anything that would roll a nonce or an aggregate
//! backwards, checked against both local state and, best-effort, the
//! escrow contract.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::eip712::recover_voucher_signer;
use crate::escrow::EscrowClient;
use crate::settlement::now_millis;
use crate::store::KvStore;
use crate::{FacilitatorError, Voucher};

/// Stored vouchers expire after this long.
const VOUCHER_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Wire shape of a voucher as it arrives over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherData {
    pub id: B256,
    pub buyer: Address,
    pub seller: Address,
    pub value_aggregate: String,
    pub asset: Address,
    pub timestamp: u64,
    pub nonce: u64,
    pub escrow: Address,
    pub chain_id: u64,
    /// 65-byte ECDSA signature, 0x-prefixed hex.
    pub signature: String,
}

impl VoucherData {
    pub fn aggregate(&self) -> Result<U256, FacilitatorError> {
        self.value_aggregate
            .parse::<U256>()
            .map_err(|e| FacilitatorError::InvalidPayment(format!("invalid valueAggregate: {e}")))
    }

    pub fn signature_bytes(&self) -> Result<Vec<u8>, FacilitatorError> {
        alloy::hex::decode(self.signature.strip_prefix("0x").unwrap_or(&self.signature))
            .map_err(|e| FacilitatorError::Signature(format!("invalid hex signature: {e}")))
    }

    /// Convert to the EIP-712 struct for signature recovery and `collect`.
    pub fn to_sol(&self) -> Result<Voucher, FacilitatorError> {
        Ok(Voucher {
            id: self.id,
            buyer: self.buyer,
            seller: self.seller,
            valueAggregate: self.aggregate()?,
            asset: self.asset,
            timestamp: U256::from(self.timestamp),
            nonce: U256::from(self.nonce),
            escrow: self.escrow,
            chainId: U256::from(self.chain_id),
        })
    }
}

/// A voucher at rest, with its settlement bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredVoucher {
    pub voucher: VoucherData,
    pub stored_at: i64,
    pub settled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settle_tx: Option<String>,
}

/// Store-level failures, mapped to HTTP statuses at the edge.
#[derive(Debug, Error)]
pub enum VoucherError {
    #[error("stale voucher: {0}")]
    Stale(String),

    #[error("invalid voucher: {0}")]
    Invalid(String),

    #[error("voucher signature invalid")]
    InvalidSignature,

    #[error("voucher not found")]
    NotFound,

    #[error("voucher already settled")]
    AlreadySettled,

    #[error(transparent)]
    Other(#[from] FacilitatorError),
}

type VoucherKey = (B256, Address, Address);

pub struct VoucherStore {
    escrow: Arc<dyn EscrowClient>,
    /// Expected chain id for incoming vouchers.
    chain_id: u64,
    /// Expected escrow contract address for incoming vouchers.
    escrow_address: Address,
    vouchers: DashMap<VoucherKey, StoredVoucher>,
    /// Highest accepted nonce per voucher id, across all (buyer, seller)
    /// pairs.
    last_nonce: DashMap<B256, u64>,
    by_buyer: DashMap<Address, Vec<VoucherKey>>,
    store: Option<Arc<dyn KvStore>>,
}

impl VoucherStore {
    pub fn new(escrow: Arc<dyn EscrowClient>, chain_id: u64, escrow_address: Address) -> Self {
        Self {
            escrow,
            chain_id,
            escrow_address,
            vouchers: DashMap::new(),
            last_nonce: DashMap::new(),
            by_buyer: DashMap::new(),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn kv_key(key: &VoucherKey) -> String {
        format!("voucher:{:#x}:{:#x}:{:#x}", key.0, key.1, key.2)
    }

    /// Validate and persist a voucher. Rejections leave no state behind.
    pub async fn store_voucher(&self, voucher: VoucherData) -> Result<(), VoucherError> {
        if voucher.chain_id != self.chain_id {
            return Err(VoucherError::Invalid(format!(
                "chain id {} does not match {}",
                voucher.chain_id, self.chain_id
            )));
        }
        if voucher.escrow != self.escrow_address {
            return Err(VoucherError::Invalid(
                "escrow address does not match the configured contract".to_string(),
            ));
        }

        let aggregate = voucher.aggregate().map_err(VoucherError::Other)?;
        let sol = voucher.to_sol().map_err(VoucherError::Other)?;
        let signature = voucher.signature_bytes().map_err(VoucherError::Other)?;
        match recover_voucher_signer(&sol, &signature) {
            Ok(signer) if signer == voucher.buyer => {}
            Ok(_) | Err(FacilitatorError::Signature(_)) => {
                return Err(VoucherError::InvalidSignature)
            }
            Err(e) => return Err(VoucherError::Other(e)),
        }

        // Nonce must beat every voucher we have accepted for this id.
        if let Some(last) = self.last_nonce.get(&voucher.id) {
            if voucher.nonce <= *last {
                return Err(VoucherError::Stale(format!(
                    "nonce {} not above last accepted {}",
                    voucher.nonce, *last
                )));
            }
        }

        // Best-effort on-chain checks. A transport failure falls back to
        // local state only; the contract re-enforces both at collect time.
        match self.escrow.get_settled_nonce(voucher.id).await {
            Ok(settled) if U256::from(voucher.nonce) <= settled => {
                return Err(VoucherError::Stale(format!(
                    "nonce {} not above settled nonce {settled}",
                    voucher.nonce
                )));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "settled nonce check unavailable"),
        }
        match self.escrow.get_collected_value(voucher.id).await {
            Ok(collected) if aggregate <= collected => {
                return Err(VoucherError::Invalid(format!(
                    "value aggregate {aggregate} not above collected {collected}"
                )));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "collected value check unavailable"),
        }

        let key = (voucher.id, voucher.buyer, voucher.seller);
        let stored = StoredVoucher {
            voucher,
            stored_at: now_millis(),
            settled: false,
            settle_tx: None,
        };

        self.last_nonce.insert(key.0, stored.voucher.nonce);
        self.vouchers.insert(key, stored.clone());
        {
            let mut index = self.by_buyer.entry(key.1).or_default();
            if !index.contains(&key) {
                index.push(key);
            }
        }

        if let Some(store) = &self.store {
            if let Ok(json) = serde_json::to_string(&stored) {
                let _ = store.put(&Self::kv_key(&key), &json);
            }
            let _ = store.sadd(
                &format!("vouchers:buyer:{:#x}", key.1),
                &Self::kv_key(&key),
            );
        }

        tracing::info!(
            id = %key.0,
            buyer = %key.1,
            seller = %key.2,
            nonce = stored.voucher.nonce,
            "voucher stored"
        );
        Ok(())
    }

    /// Settle the latest stored voucher on-chain and record the handle.
    pub async fn settle_voucher(
        &self,
        id: B256,
        buyer: Address,
        seller: Address,
    ) -> Result<String, VoucherError> {
        let key = (id, buyer, seller);
        let stored = match self.vouchers.get(&key) {
            Some(entry) => entry.clone(),
            None => return Err(VoucherError::NotFound),
        };
        if stored.settled {
            return Err(VoucherError::AlreadySettled);
        }

        let sol = stored.voucher.to_sol().map_err(VoucherError::Other)?;
        let signature = stored.voucher.signature_bytes().map_err(VoucherError::Other)?;
        let tx = self
            .escrow
            .collect(&sol, &signature)
            .await
            .map_err(VoucherError::Other)?;
        let handle = format!("{tx}");

        if let Some(mut entry) = self.vouchers.get_mut(&key) {
            entry.settled = true;
            entry.settle_tx = Some(handle.clone());
            if let Some(store) = &self.store {
                if let Ok(json) = serde_json::to_string(&*entry) {
                    let _ = store.put(&Self::kv_key(&key), &json);
                }
            }
        }

        tracing::info!(id = %id, buyer = %buyer, seller = %seller, tx = %handle, "voucher settled");
        Ok(handle)
    }

    /// All stored vouchers for a buyer, newest first.
    pub fn list_for_buyer(&self, buyer: Address) -> Vec<StoredVoucher> {
        let keys = self
            .by_buyer
            .get(&buyer)
            .map(|keys| keys.clone())
            .unwrap_or_default();
        let mut vouchers: Vec<StoredVoucher> = keys
            .iter()
            .filter_map(|key| self.vouchers.get(key).map(|v| v.clone()))
            .collect();
        vouchers.sort_by_key(|v| std::cmp::Reverse(v.stored_at));
        vouchers
    }

    pub fn escrow(&self) -> &Arc<dyn EscrowClient> {
        &self.escrow
    }

    /// Drop vouchers past the TTL. Returns the number purged.
    pub fn purge_expired(&self) -> usize {
        let cutoff = now_millis() - VOUCHER_TTL.as_millis() as i64;
        let store = self.store.clone();
        let before = self.vouchers.len();
        self.vouchers.retain(|key, stored| {
            let keep = stored.stored_at >= cutoff;
            if !keep {
                if let Some(mut index) = self.by_buyer.get_mut(&key.1) {
                    index.retain(|k| k != key);
                }
                if let Some(store) = &store {
                    let _ = store.delete(&Self::kv_key(key));
                    let _ = store.srem(
                        &format!("vouchers:buyer:{:#x}", key.1),
                        &Self::kv_key(key),
                    );
                }
            }
            keep
        });
        before - self.vouchers.len()
    }

    /// Spawn the periodic TTL sweep.
    pub fn spawn_cleanup(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(600));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let purged = store.purge_expired();
                        if purged > 0 {
                            tracing::info!(purged, "purged expired vouchers");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }
}
