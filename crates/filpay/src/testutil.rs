//! Test doubles shared across the crate's unit tests: a scriptable chain
//! RPC, bond ledger, and F3 endpoint, plus payment-signing helpers.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use alloy::primitives::{Address, TxHash, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::bond::BondLedger;
use crate::chain::{ChainRpc, ReceiptInfo};
use crate::f3::{EcTipset, F3Certificate, F3Client, F3Progress, Phase};
use crate::{eip712, ChainConfig, FacilitatorError, PaymentData, PaymentRequirements};

/// Build a correctly signed payment with a one-hour window around `now`,
/// and requirements it satisfies exactly.
pub fn signed_payment(
    signer: &PrivateKeySigner,
    value: U256,
    now: u64,
) -> (PaymentData, PaymentRequirements) {
    let config = ChainConfig::default();
    let recipient = Address::new([0x22; 20]);
    let payment = PaymentData {
        token: config.default_token,
        from: signer.address(),
        to: recipient,
        value: value.to_string(),
        valid_after: now.saturating_sub(10),
        valid_before: now + 3600,
        nonce: B256::from(rand::random::<[u8; 32]>()),
        signature: String::new(),
    };
    let payment = resign(signer, payment);
    let requirements = PaymentRequirements {
        pay_to: recipient,
        max_amount_required: value.to_string(),
        token_address: config.default_token,
        chain_id: config.chain_id,
        resource: Some("/paid/resource".to_string()),
        description: None,
    };
    (payment, requirements)
}

/// Re-sign a payment after its fields were edited.
pub fn resign(signer: &PrivateKeySigner, mut payment: PaymentData) -> PaymentData {
    let config = ChainConfig::default();
    let auth = eip712::to_authorization(&payment).unwrap();
    let hash = eip712::signing_hash(&auth, &config, payment.token);
    let sig = signer.sign_hash_sync(&hash).unwrap();
    payment.signature = format!("0x{}", alloy::hex::encode(sig.as_bytes()));
    payment
}

/// Scriptable chain RPC double.
#[derive(Default)]
pub struct MockChain {
    balances: DashMap<Address, U256>,
    used_nonces: DashSet<(Address, B256)>,
    fail_balance: bool,
    fail_nonce_check: bool,
    /// Remaining submissions that fail before they start succeeding.
    submit_failures: AtomicU32,
    height: Option<u64>,
    default_receipt: Mutex<Option<ReceiptInfo>>,
    tx_counter: AtomicU64,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(self, owner: Address, balance: U256) -> Self {
        self.balances.insert(owner, balance);
        self
    }

    pub fn with_used_nonce(self, authorizer: Address, nonce: B256) -> Self {
        self.used_nonces.insert((authorizer, nonce));
        self
    }

    pub fn with_balance_failure(mut self) -> Self {
        self.fail_balance = true;
        self
    }

    pub fn with_nonce_check_failure(mut self) -> Self {
        self.fail_nonce_check = true;
        self
    }

    pub fn with_submit_failures(self, count: u32) -> Self {
        self.submit_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_height(mut self, height: u64) -> Self {
        self.height = Some(height);
        self
    }

    /// Every subsequent receipt poll reports this outcome for any handle.
    pub fn set_default_receipt(&self, success: bool, block_number: Option<u64>) {
        *self.default_receipt.lock().unwrap() = Some(ReceiptInfo {
            success,
            block_number,
        });
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn balance_of(&self, _token: Address, owner: Address) -> Result<U256, FacilitatorError> {
        if self.fail_balance {
            return Err(FacilitatorError::Chain("scripted balance failure".to_string()));
        }
        Ok(self.balances.get(&owner).map(|b| *b).unwrap_or(U256::ZERO))
    }

    async fn is_authorization_used(
        &self,
        _token: Address,
        authorizer: Address,
        nonce: B256,
    ) -> Result<bool, FacilitatorError> {
        if self.fail_nonce_check {
            return Err(FacilitatorError::Chain("scripted nonce failure".to_string()));
        }
        Ok(self.used_nonces.contains(&(authorizer, nonce)))
    }

    async fn submit_transfer(&self, _payment: &PaymentData) -> Result<TxHash, FacilitatorError> {
        let remaining = self.submit_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.submit_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(FacilitatorError::Chain("scripted submit failure".to_string()));
        }
        let n = self.tx_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&n.to_be_bytes());
        Ok(TxHash::new(bytes))
    }

    async fn wait_for_receipt(
        &self,
        _handle: TxHash,
        _timeout: Duration,
    ) -> Result<Option<ReceiptInfo>, FacilitatorError> {
        Ok(*self.default_receipt.lock().unwrap())
    }

    async fn current_height(&self) -> Result<u64, FacilitatorError> {
        self.height
            .ok_or_else(|| FacilitatorError::Chain("scripted height failure".to_string()))
    }

    async fn current_gas_price(&self) -> Result<U256, FacilitatorError> {
        Ok(U256::from(1_000_000_000u64))
    }
}

/// In-memory bond ledger mirroring the contract's at-most-one-resolution
/// rule.
pub struct MockBond {
    available: Mutex<U256>,
    committed: DashMap<B256, U256>,
    released: DashSet<B256>,
    claimed: DashSet<B256>,
}

impl MockBond {
    pub fn with_available(amount: U256) -> Self {
        Self {
            available: Mutex::new(amount),
            committed: DashMap::new(),
            released: DashSet::new(),
            claimed: DashSet::new(),
        }
    }

    pub fn available(&self) -> U256 {
        *self.available.lock().unwrap()
    }

    pub fn is_committed(&self, id: B256) -> bool {
        self.committed.contains_key(&id)
    }

    pub fn is_released(&self, id: B256) -> bool {
        self.released.contains(&id)
    }

    pub fn is_claimed(&self, id: B256) -> bool {
        self.claimed.contains(&id)
    }
}

#[async_trait]
impl BondLedger for MockBond {
    async fn commit_payment(
        &self,
        payment_id: B256,
        _provider: Address,
        amount: U256,
    ) -> Result<(), FacilitatorError> {
        if self.committed.contains_key(&payment_id) {
            return Err(FacilitatorError::Bond("duplicate commitment".to_string()));
        }
        let mut available = self.available.lock().unwrap();
        if *available < amount {
            return Err(FacilitatorError::Bond("insufficient bond".to_string()));
        }
        *available -= amount;
        self.committed.insert(payment_id, amount);
        Ok(())
    }

    async fn release_payment(&self, payment_id: B256) -> Result<(), FacilitatorError> {
        let Some(amount) = self.committed.get(&payment_id).map(|a| *a) else {
            return Err(FacilitatorError::Bond("unknown commitment".to_string()));
        };
        if self.released.contains(&payment_id) || self.claimed.contains(&payment_id) {
            return Err(FacilitatorError::Bond("already resolved".to_string()));
        }
        self.released.insert(payment_id);
        *self.available.lock().unwrap() += amount;
        Ok(())
    }

    async fn claim_payment(&self, payment_id: B256) -> Result<(), FacilitatorError> {
        if !self.committed.contains_key(&payment_id) {
            return Err(FacilitatorError::Bond("unknown commitment".to_string()));
        }
        if self.released.contains(&payment_id) || self.claimed.contains(&payment_id) {
            return Err(FacilitatorError::Bond("already resolved".to_string()));
        }
        self.claimed.insert(payment_id);
        Ok(())
    }

    async fn get_exposure(&self) -> Result<U256, FacilitatorError> {
        let mut exposure = U256::ZERO;
        for entry in self.committed.iter() {
            if !self.released.contains(entry.key()) && !self.claimed.contains(entry.key()) {
                exposure += *entry.value();
            }
        }
        Ok(exposure)
    }

    async fn get_available_bond(&self) -> Result<U256, FacilitatorError> {
        Ok(self.available())
    }
}

/// Mutable F3 endpoint double: tests flip progress and certificates between
/// polls.
pub struct ScriptedF3 {
    progress: Mutex<F3Progress>,
    certs: Mutex<Vec<F3Certificate>>,
}

impl ScriptedF3 {
    pub fn stable(instance: u64, round: u64, phase: Phase) -> Self {
        Self {
            progress: Mutex::new(F3Progress {
                instance,
                round,
                phase,
            }),
            certs: Mutex::new(Vec::new()),
        }
    }

    pub fn set_progress(&self, instance: u64, round: u64, phase: Phase) {
        *self.progress.lock().unwrap() = F3Progress {
            instance,
            round,
            phase,
        };
    }

    pub fn set_certificate(&self, instance: u64, finalized_height: u64) {
        self.certs.lock().unwrap().push(F3Certificate {
            instance,
            ec_chain: vec![EcTipset {
                epoch: finalized_height,
            }],
        });
    }
}

#[async_trait]
impl F3Client for ScriptedF3 {
    async fn get_progress(&self) -> Result<F3Progress, FacilitatorError> {
        Ok(*self.progress.lock().unwrap())
    }

    async fn get_certificate(
        &self,
        instance: u64,
    ) -> Result<Option<F3Certificate>, FacilitatorError> {
        Ok(self
            .certs
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.instance == instance)
            .cloned())
    }

    async fn get_latest_certificate(&self) -> Result<Option<F3Certificate>, FacilitatorError> {
        Ok(self
            .certs
            .lock()
            .unwrap()
            .iter()
            .max_by_key(|c| c.instance)
            .cloned())
    }

    async fn get_manifest(&self) -> Result<serde_json::Value, FacilitatorError> {
        Ok(serde_json::json!({"NetworkName": "testnet"}))
    }
}
