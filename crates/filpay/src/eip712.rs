//! EIP-712 digests, signature recovery, and payment identity.
//!
//! Two struct types share the digest construction:
//! - [`TransferWithAuthorization`] under the token's own domain
//!   (`{token_name, token_version, chainId, token}`), the EIP-3009 shape;
//! - [`Voucher`] under the escrow's domain
//!   (`"DeferredPaymentEscrow"`, version `"1"`, `chainId`, escrow address).
//!
//! The payment identity is `keccak256(signature)`: deterministic for the
//! same authorization, collision-free across distinct ones with overwhelming
//! probability over the 256-bit nonce.

use alloy::primitives::{keccak256, Address, Signature, B256, U256};
use alloy::sol_types::SolStruct;

use crate::{ChainConfig, FacilitatorError, PaymentData, TransferWithAuthorization, Voucher};

/// Build the token's EIP-712 domain for authorization signatures.
pub fn transfer_domain(config: &ChainConfig, token: Address) -> alloy::sol_types::Eip712Domain {
    alloy::sol_types::Eip712Domain {
        name: Some(std::borrow::Cow::Owned(config.token_name.clone())),
        version: Some(std::borrow::Cow::Owned(config.token_version.clone())),
        chain_id: Some(U256::from(config.chain_id)),
        verifying_contract: Some(token),
        salt: None,
    }
}

/// Build the escrow's EIP-712 domain for voucher signatures.
pub fn voucher_domain(chain_id: u64, escrow: Address) -> alloy::sol_types::Eip712Domain {
    alloy::sol_types::Eip712Domain {
        name: Some(std::borrow::Cow::Borrowed("DeferredPaymentEscrow")),
        version: Some(std::borrow::Cow::Borrowed("1")),
        chain_id: Some(U256::from(chain_id)),
        verifying_contract: Some(escrow),
        salt: None,
    }
}

/// Compute the EIP-712 signing hash of a payment authorization.
pub fn signing_hash(auth: &TransferWithAuthorization, config: &ChainConfig, token: Address) -> B256 {
    auth.eip712_signing_hash(&transfer_domain(config, token))
}

/// Compute the EIP-712 signing hash of a voucher.
pub fn voucher_signing_hash(voucher: &Voucher, chain_id: u64, escrow: Address) -> B256 {
    voucher.eip712_signing_hash(&voucher_domain(chain_id, escrow))
}

/// secp256k1 curve order N / 2 — signatures with s > this are malleable (EIP-2).
const SECP256K1_N_DIV_2: U256 = U256::from_limbs([
    0xBFD25E8CD0364140,
    0xBAAEDCE6AF48A03B,
    0xFFFFFFFFFFFFFFFE,
    0x7FFFFFFFFFFFFFFF,
]);

/// Parse a 65-byte raw signature, rejecting malformed lengths and high-s
/// values (EIP-2 malleability).
fn parse_signature(signature_bytes: &[u8]) -> Result<Signature, FacilitatorError> {
    if signature_bytes.len() != 65 {
        return Err(FacilitatorError::Signature(format!(
            "signature must be 65 bytes, got {}",
            signature_bytes.len()
        )));
    }

    let sig = Signature::from_raw(signature_bytes)
        .map_err(|e| FacilitatorError::Signature(format!("invalid signature: {e}")))?;

    if sig.s() > SECP256K1_N_DIV_2 {
        return Err(FacilitatorError::Signature(
            "high-s signature rejected (EIP-2 malleability)".to_string(),
        ));
    }

    Ok(sig)
}

/// Convert a wire payment into its EIP-3009 struct.
pub fn to_authorization(payment: &PaymentData) -> Result<TransferWithAuthorization, FacilitatorError> {
    Ok(TransferWithAuthorization {
        from: payment.from,
        to: payment.to,
        value: payment.amount()?,
        validAfter: U256::from(payment.valid_after),
        validBefore: U256::from(payment.valid_before),
        nonce: payment.nonce,
    })
}

/// Recover the signer address from a payment's 65-byte signature.
pub fn recover_signer(
    payment: &PaymentData,
    config: &ChainConfig,
) -> Result<Address, FacilitatorError> {
    let auth = to_authorization(payment)?;
    let sig = parse_signature(&payment.signature_bytes()?)?;
    let hash = signing_hash(&auth, config, payment.token);
    sig.recover_address_from_prehash(&hash)
        .map_err(|e| FacilitatorError::Signature(format!("recovery failed: {e}")))
}

/// Recovered address equals `payment.from`. Address comparison is on the raw
/// 20 bytes, so mixed-case wire input is already normalized by parsing.
pub fn is_valid_for(payment: &PaymentData, config: &ChainConfig) -> Result<bool, FacilitatorError> {
    Ok(recover_signer(payment, config)? == payment.from)
}

/// `validAfter <= now < validBefore`.
pub fn within_window(payment: &PaymentData, now: u64) -> bool {
    payment.valid_after <= now && now < payment.valid_before
}

/// The authorization expires before the settlement engine's time budget
/// runs out. Settlement needs strictly more than `budget_secs` of headroom,
/// so exactly `budget_secs` remaining still counts as expiring.
pub fn expires_within(payment: &PaymentData, now: u64, budget_secs: u64) -> bool {
    payment.valid_before.saturating_sub(now) <= budget_secs
}

/// Deterministic payment identity: `keccak256(signature)`. Used as the
/// settlement primary key and the bond commitment id.
pub fn payment_id(payment: &PaymentData) -> Result<B256, FacilitatorError> {
    Ok(keccak256(payment.signature_bytes()?))
}

/// Recover the buyer address from a voucher's 65-byte signature.
pub fn recover_voucher_signer(
    voucher: &Voucher,
    signature_bytes: &[u8],
) -> Result<Address, FacilitatorError> {
    let sig = parse_signature(signature_bytes)?;
    let chain_id: u64 = voucher
        .chainId
        .try_into()
        .map_err(|_| FacilitatorError::InvalidPayment("voucher chainId out of range".to_string()))?;
    let hash = voucher_signing_hash(voucher, chain_id, voucher.escrow);
    sig.recover_address_from_prehash(&hash)
        .map_err(|e| FacilitatorError::Signature(format!("recovery failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::FixedBytes;
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;

    fn signed_payment(signer: &PrivateKeySigner, config: &ChainConfig) -> PaymentData {
        let mut payment = PaymentData {
            token: config.default_token,
            from: signer.address(),
            to: Address::new([0x11; 20]),
            value: "1000000000000000000".to_string(),
            valid_after: 0,
            valid_before: u64::MAX,
            nonce: FixedBytes::new([0x42; 32]),
            signature: String::new(),
        };
        let auth = to_authorization(&payment).unwrap();
        let hash = signing_hash(&auth, config, payment.token);
        let sig = signer.sign_hash_sync(&hash).unwrap();
        payment.signature = format!("0x{}", alloy::hex::encode(sig.as_bytes()));
        payment
    }

    #[test]
    fn sign_and_recover_roundtrip() {
        let signer = PrivateKeySigner::random();
        let config = ChainConfig::default();
        let payment = signed_payment(&signer, &config);

        assert_eq!(recover_signer(&payment, &config).unwrap(), signer.address());
        assert!(is_valid_for(&payment, &config).unwrap());
    }

    #[test]
    fn tampered_value_recovers_different_address() {
        let signer = PrivateKeySigner::random();
        let config = ChainConfig::default();
        let mut payment = signed_payment(&signer, &config);
        payment.value = "2000000000000000000".to_string();

        assert_ne!(recover_signer(&payment, &config).unwrap(), signer.address());
        assert!(!is_valid_for(&payment, &config).unwrap());
    }

    #[test]
    fn wrong_domain_recovers_different_address() {
        let signer = PrivateKeySigner::random();
        let config = ChainConfig::default();
        let payment = signed_payment(&signer, &config);

        let other_chain = ChainConfig {
            chain_id: 314,
            ..ChainConfig::default()
        };
        assert_ne!(
            recover_signer(&payment, &other_chain).unwrap(),
            signer.address()
        );
    }

    #[test]
    fn short_signature_rejected() {
        let signer = PrivateKeySigner::random();
        let config = ChainConfig::default();
        let mut payment = signed_payment(&signer, &config);
        payment.signature = "0xdeadbeef".to_string();

        assert!(matches!(
            recover_signer(&payment, &config),
            Err(FacilitatorError::Signature(_))
        ));
    }

    #[test]
    fn window_boundaries() {
        let signer = PrivateKeySigner::random();
        let config = ChainConfig::default();
        let mut payment = signed_payment(&signer, &config);
        payment.valid_after = 100;
        payment.valid_before = 200;

        assert!(!within_window(&payment, 99));
        assert!(within_window(&payment, 100));
        assert!(within_window(&payment, 199));
        assert!(!within_window(&payment, 200));
    }

    #[test]
    fn expiry_budget_is_strict() {
        let signer = PrivateKeySigner::random();
        let config = ChainConfig::default();
        let mut payment = signed_payment(&signer, &config);
        payment.valid_before = 1_000;

        // Strictly more than the budget left: fine.
        assert!(!expires_within(&payment, 879, 120));
        // Exactly the budget left: already expiring.
        assert!(expires_within(&payment, 880, 120));
        assert!(expires_within(&payment, 881, 120));
    }

    #[test]
    fn payment_id_is_signature_keyed() {
        let signer = PrivateKeySigner::random();
        let config = ChainConfig::default();
        let payment = signed_payment(&signer, &config);

        let id1 = payment_id(&payment).unwrap();
        let id2 = payment_id(&payment).unwrap();
        assert_eq!(id1, id2);

        let other = signed_payment(&PrivateKeySigner::random(), &config);
        assert_ne!(id1, payment_id(&other).unwrap());
    }

    #[test]
    fn voucher_sign_and_recover_roundtrip() {
        let signer = PrivateKeySigner::random();
        let escrow = Address::new([0x33; 20]);
        let voucher = Voucher {
            id: FixedBytes::new([0x01; 32]),
            buyer: signer.address(),
            seller: Address::new([0x22; 20]),
            valueAggregate: U256::from(100u64),
            asset: crate::constants::DEFAULT_TOKEN,
            timestamp: U256::from(1_700_000_000u64),
            nonce: U256::from(1u64),
            escrow,
            chainId: U256::from(314159u64),
        };
        let hash = voucher_signing_hash(&voucher, 314159, escrow);
        let sig = signer.sign_hash_sync(&hash).unwrap();

        let recovered = recover_voucher_signer(&voucher, &sig.as_bytes()).unwrap();
        assert_eq!(recovered, signer.address());
    }
}
