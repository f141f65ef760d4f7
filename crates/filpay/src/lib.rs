//! Payment facilitator core for Filecoin EVM chains.
//!
//! Sits between HTTP API providers and their buyers: a buyer signs an
//! off-chain EIP-3009 `transferWithAuthorization` for a stablecoin and hands
//! it to the provider, which forwards it here. The facilitator verifies the
//! authorization, commits bond collateral so the provider is paid even if
//! settlement fails, submits the on-chain transfer, and tracks the
//! transaction through the four-level fast-confirmation hierarchy driven by
//! the chain's F3 consensus subprotocol.
//!
//! # Subsystems
//!
//! - [`verify`]: the ordered gate pipeline that classifies a payment
//! - [`engine`]: bond commit, on-chain submit, retry loop, credit release
//! - [`risk`]: per-wallet pending/daily/tier ledger
//! - [`fcr`]: the F3 poller and per-transaction confirmation evaluator
//! - [`voucher`]: deferred-payment vouchers settled against the escrow
//!
//! The on-chain stablecoin, bond, and escrow contracts are consumed through
//! the `sol!` interfaces below; the core never defines their semantics.

pub mod bond;
pub mod chain;
pub mod constants;
pub mod engine;
pub mod error;
pub mod escrow;
pub mod f3;
pub mod fcr;
pub mod fees;
pub mod payment;
pub mod risk;
pub mod settlement;
pub mod store;
pub mod verify;
pub mod voucher;

pub mod eip712;

#[cfg(test)]
pub(crate) mod testutil;

use alloy::sol;

// EIP-3009 authorization struct. The sol! macro derives SolStruct which
// provides eip712_signing_hash() against the token's domain.
sol! {
    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

// Deferred-payment voucher struct, signed under the escrow's own domain
// ("DeferredPaymentEscrow", version "1"). valueAggregate is a running total;
// the escrow pays out deltas against its last collected value.
sol! {
    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct Voucher {
        bytes32 id;
        address buyer;
        address seller;
        uint256 valueAggregate;
        address asset;
        uint256 timestamp;
        uint256 nonce;
        address escrow;
        uint256 chainId;
    }
}

// Stablecoin (ERC-20 + EIP-3009) interface.
sol! {
    #[sol(rpc)]
    interface Stablecoin {
        function balanceOf(address owner) external view returns (uint256);
        function authorizationState(address authorizer, bytes32 nonce) external view returns (bool);
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
    }
}

// Facilitator bond contract. Collateral is partitioned per payment id; a
// commitment resolves exactly once, either released by the facilitator or
// claimed by the provider after the deadline.
sol! {
    #[sol(rpc)]
    interface PaymentBond {
        function commitPayment(bytes32 paymentId, address provider, uint256 amount) external;
        function releasePayment(bytes32 paymentId) external;
        function claimPayment(bytes32 paymentId) external;
        function bondBalance(address facilitator) external view returns (uint256);
        function totalCommitted(address facilitator) external view returns (uint256);
    }
}

// Deferred-payment escrow contract. Buyers deposit, optionally thaw with a
// cooldown, and sellers collect signed vouchers for their delta.
sol! {
    #[sol(rpc)]
    interface DeferredPaymentEscrow {
        struct EscrowVoucher {
            bytes32 id;
            address buyer;
            address seller;
            uint256 valueAggregate;
            address asset;
            uint256 timestamp;
            uint256 nonce;
            address escrow;
            uint256 chainId;
        }

        function collect(EscrowVoucher calldata voucher, bytes calldata signature) external;
        function getAccount(address buyer) external view returns (uint256 balance, uint256 thawingAmount, uint256 thawEndTime);
        function settledNonce(bytes32 id) external view returns (uint256);
        function collectedValue(bytes32 id) external view returns (uint256);
    }
}

// Re-exports
pub use constants::ChainConfig;
pub use constants::*;
pub use error::FacilitatorError;
pub use payment::*;

pub use chain::{ChainRpc, EvmChainRpc};
pub use engine::SettlementEngine;
pub use fcr::{ConfirmationLevel, FcrMonitor};
pub use risk::{RiskEngine, RiskLimits, WalletTier};
pub use settlement::{SettlementRecord, SettlementStatus};
pub use voucher::VoucherStore;
