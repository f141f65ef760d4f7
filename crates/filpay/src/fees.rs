//! Off-path fee calculator.
//!
//! Computes the facilitator's fee breakdown for a payment but is not wired
//! into settlement: whether fees deduct from the payer's value, from the
//! bond, or are billed off-system is an open product question. Until that
//! is settled, callers use this as a quoting tool only.

use alloy::primitives::U256;

use crate::risk::WalletTier;

/// Basis-point denominator.
const BPS: u64 = 10_000;

/// Fee schedule in basis points. The risk fee scales with the wallet tier:
/// unknown wallets pay the full configured rate, verified wallets pay none.
#[derive(Debug, Clone)]
pub struct FeeSchedule {
    pub base_fee_bps: u64,
    pub risk_fee_bps: u64,
    pub provider_fee_bps: u64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            base_fee_bps: 10,     // 0.10%
            risk_fee_bps: 50,     // up to 0.50%, tier-scaled
            provider_fee_bps: 25, // 0.25%
        }
    }
}

/// Computed breakdown for one payment amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeBreakdown {
    pub base_fee: U256,
    pub risk_fee: U256,
    pub provider_fee: U256,
    pub total_fee: U256,
    /// Amount net of all fees.
    pub net: U256,
}

impl FeeSchedule {
    /// Tier multiplier applied to the risk fee, in quarters: unknown 4/4,
    /// 7-day history 3/4, 30-day history 1/4, verified 0.
    fn risk_quarters(tier: WalletTier) -> u64 {
        match tier {
            WalletTier::Unknown => 4,
            WalletTier::History7d => 3,
            WalletTier::History30d => 1,
            WalletTier::Verified => 0,
        }
    }

    /// Compute the breakdown. Integer math only; each component rounds
    /// down, and `net = amount - total_fee` so the pieces always sum.
    pub fn compute(&self, amount: U256, tier: WalletTier) -> FeeBreakdown {
        let bps = U256::from(BPS);
        let base_fee = amount * U256::from(self.base_fee_bps) / bps;
        let risk_fee =
            amount * U256::from(self.risk_fee_bps * Self::risk_quarters(tier)) / (bps * U256::from(4u64));
        let provider_fee = amount * U256::from(self.provider_fee_bps) / bps;
        let total_fee = base_fee + risk_fee + provider_fee;
        FeeBreakdown {
            base_fee,
            risk_fee,
            provider_fee,
            total_fee,
            net: amount.saturating_sub(total_fee),
        }
    }
}
