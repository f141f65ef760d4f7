use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::providers::{
    fillers::{
        BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
    },
    Identity, RootProvider,
};

use filpay::chain::ChainRpc;
use filpay::fcr::FcrMonitor;
use filpay::risk::RiskEngine;
use filpay::voucher::VoucherStore;
use filpay::{ChainConfig, SettlementEngine};

use crate::config::FacilitatorConfig;

/// Concrete provider type from `ProviderBuilder::new().wallet(...).connect_http(...)`.
pub type WalletProvider = FillProvider<
    JoinFill<
        JoinFill<
            Identity,
            JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
        >,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider,
>;

/// Shared application state. Every component is explicitly owned and
/// injected; nothing here is a singleton.
pub struct AppState {
    pub engine: Arc<SettlementEngine>,
    pub risk: Arc<RiskEngine>,
    pub chain: Arc<dyn ChainRpc>,
    /// `None` when `fcr.enabled` is off.
    pub fcr: Option<Arc<FcrMonitor>>,
    /// `None` when no escrow contract is configured.
    pub vouchers: Option<Arc<VoucherStore>>,
    pub chain_config: ChainConfig,
    pub config: FacilitatorConfig,
}
