use alloy::primitives::Address;

/// Filecoin Calibration testnet chain ID.
pub const CALIBRATION_CHAIN_ID: u64 = 314159;

/// CAIP-2 network identifier for Filecoin Calibration.
pub const CALIBRATION_NETWORK: &str = "eip155:314159";

/// USDFC stablecoin address on Filecoin Calibration.
pub const DEFAULT_TOKEN: Address = Address::new([
    0xb3, 0x04, 0x27, 0x34, 0xb6, 0x08, 0xa1, 0xb1, 0x6e, 0x9e, 0x86, 0xb3, 0x74, 0xa3, 0xf3, 0xe3,
    0x89, 0xb4, 0xcd, 0xf0,
]);

/// USDFC has 18 decimal places.
pub const TOKEN_DECIMALS: u32 = 18;

/// EIP-712 domain name of the default token.
pub const TOKEN_NAME: &str = "USDFC";

/// Default Filecoin Calibration JSON-RPC endpoint (EVM and F3 methods).
pub const RPC_URL: &str = "https://api.calibration.node.glif.io/rpc/v1";

/// Block explorer base URL.
pub const EXPLORER_BASE: &str = "https://calibration.filfox.info";

/// Minimum remaining authorization validity at verification time, so the
/// settlement engine has room to submit and retry before expiry.
pub const SETTLEMENT_BUDGET_SECS: u64 = 120;

/// Runtime chain configuration. Decouples the facilitator from compile-time
/// constants, enabling mainnet/testnet and alternative-token deployments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub network: String,
    pub default_token: Address,
    pub token_decimals: u32,
    /// EIP-712 domain name of the token contract.
    pub token_name: String,
    /// EIP-712 domain version of the token contract.
    pub token_version: String,
    pub rpc_url: String,
    /// Endpoint serving the Filecoin.F3* methods. Usually the same node.
    pub f3_rpc_url: String,
    pub explorer_base: String,
}

impl Default for ChainConfig {
    /// Defaults to Filecoin Calibration with USDFC.
    fn default() -> Self {
        Self {
            chain_id: CALIBRATION_CHAIN_ID,
            network: CALIBRATION_NETWORK.to_string(),
            default_token: DEFAULT_TOKEN,
            token_decimals: TOKEN_DECIMALS,
            token_name: TOKEN_NAME.to_string(),
            token_version: "1".to_string(),
            rpc_url: RPC_URL.to_string(),
            f3_rpc_url: RPC_URL.to_string(),
            explorer_base: EXPLORER_BASE.to_string(),
        }
    }
}

impl ChainConfig {
    /// Convert a whole-dollar limit to token base units (`usd * 10^decimals`).
    /// All amounts stay in 256-bit integer space; no floating point.
    pub fn usd_to_units(&self, usd: u64) -> alloy::primitives::U256 {
        alloy::primitives::U256::from(usd)
            * alloy::primitives::U256::from(10u64).pow(alloy::primitives::U256::from(
                self.token_decimals,
            ))
    }
}
