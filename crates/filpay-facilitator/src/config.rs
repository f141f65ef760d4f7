use std::env;
use std::time::Duration;

use alloy::primitives::Address;

use filpay::engine::EngineConfig;
use filpay::fcr::FcrConfig;
use filpay::ChainConfig;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 4030;
const DEFAULT_RATE_LIMIT_RPM: u64 = 120;

// Absolute risk limits in whole dollars.
const DEFAULT_MAX_PER_TRANSACTION_USD: u64 = 100;
const DEFAULT_MAX_PENDING_PER_WALLET_USD: u64 = 500;
const DEFAULT_DAILY_LIMIT_PER_WALLET_USD: u64 = 1_000;

/// Full facilitator configuration, assembled from the environment.
#[derive(Clone)]
pub struct FacilitatorConfig {
    pub host: String,
    pub port: u16,
    pub chain: ChainConfig,
    /// Facilitator signing key (hex). Required.
    pub private_key: String,

    pub max_per_transaction_usd: u64,
    pub max_pending_per_wallet_usd: u64,
    pub daily_limit_per_wallet_usd: u64,

    pub engine: EngineConfig,
    pub fcr: FcrConfig,

    /// Bond contract; `None` disables bond commitments.
    pub bond_address: Option<Address>,
    /// Warn when committed bond exceeds this percentage of the balance.
    pub bond_alert_threshold_percent: u64,
    /// Escrow contract; `None` disables deferred payments.
    pub escrow_address: Option<Address>,

    /// SQLite persistence path; `None` keeps all state in memory.
    pub store_path: Option<String>,
    pub store_prefix: String,

    pub allowed_origins: Vec<String>,
    pub rate_limit_rpm: u64,
}

impl std::fmt::Debug for FacilitatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacilitatorConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("chain", &self.chain)
            .field("private_key", &"[REDACTED]")
            .field("max_per_transaction_usd", &self.max_per_transaction_usd)
            .field("max_pending_per_wallet_usd", &self.max_pending_per_wallet_usd)
            .field("daily_limit_per_wallet_usd", &self.daily_limit_per_wallet_usd)
            .field("engine", &self.engine)
            .field("fcr", &self.fcr)
            .field("bond_address", &self.bond_address)
            .field(
                "bond_alert_threshold_percent",
                &self.bond_alert_threshold_percent,
            )
            .field("escrow_address", &self.escrow_address)
            .field("store_path", &self.store_path)
            .field("store_prefix", &self.store_prefix)
            .field("allowed_origins", &self.allowed_origins)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid(name, raw)),
        Err(_) => Ok(default),
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_address(name: &'static str) -> Result<Option<Address>, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse::<Address>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(name, raw)),
        _ => Ok(None),
    }
}

impl FacilitatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let private_key = env::var("FACILITATOR_PRIVATE_KEY")
            .map_err(|_| ConfigError::MissingRequired("FACILITATOR_PRIVATE_KEY"))?;

        let defaults = ChainConfig::default();
        let chain_id = env_parse("CHAIN_ID", defaults.chain_id)?;
        let chain = ChainConfig {
            chain_id,
            network: format!("eip155:{chain_id}"),
            default_token: env_address("TOKEN_ADDRESS")?.unwrap_or(defaults.default_token),
            token_decimals: env_parse("TOKEN_DECIMALS", defaults.token_decimals)?,
            token_name: env::var("TOKEN_NAME").unwrap_or(defaults.token_name),
            token_version: env::var("TOKEN_VERSION").unwrap_or(defaults.token_version),
            rpc_url: env::var("RPC_URL").unwrap_or(defaults.rpc_url.clone()),
            f3_rpc_url: env::var("F3_RPC_URL")
                .or_else(|_| env::var("RPC_URL"))
                .unwrap_or(defaults.f3_rpc_url),
            explorer_base: env::var("EXPLORER_BASE").unwrap_or(defaults.explorer_base),
        };

        let engine = EngineConfig {
            max_attempts: env_parse("SETTLEMENT_MAX_ATTEMPTS", 3u32)?,
            retry_delay: Duration::from_millis(env_parse("SETTLEMENT_RETRY_DELAY_MS", 5_000u64)?),
            receipt_timeout: Duration::from_millis(env_parse("SETTLEMENT_TIMEOUT_MS", 3_000u64)?),
            ..EngineConfig::default()
        };

        let fcr_defaults = FcrConfig::default();
        let fcr = FcrConfig {
            enabled: env_flag("FCR_ENABLED", true),
            poll_interval: Duration::from_millis(env_parse("FCR_POLL_INTERVAL_MS", 1_000u64)?),
            require_round_zero: env_flag("FCR_REQUIRE_ROUND_ZERO", true),
            min_time_in_prepare: Duration::from_millis(env_parse(
                "FCR_MIN_TIME_IN_PREPARE_MS",
                fcr_defaults.min_time_in_prepare.as_millis() as u64,
            )?),
            confirmation_timeout: Duration::from_millis(env_parse(
                "FCR_CONFIRMATION_TIMEOUT_MS",
                fcr_defaults.confirmation_timeout.as_millis() as u64,
            )?),
        };

        let allowed_origins: Vec<String> = env::var("ALLOWED_ORIGINS")
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            chain,
            private_key,
            max_per_transaction_usd: env_parse(
                "RISK_MAX_PER_TRANSACTION_USD",
                DEFAULT_MAX_PER_TRANSACTION_USD,
            )?,
            max_pending_per_wallet_usd: env_parse(
                "RISK_MAX_PENDING_PER_WALLET_USD",
                DEFAULT_MAX_PENDING_PER_WALLET_USD,
            )?,
            daily_limit_per_wallet_usd: env_parse(
                "RISK_DAILY_LIMIT_PER_WALLET_USD",
                DEFAULT_DAILY_LIMIT_PER_WALLET_USD,
            )?,
            engine,
            fcr,
            bond_address: env_address("BOND_CONTRACT_ADDRESS")?,
            bond_alert_threshold_percent: env_parse("BOND_ALERT_THRESHOLD_PERCENT", 80u64)?,
            escrow_address: env_address("ESCROW_CONTRACT_ADDRESS")?,
            store_path: env::var("STORE_DB_PATH").ok().filter(|s| !s.is_empty()),
            store_prefix: env::var("STORE_PREFIX").unwrap_or_else(|_| "filpay".to_string()),
            allowed_origins,
            rate_limit_rpm: env_parse("RATE_LIMIT_RPM", DEFAULT_RATE_LIMIT_RPM)?,
        })
    }
}
