use actix_cors::Cors;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::middleware::from_fn;
use actix_web::{web, App, HttpServer};
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;

use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use filpay::bond::{BondLedger, OnchainBondLedger};
use filpay::chain::{ChainRpc, EvmChainRpc};
use filpay::escrow::{EscrowClient, OnchainEscrow};
use filpay::f3::HttpF3Client;
use filpay::fcr::FcrMonitor;
use filpay::risk::{RiskEngine, RiskLimits};
use filpay::store::{KvStore, SqliteKvStore};
use filpay::voucher::VoucherStore;
use filpay::SettlementEngine;

use filpay_facilitator::config::FacilitatorConfig;
use filpay_facilitator::{headers, routes, state::AppState};

fn build_cors(origins: &[String]) -> Cors {
    if origins.is_empty() {
        // Default: allow localhost on any port.
        Cors::default()
            .allowed_origin_fn(|origin, _| {
                origin
                    .to_str()
                    .map(|o| o == "http://localhost" || o.starts_with("http://localhost:"))
                    .unwrap_or(false)
            })
            .allow_any_method()
            .allowed_headers(vec!["content-type"])
            .max_age(3600)
    } else {
        let mut cors = Cors::default();
        for origin in origins {
            cors = cors.allowed_origin(origin);
        }
        cors.allow_any_method()
            .allowed_headers(vec!["content-type"])
            .max_age(3600)
    }
}

/// Periodically warn when committed bond collateral crosses the alert
/// threshold.
fn spawn_bond_alert(
    bond: Arc<dyn BondLedger>,
    threshold_percent: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let (available, exposure) = match (
                        bond.get_available_bond().await,
                        bond.get_exposure().await,
                    ) {
                        (Ok(a), Ok(e)) => (a, e),
                        _ => continue,
                    };
                    let total = available + exposure;
                    if total.is_zero() {
                        continue;
                    }
                    let used_percent = exposure * alloy::primitives::U256::from(100u64) / total;
                    if used_percent >= alloy::primitives::U256::from(threshold_percent) {
                        tracing::warn!(
                            %exposure,
                            %available,
                            threshold_percent,
                            "bond exposure above alert threshold"
                        );
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    });
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match FacilitatorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let signer: PrivateKeySigner = config
        .private_key
        .parse()
        .expect("invalid FACILITATOR_PRIVATE_KEY");
    let facilitator_address = signer.address();

    let provider = ProviderBuilder::new()
        .wallet(alloy::network::EthereumWallet::from(signer))
        .connect_http(config.chain.rpc_url.parse().expect("invalid RPC_URL"));

    // Persistence is optional, but if configured it must open: starting
    // without it would silently forget reserved credit on restart.
    let store: Option<Arc<dyn KvStore>> = match &config.store_path {
        Some(path) => match SqliteKvStore::open(path, &config.store_prefix) {
            Ok(store) => {
                tracing::info!("persistence: sqlite at {path} (prefix {})", config.store_prefix);
                Some(Arc::new(store))
            }
            Err(e) => {
                tracing::error!("failed to open persistence store at {path}: {e}");
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!("no persistence configured; settlement state is in-memory only");
            None
        }
    };

    let limits = RiskLimits::from_usd(
        &config.chain,
        config.max_per_transaction_usd,
        config.max_pending_per_wallet_usd,
        config.daily_limit_per_wallet_usd,
    );
    let mut risk = RiskEngine::new(limits);
    if let Some(store) = &store {
        risk = risk.with_store(Arc::clone(store));
    }
    let risk = Arc::new(risk);
    match risk.load() {
        Ok(0) => {}
        Ok(restored) => tracing::info!(restored, "restored open settlements from the store"),
        Err(e) => tracing::warn!(error = %e, "settlement restore failed; starting empty"),
    }

    let chain: Arc<dyn ChainRpc> = Arc::new(EvmChainRpc::new(provider.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let fcr = if config.fcr.enabled {
        let client = Arc::new(HttpF3Client::new(config.chain.f3_rpc_url.clone()));
        let monitor = Arc::new(FcrMonitor::new(client, config.fcr.clone()));
        monitor.spawn(shutdown_rx.clone());
        Some(monitor)
    } else {
        tracing::warn!("fcr monitor disabled; settlements confirm on receipts only");
        None
    };

    let bond: Option<Arc<dyn BondLedger>> = config.bond_address.map(|address| {
        tracing::info!(%address, "bond commitments enabled");
        Arc::new(OnchainBondLedger::new(
            provider.clone(),
            address,
            facilitator_address,
        )) as Arc<dyn BondLedger>
    });
    if let Some(bond) = &bond {
        spawn_bond_alert(
            Arc::clone(bond),
            config.bond_alert_threshold_percent,
            shutdown_rx.clone(),
        );
    }

    let mut engine = SettlementEngine::new(
        Arc::clone(&chain),
        Arc::clone(&risk),
        config.chain.clone(),
        config.engine.clone(),
    );
    if let Some(bond) = &bond {
        engine = engine.with_bond(Arc::clone(bond));
    }
    if let Some(fcr) = &fcr {
        engine = engine.with_fcr(Arc::clone(fcr));
    }
    let engine = Arc::new(engine);
    engine.spawn_worker(shutdown_rx.clone());

    let vouchers = config.escrow_address.map(|address| {
        tracing::info!(%address, "deferred payments enabled");
        let escrow: Arc<dyn EscrowClient> = Arc::new(OnchainEscrow::new(provider.clone(), address));
        let mut voucher_store = VoucherStore::new(escrow, config.chain.chain_id, address);
        if let Some(store) = &store {
            voucher_store = voucher_store.with_store(Arc::clone(store));
        }
        Arc::new(voucher_store)
    });
    if let Some(vouchers) = &vouchers {
        vouchers.spawn_cleanup(shutdown_rx.clone());
    }

    let state = web::Data::new(AppState {
        engine,
        risk,
        chain,
        fcr,
        vouchers,
        chain_config: config.chain.clone(),
        config: config.clone(),
    });

    let host = config.host.clone();
    let port = config.port;
    tracing::info!("filpay facilitator listening on {host}:{port}");
    tracing::info!("facilitator address: {facilitator_address}");
    tracing::info!(
        chain_id = config.chain.chain_id,
        token = %config.chain.default_token,
        "chain configuration"
    );

    let governor_conf = GovernorConfigBuilder::default()
        .requests_per_minute(config.rate_limit_rpm)
        .finish()
        .expect("failed to build rate limiter config");

    let allowed_origins = config.allowed_origins.clone();
    let result = HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&allowed_origins))
            .wrap(Governor::new(&governor_conf))
            .wrap(from_fn(headers::fcr_headers))
            .app_data(state.clone())
            .app_data(web::JsonConfig::default().limit(65_536))
            .service(routes::verify)
            .service(routes::settle)
            .service(routes::settlement_status)
            .service(routes::health)
            .service(routes::fcr_status)
            .service(routes::fcr_levels)
            .service(routes::fcr_wait)
            .service(routes::deferred_buyer)
            .service(routes::store_voucher)
            .service(routes::settle_voucher)
            .service(routes::metrics_endpoint)
    })
    .bind((host.as_str(), port))?
    .run()
    .await;

    // Stop the pollers and the settlement worker at their next tick.
    let _ = shutdown_tx.send(true);
    result
}
