use actix_web::{get, post, web, HttpResponse};
use alloy::primitives::{Address, B256};
use serde::Deserialize;
use std::time::Duration;

use filpay::fcr::{level_catalogue, ConfirmationLevel, FcrInfo};
use filpay::payment::reason;
use filpay::voucher::{VoucherData, VoucherError};
use filpay::PaymentRequest;

use crate::metrics;
use crate::state::AppState;

#[post("/verify")]
pub async fn verify(state: web::Data<AppState>, body: web::Json<PaymentRequest>) -> HttpResponse {
    let PaymentRequest {
        payment,
        requirements,
    } = body.into_inner();

    match state.engine.verify(&payment, &requirements).await {
        Ok(response) if response.valid => {
            metrics::VERIFY_REQUESTS.with_label_values(&["valid"]).inc();
            HttpResponse::Ok().json(response)
        }
        Ok(response) => {
            metrics::VERIFY_REQUESTS
                .with_label_values(&["rejected"])
                .inc();
            tracing::info!(
                payer = %payment.from,
                reason = response.reason.as_deref().unwrap_or("unknown"),
                "verification rejected"
            );
            HttpResponse::BadRequest().json(response)
        }
        // Malformed values and signatures are client-correctable.
        Err(filpay::FacilitatorError::InvalidPayment(detail))
        | Err(filpay::FacilitatorError::Signature(detail)) => {
            metrics::VERIFY_REQUESTS
                .with_label_values(&["rejected"])
                .inc();
            HttpResponse::BadRequest().json(serde_json::json!({
                "valid": false,
                "riskScore": 0,
                "reason": format!("invalid_payment: {detail}"),
            }))
        }
        Err(e) => {
            metrics::VERIFY_REQUESTS.with_label_values(&["error"]).inc();
            tracing::error!(error = %e, "verification internal error");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "valid": false,
                "riskScore": 0,
                "reason": reason::INTERNAL_ERROR,
            }))
        }
    }
}

#[post("/settle")]
pub async fn settle(state: web::Data<AppState>, body: web::Json<PaymentRequest>) -> HttpResponse {
    let PaymentRequest {
        payment,
        requirements,
    } = body.into_inner();

    let start = std::time::Instant::now();
    match state.engine.settle(&payment, &requirements).await {
        Ok(response) => {
            let elapsed = start.elapsed().as_secs_f64();
            if response.success {
                metrics::SETTLE_REQUESTS
                    .with_label_values(&["success"])
                    .inc();
                metrics::SETTLE_LATENCY
                    .with_label_values(&["success"])
                    .observe(elapsed);
                HttpResponse::Ok().json(response)
            } else {
                metrics::SETTLE_REQUESTS
                    .with_label_values(&["rejected"])
                    .inc();
                metrics::SETTLE_LATENCY
                    .with_label_values(&["rejected"])
                    .observe(elapsed);
                tracing::warn!(
                    payer = %payment.from,
                    error = response.error.as_deref().unwrap_or("unknown"),
                    "settlement rejected"
                );
                HttpResponse::BadRequest().json(response)
            }
        }
        Err(filpay::FacilitatorError::InvalidPayment(detail))
        | Err(filpay::FacilitatorError::Signature(detail)) => {
            metrics::SETTLE_REQUESTS
                .with_label_values(&["rejected"])
                .inc();
            HttpResponse::BadRequest().json(serde_json::json!({
                "success": false,
                "error": format!("invalid_payment: {detail}"),
            }))
        }
        Err(e) => {
            metrics::SETTLE_REQUESTS.with_label_values(&["error"]).inc();
            tracing::error!(error = %e, "settlement internal error");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "success": false,
                "error": reason::INTERNAL_ERROR,
            }))
        }
    }
}

#[get("/settle/{payment_id}")]
pub async fn settlement_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let Ok(id) = path.into_inner().parse::<B256>() else {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "invalid payment id"
        }));
    };

    match state.risk.settlement(id) {
        Some(record) => HttpResponse::Ok().json(serde_json::json!({
            "paymentId": record.payment_id,
            "status": record.status,
            "transactionHandle": record.transaction_handle,
            "attempts": record.attempts,
            "createdAt": record.created_at,
            "updatedAt": record.updated_at,
            "error": record.last_error,
            "fcr": FcrInfo::from_record(&record),
        })),
        None => HttpResponse::NotFound().json(serde_json::json!({
            "error": "settlement not found"
        })),
    }
}

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let height = state.chain.current_height().await.ok();
    let (pending_count, pending_total, pending_wallets) = state.engine.pending_summary();
    let limits = state.risk.limits();

    let body = serde_json::json!({
        "service": "filpay-facilitator",
        "status": if height.is_some() { "ok" } else { "degraded" },
        "chain": {
            "chainId": state.chain_config.chain_id,
            "network": state.chain_config.network,
            "connected": height.is_some(),
            "height": height,
        },
        "settlements": {
            "pending": pending_count,
            "pendingAmount": pending_total.to_string(),
            "pendingWallets": pending_wallets,
        },
        "limits": {
            "maxPerTransaction": limits.max_per_transaction.to_string(),
            "maxPendingPerWallet": limits.max_pending_per_wallet.to_string(),
            "dailyLimitPerWallet": limits.daily_limit_per_wallet.to_string(),
        },
    });

    if height.is_some() {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

#[get("/fcr/status")]
pub async fn fcr_status(state: web::Data<AppState>) -> HttpResponse {
    match &state.fcr {
        None => HttpResponse::Ok().json(serde_json::json!({ "enabled": false })),
        Some(monitor) => match monitor.status() {
            Some(view) => HttpResponse::Ok().json(serde_json::json!({
                "enabled": true,
                "instance": view.instance,
                "round": view.round,
                "phase": view.phase,
                "phaseStartMs": view.phase_start_ms,
                "roundBumps": view.round_bumps,
                "level": view.level,
            })),
            None => HttpResponse::Ok().json(serde_json::json!({
                "enabled": true,
                "level": ConfirmationLevel::L0,
            })),
        },
    }
}

#[get("/fcr/levels")]
pub async fn fcr_levels() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "levels": level_catalogue() }))
}

#[derive(Deserialize)]
pub struct WaitQuery {
    timeout: Option<u64>,
}

#[get("/fcr/wait/{level}")]
pub async fn fcr_wait(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<WaitQuery>,
) -> HttpResponse {
    let Some(level) = ConfirmationLevel::parse(&path.into_inner()) else {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "unknown confirmation level"
        }));
    };
    let Some(monitor) = &state.fcr else {
        return HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "error": "fcr monitor disabled"
        }));
    };

    let timeout = query
        .timeout
        .map(Duration::from_millis)
        .unwrap_or(monitor.config().confirmation_timeout);

    if monitor.wait_for_level(level, timeout).await {
        HttpResponse::Ok().json(serde_json::json!({
            "level": level,
            "reached": true,
        }))
    } else {
        HttpResponse::RequestTimeout().json(serde_json::json!({
            "level": level,
            "reached": false,
            "error": "timeout",
        }))
    }
}

#[get("/deferred/buyers/{addr}")]
pub async fn deferred_buyer(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let Some(store) = &state.vouchers else {
        return deferred_disabled();
    };
    let Ok(buyer) = path.into_inner().parse::<Address>() else {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "invalid buyer address"
        }));
    };

    let account = match store.escrow().get_account(buyer).await {
        Ok(account) => account,
        Err(e) => {
            tracing::warn!(buyer = %buyer, error = %e, "escrow account read failed");
            return HttpResponse::BadGateway().json(serde_json::json!({
                "error": "escrow unavailable"
            }));
        }
    };

    let vouchers = store.list_for_buyer(buyer);
    HttpResponse::Ok().json(serde_json::json!({
        "balance": account.balance.to_string(),
        "thawingAmount": account.thawing_amount.to_string(),
        "thawEndTime": account.thaw_end_time,
        "voucherCount": vouchers.len(),
        "vouchers": vouchers,
    }))
}

#[post("/deferred/vouchers")]
pub async fn store_voucher(
    state: web::Data<AppState>,
    body: web::Json<VoucherData>,
) -> HttpResponse {
    let Some(store) = &state.vouchers else {
        return deferred_disabled();
    };

    match store.store_voucher(body.into_inner()).await {
        Ok(()) => {
            metrics::VOUCHER_REQUESTS
                .with_label_values(&["store", "success"])
                .inc();
            HttpResponse::Ok().json(serde_json::json!({ "success": true }))
        }
        Err(e) => {
            metrics::VOUCHER_REQUESTS
                .with_label_values(&["store", "rejected"])
                .inc();
            voucher_error_response(e)
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleVoucherRequest {
    pub buyer: Address,
    pub seller: Address,
}

#[post("/deferred/vouchers/{id}/settle")]
pub async fn settle_voucher(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<SettleVoucherRequest>,
) -> HttpResponse {
    let Some(store) = &state.vouchers else {
        return deferred_disabled();
    };
    let Ok(id) = path.into_inner().parse::<B256>() else {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "invalid voucher id"
        }));
    };

    match store.settle_voucher(id, body.buyer, body.seller).await {
        Ok(tx) => {
            metrics::VOUCHER_REQUESTS
                .with_label_values(&["settle", "success"])
                .inc();
            HttpResponse::Ok().json(serde_json::json!({
                "success": true,
                "voucherId": id,
                "transactionHandle": tx,
            }))
        }
        Err(e) => {
            metrics::VOUCHER_REQUESTS
                .with_label_values(&["settle", "rejected"])
                .inc();
            voucher_error_response(e)
        }
    }
}

fn voucher_error_response(e: VoucherError) -> HttpResponse {
    match e {
        VoucherError::Stale(detail) => HttpResponse::BadRequest().json(serde_json::json!({
            "error": reason::STALE_VOUCHER,
            "detail": detail,
        })),
        VoucherError::Invalid(detail) => HttpResponse::BadRequest().json(serde_json::json!({
            "error": "invalid_voucher",
            "detail": detail,
        })),
        VoucherError::InvalidSignature => HttpResponse::BadRequest().json(serde_json::json!({
            "error": reason::INVALID_SIGNATURE,
        })),
        VoucherError::NotFound => HttpResponse::NotFound().json(serde_json::json!({
            "error": "voucher not found",
        })),
        VoucherError::AlreadySettled => HttpResponse::BadRequest().json(serde_json::json!({
            "error": "voucher_already_settled",
        })),
        VoucherError::Other(inner) => {
            tracing::error!(error = %inner, "voucher operation failed");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "success": false,
                "error": reason::INTERNAL_ERROR,
            }))
        }
    }
}

fn deferred_disabled() -> HttpResponse {
    HttpResponse::ServiceUnavailable().json(serde_json::json!({
        "error": "deferred payments not enabled"
    }))
}

#[get("/metrics")]
pub async fn metrics_endpoint(state: web::Data<AppState>) -> HttpResponse {
    let (pending, _, _) = state.engine.pending_summary();
    metrics::PENDING_SETTLEMENTS.set(pending as i64);
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output())
}
