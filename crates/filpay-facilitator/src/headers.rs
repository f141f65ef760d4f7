//! Ambient fast-confirmation response headers.
//!
//! When the FCR monitor is running, every response carries the current
//! `X-FCR-Level`, `X-FCR-Instance`, and `X-FCR-Phase` so callers can gauge
//! chain confirmation freshness without an extra round trip.

use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::middleware::Next;
use actix_web::{web, Error};

use crate::state::AppState;

pub async fn fcr_headers(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let view = req
        .app_data::<web::Data<AppState>>()
        .and_then(|state| state.fcr.as_ref())
        .and_then(|monitor| monitor.status());

    let mut response = next.call(req).await?;

    if let Some(view) = view {
        let headers = response.headers_mut();
        headers.insert(
            HeaderName::from_static("x-fcr-level"),
            HeaderValue::from_static(view.level.as_str()),
        );
        if let Ok(value) = HeaderValue::from_str(&view.instance.to_string()) {
            headers.insert(HeaderName::from_static("x-fcr-instance"), value);
        }
        headers.insert(
            HeaderName::from_static("x-fcr-phase"),
            HeaderValue::from_static(view.phase),
        );
    }

    Ok(response)
}
