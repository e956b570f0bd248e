//! Cron Endpoint
//!
//! 외부 스케줄러가 `x-cron-secret` 헤더와 함께 호출한다.

use axum::{extract::State, http::HeaderMap, Json};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{error::ApiError, services::RenewalSummary, AppState};

pub const CRON_SECRET_HEADER: &str = "x-cron-secret";

/// 상수 시간 비교 (두 값을 같은 키로 MAC 후 비교)
fn secret_matches(expected: &str, provided: &str) -> bool {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(b"cron-secret") else {
        return false;
    };
    mac.update(expected.as_bytes());
    let expected_tag = mac.finalize_reset().into_bytes();
    mac.update(provided.as_bytes());
    mac.verify_slice(&expected_tag).is_ok()
}

/// GET|POST /cron/renew-subscriptions
pub async fn renew_subscriptions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RenewalSummary>, ApiError> {
    let provided = headers
        .get(CRON_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    // secret 미설정이면 항상 거부
    let expected = state.config.cron_secret.as_str();
    if expected.is_empty() || !secret_matches(expected, provided) {
        tracing::warn!("Cron call rejected");
        return Err(ApiError::Unauthorized);
    }

    let summary = state.renewals.run(Utc::now()).await?;
    Ok(Json(summary))
}
