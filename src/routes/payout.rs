//! Admin Payout Endpoints
//!
//! 관리자 권한 확인은 앞단 계층에서 끝난 상태로 들어온다.

use axum::{extract::State, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::ApiError,
    services::{BatchPayoutSummary, PayoutReceipt, PendingPayoutView},
    AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePayoutRequest {
    pub creator_id: Uuid,
}

/// POST /admin/payouts/initiate
pub async fn initiate(
    State(state): State<AppState>,
    Json(req): Json<InitiatePayoutRequest>,
) -> Result<Json<PayoutReceipt>, ApiError> {
    let receipt = state.payouts.initiate_payout(req.creator_id).await?;
    Ok(Json(receipt))
}

/// POST /admin/payouts/batch
///
/// 부분 실패도 200. 크리에이터별 결과는 `results`에 담긴다.
pub async fn batch(State(state): State<AppState>) -> Result<Json<BatchPayoutSummary>, ApiError> {
    let summary = state.payouts.initiate_batch_payout().await?;
    Ok(Json(summary))
}

/// GET /admin/payouts/pending
pub async fn pending(State(state): State<AppState>) -> Result<Json<Vec<PendingPayoutView>>, ApiError> {
    let rows = state.payouts.pending_payouts().await?;
    Ok(Json(rows))
}
