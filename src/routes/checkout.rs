//! Checkout Endpoints
//!
//! 구독 / 팁 / PPV 구매를 시작하고 게이트웨이 checkout URL을 돌려준다.
//! 호출자 식별은 앞단 인증 계층이 넣어주는 `x-user-id` 헤더를 그대로 신뢰한다.

use axum::{
    async_trait,
    extract::{FromRequestParts, State},
    http::request::Parts,
    Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    db::SubscriptionTier,
    error::ApiError,
    services::{CheckoutOutcome, TipIntent},
    AppState,
};

pub const USER_ID_HEADER: &str = "x-user-id";

/// 인증 계층이 확인한 호출자 user id
#[derive(Debug, Clone)]
pub struct CallerId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| CallerId(v.to_string()))
            .ok_or(ApiError::Unauthorized)
    }
}

// ============ Request Types ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub creator_id: Uuid,
    pub tier: SubscriptionTier,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TipRequest {
    pub creator_id: Uuid,
    pub amount_usd: Decimal,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub is_anonymous: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PpvRequest {
    pub post_id: Uuid,
}

// ============ Handlers ============

/// POST /checkout/subscribe
pub async fn subscribe(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Json(req): Json<SubscribeRequest>,
) -> Result<Json<CheckoutOutcome>, ApiError> {
    let outcome = state
        .checkout
        .initiate_subscription(&user_id, req.creator_id, req.tier)
        .await?;
    Ok(Json(outcome))
}

/// POST /checkout/tip
pub async fn tip(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Json(req): Json<TipRequest>,
) -> Result<Json<CheckoutOutcome>, ApiError> {
    let intent = TipIntent {
        creator_id: req.creator_id,
        amount_usd: req.amount_usd,
        message: req.message,
        is_anonymous: req.is_anonymous,
    };
    let outcome = state.checkout.initiate_tip(&user_id, intent).await?;
    Ok(Json(outcome))
}

/// POST /checkout/ppv
pub async fn unlock_ppv(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Json(req): Json<PpvRequest>,
) -> Result<Json<CheckoutOutcome>, ApiError> {
    let outcome = state.checkout.initiate_ppv_unlock(&user_id, req.post_id).await?;
    Ok(Json(outcome))
}
