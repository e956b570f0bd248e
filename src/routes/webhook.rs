//! Gateway Webhook Endpoint
//!
//! body는 `Bytes`로 받는다. 서명은 원문 바이트에 대해 계산되므로
//! `Json<T>` extractor로 먼저 파싱하면 검증할 수 없다.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};

use crate::{error::ApiError, services::WebhookAck, types::LedgerKind, AppState};

pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

/// POST /webhooks/:kind
pub async fn receive(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let kind = LedgerKind::from_path(&kind)
        .ok_or_else(|| ApiError::NotFound(format!("Webhook '{}'", kind)))?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let ack = state.reconciler.handle(kind, &body, signature).await?;
    Ok(Json(ack))
}
