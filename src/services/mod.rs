//! Services Module
//!
//! 원장 정합성을 담당하는 서비스 레이어
//!
//! # Services
//! - `gateway`: 외부 결제 게이트웨이 어댑터 (checkout, payout, 웹훅 서명)
//! - `CheckoutService`: 구독 / 팁 / PPV 구매 시작
//! - `Reconciler`: 웹훅 → 원장 상태 전이
//! - `PayoutProcessor`: 단건 / 배치 payout
//! - `RenewalSweep`: 구독 갱신 cron

mod checkout;
pub mod gateway;
mod payout;
mod reconciler;
mod renewal;

pub use checkout::{CheckoutOutcome, CheckoutService, TipIntent};
pub use gateway::{
    CheckoutRequest, GatewayClient, GatewayError, PayloadCipher, PaymentGateway, PayoutRequest,
    WebhookVerifier,
};
pub use payout::{
    BatchItemStatus, BatchPayoutResult, BatchPayoutSummary, PayoutProcessor, PayoutReceipt,
    PayoutSplit, PendingPayoutView,
};
pub use reconciler::{EventStatus, Reconciler, WebhookAck, WebhookEvent};
pub use renewal::{RenewalSummary, RenewalSweep};
