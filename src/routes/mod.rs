//! API Routes Module
//!
//! 모든 HTTP 엔드포인트 정의
//!
//! # Routes
//! - `/health` - 헬스 체크
//! - `/checkout/*` - 구매 시작 (구독, 팁, PPV)
//! - `/webhooks/:kind` - 게이트웨이 결제 결과 알림
//! - `/admin/payouts/*` - 크리에이터 정산
//! - `/cron/renew-subscriptions` - 구독 갱신 sweep

pub mod checkout;
pub mod cron;
pub mod health;
pub mod payout;
pub mod webhook;
