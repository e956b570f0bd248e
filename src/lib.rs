//! FanVault Ledger Library
//!
//! # Overview
//!
//! 크리에이터 구독 플랫폼의 결제 / 원장 정합성 코어.
//! 외부 결제 게이트웨이의 비동기 알림과 내부 원장(크리에이터 잔액, 구독 기간,
//! 트랜잭션 로그)을 일관되게 유지한다.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                            API                               │
//! │                                                              │
//! │   /checkout/*      /webhooks/:kind    /admin/payouts/*  /cron │
//! │        │                 │                  │            │    │
//! │  CheckoutService    Reconciler     PayoutProcessor  RenewalSweep
//! │        │                 │                  │            │    │
//! │        └────────┬────────┴─────────┬────────┴────────────┘    │
//! │                 ▼                  ▼                          │
//! │        ReadModel / LedgerStore   PaymentGateway               │
//! └─────────────────┼──────────────────┼──────────────────────────┘
//!                   ▼                  ▼
//!             PostgreSQL        crypto payment gateway
//! ```
//!
//! ## Modules
//!
//! - `config`: 환경 설정 + 원장 정책 (수수료율, 최소 payout)
//! - `error`: 에러 타입 및 HTTP 매핑
//! - `routes`: HTTP 엔드포인트 핸들러
//! - `services`: 게이트웨이 어댑터, checkout, reconciler, payout, 갱신
//! - `db`: 원장 저장소 (PostgreSQL)
//! - `types`: 금액 / 주문 ID 공통 타입
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fanvault_ledger::{config::Config, db::Database, services::GatewayClient, AppState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let db = Arc::new(Database::connect(&config.database_url).await?);
//!     let gateway = Arc::new(GatewayClient::new(&config.gateway, &config.public_url)?);
//!     let state = AppState::new(config, db.clone(), db, gateway)?;
//!
//!     // ... fanvault_ledger::create_router(state)
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod services;
pub mod types;

// Re-exports for convenience
pub use config::Config;
pub use db::Database;
pub use error::ApiError;

use db::{LedgerStore, ReadModel};
use services::{
    CheckoutService, PaymentGateway, PayoutProcessor, Reconciler, RenewalSweep, WebhookVerifier,
};

/// 애플리케이션 전역 상태
#[derive(Clone)]
pub struct AppState {
    pub read: Arc<dyn ReadModel>,
    pub config: Arc<Config>,
    pub checkout: Arc<CheckoutService>,
    pub reconciler: Arc<Reconciler>,
    pub payouts: Arc<PayoutProcessor>,
    pub renewals: Arc<RenewalSweep>,
}

impl AppState {
    /// 포트 구현체를 받아 서비스 조립
    pub fn new(
        config: Config,
        read: Arc<dyn ReadModel>,
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> anyhow::Result<Self> {
        let policy = config.policy.clone();
        let verifier = WebhookVerifier::new(&config.gateway.api_secret)?;

        Ok(Self {
            checkout: Arc::new(CheckoutService::new(
                read.clone(),
                ledger.clone(),
                gateway.clone(),
                policy.clone(),
                &config.public_url,
            )),
            reconciler: Arc::new(Reconciler::new(ledger.clone(), verifier, policy.clone())),
            payouts: Arc::new(PayoutProcessor::new(
                read.clone(),
                ledger.clone(),
                gateway.clone(),
                policy.clone(),
                &config.public_url,
            )),
            renewals: Arc::new(RenewalSweep::new(
                read.clone(),
                ledger,
                gateway,
                policy,
                &config.public_url,
            )),
            read,
            config: Arc::new(config),
        })
    }
}

/// 라우터 생성
///
/// # Route Structure
///
/// ```text
/// GET  /health                         - 서버 상태 확인
///
/// POST /checkout/subscribe             - 구독 checkout
/// POST /checkout/tip                   - 팁 checkout
/// POST /checkout/ppv                   - PPV 잠금 해제 checkout
///
/// POST /webhooks/:kind                 - 게이트웨이 웹훅 (subscription | tip | ppv | payout)
///
/// POST /admin/payouts/initiate         - 단일 크리에이터 payout
/// POST /admin/payouts/batch            - 배치 payout
/// GET  /admin/payouts/pending          - 진행 중 + 가상 payout 목록
///
/// GET|POST /cron/renew-subscriptions   - 갱신 sweep (x-cron-secret)
/// ```
pub fn create_router(state: AppState) -> Router {
    // CORS 설정
    // 프로덕션: ALLOWED_ORIGINS 도메인만 허용, 개발: localhost 허용
    let cors = if state.config.is_production() {
        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| state.config.public_url.clone());
        let origins: Vec<HeaderValue> = allowed_origins
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(routes::checkout::USER_ID_HEADER)])
    } else {
        let origins: Vec<HeaderValue> = [
            "http://localhost:3000", // Next.js dev server
            "http://127.0.0.1:3000",
        ]
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        // Health check
        .route("/health", get(routes::health::health_check))

        // Checkout
        .route("/checkout/subscribe", post(routes::checkout::subscribe))
        .route("/checkout/tip", post(routes::checkout::tip))
        .route("/checkout/ppv", post(routes::checkout::unlock_ppv))

        // Gateway webhooks
        .route("/webhooks/:kind", post(routes::webhook::receive))

        // Payouts (admin)
        .route("/admin/payouts/initiate", post(routes::payout::initiate))
        .route("/admin/payouts/batch", post(routes::payout::batch))
        .route("/admin/payouts/pending", get(routes::payout::pending))

        // Cron
        .route(
            "/cron/renew-subscriptions",
            get(routes::cron::renew_subscriptions).post(routes::cron::renew_subscriptions),
        )

        // 미들웨어
        .layer(TraceLayer::new_for_http())
        .layer(cors)

        // 상태 주입
        .with_state(state)
}
