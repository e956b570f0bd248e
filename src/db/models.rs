//! Database Models
//!
//! Ledger rows for creator balances, purchases, payouts and the transaction log.
//! Money columns are NUMERIC(12,2) and always written through `types::round2`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============ Enums (Postgres enum types) ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "creator_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CreatorStatus {
    Pending,
    Active,
    Suspended,
    Banned,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sub_tier", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Standard,
    Vip,
}

/// 구독 자체의 생명주기
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sub_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
    Paused,
}

/// 현재 결제 시도의 생명주기 (SubscriptionStatus와 독립)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "crypto_pay_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Initiated,
    Pending,
    Completed,
    Failed,
    Expired,
}

impl PaymentStatus {
    /// 한 번 기록되면 다시 바뀌지 않는 상태
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Completed | PaymentStatus::Failed | PaymentStatus::Expired)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payout_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl PayoutStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PayoutStatus::Sent | PayoutStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Subscription,
    Ppv,
    Tip,
    Payout,
    Refund,
}

// ============ Read model rows ============

/// 크리에이터 계정 + 잔액
#[derive(Debug, Clone, FromRow)]
pub struct CreatorAccount {
    pub id: Uuid,
    /// 인증 계층의 user id
    pub user_id: String,
    pub standard_price: Decimal,
    pub vip_price: Decimal,
    pub status: CreatorStatus,
    /// 누적 수익 (감소하지 않음)
    pub total_earnings: Decimal,
    /// 미정산 잔액 (음수 불가)
    pub pending_payout: Decimal,
    pub subscriber_count: i32,
    pub updated_at: DateTime<Utc>,
}

impl CreatorAccount {
    pub fn price_for(&self, tier: SubscriptionTier) -> Decimal {
        match tier {
            SubscriptionTier::Standard => self.standard_price,
            SubscriptionTier::Vip => self.vip_price,
        }
    }
}

/// PPV 판매 가능 여부 판단에 필요한 게시물 정보
#[derive(Debug, Clone, FromRow)]
pub struct Post {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub is_locked: bool,
    pub ppv_price: Option<Decimal>,
}

/// checkout / payout payload에 들어가는 사용자 정보
#[derive(Debug, Clone, FromRow)]
pub struct UserContact {
    pub id: String,
    pub name: String,
    pub email: String,
}

/// 크리에이터 정산 지갑
#[derive(Debug, Clone, FromRow)]
pub struct CreatorWallet {
    pub id: Uuid,
    pub creator_id: Uuid,
    /// USDT, ETH, BNB ...
    pub currency: String,
    /// ERC20, BEP20, TRC20 ...
    pub network: String,
    pub address: String,
    pub is_default: bool,
}

// ============ Ledger rows ============

#[derive(Debug, Clone, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: String,
    pub creator_id: Uuid,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    /// 구독 시점 가격 (갱신도 이 가격으로 청구)
    pub price_at_subscription: Decimal,
    pub gateway_order_id: Option<String>,
    pub crypto_currency: Option<String>,
    pub crypto_network: Option<String>,
    pub payment_status: PaymentStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    /// 진행 중인 갱신 결제 주문 ID
    pub renewal_order_id: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// 결제까지 끝난 활성 구독인지
    pub fn is_paid_active(&self) -> bool {
        self.status == SubscriptionStatus::Active && self.payment_status == PaymentStatus::Completed
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Tip {
    pub id: Uuid,
    pub from_user_id: String,
    pub to_creator_id: Uuid,
    pub amount: Decimal,
    pub message: Option<String>,
    pub is_anonymous: bool,
    pub gateway_order_id: String,
    pub crypto_currency: Option<String>,
    pub payment_status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct PpvUnlock {
    pub id: Uuid,
    pub user_id: String,
    pub post_id: Uuid,
    /// 수익 귀속 대상 (posts.creator_id 복사본)
    pub creator_id: Uuid,
    pub amount_paid: Decimal,
    pub gateway_order_id: String,
    pub crypto_currency: Option<String>,
    pub payment_status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Payout {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub gross_amount: Decimal,
    pub platform_fee: Decimal,
    pub net_amount: Decimal,
    pub status: PayoutStatus,
    pub crypto_currency: String,
    pub crypto_network: String,
    pub destination_address: String,
    pub gateway_transfer_id: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============ Insert payloads ============

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: String,
    pub creator_id: Uuid,
    pub tier: SubscriptionTier,
    pub price: Decimal,
    pub order_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTip {
    pub from_user_id: String,
    pub to_creator_id: Uuid,
    pub amount: Decimal,
    pub message: Option<String>,
    pub is_anonymous: bool,
    pub order_id: String,
}

#[derive(Debug, Clone)]
pub struct NewPpvUnlock {
    pub user_id: String,
    pub post_id: Uuid,
    pub creator_id: Uuid,
    pub amount: Decimal,
    pub order_id: String,
}

#[derive(Debug, Clone)]
pub struct NewPayout {
    pub creator_id: Uuid,
    pub gross_amount: Decimal,
    pub platform_fee: Decimal,
    pub net_amount: Decimal,
    pub currency: String,
    pub network: String,
    pub destination_address: String,
}

/// 트랜잭션 로그 항목 (append-only, 수정/삭제 없음)
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    /// 결제한 사용자 (payout은 None)
    pub user_id: Option<String>,
    pub creator_id: Option<Uuid>,
    pub kind: TransactionType,
    pub amount: Decimal,
    pub description: String,
    pub external_ref: String,
}
