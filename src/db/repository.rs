//! Repository Ports
//!
//! 서비스 계층은 구체적인 DB 구현이 아니라 두 개의 좁은 trait에만 의존한다.
//!
//! - `ReadModel`: 조회 전용 ("크리에이터 조회", "활성 구독 조회" 등)
//! - `LedgerStore`: 원장 쓰기 경로 (pending row 생성, 웹훅 상태 전이)
//!
//! ```text
//! CheckoutService ──┐
//! Reconciler ───────┼──▶ ReadModel / LedgerStore ──▶ Database (PostgreSQL)
//! PayoutProcessor ──┘                             └─▶ MemoryLedger (테스트)
//! ```
//!
//! 웹훅 처리는 `LedgerStore::reconcile` 한 번의 호출로 끝난다.
//! 저장소가 row를 잠그고(`FOR UPDATE`), 순수 함수인 planner가 전이를 결정하고,
//! 저장소가 전이 + 잔액 변경 + 로그 추가를 하나의 트랜잭션으로 적용한다.

use async_trait::async_trait;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::models::*;
use crate::types::LedgerKind;

/// 조회 전용 포트
#[async_trait]
pub trait ReadModel: Send + Sync {
    /// 연결 상태 확인 (health check)
    async fn ping(&self) -> Result<()>;

    async fn get_creator(&self, creator_id: Uuid) -> Result<Option<CreatorAccount>>;

    async fn get_post(&self, post_id: Uuid) -> Result<Option<Post>>;

    async fn get_user_contact(&self, user_id: &str) -> Result<Option<UserContact>>;

    async fn get_default_wallet(&self, creator_id: Uuid) -> Result<Option<CreatorWallet>>;

    /// 결제 완료된 활성 구독
    async fn find_active_subscription(
        &self,
        user_id: &str,
        creator_id: Uuid,
    ) -> Result<Option<Subscription>>;

    async fn find_ppv_unlock(&self, user_id: &str, post_id: Uuid) -> Result<Option<PpvUnlock>>;

    /// pending / processing 상태의 payout
    async fn find_open_payout(&self, creator_id: Uuid) -> Result<Option<Payout>>;

    async fn list_open_payouts(&self) -> Result<Vec<Payout>>;

    /// pending_payout >= min_payout 인 크리에이터
    async fn list_payout_eligible_creators(&self, min_payout: Decimal) -> Result<Vec<CreatorAccount>>;

    /// [now, until] 사이에 만료되고 진행 중인 갱신이 없는 결제 완료 구독
    async fn list_renewal_candidates(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Subscription>>;
}

/// 원장 쓰기 포트
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert_subscription(&self, new: &NewSubscription) -> Result<Subscription>;

    /// checkout 생성 실패 시 보상 삭제
    async fn delete_subscription_by_order(&self, order_id: &str) -> Result<u64>;

    async fn insert_tip(&self, new: &NewTip) -> Result<Tip>;

    /// (user, post)당 한 row. 새 row를 만들거나, failed / expired로 닫힌 row만 새 주문으로 다시 연다.
    ///
    /// initiated / pending / completed row가 이미 있으면 건드리지 않고 None
    async fn open_ppv_unlock(&self, new: &NewPpvUnlock) -> Result<Option<PpvUnlock>>;

    /// `processing` 상태로 생성
    ///
    /// 같은 크리에이터의 열린(pending / processing) payout이 이미 있으면 None.
    /// 동시 호출 간 중복 방지는 저장소의 유일 제약이 맡는다.
    async fn insert_payout(&self, new: &NewPayout) -> Result<Option<Payout>>;

    async fn set_payout_transfer(&self, payout_id: Uuid, transfer_id: &str) -> Result<()>;

    /// 게이트웨이 호출 실패 → failed (이미 terminal이면 변경 없음)
    async fn fail_payout(&self, payout_id: Uuid) -> Result<()>;

    /// 갱신 주문 ID 태그 (None이면 해제)
    async fn tag_renewal(&self, subscription_id: Uuid, order_id: Option<&str>) -> Result<()>;

    /// 기간이 끝난 구독을 expired로 전환하고 구독자 수 감소.
    /// 진행 중인 갱신이 있으면 `stale_before` 이전에 끝난 구독만 대상
    async fn expire_lapsed_subscriptions(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<u64>;

    /// 웹훅 상태 전이 (원자적 단위)
    ///
    /// `reference`로 row를 찾아 잠그고 `planner` 결과를 같은 트랜잭션에서 적용.
    /// 같은 reference에 대한 동시 호출은 직렬화되고, 다른 reference끼리는 서로 막지 않는다.
    async fn reconcile(
        &self,
        kind: LedgerKind,
        reference: &str,
        planner: &Planner<'_>,
    ) -> Result<ReconcileOutcome>;
}

// ============ Reconciliation types ============

/// planner에 전달되는 잠긴 원장 row
#[derive(Debug, Clone)]
pub enum LedgerRow {
    Subscription {
        row: Subscription,
        /// reference가 renewal_order_id와 일치했는지
        matched_renewal: bool,
        /// 같은 (user, creator)의 다른 결제 완료 활성 구독
        active_sibling: Option<Subscription>,
    },
    Tip(Tip),
    Ppv(PpvUnlock),
    Payout(Payout),
}

/// planner 결과
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Apply(Transition),
    /// 이미 terminal → replay, no-op
    AlreadySettled,
    /// 알 수 없거나 처리하지 않는 이벤트 상태
    Ignored,
}

pub type Planner<'a> = dyn Fn(&LedgerRow) -> Plan + Send + Sync + 'a;

/// 하나의 웹훅이 만드는 전체 변경
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub update: RowUpdate,
    pub balance: Option<BalanceDelta>,
    pub log: Option<NewTransaction>,
}

/// 원장 row에 쓰는 상태 변경
#[derive(Debug, Clone, PartialEq)]
pub enum RowUpdate {
    SubscriptionActivated {
        id: Uuid,
        currency: String,
        network: String,
    },
    /// 이미 활성 구독이 있으면 결제 기간을 기존 구독에 합치고 이 row는 닫는다
    SubscriptionMerged {
        id: Uuid,
        into: Uuid,
        currency: String,
        network: String,
        extended_period_end: DateTime<Utc>,
        closed_at: DateTime<Utc>,
    },
    SubscriptionRenewed {
        id: Uuid,
        order_id: String,
        currency: String,
        network: String,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    },
    SubscriptionRenewalDropped {
        id: Uuid,
    },
    SubscriptionCancelled {
        id: Uuid,
        payment_status: PaymentStatus,
        cancelled_at: DateTime<Utc>,
    },
    TipSettled {
        id: Uuid,
        payment_status: PaymentStatus,
        currency: Option<String>,
    },
    PpvSettled {
        id: Uuid,
        payment_status: PaymentStatus,
        currency: Option<String>,
    },
    PayoutSent {
        id: Uuid,
        processed_at: DateTime<Utc>,
    },
    PayoutFailed {
        id: Uuid,
    },
}

/// 크리에이터 잔액 상대 변경 (read-modify-write 금지)
///
/// 적용 시 pending_payout / subscriber_count는 0 아래로 내려가지 않는다.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceDelta {
    pub creator_id: Uuid,
    pub pending_payout: Decimal,
    pub total_earnings: Decimal,
    pub subscriber_count: i32,
}

/// reconcile 호출 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// 일치하는 row 없음 (우리 주문이 아니거나 이미 정리됨)
    UnknownOrder,
    AlreadySettled,
    Ignored,
    Applied,
}

impl From<&Plan> for ReconcileOutcome {
    fn from(plan: &Plan) -> Self {
        match plan {
            Plan::Apply(_) => ReconcileOutcome::Applied,
            Plan::AlreadySettled => ReconcileOutcome::AlreadySettled,
            Plan::Ignored => ReconcileOutcome::Ignored,
        }
    }
}
