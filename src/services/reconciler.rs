//! Webhook Reconciler
//!
//! 게이트웨이의 비동기 결제 결과 알림을 원장 상태 전이로 바꾸는 상태 머신.
//!
//! ```text
//! raw body + signature
//!        │
//!        ▼
//!  verify (HMAC) ──✗──▶ 401, 원장 변경 없음
//!        │
//!        ▼
//!  parse JSON ─────✗──▶ 400
//!        │
//!        ▼
//!  LedgerStore::reconcile(kind, order_id, plan)
//!        │   row 잠금 → plan() → 전이 + 잔액 delta + 로그 (한 트랜잭션)
//!        ▼
//!  { received: true }   (unknown order / replay / 모르는 status 포함)
//! ```
//!
//! # Interview Q&A
//!
//! Q: 같은 웹훅이 두 번 오면?
//! A: 두 번째 호출은 잠긴 row가 이미 terminal 상태임을 보고 `AlreadySettled`
//!    - 잔액 변경 0회 추가, 로그 0건 추가
//!    - 게이트웨이에는 동일하게 200 응답
//!
//! Q: unknown order id에 200을 주는 이유는?
//! A: non-2xx는 게이트웨이 재시도를 유발
//!    - 우리 주문이 아니거나 이미 정리된 주문은 재시도해도 결과가 같음
//!    - 재시도는 일시적 장애(DB 오류 등)에만 의미가 있음
//!
//! Q: 두 팁이 같은 크리에이터에게 동시에 완료되면?
//! A: 잔액은 상대 delta (`pending_payout + X`)로 적용
//!    - read-modify-write가 아니므로 lost update 없음
//!    - row 잠금은 order id 단위, 서로 다른 주문은 서로 막지 않음

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::gateway::WebhookVerifier;
use crate::config::LedgerPolicy;
use crate::db::{
    BalanceDelta, LedgerRow, LedgerStore, NewTransaction, PaymentStatus, Plan, ReconcileOutcome,
    RowUpdate, Subscription, TransactionType, Transition,
};
use crate::error::ApiError;
use crate::types::{add_billing_period, LedgerKind};

// ============ Inbound event ============

/// 게이트웨이가 보고하는 결제 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Completed,
    Failed,
    Expired,
    Pending,
    /// 아직 모르는 이벤트 타입
    #[serde(other)]
    Unknown,
}

/// 웹훅 본문
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    /// payout 웹훅은 `payoutId`로 보낼 수 있음
    #[serde(alias = "payoutId")]
    pub order_id: String,
    pub status: EventStatus,
    #[serde(default)]
    pub amount: Option<String>,
    /// 결제에 쓰인 crypto (USDT ...)
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl WebhookEvent {
    /// "USDT on TRC20"
    fn settled_via(&self) -> String {
        let currency = if self.currency.is_empty() { "crypto" } else { &self.currency };
        let network = if self.network.is_empty() { "unknown network" } else { &self.network };
        format!("{} on {}", currency, network)
    }
}

/// 게이트웨이 응답 본문
#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(skip)]
    pub outcome: ReconcileOutcome,
}

// ============ Reconciler ============

pub struct Reconciler {
    ledger: Arc<dyn LedgerStore>,
    verifier: WebhookVerifier,
    policy: LedgerPolicy,
}

impl Reconciler {
    pub fn new(ledger: Arc<dyn LedgerStore>, verifier: WebhookVerifier, policy: LedgerPolicy) -> Self {
        Self { ledger, verifier, policy }
    }

    /// 웹훅 한 건 처리
    ///
    /// 서명 검증이 JSON 파싱보다 항상 먼저 실행된다.
    pub async fn handle(
        &self,
        kind: LedgerKind,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookAck, ApiError> {
        let verified = signature
            .filter(|s| !s.is_empty())
            .map(|s| self.verifier.verify(raw_body, s))
            .unwrap_or(false);
        if !verified {
            tracing::warn!(%kind, "Webhook signature rejected");
            return Err(ApiError::Unauthorized);
        }

        let event: WebhookEvent = serde_json::from_slice(raw_body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;
        if event.order_id.is_empty() {
            return Err(ApiError::BadRequest("Missing orderId".to_string()));
        }

        let now = Utc::now();
        let policy = &self.policy;
        let planner = |row: &LedgerRow| plan(row, &event, policy, now);
        let outcome = self.ledger.reconcile(kind, &event.order_id, &planner).await?;

        match outcome {
            ReconcileOutcome::Applied => {
                tracing::info!(%kind, order_id = %event.order_id, status = ?event.status, "Webhook applied")
            }
            ReconcileOutcome::AlreadySettled => {
                tracing::info!(%kind, order_id = %event.order_id, "Webhook replay ignored")
            }
            ReconcileOutcome::UnknownOrder => {
                tracing::warn!(%kind, order_id = %event.order_id, "Webhook for unknown order")
            }
            ReconcileOutcome::Ignored => {
                tracing::debug!(%kind, order_id = %event.order_id, status = ?event.status, "Webhook status ignored")
            }
        }

        Ok(WebhookAck { received: true, outcome })
    }
}

// ============ Planner ============

/// 잠긴 row + 이벤트 → 적용할 전이 (순수 함수)
pub fn plan(row: &LedgerRow, event: &WebhookEvent, policy: &LedgerPolicy, now: DateTime<Utc>) -> Plan {
    match row {
        LedgerRow::Subscription { row, matched_renewal: true, active_sibling } => {
            plan_renewal(row, active_sibling.as_ref(), event, policy, now)
        }
        LedgerRow::Subscription { row, matched_renewal: false, active_sibling } => {
            plan_subscription(row, active_sibling.as_ref(), event, policy, now)
        }
        LedgerRow::Tip(tip) => {
            if tip.payment_status.is_terminal() {
                return Plan::AlreadySettled;
            }
            match event.status {
                EventStatus::Completed => Plan::Apply(Transition {
                    update: RowUpdate::TipSettled {
                        id: tip.id,
                        payment_status: PaymentStatus::Completed,
                        currency: Some(event.currency.clone()),
                    },
                    balance: Some(credit(tip.to_creator_id, tip.amount, 0)),
                    log: Some(NewTransaction {
                        user_id: Some(tip.from_user_id.clone()),
                        creator_id: Some(tip.to_creator_id),
                        kind: TransactionType::Tip,
                        amount: tip.amount,
                        description: format!("Tip sent in {}", event.settled_via()),
                        external_ref: event.order_id.clone(),
                    }),
                }),
                EventStatus::Failed | EventStatus::Expired => Plan::Apply(Transition {
                    update: RowUpdate::TipSettled {
                        id: tip.id,
                        payment_status: failure_status(event.status),
                        currency: None,
                    },
                    balance: None,
                    log: None,
                }),
                EventStatus::Pending | EventStatus::Unknown => Plan::Ignored,
            }
        }
        LedgerRow::Ppv(unlock) => {
            if unlock.payment_status.is_terminal() {
                return Plan::AlreadySettled;
            }
            match event.status {
                EventStatus::Completed => Plan::Apply(Transition {
                    update: RowUpdate::PpvSettled {
                        id: unlock.id,
                        payment_status: PaymentStatus::Completed,
                        currency: Some(event.currency.clone()),
                    },
                    // PPV도 완료 시점에 수익 인식 (팁 / 구독과 동일)
                    balance: Some(credit(unlock.creator_id, unlock.amount_paid, 0)),
                    log: Some(NewTransaction {
                        user_id: Some(unlock.user_id.clone()),
                        creator_id: Some(unlock.creator_id),
                        kind: TransactionType::Ppv,
                        amount: unlock.amount_paid,
                        description: format!("PPV unlock in {}", event.settled_via()),
                        external_ref: event.order_id.clone(),
                    }),
                }),
                EventStatus::Failed | EventStatus::Expired => Plan::Apply(Transition {
                    update: RowUpdate::PpvSettled {
                        id: unlock.id,
                        payment_status: failure_status(event.status),
                        currency: None,
                    },
                    balance: None,
                    log: None,
                }),
                EventStatus::Pending | EventStatus::Unknown => Plan::Ignored,
            }
        }
        LedgerRow::Payout(payout) => {
            if payout.status.is_terminal() {
                return Plan::AlreadySettled;
            }
            match event.status {
                EventStatus::Completed => Plan::Apply(Transition {
                    update: RowUpdate::PayoutSent { id: payout.id, processed_at: now },
                    // net 만큼 차감, 저장소가 0에서 바닥 처리
                    balance: Some(BalanceDelta {
                        creator_id: payout.creator_id,
                        pending_payout: -payout.net_amount,
                        total_earnings: Decimal::ZERO,
                        subscriber_count: 0,
                    }),
                    log: Some(NewTransaction {
                        user_id: None,
                        creator_id: Some(payout.creator_id),
                        kind: TransactionType::Payout,
                        amount: payout.net_amount,
                        description: format!(
                            "Payout sent in {} on {}",
                            payout.crypto_currency, payout.crypto_network
                        ),
                        external_ref: event.order_id.clone(),
                    }),
                }),
                EventStatus::Failed | EventStatus::Expired => Plan::Apply(Transition {
                    update: RowUpdate::PayoutFailed { id: payout.id },
                    balance: None,
                    log: None,
                }),
                EventStatus::Pending | EventStatus::Unknown => Plan::Ignored,
            }
        }
    }
}

fn plan_subscription(
    sub: &Subscription,
    sibling: Option<&Subscription>,
    event: &WebhookEvent,
    policy: &LedgerPolicy,
    now: DateTime<Utc>,
) -> Plan {
    if sub.payment_status.is_terminal() {
        return Plan::AlreadySettled;
    }

    match event.status {
        EventStatus::Completed => {
            if let Some(sibling) = sibling {
                return merge_into(sub, sibling, event, policy, now);
            }
            Plan::Apply(Transition {
                update: RowUpdate::SubscriptionActivated {
                    id: sub.id,
                    currency: event.currency.clone(),
                    network: event.network.clone(),
                },
                balance: Some(credit(sub.creator_id, sub.price_at_subscription, 1)),
                log: Some(subscription_log(sub, event, "Subscription payment")),
            })
        }
        EventStatus::Failed | EventStatus::Expired => Plan::Apply(Transition {
            update: RowUpdate::SubscriptionCancelled {
                id: sub.id,
                payment_status: failure_status(event.status),
                cancelled_at: now,
            },
            balance: None,
            log: None,
        }),
        EventStatus::Pending | EventStatus::Unknown => Plan::Ignored,
    }
}

/// `renewal_order_id`로 매칭된 갱신 결제
fn plan_renewal(
    sub: &Subscription,
    sibling: Option<&Subscription>,
    event: &WebhookEvent,
    policy: &LedgerPolicy,
    now: DateTime<Utc>,
) -> Plan {
    match event.status {
        EventStatus::Completed => {
            if let Some(sibling) = sibling {
                return merge_into(sub, sibling, event, policy, now);
            }

            // 아직 활성이면 기존 기간 끝에서 이어 붙이고, 만료됐으면 지금부터
            let was_active = sub.is_paid_active();
            let period_start = if was_active { sub.current_period_end } else { now };
            let Some(period_end) = add_billing_period(period_start, policy.billing_period_months) else {
                return Plan::Ignored;
            };

            Plan::Apply(Transition {
                update: RowUpdate::SubscriptionRenewed {
                    id: sub.id,
                    order_id: event.order_id.clone(),
                    currency: event.currency.clone(),
                    network: event.network.clone(),
                    period_start,
                    period_end,
                },
                balance: Some(credit(
                    sub.creator_id,
                    sub.price_at_subscription,
                    if was_active { 0 } else { 1 },
                )),
                log: Some(subscription_log(sub, event, "Subscription renewal")),
            })
        }
        // 갱신 태그만 해제, 구독은 기간 만료 시 expired 처리
        EventStatus::Failed | EventStatus::Expired => Plan::Apply(Transition {
            update: RowUpdate::SubscriptionRenewalDropped { id: sub.id },
            balance: None,
            log: None,
        }),
        EventStatus::Pending | EventStatus::Unknown => Plan::Ignored,
    }
}

/// 같은 (user, creator)에 이미 결제된 활성 구독이 있으면
/// 이번 결제 기간을 그 구독에 더하고 이 row는 닫는다
fn merge_into(
    sub: &Subscription,
    sibling: &Subscription,
    event: &WebhookEvent,
    policy: &LedgerPolicy,
    now: DateTime<Utc>,
) -> Plan {
    let base = sibling.current_period_end.max(now);
    let Some(extended_period_end) = add_billing_period(base, policy.billing_period_months) else {
        return Plan::Ignored;
    };

    Plan::Apply(Transition {
        update: RowUpdate::SubscriptionMerged {
            id: sub.id,
            into: sibling.id,
            currency: event.currency.clone(),
            network: event.network.clone(),
            extended_period_end,
            closed_at: now,
        },
        balance: Some(credit(sub.creator_id, sub.price_at_subscription, 0)),
        log: Some(subscription_log(sub, event, "Subscription payment")),
    })
}

fn subscription_log(sub: &Subscription, event: &WebhookEvent, label: &str) -> NewTransaction {
    NewTransaction {
        user_id: Some(sub.user_id.clone()),
        creator_id: Some(sub.creator_id),
        kind: TransactionType::Subscription,
        amount: sub.price_at_subscription,
        description: format!("{} in {}", label, event.settled_via()),
        external_ref: event.order_id.clone(),
    }
}

/// 수익 인식: pending_payout과 total_earnings 모두 증가
fn credit(creator_id: uuid::Uuid, amount: Decimal, subscribers: i32) -> BalanceDelta {
    BalanceDelta {
        creator_id,
        pending_payout: amount,
        total_earnings: amount,
        subscriber_count: subscribers,
    }
}

fn failure_status(status: EventStatus) -> PaymentStatus {
    match status {
        EventStatus::Expired => PaymentStatus::Expired,
        _ => PaymentStatus::Failed,
    }
}
