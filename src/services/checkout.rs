//! Checkout Initiators
//!
//! 구독 / 팁 / PPV 잠금 해제, 세 가지 구매 흐름.
//!
//! ```text
//! validate target ─▶ already satisfied? ─▶ order id ─▶ INSERT initiated row ─▶ create_checkout
//!                          │                                                        │
//!                          ▼                                                        ▼ (실패)
//!                  AlreadySatisfied                                 subscribe: row 삭제
//!                                                                   tip / ppv: row 유지
//! ```
//!
//! PPV는 (user, post)당 row 하나. 아직 열려 있는 주문이 있으면 새 order id를
//! 만들지 않고 그 주문으로 checkout을 다시 요청한다. 어느 checkout으로 결제해도
//! 웹훅이 같은 row를 찾는다. failed / expired로 닫힌 시도만 새 주문으로 다시 연다.
//!
//! # Interview Q&A
//!
//! Q: 왜 게이트웨이 호출 전에 row를 먼저 만드는가?
//! A: 웹훅이 HTTP 응답보다 먼저 도착할 수 있음
//!    - row가 없으면 Reconciler는 "unknown order"로 응답하고 끝
//!    - 사용자는 돈을 냈는데 원장에는 기록이 없는 상태가 됨
//!
//! Q: 구독만 실패 시 row를 지우는 이유는?
//! A: 구독 row는 status = active로 생성됨
//!    - 남겨두면 "구독 중"으로 보일 수 있음
//!    - 팁 / PPV의 initiated row는 아무 권한도 주지 않으므로 남겨도 무해

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use super::gateway::{CheckoutRequest, PaymentGateway};
use crate::config::LedgerPolicy;
use crate::db::{
    CreatorStatus, LedgerStore, NewPpvUnlock, NewSubscription, NewTip, PaymentStatus,
    ReadModel, SubscriptionTier, UserContact,
};
use crate::error::ApiError;
use crate::types::{add_billing_period, format_usd, round2, LedgerKind, OrderId};

/// checkout 흐름의 결과
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CheckoutOutcome {
    #[serde(rename_all = "camelCase")]
    Redirect { checkout_url: String, order_id: String },
    /// 이미 같은 구매가 완료된 상태 (에러 아님)
    #[serde(rename_all = "camelCase")]
    AlreadySatisfied {
        already_satisfied: bool,
        reason: String,
    },
}

impl CheckoutOutcome {
    fn already(reason: &str) -> Self {
        CheckoutOutcome::AlreadySatisfied {
            already_satisfied: true,
            reason: reason.to_string(),
        }
    }
}

/// 팁 요청
#[derive(Debug, Clone)]
pub struct TipIntent {
    pub creator_id: Uuid,
    pub amount_usd: Decimal,
    pub message: Option<String>,
    pub is_anonymous: bool,
}

/// 구매 흐름 서비스
pub struct CheckoutService {
    read: Arc<dyn ReadModel>,
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    policy: LedgerPolicy,
    public_url: String,
}

impl CheckoutService {
    pub fn new(
        read: Arc<dyn ReadModel>,
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        policy: LedgerPolicy,
        public_url: &str,
    ) -> Self {
        Self {
            read,
            ledger,
            gateway,
            policy,
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn webhook_url(&self, kind: LedgerKind) -> String {
        webhook_url(&self.public_url, kind)
    }

    async fn payer(&self, user_id: &str) -> Result<UserContact, ApiError> {
        self.read
            .get_user_contact(user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("User".to_string()))
    }

    // ============ Subscribe ============

    /// 구독 checkout
    pub async fn initiate_subscription(
        &self,
        user_id: &str,
        creator_id: Uuid,
        tier: SubscriptionTier,
    ) -> Result<CheckoutOutcome, ApiError> {
        let creator = self
            .read
            .get_creator(creator_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Creator".to_string()))?;

        if creator.status != CreatorStatus::Active {
            return Err(ApiError::ValidationError(
                "Creator is not accepting subscriptions".to_string(),
            ));
        }

        if self
            .read
            .find_active_subscription(user_id, creator_id)
            .await?
            .is_some()
        {
            tracing::info!(user_id, %creator_id, "Subscription already active");
            return Ok(CheckoutOutcome::already("Already subscribed to this creator"));
        }

        let payer = self.payer(user_id).await?;
        let price = round2(creator.price_for(tier));
        let order_id = OrderId::generate(LedgerKind::Subscription, user_id).into_string();
        let now = Utc::now();
        let period_end = add_billing_period(now, self.policy.billing_period_months)
            .ok_or(ApiError::InternalError)?;

        self.ledger
            .insert_subscription(&NewSubscription {
                user_id: user_id.to_string(),
                creator_id,
                tier,
                price,
                order_id: order_id.clone(),
                period_start: now,
                period_end,
            })
            .await?;

        let request = CheckoutRequest {
            order_id: order_id.clone(),
            amount_usd: price,
            payer_email: payer.email,
            payer_name: payer.name,
            redirect_url: format!(
                "{}/dashboard/user/subscriptions?payment=success&orderId={}",
                self.public_url, order_id
            ),
            cancel_url: format!(
                "{}/dashboard/user/subscriptions?payment=cancelled&orderId={}",
                self.public_url, order_id
            ),
            webhook_url: self.webhook_url(LedgerKind::Subscription),
        };

        match self.gateway.create_checkout(&request).await {
            Ok(checkout_url) => {
                tracing::info!(%order_id, %creator_id, price = %format_usd(price), "Subscription checkout created");
                Ok(CheckoutOutcome::Redirect { checkout_url, order_id })
            }
            Err(err) => {
                // 보상: 방금 만든 initiated row 제거
                if let Err(cleanup) = self.ledger.delete_subscription_by_order(&order_id).await {
                    tracing::error!(%order_id, error = %cleanup, "Failed to remove pending subscription");
                }
                tracing::warn!(%order_id, error = %err, "Subscription checkout failed");
                Err(err.into())
            }
        }
    }

    // ============ Tip ============

    pub async fn initiate_tip(
        &self,
        user_id: &str,
        intent: TipIntent,
    ) -> Result<CheckoutOutcome, ApiError> {
        let amount = round2(intent.amount_usd);
        if amount < self.policy.min_tip {
            return Err(ApiError::ValidationError(format!(
                "Minimum tip is {}",
                format_usd(self.policy.min_tip)
            )));
        }

        self.read
            .get_creator(intent.creator_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Creator".to_string()))?;

        let payer = self.payer(user_id).await?;
        let order_id = OrderId::generate(LedgerKind::Tip, user_id).into_string();

        self.ledger
            .insert_tip(&NewTip {
                from_user_id: user_id.to_string(),
                to_creator_id: intent.creator_id,
                amount,
                message: intent.message.filter(|m| !m.trim().is_empty()),
                is_anonymous: intent.is_anonymous,
                order_id: order_id.clone(),
            })
            .await?;

        let request = CheckoutRequest {
            order_id: order_id.clone(),
            amount_usd: amount,
            payer_email: payer.email,
            payer_name: payer.name,
            redirect_url: format!("{}/dashboard/user?tip=success", self.public_url),
            cancel_url: format!("{}/dashboard/user?tip=cancelled", self.public_url),
            webhook_url: self.webhook_url(LedgerKind::Tip),
        };

        // 실패해도 initiated row는 남김
        let checkout_url = self.gateway.create_checkout(&request).await.map_err(|err| {
            tracing::warn!(%order_id, error = %err, "Tip checkout failed");
            err
        })?;

        tracing::info!(%order_id, creator_id = %intent.creator_id, amount = %format_usd(amount), "Tip checkout created");
        Ok(CheckoutOutcome::Redirect { checkout_url, order_id })
    }

    // ============ PPV ============

    pub async fn initiate_ppv_unlock(
        &self,
        user_id: &str,
        post_id: Uuid,
    ) -> Result<CheckoutOutcome, ApiError> {
        let post = self
            .read
            .get_post(post_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Post".to_string()))?;

        let price = match post.ppv_price {
            Some(price) if post.is_locked && price > Decimal::ZERO => round2(price),
            _ => {
                return Err(ApiError::ValidationError(
                    "Post is not available for purchase".to_string(),
                ))
            }
        };

        let existing = self.read.find_ppv_unlock(user_id, post_id).await?;
        if let Some(unlock) = &existing {
            if unlock.payment_status == PaymentStatus::Completed {
                return Ok(CheckoutOutcome::already("Post already unlocked"));
            }
        }

        let payer = self.payer(user_id).await?;

        // 진행 중인 주문이 있으면 같은 order id로 checkout만 다시 요청 (row는 그대로)
        let (order_id, price) = match existing {
            Some(unlock) if !unlock.payment_status.is_terminal() => {
                tracing::info!(order_id = %unlock.gateway_order_id, %post_id, "Reusing open PPV order");
                (unlock.gateway_order_id, unlock.amount_paid)
            }
            _ => {
                let order_id = OrderId::generate(LedgerKind::Ppv, user_id).into_string();
                let opened = self
                    .ledger
                    .open_ppv_unlock(&NewPpvUnlock {
                        user_id: user_id.to_string(),
                        post_id,
                        creator_id: post.creator_id,
                        amount: price,
                        order_id: order_id.clone(),
                    })
                    .await?;
                if opened.is_none() {
                    return Err(ApiError::Conflict("PPV checkout already in progress".to_string()));
                }
                (order_id, price)
            }
        };

        let request = CheckoutRequest {
            order_id: order_id.clone(),
            amount_usd: price,
            payer_email: payer.email,
            payer_name: payer.name,
            redirect_url: format!("{}/dashboard/user?ppv=success&postId={}", self.public_url, post_id),
            cancel_url: format!("{}/dashboard/user?ppv=cancelled&postId={}", self.public_url, post_id),
            webhook_url: self.webhook_url(LedgerKind::Ppv),
        };

        let checkout_url = self.gateway.create_checkout(&request).await.map_err(|err| {
            tracing::warn!(%order_id, error = %err, "PPV checkout failed");
            err
        })?;

        tracing::info!(%order_id, %post_id, price = %format_usd(price), "PPV checkout created");
        Ok(CheckoutOutcome::Redirect { checkout_url, order_id })
    }
}

/// `{public_url}/webhooks/{kind}`
pub fn webhook_url(public_url: &str, kind: LedgerKind) -> String {
    format!("{}/webhooks/{}", public_url.trim_end_matches('/'), kind.as_str())
}
