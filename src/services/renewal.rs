//! Subscription Renewal Sweep
//!
//! 외부 스케줄러가 주기적으로 호출하는 stateless 작업.
//!
//! 1. 만료가 가까운 결제 완료 구독에 갱신 checkout 생성 (구독 시점 가격)
//! 2. 기간이 끝났는데 갱신되지 않은 구독을 expired로 전환
//!
//! 갱신 주문 ID는 checkout 호출 전에 태그한다. 웹훅이 응답보다 먼저 와도
//! `renewal_order_id`로 row를 찾을 수 있어야 하기 때문.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::checkout::webhook_url;
use super::gateway::{CheckoutRequest, PaymentGateway};
use crate::config::LedgerPolicy;
use crate::db::{LedgerStore, ReadModel, Subscription};
use crate::error::ApiError;
use crate::types::{LedgerKind, OrderId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenewalSummary {
    pub renewed: usize,
    pub failed: usize,
    pub expired: u64,
    pub total: usize,
}

pub struct RenewalSweep {
    read: Arc<dyn ReadModel>,
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    policy: LedgerPolicy,
    public_url: String,
}

impl RenewalSweep {
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

    pub async fn run(&self, now: DateTime<Utc>) -> Result<RenewalSummary, ApiError> {
        let window = Duration::hours(self.policy.renewal_window_hours);
        let candidates = self.read.list_renewal_candidates(now, now + window).await?;

        let mut summary = RenewalSummary {
            total: candidates.len(),
            ..Default::default()
        };

        for sub in &candidates {
            match self.renew(sub).await {
                Ok(order_id) => {
                    tracing::info!(subscription_id = %sub.id, %order_id, "Renewal checkout created");
                    summary.renewed += 1;
                }
                Err(err) => {
                    tracing::warn!(subscription_id = %sub.id, error = %err, "Renewal failed");
                    summary.failed += 1;
                }
            }
        }

        // 갱신 중인 구독은 window만큼 유예
        summary.expired = self.ledger.expire_lapsed_subscriptions(now, now - window).await?;

        tracing::info!(
            renewed = summary.renewed,
            failed = summary.failed,
            expired = summary.expired,
            "Renewal sweep finished"
        );
        Ok(summary)
    }

    async fn renew(&self, sub: &Subscription) -> Result<String, ApiError> {
        let payer = self
            .read
            .get_user_contact(&sub.user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("User".to_string()))?;

        let order_id = OrderId::generate(LedgerKind::Subscription, &sub.user_id).into_string();
        self.ledger.tag_renewal(sub.id, Some(&order_id)).await?;

        let request = CheckoutRequest {
            order_id: order_id.clone(),
            amount_usd: sub.price_at_subscription,
            payer_email: payer.email,
            payer_name: payer.name,
            redirect_url: format!(
                "{}/dashboard/user/subscriptions?renewal=success&orderId={}",
                self.public_url, order_id
            ),
            cancel_url: format!("{}/dashboard/user/subscriptions?renewal=cancelled", self.public_url),
            webhook_url: webhook_url(&self.public_url, LedgerKind::Subscription),
        };

        if let Err(err) = self.gateway.create_checkout(&request).await {
            // 다음 sweep에서 다시 후보가 되도록 태그 해제
            if let Err(cleanup) = self.ledger.tag_renewal(sub.id, None).await {
                tracing::error!(subscription_id = %sub.id, error = %cleanup, "Failed to clear renewal tag");
            }
            return Err(err.into());
        }

        Ok(order_id)
    }
}
