//! Payout Processor
//!
//! 크리에이터 미정산 잔액을 지갑으로 송금하는 흐름. 원장 입장에서는 결제의 반대 방향.
//!
//! ```text
//! pending_payout >= min ─▶ wallet ─▶ INSERT payout(processing) ─▶ initiate_payout
//!                                                              │
//!                                   ok: transfer id 기록 ◀──────┤
//!                                   err: payout = failed ◀──────┘
//!
//! 잔액 차감은 payout 웹훅(sent)에서만 일어난다.
//! ```
//!
//! # Interview Q&A
//!
//! Q: 게이트웨이 호출 실패 시 잔액 롤백이 필요 없는 이유는?
//! A: 이 단계에서는 잔액을 건드리지 않음
//!    - 차감은 송금 완료 웹훅이 담당
//!    - 실패 시 payout row만 failed로 바꾸면 운영자가 재시도 가능
//!
//! Q: 배치에서 한 크리에이터가 실패하면?
//! A: best-effort 배치
//!    - 크리에이터별 결과를 모으고 다음으로 진행
//!    - 부분 성공이 정상적인 결과

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use super::checkout::webhook_url;
use super::gateway::{PaymentGateway, PayoutRequest};
use crate::config::LedgerPolicy;
use crate::db::{CreatorAccount, LedgerStore, NewPayout, PayoutStatus, ReadModel};
use crate::error::ApiError;
use crate::types::{format_usd, round2, LedgerKind};

/// gross / fee / net 분할
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutSplit {
    pub gross_amount: Decimal,
    pub platform_fee: Decimal,
    pub net_amount: Decimal,
}

impl PayoutSplit {
    /// fee = round2(gross × rate), net = gross − fee
    pub fn from_gross(gross: Decimal, fee_rate: Decimal) -> Self {
        let gross_amount = round2(gross);
        let platform_fee = round2(gross_amount * fee_rate);
        Self {
            gross_amount,
            platform_fee,
            net_amount: round2(gross_amount - platform_fee),
        }
    }
}

/// 단건 payout 결과
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutReceipt {
    pub payout_id: Uuid,
    pub creator_id: Uuid,
    pub transfer_id: String,
    #[serde(flatten)]
    pub split: PayoutSplit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchItemStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayoutResult {
    pub creator_id: Uuid,
    pub status: BatchItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayoutSummary {
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub results: Vec<BatchPayoutResult>,
}

/// 관리자 화면용 payout 목록 row
///
/// `is_virtual = true`면 아직 생성되지 않은 payout (조회 시점에 계산).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPayoutView {
    pub id: Option<Uuid>,
    pub creator_id: Uuid,
    #[serde(flatten)]
    pub split: PayoutSplit,
    pub status: PayoutStatus,
    pub crypto_currency: String,
    pub crypto_network: String,
    pub destination_address: String,
    pub is_virtual: bool,
    pub created_at: Option<DateTime<Utc>>,
}

pub struct PayoutProcessor {
    read: Arc<dyn ReadModel>,
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    policy: LedgerPolicy,
    webhook_url: String,
}

impl PayoutProcessor {
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
            webhook_url: webhook_url(public_url, LedgerKind::Payout),
        }
    }

    /// 단일 크리에이터 payout
    pub async fn initiate_payout(&self, creator_id: Uuid) -> Result<PayoutReceipt, ApiError> {
        let creator = self
            .read
            .get_creator(creator_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Creator".to_string()))?;

        self.initiate_for(&creator).await
    }

    /// 자격 있는 모든 크리에이터 payout (best-effort)
    pub async fn initiate_batch_payout(&self) -> Result<BatchPayoutSummary, ApiError> {
        let creators = self
            .read
            .list_payout_eligible_creators(self.policy.min_payout)
            .await?;

        let mut results = Vec::with_capacity(creators.len());
        for creator in &creators {
            let result = match self.initiate_for(creator).await {
                Ok(receipt) => BatchPayoutResult {
                    creator_id: creator.id,
                    status: BatchItemStatus::Success,
                    payout_id: Some(receipt.payout_id),
                    error: None,
                },
                Err(err) => {
                    tracing::warn!(creator_id = %creator.id, error = %err, "Batch payout item failed");
                    BatchPayoutResult {
                        creator_id: creator.id,
                        status: BatchItemStatus::Failed,
                        payout_id: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            results.push(result);
        }

        let processed = results
            .iter()
            .filter(|r| r.status == BatchItemStatus::Success)
            .count();
        let summary = BatchPayoutSummary {
            total: creators.len(),
            processed,
            failed: results.len() - processed,
            results,
        };

        tracing::info!(
            total = summary.total,
            processed = summary.processed,
            failed = summary.failed,
            "Batch payout finished"
        );
        Ok(summary)
    }

    /// 진행 중인 payout + 아직 생성되지 않은 (가상) payout
    pub async fn pending_payouts(&self) -> Result<Vec<PendingPayoutView>, ApiError> {
        let open = self.read.list_open_payouts().await?;
        let mut rows: Vec<PendingPayoutView> = open
            .iter()
            .map(|p| PendingPayoutView {
                id: Some(p.id),
                creator_id: p.creator_id,
                split: PayoutSplit {
                    gross_amount: p.gross_amount,
                    platform_fee: p.platform_fee,
                    net_amount: p.net_amount,
                },
                status: p.status,
                crypto_currency: p.crypto_currency.clone(),
                crypto_network: p.crypto_network.clone(),
                destination_address: p.destination_address.clone(),
                is_virtual: false,
                created_at: Some(p.created_at),
            })
            .collect();

        let eligible = self
            .read
            .list_payout_eligible_creators(self.policy.min_payout)
            .await?;
        for creator in eligible {
            if open.iter().any(|p| p.creator_id == creator.id) {
                continue;
            }
            let Some(wallet) = self.read.get_default_wallet(creator.id).await? else {
                continue;
            };
            rows.push(PendingPayoutView {
                id: None,
                creator_id: creator.id,
                split: PayoutSplit::from_gross(creator.pending_payout, self.policy.platform_fee_rate),
                status: PayoutStatus::Pending,
                crypto_currency: wallet.currency,
                crypto_network: wallet.network,
                destination_address: wallet.address,
                is_virtual: true,
                created_at: None,
            });
        }

        Ok(rows)
    }

    async fn initiate_for(&self, creator: &CreatorAccount) -> Result<PayoutReceipt, ApiError> {
        if creator.pending_payout < self.policy.min_payout {
            return Err(ApiError::ValidationError(format!(
                "Minimum payout is {}. Current balance: {}",
                format_usd(self.policy.min_payout),
                format_usd(creator.pending_payout)
            )));
        }

        if self.read.find_open_payout(creator.id).await?.is_some() {
            return Err(ApiError::Conflict("Payout already in progress".to_string()));
        }

        let wallet = self
            .read
            .get_default_wallet(creator.id)
            .await?
            .ok_or_else(|| ApiError::ValidationError("No payout wallet configured".to_string()))?;

        let payee = self
            .read
            .get_user_contact(&creator.user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("User".to_string()))?;

        let split = PayoutSplit::from_gross(creator.pending_payout, self.policy.platform_fee_rate);
        let payout = self
            .ledger
            .insert_payout(&NewPayout {
                creator_id: creator.id,
                gross_amount: split.gross_amount,
                platform_fee: split.platform_fee,
                net_amount: split.net_amount,
                currency: wallet.currency.clone(),
                network: wallet.network.clone(),
                destination_address: wallet.address.clone(),
            })
            .await?
            .ok_or_else(|| ApiError::Conflict("Payout already in progress".to_string()))?;

        let request = PayoutRequest {
            payout_id: payout.id.to_string(),
            amount_usd: split.net_amount,
            destination_address: wallet.address,
            currency: wallet.currency,
            network: wallet.network,
            payee_email: payee.email,
            payee_name: payee.name,
            webhook_url: self.webhook_url.clone(),
        };

        match self.gateway.initiate_payout(&request).await {
            Ok(transfer_id) => {
                self.ledger.set_payout_transfer(payout.id, &transfer_id).await?;
                tracing::info!(
                    payout_id = %payout.id,
                    creator_id = %creator.id,
                    net = %format_usd(split.net_amount),
                    "Payout initiated"
                );
                Ok(PayoutReceipt {
                    payout_id: payout.id,
                    creator_id: creator.id,
                    transfer_id,
                    split,
                })
            }
            Err(err) => {
                self.ledger.fail_payout(payout.id).await?;
                tracing::warn!(payout_id = %payout.id, error = %err, "Payout initiation failed");
                Err(err.into())
            }
        }
    }
}
