//! Database Module
//!
//! # Interview Q&A
//!
//! Q: 웹훅이 같은 주문에 대해 두 번 동시에 도착하면?
//! A: row 단위 잠금으로 직렬화
//!
//!    1. `SELECT ... FOR UPDATE`로 주문 row를 잠금
//!    2. 두 번째 요청은 첫 번째 트랜잭션 commit까지 대기
//!    3. 대기 후 다시 읽은 row는 이미 terminal → no-op
//!
//!    전역 lock이 아니므로 다른 주문의 웹훅은 서로 막지 않는다.
//!
//! Q: 두 팁이 같은 크리에이터에게 동시에 완료되면?
//! A: 잔액은 항상 상대값으로 갱신
//!
//!    ```sql
//!    UPDATE creators SET pending_payout = GREATEST(pending_payout + $2, 0)
//!    ```
//!
//!    read → 계산 → write 패턴을 쓰지 않으므로 lost update가 없다.
//!
//! Q: 커넥션 풀은 어떻게 관리하는가?
//! A: SQLx의 PgPool 사용
//!    - 최소/최대 커넥션 수 설정
//!    - acquire 타임아웃 3초

#[cfg(test)]
pub mod memory;
mod models;
mod repository;

pub use models::*;
pub use repository::*;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::types::LedgerKind;

const CREATOR_COLUMNS: &str = "id, user_id, standard_price, vip_price, status, total_earnings, \
     pending_payout, subscriber_count, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, creator_id, tier, status, price_at_subscription, \
     gateway_order_id, crypto_currency, crypto_network, payment_status, current_period_start, \
     current_period_end, renewal_order_id, cancelled_at, created_at, updated_at";

const TIP_COLUMNS: &str = "id, from_user_id, to_creator_id, amount, message, is_anonymous, \
     gateway_order_id, crypto_currency, payment_status, created_at";

const PPV_COLUMNS: &str = "id, user_id, post_id, creator_id, amount_paid, gateway_order_id, \
     crypto_currency, payment_status, created_at";

const PAYOUT_COLUMNS: &str = "id, creator_id, gross_amount, platform_fee, net_amount, status, \
     crypto_currency, crypto_network, destination_address, gateway_transfer_id, processed_at, \
     created_at, updated_at";

/// 데이터베이스 연결 및 쿼리 담당
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 데이터베이스 연결
    ///
    /// # Connection Pool Settings
    ///
    /// - max_connections: 10 (트래픽에 따라 조정)
    /// - min_connections: 1 (idle 시 최소 유지)
    /// - acquire_timeout: 3초 (커넥션 획득 대기)
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(3))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// 마이그레이션 실행
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await?;
        Ok(())
    }

    /// 주문 reference로 원장 row를 찾아 잠금
    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        kind: LedgerKind,
        reference: &str,
    ) -> Result<Option<LedgerRow>> {
        let row = match kind {
            LedgerKind::Subscription => {
                let sql = format!(
                    "SELECT {} FROM subscriptions \
                     WHERE gateway_order_id = $1 OR renewal_order_id = $1 \
                     LIMIT 1 FOR UPDATE",
                    SUBSCRIPTION_COLUMNS
                );
                let found = sqlx::query_as::<_, Subscription>(&sql)
                    .bind(reference)
                    .fetch_optional(&mut **tx)
                    .await?;

                match found {
                    None => None,
                    Some(row) => {
                        let matched_renewal = row.gateway_order_id.as_deref() != Some(reference);

                        // 같은 (user, creator)의 다른 결제 완료 활성 구독
                        let sql = format!(
                            "SELECT {} FROM subscriptions \
                             WHERE user_id = $1 AND creator_id = $2 AND id <> $3 \
                               AND status = 'active' AND payment_status = 'completed' \
                             LIMIT 1 FOR UPDATE",
                            SUBSCRIPTION_COLUMNS
                        );
                        let active_sibling = sqlx::query_as::<_, Subscription>(&sql)
                            .bind(&row.user_id)
                            .bind(row.creator_id)
                            .bind(row.id)
                            .fetch_optional(&mut **tx)
                            .await?;

                        Some(LedgerRow::Subscription { row, matched_renewal, active_sibling })
                    }
                }
            }
            LedgerKind::Tip => {
                let sql = format!(
                    "SELECT {} FROM tips WHERE gateway_order_id = $1 LIMIT 1 FOR UPDATE",
                    TIP_COLUMNS
                );
                sqlx::query_as::<_, Tip>(&sql)
                    .bind(reference)
                    .fetch_optional(&mut **tx)
                    .await?
                    .map(LedgerRow::Tip)
            }
            LedgerKind::Ppv => {
                let sql = format!(
                    "SELECT {} FROM ppv_unlocks WHERE gateway_order_id = $1 LIMIT 1 FOR UPDATE",
                    PPV_COLUMNS
                );
                sqlx::query_as::<_, PpvUnlock>(&sql)
                    .bind(reference)
                    .fetch_optional(&mut **tx)
                    .await?
                    .map(LedgerRow::Ppv)
            }
            LedgerKind::Payout => {
                // 게이트웨이는 transfer id 또는 우리가 보낸 payout id로 콜백
                let sql = format!(
                    "SELECT {} FROM payouts \
                     WHERE gateway_transfer_id = $1 OR id::text = $1 \
                     LIMIT 1 FOR UPDATE",
                    PAYOUT_COLUMNS
                );
                sqlx::query_as::<_, Payout>(&sql)
                    .bind(reference)
                    .fetch_optional(&mut **tx)
                    .await?
                    .map(LedgerRow::Payout)
            }
        };

        Ok(row)
    }

    /// 전이 + 잔액 변경 + 로그 추가 (호출자의 트랜잭션 안에서)
    async fn apply_transition(
        tx: &mut Transaction<'_, Postgres>,
        transition: &Transition,
    ) -> Result<()> {
        match &transition.update {
            RowUpdate::SubscriptionActivated { id, currency, network } => {
                sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET payment_status = 'completed',
                        status = 'active',
                        crypto_currency = $2,
                        crypto_network = $3,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(currency)
                .bind(network)
                .execute(&mut **tx)
                .await?;
            }
            RowUpdate::SubscriptionMerged {
                id,
                into,
                currency,
                network,
                extended_period_end,
                closed_at,
            } => {
                sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET payment_status = 'completed',
                        status = 'cancelled',
                        renewal_order_id = NULL,
                        crypto_currency = $2,
                        crypto_network = $3,
                        cancelled_at = $4,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(currency)
                .bind(network)
                .bind(closed_at)
                .execute(&mut **tx)
                .await?;

                sqlx::query(
                    "UPDATE subscriptions SET current_period_end = $2, updated_at = NOW() WHERE id = $1",
                )
                .bind(into)
                .bind(extended_period_end)
                .execute(&mut **tx)
                .await?;
            }
            RowUpdate::SubscriptionRenewed {
                id,
                order_id,
                currency,
                network,
                period_start,
                period_end,
            } => {
                sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET gateway_order_id = $2,
                        renewal_order_id = NULL,
                        payment_status = 'completed',
                        status = 'active',
                        crypto_currency = $3,
                        crypto_network = $4,
                        current_period_start = $5,
                        current_period_end = $6,
                        cancelled_at = NULL,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(order_id)
                .bind(currency)
                .bind(network)
                .bind(period_start)
                .bind(period_end)
                .execute(&mut **tx)
                .await?;
            }
            RowUpdate::SubscriptionRenewalDropped { id } => {
                sqlx::query(
                    "UPDATE subscriptions SET renewal_order_id = NULL, updated_at = NOW() WHERE id = $1",
                )
                .bind(id)
                .execute(&mut **tx)
                .await?;
            }
            RowUpdate::SubscriptionCancelled { id, payment_status, cancelled_at } => {
                sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET payment_status = $2,
                        status = 'cancelled',
                        cancelled_at = $3,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(payment_status)
                .bind(cancelled_at)
                .execute(&mut **tx)
                .await?;
            }
            RowUpdate::TipSettled { id, payment_status, currency } => {
                sqlx::query(
                    "UPDATE tips SET payment_status = $2, \
                     crypto_currency = COALESCE($3, crypto_currency) WHERE id = $1",
                )
                .bind(id)
                .bind(payment_status)
                .bind(currency)
                .execute(&mut **tx)
                .await?;
            }
            RowUpdate::PpvSettled { id, payment_status, currency } => {
                sqlx::query(
                    "UPDATE ppv_unlocks SET payment_status = $2, \
                     crypto_currency = COALESCE($3, crypto_currency) WHERE id = $1",
                )
                .bind(id)
                .bind(payment_status)
                .bind(currency)
                .execute(&mut **tx)
                .await?;
            }
            RowUpdate::PayoutSent { id, processed_at } => {
                sqlx::query(
                    "UPDATE payouts SET status = 'sent', processed_at = $2, updated_at = NOW() WHERE id = $1",
                )
                .bind(id)
                .bind(processed_at)
                .execute(&mut **tx)
                .await?;
            }
            RowUpdate::PayoutFailed { id } => {
                sqlx::query("UPDATE payouts SET status = 'failed', updated_at = NOW() WHERE id = $1")
                    .bind(id)
                    .execute(&mut **tx)
                    .await?;
            }
        }

        if let Some(delta) = &transition.balance {
            // 상대값 갱신 + 0 하한
            sqlx::query(
                r#"
                UPDATE creators
                SET pending_payout = GREATEST(pending_payout + $2, 0),
                    total_earnings = total_earnings + $3,
                    subscriber_count = GREATEST(subscriber_count + $4, 0),
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(delta.creator_id)
            .bind(delta.pending_payout)
            .bind(delta.total_earnings)
            .bind(delta.subscriber_count)
            .execute(&mut **tx)
            .await?;
        }

        if let Some(log) = &transition.log {
            sqlx::query(
                r#"
                INSERT INTO transactions (user_id, creator_id, type, amount, description, external_ref)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&log.user_id)
            .bind(log.creator_id)
            .bind(log.kind)
            .bind(log.amount)
            .bind(&log.description)
            .bind(&log.external_ref)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl ReadModel for Database {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_creator(&self, creator_id: Uuid) -> Result<Option<CreatorAccount>> {
        let sql = format!("SELECT {} FROM creators WHERE id = $1", CREATOR_COLUMNS);
        let creator = sqlx::query_as::<_, CreatorAccount>(&sql)
            .bind(creator_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(creator)
    }

    async fn get_post(&self, post_id: Uuid) -> Result<Option<Post>> {
        let post = sqlx::query_as::<_, Post>(
            "SELECT id, creator_id, is_locked, ppv_price FROM posts WHERE id = $1",
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(post)
    }

    async fn get_user_contact(&self, user_id: &str) -> Result<Option<UserContact>> {
        let contact = sqlx::query_as::<_, UserContact>(
            "SELECT id, name, email FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(contact)
    }

    async fn get_default_wallet(&self, creator_id: Uuid) -> Result<Option<CreatorWallet>> {
        let wallet = sqlx::query_as::<_, CreatorWallet>(
            r#"
            SELECT id, creator_id, currency, network, address, is_default
            FROM creator_wallets
            WHERE creator_id = $1 AND is_default = TRUE
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(creator_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(wallet)
    }

    async fn find_active_subscription(
        &self,
        user_id: &str,
        creator_id: Uuid,
    ) -> Result<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions \
             WHERE user_id = $1 AND creator_id = $2 \
               AND status = 'active' AND payment_status = 'completed' \
             LIMIT 1",
            SUBSCRIPTION_COLUMNS
        );
        let sub = sqlx::query_as::<_, Subscription>(&sql)
            .bind(user_id)
            .bind(creator_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(sub)
    }

    async fn find_ppv_unlock(&self, user_id: &str, post_id: Uuid) -> Result<Option<PpvUnlock>> {
        let sql = format!(
            "SELECT {} FROM ppv_unlocks WHERE user_id = $1 AND post_id = $2",
            PPV_COLUMNS
        );
        let unlock = sqlx::query_as::<_, PpvUnlock>(&sql)
            .bind(user_id)
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(unlock)
    }

    async fn find_open_payout(&self, creator_id: Uuid) -> Result<Option<Payout>> {
        let sql = format!(
            "SELECT {} FROM payouts \
             WHERE creator_id = $1 AND status IN ('pending', 'processing') \
             ORDER BY created_at DESC LIMIT 1",
            PAYOUT_COLUMNS
        );
        let payout = sqlx::query_as::<_, Payout>(&sql)
            .bind(creator_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payout)
    }

    async fn list_open_payouts(&self) -> Result<Vec<Payout>> {
        let sql = format!(
            "SELECT {} FROM payouts WHERE status IN ('pending', 'processing') ORDER BY created_at",
            PAYOUT_COLUMNS
        );
        let payouts = sqlx::query_as::<_, Payout>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(payouts)
    }

    async fn list_payout_eligible_creators(&self, min_payout: Decimal) -> Result<Vec<CreatorAccount>> {
        let sql = format!(
            "SELECT {} FROM creators WHERE pending_payout >= $1 ORDER BY pending_payout DESC",
            CREATOR_COLUMNS
        );
        let creators = sqlx::query_as::<_, CreatorAccount>(&sql)
            .bind(min_payout)
            .fetch_all(&self.pool)
            .await?;
        Ok(creators)
    }

    async fn list_renewal_candidates(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions \
             WHERE status = 'active' AND payment_status = 'completed' \
               AND current_period_end >= $1 AND current_period_end <= $2 \
               AND renewal_order_id IS NULL \
             ORDER BY current_period_end",
            SUBSCRIPTION_COLUMNS
        );
        let subs = sqlx::query_as::<_, Subscription>(&sql)
            .bind(now)
            .bind(until)
            .fetch_all(&self.pool)
            .await?;
        Ok(subs)
    }
}

#[async_trait]
impl LedgerStore for Database {
    async fn insert_subscription(&self, new: &NewSubscription) -> Result<Subscription> {
        let sql = format!(
            r#"
            INSERT INTO subscriptions (
                user_id, creator_id, tier, status, price_at_subscription,
                gateway_order_id, payment_status, current_period_start, current_period_end
            )
            VALUES ($1, $2, $3, 'active', $4, $5, 'initiated', $6, $7)
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let sub = sqlx::query_as::<_, Subscription>(&sql)
            .bind(&new.user_id)
            .bind(new.creator_id)
            .bind(new.tier)
            .bind(new.price)
            .bind(&new.order_id)
            .bind(new.period_start)
            .bind(new.period_end)
            .fetch_one(&self.pool)
            .await?;
        Ok(sub)
    }

    async fn delete_subscription_by_order(&self, order_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM subscriptions WHERE gateway_order_id = $1 AND payment_status = 'initiated'",
        )
        .bind(order_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_tip(&self, new: &NewTip) -> Result<Tip> {
        let sql = format!(
            r#"
            INSERT INTO tips (
                from_user_id, to_creator_id, amount, message, is_anonymous,
                gateway_order_id, payment_status
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'initiated')
            RETURNING {}
            "#,
            TIP_COLUMNS
        );
        let tip = sqlx::query_as::<_, Tip>(&sql)
            .bind(&new.from_user_id)
            .bind(new.to_creator_id)
            .bind(new.amount)
            .bind(&new.message)
            .bind(new.is_anonymous)
            .bind(&new.order_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(tip)
    }

    async fn open_ppv_unlock(&self, new: &NewPpvUnlock) -> Result<Option<PpvUnlock>> {
        // 열린 주문 / 완료된 row는 덮어쓰지 않음 (WHERE 절에서 걸러짐 → RETURNING 없음)
        let sql = format!(
            r#"
            INSERT INTO ppv_unlocks (
                user_id, post_id, creator_id, amount_paid, gateway_order_id, payment_status
            )
            VALUES ($1, $2, $3, $4, $5, 'initiated')
            ON CONFLICT (user_id, post_id)
            DO UPDATE SET
                amount_paid = EXCLUDED.amount_paid,
                gateway_order_id = EXCLUDED.gateway_order_id,
                crypto_currency = NULL,
                payment_status = 'initiated'
            WHERE ppv_unlocks.payment_status IN ('failed', 'expired')
            RETURNING {}
            "#,
            PPV_COLUMNS
        );
        let unlock = sqlx::query_as::<_, PpvUnlock>(&sql)
            .bind(&new.user_id)
            .bind(new.post_id)
            .bind(new.creator_id)
            .bind(new.amount)
            .bind(&new.order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(unlock)
    }

    async fn insert_payout(&self, new: &NewPayout) -> Result<Option<Payout>> {
        // payouts_one_open_idx 충돌 → 다른 호출이 먼저 열었음 (RETURNING 없음)
        let sql = format!(
            r#"
            INSERT INTO payouts (
                creator_id, gross_amount, platform_fee, net_amount, status,
                crypto_currency, crypto_network, destination_address
            )
            VALUES ($1, $2, $3, $4, 'processing', $5, $6, $7)
            ON CONFLICT (creator_id) WHERE status IN ('pending', 'processing')
            DO NOTHING
            RETURNING {}
            "#,
            PAYOUT_COLUMNS
        );
        let payout = sqlx::query_as::<_, Payout>(&sql)
            .bind(new.creator_id)
            .bind(new.gross_amount)
            .bind(new.platform_fee)
            .bind(new.net_amount)
            .bind(&new.currency)
            .bind(&new.network)
            .bind(&new.destination_address)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payout)
    }

    async fn set_payout_transfer(&self, payout_id: Uuid, transfer_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE payouts SET gateway_transfer_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(payout_id)
        .bind(transfer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_payout(&self, payout_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE payouts SET status = 'failed', updated_at = NOW() \
             WHERE id = $1 AND status IN ('pending', 'processing')",
        )
        .bind(payout_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn tag_renewal(&self, subscription_id: Uuid, order_id: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions SET renewal_order_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(subscription_id)
        .bind(order_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn expire_lapsed_subscriptions(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let lapsed: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = 'expired', updated_at = NOW()
            WHERE status = 'active'
              AND payment_status = 'completed'
              AND current_period_end < $1
              AND (renewal_order_id IS NULL OR current_period_end < $2)
            RETURNING creator_id
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .fetch_all(&mut *tx)
        .await?;

        let mut per_creator: HashMap<Uuid, i32> = HashMap::new();
        for (creator_id,) in &lapsed {
            *per_creator.entry(*creator_id).or_default() += 1;
        }

        for (creator_id, count) in per_creator {
            sqlx::query(
                "UPDATE creators SET subscriber_count = GREATEST(subscriber_count - $2, 0), \
                 updated_at = NOW() WHERE id = $1",
            )
            .bind(creator_id)
            .bind(count)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(lapsed.len() as u64)
    }

    async fn reconcile(
        &self,
        kind: LedgerKind,
        reference: &str,
        planner: &Planner<'_>,
    ) -> Result<ReconcileOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = Self::lock_row(&mut tx, kind, reference).await? else {
            tx.rollback().await?;
            return Ok(ReconcileOutcome::UnknownOrder);
        };

        let plan = planner(&row);
        if let Plan::Apply(transition) = &plan {
            Self::apply_transition(&mut tx, transition).await?;
        }

        // 실패 시 tx drop → rollback (부분 commit 없음)
        tx.commit().await?;
        Ok(ReconcileOutcome::from(&plan))
    }
}
