//! In-memory ledger for unit tests.
//!
//! Implements both ports with the same semantics as the Postgres queries:
//! one mutex guards the whole state and is never held across an `.await`,
//! so `reconcile` is atomic per call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::models::*;
use super::repository::*;
use crate::types::LedgerKind;

#[derive(Default, Clone)]
struct State {
    users: HashMap<String, UserContact>,
    creators: HashMap<Uuid, CreatorAccount>,
    posts: HashMap<Uuid, Post>,
    wallets: Vec<CreatorWallet>,
    subscriptions: Vec<Subscription>,
    tips: Vec<Tip>,
    unlocks: Vec<PpvUnlock>,
    payouts: Vec<Payout>,
    log: Vec<NewTransaction>,
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
    /// true면 find_open_payout이 항상 None (동시 호출에 진 읽기)
    stale_payout_reads: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    // ============ Fixtures ============

    pub fn add_user(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.users.insert(
            id.to_string(),
            UserContact {
                id: id.to_string(),
                name: format!("User {}", id),
                email: format!("{}@example.com", id),
            },
        );
    }

    /// 활성 크리에이터 (+ 크리에이터 user) 생성
    pub fn add_creator(&self, standard_price: Decimal, vip_price: Decimal) -> Uuid {
        let id = Uuid::new_v4();
        let user_id = format!("creator-{}", id.simple());
        self.add_user(&user_id);

        let mut state = self.state.lock().unwrap();
        state.creators.insert(
            id,
            CreatorAccount {
                id,
                user_id,
                standard_price,
                vip_price,
                status: CreatorStatus::Active,
                total_earnings: Decimal::ZERO,
                pending_payout: Decimal::ZERO,
                subscriber_count: 0,
                updated_at: Utc::now(),
            },
        );
        id
    }

    pub fn set_creator_status(&self, creator_id: Uuid, status: CreatorStatus) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.creators.get_mut(&creator_id) {
            c.status = status;
        }
    }

    pub fn set_pending_payout(&self, creator_id: Uuid, amount: Decimal) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.creators.get_mut(&creator_id) {
            c.pending_payout = amount;
        }
    }

    pub fn add_post(&self, creator_id: Uuid, is_locked: bool, ppv_price: Option<Decimal>) -> Uuid {
        let id = Uuid::new_v4();
        let mut state = self.state.lock().unwrap();
        state.posts.insert(id, Post { id, creator_id, is_locked, ppv_price });
        id
    }

    pub fn add_wallet(&self, creator_id: Uuid, currency: &str, network: &str, address: &str) {
        let mut state = self.state.lock().unwrap();
        state.wallets.push(CreatorWallet {
            id: Uuid::new_v4(),
            creator_id,
            currency: currency.to_string(),
            network: network.to_string(),
            address: address.to_string(),
            is_default: true,
        });
    }

    pub fn set_stale_payout_reads(&self, stale: bool) {
        self.stale_payout_reads.store(stale, Ordering::SeqCst);
    }

    /// 게이트웨이가 주문을 닫은 상태를 흉내냄
    pub fn set_unlock_status(&self, order_id: &str, status: PaymentStatus) {
        let mut state = self.state.lock().unwrap();
        if let Some(u) = state.unlocks.iter_mut().find(|u| u.gateway_order_id == order_id) {
            u.payment_status = status;
        }
    }

    /// 결제 완료된 활성 구독을 직접 삽입
    pub fn add_paid_subscription(
        &self,
        user_id: &str,
        creator_id: Uuid,
        price: Decimal,
        period_end: DateTime<Utc>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        state.subscriptions.push(Subscription {
            id,
            user_id: user_id.to_string(),
            creator_id,
            tier: SubscriptionTier::Standard,
            status: SubscriptionStatus::Active,
            price_at_subscription: price,
            gateway_order_id: Some(format!("seed_{}", id.simple())),
            crypto_currency: Some("USDT".to_string()),
            crypto_network: Some("TRC20".to_string()),
            payment_status: PaymentStatus::Completed,
            current_period_start: now,
            current_period_end: period_end,
            renewal_order_id: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        });
        if let Some(c) = state.creators.get_mut(&creator_id) {
            c.subscriber_count += 1;
        }
        id
    }

    // ============ Inspection ============

    pub fn creator(&self, creator_id: Uuid) -> CreatorAccount {
        self.state.lock().unwrap().creators[&creator_id].clone()
    }

    pub fn subscription(&self, id: Uuid) -> Option<Subscription> {
        self.state.lock().unwrap().subscriptions.iter().find(|s| s.id == id).cloned()
    }

    pub fn subscription_by_order(&self, order_id: &str) -> Option<Subscription> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .find(|s| s.gateway_order_id.as_deref() == Some(order_id))
            .cloned()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    pub fn tip_by_order(&self, order_id: &str) -> Option<Tip> {
        self.state
            .lock()
            .unwrap()
            .tips
            .iter()
            .find(|t| t.gateway_order_id == order_id)
            .cloned()
    }

    pub fn unlock_by_order(&self, order_id: &str) -> Option<PpvUnlock> {
        self.state
            .lock()
            .unwrap()
            .unlocks
            .iter()
            .find(|u| u.gateway_order_id == order_id)
            .cloned()
    }

    pub fn unlocks(&self) -> Vec<PpvUnlock> {
        self.state.lock().unwrap().unlocks.clone()
    }

    pub fn payouts(&self) -> Vec<Payout> {
        self.state.lock().unwrap().payouts.clone()
    }

    pub fn payouts_for(&self, creator_id: Uuid) -> Vec<Payout> {
        self.payouts().into_iter().filter(|p| p.creator_id == creator_id).collect()
    }

    pub fn log(&self) -> Vec<NewTransaction> {
        self.state.lock().unwrap().log.clone()
    }
}

impl State {
    fn find_row(&self, kind: LedgerKind, reference: &str) -> Option<LedgerRow> {
        match kind {
            LedgerKind::Subscription => {
                let row = self
                    .subscriptions
                    .iter()
                    .find(|s| {
                        s.gateway_order_id.as_deref() == Some(reference)
                            || s.renewal_order_id.as_deref() == Some(reference)
                    })?
                    .clone();
                let matched_renewal = row.gateway_order_id.as_deref() != Some(reference);
                let active_sibling = self
                    .subscriptions
                    .iter()
                    .find(|s| {
                        s.id != row.id
                            && s.user_id == row.user_id
                            && s.creator_id == row.creator_id
                            && s.is_paid_active()
                    })
                    .cloned();
                Some(LedgerRow::Subscription { row, matched_renewal, active_sibling })
            }
            LedgerKind::Tip => self
                .tips
                .iter()
                .find(|t| t.gateway_order_id == reference)
                .cloned()
                .map(LedgerRow::Tip),
            LedgerKind::Ppv => self
                .unlocks
                .iter()
                .find(|u| u.gateway_order_id == reference)
                .cloned()
                .map(LedgerRow::Ppv),
            LedgerKind::Payout => self
                .payouts
                .iter()
                .find(|p| {
                    p.gateway_transfer_id.as_deref() == Some(reference) || p.id.to_string() == reference
                })
                .cloned()
                .map(LedgerRow::Payout),
        }
    }

    fn subscription_mut(&mut self, id: Uuid) -> Result<&mut Subscription> {
        match self.subscriptions.iter_mut().find(|s| s.id == id) {
            Some(s) => Ok(s),
            None => bail!("subscription {} not found", id),
        }
    }

    fn apply(&mut self, transition: &Transition) -> Result<()> {
        let now = Utc::now();
        match &transition.update {
            RowUpdate::SubscriptionActivated { id, currency, network } => {
                let s = self.subscription_mut(*id)?;
                s.payment_status = PaymentStatus::Completed;
                s.status = SubscriptionStatus::Active;
                s.crypto_currency = Some(currency.clone());
                s.crypto_network = Some(network.clone());
                s.updated_at = now;
            }
            RowUpdate::SubscriptionMerged {
                id,
                into,
                currency,
                network,
                extended_period_end,
                closed_at,
            } => {
                let s = self.subscription_mut(*id)?;
                s.payment_status = PaymentStatus::Completed;
                s.status = SubscriptionStatus::Cancelled;
                s.renewal_order_id = None;
                s.crypto_currency = Some(currency.clone());
                s.crypto_network = Some(network.clone());
                s.cancelled_at = Some(*closed_at);
                s.updated_at = now;

                let target = self.subscription_mut(*into)?;
                target.current_period_end = *extended_period_end;
                target.updated_at = now;
            }
            RowUpdate::SubscriptionRenewed {
                id,
                order_id,
                currency,
                network,
                period_start,
                period_end,
            } => {
                let s = self.subscription_mut(*id)?;
                s.gateway_order_id = Some(order_id.clone());
                s.renewal_order_id = None;
                s.payment_status = PaymentStatus::Completed;
                s.status = SubscriptionStatus::Active;
                s.crypto_currency = Some(currency.clone());
                s.crypto_network = Some(network.clone());
                s.current_period_start = *period_start;
                s.current_period_end = *period_end;
                s.cancelled_at = None;
                s.updated_at = now;
            }
            RowUpdate::SubscriptionRenewalDropped { id } => {
                let s = self.subscription_mut(*id)?;
                s.renewal_order_id = None;
                s.updated_at = now;
            }
            RowUpdate::SubscriptionCancelled { id, payment_status, cancelled_at } => {
                let s = self.subscription_mut(*id)?;
                s.payment_status = *payment_status;
                s.status = SubscriptionStatus::Cancelled;
                s.cancelled_at = Some(*cancelled_at);
                s.updated_at = now;
            }
            RowUpdate::TipSettled { id, payment_status, currency } => {
                let Some(t) = self.tips.iter_mut().find(|t| t.id == *id) else {
                    bail!("tip {} not found", id);
                };
                t.payment_status = *payment_status;
                if currency.is_some() {
                    t.crypto_currency = currency.clone();
                }
            }
            RowUpdate::PpvSettled { id, payment_status, currency } => {
                let Some(u) = self.unlocks.iter_mut().find(|u| u.id == *id) else {
                    bail!("unlock {} not found", id);
                };
                u.payment_status = *payment_status;
                if currency.is_some() {
                    u.crypto_currency = currency.clone();
                }
            }
            RowUpdate::PayoutSent { id, processed_at } => {
                let Some(p) = self.payouts.iter_mut().find(|p| p.id == *id) else {
                    bail!("payout {} not found", id);
                };
                p.status = PayoutStatus::Sent;
                p.processed_at = Some(*processed_at);
                p.updated_at = now;
            }
            RowUpdate::PayoutFailed { id } => {
                let Some(p) = self.payouts.iter_mut().find(|p| p.id == *id) else {
                    bail!("payout {} not found", id);
                };
                p.status = PayoutStatus::Failed;
                p.updated_at = now;
            }
        }

        if let Some(delta) = &transition.balance {
            let Some(c) = self.creators.get_mut(&delta.creator_id) else {
                bail!("creator {} not found", delta.creator_id);
            };
            c.pending_payout = (c.pending_payout + delta.pending_payout).max(Decimal::ZERO);
            c.total_earnings += delta.total_earnings;
            c.subscriber_count = (c.subscriber_count + delta.subscriber_count).max(0);
            c.updated_at = now;
        }

        if let Some(log) = &transition.log {
            let duplicate = self
                .log
                .iter()
                .any(|e| e.kind == log.kind && e.external_ref == log.external_ref);
            if duplicate {
                bail!("duplicate transaction log entry for {}", log.external_ref);
            }
            self.log.push(log.clone());
        }

        Ok(())
    }
}

#[async_trait]
impl ReadModel for MemoryLedger {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get_creator(&self, creator_id: Uuid) -> Result<Option<CreatorAccount>> {
        Ok(self.state.lock().unwrap().creators.get(&creator_id).cloned())
    }

    async fn get_post(&self, post_id: Uuid) -> Result<Option<Post>> {
        Ok(self.state.lock().unwrap().posts.get(&post_id).cloned())
    }

    async fn get_user_contact(&self, user_id: &str) -> Result<Option<UserContact>> {
        Ok(self.state.lock().unwrap().users.get(user_id).cloned())
    }

    async fn get_default_wallet(&self, creator_id: Uuid) -> Result<Option<CreatorWallet>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .wallets
            .iter()
            .find(|w| w.creator_id == creator_id && w.is_default)
            .cloned())
    }

    async fn find_active_subscription(
        &self,
        user_id: &str,
        creator_id: Uuid,
    ) -> Result<Option<Subscription>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .subscriptions
            .iter()
            .find(|s| s.user_id == user_id && s.creator_id == creator_id && s.is_paid_active())
            .cloned())
    }

    async fn find_ppv_unlock(&self, user_id: &str, post_id: Uuid) -> Result<Option<PpvUnlock>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .unlocks
            .iter()
            .find(|u| u.user_id == user_id && u.post_id == post_id)
            .cloned())
    }

    async fn find_open_payout(&self, creator_id: Uuid) -> Result<Option<Payout>> {
        if self.stale_payout_reads.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .payouts
            .iter()
            .rev()
            .find(|p| p.creator_id == creator_id && !p.status.is_terminal())
            .cloned())
    }

    async fn list_open_payouts(&self) -> Result<Vec<Payout>> {
        let state = self.state.lock().unwrap();
        Ok(state.payouts.iter().filter(|p| !p.status.is_terminal()).cloned().collect())
    }

    async fn list_payout_eligible_creators(&self, min_payout: Decimal) -> Result<Vec<CreatorAccount>> {
        let state = self.state.lock().unwrap();
        let mut creators: Vec<CreatorAccount> = state
            .creators
            .values()
            .filter(|c| c.pending_payout >= min_payout)
            .cloned()
            .collect();
        creators.sort_by(|a, b| b.pending_payout.cmp(&a.pending_payout));
        Ok(creators)
    }

    async fn list_renewal_candidates(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Subscription>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| {
                s.is_paid_active()
                    && s.current_period_end >= now
                    && s.current_period_end <= until
                    && s.renewal_order_id.is_none()
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn insert_subscription(&self, new: &NewSubscription) -> Result<Subscription> {
        let now = Utc::now();
        let sub = Subscription {
            id: Uuid::new_v4(),
            user_id: new.user_id.clone(),
            creator_id: new.creator_id,
            tier: new.tier,
            status: SubscriptionStatus::Active,
            price_at_subscription: new.price,
            gateway_order_id: Some(new.order_id.clone()),
            crypto_currency: None,
            crypto_network: None,
            payment_status: PaymentStatus::Initiated,
            current_period_start: new.period_start,
            current_period_end: new.period_end,
            renewal_order_id: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        };
        self.state.lock().unwrap().subscriptions.push(sub.clone());
        Ok(sub)
    }

    async fn delete_subscription_by_order(&self, order_id: &str) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| {
            !(s.gateway_order_id.as_deref() == Some(order_id)
                && s.payment_status == PaymentStatus::Initiated)
        });
        Ok((before - state.subscriptions.len()) as u64)
    }

    async fn insert_tip(&self, new: &NewTip) -> Result<Tip> {
        let tip = Tip {
            id: Uuid::new_v4(),
            from_user_id: new.from_user_id.clone(),
            to_creator_id: new.to_creator_id,
            amount: new.amount,
            message: new.message.clone(),
            is_anonymous: new.is_anonymous,
            gateway_order_id: new.order_id.clone(),
            crypto_currency: None,
            payment_status: PaymentStatus::Initiated,
            created_at: Utc::now(),
        };
        self.state.lock().unwrap().tips.push(tip.clone());
        Ok(tip)
    }

    async fn open_ppv_unlock(&self, new: &NewPpvUnlock) -> Result<Option<PpvUnlock>> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state
            .unlocks
            .iter_mut()
            .find(|u| u.user_id == new.user_id && u.post_id == new.post_id)
        {
            if !matches!(existing.payment_status, PaymentStatus::Failed | PaymentStatus::Expired) {
                return Ok(None);
            }
            existing.amount_paid = new.amount;
            existing.gateway_order_id = new.order_id.clone();
            existing.crypto_currency = None;
            existing.payment_status = PaymentStatus::Initiated;
            return Ok(Some(existing.clone()));
        }

        let unlock = PpvUnlock {
            id: Uuid::new_v4(),
            user_id: new.user_id.clone(),
            post_id: new.post_id,
            creator_id: new.creator_id,
            amount_paid: new.amount,
            gateway_order_id: new.order_id.clone(),
            crypto_currency: None,
            payment_status: PaymentStatus::Initiated,
            created_at: Utc::now(),
        };
        state.unlocks.push(unlock.clone());
        Ok(Some(unlock))
    }

    async fn insert_payout(&self, new: &NewPayout) -> Result<Option<Payout>> {
        let mut state = self.state.lock().unwrap();
        if state
            .payouts
            .iter()
            .any(|p| p.creator_id == new.creator_id && !p.status.is_terminal())
        {
            return Ok(None);
        }

        let now = Utc::now();
        let payout = Payout {
            id: Uuid::new_v4(),
            creator_id: new.creator_id,
            gross_amount: new.gross_amount,
            platform_fee: new.platform_fee,
            net_amount: new.net_amount,
            status: PayoutStatus::Processing,
            crypto_currency: new.currency.clone(),
            crypto_network: new.network.clone(),
            destination_address: new.destination_address.clone(),
            gateway_transfer_id: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        };
        state.payouts.push(payout.clone());
        Ok(Some(payout))
    }

    async fn set_payout_transfer(&self, payout_id: Uuid, transfer_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(p) = state.payouts.iter_mut().find(|p| p.id == payout_id) {
            p.gateway_transfer_id = Some(transfer_id.to_string());
        }
        Ok(())
    }

    async fn fail_payout(&self, payout_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(p) = state.payouts.iter_mut().find(|p| p.id == payout_id) {
            if !p.status.is_terminal() {
                p.status = PayoutStatus::Failed;
            }
        }
        Ok(())
    }

    async fn tag_renewal(&self, subscription_id: Uuid, order_id: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let s = state.subscription_mut(subscription_id)?;
        s.renewal_order_id = order_id.map(str::to_string);
        Ok(())
    }

    async fn expire_lapsed_subscriptions(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let mut lapsed_creators = Vec::new();
        for s in state.subscriptions.iter_mut() {
            let lapsed = s.is_paid_active()
                && s.current_period_end < now
                && (s.renewal_order_id.is_none() || s.current_period_end < stale_before);
            if lapsed {
                s.status = SubscriptionStatus::Expired;
                lapsed_creators.push(s.creator_id);
            }
        }
        for creator_id in &lapsed_creators {
            if let Some(c) = state.creators.get_mut(creator_id) {
                c.subscriber_count = (c.subscriber_count - 1).max(0);
            }
        }
        Ok(lapsed_creators.len() as u64)
    }

    async fn reconcile(
        &self,
        kind: LedgerKind,
        reference: &str,
        planner: &Planner<'_>,
    ) -> Result<ReconcileOutcome> {
        let mut state = self.state.lock().unwrap();
        let Some(row) = state.find_row(kind, reference) else {
            return Ok(ReconcileOutcome::UnknownOrder);
        };

        let plan = planner(&row);
        if let Plan::Apply(transition) = &plan {
            // 복사본에 적용 후 교체 (실패 시 원본 유지)
            let mut staged = state.clone();
            staged.apply(transition)?;
            *state = staged;
        }
        Ok(ReconcileOutcome::from(&plan))
    }
}
