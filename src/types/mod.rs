//! Common Types Module
//!
//! 애플리케이션 전반에서 사용되는 공통 타입 정의
//!
//! - 금액 정규화 (`round2`, `format_usd`)
//! - 결제 기간 계산 (`add_billing_period`)
//! - 원장 종류 (`LedgerKind`)
//! - 게이트웨이 주문 ID (`OrderId`)

use std::fmt;

use chrono::{DateTime, Months, Utc};
use rand::Rng;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// 금액을 소수점 2자리로 정규화 (half-up)
///
/// 저장 전 모든 금액은 이 함수를 거친다.
/// scale도 2로 고정하므로 `to_string()` 결과가 항상 "25.00" 형태가 된다.
pub fn round2(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(2);
    rounded
}

/// 표시 / 로그용 금액 문자열 ("$9.99")
pub fn format_usd(value: Decimal) -> String {
    format!("${}", round2(value))
}

/// 결제 기간 `months`만큼 이동 (월말은 chrono가 말일로 보정)
///
/// 표현 범위를 넘으면 None
pub fn add_billing_period(from: DateTime<Utc>, months: u32) -> Option<DateTime<Utc>> {
    from.checked_add_months(Months::new(months))
}

/// 원장 row 종류
///
/// 웹훅 엔드포인트, 주문 ID 태그, 트랜잭션 로그 타입이 모두 이 값으로 결정됨
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Subscription,
    Tip,
    Ppv,
    Payout,
}

impl LedgerKind {
    /// 주문 ID 앞에 붙는 짧은 태그
    pub fn tag(&self) -> &'static str {
        match self {
            LedgerKind::Subscription => "sub",
            LedgerKind::Tip => "tip",
            LedgerKind::Ppv => "ppv",
            LedgerKind::Payout => "payout",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Subscription => "subscription",
            LedgerKind::Tip => "tip",
            LedgerKind::Ppv => "ppv",
            LedgerKind::Payout => "payout",
        }
    }

    /// `/webhooks/:kind` 경로 파라미터 파싱
    pub fn from_path(segment: &str) -> Option<Self> {
        match segment {
            "subscription" => Some(LedgerKind::Subscription),
            "tip" => Some(LedgerKind::Tip),
            "ppv" => Some(LedgerKind::Ppv),
            "payout" => Some(LedgerKind::Payout),
            _ => None,
        }
    }
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 게이트웨이 주문 ID
///
/// 형식: `{tag}_{userPrefix}_{timestampBase36}_{random}`
///
/// ```text
/// tip_3f2a9c1d_m2x8k1qz_p0v7c
/// ```
///
/// 내부 원장 row와 게이트웨이 콜백을 연결하는 유일한 키.
/// grep 하기 쉽도록 종류와 사용자 prefix를 그대로 노출한다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(String);

impl OrderId {
    const PREFIX_LEN: usize = 8;
    const SUFFIX_LEN: usize = 5;

    pub fn generate(kind: LedgerKind, owner_id: &str) -> Self {
        let prefix: String = owner_id
            .chars()
            .filter(|c| *c != '-')
            .take(Self::PREFIX_LEN)
            .collect();
        let millis = Utc::now().timestamp_millis().max(0) as u64;

        let mut rng = rand::thread_rng();
        let suffix: String = (0..Self::SUFFIX_LEN)
            .map(|_| base36_digit(rng.gen_range(0..36)))
            .collect();

        Self(format!("{}_{}_{}_{}", kind.tag(), prefix, to_base36(millis), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn base36_digit(n: u32) -> char {
    std::char::from_digit(n, 36).unwrap_or('0')
}

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(base36_digit((n % 36) as u32));
        n /= 36;
    }
    digits.iter().rev().collect()
}
