//! Payment Gateway Adapter
//!
//! 외부 crypto 결제 게이트웨이의 세부 사항을 세 가지 연산 뒤에 숨긴다.
//!
//! - `create_checkout`: checkout 세션 생성 → 리다이렉트 URL
//! - `initiate_payout`: 크리에이터 지갑으로 송금 → transfer id
//! - `WebhookVerifier::verify`: 웹훅 원문 바이트의 HMAC-SHA256 서명 검증
//!
//! # Interview Q&A
//!
//! Q: 서명 검증을 JSON 파싱 뒤에 하면 안 되는 이유는?
//! A: 재직렬화 결과가 원문과 바이트 단위로 같다는 보장이 없음
//!    - 키 순서, 공백, 숫자 표기(1.0 vs 1)가 달라질 수 있음
//!    - 따라서 HTTP body 원문(Bytes)에 대해 MAC을 계산해야 함
//!
//! Q: 문자열 `==` 비교 대신 `verify_slice`를 쓰는 이유는?
//! A: 타이밍 사이드채널
//!    - `==`는 첫 번째 다른 바이트에서 바로 반환
//!    - 응답 시간 차이로 서명을 한 바이트씩 맞춰갈 수 있음
//!    - `Mac::verify_slice`는 상수 시간 비교
//!
//! Q: payload 암호화는?
//! A: AES-256-GCM, 키 = SHA-256(api_secret)
//!    wire 형식: `{ "data": base64(nonce || ciphertext) }`

use std::time::Duration;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::GatewayConfig;
use crate::types::round2;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;

// ============ Errors ============

#[derive(Debug, Error)]
pub enum GatewayError {
    /// non-2xx 응답 (status/body는 로그용)
    #[error("gateway rejected request: {status} {body}")]
    Rejected { status: u16, body: String },

    #[error("gateway request timed out")]
    Timeout,

    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("payload encryption failed: {0}")]
    Encryption(String),

    #[error("malformed gateway response: {0}")]
    MalformedResponse(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

// ============ Requests ============

/// checkout 세션 생성 요청
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutRequest {
    pub order_id: String,
    pub amount_usd: Decimal,
    pub payer_email: String,
    pub payer_name: String,
    pub redirect_url: String,
    pub cancel_url: String,
    pub webhook_url: String,
}

/// 크리에이터 지갑 송금 요청
#[derive(Debug, Clone, PartialEq)]
pub struct PayoutRequest {
    pub payout_id: String,
    pub amount_usd: Decimal,
    pub destination_address: String,
    /// USDT, ETH, BNB ...
    pub currency: String,
    /// ERC20, BEP20, TRC20 ...
    pub network: String,
    pub payee_email: String,
    pub payee_name: String,
    pub webhook_url: String,
}

/// 게이트웨이 포트
///
/// 서비스는 이 trait에만 의존하고, 테스트는 `fake::FakeGateway`로 대체한다.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// checkout URL 반환
    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<String, GatewayError>;

    /// transfer id 반환
    async fn initiate_payout(&self, request: &PayoutRequest) -> Result<String, GatewayError>;
}

// ============ Wire payloads ============

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutPayload<'a> {
    #[serde(rename = "orderID")]
    order_id: &'a str,
    amount: String,
    currency: &'static str,
    timestamp: String,
    user_name: &'a str,
    site_name: &'a str,
    user_email: &'a str,
    redirect_url: &'a str,
    website_url: &'a str,
    cancel_url: &'a str,
    webhook_url: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PayoutPayload<'a> {
    #[serde(rename = "payoutID")]
    payout_id: &'a str,
    amount: String,
    currency: &'static str,
    crypto_currency: &'a str,
    network: &'a str,
    destination_address: &'a str,
    timestamp: String,
    recipient_name: &'a str,
    recipient_email: &'a str,
    webhook_url: &'a str,
}

#[derive(Debug, Serialize)]
struct EncryptedEnvelope {
    data: String,
}

/// 2자리 고정 소수 문자열 ("9.99")
fn amount_string(amount: Decimal) -> String {
    round2(amount).to_string()
}

fn unix_timestamp() -> String {
    Utc::now().timestamp().to_string()
}

// ============ Payload cipher ============

/// AES-256-GCM payload 암호화
#[derive(Clone)]
pub struct PayloadCipher {
    cipher: Aes256Gcm,
}

impl PayloadCipher {
    pub fn new(api_secret: &str) -> Self {
        let key = Sha256::digest(api_secret.as_bytes());
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// base64(nonce || ciphertext)
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, GatewayError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| GatewayError::Encryption(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, GatewayError> {
        let sealed = BASE64
            .decode(encoded)
            .map_err(|e| GatewayError::Encryption(e.to_string()))?;
        if sealed.len() < NONCE_LEN {
            return Err(GatewayError::Encryption("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| GatewayError::Encryption(e.to_string()))
    }

    fn seal<T: Serialize>(&self, payload: &T) -> Result<EncryptedEnvelope, GatewayError> {
        let json = serde_json::to_vec(payload).map_err(|e| GatewayError::Encryption(e.to_string()))?;
        Ok(EncryptedEnvelope {
            data: self.encrypt(&json)?,
        })
    }
}

// ============ Webhook signature ============

/// 웹훅 서명 검증기
///
/// 헤더 값은 HMAC-SHA256(raw_body, api_secret)의 hex 인코딩.
#[derive(Clone)]
pub struct WebhookVerifier {
    mac: HmacSha256,
}

impl WebhookVerifier {
    pub fn new(api_secret: &str) -> anyhow::Result<Self> {
        // aead::KeyInit도 new_from_slice를 제공하므로 Mac으로 고정
        let mac = <HmacSha256 as Mac>::new_from_slice(api_secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid webhook secret: {}", e))?;
        Ok(Self { mac })
    }

    /// 원문 바이트 기준 검증. hex가 아니거나 길이가 다르면 false
    pub fn verify(&self, raw_body: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature.trim()) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(raw_body);
        mac.verify_slice(&expected).is_ok()
    }

    pub fn sign(&self, raw_body: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(raw_body);
        hex::encode(mac.finalize().into_bytes())
    }
}

// ============ HTTP client ============

/// reqwest 기반 게이트웨이 클라이언트
pub struct GatewayClient {
    http: reqwest::Client,
    cipher: PayloadCipher,
    api_key: String,
    base_url: String,
    site_name: String,
    website_url: String,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig, website_url: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            http,
            cipher: PayloadCipher::new(&config.api_secret),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            site_name: config.site_name.clone(),
            website_url: website_url.to_string(),
        })
    }

    /// 암호화된 envelope POST 후 JSON 응답 반환
    async fn post_sealed(&self, path: &str, envelope: &EncryptedEnvelope) -> Result<Value, GatewayError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .json(envelope)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%url, status = status.as_u16(), "Gateway returned non-success status");
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))
    }
}

/// 응답 최상위 또는 `data` 아래의 문자열 필드
fn response_field(body: &Value, field: &str) -> Result<String, GatewayError> {
    body.get(field)
        .or_else(|| body.get("data").and_then(|data| data.get(field)))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GatewayError::MalformedResponse(format!("missing {}", field)))
}

#[async_trait]
impl PaymentGateway for GatewayClient {
    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<String, GatewayError> {
        let payload = CheckoutPayload {
            order_id: &request.order_id,
            amount: amount_string(request.amount_usd),
            currency: "USD",
            timestamp: unix_timestamp(),
            user_name: &request.payer_name,
            site_name: &self.site_name,
            user_email: &request.payer_email,
            redirect_url: &request.redirect_url,
            website_url: &self.website_url,
            cancel_url: &request.cancel_url,
            webhook_url: &request.webhook_url,
        };
        let envelope = self.cipher.seal(&payload)?;

        let body = self.post_sealed("order/checkout", &envelope).await?;
        let checkout_url = response_field(&body, "checkoutUrl")?;

        tracing::debug!(order_id = %request.order_id, "Checkout session created");
        Ok(checkout_url)
    }

    async fn initiate_payout(&self, request: &PayoutRequest) -> Result<String, GatewayError> {
        let payload = PayoutPayload {
            payout_id: &request.payout_id,
            amount: amount_string(request.amount_usd),
            currency: "USD",
            crypto_currency: &request.currency,
            network: &request.network,
            destination_address: &request.destination_address,
            timestamp: unix_timestamp(),
            recipient_name: &request.payee_name,
            recipient_email: &request.payee_email,
            webhook_url: &request.webhook_url,
        };
        let envelope = self.cipher.seal(&payload)?;

        let body = self.post_sealed("payout/initiate", &envelope).await?;
        let transfer_id = response_field(&body, "transferId")?;

        tracing::debug!(payout_id = %request.payout_id, %transfer_id, "Payout initiated");
        Ok(transfer_id)
    }
}

// ============ Test double ============


#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_signature_roundtrip() {
        let verifier = WebhookVerifier::new("shh").unwrap();
        let body = br#"{"orderId":"tip_abc","status":"completed"}"#;

        let signature = verifier.sign(body);
        assert!(verifier.verify(body, &signature));
        assert!(verifier.verify(body, &signature.to_uppercase()));
    }

    #[test]
    fn test_signature_is_byte_exact() {
        let verifier = WebhookVerifier::new("shh").unwrap();
        let signature = verifier.sign(br#"{"a":1,"b":2}"#);

        // 같은 JSON 값이라도 바이트가 다르면 실패
        assert!(!verifier.verify(br#"{"b":2,"a":1}"#, &signature));
        assert!(!verifier.verify(br#"{"a":1, "b":2}"#, &signature));
    }

    #[test]
    fn test_signature_rejects_malformed_header() {
        let verifier = WebhookVerifier::new("shh").unwrap();
        let body = b"payload";

        assert!(!verifier.verify(body, ""));
        assert!(!verifier.verify(body, "not-hex"));
        assert!(!verifier.verify(body, "abcd"));
        assert!(!WebhookVerifier::new("other").unwrap().verify(body, &verifier.sign(body)));
    }

    #[test]
    fn test_cipher_roundtrip_and_nonce() {
        let cipher = PayloadCipher::new("secret");
        let a = cipher.encrypt(b"hello").unwrap();
        let b = cipher.encrypt(b"hello").unwrap();

        assert_ne!(a, b, "Each encryption should use a fresh nonce");
        assert_eq!(cipher.decrypt(&a).unwrap(), b"hello");
        assert!(PayloadCipher::new("wrong").decrypt(&a).is_err());
        assert!(cipher.decrypt("AAAA").is_err());
    }

    #[test]
    fn test_checkout_payload_shape() {
        let payload = CheckoutPayload {
            order_id: "sub_abc",
            amount: amount_string(dec!(9.9)),
            currency: "USD",
            timestamp: "1700000000".to_string(),
            user_name: "Ann",
            site_name: "FanVault",
            user_email: "ann@example.com",
            redirect_url: "r",
            website_url: "w",
            cancel_url: "c",
            webhook_url: "h",
        };
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["orderID"], "sub_abc");
        assert_eq!(json["amount"], "9.90");
        assert_eq!(json["currency"], "USD");
        assert_eq!(json["userEmail"], "ann@example.com");
        assert_eq!(json["webhookUrl"], "h");
    }

    #[test]
    fn test_payout_payload_shape() {
        let payload = PayoutPayload {
            payout_id: "p1",
            amount: amount_string(dec!(80)),
            currency: "USD",
            crypto_currency: "USDT",
            network: "TRC20",
            destination_address: "T123",
            timestamp: unix_timestamp(),
            recipient_name: "Cat",
            recipient_email: "cat@example.com",
            webhook_url: "h",
        };
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["payoutID"], "p1");
        assert_eq!(json["amount"], "80.00");
        assert_eq!(json["cryptoCurrency"], "USDT");
        assert_eq!(json["destinationAddress"], "T123");
    }

    #[test]
    fn test_response_field_lookup() {
        let top = serde_json::json!({ "checkoutUrl": "https://a" });
        let nested = serde_json::json!({ "data": { "checkoutUrl": "https://b" } });

        assert_eq!(response_field(&top, "checkoutUrl").unwrap(), "https://a");
        assert_eq!(response_field(&nested, "checkoutUrl").unwrap(), "https://b");
        assert!(matches!(
            response_field(&serde_json::json!({}), "transferId"),
            Err(GatewayError::MalformedResponse(_))
        ));
    }
}
