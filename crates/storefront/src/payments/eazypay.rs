//! EazyPay checkout API.
//!
//! Every request carries a `Timestamp` header (milliseconds since the
//! epoch) and a `Secret-Hash` header:
//!
//! ```text
//! Secret-Hash = hex(HMAC-SHA256(secret_key, timestamp || field_1 || ... || field_n))
//! ```
//!
//! where the fields are the request's significant values in a fixed order
//! per endpoint. Webhooks are signed the same way over the raw body.

use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use souq_core::{CurrencyCode, Money};

use super::PaymentError;
use crate::config::EazyPayConfig;

type HmacSha256 = Hmac<Sha256>;

/// Webhooks older (or newer) than this are rejected as replays.
pub const WEBHOOK_TOLERANCE: Duration = Duration::from_secs(300);

/// Compute the `Secret-Hash` for a timestamp and ordered fields.
///
/// # Errors
///
/// Returns `PaymentError::Signature` if the key is rejected by HMAC.
pub fn sign(secret: &[u8], timestamp: &str, fields: &[&str]) -> Result<String, PaymentError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| PaymentError::Signature(e.to_string()))?;
    mac.update(timestamp.as_bytes());
    for field in fields {
        mac.update(field.as_bytes());
    }
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Gateway-reported invoice state, collapsed to what checkout cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    Paid,
    Failed,
    Pending,
}

impl InvoiceStatus {
    /// Map the gateway's status string. Unknown values are still pending.
    #[must_use]
    pub fn from_gateway(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "PAID" => Self::Paid,
            "FAILED" | "CANCELLED" | "EXPIRED" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Invoice to create.
#[derive(Debug, Clone)]
pub struct InvoiceRequest {
    pub amount: Money,
    /// Shown on the payment page.
    pub description: String,
    /// Where the customer's browser returns after paying.
    pub return_url: String,
    pub webhook_url: String,
    /// Merchant reference; the checkout session id.
    pub reference: String,
    pub customer_email: String,
    pub customer_phone: String,
}

/// A created invoice.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    /// Invoice id, used for polling and matched against webhooks.
    pub global_transactions_id: String,
    pub payment_url: String,
}

/// Invoice details returned by a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceDetails {
    pub global_transactions_id: String,
    pub status: String,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
}

impl InvoiceDetails {
    #[must_use]
    pub fn invoice_status(&self) -> InvoiceStatus {
        InvoiceStatus::from_gateway(&self.status)
    }
}

/// Webhook body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub global_transactions_id: String,
    pub status: String,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub merchant_reference: Option<String>,
}

impl WebhookEvent {
    #[must_use]
    pub fn invoice_status(&self) -> InvoiceStatus {
        InvoiceStatus::from_gateway(&self.status)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResult {
    is_success: bool,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: ApiResult,
    data: Option<T>,
}

/// EazyPay API client.
#[derive(Clone)]
pub struct EazyPayClient {
    http: reqwest::Client,
    config: EazyPayConfig,
}

impl EazyPayClient {
    /// # Errors
    ///
    /// Returns error if the HTTP client fails to build.
    pub fn new(config: EazyPayConfig) -> Result<Self, PaymentError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self { http, config })
    }

    fn secret(&self) -> &[u8] {
        self.config.secret_key.expose_secret().as_bytes()
    }

    /// POST a signed form and unwrap the response envelope.
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, &str)],
        signed_fields: &[&str],
    ) -> Result<T, PaymentError> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let hash = sign(self.secret(), &timestamp, signed_fields)?;

        let response = self
            .http
            .post(format!("{}/{path}", self.config.base_url))
            .header("Timestamp", &timestamp)
            .header("Secret-Hash", hash)
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PaymentError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: Envelope<T> = response.json().await.map_err(|e| PaymentError::Api {
            status: status.as_u16(),
            message: format!("unexpected response: {e}"),
        })?;
        if !envelope.result.is_success {
            return Err(PaymentError::Api {
                status: status.as_u16(),
                message: envelope
                    .result
                    .description
                    .unwrap_or_else(|| "request rejected".to_owned()),
            });
        }
        envelope.data.ok_or_else(|| PaymentError::Api {
            status: status.as_u16(),
            message: "response has no data".to_owned(),
        })
    }

    /// Create an invoice and return its id and payment page.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::Http` on transport failure and
    /// `PaymentError::Api` when the gateway rejects the invoice.
    #[instrument(skip(self, request), fields(reference = %request.reference, amount = %request.amount))]
    pub async fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice, PaymentError> {
        let amount = request.amount.to_gateway_string();
        let currency = CurrencyCode::BHD.as_str();
        let app_id = self.config.app_id.as_str();

        let invoice: Invoice = self
            .call(
                "createInvoice",
                &[
                    ("appId", app_id),
                    ("currency", currency),
                    ("amount", amount.as_str()),
                    ("description", request.description.as_str()),
                    ("returnUrl", request.return_url.as_str()),
                    ("webhookUrl", request.webhook_url.as_str()),
                    ("merchantReference", request.reference.as_str()),
                    ("email", request.customer_email.as_str()),
                    ("mobile", request.customer_phone.as_str()),
                ],
                &[currency, amount.as_str(), app_id],
            )
            .await?;

        debug!(invoice_id = %invoice.global_transactions_id, "EazyPay invoice created");
        Ok(invoice)
    }

    /// Current state of an invoice.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::Http` on transport failure and
    /// `PaymentError::Api` when the gateway rejects the query.
    #[instrument(skip(self))]
    pub async fn query_invoice(&self, invoice_id: &str) -> Result<InvoiceDetails, PaymentError> {
        let app_id = self.config.app_id.as_str();
        self.call(
            "query",
            &[("appId", app_id), ("globalTransactionsId", invoice_id)],
            &[app_id, invoice_id],
        )
        .await
    }

    /// Check a webhook's `Timestamp` and `Secret-Hash` headers against the
    /// raw body.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::Signature` for a stale timestamp or a
    /// signature mismatch.
    pub fn verify_webhook(
        &self,
        timestamp: &str,
        body: &[u8],
        signature: &str,
    ) -> Result<(), PaymentError> {
        verify_webhook_at(
            self.secret(),
            timestamp,
            body,
            signature,
            Utc::now().timestamp_millis(),
        )
    }
}

/// [`EazyPayClient::verify_webhook`] with an explicit clock.
///
/// # Errors
///
/// Returns `PaymentError::Signature` for a stale timestamp or a signature
/// mismatch.
pub fn verify_webhook_at(
    secret: &[u8],
    timestamp: &str,
    body: &[u8],
    signature: &str,
    now_millis: i64,
) -> Result<(), PaymentError> {
    let ts: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| PaymentError::Signature("invalid timestamp".to_owned()))?;

    let tolerance = u64::try_from(WEBHOOK_TOLERANCE.as_millis()).unwrap_or(u64::MAX);
    if now_millis.saturating_sub(ts).unsigned_abs() > tolerance {
        warn!(timestamp = ts, "EazyPay webhook outside replay window");
        return Err(PaymentError::Signature(
            "request timestamp too old".to_owned(),
        ));
    }

    let expected = hex::decode(signature.trim())
        .map_err(|_| PaymentError::Signature("signature is not hex".to_owned()))?;

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| PaymentError::Signature(e.to_string()))?;
    mac.update(timestamp.trim().as_bytes());
    mac.update(body);

    // Constant-time comparison
    mac.verify_slice(&expected)
        .map_err(|_| PaymentError::Signature("signature mismatch".to_owned()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::Json;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use secrecy::SecretString;

    use super::*;

    const SECRET: &str = "ez-Q7v!x9LmP2#tR4zW8kB";

    fn config(base_url: &str) -> EazyPayConfig {
        EazyPayConfig {
            app_id: "app-123".to_owned(),
            secret_key: SecretString::from(SECRET),
            base_url: base_url.to_owned(),
        }
    }

    #[test]
    fn test_invoice_status_mapping() {
        assert_eq!(InvoiceStatus::from_gateway("PAID"), InvoiceStatus::Paid);
        assert_eq!(InvoiceStatus::from_gateway("paid"), InvoiceStatus::Paid);
        assert_eq!(InvoiceStatus::from_gateway("FAILED"), InvoiceStatus::Failed);
        assert_eq!(InvoiceStatus::from_gateway("Cancelled"), InvoiceStatus::Failed);
        assert_eq!(InvoiceStatus::from_gateway("EXPIRED"), InvoiceStatus::Failed);
        assert_eq!(InvoiceStatus::from_gateway("PENDING"), InvoiceStatus::Pending);
        assert_eq!(InvoiceStatus::from_gateway("SOMETHING_NEW"), InvoiceStatus::Pending);
    }

    #[test]
    fn test_sign_concatenates_timestamp_and_fields() {
        let joined = sign(SECRET.as_bytes(), "1700000000000", &["BHD", "12.500", "app-123"]).unwrap();
        let whole = sign(SECRET.as_bytes(), "1700000000000BHD12.500app-123", &[]).unwrap();
        assert_eq!(joined, whole);
        assert_eq!(joined.len(), 64);
    }

    #[test]
    fn test_verify_webhook_accepts_fresh_signed_body() {
        let now = 1_700_000_000_000_i64;
        let body = br#"{"globalTransactionsId":"inv-1","status":"PAID"}"#;
        let ts = now.to_string();
        let sig = sign(SECRET.as_bytes(), &ts, &[std::str::from_utf8(body).unwrap()]).unwrap();

        assert!(verify_webhook_at(SECRET.as_bytes(), &ts, body, &sig, now + 1_000).is_ok());
        assert!(
            verify_webhook_at(SECRET.as_bytes(), &ts, body, &sig.to_uppercase(), now).is_ok()
        );
    }

    #[test]
    fn test_verify_webhook_rejects_tampering_and_replay() {
        let now = 1_700_000_000_000_i64;
        let body = br#"{"globalTransactionsId":"inv-1","status":"PAID"}"#;
        let ts = now.to_string();
        let sig = sign(SECRET.as_bytes(), &ts, &[std::str::from_utf8(body).unwrap()]).unwrap();

        let tampered = br#"{"globalTransactionsId":"inv-2","status":"PAID"}"#;
        assert!(verify_webhook_at(SECRET.as_bytes(), &ts, tampered, &sig, now).is_err());
        assert!(verify_webhook_at(b"other-secret", &ts, body, &sig, now).is_err());
        assert!(
            verify_webhook_at(SECRET.as_bytes(), &ts, body, &sig, now + 301_000).is_err(),
            "stale webhook must be rejected"
        );
        assert!(verify_webhook_at(SECRET.as_bytes(), "yesterday", body, &sig, now).is_err());
        assert!(verify_webhook_at(SECRET.as_bytes(), &ts, body, "zz", now).is_err());
    }

    #[test]
    fn test_webhook_event_parses() {
        let event: WebhookEvent = serde_json::from_str(
            r#"{"globalTransactionsId":"inv-9","status":"CANCELLED","amount":"5.000"}"#,
        )
        .unwrap();
        assert_eq!(event.invoice_status(), InvoiceStatus::Failed);
        assert_eq!(event.merchant_reference, None);
    }

    async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
        headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_create_invoice_signs_request() {
        let router = axum::Router::new().route(
            "/createInvoice",
            post(|headers: HeaderMap, body: String| async move {
                let ts = header(&headers, "Timestamp");
                let expected = sign(SECRET.as_bytes(), ts, &["BHD", "7.250", "app-123"]).unwrap();
                if header(&headers, "Secret-Hash") != expected || !body.contains("amount=7.250") {
                    return Json(serde_json::json!({
                        "result": {"isSuccess": false, "description": "bad hash"}
                    }));
                }
                Json(serde_json::json!({
                    "result": {"isSuccess": true},
                    "data": {"globalTransactionsId": "inv-77", "paymentUrl": "https://pay.test/inv-77"}
                }))
            }),
        );
        let client = EazyPayClient::new(config(&serve(router).await)).unwrap();

        let invoice = client
            .create_invoice(&InvoiceRequest {
                amount: Money::from_fils(7_250),
                description: "Order".to_owned(),
                return_url: "https://shop.test/return".to_owned(),
                webhook_url: "https://shop.test/hook".to_owned(),
                reference: "session-1".to_owned(),
                customer_email: "a@b.bh".to_owned(),
                customer_phone: "+97333334444".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(invoice.global_transactions_id, "inv-77");
        assert_eq!(invoice.payment_url, "https://pay.test/inv-77");
    }

    #[tokio::test]
    async fn test_query_invoice_reports_rejection() {
        let router = axum::Router::new().route(
            "/query",
            post(|| async {
                Json(serde_json::json!({
                    "result": {"isSuccess": false, "description": "invoice not found"}
                }))
            }),
        );
        let client = EazyPayClient::new(config(&serve(router).await)).unwrap();

        let err = client.query_invoice("inv-missing").await.unwrap_err();
        assert!(
            matches!(err, PaymentError::Api { ref message, .. } if message == "invoice not found"),
            "{err}"
        );
    }
}
