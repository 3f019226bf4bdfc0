//! BENEFIT payment gateway.
//!
//! # Flow
//!
//! 1. The merchant encrypts the payment parameters into `trandata` and
//!    POSTs it to the hosted payment API, which answers with the URL of
//!    the hosted card page.
//! 2. After the customer pays, BENEFIT POSTs an encrypted `trandata`
//!    form field to the merchant's `responseURL`. The merchant answers
//!    with `REDIRECT=<url>` to send the customer's browser onward.
//! 3. Declines and gateway errors go to `errorURL` instead.
//!
//! `trandata` is AES-256-CBC over a URL-encoded parameter string, PKCS#7
//! padded, with the terminal resource key and a fixed IV, hex encoded.

use std::collections::BTreeMap;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use souq_core::{CurrencyCode, Money};

use super::PaymentError;
use crate::config::BenefitConfig;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Initialization vector fixed by the gateway.
const IV: &[u8; 16] = b"PGKEYENCDECIVSPC";

/// `action=1` is a purchase.
const ACTION_PURCHASE: &str = "1";

const LANGUAGE: &str = "USA";

/// Result code for a successful capture.
pub const RESULT_CAPTURED: &str = "CAPTURED";

/// Encrypts and decrypts `trandata` with a terminal resource key.
pub struct TrandataCodec {
    key: SecretBox<[u8; 32]>,
}

impl TrandataCodec {
    /// # Errors
    ///
    /// Returns `PaymentError::Crypto` unless the key is exactly 32 bytes.
    pub fn new(resource_key: &[u8]) -> Result<Self, PaymentError> {
        let key: [u8; 32] = resource_key.try_into().map_err(|_| {
            PaymentError::Crypto(format!(
                "resource key must be 32 bytes, got {}",
                resource_key.len()
            ))
        })?;
        Ok(Self {
            key: SecretBox::new(Box::new(key)),
        })
    }

    /// Encrypt to upper-case hex.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::Crypto` if the cipher cannot be initialized.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, PaymentError> {
        let cipher = Aes256CbcEnc::new_from_slices(self.key.expose_secret(), IV)
            .map_err(|e| PaymentError::Crypto(e.to_string()))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        Ok(hex::encode_upper(ciphertext))
    }

    /// Decrypt hex `trandata` (either case).
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::Encoding` for bad hex or non-UTF-8 plaintext,
    /// `PaymentError::Crypto` for a wrong key or corrupted data.
    pub fn decrypt(&self, trandata: &str) -> Result<String, PaymentError> {
        let ciphertext = hex::decode(trandata.trim())
            .map_err(|e| PaymentError::Encoding(format!("trandata is not hex: {e}")))?;
        let cipher = Aes256CbcDec::new_from_slices(self.key.expose_secret(), IV)
            .map_err(|e| PaymentError::Crypto(e.to_string()))?;
        let plaintext = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| PaymentError::Crypto("trandata padding is invalid".to_owned()))?;
        String::from_utf8(plaintext)
            .map_err(|e| PaymentError::Encoding(format!("trandata is not UTF-8: {e}")))
    }
}

/// Join `key=value` pairs with `&`, percent-encoding values.
#[must_use]
pub fn encode_params(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Parse a `key=value&...` string. `+` is read as a space.
///
/// # Errors
///
/// Returns `PaymentError::Encoding` if a value is not valid percent-encoded
/// UTF-8.
pub fn decode_params(input: &str) -> Result<BTreeMap<String, String>, PaymentError> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = urlencoding::decode(&value.replace('+', " "))
                .map_err(|e| PaymentError::Encoding(format!("bad value for {key}: {e}")))?
                .into_owned();
            Ok((key.to_owned(), value))
        })
        .collect()
}

/// A purchase to send to the hosted payment page.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub amount: Money,
    /// Merchant reference echoed back in the notification.
    pub track_id: String,
    /// Free-form fields echoed back; `udf[0]` carries the checkout session id.
    pub udf: [Option<String>; 5],
    pub response_url: String,
    pub error_url: String,
}

impl PaymentRequest {
    /// Plaintext parameter string for `trandata`.
    fn to_plaintext(&self, config: &BenefitConfig) -> String {
        let amount = self.amount.to_gateway_string();
        let udf: Vec<&str> = self.udf.iter().map(|u| u.as_deref().unwrap_or("")).collect();
        let mut params = vec![
            ("id", config.tranportal_id.as_str()),
            ("password", config.tranportal_password.expose_secret()),
            ("action", ACTION_PURCHASE),
            ("currencycode", CurrencyCode::BHD.numeric()),
            ("langid", LANGUAGE),
            ("amt", amount.as_str()),
            ("trackId", self.track_id.as_str()),
            ("responseURL", self.response_url.as_str()),
            ("errorURL", self.error_url.as_str()),
        ];
        for (name, value) in ["udf1", "udf2", "udf3", "udf4", "udf5"].into_iter().zip(udf) {
            params.push((name, value));
        }
        encode_params(&params)
    }
}

#[derive(Debug, Serialize)]
struct InitRequest<'a> {
    id: &'a str,
    trandata: String,
    #[serde(rename = "responseURL")]
    response_url: &'a str,
    #[serde(rename = "errorURL")]
    error_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct InitResponse {
    status: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default, rename = "errorText")]
    error_text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Decrypted payment notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PaymentResponse {
    #[serde(default, alias = "paymentid", alias = "paymentId")]
    pub payment_id: Option<String>,
    /// `CAPTURED`, `NOT CAPTURED`, `CANCELED`, `DENIED BY RISK`, ...
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
    #[serde(default, alias = "tranid", alias = "transId")]
    pub trans_id: Option<String>,
    #[serde(default, alias = "trackid", alias = "trackId")]
    pub track_id: Option<String>,
    #[serde(default, alias = "amt")]
    pub amount: Option<String>,
    #[serde(default)]
    pub udf1: Option<String>,
    #[serde(default)]
    pub udf2: Option<String>,
    #[serde(default, alias = "Error")]
    pub error: Option<String>,
    #[serde(default, alias = "ErrorText", alias = "errorText")]
    pub error_text: Option<String>,
}

impl PaymentResponse {
    /// Parse decrypted notification plaintext.
    ///
    /// The gateway sends either a parameter string or a JSON array holding
    /// one object; both are accepted.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::Encoding` if neither form parses.
    pub fn parse(plaintext: &str) -> Result<Self, PaymentError> {
        let trimmed = plaintext.trim();
        if trimmed.starts_with('[') {
            let mut list: Vec<Self> = serde_json::from_str(trimmed)
                .map_err(|e| PaymentError::Encoding(format!("notification JSON: {e}")))?;
            return list
                .pop()
                .ok_or_else(|| PaymentError::Encoding("empty notification".to_owned()));
        }
        if trimmed.starts_with('{') {
            return serde_json::from_str(trimmed)
                .map_err(|e| PaymentError::Encoding(format!("notification JSON: {e}")));
        }

        let params = decode_params(trimmed)?;
        let object: serde_json::Map<String, serde_json::Value> = params
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();
        serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| PaymentError::Encoding(format!("notification fields: {e}")))
    }

    /// Whether the money was captured.
    #[must_use]
    pub fn is_captured(&self) -> bool {
        self.result.as_deref().map(str::trim) == Some(RESULT_CAPTURED)
    }

    /// Best human-readable reason for a non-captured result.
    #[must_use]
    pub fn failure_reason(&self) -> String {
        self.error_text
            .clone()
            .or_else(|| self.result.clone())
            .or_else(|| self.error.clone())
            .unwrap_or_else(|| "payment not captured".to_owned())
    }

    /// Raw fields for storing on the session.
    #[must_use]
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "paymentId": self.payment_id,
            "result": self.result,
            "auth": self.auth,
            "ref": self.reference,
            "transId": self.trans_id,
            "trackId": self.track_id,
            "amount": self.amount,
            "error": self.error,
            "errorText": self.error_text,
        })
    }
}

/// BENEFIT hosted payment API client.
#[derive(Clone)]
pub struct BenefitClient {
    http: reqwest::Client,
    config: BenefitConfig,
    codec: std::sync::Arc<TrandataCodec>,
}

impl BenefitClient {
    /// # Errors
    ///
    /// Returns error if the resource key is invalid or the HTTP client fails
    /// to build.
    pub fn new(config: BenefitConfig) -> Result<Self, PaymentError> {
        let codec = TrandataCodec::new(config.resource_key.expose_secret().as_bytes())?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            config,
            codec: std::sync::Arc::new(codec),
        })
    }

    /// Request a hosted payment page and return its URL.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::Http` on transport failure and
    /// `PaymentError::Api` when the gateway rejects the request.
    #[instrument(skip(self, request), fields(track_id = %request.track_id, amount = %request.amount))]
    pub async fn create_payment(&self, request: &PaymentRequest) -> Result<String, PaymentError> {
        let trandata = self.codec.encrypt(&request.to_plaintext(&self.config))?;
        let body = [InitRequest {
            id: &self.config.tranportal_id,
            trandata,
            response_url: &request.response_url,
            error_url: &request.error_url,
        }];

        let response = self
            .http
            .post(&self.config.endpoint)
            .json(&body)
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

        let mut replies: Vec<InitResponse> = response.json().await.map_err(|e| {
            PaymentError::Api {
                status: status.as_u16(),
                message: format!("unexpected response: {e}"),
            }
        })?;
        let reply = replies.pop().ok_or_else(|| PaymentError::Api {
            status: status.as_u16(),
            message: "empty response".to_owned(),
        })?;

        if reply.status == "1"
            && let Some(url) = reply.result.filter(|u| !u.is_empty())
        {
            debug!("BENEFIT payment page created");
            return Ok(url);
        }
        Err(PaymentError::Api {
            status: status.as_u16(),
            message: reply
                .error_text
                .or(reply.error)
                .unwrap_or_else(|| "payment initialization failed".to_owned()),
        })
    }

    /// Decrypt and parse a notification's `trandata`.
    ///
    /// AES-CBC carries no MAC, so a clean decrypt does not prove the
    /// gateway sent it. Callers match the track id to a known session and
    /// compare the amount.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::Crypto` or `PaymentError::Encoding` for
    /// trandata that does not decrypt or parse.
    pub fn parse_notification(&self, trandata: &str) -> Result<PaymentResponse, PaymentError> {
        let plaintext = self.codec.decrypt(trandata)?;
        PaymentResponse::parse(&plaintext)
    }

    /// Encrypt arbitrary parameters with this terminal's key.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::Crypto` if the cipher cannot be initialized.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, PaymentError> {
        self.codec.encrypt(plaintext)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    const KEY: &[u8] = b"4k7Qz9Wm2Xp5Rt8Yv1Bn6Cd3Fg0Hj4Ls";

    fn config(endpoint: &str) -> BenefitConfig {
        BenefitConfig {
            tranportal_id: "TP001".to_owned(),
            tranportal_password: SecretString::from("pa55 word&"),
            resource_key: SecretString::from(String::from_utf8(KEY.to_vec()).unwrap()),
            endpoint: endpoint.to_owned(),
        }
    }

    #[test]
    fn test_encrypt_matches_known_vector() {
        let codec = TrandataCodec::new(KEY).unwrap();
        let trandata = codec.encrypt("id=TP001&amt=12.500&trackId=SQ42").unwrap();
        assert_eq!(
            trandata,
            "81FC9412D764B8F568DE8BFBF8819B11F73812788287AB267BC7436889836C36\
             62663E4FF5BE33659745959AA6D5DB08"
        );
    }

    #[test]
    fn test_decrypt_accepts_lower_case_hex() {
        let codec = TrandataCodec::new(KEY).unwrap();
        let trandata = codec.encrypt("result=CAPTURED").unwrap().to_lowercase();
        assert_eq!(codec.decrypt(&trandata).unwrap(), "result=CAPTURED");
    }

    #[test]
    fn test_decrypt_rejects_wrong_key_and_garbage() {
        let codec = TrandataCodec::new(KEY).unwrap();
        let other = TrandataCodec::new(b"00000000000000000000000000000000").unwrap();
        let trandata = codec.encrypt("result=CAPTURED&trackId=SQ42").unwrap();

        assert!(other.decrypt(&trandata).is_err());
        assert!(matches!(
            codec.decrypt("not hex at all"),
            Err(PaymentError::Encoding(_))
        ));
        assert!(TrandataCodec::new(b"short").is_err());
    }

    #[test]
    fn test_plaintext_carries_gateway_fields() {
        let request = PaymentRequest {
            amount: Money::from_fils(12_500),
            track_id: "SQ42".to_owned(),
            udf: [Some("session-1".to_owned()), None, None, None, None],
            response_url: "https://shop.test/api/payments/benefit/notify".to_owned(),
            error_url: "https://shop.test/api/payments/benefit/error".to_owned(),
        };
        let params = decode_params(&request.to_plaintext(&config("http://unused"))).unwrap();

        assert_eq!(params["id"], "TP001");
        assert_eq!(params["password"], "pa55 word&");
        assert_eq!(params["action"], "1");
        assert_eq!(params["currencycode"], "048");
        assert_eq!(params["langid"], "USA");
        assert_eq!(params["amt"], "12.500");
        assert_eq!(params["trackId"], "SQ42");
        assert_eq!(params["udf1"], "session-1");
        assert_eq!(params["udf2"], "");
        assert_eq!(
            params["responseURL"],
            "https://shop.test/api/payments/benefit/notify"
        );
    }

    #[test]
    fn test_parse_param_notification() {
        let response = PaymentResponse::parse(
            "paymentid=100200300&result=CAPTURED&auth=A1&ref=R9&tranid=T7&trackid=SQ42&amt=12.500&udf1=abc",
        )
        .unwrap();
        assert!(response.is_captured());
        assert_eq!(response.payment_id.as_deref(), Some("100200300"));
        assert_eq!(response.reference.as_deref(), Some("R9"));
        assert_eq!(response.trans_id.as_deref(), Some("T7"));
        assert_eq!(response.track_id.as_deref(), Some("SQ42"));
        assert_eq!(response.udf1.as_deref(), Some("abc"));
    }

    #[test]
    fn test_parse_json_notification() {
        let response = PaymentResponse::parse(
            r#"[{"paymentId":"1","result":"NOT CAPTURED","trackId":"SQ42","ErrorText":"Insufficient funds"}]"#,
        )
        .unwrap();
        assert!(!response.is_captured());
        assert_eq!(response.failure_reason(), "Insufficient funds");
    }

    #[test]
    fn test_notification_round_trip_through_client() {
        let client = BenefitClient::new(config("http://unused")).unwrap();
        let trandata = client
            .encrypt(&encode_params(&[("result", "CAPTURED"), ("trackId", "SQ 42")]))
            .unwrap();
        let response = client.parse_notification(&trandata).unwrap();
        assert!(response.is_captured());
        assert_eq!(response.track_id.as_deref(), Some("SQ 42"));
    }

    async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/hosted")
    }

    #[tokio::test]
    async fn test_create_payment_returns_page_url() {
        use axum::Json;
        use axum::routing::post;

        let router = axum::Router::new().route(
            "/hosted",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body[0]["id"], "TP001");
                let trandata = body[0]["trandata"].as_str().unwrap();
                let plain = TrandataCodec::new(KEY).unwrap().decrypt(trandata).unwrap();
                assert!(plain.contains("amt=3.000"));
                Json(serde_json::json!([{"status": "1", "result": "https://pay.test/page?id=9"}]))
            }),
        );
        let client = BenefitClient::new(config(&serve(router).await)).unwrap();

        let url = client
            .create_payment(&PaymentRequest {
                amount: Money::from_fils(3_000),
                track_id: "SQ1".to_owned(),
                udf: Default::default(),
                response_url: "https://shop.test/ok".to_owned(),
                error_url: "https://shop.test/err".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(url, "https://pay.test/page?id=9");
    }

    #[tokio::test]
    async fn test_create_payment_surfaces_gateway_error() {
        use axum::Json;
        use axum::routing::post;

        let router = axum::Router::new().route(
            "/hosted",
            post(|| async {
                Json(serde_json::json!([{"status": "2", "errorText": "IPAY0100013-Invalid transaction data."}]))
            }),
        );
        let client = BenefitClient::new(config(&serve(router).await)).unwrap();

        let err = client
            .create_payment(&PaymentRequest {
                amount: Money::from_fils(3_000),
                track_id: "SQ1".to_owned(),
                udf: Default::default(),
                response_url: "https://shop.test/ok".to_owned(),
                error_url: "https://shop.test/err".to_owned(),
            })
            .await
            .unwrap_err();
        assert!(
            matches!(err, PaymentError::Api { ref message, .. } if message.contains("IPAY0100013")),
            "{err}"
        );
    }
}
