//! Payment gateway adapters.
//!
//! - [`benefit`] - BENEFIT debit card gateway: AES-encrypted `trandata`,
//!   hosted payment page, server-to-server notification.
//! - [`eazypay`] - EazyPay invoices: signed REST calls, HMAC webhook,
//!   invoice status polling.
//!
//! Adapters only speak the wire formats. What a payment result means for
//! a checkout session is decided in [`crate::services::checkout`].

pub mod benefit;
pub mod eazypay;

use thiserror::Error;

pub use benefit::BenefitClient;
pub use eazypay::EazyPayClient;

/// Errors from talking to a payment gateway.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// Encryption or decryption failed (bad key, bad padding).
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Payload could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Gateway answered with an error or an unexpected shape.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Webhook or notification authenticity check failed.
    #[error("invalid signature: {0}")]
    Signature(String),
}
