//! Storefront configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `STOREFRONT_DATABASE_URL` - `PostgreSQL` connection string (falls back to `DATABASE_URL`)
//! - `STOREFRONT_BASE_URL` - Public URL used to build gateway return URLs
//! - `STOREFRONT_SESSION_SECRET` - Session signing secret (min 32 chars, high entropy)
//! - `CRON_SECRET` - Bearer token expected by the `/api/cron/*` endpoints
//!
//! ## Optional
//! - `STOREFRONT_HOST` - Bind address (default: 127.0.0.1)
//! - `STOREFRONT_PORT` - Listen port (default: 3000)
//! - `STOREFRONT_ALLOWED_ORIGINS` - Comma-separated CORS origins
//! - `CHECKOUT_TTL_MINUTES` - Reservation window (default: 30)
//! - `SHIPPING_FEE` - Flat delivery fee in BHD (default: 1.000)
//! - `FREE_SHIPPING_THRESHOLD` - Subtotal at which delivery is free (default: 20.000)
//! - `MAX_LINE_QUANTITY` - Largest quantity accepted per cart line (default: 99)
//! - `RESERVATION_SWEEP_INTERVAL_SECS` - Run the expiry sweeper in-process
//! - `SESSION_RETENTION_DAYS` - Keep terminal checkout sessions this long (default: 30)
//! - `SENTRY_DSN`, `SENTRY_ENVIRONMENT` - Sentry error tracking
//!
//! ## BENEFIT gateway (all or none)
//! - `BENEFIT_TRANPORTAL_ID`, `BENEFIT_TRANPORTAL_PASSWORD`, `BENEFIT_RESOURCE_KEY`
//! - `BENEFIT_ENDPOINT` - Hosted payment API URL
//!
//! ## EazyPay gateway (all or none)
//! - `EAZYPAY_APP_ID`, `EAZYPAY_SECRET_KEY`
//! - `EAZYPAY_BASE_URL` - Checkout API base URL

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use souq_core::Money;
use thiserror::Error;

const MIN_SESSION_SECRET_LENGTH: usize = 32;
const MIN_ENTROPY_BITS_PER_CHAR: f64 = 3.3;

/// AES-256 key length for the BENEFIT resource key.
const BENEFIT_RESOURCE_KEY_LENGTH: usize = 32;

const DEFAULT_BENEFIT_ENDPOINT: &str = "https://www.benefit-gateway.bh/payment/API/hosted.htm";
const DEFAULT_EAZYPAY_BASE_URL: &str = "https://api.eazy.net/merchant/checkout";

/// Blocklist of common placeholder patterns (case-insensitive)
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "example",
    "secret",
    "password",
    "xxx",
    "todo",
    "fixme",
    "insert",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
    #[error("Incomplete {0} configuration: {1} is set but {2} is missing")]
    PartialGateway(&'static str, String, String),
}

/// Storefront application configuration.
#[derive(Debug, Clone)]
pub struct StorefrontConfig {
    /// `PostgreSQL` database connection URL (contains password)
    pub database_url: SecretString,
    /// IP address to bind the server to
    pub host: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Public base URL, without trailing slash
    pub base_url: String,
    /// Session signing secret
    pub session_secret: SecretString,
    /// Bearer token for cron endpoints
    pub cron_secret: SecretString,
    /// Origins allowed by CORS (empty = same-origin only)
    pub allowed_origins: Vec<String>,
    /// Checkout pricing and reservation rules
    pub checkout: CheckoutConfig,
    /// BENEFIT gateway, if enabled
    pub benefit: Option<BenefitConfig>,
    /// EazyPay gateway, if enabled
    pub eazypay: Option<EazyPayConfig>,
    /// Run the reservation sweeper inside the server process
    pub sweep_interval: Option<Duration>,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment name
    pub sentry_environment: Option<String>,
}

/// Checkout rules.
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    /// How long a checkout session holds its stock reservation.
    pub reservation_ttl: chrono::Duration,
    /// Flat delivery fee.
    pub shipping_fee: Money,
    /// Subtotal at or above which delivery is free.
    pub free_shipping_threshold: Money,
    /// Upper bound on a single line's quantity.
    pub max_line_quantity: u32,
    /// How long terminal sessions without an order are kept.
    pub session_retention: chrono::Duration,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: chrono::Duration::minutes(30),
            shipping_fee: Money::from_fils(1_000),
            free_shipping_threshold: Money::from_fils(20_000),
            max_line_quantity: 99,
            session_retention: chrono::Duration::days(30),
        }
    }
}

/// BENEFIT payment gateway credentials.
///
/// Implements `Debug` manually to redact secret fields.
#[derive(Clone)]
pub struct BenefitConfig {
    /// Tranportal ID issued by the acquiring bank.
    pub tranportal_id: String,
    /// Tranportal password.
    pub tranportal_password: SecretString,
    /// 32-byte terminal resource key used for trandata encryption.
    pub resource_key: SecretString,
    /// Hosted payment API endpoint.
    pub endpoint: String,
}

impl std::fmt::Debug for BenefitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BenefitConfig")
            .field("tranportal_id", &self.tranportal_id)
            .field("tranportal_password", &"[REDACTED]")
            .field("resource_key", &"[REDACTED]")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// EazyPay checkout API credentials.
///
/// Implements `Debug` manually to redact secret fields.
#[derive(Clone)]
pub struct EazyPayConfig {
    /// Merchant application ID.
    pub app_id: String,
    /// HMAC secret for request signing and webhook verification.
    pub secret_key: SecretString,
    /// API base URL, without trailing slash.
    pub base_url: String,
}

impl std::fmt::Debug for EazyPayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EazyPayConfig")
            .field("app_id", &self.app_id)
            .field("secret_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl StorefrontConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing, invalid, or
    /// if secrets fail validation (placeholder detection, entropy check).
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database_url = get_database_url("STOREFRONT_DATABASE_URL")?;
        let host = parse_env_or_default("STOREFRONT_HOST", "127.0.0.1")?;
        let port = parse_env_or_default("STOREFRONT_PORT", "3000")?;
        let base_url = get_required_env("STOREFRONT_BASE_URL")?
            .trim_end_matches('/')
            .to_owned();
        url::Url::parse(&base_url).map_err(|e| {
            ConfigError::InvalidEnvVar("STOREFRONT_BASE_URL".to_owned(), e.to_string())
        })?;
        let session_secret = get_validated_secret("STOREFRONT_SESSION_SECRET")?;
        validate_session_secret(&session_secret, "STOREFRONT_SESSION_SECRET")?;
        let cron_secret = get_validated_secret("CRON_SECRET")?;

        let allowed_origins = get_optional_env("STOREFRONT_ALLOWED_ORIGINS")
            .map(|v| parse_origins(&v))
            .unwrap_or_default();

        let sweep_interval = get_optional_env("RESERVATION_SWEEP_INTERVAL_SECS")
            .map(|v| {
                v.parse::<u64>().map(Duration::from_secs).map_err(|e| {
                    ConfigError::InvalidEnvVar(
                        "RESERVATION_SWEEP_INTERVAL_SECS".to_owned(),
                        e.to_string(),
                    )
                })
            })
            .transpose()?;

        Ok(Self {
            database_url,
            host,
            port,
            base_url,
            session_secret,
            cron_secret,
            allowed_origins,
            checkout: CheckoutConfig::from_env()?,
            benefit: BenefitConfig::from_env()?,
            eazypay: EazyPayConfig::from_env()?,
            sweep_interval,
            sentry_dsn: get_optional_env("SENTRY_DSN"),
            sentry_environment: get_optional_env("SENTRY_ENVIRONMENT"),
        })
    }

    /// Returns the socket address for binding the server.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Absolute URL for a path on this storefront.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl CheckoutConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let ttl_minutes: i64 = parse_env_or_default("CHECKOUT_TTL_MINUTES", "30")?;
        if ttl_minutes <= 0 {
            return Err(ConfigError::InvalidEnvVar(
                "CHECKOUT_TTL_MINUTES".to_owned(),
                "must be positive".to_owned(),
            ));
        }
        let retention_days: i64 = parse_env_or_default("SESSION_RETENTION_DAYS", "30")?;

        Ok(Self {
            reservation_ttl: chrono::Duration::minutes(ttl_minutes),
            shipping_fee: get_money("SHIPPING_FEE")?.unwrap_or(defaults.shipping_fee),
            free_shipping_threshold: get_money("FREE_SHIPPING_THRESHOLD")?
                .unwrap_or(defaults.free_shipping_threshold),
            max_line_quantity: parse_env_or_default("MAX_LINE_QUANTITY", "99")?,
            session_retention: chrono::Duration::days(retention_days),
        })
    }
}

impl BenefitConfig {
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(vars) = gateway_group(
            "BENEFIT",
            &[
                "BENEFIT_TRANPORTAL_ID",
                "BENEFIT_TRANPORTAL_PASSWORD",
                "BENEFIT_RESOURCE_KEY",
            ],
        )?
        else {
            return Ok(None);
        };
        let [tranportal_id, password, resource_key] = vars;

        if resource_key.len() != BENEFIT_RESOURCE_KEY_LENGTH {
            return Err(ConfigError::InvalidEnvVar(
                "BENEFIT_RESOURCE_KEY".to_owned(),
                format!(
                    "must be exactly {BENEFIT_RESOURCE_KEY_LENGTH} bytes (got {})",
                    resource_key.len()
                ),
            ));
        }

        Ok(Some(Self {
            tranportal_id,
            tranportal_password: SecretString::from(password),
            resource_key: SecretString::from(resource_key),
            endpoint: get_env_or_default("BENEFIT_ENDPOINT", DEFAULT_BENEFIT_ENDPOINT),
        }))
    }
}

impl EazyPayConfig {
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some([app_id, secret_key]) =
            gateway_group("EazyPay", &["EAZYPAY_APP_ID", "EAZYPAY_SECRET_KEY"])?
        else {
            return Ok(None);
        };
        validate_secret_strength(&secret_key, "EAZYPAY_SECRET_KEY")?;

        Ok(Some(Self {
            app_id,
            secret_key: SecretString::from(secret_key),
            base_url: get_env_or_default("EAZYPAY_BASE_URL", DEFAULT_EAZYPAY_BASE_URL)
                .trim_end_matches('/')
                .to_owned(),
        }))
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get a required environment variable.
fn get_required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Get database URL with fallback to generic `DATABASE_URL`.
fn get_database_url(primary_key: &str) -> Result<SecretString, ConfigError> {
    if let Ok(value) = std::env::var(primary_key) {
        return Ok(SecretString::from(value));
    }
    if let Ok(value) = std::env::var("DATABASE_URL") {
        return Ok(SecretString::from(value));
    }
    Err(ConfigError::MissingEnvVar(primary_key.to_string()))
}

/// Get an optional, non-empty environment variable.
fn get_optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Get an environment variable with a default value.
fn get_env_or_default(key: &str, default: &str) -> String {
    get_optional_env(key).unwrap_or_else(|| default.to_string())
}

/// Parse an environment variable (or its default) with `FromStr`.
fn parse_env_or_default<T>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env_or_default(key, default)
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
}

/// Parse an optional BHD amount.
fn get_money(key: &str) -> Result<Option<Money>, ConfigError> {
    get_optional_env(key)
        .map(|raw| {
            Decimal::from_str(raw.trim())
                .map_err(|e| e.to_string())
                .and_then(|d| Money::new(d).map_err(|e| e.to_string()))
                .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e))
        })
        .transpose()
}

/// Load an all-or-nothing group of gateway variables.
///
/// Returns `None` when none of them is set, the values when all are set,
/// and an error when only some are.
fn gateway_group<const N: usize>(
    gateway: &'static str,
    keys: &[&str; N],
) -> Result<Option<[String; N]>, ConfigError> {
    let values: [Option<String>; N] = keys.map(get_optional_env);

    let present = values.iter().position(Option::is_some);
    let missing = values.iter().position(Option::is_none);
    match (present, missing) {
        (None, _) => Ok(None),
        (Some(_), None) => Ok(Some(values.map(Option::unwrap_or_default))),
        (Some(p), Some(m)) => Err(ConfigError::PartialGateway(
            gateway,
            keys.get(p).map_or_else(String::new, |k| (*k).to_owned()),
            keys.get(m).map_or_else(String::new, |k| (*k).to_owned()),
        )),
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|o| o.trim().trim_end_matches('/'))
        .filter(|o| !o.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Validate that a session secret meets minimum length requirements.
fn validate_session_secret(secret: &SecretString, var_name: &str) -> Result<(), ConfigError> {
    let value = secret.expose_secret();
    if value.len() < MIN_SESSION_SECRET_LENGTH {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "must be at least {} characters (got {})",
                MIN_SESSION_SECRET_LENGTH,
                value.len()
            ),
        ));
    }
    Ok(())
}

/// Calculate Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }

    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }

    #[allow(clippy::cast_precision_loss)] // String length will never exceed f64 precision
    let len = s.chars().count() as f64;
    freq.values()
        .map(|&count| {
            #[allow(clippy::cast_precision_loss)]
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Validate that a secret is not a placeholder and has sufficient entropy.
fn validate_secret_strength(secret: &str, var_name: &str) -> Result<(), ConfigError> {
    let lower = secret.to_lowercase();

    for pattern in PLACEHOLDER_PATTERNS {
        if lower.contains(pattern) {
            return Err(ConfigError::InsecureSecret(
                var_name.to_string(),
                format!("appears to be a placeholder (contains '{pattern}')"),
            ));
        }
    }

    let entropy = shannon_entropy(secret);
    if entropy < MIN_ENTROPY_BITS_PER_CHAR {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "entropy too low ({entropy:.2} bits/char, need >= {MIN_ENTROPY_BITS_PER_CHAR:.1}). Use a randomly generated secret."
            ),
        ));
    }

    Ok(())
}

/// Load and validate a secret from environment.
fn get_validated_secret(key: &str) -> Result<SecretString, ConfigError> {
    let value = get_required_env(key)?;
    validate_secret_strength(&value, key)?;
    Ok(SecretString::from(value))
}

/// Minimal config for tests elsewhere in the crate.
#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) fn test_config() -> StorefrontConfig {
    StorefrontConfig {
        database_url: SecretString::from("postgres://localhost/souq_test"),
        host: "127.0.0.1".parse().unwrap(),
        port: 3000,
        base_url: "https://shop.test".to_string(),
        session_secret: SecretString::from("k".repeat(32)),
        cron_secret: SecretString::from("cron-Q7v!x9LmP2#tR4zW"),
        allowed_origins: Vec::new(),
        checkout: CheckoutConfig::default(),
        benefit: None,
        eazypay: None,
        sweep_interval: None,
        sentry_dsn: None,
        sentry_environment: None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_shannon_entropy_edges() {
        assert!((shannon_entropy("") - 0.0).abs() < f64::EPSILON);
        assert!((shannon_entropy("aaaaaaa") - 0.0).abs() < f64::EPSILON);
        assert!((shannon_entropy("ab") - 1.0).abs() < 0.01);
        assert!(shannon_entropy("aB3$xY9!mK2@nL5#") > 3.3);
    }

    #[test]
    fn test_validate_secret_strength() {
        assert!(matches!(
            validate_secret_strength("your-api-key-here", "TEST_VAR"),
            Err(ConfigError::InsecureSecret(_, _))
        ));
        assert!(validate_secret_strength("aaaaaaaaaaaaaaaaaaaaaaaaaaaa", "TEST_VAR").is_err());
        assert!(validate_secret_strength("aB3$xY9!mK2@nL5#pQ7&rT0*uW4^zC6", "TEST_VAR").is_ok());
    }

    #[test]
    fn test_validate_session_secret_length() {
        assert!(validate_session_secret(&SecretString::from("short"), "S").is_err());
        assert!(validate_session_secret(&SecretString::from("a".repeat(32)), "S").is_ok());
    }

    #[test]
    fn test_parse_origins() {
        let origins = parse_origins(" https://souq.bh/, https://admin.souq.bh ,,");
        assert_eq!(origins, vec!["https://souq.bh", "https://admin.souq.bh"]);
    }

    #[test]
    fn test_url_and_socket_addr() {
        let config = test_config();
        assert_eq!(
            config.url("/api/payments/benefit/notify"),
            "https://shop.test/api/payments/benefit/notify"
        );
        assert_eq!(config.socket_addr().port(), 3000);
    }

    #[test]
    fn test_checkout_defaults() {
        let checkout = CheckoutConfig::default();
        assert_eq!(checkout.reservation_ttl, chrono::Duration::minutes(30));
        assert_eq!(checkout.shipping_fee.to_gateway_string(), "1.000");
        assert_eq!(checkout.free_shipping_threshold.to_gateway_string(), "20.000");
    }

    #[test]
    fn test_gateway_debug_redacts_secrets() {
        let benefit = BenefitConfig {
            tranportal_id: "tp-100200".to_string(),
            tranportal_password: SecretString::from("hunter2-super-private"),
            resource_key: SecretString::from("0123456789abcdef0123456789abcdef"),
            endpoint: DEFAULT_BENEFIT_ENDPOINT.to_string(),
        };
        let eazypay = EazyPayConfig {
            app_id: "app-42".to_string(),
            secret_key: SecretString::from("eazy-private-key"),
            base_url: DEFAULT_EAZYPAY_BASE_URL.to_string(),
        };

        let out = format!("{benefit:?} {eazypay:?}");
        assert!(out.contains("tp-100200"));
        assert!(out.contains("app-42"));
        assert!(out.contains("[REDACTED]"));
        assert!(!out.contains("hunter2-super-private"));
        assert!(!out.contains("0123456789abcdef"));
        assert!(!out.contains("eazy-private-key"));
    }
}
