//! Application state shared across handlers.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::StorefrontConfig;
use crate::payments::{BenefitClient, EazyPayClient, PaymentError};

/// Application state shared across all handlers.
///
/// This struct is cheaply cloneable via `Arc` and provides access to
/// shared resources like database connections, configuration and the
/// payment gateway clients.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: StorefrontConfig,
    pool: PgPool,
    benefit: Option<BenefitClient>,
    eazypay: Option<EazyPayClient>,
}

impl AppState {
    /// Create a new application state.
    ///
    /// A gateway client is built only for gateways present in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a gateway client cannot be built.
    pub fn new(config: StorefrontConfig, pool: PgPool) -> Result<Self, PaymentError> {
        let benefit = config.benefit.clone().map(BenefitClient::new).transpose()?;
        let eazypay = config.eazypay.clone().map(EazyPayClient::new).transpose()?;

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                pool,
                benefit,
                eazypay,
            }),
        })
    }

    /// Get a reference to the storefront configuration.
    #[must_use]
    pub fn config(&self) -> &StorefrontConfig {
        &self.inner.config
    }

    /// Get a reference to the database connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    /// BENEFIT client, if the gateway is configured.
    #[must_use]
    pub fn benefit(&self) -> Option<&BenefitClient> {
        self.inner.benefit.as_ref()
    }

    /// EazyPay client, if the gateway is configured.
    #[must_use]
    pub fn eazypay(&self) -> Option<&EazyPayClient> {
        self.inner.eazypay.as_ref()
    }
}
