//! One-shot reservation sweep.
//!
//! Runs the same passes as `POST /api/cron/expire-reservations` and
//! `POST /api/cron/cleanup-sessions`, for schedulers that prefer a process
//! over an HTTP call. Needs the full storefront environment so EazyPay
//! invoices can be polled.

use souq_storefront::config::{ConfigError, StorefrontConfig};
use souq_storefront::payments::PaymentError;
use souq_storefront::services::checkout::{CheckoutError, CheckoutService, RECONCILE_AFTER_MINUTES};
use souq_storefront::state::AppState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database connection error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Payment client error: {0}")]
    Payment(#[from] PaymentError),

    #[error("Sweep failed: {0}")]
    Checkout(#[from] CheckoutError),
}

/// Reconcile, release expired reservations, purge old sessions.
///
/// # Errors
///
/// Returns an error if configuration is incomplete or a pass cannot list
/// its sessions. Per-session failures are only counted.
pub async fn run(batch: i64) -> Result<(), SweepError> {
    let config = StorefrontConfig::from_env()?;
    let pool = souq_storefront::db::create_pool(&config.database_url).await?;
    let state = AppState::new(config, pool)?;
    let service = CheckoutService::new(&state);

    let reconciled = service
        .reconcile_pending(chrono::Duration::minutes(RECONCILE_AFTER_MINUTES), batch)
        .await?;
    let released = service.release_expired(batch).await?;
    let purged = service.purge_stale().await?;

    tracing::info!(
        reconciled = reconciled.converted + reconciled.failed,
        expired = released.expired,
        converted = released.converted,
        needs_review = reconciled.needs_review + released.needs_review,
        errors = reconciled.errors + released.errors,
        purged,
        "Sweep complete"
    );
    Ok(())
}
