//! Database operations for storefront `PostgreSQL`.
//!
//! ## Tables
//!
//! - `users` - Storefront accounts (customers and admins)
//! - `categories`, `products` - Catalog; `products.stock` is available stock
//! - `checkout_sessions` - Reserved checkouts waiting for payment
//! - `orders`, `order_items` - Converted checkouts
//! - `user_carts` - Saved cart per signed-in customer
//! - `tower_sessions.session` - Tower-sessions storage
//!
//! Functions that must run inside a checkout transaction take a
//! `&mut PgConnection` (pass `&mut *tx`); everything else hangs off a
//! repository struct borrowing the pool.
//!
//! # Migrations
//!
//! Migrations are stored in `crates/storefront/migrations/` and run via:
//! ```bash
//! cargo run -p souq-cli -- migrate
//! ```

pub mod carts;
pub mod categories;
pub mod checkout_sessions;
pub mod orders;
pub mod products;
pub mod users;

use std::time::Duration;

use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

pub use carts::CartRepository;
pub use categories::CategoryRepository;
pub use checkout_sessions::CheckoutSessionRepository;
pub use orders::OrderRepository;
pub use products::ProductRepository;
pub use users::UserRepository;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data in the database is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Requested entity was not found.
    #[error("not found")]
    NotFound,

    /// Constraint violation (e.g., unique email).
    #[error("constraint violation: {0}")]
    Conflict(String),
}

impl RepositoryError {
    /// Map a unique violation to [`RepositoryError::Conflict`] with `message`,
    /// anything else to [`RepositoryError::Database`].
    pub(crate) fn conflict_on_unique(e: sqlx::Error, message: &str) -> Self {
        if let sqlx::Error::Database(ref db_err) = e
            && db_err.is_unique_violation()
        {
            return Self::Conflict(message.to_owned());
        }
        Self::Database(e)
    }
}

/// Convert a line quantity to the `INTEGER` column type.
pub(crate) fn quantity_param(quantity: u32) -> Result<i32, RepositoryError> {
    i32::try_from(quantity)
        .map_err(|_| RepositoryError::Conflict(format!("quantity out of range: {quantity}")))
}

/// Convert a stored `INTEGER` quantity back, rejecting negatives.
pub(crate) fn quantity_from_row(value: i32, column: &str) -> Result<u32, RepositoryError> {
    u32::try_from(value)
        .map_err(|_| RepositoryError::DataCorruption(format!("negative {column}: {value}")))
}

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(database_url: &secrecy::SecretString) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}
