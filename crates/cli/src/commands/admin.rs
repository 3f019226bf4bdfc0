//! Admin account management commands.
//!
//! # Usage
//!
//! ```bash
//! # The account must already exist (register through the storefront)
//! souq-cli admin promote -e owner@souq.bh
//! souq-cli admin demote -e former.staff@souq.bh
//! ```
//!
//! A role change takes effect at the account's next login.

use souq_core::UserRole;
use souq_storefront::services::auth::{AuthError, AuthService};
use thiserror::Error;

use super::{CommandError, database_url};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Database connection error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("No account with email {0}; register it first")]
    UnknownAccount(String),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Set the role of an existing account.
///
/// # Errors
///
/// Returns `AdminError::UnknownAccount` if no account has this email.
pub async fn set_role(email: &str, role: UserRole) -> Result<(), AdminError> {
    let database_url = database_url()?;

    tracing::info!("Connecting to storefront database...");
    let pool = souq_storefront::db::create_pool(&database_url).await?;

    let user = AuthService::new(&pool)
        .set_role(email, role)
        .await
        .map_err(|e| match e {
            AuthError::UserNotFound => AdminError::UnknownAccount(email.to_owned()),
            other => AdminError::Auth(other),
        })?;

    tracing::info!(
        "Role updated! ID: {}, Email: {}, Role: {}",
        user.id,
        user.email,
        user.role
    );
    Ok(())
}
