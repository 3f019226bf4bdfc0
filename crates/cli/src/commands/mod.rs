//! CLI subcommands.

pub mod admin;
pub mod migrate;
pub mod sweep;

use secrecy::SecretString;

/// Errors shared by the commands.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(&'static str),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Storefront database URL, falling back to `DATABASE_URL`.
///
/// # Errors
///
/// Returns `CommandError::MissingEnvVar` if neither is set.
pub fn database_url() -> Result<SecretString, CommandError> {
    dotenvy::dotenv().ok();

    std::env::var("STOREFRONT_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .map(SecretString::from)
        .map_err(|_| CommandError::MissingEnvVar("STOREFRONT_DATABASE_URL"))
}
