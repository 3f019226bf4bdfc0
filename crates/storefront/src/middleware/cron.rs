//! Bearer-token guard for the scheduled job endpoints.
//!
//! The scheduler sends `Authorization: Bearer <CRON_SECRET>`.

use axum::{
    Json,
    extract::FromRequestParts,
    http::{StatusCode, header::AUTHORIZATION, request::Parts},
    response::{IntoResponse, Response},
};
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};

use crate::state::AppState;

/// Extractor that admits only requests carrying the cron secret.
pub struct RequireCron;

pub struct CronRejection;

impl IntoResponse for CronRejection {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Invalid cron credentials" })),
        )
            .into_response()
    }
}

/// Compare digests so the check takes the same time whatever the input.
fn token_matches(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

impl FromRequestParts<AppState> for RequireCron {
    type Rejection = CronRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(CronRejection)?;

        if token_matches(presented.trim(), state.config().cron_secret.expose_secret()) {
            Ok(Self)
        } else {
            tracing::warn!(path = %parts.uri.path(), "Cron request with wrong secret");
            Err(CronRejection)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_matches() {
        assert!(token_matches("cron-Q7v!x9LmP2#tR4zW", "cron-Q7v!x9LmP2#tR4zW"));
        assert!(!token_matches("cron-Q7v!x9LmP2#tR4z", "cron-Q7v!x9LmP2#tR4zW"));
        assert!(!token_matches("", "cron-Q7v!x9LmP2#tR4zW"));
    }
}
