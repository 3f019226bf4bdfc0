//! Authentication route handlers.
//!
//! Email and password accounts. The session cookie is the only credential;
//! its id is cycled on login so a pre-login cookie cannot be replayed.

use axum::{Json, extract::State, http::StatusCode};
use serde::Deserialize;
use tower_sessions::Session;

use crate::error::{AppError, Result, clear_sentry_user, set_sentry_user};
use crate::middleware::{RequireAuth, clear_current_user, set_current_user};
use crate::models::{CurrentUser, User};
use crate::services::auth::AuthService;
use crate::state::AppState;

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub name: String,
    pub password: String,
}

// =============================================================================
// Handlers
// =============================================================================

async fn start_session(session: &Session, user: &User) -> Result<()> {
    let current = CurrentUser::from(user);
    set_current_user(session, &current).await.map_err(|e| {
        tracing::error!("Failed to set session: {}", e);
        AppError::Internal("session store unavailable".to_string())
    })?;
    set_sentry_user(&user.id, Some(user.email.as_str()));
    Ok(())
}

/// Create an account and sign it in.
pub async fn register(
    State(state): State<AppState>,
    session: Session,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<User>)> {
    let user = AuthService::new(state.pool())
        .register_with_password(&request.email, &request.name, &request.password)
        .await?;
    start_session(&session, &user).await?;

    tracing::info!(user_id = %user.id, "Account registered");
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn login(
    State(state): State<AppState>,
    session: Session,
    Json(request): Json<LoginRequest>,
) -> Result<Json<User>> {
    let user = AuthService::new(state.pool())
        .login_with_password(&request.email, &request.password)
        .await
        .inspect_err(|e| tracing::warn!("Login failed: {}", e))?;
    start_session(&session, &user).await?;

    Ok(Json(user))
}

pub async fn logout(session: Session) -> StatusCode {
    if let Err(e) = clear_current_user(&session).await {
        tracing::error!("Failed to clear session: {}", e);
    }
    clear_sentry_user();
    StatusCode::NO_CONTENT
}

/// The signed-in account, read fresh from the database.
pub async fn me(
    State(state): State<AppState>,
    RequireAuth(current): RequireAuth,
) -> Result<Json<User>> {
    let user = AuthService::new(state.pool()).get_user(current.id).await?;
    Ok(Json(user))
}
