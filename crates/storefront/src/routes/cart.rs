//! Saved cart route handlers.
//!
//! The cart only remembers products and quantities. Prices and stock are
//! read at checkout.

use axum::{Json, extract::State, http::StatusCode};
use serde::Deserialize;

use crate::db::CartRepository;
use crate::error::Result;
use crate::middleware::RequireAuth;
use crate::models::{Cart, CartItem};
use crate::services::checkout::merge_lines;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CartUpdate {
    #[serde(default)]
    pub items: Vec<CartItem>,
}

pub async fn show(
    State(state): State<AppState>,
    RequireAuth(user): RequireAuth,
) -> Result<Json<Cart>> {
    let cart = CartRepository::new(state.pool()).get(user.id).await?;
    Ok(Json(cart))
}

/// Replace the saved cart. Duplicate products are merged; an empty list
/// empties the cart.
#[tracing::instrument(skip(state, user, update), fields(user_id = %user.id))]
pub async fn replace(
    State(state): State<AppState>,
    RequireAuth(user): RequireAuth,
    Json(update): Json<CartUpdate>,
) -> Result<Json<Cart>> {
    let carts = CartRepository::new(state.pool());
    if update.items.is_empty() {
        carts.delete(user.id).await?;
        return Ok(Json(Cart::default()));
    }

    let items = merge_lines(&update.items, state.config().checkout.max_line_quantity)?;
    let cart = carts.upsert(user.id, &items).await?;
    Ok(Json(cart))
}

pub async fn clear(
    State(state): State<AppState>,
    RequireAuth(user): RequireAuth,
) -> Result<StatusCode> {
    CartRepository::new(state.pool()).delete(user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}
