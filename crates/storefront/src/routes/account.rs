//! Account route handlers (order history).

use axum::{
    Json,
    extract::{Path, State},
};

use souq_core::OrderId;

use crate::db::OrderRepository;
use crate::error::{AppError, Result};
use crate::middleware::RequireAuth;
use crate::models::{Order, OrderWithItems};
use crate::state::AppState;

/// The signed-in customer's orders, newest first.
pub async fn orders(
    State(state): State<AppState>,
    RequireAuth(user): RequireAuth,
) -> Result<Json<Vec<Order>>> {
    let orders = OrderRepository::new(state.pool())
        .list_for_user(user.id)
        .await?;
    Ok(Json(orders))
}

/// One order with its lines. Another customer's order is reported as
/// missing rather than forbidden.
#[tracing::instrument(skip(state, user), fields(user_id = %user.id))]
pub async fn order(
    State(state): State<AppState>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<OrderId>,
) -> Result<Json<OrderWithItems>> {
    OrderRepository::new(state.pool())
        .get_with_items(id)
        .await?
        .filter(|o| o.order.user_id == Some(user.id))
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Order not found".to_string()))
}
