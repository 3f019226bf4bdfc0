//! Admin route handlers.
//!
//! Order fulfilment, checkout session inspection and catalog upkeep.
//! Every handler requires an admin session.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;

use souq_core::{CheckoutSessionId, Money, OrderId, OrderStatus, ProductId};

use crate::db::categories::slugify;
use crate::db::checkout_sessions::CheckoutSessionFilter;
use crate::db::orders::OrderFilter;
use crate::db::products::{NewProduct, ProductFilter, ProductUpdate};
use crate::db::{CategoryRepository, CheckoutSessionRepository, OrderRepository, ProductRepository};
use crate::error::{AppError, Result};
use crate::middleware::RequireAdmin;
use crate::models::{Category, CheckoutSession, Order, OrderWithItems, Product};
use crate::services::checkout::CheckoutService;
use crate::services::orders::OrderService;
use crate::state::AppState;

const MAX_PRODUCT_NAME_LENGTH: usize = 200;

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: OrderStatus,
}

#[derive(Debug, Deserialize)]
pub struct StockAdjustment {
    pub delta: i32,
}

#[derive(Debug, Deserialize)]
pub struct NewCategory {
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
}

fn validate_product_name(name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_PRODUCT_NAME_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Product name must be 1-{MAX_PRODUCT_NAME_LENGTH} characters"
        )));
    }
    Ok(())
}

fn validate_price(price: Money) -> Result<()> {
    if !price.is_positive() {
        return Err(AppError::BadRequest("Price must be positive".to_string()));
    }
    Ok(())
}

// =============================================================================
// Orders
// =============================================================================

pub async fn orders(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Query(filter): Query<OrderFilter>,
) -> Result<Json<Vec<Order>>> {
    let orders = OrderRepository::new(state.pool()).list(&filter).await?;
    Ok(Json(orders))
}

pub async fn order(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Path(id): Path<OrderId>,
) -> Result<Json<OrderWithItems>> {
    OrderRepository::new(state.pool())
        .get_with_items(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Order not found".to_string()))
}

/// Move an order along its fulfilment lifecycle. Cancelling restocks.
#[tracing::instrument(skip(state, admin), fields(admin_id = %admin.id))]
pub async fn update_order_status(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Path(id): Path<OrderId>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<Order>> {
    let order = OrderService::new(state.pool())
        .update_status(id, update.status)
        .await?;
    Ok(Json(order))
}

// =============================================================================
// Checkout sessions
// =============================================================================

pub async fn checkout_sessions(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Query(filter): Query<CheckoutSessionFilter>,
) -> Result<Json<Vec<CheckoutSession>>> {
    let sessions = CheckoutSessionRepository::new(state.pool())
        .list(&filter)
        .await?;
    Ok(Json(sessions))
}

/// Close a late payment after the money was returned to the customer.
#[tracing::instrument(skip(state, admin), fields(admin_id = %admin.id))]
pub async fn record_refund(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Path(id): Path<CheckoutSessionId>,
) -> Result<Json<CheckoutSession>> {
    let session = CheckoutService::new(&state).record_refund(id).await?;
    Ok(Json(session))
}

// =============================================================================
// Catalog
// =============================================================================

/// Catalog listing including inactive products.
pub async fn products(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Query(mut filter): Query<ProductFilter>,
) -> Result<Json<Vec<Product>>> {
    filter.include_inactive = true;
    let products = ProductRepository::new(state.pool()).list(&filter).await?;
    Ok(Json(products))
}

#[tracing::instrument(skip(state, admin, input), fields(admin_id = %admin.id))]
pub async fn create_product(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Json(input): Json<NewProduct>,
) -> Result<(StatusCode, Json<Product>)> {
    validate_product_name(&input.name)?;
    validate_price(input.price)?;

    let product = ProductRepository::new(state.pool()).create(&input).await?;
    tracing::info!(product_id = %product.id, "Product created");
    Ok((StatusCode::CREATED, Json(product)))
}

#[tracing::instrument(skip(state, admin, update), fields(admin_id = %admin.id))]
pub async fn update_product(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Path(id): Path<ProductId>,
    Json(update): Json<ProductUpdate>,
) -> Result<Json<Product>> {
    if let Some(name) = &update.name {
        validate_product_name(name)?;
    }
    if let Some(price) = update.price {
        validate_price(price)?;
    }

    let product = ProductRepository::new(state.pool()).update(id, &update).await?;
    Ok(Json(product))
}

/// Receive or write off stock. The change is relative, so it never
/// overwrites units held by open checkouts.
#[tracing::instrument(skip(state, admin), fields(admin_id = %admin.id))]
pub async fn adjust_stock(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Path(id): Path<ProductId>,
    Json(adjustment): Json<StockAdjustment>,
) -> Result<Json<Product>> {
    let product = ProductRepository::new(state.pool())
        .adjust_stock(id, adjustment.delta)
        .await?;
    tracing::info!(product_id = %id, delta = adjustment.delta, stock = product.stock, "Stock adjusted");
    Ok(Json(product))
}

pub async fn create_category(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Json(input): Json<NewCategory>,
) -> Result<(StatusCode, Json<Category>)> {
    let name = input.name.trim();
    let slug = slugify(input.slug.as_deref().unwrap_or(name));
    if name.is_empty() || slug.is_empty() {
        return Err(AppError::BadRequest(
            "Category name must contain letters or digits".to_string(),
        ));
    }

    let category = CategoryRepository::new(state.pool())
        .create(name, &slug)
        .await?;
    Ok((StatusCode::CREATED, Json(category)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_product_name() {
        assert!(validate_product_name("Oud Royal 50ml").is_ok());
        assert!(validate_product_name("   ").is_err());
        assert!(validate_product_name(&"x".repeat(201)).is_err());
    }

    #[test]
    fn test_validate_price() {
        assert!(validate_price(Money::from_fils(1)).is_ok());
        assert!(validate_price(Money::ZERO).is_err());
    }
}
