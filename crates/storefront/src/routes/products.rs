//! Catalog route handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
};

use souq_core::ProductId;

use crate::db::products::ProductFilter;
use crate::db::{CategoryRepository, ProductRepository};
use crate::error::{AppError, Result};
use crate::models::{Category, Product};
use crate::state::AppState;

/// Active products, optionally filtered by category or name.
#[tracing::instrument(skip(state))]
pub async fn index(
    State(state): State<AppState>,
    Query(mut filter): Query<ProductFilter>,
) -> Result<Json<Vec<Product>>> {
    filter.include_inactive = false;
    let products = ProductRepository::new(state.pool()).list(&filter).await?;
    Ok(Json(products))
}

/// Single product. Inactive products are hidden from shoppers.
#[tracing::instrument(skip(state))]
pub async fn show(
    State(state): State<AppState>,
    Path(id): Path<ProductId>,
) -> Result<Json<Product>> {
    ProductRepository::new(state.pool())
        .get(id)
        .await?
        .filter(|p| p.is_active)
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Product not found".to_string()))
}

pub async fn categories(State(state): State<AppState>) -> Result<Json<Vec<Category>>> {
    let categories = CategoryRepository::new(state.pool()).list().await?;
    Ok(Json(categories))
}
