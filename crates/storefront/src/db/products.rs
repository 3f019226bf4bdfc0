//! Product repository and the stock reservation primitives.
//!
//! `reserve` and `restock` are the only statements that move stock for
//! checkout. Both take a connection so they run inside the caller's
//! transaction.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::{PgConnection, PgPool};

use souq_core::{CategoryId, Money, ProductId};

use super::{RepositoryError, quantity_from_row, quantity_param};
use crate::models::Product;

const PRODUCT_COLUMNS: &str = "id, category_id, name, description, price, stock, image_url, \
                               is_active, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: ProductId,
    category_id: Option<CategoryId>,
    name: String,
    description: String,
    price: Money,
    stock: i32,
    image_url: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ProductRow> for Product {
    type Error = RepositoryError;

    fn try_from(row: ProductRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            category_id: row.category_id,
            name: row.name,
            description: row.description,
            price: row.price,
            stock: quantity_from_row(row.stock, "stock")?,
            image_url: row.image_url,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Catalog listing filter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductFilter {
    pub category_id: Option<CategoryId>,
    /// Case-insensitive substring match on the name.
    pub search: Option<String>,
    /// Admin listings include inactive products.
    #[serde(skip)]
    pub include_inactive: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ProductFilter {
    const DEFAULT_LIMIT: i64 = 50;
    const MAX_LIMIT: i64 = 200;

    fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/// Input for creating a product.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProduct {
    pub category_id: Option<CategoryId>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub price: Money,
    #[serde(default)]
    pub stock: u32,
    pub image_url: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

const fn default_active() -> bool {
    true
}

/// Partial product update. Stock is not editable here; use
/// [`ProductRepository::adjust_stock`] so concurrent reservations are not
/// overwritten.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductUpdate {
    pub category_id: Option<CategoryId>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<Money>,
    pub image_url: Option<String>,
    pub is_active: Option<bool>,
}

/// Name and price of a product at the moment its stock was reserved.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ReservedProduct {
    pub id: ProductId,
    pub name: String,
    pub price: Money,
}

/// Repository for catalog products.
pub struct ProductRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> ProductRepository<'a> {
    #[must_use]
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// List products, newest first.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn list(&self, filter: &ProductFilter) -> Result<Vec<Product>, RepositoryError> {
        let pattern = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s.replace('%', "\\%").replace('_', "\\_")));

        let rows = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products
             WHERE ($1 OR is_active)
               AND ($2::uuid IS NULL OR category_id = $2)
               AND ($3::text IS NULL OR name ILIKE $3)
             ORDER BY created_at DESC, id
             LIMIT $4 OFFSET $5"
        ))
        .bind(filter.include_inactive)
        .bind(filter.category_id)
        .bind(pattern)
        .bind(filter.limit())
        .bind(filter.offset())
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(Product::try_from).collect()
    }

    /// Get a product by ID, active or not.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn get(&self, id: ProductId) -> Result<Option<Product>, RepositoryError> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        row.map(Product::try_from).transpose()
    }

    /// Create a product.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the insert fails.
    pub async fn create(&self, input: &NewProduct) -> Result<Product, RepositoryError> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "INSERT INTO products (category_id, name, description, price, stock, image_url, is_active)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {PRODUCT_COLUMNS}"
        ))
        .bind(input.category_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.price)
        .bind(quantity_param(input.stock)?)
        .bind(&input.image_url)
        .bind(input.is_active)
        .fetch_one(self.pool)
        .await?;

        row.try_into()
    }

    /// Apply a partial update. Absent fields keep their value.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::NotFound` if the product doesn't exist.
    pub async fn update(
        &self,
        id: ProductId,
        update: &ProductUpdate,
    ) -> Result<Product, RepositoryError> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "UPDATE products SET
                 category_id = COALESCE($2, category_id),
                 name = COALESCE($3, name),
                 description = COALESCE($4, description),
                 price = COALESCE($5, price),
                 image_url = COALESCE($6, image_url),
                 is_active = COALESCE($7, is_active),
                 updated_at = NOW()
             WHERE id = $1
             RETURNING {PRODUCT_COLUMNS}"
        ))
        .bind(id)
        .bind(update.category_id)
        .bind(&update.name)
        .bind(&update.description)
        .bind(update.price)
        .bind(&update.image_url)
        .bind(update.is_active)
        .fetch_optional(self.pool)
        .await?;

        row.ok_or(RepositoryError::NotFound)?.try_into()
    }

    /// Add `delta` (possibly negative) to available stock.
    ///
    /// The update is relative so it composes with concurrent reservations.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Conflict` if the result would be negative,
    /// `RepositoryError::NotFound` if the product doesn't exist.
    pub async fn adjust_stock(&self, id: ProductId, delta: i32) -> Result<Product, RepositoryError> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "UPDATE products SET stock = stock + $2, updated_at = NOW()
             WHERE id = $1 AND stock + $2 >= 0
             RETURNING {PRODUCT_COLUMNS}"
        ))
        .bind(id)
        .bind(delta)
        .fetch_optional(self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None if self.get(id).await?.is_some() => Err(RepositoryError::Conflict(
                "stock cannot go below zero".to_owned(),
            )),
            None => Err(RepositoryError::NotFound),
        }
    }
}

/// Take `quantity` units of an active product.
///
/// Returns `None` when the product is missing, inactive, or has fewer than
/// `quantity` units; nothing is changed in that case.
///
/// # Errors
///
/// Returns `RepositoryError::Database` if the update fails.
pub async fn reserve(
    conn: &mut PgConnection,
    id: ProductId,
    quantity: u32,
) -> Result<Option<ReservedProduct>, RepositoryError> {
    let reserved = sqlx::query_as::<_, ReservedProduct>(
        "UPDATE products SET stock = stock - $2, updated_at = NOW()
         WHERE id = $1 AND is_active AND stock >= $2
         RETURNING id, name, price",
    )
    .bind(id)
    .bind(quantity_param(quantity)?)
    .fetch_optional(conn)
    .await?;

    Ok(reserved)
}

/// Return `quantity` units to a product.
///
/// Returns `false` if the product no longer exists.
///
/// # Errors
///
/// Returns `RepositoryError::Database` if the update fails.
pub async fn restock(
    conn: &mut PgConnection,
    id: ProductId,
    quantity: u32,
) -> Result<bool, RepositoryError> {
    let result = sqlx::query(
        "UPDATE products SET stock = stock + $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .bind(quantity_param(quantity)?)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Name and active flag of a product, to explain a reservation miss.
///
/// # Errors
///
/// Returns `RepositoryError::Database` if the query fails.
pub async fn describe(
    conn: &mut PgConnection,
    id: ProductId,
) -> Result<Option<(String, bool)>, RepositoryError> {
    let row: Option<(String, bool)> =
        sqlx::query_as("SELECT name, is_active FROM products WHERE id = $1")
            .bind(id)
            .fetch_optional(conn)
            .await?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_limits_are_clamped() {
        let filter = ProductFilter {
            limit: Some(10_000),
            offset: Some(-5),
            ..ProductFilter::default()
        };
        assert_eq!(filter.limit(), 200);
        assert_eq!(filter.offset(), 0);
        assert_eq!(ProductFilter::default().limit(), 50);
    }
}
