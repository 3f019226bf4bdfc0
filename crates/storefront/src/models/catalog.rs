//! Catalog domain types.

use chrono::{DateTime, Utc};
use serde::Serialize;

use souq_core::{CategoryId, Money, ProductId};

/// A product category.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    /// URL-safe unique key, e.g. `home-fragrance`.
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

/// A sellable product.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: ProductId,
    pub category_id: Option<CategoryId>,
    pub name: String,
    pub description: String,
    /// Current unit price. Checkout snapshots this value.
    pub price: Money,
    /// Units available for sale. Reserved units are already subtracted.
    pub stock: u32,
    pub image_url: Option<String>,
    /// Inactive products are hidden and cannot be reserved.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    #[must_use]
    pub fn in_stock(&self) -> bool {
        self.is_active && self.stock > 0
    }
}
