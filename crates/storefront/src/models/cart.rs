//! Saved cart for signed-in customers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use souq_core::ProductId;

/// One cart line. Prices are never stored in the cart; checkout reads
/// them from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub product_id: ProductId,
    pub quantity: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    pub items: Vec<CartItem>,
    pub updated_at: Option<DateTime<Utc>>,
}
