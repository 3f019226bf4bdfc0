//! Order domain types.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use souq_core::{
    CheckoutSessionId, Money, OrderId, OrderItemId, OrderStatus, PaymentMethod, PaymentStatus,
    ProductId, UserId,
};

use super::{CustomerDetails, ShippingAddress};

/// An order created from a converted checkout session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    /// Human-facing reference, e.g. `SQ-20260301-7KQ2MZ`.
    pub order_number: String,
    pub user_id: Option<UserId>,
    pub checkout_session_id: Option<CheckoutSessionId>,
    pub customer: CustomerDetails,
    pub shipping_address: ShippingAddress,
    pub subtotal: Money,
    pub shipping_fee: Money,
    pub total: Money,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub gateway_reference: Option<String>,
    pub status: OrderStatus,
    /// Set once when a cancellation returned the items to stock.
    pub inventory_restocked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Generate a human-facing order number: `SQ-<yyyymmdd>-<6 chars>`.
    ///
    /// The alphabet skips `0/O` and `1/I` so numbers survive being read out
    /// over the phone.
    #[must_use]
    pub fn generate_number(now: DateTime<Utc>) -> String {
        const CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
        let mut rng = rand::rng();
        let suffix: String = (0..6)
            .map(|_| {
                let idx = rng.random_range(0..CHARSET.len());
                CHARSET.get(idx).copied().map_or('X', char::from)
            })
            .collect();
        format!("SQ-{}-{suffix}", now.format("%Y%m%d"))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub id: OrderItemId,
    pub order_id: OrderId,
    /// `None` once the product has been deleted.
    pub product_id: Option<ProductId>,
    pub product_name: String,
    pub unit_price: Money,
    pub quantity: u32,
    pub line_total: Money,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderWithItems {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
}
