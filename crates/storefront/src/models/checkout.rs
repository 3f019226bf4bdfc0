//! Checkout session domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use souq_core::{
    CheckoutSessionId, CheckoutStatus, Email, Money, OrderId, PaymentMethod, PaymentStatus,
    ProductId, UserId,
};

/// Who is buying. Guests supply this at checkout; signed-in customers
/// default to their account email and name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerDetails {
    pub name: String,
    pub email: Email,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddress {
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    pub city: String,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default = "default_country")]
    pub country: String,
}

fn default_country() -> String {
    "BH".to_owned()
}

/// A priced line captured when stock was reserved.
///
/// The snapshot is authoritative: the order is built from it and a
/// release gives back exactly these quantities, regardless of later
/// catalog edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutLine {
    pub product_id: ProductId,
    pub name: String,
    pub unit_price: Money,
    pub quantity: u32,
    pub line_total: Money,
}

/// A checkout attempt holding (or having held) reserved stock.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub id: CheckoutSessionId,
    pub user_id: Option<UserId>,
    pub customer: CustomerDetails,
    pub shipping_address: ShippingAddress,
    pub items: Vec<CheckoutLine>,
    pub subtotal: Money,
    pub shipping_fee: Money,
    pub total: Money,
    pub payment_method: PaymentMethod,
    pub status: CheckoutStatus,
    pub payment_status: PaymentStatus,
    /// BENEFIT track id or EazyPay invoice id.
    pub gateway_reference: Option<String>,
    /// Last raw gateway result, kept for reconciliation and refunds.
    pub gateway_payload: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub order_id: Option<OrderId>,
    pub inventory_reserved_at: Option<DateTime<Utc>>,
    pub inventory_released_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckoutSession {
    /// Whether this session currently has stock set aside.
    #[must_use]
    pub fn holds_stock(&self) -> bool {
        self.status == CheckoutStatus::Initiated
            && self.inventory_reserved_at.is_some()
            && self.inventory_released_at.is_none()
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == CheckoutStatus::Initiated && self.expires_at <= now
    }
}

/// Data for a new `initiated` session; stock must already be reserved in
/// the same transaction.
#[derive(Debug, Clone)]
pub struct NewCheckoutSession {
    pub id: CheckoutSessionId,
    pub user_id: Option<UserId>,
    pub customer: CustomerDetails,
    pub shipping_address: ShippingAddress,
    pub items: Vec<CheckoutLine>,
    pub subtotal: Money,
    pub shipping_fee: Money,
    pub total: Money,
    pub payment_method: PaymentMethod,
    pub expires_at: DateTime<Utc>,
}
