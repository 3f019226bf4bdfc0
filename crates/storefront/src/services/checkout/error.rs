//! Checkout error types.

use thiserror::Error;

use souq_core::{CheckoutStatus, MoneyError, PaymentMethod, ProductId};

use crate::db::RepositoryError;
use crate::payments::PaymentError;

/// Errors that can occur while checking out or settling a payment.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// Nothing to check out.
    #[error("cart is empty")]
    EmptyCart,

    /// A line quantity is zero or above the per-line limit.
    #[error("invalid quantity {quantity} for product {product_id} (allowed 1..={max})")]
    InvalidQuantity {
        product_id: ProductId,
        quantity: u32,
        max: u32,
    },

    /// Missing or malformed customer or address details.
    #[error("invalid customer details: {0}")]
    InvalidCustomer(String),

    /// Product does not exist or is not for sale.
    #[error("product {0} is not available")]
    ProductUnavailable(ProductId),

    /// Not enough stock to reserve a line.
    #[error("insufficient stock for {product}")]
    InsufficientStock { product: String },

    /// The payment method's gateway is not configured.
    #[error("payment method {0} is not available")]
    GatewayDisabled(PaymentMethod),

    #[error("checkout session not found")]
    SessionNotFound,

    /// The session is not in a state that allows the request.
    #[error("checkout session cannot move from {from} to {to}")]
    InvalidTransition {
        from: CheckoutStatus,
        to: CheckoutStatus,
    },

    /// Refunds are only recorded for a late payment awaiting review.
    #[error("checkout session is not awaiting a refund")]
    NotAwaitingRefund,

    /// The session belongs to another customer.
    #[error("checkout session belongs to another customer")]
    Forbidden,

    /// Total overflowed.
    #[error("money error: {0}")]
    Money(#[from] MoneyError),

    /// Gateway call failed.
    #[error("payment gateway error: {0}")]
    Gateway(#[from] PaymentError),

    /// Transaction could not begin or commit.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Repository/database error.
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}
