//! Order repository.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres};

use souq_core::{
    CheckoutSessionId, Email, Money, OrderId, OrderItemId, OrderStatus, PaymentMethod,
    PaymentStatus, ProductId, UserId,
};

use super::{RepositoryError, quantity_from_row, quantity_param};
use crate::models::{
    CheckoutLine, CheckoutSession, CustomerDetails, Order, OrderItem, OrderWithItems,
    ShippingAddress,
};

const ORDER_COLUMNS: &str = "id, order_number, user_id, checkout_session_id, customer_name, \
     customer_email, customer_phone, shipping_address, subtotal, shipping_fee, total, \
     payment_method, payment_status, gateway_reference, status, inventory_restocked_at, \
     created_at, updated_at";

const ITEM_COLUMNS: &str = "id, order_id, product_id, product_name, unit_price, quantity, line_total";

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: OrderId,
    order_number: String,
    user_id: Option<UserId>,
    checkout_session_id: Option<CheckoutSessionId>,
    customer_name: String,
    customer_email: String,
    customer_phone: String,
    shipping_address: Json<ShippingAddress>,
    subtotal: Money,
    shipping_fee: Money,
    total: Money,
    payment_method: PaymentMethod,
    payment_status: PaymentStatus,
    gateway_reference: Option<String>,
    status: OrderStatus,
    inventory_restocked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = RepositoryError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let email = Email::parse(&row.customer_email).map_err(|e| {
            RepositoryError::DataCorruption(format!("invalid customer email on order: {e}"))
        })?;

        Ok(Self {
            id: row.id,
            order_number: row.order_number,
            user_id: row.user_id,
            checkout_session_id: row.checkout_session_id,
            customer: CustomerDetails {
                name: row.customer_name,
                email,
                phone: row.customer_phone,
            },
            shipping_address: row.shipping_address.0,
            subtotal: row.subtotal,
            shipping_fee: row.shipping_fee,
            total: row.total,
            payment_method: row.payment_method,
            payment_status: row.payment_status,
            gateway_reference: row.gateway_reference,
            status: row.status,
            inventory_restocked_at: row.inventory_restocked_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderItemRow {
    id: OrderItemId,
    order_id: OrderId,
    product_id: Option<ProductId>,
    product_name: String,
    unit_price: Money,
    quantity: i32,
    line_total: Money,
}

impl TryFrom<OrderItemRow> for OrderItem {
    type Error = RepositoryError;

    fn try_from(row: OrderItemRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            product_id: row.product_id,
            product_name: row.product_name,
            unit_price: row.unit_price,
            quantity: quantity_from_row(row.quantity, "order item quantity")?,
            line_total: row.line_total,
        })
    }
}

/// Admin listing filter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Repository for orders outside a transaction.
pub struct OrderRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> OrderRepository<'a> {
    #[must_use]
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn get(&self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        row.map(Order::try_from).transpose()
    }

    /// Order plus its lines.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if a query fails.
    pub async fn get_with_items(
        &self,
        id: OrderId,
    ) -> Result<Option<OrderWithItems>, RepositoryError> {
        let Some(order) = self.get(id).await? else {
            return Ok(None);
        };
        let items = list_items(self.pool, id).await?;
        Ok(Some(OrderWithItems { order, items }))
    }

    /// The order a checkout session converted into, if any.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn get_by_session(
        &self,
        session_id: CheckoutSessionId,
    ) -> Result<Option<Order>, RepositoryError> {
        find_by_session(self.pool, session_id).await
    }

    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn items(&self, order_id: OrderId) -> Result<Vec<OrderItem>, RepositoryError> {
        list_items(self.pool, order_id).await
    }

    /// A customer's orders, newest first.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Order>, RepositoryError> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(Order::try_from).collect()
    }

    /// Admin listing, newest first.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn list(&self, filter: &OrderFilter) -> Result<Vec<Order>, RepositoryError> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR payment_status = $2)
             ORDER BY created_at DESC
             LIMIT $3 OFFSET $4"
        ))
        .bind(filter.status)
        .bind(filter.payment_status)
        .bind(filter.limit.unwrap_or(50).clamp(1, 200))
        .bind(filter.offset.unwrap_or(0).max(0))
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(Order::try_from).collect()
    }
}

/// Lines of an order, in insertion order.
///
/// # Errors
///
/// Returns `RepositoryError::Database` if the query fails.
pub async fn list_items(
    conn: impl sqlx::Executor<'_, Database = Postgres>,
    order_id: OrderId,
) -> Result<Vec<OrderItem>, RepositoryError> {
    let rows = sqlx::query_as::<_, OrderItemRow>(&format!(
        "SELECT {ITEM_COLUMNS} FROM order_items WHERE order_id = $1 ORDER BY product_name, id"
    ))
    .bind(order_id)
    .fetch_all(conn)
    .await?;

    rows.into_iter().map(OrderItem::try_from).collect()
}

/// The order a checkout session converted into, if any.
///
/// # Errors
///
/// Returns `RepositoryError::Database` if the query fails.
pub async fn find_by_session(
    conn: impl sqlx::Executor<'_, Database = Postgres>,
    session_id: CheckoutSessionId,
) -> Result<Option<Order>, RepositoryError> {
    let row = sqlx::query_as::<_, OrderRow>(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE checkout_session_id = $1"
    ))
    .bind(session_id)
    .fetch_optional(conn)
    .await?;

    row.map(Order::try_from).transpose()
}

/// Create the order for a paid session.
///
/// Returns `None` if the session already has an order; the unique
/// `checkout_session_id` makes this safe to call more than once.
///
/// # Errors
///
/// Returns `RepositoryError::Database` if the insert fails.
pub async fn insert_from_session(
    conn: &mut PgConnection,
    session: &CheckoutSession,
    order_number: &str,
) -> Result<Option<Order>, RepositoryError> {
    let row = sqlx::query_as::<_, OrderRow>(&format!(
        "INSERT INTO orders (
             order_number, user_id, checkout_session_id, customer_name, customer_email,
             customer_phone, shipping_address, subtotal, shipping_fee, total, payment_method,
             payment_status, gateway_reference, status
         )
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 'pending')
         ON CONFLICT (checkout_session_id) DO NOTHING
         RETURNING {ORDER_COLUMNS}"
    ))
    .bind(order_number)
    .bind(session.user_id)
    .bind(session.id)
    .bind(&session.customer.name)
    .bind(&session.customer.email)
    .bind(&session.customer.phone)
    .bind(Json(&session.shipping_address))
    .bind(session.subtotal)
    .bind(session.shipping_fee)
    .bind(session.total)
    .bind(session.payment_method)
    .bind(session.payment_status)
    .bind(&session.gateway_reference)
    .fetch_optional(conn)
    .await?;

    row.map(Order::try_from).transpose()
}

/// Copy the session's line snapshot into `order_items`.
///
/// # Errors
///
/// Returns `RepositoryError::Database` if an insert fails.
pub async fn insert_items(
    conn: &mut PgConnection,
    order_id: OrderId,
    lines: &[CheckoutLine],
) -> Result<Vec<OrderItem>, RepositoryError> {
    let mut items = Vec::with_capacity(lines.len());
    for line in lines {
        let row = sqlx::query_as::<_, OrderItemRow>(&format!(
            "INSERT INTO order_items (order_id, product_id, product_name, unit_price, quantity, line_total)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(order_id)
        .bind(line.product_id)
        .bind(&line.name)
        .bind(line.unit_price)
        .bind(quantity_param(line.quantity)?)
        .bind(line.line_total)
        .fetch_one(&mut *conn)
        .await?;
        items.push(row.try_into()?);
    }
    Ok(items)
}

/// Move an order from `from` to `to`. Returns `None` if the order was not
/// in `from` any more.
///
/// Delivering a cash on delivery order also marks it paid.
///
/// # Errors
///
/// Returns `RepositoryError::Conflict` if the transition is not allowed.
pub async fn update_status(
    conn: &mut PgConnection,
    id: OrderId,
    from: OrderStatus,
    to: OrderStatus,
) -> Result<Option<Order>, RepositoryError> {
    if !from.can_transition_to(to) {
        return Err(RepositoryError::Conflict(format!(
            "order cannot move from {from} to {to}"
        )));
    }

    let row = sqlx::query_as::<_, OrderRow>(&format!(
        "UPDATE orders SET
             status = $3,
             payment_status = CASE
                 WHEN $3 = 'delivered' AND payment_method = 'cod' THEN 'paid'
                 ELSE payment_status
             END,
             updated_at = NOW()
         WHERE id = $1 AND status = $2
         RETURNING {ORDER_COLUMNS}"
    ))
    .bind(id)
    .bind(from)
    .bind(to)
    .fetch_optional(conn)
    .await?;

    row.map(Order::try_from).transpose()
}

/// Claim the one-time restock of a cancelled order. Returns `false` if the
/// items were already returned to stock.
///
/// # Errors
///
/// Returns `RepositoryError::Database` if the update fails.
pub async fn mark_restocked(conn: &mut PgConnection, id: OrderId) -> Result<bool, RepositoryError> {
    let result = sqlx::query(
        "UPDATE orders SET inventory_restocked_at = NOW(), updated_at = NOW()
         WHERE id = $1 AND inventory_restocked_at IS NULL",
    )
    .bind(id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}
