//! Checkout session repository.
//!
//! Every status change is a conditional `UPDATE ... WHERE status = ...`
//! that returns the row only when it won. Callers treat `None` as "someone
//! else already moved this session" and re-read to find out where it went.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};

use souq_core::{
    CheckoutSessionId, CheckoutStatus, Email, Money, OrderId, PaymentMethod, PaymentStatus, UserId,
};

use super::RepositoryError;
use crate::models::checkout::NewCheckoutSession;
use crate::models::{CheckoutLine, CheckoutSession, CustomerDetails, ShippingAddress};

const SESSION_COLUMNS: &str = "id, user_id, customer_name, customer_email, customer_phone, \
     shipping_address, items, subtotal, shipping_fee, total, payment_method, status, \
     payment_status, gateway_reference, gateway_payload, failure_reason, order_id, \
     inventory_reserved_at, inventory_released_at, expires_at, paid_at, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct CheckoutSessionRow {
    id: CheckoutSessionId,
    user_id: Option<UserId>,
    customer_name: String,
    customer_email: String,
    customer_phone: String,
    shipping_address: Json<ShippingAddress>,
    items: Json<Vec<CheckoutLine>>,
    subtotal: Money,
    shipping_fee: Money,
    total: Money,
    payment_method: PaymentMethod,
    status: CheckoutStatus,
    payment_status: PaymentStatus,
    gateway_reference: Option<String>,
    gateway_payload: Option<serde_json::Value>,
    failure_reason: Option<String>,
    order_id: Option<OrderId>,
    inventory_reserved_at: Option<DateTime<Utc>>,
    inventory_released_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CheckoutSessionRow> for CheckoutSession {
    type Error = RepositoryError;

    fn try_from(row: CheckoutSessionRow) -> Result<Self, Self::Error> {
        let email = Email::parse(&row.customer_email).map_err(|e| {
            RepositoryError::DataCorruption(format!("invalid customer email on session: {e}"))
        })?;

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            customer: CustomerDetails {
                name: row.customer_name,
                email,
                phone: row.customer_phone,
            },
            shipping_address: row.shipping_address.0,
            items: row.items.0,
            subtotal: row.subtotal,
            shipping_fee: row.shipping_fee,
            total: row.total,
            payment_method: row.payment_method,
            status: row.status,
            payment_status: row.payment_status,
            gateway_reference: row.gateway_reference,
            gateway_payload: row.gateway_payload,
            failure_reason: row.failure_reason,
            order_id: row.order_id,
            inventory_reserved_at: row.inventory_reserved_at,
            inventory_released_at: row.inventory_released_at,
            expires_at: row.expires_at,
            paid_at: row.paid_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn convert(row: Option<CheckoutSessionRow>) -> Result<Option<CheckoutSession>, RepositoryError> {
    row.map(CheckoutSession::try_from).transpose()
}

/// Admin listing filter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSessionFilter {
    pub status: Option<CheckoutStatus>,
    pub payment_method: Option<PaymentMethod>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Repository for checkout sessions outside a transaction.
pub struct CheckoutSessionRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> CheckoutSessionRepository<'a> {
    #[must_use]
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn get(
        &self,
        id: CheckoutSessionId,
    ) -> Result<Option<CheckoutSession>, RepositoryError> {
        let row = sqlx::query_as::<_, CheckoutSessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM checkout_sessions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        convert(row)
    }

    /// Record the gateway's reference (BENEFIT track id, EazyPay invoice id)
    /// on a session still waiting for payment.
    ///
    /// Also succeeds when an early webhook already recorded this same
    /// reference and settled the session.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Conflict` if the session already left
    /// `initiated` or the reference is used by another session.
    pub async fn set_gateway_reference(
        &self,
        id: CheckoutSessionId,
        reference: &str,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE checkout_sessions SET gateway_reference = $2, updated_at = NOW()
             WHERE id = $1 AND (status = 'initiated' OR gateway_reference = $2)",
        )
        .bind(id)
        .bind(reference)
        .execute(self.pool)
        .await
        .map_err(|e| RepositoryError::conflict_on_unique(e, "gateway reference already in use"))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(
                "checkout session is no longer initiated".to_owned(),
            ));
        }
        Ok(())
    }

    /// Record a reference learned from the gateway on a session that has
    /// none yet. Returns `false` if the session already had one.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Conflict` if the reference is used by
    /// another session.
    pub async fn adopt_gateway_reference(
        &self,
        id: CheckoutSessionId,
        reference: &str,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE checkout_sessions SET gateway_reference = $2, updated_at = NOW()
             WHERE id = $1 AND gateway_reference IS NULL",
        )
        .bind(id)
        .bind(reference)
        .execute(self.pool)
        .await
        .map_err(|e| RepositoryError::conflict_on_unique(e, "gateway reference already in use"))?;

        Ok(result.rows_affected() > 0)
    }

    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn find_by_gateway_reference(
        &self,
        method: PaymentMethod,
        reference: &str,
    ) -> Result<Option<CheckoutSession>, RepositoryError> {
        let row = sqlx::query_as::<_, CheckoutSessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM checkout_sessions
             WHERE payment_method = $1 AND gateway_reference = $2"
        ))
        .bind(method)
        .bind(reference)
        .fetch_optional(self.pool)
        .await?;

        convert(row)
    }

    /// `initiated` sessions whose reservation window has closed, oldest
    /// first.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CheckoutSession>, RepositoryError> {
        let rows = sqlx::query_as::<_, CheckoutSessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM checkout_sessions
             WHERE status = 'initiated' AND expires_at <= $1
             ORDER BY expires_at
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(CheckoutSession::try_from).collect()
    }

    /// Online sessions still `initiated` that were handed to the gateway
    /// before `older_than`.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn list_pending_online(
        &self,
        method: PaymentMethod,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CheckoutSession>, RepositoryError> {
        let rows = sqlx::query_as::<_, CheckoutSessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM checkout_sessions
             WHERE status = 'initiated'
               AND payment_method = $1
               AND gateway_reference IS NOT NULL
               AND created_at <= $2
             ORDER BY created_at
             LIMIT $3"
        ))
        .bind(method)
        .bind(older_than)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(CheckoutSession::try_from).collect()
    }

    /// Delete `failed`/`expired` sessions last touched before `older_than`.
    ///
    /// Sessions that produced an order, or that recorded a payment needing
    /// review, are kept.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the delete fails.
    pub async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "DELETE FROM checkout_sessions
             WHERE status IN ('failed', 'expired')
               AND order_id IS NULL
               AND payment_status <> 'paid'
               AND inventory_released_at IS NOT NULL
               AND updated_at < $1",
        )
        .bind(older_than)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Close a late payment that was refunded by hand: `paid -> refunded`
    /// on a released session with no order. Returns `None` if the session
    /// was not awaiting a refund.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the update fails.
    pub async fn mark_refunded(
        &self,
        id: CheckoutSessionId,
    ) -> Result<Option<CheckoutSession>, RepositoryError> {
        let row = sqlx::query_as::<_, CheckoutSessionRow>(&format!(
            "UPDATE checkout_sessions SET payment_status = 'refunded', updated_at = NOW()
             WHERE id = $1
               AND status IN ('failed', 'expired')
               AND order_id IS NULL
               AND payment_status = 'paid'
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        convert(row)
    }

    /// Admin listing, newest first.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn list(
        &self,
        filter: &CheckoutSessionFilter,
    ) -> Result<Vec<CheckoutSession>, RepositoryError> {
        let rows = sqlx::query_as::<_, CheckoutSessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM checkout_sessions
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR payment_method = $2)
             ORDER BY created_at DESC
             LIMIT $3 OFFSET $4"
        ))
        .bind(filter.status)
        .bind(filter.payment_method)
        .bind(filter.limit.unwrap_or(50).clamp(1, 200))
        .bind(filter.offset.unwrap_or(0).max(0))
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(CheckoutSession::try_from).collect()
    }
}

/// Insert a new `initiated` session with its reservation timestamp.
///
/// # Errors
///
/// Returns `RepositoryError::Conflict` if the id is taken.
pub async fn insert(
    conn: &mut PgConnection,
    new: &NewCheckoutSession,
) -> Result<CheckoutSession, RepositoryError> {
    let row = sqlx::query_as::<_, CheckoutSessionRow>(&format!(
        "INSERT INTO checkout_sessions (
             id, user_id, customer_name, customer_email, customer_phone, shipping_address,
             items, subtotal, shipping_fee, total, payment_method, status, payment_status,
             inventory_reserved_at, expires_at
         )
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'initiated', 'pending', NOW(), $12)
         RETURNING {SESSION_COLUMNS}"
    ))
    .bind(new.id)
    .bind(new.user_id)
    .bind(&new.customer.name)
    .bind(&new.customer.email)
    .bind(&new.customer.phone)
    .bind(Json(&new.shipping_address))
    .bind(Json(&new.items))
    .bind(new.subtotal)
    .bind(new.shipping_fee)
    .bind(new.total)
    .bind(new.payment_method)
    .bind(new.expires_at)
    .fetch_one(conn)
    .await
    .map_err(|e| RepositoryError::conflict_on_unique(e, "checkout session already exists"))?;

    row.try_into()
}

/// Read a session and lock its row until the transaction ends.
///
/// # Errors
///
/// Returns `RepositoryError::Database` if the query fails.
pub async fn get_for_update(
    conn: &mut PgConnection,
    id: CheckoutSessionId,
) -> Result<Option<CheckoutSession>, RepositoryError> {
    let row = sqlx::query_as::<_, CheckoutSessionRow>(&format!(
        "SELECT {SESSION_COLUMNS} FROM checkout_sessions WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?;

    convert(row)
}

/// `initiated -> paid`.
///
/// `payment_status` is `paid` for gateway confirmations and stays
/// `pending` for cash on delivery. Returns `None` if the session was not
/// `initiated`.
///
/// # Errors
///
/// Returns `RepositoryError::Database` if the update fails.
pub async fn mark_paid(
    conn: &mut PgConnection,
    id: CheckoutSessionId,
    payment_status: PaymentStatus,
    gateway_reference: Option<&str>,
    payload: Option<&serde_json::Value>,
) -> Result<Option<CheckoutSession>, RepositoryError> {
    let row = sqlx::query_as::<_, CheckoutSessionRow>(&format!(
        "UPDATE checkout_sessions SET
             status = 'paid',
             payment_status = $2,
             gateway_reference = COALESCE($3, gateway_reference),
             gateway_payload = COALESCE($4, gateway_payload),
             paid_at = CASE WHEN $2 = 'paid' THEN NOW() ELSE paid_at END,
             updated_at = NOW()
         WHERE id = $1 AND status = 'initiated'
         RETURNING {SESSION_COLUMNS}"
    ))
    .bind(id)
    .bind(payment_status)
    .bind(gateway_reference)
    .bind(payload)
    .fetch_optional(conn)
    .await?;

    convert(row)
}

/// `initiated -> failed | expired`, releasing the reservation.
///
/// Guarded on `inventory_released_at IS NULL` as well as status, so only
/// one caller ever gets the item snapshot back. The caller must restock
/// exactly those lines in the same transaction. Returns `None` when the
/// session was already settled.
///
/// # Errors
///
/// Returns `RepositoryError::Conflict` if `to` is not a release state.
pub async fn release(
    conn: &mut PgConnection,
    id: CheckoutSessionId,
    to: CheckoutStatus,
    reason: Option<&str>,
    payload: Option<&serde_json::Value>,
) -> Result<Option<Vec<CheckoutLine>>, RepositoryError> {
    if !matches!(to, CheckoutStatus::Failed | CheckoutStatus::Expired) {
        return Err(RepositoryError::Conflict(format!(
            "cannot release a checkout session into {to}"
        )));
    }

    let items: Option<(Json<Vec<CheckoutLine>>,)> = sqlx::query_as(
        "UPDATE checkout_sessions SET
             status = $2,
             payment_status = CASE WHEN $2 = 'failed' THEN 'failed' ELSE payment_status END,
             failure_reason = COALESCE($3, failure_reason),
             gateway_payload = COALESCE($4, gateway_payload),
             inventory_released_at = NOW(),
             updated_at = NOW()
         WHERE id = $1 AND status = 'initiated' AND inventory_released_at IS NULL
         RETURNING items",
    )
    .bind(id)
    .bind(to)
    .bind(reason)
    .bind(payload)
    .fetch_optional(conn)
    .await?;

    Ok(items.map(|(Json(items),)| items))
}

/// Late payment whose stock was re-reserved: `failed | expired -> paid`.
///
/// Only legal for a session that never produced an order and whose
/// reservation had been released. Returns `None` otherwise.
///
/// # Errors
///
/// Returns `RepositoryError::Database` if the update fails.
pub async fn reclaim_late_payment(
    conn: &mut PgConnection,
    id: CheckoutSessionId,
    gateway_reference: Option<&str>,
    payload: Option<&serde_json::Value>,
) -> Result<Option<CheckoutSession>, RepositoryError> {
    let row = sqlx::query_as::<_, CheckoutSessionRow>(&format!(
        "UPDATE checkout_sessions SET
             status = 'paid',
             payment_status = 'paid',
             gateway_reference = COALESCE($2, gateway_reference),
             gateway_payload = COALESCE($3, gateway_payload),
             failure_reason = NULL,
             inventory_reserved_at = NOW(),
             inventory_released_at = NULL,
             paid_at = NOW(),
             updated_at = NOW()
         WHERE id = $1
           AND status IN ('failed', 'expired')
           AND order_id IS NULL
           AND inventory_released_at IS NOT NULL
           AND payment_status <> 'refunded'
         RETURNING {SESSION_COLUMNS}"
    ))
    .bind(id)
    .bind(gateway_reference)
    .bind(payload)
    .fetch_optional(conn)
    .await?;

    convert(row)
}

/// Record money received for a session whose stock is gone. Status is left
/// alone; the session now needs a manual refund or fulfilment.
///
/// Returns `false` if the payment was already recorded.
///
/// # Errors
///
/// Returns `RepositoryError::Database` if the update fails.
pub async fn flag_late_payment(
    conn: &mut PgConnection,
    id: CheckoutSessionId,
    gateway_reference: Option<&str>,
    payload: Option<&serde_json::Value>,
    reason: &str,
) -> Result<bool, RepositoryError> {
    let result = sqlx::query(
        "UPDATE checkout_sessions SET
             payment_status = 'paid',
             gateway_reference = COALESCE($2, gateway_reference),
             gateway_payload = COALESCE($3, gateway_payload),
             failure_reason = $4,
             paid_at = NOW(),
             updated_at = NOW()
         WHERE id = $1
           AND status IN ('failed', 'expired')
           AND payment_status NOT IN ('paid', 'refunded')",
    )
    .bind(id)
    .bind(gateway_reference)
    .bind(payload)
    .bind(reason)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Link a paid session to the order it produced.
///
/// # Errors
///
/// Returns `RepositoryError::Database` if the update fails.
pub async fn attach_order(
    conn: &mut PgConnection,
    id: CheckoutSessionId,
    order_id: OrderId,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "UPDATE checkout_sessions SET order_id = $2, updated_at = NOW()
         WHERE id = $1 AND status = 'paid'",
    )
    .bind(id)
    .bind(order_id)
    .execute(conn)
    .await?;
    Ok(())
}
