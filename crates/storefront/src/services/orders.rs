//! Order fulfilment.

use thiserror::Error;
use tracing::{info, instrument, warn};

use souq_core::{OrderId, OrderStatus};
use sqlx::PgPool;

use crate::db::{OrderRepository, RepositoryError, orders, products};
use crate::models::Order;

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order not found")]
    NotFound,

    #[error("order cannot move from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Admin-side order operations.
pub struct OrderService<'a> {
    pool: &'a PgPool,
}

impl<'a> OrderService<'a> {
    #[must_use]
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Move an order to `to`. Cancelling returns its items to stock, once.
    /// Delivering a cash on delivery order records the cash as paid.
    ///
    /// # Errors
    ///
    /// Returns `OrderError::InvalidTransition` if the lifecycle forbids the
    /// move or another admin changed the order first.
    #[instrument(skip(self))]
    pub async fn update_status(&self, id: OrderId, to: OrderStatus) -> Result<Order, OrderError> {
        let current = OrderRepository::new(self.pool)
            .get(id)
            .await?
            .ok_or(OrderError::NotFound)?;
        if !current.status.can_transition_to(to) {
            return Err(OrderError::InvalidTransition {
                from: current.status,
                to,
            });
        }

        let mut tx = self.pool.begin().await?;
        let order = orders::update_status(&mut tx, id, current.status, to)
            .await?
            .ok_or(OrderError::InvalidTransition {
                from: current.status,
                to,
            })?;

        if to == OrderStatus::Cancelled && orders::mark_restocked(&mut tx, id).await? {
            for item in orders::list_items(&mut *tx, id).await? {
                let Some(product_id) = item.product_id else {
                    warn!(order_id = %id, product = %item.product_name, "Product deleted, not restocked");
                    continue;
                };
                if !products::restock(&mut tx, product_id, item.quantity).await? {
                    warn!(order_id = %id, %product_id, "Product deleted, not restocked");
                }
            }
            info!(order_id = %id, "Cancelled order restocked");
        }

        tx.commit().await?;
        info!(
            order_id = %id,
            order_number = %order.order_number,
            from = %current.status,
            to = %to,
            payment_status = %order.payment_status,
            "Order status updated"
        );
        Ok(order)
    }
}
