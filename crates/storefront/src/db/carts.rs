//! Saved carts for signed-in customers.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};

use souq_core::UserId;

use super::RepositoryError;
use crate::models::{Cart, CartItem};

#[derive(Debug, sqlx::FromRow)]
struct CartRow {
    items: Json<Vec<CartItem>>,
    updated_at: DateTime<Utc>,
}

/// Repository for `user_carts`.
pub struct CartRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> CartRepository<'a> {
    #[must_use]
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// The user's saved cart; empty if none was saved.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn get(&self, user_id: UserId) -> Result<Cart, RepositoryError> {
        let row = sqlx::query_as::<_, CartRow>(
            "SELECT items, updated_at FROM user_carts WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map_or_else(Cart::default, |r| Cart {
            items: r.items.0,
            updated_at: Some(r.updated_at),
        }))
    }

    /// Replace the saved cart.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the upsert fails.
    pub async fn upsert(&self, user_id: UserId, items: &[CartItem]) -> Result<Cart, RepositoryError> {
        let row = sqlx::query_as::<_, CartRow>(
            "INSERT INTO user_carts (user_id, items, updated_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (user_id) DO UPDATE SET items = EXCLUDED.items, updated_at = NOW()
             RETURNING items, updated_at",
        )
        .bind(user_id)
        .bind(Json(items))
        .fetch_one(self.pool)
        .await?;

        Ok(Cart {
            items: row.items.0,
            updated_at: Some(row.updated_at),
        })
    }

    /// Delete the saved cart.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the delete fails.
    pub async fn delete(&self, user_id: UserId) -> Result<(), RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        clear(&mut *conn, user_id).await
    }
}

/// Delete the saved cart inside a checkout transaction.
///
/// # Errors
///
/// Returns `RepositoryError::Database` if the delete fails.
pub async fn clear(conn: &mut PgConnection, user_id: UserId) -> Result<(), RepositoryError> {
    sqlx::query("DELETE FROM user_carts WHERE user_id = $1")
        .bind(user_id)
        .execute(conn)
        .await?;
    Ok(())
}
