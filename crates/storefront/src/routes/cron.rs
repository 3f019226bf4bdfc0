//! Scheduled job endpoints.
//!
//! Called by an external scheduler with `Authorization: Bearer
//! <CRON_SECRET>`. Both jobs are idempotent and safe to overlap with the
//! in-process sweeper.

use axum::{Json, extract::State};
use serde::Serialize;

use crate::error::Result;
use crate::middleware::RequireCron;
use crate::services::checkout::{
    CheckoutService, DEFAULT_SWEEP_BATCH, RECONCILE_AFTER_MINUTES, SweepReport,
};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpireReservationsReport {
    pub reconciled: SweepReport,
    pub released: SweepReport,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub purged: u64,
}

/// Reconcile pending EazyPay payments, then release expired reservations.
#[tracing::instrument(skip_all)]
pub async fn expire_reservations(
    State(state): State<AppState>,
    _cron: RequireCron,
) -> Result<Json<ExpireReservationsReport>> {
    let service = CheckoutService::new(&state);
    let reconciled = service
        .reconcile_pending(
            chrono::Duration::minutes(RECONCILE_AFTER_MINUTES),
            DEFAULT_SWEEP_BATCH,
        )
        .await?;
    let released = service.release_expired(DEFAULT_SWEEP_BATCH).await?;

    Ok(Json(ExpireReservationsReport {
        reconciled,
        released,
    }))
}

/// Delete old terminal checkout sessions.
#[tracing::instrument(skip_all)]
pub async fn cleanup_sessions(
    State(state): State<AppState>,
    _cron: RequireCron,
) -> Result<Json<CleanupReport>> {
    let purged = CheckoutService::new(&state).purge_stale().await?;
    Ok(Json(CleanupReport { purged }))
}
