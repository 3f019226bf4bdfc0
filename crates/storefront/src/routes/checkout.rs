//! Checkout route handlers.
//!
//! Guests and signed-in customers both check out here. A session id is a
//! random UUID and is the only handle a guest has, so the status view
//! leaves out customer and address details.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use souq_core::{CheckoutSessionId, CheckoutStatus, Money, PaymentMethod, PaymentStatus};

use crate::db::OrderRepository;
use crate::error::Result;
use crate::middleware::OptionalAuth;
use crate::models::CheckoutSession;
use crate::services::checkout::{CheckoutRequest, CheckoutService, CheckoutStarted};
use crate::state::AppState;

/// Public view of a checkout session.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutStatusView {
    pub session_id: CheckoutSessionId,
    pub status: CheckoutStatus,
    pub payment_status: PaymentStatus,
    pub payment_method: PaymentMethod,
    pub total: Money,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl CheckoutStatusView {
    fn new(session: &CheckoutSession, order_number: Option<String>) -> Self {
        Self {
            session_id: session.id,
            status: session.status,
            payment_status: session.payment_status,
            payment_method: session.payment_method,
            total: session.total,
            expires_at: session.expires_at,
            order_number,
            failure_reason: session.failure_reason.clone(),
        }
    }
}

/// Reserve stock and start payment.
///
/// Responds `201` with the hosted payment URL for online methods, or the
/// created order for cash on delivery.
pub async fn start(
    State(state): State<AppState>,
    OptionalAuth(user): OptionalAuth,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutStarted>)> {
    let started = CheckoutService::new(&state)
        .start_checkout(request, user.as_ref())
        .await?;
    Ok((StatusCode::CREATED, Json(started)))
}

/// Session status. An unpaid EazyPay session is checked with the gateway.
pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<CheckoutSessionId>,
) -> Result<Json<CheckoutStatusView>> {
    let session = CheckoutService::new(&state).session_status(id).await?;
    let order_number = if session.order_id.is_some() {
        OrderRepository::new(state.pool())
            .get_by_session(id)
            .await?
            .map(|o| o.order_number)
    } else {
        None
    };
    Ok(Json(CheckoutStatusView::new(&session, order_number)))
}

/// Cancel an unpaid session and return its stock.
pub async fn cancel(
    State(state): State<AppState>,
    OptionalAuth(user): OptionalAuth,
    Path(id): Path<CheckoutSessionId>,
) -> Result<Json<CheckoutStatusView>> {
    let service = CheckoutService::new(&state);
    service.cancel(id, user.as_ref()).await?;
    let session = service.session_status(id).await?;
    Ok(Json(CheckoutStatusView::new(&session, None)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::{CustomerDetails, ShippingAddress};
    use souq_core::Email;

    fn session() -> CheckoutSession {
        let now = Utc::now();
        CheckoutSession {
            id: CheckoutSessionId::generate(),
            user_id: None,
            customer: CustomerDetails {
                name: "Fatima Ali".to_owned(),
                email: Email::parse("fatima@example.bh").unwrap(),
                phone: "+973 3600 1234".to_owned(),
            },
            shipping_address: ShippingAddress {
                line1: "Bldg 12, Road 34".to_owned(),
                line2: None,
                city: "Manama".to_owned(),
                postal_code: None,
                country: "BH".to_owned(),
            },
            items: Vec::new(),
            subtotal: Money::from_fils(12_000),
            shipping_fee: Money::from_fils(1_000),
            total: Money::from_fils(13_000),
            payment_method: PaymentMethod::Benefit,
            status: CheckoutStatus::Failed,
            payment_status: PaymentStatus::Failed,
            gateway_reference: Some("track".to_owned()),
            gateway_payload: None,
            failure_reason: Some("NOT CAPTURED".to_owned()),
            order_id: None,
            inventory_reserved_at: Some(now),
            inventory_released_at: Some(now),
            expires_at: now,
            paid_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_status_view_hides_customer() {
        let json = serde_json::to_value(CheckoutStatusView::new(&session(), None)).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["total"], "13.000");
        assert_eq!(json["failureReason"], "NOT CAPTURED");
        assert!(json.get("orderNumber").is_none());
        assert!(json.get("customer").is_none());
        assert!(json.get("shippingAddress").is_none());
    }
}
