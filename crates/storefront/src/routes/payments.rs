//! Payment gateway callbacks.
//!
//! These endpoints are called by the gateways (or by the customer's
//! browser on the way back from a hosted payment page) and never carry a
//! session cookie. EazyPay webhooks are HMAC-signed and verified before
//! the body is parsed. BENEFIT trandata is AES-CBC encrypted with the
//! terminal key but not signed; a notification is only applied to the
//! BENEFIT session its track id names.

use axum::{
    Form, Json,
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use souq_core::{CheckoutSessionId, CheckoutStatus, PaymentMethod, PaymentStatus};

use crate::error::{AppError, Result};
use crate::models::CheckoutSession;
use crate::payments::benefit::PaymentResponse;
use crate::payments::eazypay::WebhookEvent;
use crate::services::checkout::{CheckoutError, CheckoutService, Settlement};
use crate::state::AppState;

/// Header carrying the webhook timestamp in milliseconds.
const TIMESTAMP_HEADER: &str = "Timestamp";
/// Header carrying the webhook HMAC.
const SIGNATURE_HEADER: &str = "Secret-Hash";

/// BENEFIT posts `trandata` to both the response and the error URL.
#[derive(Debug, Default, Deserialize)]
pub struct TrandataForm {
    #[serde(default)]
    pub trandata: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReturnQuery {
    pub session: CheckoutSessionId,
}

/// Outcome shown on the storefront result page.
const fn settlement_outcome(settlement: &Settlement) -> &'static str {
    if settlement.is_paid() {
        "paid"
    } else if matches!(settlement, Settlement::Pending) {
        "pending"
    } else {
        "failed"
    }
}

fn session_outcome(session: &CheckoutSession) -> &'static str {
    if session.payment_status == PaymentStatus::Paid || session.status == CheckoutStatus::Paid {
        "paid"
    } else if session.status == CheckoutStatus::Initiated {
        "pending"
    } else {
        "failed"
    }
}

fn result_url(state: &AppState, session_id: Option<CheckoutSessionId>, outcome: &str) -> String {
    match session_id {
        Some(id) => state
            .config()
            .url(&format!("/checkout/result?session={id}&status={outcome}")),
        None => state.config().url(&format!("/checkout/result?status={outcome}")),
    }
}

fn parse_benefit(state: &AppState, trandata: &str) -> Result<PaymentResponse> {
    let client = state
        .benefit()
        .ok_or(CheckoutError::GatewayDisabled(PaymentMethod::Benefit))?;
    Ok(client.parse_notification(trandata)?)
}

/// BENEFIT server-to-server notification.
///
/// The gateway expects a plain-text `REDIRECT=<url>` body telling it where
/// to send the customer.
#[tracing::instrument(skip_all)]
pub async fn benefit_notify(
    State(state): State<AppState>,
    Form(form): Form<TrandataForm>,
) -> Result<Response> {
    let trandata = form
        .trandata
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing trandata".to_string()))?;
    let response = parse_benefit(&state, trandata)?;

    let (session_id, settlement) = CheckoutService::new(&state)
        .apply_benefit_notification(&response)
        .await?;
    info!(
        %session_id,
        result = response.result.as_deref().unwrap_or(""),
        settlement = settlement.as_str(),
        "BENEFIT notification applied"
    );

    let url = result_url(&state, Some(session_id), settlement_outcome(&settlement));
    Ok(format!("REDIRECT={url}").into_response())
}

/// BENEFIT error redirect (GET with query string).
pub async fn benefit_error(
    State(state): State<AppState>,
    Query(form): Query<TrandataForm>,
) -> Redirect {
    benefit_error_redirect(&state, form).await
}

/// BENEFIT error redirect (POST with form body).
pub async fn benefit_error_form(
    State(state): State<AppState>,
    Form(form): Form<TrandataForm>,
) -> Redirect {
    benefit_error_redirect(&state, form).await
}

/// Fail the session named by the trandata, if it decrypts, then send the
/// customer to the result page. Unverifiable input changes nothing.
async fn benefit_error_redirect(state: &AppState, form: TrandataForm) -> Redirect {
    let Some(trandata) = form.trandata.as_deref().filter(|t| !t.trim().is_empty()) else {
        return Redirect::to(&result_url(state, None, "failed"));
    };

    let applied = match parse_benefit(state, trandata) {
        Ok(response) => CheckoutService::new(state)
            .apply_benefit_notification(&response)
            .await
            .map_err(AppError::from),
        Err(e) => Err(e),
    };

    match applied {
        Ok((session_id, settlement)) => Redirect::to(&result_url(
            state,
            Some(session_id),
            settlement_outcome(&settlement),
        )),
        Err(e) => {
            warn!(error = %e, "BENEFIT error callback not applied");
            Redirect::to(&result_url(state, None, "failed"))
        }
    }
}

/// EazyPay webhook. The raw body is needed for the signature check.
#[tracing::instrument(skip_all)]
pub async fn eazypay_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    let client = state
        .eazypay()
        .ok_or(CheckoutError::GatewayDisabled(PaymentMethod::Eazypay))?;

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned()
    };
    client.verify_webhook(&header(TIMESTAMP_HEADER), &body, &header(SIGNATURE_HEADER))?;

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid webhook body: {e}")))?;
    let payload = serde_json::to_value(&event).ok();

    let (session_id, settlement) = CheckoutService::new(&state)
        .apply_invoice_status(
            &event.global_transactions_id,
            event.merchant_reference.as_deref(),
            &event.status,
            payload.as_ref(),
        )
        .await?;
    info!(
        %session_id,
        invoice_id = %event.global_transactions_id,
        status = %event.status,
        settlement = settlement.as_str(),
        "EazyPay webhook applied"
    );

    Ok(Json(json!({
        "received": true,
        "settlement": settlement.as_str(),
    })))
}

/// Customer returning from the EazyPay payment page. The invoice is
/// polled so the result page does not depend on webhook timing.
pub async fn eazypay_return(
    State(state): State<AppState>,
    Query(query): Query<ReturnQuery>,
) -> Redirect {
    match CheckoutService::new(&state).session_status(query.session).await {
        Ok(session) => Redirect::to(&result_url(
            &state,
            Some(session.id),
            session_outcome(&session),
        )),
        Err(e) => {
            warn!(session_id = %query.session, error = %e, "EazyPay return for unknown session");
            Redirect::to(&result_url(&state, None, "failed"))
        }
    }
}
