//! Checkout orchestration.
//!
//! A checkout session moves through a small state machine:
//!
//! ```text
//! initiated ──► paid      (order created, stock stays sold)
//!     ├──────► failed    (stock returned)
//!     └──────► expired   (stock returned)
//! ```
//!
//! Stock is taken once, when the session is created, by conditional
//! `UPDATE`s in the same transaction that inserts the session. It is given
//! back at most once, by whichever caller wins the `release` compare-and-set.
//! Gateway notifications, redirects, polling and the sweeper may all race
//! on the same session; each of them goes through [`CheckoutService`], which
//! locks the session row before deciding anything.
//!
//! A payment that arrives after the session failed or expired is not lost:
//! the service tries to take the stock again and converts on success, or
//! records the payment for manual review.

mod error;

pub use error::CheckoutError;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgConnection};
use tracing::{debug, error, info, instrument, warn};

use souq_core::{
    CheckoutSessionId, CheckoutStatus, Email, Money, MoneyError, PaymentMethod, PaymentStatus,
    ProductId,
};

use crate::config::CheckoutConfig;
use crate::db::{
    CartRepository, CheckoutSessionRepository, RepositoryError, carts, checkout_sessions, orders,
    products,
};
use crate::models::checkout::NewCheckoutSession;
use crate::models::{
    CartItem, CheckoutLine, CheckoutSession, CurrentUser, CustomerDetails, Order, ShippingAddress,
};
use crate::payments::benefit::{PaymentRequest, PaymentResponse};
use crate::payments::eazypay::{InvoiceRequest, InvoiceStatus};
use crate::state::AppState;

const MAX_NAME_LENGTH: usize = 100;
const MAX_ADDRESS_FIELD_LENGTH: usize = 200;
const MIN_PHONE_DIGITS: usize = 8;
const MAX_PHONE_DIGITS: usize = 15;

/// Sessions handled per sweeper pass.
pub const DEFAULT_SWEEP_BATCH: i64 = 200;

/// Unpaid EazyPay invoices at least this old are polled by the sweeper.
pub const RECONCILE_AFTER_MINUTES: i64 = 5;

/// Checkout input.
///
/// `items` may be left empty by a signed-in customer to check out the
/// saved cart. Customer name and email default to the account's.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    #[serde(default)]
    pub items: Vec<CartItem>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_phone: String,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
}

/// Result of starting a checkout.
///
/// Online methods carry the hosted payment page to redirect to; cash on
/// delivery carries the order it was converted into.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutStarted {
    pub session_id: CheckoutSessionId,
    pub status: CheckoutStatus,
    pub payment_method: PaymentMethod,
    pub total: Money,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
}

impl CheckoutStarted {
    fn new(session: &CheckoutSession, payment_url: Option<String>, order: Option<Order>) -> Self {
        Self {
            session_id: session.id,
            status: session.status,
            payment_method: session.payment_method,
            total: session.total,
            expires_at: session.expires_at,
            payment_url,
            order,
        }
    }
}

/// What applying a payment result did to a session.
#[derive(Debug, Clone)]
pub enum Settlement {
    /// The session became an order just now.
    Converted(Order),
    /// The session had already been converted; nothing was written.
    AlreadyConverted(Order),
    /// Money arrived after the stock was given back and it could not be
    /// taken again. The payment is recorded on the session.
    RequiresReview,
    /// The session failed and its stock was returned.
    Failed,
    /// The session had already left `initiated`; nothing was written.
    AlreadySettled(CheckoutStatus),
    /// The gateway has no final answer yet.
    Pending,
}

impl Settlement {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Converted(_) => "converted",
            Self::AlreadyConverted(_) => "already_converted",
            Self::RequiresReview => "requires_review",
            Self::Failed => "failed",
            Self::AlreadySettled(_) => "already_settled",
            Self::Pending => "pending",
        }
    }

    /// Whether the customer's money was taken.
    #[must_use]
    pub const fn is_paid(&self) -> bool {
        matches!(
            self,
            Self::Converted(_)
                | Self::AlreadyConverted(_)
                | Self::RequiresReview
                | Self::AlreadySettled(CheckoutStatus::Paid)
        )
    }

    #[must_use]
    pub const fn order(&self) -> Option<&Order> {
        match self {
            Self::Converted(order) | Self::AlreadyConverted(order) => Some(order),
            _ => None,
        }
    }
}

/// Counts from a sweeper or reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub converted: usize,
    pub failed: usize,
    pub needs_review: usize,
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, settlement: &Settlement) {
        match settlement {
            Settlement::Converted(_) => self.converted += 1,
            Settlement::Failed => self.failed += 1,
            Settlement::RequiresReview => self.needs_review += 1,
            Settlement::AlreadyConverted(_)
            | Settlement::AlreadySettled(_)
            | Settlement::Pending => {}
        }
    }
}

/// Checkout and payment reconciliation.
pub struct CheckoutService<'a> {
    state: &'a AppState,
}

impl<'a> CheckoutService<'a> {
    #[must_use]
    pub const fn new(state: &'a AppState) -> Self {
        Self { state }
    }

    fn sessions(&self) -> CheckoutSessionRepository<'_> {
        CheckoutSessionRepository::new(self.state.pool())
    }

    /// Reserve stock and open a checkout session.
    ///
    /// Cash on delivery converts in the same transaction. Online methods
    /// are handed to their gateway after the reservation commits; if the
    /// gateway call fails the session is failed and its stock returned.
    ///
    /// # Errors
    ///
    /// Returns a validation variant for bad input,
    /// `CheckoutError::InsufficientStock` or `CheckoutError::ProductUnavailable`
    /// when a line cannot be reserved (nothing is reserved in that case),
    /// and `CheckoutError::Gateway` when the payment page cannot be created.
    #[instrument(
        skip(self, request, user),
        fields(payment_method = %request.payment_method, user_id = tracing::field::Empty)
    )]
    pub async fn start_checkout(
        &self,
        request: CheckoutRequest,
        user: Option<&CurrentUser>,
    ) -> Result<CheckoutStarted, CheckoutError> {
        let config = &self.state.config().checkout;
        if let Some(user) = user {
            tracing::Span::current().record("user_id", tracing::field::display(user.id));
        }

        let items = match user {
            Some(user) if request.items.is_empty() => {
                CartRepository::new(self.state.pool()).get(user.id).await?.items
            }
            _ => request.items.clone(),
        };
        let lines = merge_lines(&items, config.max_line_quantity)?;
        let customer = resolve_customer(&request, user)?;
        let shipping_address = validate_address(&request.shipping_address)?;
        self.ensure_gateway(request.payment_method)?;

        let mut tx = self.state.pool().begin().await?;
        let reserved = reserve_lines(&mut tx, &lines).await?;
        let totals = compute_totals(&reserved, config)?;

        let session = checkout_sessions::insert(
            &mut tx,
            &NewCheckoutSession {
                id: CheckoutSessionId::generate(),
                user_id: user.map(|u| u.id),
                customer,
                shipping_address,
                items: reserved,
                subtotal: totals.subtotal,
                shipping_fee: totals.shipping_fee,
                total: totals.total,
                payment_method: request.payment_method,
                expires_at: Utc::now() + config.reservation_ttl,
            },
        )
        .await?;

        if request.payment_method == PaymentMethod::Cod {
            let paid = checkout_sessions::mark_paid(
                &mut tx,
                session.id,
                PaymentStatus::Pending,
                None,
                None,
            )
            .await?
            .ok_or(CheckoutError::SessionNotFound)?;
            let order = convert(&mut tx, &paid).await?;
            tx.commit().await?;

            info!(
                session_id = %paid.id,
                order_number = %order.order_number,
                total = %paid.total,
                outcome = "converted",
                "Cash on delivery checkout converted"
            );
            return Ok(CheckoutStarted::new(&paid, None, Some(order)));
        }

        tx.commit().await?;
        info!(
            session_id = %session.id,
            total = %session.total,
            lines = session.items.len(),
            expires_at = %session.expires_at,
            "Stock reserved"
        );

        let handoff = if session.payment_method == PaymentMethod::Benefit {
            self.start_benefit(&session).await
        } else {
            self.start_eazypay(&session).await
        };

        match handoff {
            Ok(url) => Ok(CheckoutStarted::new(&session, Some(url), None)),
            Err(e) => {
                error!(session_id = %session.id, error = %e, "Payment gateway hand-off failed");
                if let Err(release_err) = self
                    .fail_payment(session.id, "payment gateway unavailable", None)
                    .await
                {
                    error!(
                        session_id = %session.id,
                        error = %release_err,
                        "Could not release stock after gateway failure"
                    );
                }
                Err(e)
            }
        }
    }

    fn ensure_gateway(&self, method: PaymentMethod) -> Result<(), CheckoutError> {
        let enabled = match method {
            PaymentMethod::Cod => true,
            PaymentMethod::Benefit => self.state.benefit().is_some(),
            PaymentMethod::Eazypay => self.state.eazypay().is_some(),
        };
        if enabled {
            Ok(())
        } else {
            Err(CheckoutError::GatewayDisabled(method))
        }
    }

    async fn start_benefit(&self, session: &CheckoutSession) -> Result<String, CheckoutError> {
        let client = self
            .state
            .benefit()
            .ok_or(CheckoutError::GatewayDisabled(PaymentMethod::Benefit))?;
        let config = self.state.config();

        let track_id = session.id.to_string();
        self.sessions()
            .set_gateway_reference(session.id, &track_id)
            .await?;

        let request = PaymentRequest {
            amount: session.total,
            track_id: track_id.clone(),
            udf: [
                Some(track_id),
                Some(session.customer.email.as_str().to_owned()),
                None,
                None,
                None,
            ],
            response_url: config.url("/api/payments/benefit/notify"),
            error_url: config.url("/api/payments/benefit/error"),
        };
        Ok(client.create_payment(&request).await?)
    }

    async fn start_eazypay(&self, session: &CheckoutSession) -> Result<String, CheckoutError> {
        let client = self
            .state
            .eazypay()
            .ok_or(CheckoutError::GatewayDisabled(PaymentMethod::Eazypay))?;
        let config = self.state.config();

        let invoice = client
            .create_invoice(&InvoiceRequest {
                amount: session.total,
                description: format!("Souq order {}", session.id),
                return_url: config.url(&format!(
                    "/api/payments/eazypay/return?session={}",
                    session.id
                )),
                webhook_url: config.url("/api/payments/eazypay/webhook"),
                reference: session.id.to_string(),
                customer_email: session.customer.email.as_str().to_owned(),
                customer_phone: session.customer.phone.clone(),
            })
            .await?;

        self.sessions()
            .set_gateway_reference(session.id, &invoice.global_transactions_id)
            .await?;
        Ok(invoice.payment_url)
    }

    /// Apply a confirmed payment.
    ///
    /// Safe to call any number of times: only the first call for an
    /// `initiated` session writes anything.
    ///
    /// # Errors
    ///
    /// Returns `CheckoutError::SessionNotFound` for an unknown id.
    #[instrument(skip(self, payload))]
    pub async fn confirm_payment(
        &self,
        id: CheckoutSessionId,
        gateway_reference: Option<&str>,
        payload: Option<&serde_json::Value>,
    ) -> Result<Settlement, CheckoutError> {
        let mut tx = self.state.pool().begin().await?;
        let session = checkout_sessions::get_for_update(&mut tx, id)
            .await?
            .ok_or(CheckoutError::SessionNotFound)?;

        let settlement = match session.status {
            CheckoutStatus::Initiated => {
                let paid = checkout_sessions::mark_paid(
                    &mut tx,
                    id,
                    PaymentStatus::Paid,
                    gateway_reference,
                    payload,
                )
                .await?
                .ok_or(CheckoutError::InvalidTransition {
                    from: session.status,
                    to: CheckoutStatus::Paid,
                })?;
                let order = convert(&mut tx, &paid).await?;
                info!(
                    session_id = %id,
                    order_number = %order.order_number,
                    outcome = "converted",
                    "Payment confirmed"
                );
                Settlement::Converted(order)
            }
            CheckoutStatus::Paid => {
                let order = orders::find_by_session(&mut *tx, id).await?.ok_or_else(|| {
                    RepositoryError::DataCorruption(format!("paid session {id} has no order"))
                })?;
                debug!(session_id = %id, outcome = "already_converted", "Duplicate confirmation");
                Settlement::AlreadyConverted(order)
            }
            CheckoutStatus::Failed | CheckoutStatus::Expired => {
                settle_late_payment(&mut tx, &session, gateway_reference, payload).await?
            }
        };

        tx.commit().await?;
        Ok(settlement)
    }

    /// Fail an `initiated` session and return its stock.
    ///
    /// A session that already left `initiated` is left alone.
    ///
    /// # Errors
    ///
    /// Returns `CheckoutError::SessionNotFound` for an unknown id.
    #[instrument(skip(self, payload))]
    pub async fn fail_payment(
        &self,
        id: CheckoutSessionId,
        reason: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<Settlement, CheckoutError> {
        let mut tx = self.state.pool().begin().await?;

        let Some(items) =
            checkout_sessions::release(&mut tx, id, CheckoutStatus::Failed, Some(reason), payload)
                .await?
        else {
            let session = checkout_sessions::get_for_update(&mut tx, id)
                .await?
                .ok_or(CheckoutError::SessionNotFound)?;
            debug!(session_id = %id, status = %session.status, "Session already settled");
            return Ok(Settlement::AlreadySettled(session.status));
        };

        restock_lines(&mut tx, id, &items).await?;
        tx.commit().await?;

        info!(session_id = %id, reason, outcome = "failed", "Checkout session failed, stock released");
        Ok(Settlement::Failed)
    }

    /// Customer abandons a checkout before paying.
    ///
    /// # Errors
    ///
    /// Returns `CheckoutError::Forbidden` if the session belongs to another
    /// account and `CheckoutError::InvalidTransition` if it already left
    /// `initiated`.
    #[instrument(skip(self, user))]
    pub async fn cancel(
        &self,
        id: CheckoutSessionId,
        user: Option<&CurrentUser>,
    ) -> Result<Settlement, CheckoutError> {
        let session = self
            .sessions()
            .get(id)
            .await?
            .ok_or(CheckoutError::SessionNotFound)?;

        if let Some(owner) = session.user_id
            && user.is_none_or(|u| u.id != owner && !u.is_admin())
        {
            return Err(CheckoutError::Forbidden);
        }
        if session.status != CheckoutStatus::Initiated {
            return Err(CheckoutError::InvalidTransition {
                from: session.status,
                to: CheckoutStatus::Failed,
            });
        }

        self.fail_payment(id, "cancelled by customer", None).await
    }

    /// Apply a decrypted BENEFIT notification.
    ///
    /// # Errors
    ///
    /// Returns `CheckoutError::SessionNotFound` if the notification does not
    /// name a BENEFIT session of this store.
    #[instrument(skip_all, fields(track_id = response.track_id.as_deref().unwrap_or("")))]
    pub async fn apply_benefit_notification(
        &self,
        response: &PaymentResponse,
    ) -> Result<(CheckoutSessionId, Settlement), CheckoutError> {
        let session_id = response
            .udf1
            .as_deref()
            .or(response.track_id.as_deref())
            .and_then(|raw| raw.trim().parse::<CheckoutSessionId>().ok())
            .ok_or(CheckoutError::SessionNotFound)?;

        let session = self
            .sessions()
            .get(session_id)
            .await?
            .filter(|s| s.payment_method == PaymentMethod::Benefit)
            .ok_or(CheckoutError::SessionNotFound)?;

        if response.is_captured() {
            warn_on_amount_mismatch(&session, response.amount.as_deref());
        }

        let payload = response.to_payload();
        let settlement = if response.is_captured() {
            self.confirm_payment(session_id, None, Some(&payload)).await?
        } else {
            self.fail_payment(session_id, &response.failure_reason(), Some(&payload))
                .await?
        };
        Ok((session_id, settlement))
    }

    /// Apply an EazyPay invoice status (from a webhook) to its session.
    ///
    /// The session is found by invoice id. A webhook can beat the invoice
    /// id being stored at checkout, so a session with no reference yet is
    /// also found by `merchant_reference` and adopts the invoice id.
    ///
    /// # Errors
    ///
    /// Returns `CheckoutError::SessionNotFound` if neither reference names
    /// an EazyPay session of this store.
    #[instrument(skip(self, payload))]
    pub async fn apply_invoice_status(
        &self,
        invoice_id: &str,
        merchant_reference: Option<&str>,
        status: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<(CheckoutSessionId, Settlement), CheckoutError> {
        let session = match self
            .sessions()
            .find_by_gateway_reference(PaymentMethod::Eazypay, invoice_id)
            .await?
        {
            Some(session) => session,
            None => self.adopt_invoice(invoice_id, merchant_reference).await?,
        };

        let settlement = self.settle_invoice(session.id, status, payload).await?;
        Ok((session.id, settlement))
    }

    async fn adopt_invoice(
        &self,
        invoice_id: &str,
        merchant_reference: Option<&str>,
    ) -> Result<CheckoutSession, CheckoutError> {
        let session_id = merchant_reference
            .and_then(|raw| raw.trim().parse::<CheckoutSessionId>().ok())
            .ok_or(CheckoutError::SessionNotFound)?;
        let session = self
            .sessions()
            .get(session_id)
            .await?
            .filter(|s| s.payment_method == PaymentMethod::Eazypay)
            .ok_or(CheckoutError::SessionNotFound)?;

        match session.gateway_reference.as_deref() {
            None => {
                self.sessions()
                    .adopt_gateway_reference(session_id, invoice_id)
                    .await?;
                info!(%session_id, invoice_id, "Invoice id adopted from webhook");
            }
            Some(known) if known == invoice_id => {}
            Some(known) => {
                warn!(%session_id, invoice_id, known, "Webhook invoice does not match session");
                return Err(CheckoutError::SessionNotFound);
            }
        }
        Ok(session)
    }

    async fn settle_invoice(
        &self,
        id: CheckoutSessionId,
        status: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<Settlement, CheckoutError> {
        match InvoiceStatus::from_gateway(status) {
            InvoiceStatus::Paid => self.confirm_payment(id, None, payload).await,
            InvoiceStatus::Failed => {
                let reason = format!("EazyPay invoice {}", status.trim().to_lowercase());
                self.fail_payment(id, &reason, payload).await
            }
            InvoiceStatus::Pending => Ok(Settlement::Pending),
        }
    }

    /// Ask EazyPay for the invoice behind `session` and apply the answer.
    async fn poll_invoice(&self, session: &CheckoutSession) -> Result<Settlement, CheckoutError> {
        let client = self
            .state
            .eazypay()
            .ok_or(CheckoutError::GatewayDisabled(PaymentMethod::Eazypay))?;
        let Some(invoice_id) = session.gateway_reference.as_deref() else {
            return Ok(Settlement::Pending);
        };

        let details = client.query_invoice(invoice_id).await?;
        let payload = serde_json::to_value(&details).ok();
        self.settle_invoice(session.id, &details.status, payload.as_ref())
            .await
    }

    fn can_poll(&self, session: &CheckoutSession) -> bool {
        session.status == CheckoutStatus::Initiated
            && session.payment_method == PaymentMethod::Eazypay
            && session.gateway_reference.is_some()
            && self.state.eazypay().is_some()
    }

    /// Current state of a session. An `initiated` EazyPay session is
    /// checked with the gateway first.
    ///
    /// # Errors
    ///
    /// Returns `CheckoutError::SessionNotFound` for an unknown id.
    #[instrument(skip(self))]
    pub async fn session_status(
        &self,
        id: CheckoutSessionId,
    ) -> Result<CheckoutSession, CheckoutError> {
        let session = self
            .sessions()
            .get(id)
            .await?
            .ok_or(CheckoutError::SessionNotFound)?;

        if self.can_poll(&session) {
            match self.poll_invoice(&session).await {
                Ok(Settlement::Pending) => {}
                Ok(_) => {
                    return self
                        .sessions()
                        .get(id)
                        .await?
                        .ok_or(CheckoutError::SessionNotFound);
                }
                Err(e) => warn!(session_id = %id, error = %e, "Invoice status poll failed"),
            }
        }
        Ok(session)
    }

    /// Expire `initiated` sessions whose reservation window closed and
    /// return their stock.
    ///
    /// EazyPay invoices are checked first so a payment whose webhook was
    /// lost converts instead of expiring.
    ///
    /// # Errors
    ///
    /// Returns an error only if the expired sessions cannot be listed;
    /// per-session failures are counted in the report.
    #[instrument(skip(self))]
    pub async fn release_expired(&self, batch: i64) -> Result<SweepReport, CheckoutError> {
        let sessions = self.sessions().list_expired(Utc::now(), batch).await?;
        let mut report = SweepReport {
            scanned: sessions.len(),
            ..SweepReport::default()
        };

        for session in &sessions {
            if self.can_poll(session) {
                match self.poll_invoice(session).await {
                    Ok(Settlement::Pending) => {}
                    Ok(settlement) => {
                        report.record(&settlement);
                        continue;
                    }
                    Err(e) => {
                        warn!(session_id = %session.id, error = %e, "Invoice poll failed, expiring anyway");
                    }
                }
            }

            match self.expire(session.id).await {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(session_id = %session.id, error = %e, "Failed to expire checkout session");
                }
            }
        }

        info!(
            scanned = report.scanned,
            expired = report.expired,
            converted = report.converted,
            failed = report.failed,
            needs_review = report.needs_review,
            errors = report.errors,
            "Reservation sweep finished"
        );
        Ok(report)
    }

    async fn expire(&self, id: CheckoutSessionId) -> Result<bool, CheckoutError> {
        let mut tx = self.state.pool().begin().await?;
        let Some(items) = checkout_sessions::release(
            &mut tx,
            id,
            CheckoutStatus::Expired,
            Some("reservation expired"),
            None,
        )
        .await?
        else {
            return Ok(false);
        };

        restock_lines(&mut tx, id, &items).await?;
        tx.commit().await?;
        info!(session_id = %id, outcome = "expired", "Reservation expired, stock released");
        Ok(true)
    }

    /// Poll the gateway for online sessions still waiting after
    /// `older_than`.
    ///
    /// Only EazyPay exposes a status query; BENEFIT sessions are settled by
    /// their notification or by expiry.
    ///
    /// # Errors
    ///
    /// Returns an error only if pending sessions cannot be listed.
    #[instrument(skip(self))]
    pub async fn reconcile_pending(
        &self,
        older_than: chrono::Duration,
        batch: i64,
    ) -> Result<SweepReport, CheckoutError> {
        let mut report = SweepReport::default();
        if self.state.eazypay().is_none() {
            return Ok(report);
        }

        let sessions = self
            .sessions()
            .list_pending_online(PaymentMethod::Eazypay, Utc::now() - older_than, batch)
            .await?;
        report.scanned = sessions.len();

        for session in &sessions {
            match self.poll_invoice(session).await {
                Ok(settlement) => report.record(&settlement),
                Err(e) => {
                    report.errors += 1;
                    warn!(session_id = %session.id, error = %e, "Invoice reconciliation failed");
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                converted = report.converted,
                failed = report.failed,
                errors = report.errors,
                "Pending payments reconciled"
            );
        }
        Ok(report)
    }

    /// Record that a late payment flagged for review was refunded by hand.
    ///
    /// # Errors
    ///
    /// Returns `CheckoutError::SessionNotFound` for an unknown id and
    /// `CheckoutError::NotAwaitingRefund` if the session holds no
    /// unfulfilled payment.
    #[instrument(skip(self))]
    pub async fn record_refund(
        &self,
        id: CheckoutSessionId,
    ) -> Result<CheckoutSession, CheckoutError> {
        if let Some(session) = self.sessions().mark_refunded(id).await? {
            info!(session_id = %id, total = %session.total, "Late payment marked refunded");
            return Ok(session);
        }
        match self.sessions().get(id).await? {
            Some(_) => Err(CheckoutError::NotAwaitingRefund),
            None => Err(CheckoutError::SessionNotFound),
        }
    }

    /// Delete terminal sessions older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    #[instrument(skip(self))]
    pub async fn purge_stale(&self) -> Result<u64, CheckoutError> {
        let retention = self.state.config().checkout.session_retention;
        let purged = self.sessions().purge_terminal(Utc::now() - retention).await?;
        if purged > 0 {
            info!(purged, "Purged stale checkout sessions");
        }
        Ok(purged)
    }
}

// =============================================================================
// Transaction steps
// =============================================================================

/// Take stock for every line, in ascending product order.
async fn reserve_lines(
    conn: &mut PgConnection,
    lines: &[CartItem],
) -> Result<Vec<CheckoutLine>, CheckoutError> {
    let mut reserved = Vec::with_capacity(lines.len());
    for line in lines {
        let Some(product) = products::reserve(&mut *conn, line.product_id, line.quantity).await?
        else {
            return Err(explain_miss(conn, line.product_id).await?);
        };
        reserved.push(CheckoutLine {
            product_id: product.id,
            line_total: product.price.checked_mul(line.quantity)?,
            name: product.name,
            unit_price: product.price,
            quantity: line.quantity,
        });
    }
    Ok(reserved)
}

async fn explain_miss(
    conn: &mut PgConnection,
    product_id: ProductId,
) -> Result<CheckoutError, RepositoryError> {
    Ok(match products::describe(conn, product_id).await? {
        Some((name, true)) => CheckoutError::InsufficientStock { product: name },
        _ => CheckoutError::ProductUnavailable(product_id),
    })
}

/// Take the snapshot's stock again. Returns `false`, with nothing undone,
/// on the first line that cannot be reserved; run it in a savepoint.
async fn rereserve(conn: &mut PgConnection, items: &[CheckoutLine]) -> Result<bool, RepositoryError> {
    let mut ordered: Vec<&CheckoutLine> = items.iter().collect();
    ordered.sort_by_key(|line| line.product_id);

    for line in ordered {
        if products::reserve(&mut *conn, line.product_id, line.quantity)
            .await?
            .is_none()
        {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn restock_lines(
    conn: &mut PgConnection,
    session_id: CheckoutSessionId,
    items: &[CheckoutLine],
) -> Result<(), RepositoryError> {
    for line in items {
        if !products::restock(&mut *conn, line.product_id, line.quantity).await? {
            warn!(
                session_id = %session_id,
                product_id = %line.product_id,
                quantity = line.quantity,
                "Product no longer exists, stock not returned"
            );
        }
    }
    Ok(())
}

/// Create the order for a session that just became `paid`.
async fn convert(conn: &mut PgConnection, session: &CheckoutSession) -> Result<Order, CheckoutError> {
    let order_number = Order::generate_number(Utc::now());
    let order = match orders::insert_from_session(&mut *conn, session, &order_number).await? {
        Some(order) => {
            orders::insert_items(&mut *conn, order.id, &session.items).await?;
            order
        }
        None => orders::find_by_session(&mut *conn, session.id)
            .await?
            .ok_or_else(|| {
                RepositoryError::DataCorruption(format!(
                    "order insert for session {} conflicted but no order exists",
                    session.id
                ))
            })?,
    };

    checkout_sessions::attach_order(&mut *conn, session.id, order.id).await?;
    if let Some(user_id) = session.user_id {
        carts::clear(&mut *conn, user_id).await?;
    }
    Ok(order)
}

/// Payment for a session whose stock was already given back.
async fn settle_late_payment(
    conn: &mut PgConnection,
    session: &CheckoutSession,
    gateway_reference: Option<&str>,
    payload: Option<&serde_json::Value>,
) -> Result<Settlement, CheckoutError> {
    match session.payment_status {
        PaymentStatus::Paid => {
            debug!(session_id = %session.id, "Late payment already recorded");
            return Ok(Settlement::RequiresReview);
        }
        PaymentStatus::Refunded => {
            debug!(session_id = %session.id, "Late payment already refunded");
            return Ok(Settlement::AlreadySettled(session.status));
        }
        PaymentStatus::Pending | PaymentStatus::Failed => {}
    }

    let mut savepoint = conn.begin().await?;
    if rereserve(&mut savepoint, &session.items).await? {
        savepoint.commit().await?;

        let reclaimed =
            checkout_sessions::reclaim_late_payment(&mut *conn, session.id, gateway_reference, payload)
                .await?
                .ok_or(CheckoutError::InvalidTransition {
                    from: session.status,
                    to: CheckoutStatus::Paid,
                })?;
        let order = convert(conn, &reclaimed).await?;
        warn!(
            session_id = %session.id,
            previous_status = %session.status,
            order_number = %order.order_number,
            outcome = "converted_late",
            "Late payment converted after re-reserving stock"
        );
        return Ok(Settlement::Converted(order));
    }
    savepoint.rollback().await?;

    checkout_sessions::flag_late_payment(
        &mut *conn,
        session.id,
        gateway_reference,
        payload,
        "paid after reservation was released; stock unavailable, refund required",
    )
    .await?;
    error!(
        session_id = %session.id,
        previous_status = %session.status,
        total = %session.total,
        outcome = "requires_review",
        "Late payment could not be fulfilled; manual refund required"
    );
    Ok(Settlement::RequiresReview)
}

fn warn_on_amount_mismatch(session: &CheckoutSession, reported: Option<&str>) {
    let Some(raw) = reported else { return };
    let matches = raw
        .trim()
        .parse::<rust_decimal::Decimal>()
        .ok()
        .and_then(|d| Money::new(d).ok())
        .is_some_and(|amount| amount == session.total);
    if !matches {
        warn!(
            session_id = %session.id,
            expected = %session.total,
            reported = raw,
            "Gateway reported a different amount"
        );
    }
}

// =============================================================================
// Validation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Totals {
    subtotal: Money,
    shipping_fee: Money,
    total: Money,
}

/// Merge duplicate products and check quantities. The result is sorted by
/// product id, which is also the order stock is locked in.
///
/// # Errors
///
/// Returns `CheckoutError::EmptyCart` for no lines and
/// `CheckoutError::InvalidQuantity` for a zero or oversized line.
pub fn merge_lines(items: &[CartItem], max: u32) -> Result<Vec<CartItem>, CheckoutError> {
    if items.is_empty() {
        return Err(CheckoutError::EmptyCart);
    }

    let mut merged: BTreeMap<ProductId, u32> = BTreeMap::new();
    for item in items {
        if item.quantity == 0 {
            return Err(CheckoutError::InvalidQuantity {
                product_id: item.product_id,
                quantity: 0,
                max,
            });
        }
        let quantity = merged.entry(item.product_id).or_insert(0);
        *quantity = quantity.saturating_add(item.quantity);
    }

    merged
        .into_iter()
        .map(|(product_id, quantity)| {
            if quantity > max {
                Err(CheckoutError::InvalidQuantity {
                    product_id,
                    quantity,
                    max,
                })
            } else {
                Ok(CartItem {
                    product_id,
                    quantity,
                })
            }
        })
        .collect()
}

fn compute_totals(lines: &[CheckoutLine], config: &CheckoutConfig) -> Result<Totals, MoneyError> {
    let subtotal = Money::sum(lines.iter().map(|line| line.line_total))?;
    let shipping_fee = if subtotal >= config.free_shipping_threshold {
        Money::ZERO
    } else {
        config.shipping_fee
    };
    Ok(Totals {
        subtotal,
        shipping_fee,
        total: subtotal.checked_add(shipping_fee)?,
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn resolve_customer(
    request: &CheckoutRequest,
    user: Option<&CurrentUser>,
) -> Result<CustomerDetails, CheckoutError> {
    let name = non_empty(request.customer_name.as_deref())
        .or_else(|| user.map(|u| u.name.trim()).filter(|n| !n.is_empty()))
        .ok_or_else(|| CheckoutError::InvalidCustomer("name is required".to_owned()))?;
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(CheckoutError::InvalidCustomer(format!(
            "name must be at most {MAX_NAME_LENGTH} characters"
        )));
    }

    let email = match non_empty(request.customer_email.as_deref()) {
        Some(raw) => {
            Email::parse(raw).map_err(|e| CheckoutError::InvalidCustomer(e.to_string()))?
        }
        None => user
            .map(|u| u.email.clone())
            .ok_or_else(|| CheckoutError::InvalidCustomer("email is required".to_owned()))?,
    };

    Ok(CustomerDetails {
        name: name.to_owned(),
        email,
        phone: validate_phone(&request.customer_phone)?,
    })
}

fn validate_phone(raw: &str) -> Result<String, CheckoutError> {
    let phone = raw.trim();
    if phone.is_empty() {
        return Err(CheckoutError::InvalidCustomer("phone is required".to_owned()));
    }

    let allowed = phone
        .chars()
        .enumerate()
        .all(|(i, c)| c.is_ascii_digit() || c == ' ' || c == '-' || (c == '+' && i == 0));
    let digits = phone.chars().filter(char::is_ascii_digit).count();
    if !allowed || !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits) {
        return Err(CheckoutError::InvalidCustomer(
            "phone must be 8 to 15 digits".to_owned(),
        ));
    }
    Ok(phone.to_owned())
}

fn validate_address(address: &ShippingAddress) -> Result<ShippingAddress, CheckoutError> {
    let required = |value: &str, field: &str| -> Result<String, CheckoutError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(CheckoutError::InvalidCustomer(format!("{field} is required")));
        }
        if value.chars().count() > MAX_ADDRESS_FIELD_LENGTH {
            return Err(CheckoutError::InvalidCustomer(format!("{field} is too long")));
        }
        Ok(value.to_owned())
    };

    let country = address.country.trim().to_ascii_uppercase();
    if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(CheckoutError::InvalidCustomer(
            "country must be a two-letter code".to_owned(),
        ));
    }

    Ok(ShippingAddress {
        line1: required(&address.line1, "address line 1")?,
        line2: non_empty(address.line2.as_deref()).map(str::to_owned),
        city: required(&address.city, "city")?,
        postal_code: non_empty(address.postal_code.as_deref()).map(str::to_owned),
        country,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use souq_core::{UserId, UserRole};
    use uuid::Uuid;

    fn product(n: u128) -> ProductId {
        ProductId::new(Uuid::from_u128(n))
    }

    fn item(n: u128, quantity: u32) -> CartItem {
        CartItem {
            product_id: product(n),
            quantity,
        }
    }

    fn line(fils: u32, quantity: u32) -> CheckoutLine {
        let unit_price = Money::from_fils(fils);
        CheckoutLine {
            product_id: product(1),
            name: "Saffron".to_owned(),
            unit_price,
            quantity,
            line_total: unit_price.checked_mul(quantity).unwrap(),
        }
    }

    fn address() -> ShippingAddress {
        ShippingAddress {
            line1: "  Flat 4, Bldg 210  ".to_owned(),
            line2: Some("   ".to_owned()),
            city: "Muharraq".to_owned(),
            postal_code: None,
            country: "bh".to_owned(),
        }
    }

    fn request(name: Option<&str>, email: Option<&str>, phone: &str) -> CheckoutRequest {
        CheckoutRequest {
            items: vec![item(1, 1)],
            customer_name: name.map(str::to_owned),
            customer_email: email.map(str::to_owned),
            customer_phone: phone.to_owned(),
            shipping_address: address(),
            payment_method: PaymentMethod::Cod,
        }
    }

    fn signed_in() -> CurrentUser {
        CurrentUser {
            id: UserId::new(Uuid::from_u128(7)),
            email: Email::parse("layla@example.bh").unwrap(),
            name: "Layla".to_owned(),
            role: UserRole::Customer,
        }
    }

    #[test]
    fn test_merge_lines_sorts_and_merges_duplicates() {
        let merged = merge_lines(&[item(3, 1), item(1, 2), item(3, 4)], 99).unwrap();
        assert_eq!(merged, vec![item(1, 2), item(3, 5)]);
    }

    #[test]
    fn test_merge_lines_rejects_empty_and_zero() {
        assert!(matches!(merge_lines(&[], 99), Err(CheckoutError::EmptyCart)));
        assert!(matches!(
            merge_lines(&[item(1, 0)], 99),
            Err(CheckoutError::InvalidQuantity { quantity: 0, .. })
        ));
    }

    #[test]
    fn test_merge_lines_checks_limit_after_merging() {
        assert!(merge_lines(&[item(1, 5), item(2, 5)], 5).is_ok());
        let err = merge_lines(&[item(1, 3), item(1, 3)], 5).unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::InvalidQuantity {
                quantity: 6,
                max: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_totals_charge_shipping_below_threshold() {
        let config = CheckoutConfig::default();
        let totals = compute_totals(&[line(2_500, 3)], &config).unwrap();
        assert_eq!(totals.subtotal, Money::from_fils(7_500));
        assert_eq!(totals.shipping_fee, Money::from_fils(1_000));
        assert_eq!(totals.total, Money::from_fils(8_500));
    }

    #[test]
    fn test_totals_free_shipping_at_threshold() {
        let config = CheckoutConfig::default();
        let totals = compute_totals(&[line(10_000, 2)], &config).unwrap();
        assert_eq!(totals.shipping_fee, Money::ZERO);
        assert_eq!(totals.total, Money::from_fils(20_000));
    }

    #[test]
    fn test_guest_must_give_name_and_email() {
        assert!(matches!(
            resolve_customer(&request(None, Some("a@b.bh"), "+973 3600 1234"), None),
            Err(CheckoutError::InvalidCustomer(_))
        ));
        assert!(matches!(
            resolve_customer(&request(Some("Ali"), None, "+973 3600 1234"), None),
            Err(CheckoutError::InvalidCustomer(_))
        ));

        let customer = resolve_customer(
            &request(Some(" Ali "), Some("Ali@Example.BH"), "+973 3600 1234"),
            None,
        )
        .unwrap();
        assert_eq!(customer.name, "Ali");
        assert_eq!(customer.email.as_str(), "ali@example.bh");
    }

    #[test]
    fn test_signed_in_customer_defaults_to_account() {
        let user = signed_in();
        let customer = resolve_customer(&request(None, None, "36001234"), Some(&user)).unwrap();
        assert_eq!(customer.name, "Layla");
        assert_eq!(customer.email, user.email);

        let overridden =
            resolve_customer(&request(Some("Gift"), None, "36001234"), Some(&user)).unwrap();
        assert_eq!(overridden.name, "Gift");
    }

    #[test]
    fn test_phone_validation() {
        assert_eq!(validate_phone(" +973 3600-1234 ").unwrap(), "+973 3600-1234");
        assert!(validate_phone("").is_err());
        assert!(validate_phone("1234567").is_err());
        assert!(validate_phone("3600 12x4").is_err());
        assert!(validate_phone("36+001234").is_err());
    }

    #[test]
    fn test_address_is_normalized() {
        let normalized = validate_address(&address()).unwrap();
        assert_eq!(normalized.line1, "Flat 4, Bldg 210");
        assert_eq!(normalized.line2, None);
        assert_eq!(normalized.country, "BH");

        let mut missing_city = address();
        missing_city.city = " ".to_owned();
        assert!(validate_address(&missing_city).is_err());

        let mut bad_country = address();
        bad_country.country = "Bahrain".to_owned();
        assert!(validate_address(&bad_country).is_err());
    }

    #[test]
    fn test_request_deserializes_camel_case() {
        let request: CheckoutRequest = serde_json::from_str(
            r#"{
                "items": [{"productId": "00000000-0000-0000-0000-000000000001", "quantity": 2}],
                "customerPhone": "36001234",
                "shippingAddress": {"line1": "Road 1", "city": "Manama"},
                "paymentMethod": "benefit"
            }"#,
        )
        .unwrap();
        assert_eq!(request.items, vec![item(1, 2)]);
        assert_eq!(request.payment_method, PaymentMethod::Benefit);
        assert_eq!(request.customer_name, None);
    }

    #[test]
    fn test_settlement_paid_flags() {
        assert!(Settlement::RequiresReview.is_paid());
        assert!(Settlement::AlreadySettled(CheckoutStatus::Paid).is_paid());
        assert!(!Settlement::AlreadySettled(CheckoutStatus::Expired).is_paid());
        assert!(!Settlement::Failed.is_paid());
        assert!(!Settlement::Pending.is_paid());
        assert_eq!(Settlement::Pending.as_str(), "pending");
    }

    #[test]
    fn test_sweep_report_counts_outcomes() {
        let mut report = SweepReport::default();
        report.record(&Settlement::Failed);
        report.record(&Settlement::RequiresReview);
        report.record(&Settlement::Pending);
        report.record(&Settlement::AlreadySettled(CheckoutStatus::Failed));
        assert_eq!(report.failed, 1);
        assert_eq!(report.needs_review, 1);
        assert_eq!(report.converted, 0);
    }
}
