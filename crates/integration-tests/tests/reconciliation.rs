//! Sweeper passes against `PostgreSQL` and a stand-in EazyPay gateway.
//!
//! Kept apart from `checkout_flow` so its expiry sweeps, which poll the
//! dead gateway, never race the invoices answered here.
//!
//! Run with: `cargo test -p souq-integration-tests --test reconciliation -- --ignored`

#![allow(clippy::unwrap_used)]

use chrono::{Duration, Utc};

use souq_core::{CheckoutStatus, PaymentMethod, PaymentStatus};
use souq_integration_tests::{
    age_session_created, age_session_updated, db_state_with_eazypay, open_session, seed_product,
    serve_mock_eazypay, stock_of,
};
use souq_storefront::db::{CheckoutSessionRepository, OrderRepository};
use souq_storefront::services::checkout::{
    CheckoutError, CheckoutService, DEFAULT_SWEEP_BATCH, RECONCILE_AFTER_MINUTES, Settlement,
};

fn invoice(status: &str) -> String {
    format!("{status}-{}", uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_sweeper_converts_paid_invoice_instead_of_expiring() {
    let state = db_state_with_eazypay(&serve_mock_eazypay().await).await;
    let sessions = CheckoutSessionRepository::new(state.pool());
    let product = seed_product(state.pool(), 8_000, 4).await;

    let paid = open_session(
        state.pool(),
        &product,
        1,
        PaymentMethod::Eazypay,
        Utc::now() - Duration::minutes(1),
    )
    .await;
    sessions
        .set_gateway_reference(paid.id, &invoice("paid"))
        .await
        .unwrap();

    let unpaid = open_session(
        state.pool(),
        &product,
        2,
        PaymentMethod::Eazypay,
        Utc::now() - Duration::minutes(1),
    )
    .await;
    sessions
        .set_gateway_reference(unpaid.id, &invoice("pending"))
        .await
        .unwrap();
    assert_eq!(stock_of(state.pool(), &product).await, 1);

    let report = CheckoutService::new(&state)
        .release_expired(DEFAULT_SWEEP_BATCH)
        .await
        .unwrap();
    assert!(report.converted >= 1);
    assert!(report.expired >= 1);

    let converted = sessions.get(paid.id).await.unwrap().unwrap();
    assert_eq!(converted.status, CheckoutStatus::Paid);
    assert_eq!(converted.payment_status, PaymentStatus::Paid);
    assert!(
        OrderRepository::new(state.pool())
            .get_by_session(paid.id)
            .await
            .unwrap()
            .is_some()
    );

    let expired = sessions.get(unpaid.id).await.unwrap().unwrap();
    assert_eq!(expired.status, CheckoutStatus::Expired);

    // Only the unpaid reservation came back
    assert_eq!(stock_of(state.pool(), &product).await, 3);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_reconcile_settles_invoices_left_waiting() {
    let state = db_state_with_eazypay(&serve_mock_eazypay().await).await;
    let sessions = CheckoutSessionRepository::new(state.pool());
    let product = seed_product(state.pool(), 4_500, 6).await;
    let open = |quantity| {
        open_session(
            state.pool(),
            &product,
            quantity,
            PaymentMethod::Eazypay,
            Utc::now() + Duration::minutes(30),
        )
    };

    let paid = open(1).await;
    sessions
        .set_gateway_reference(paid.id, &invoice("paid"))
        .await
        .unwrap();
    age_session_created(state.pool(), paid.id, 10).await;

    let declined = open(2).await;
    sessions
        .set_gateway_reference(declined.id, &invoice("failed"))
        .await
        .unwrap();
    age_session_created(state.pool(), declined.id, 10).await;

    // Too recent to poll, even though its invoice is paid
    let fresh = open(1).await;
    sessions
        .set_gateway_reference(fresh.id, &invoice("paid"))
        .await
        .unwrap();
    assert_eq!(stock_of(state.pool(), &product).await, 2);

    let report = CheckoutService::new(&state)
        .reconcile_pending(Duration::minutes(RECONCILE_AFTER_MINUTES), DEFAULT_SWEEP_BATCH)
        .await
        .unwrap();
    assert!(report.converted >= 1);
    assert!(report.failed >= 1);

    assert_eq!(
        sessions.get(paid.id).await.unwrap().unwrap().status,
        CheckoutStatus::Paid
    );
    let failed = sessions.get(declined.id).await.unwrap().unwrap();
    assert_eq!(failed.status, CheckoutStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("EazyPay invoice failed"));
    assert_eq!(
        sessions.get(fresh.id).await.unwrap().unwrap().status,
        CheckoutStatus::Initiated
    );
    assert_eq!(stock_of(state.pool(), &product).await, 4);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_purge_keeps_orders_and_unrefunded_payments() {
    let state = db_state_with_eazypay(&serve_mock_eazypay().await).await;
    let service = CheckoutService::new(&state);
    let sessions = CheckoutSessionRepository::new(state.pool());
    let product = seed_product(state.pool(), 6_000, 1).await;
    let open = || {
        open_session(
            state.pool(),
            &product,
            1,
            PaymentMethod::Benefit,
            Utc::now() + Duration::minutes(30),
        )
    };

    // Abandoned: stock returned, nothing paid
    let abandoned = open().await;
    service
        .fail_payment(abandoned.id, "CANCELED", None)
        .await
        .unwrap();

    // Paid after its stock went to someone else
    let late = open().await;
    service.fail_payment(late.id, "timeout", None).await.unwrap();
    let converted = open().await;
    assert!(matches!(
        service.confirm_payment(late.id, None, None).await.unwrap(),
        Settlement::RequiresReview
    ));

    // Converted into an order
    assert!(matches!(
        service
            .confirm_payment(converted.id, None, None)
            .await
            .unwrap(),
        Settlement::Converted(_)
    ));

    for id in [abandoned.id, late.id, converted.id] {
        age_session_updated(state.pool(), id, 90).await;
    }
    assert!(service.purge_stale().await.unwrap() >= 1);

    assert!(sessions.get(abandoned.id).await.unwrap().is_none());
    let kept = sessions.get(late.id).await.unwrap().unwrap();
    assert_eq!(kept.payment_status, PaymentStatus::Paid);
    assert!(sessions.get(converted.id).await.unwrap().is_some());

    // Once the refund is recorded the session ages out like any other
    let refunded = service.record_refund(late.id).await.unwrap();
    assert_eq!(refunded.payment_status, PaymentStatus::Refunded);
    assert!(matches!(
        service.record_refund(late.id).await.unwrap_err(),
        CheckoutError::NotAwaitingRefund
    ));
    assert!(matches!(
        service.confirm_payment(late.id, None, None).await.unwrap(),
        Settlement::AlreadySettled(CheckoutStatus::Failed)
    ));

    age_session_updated(state.pool(), late.id, 90).await;
    service.purge_stale().await.unwrap();
    assert!(sessions.get(late.id).await.unwrap().is_none());
}
