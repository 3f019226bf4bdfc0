//! End-to-end checkout pipeline against `PostgreSQL`.
//!
//! These tests require a scratch database in `DATABASE_URL`; migrations are
//! applied on connect. Gateways point at a closed port, so online payments
//! are confirmed by feeding the callbacks the gateway would send.
//!
//! Run with: `cargo test -p souq-integration-tests -- --ignored`

#![allow(clippy::unwrap_used)]

use axum::body::Body;
use axum::http::StatusCode;
use chrono::{Duration, Utc};

use souq_core::{CheckoutStatus, Money, OrderStatus, PaymentMethod, PaymentStatus};
use souq_integration_tests::{
    CRON_SECRET, EAZYPAY_SECRET, address, app, db_state, open_session, request, seed_product,
    send, stock_of,
};
use souq_storefront::db::{CheckoutSessionRepository, OrderRepository};
use souq_storefront::models::CartItem;
use souq_storefront::payments::eazypay;
use souq_storefront::services::checkout::{
    CheckoutError, CheckoutRequest, CheckoutService, DEFAULT_SWEEP_BATCH, Settlement,
};
use souq_storefront::services::orders::{OrderError, OrderService};

fn checkout_request(items: Vec<CartItem>, method: PaymentMethod) -> CheckoutRequest {
    CheckoutRequest {
        items,
        customer_name: Some("Fatima Ali".to_owned()),
        customer_email: Some("fatima@example.bh".to_owned()),
        customer_phone: "+973 3600 1234".to_owned(),
        shipping_address: address(),
        payment_method: method,
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_cod_checkout_converts_and_takes_stock() {
    let state = db_state().await;
    let product = seed_product(state.pool(), 2_500, 5).await;

    let started = CheckoutService::new(&state)
        .start_checkout(
            checkout_request(
                vec![CartItem {
                    product_id: product.id,
                    quantity: 2,
                }],
                PaymentMethod::Cod,
            ),
            None,
        )
        .await
        .unwrap();

    assert_eq!(started.status, CheckoutStatus::Paid);
    assert!(started.payment_url.is_none());
    let order = started.order.unwrap();
    assert_eq!(order.total, Money::from_fils(6_000));
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    assert_eq!(stock_of(state.pool(), &product).await, 3);

    let items = OrderRepository::new(state.pool())
        .items(order.id)
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items.first().unwrap().quantity, 2);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_insufficient_stock_reserves_nothing() {
    let state = db_state().await;
    let plenty = seed_product(state.pool(), 1_000, 5).await;
    let scarce = seed_product(state.pool(), 1_000, 1).await;

    let err = CheckoutService::new(&state)
        .start_checkout(
            checkout_request(
                vec![
                    CartItem {
                        product_id: plenty.id,
                        quantity: 2,
                    },
                    CartItem {
                        product_id: scarce.id,
                        quantity: 2,
                    },
                ],
                PaymentMethod::Cod,
            ),
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CheckoutError::InsufficientStock { .. }));
    assert_eq!(stock_of(state.pool(), &plenty).await, 5);
    assert_eq!(stock_of(state.pool(), &scarce).await, 1);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_gateway_failure_releases_stock() {
    let state = db_state().await;
    let product = seed_product(state.pool(), 4_000, 4).await;

    let err = CheckoutService::new(&state)
        .start_checkout(
            checkout_request(
                vec![CartItem {
                    product_id: product.id,
                    quantity: 3,
                }],
                PaymentMethod::Benefit,
            ),
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CheckoutError::Gateway(_)));
    assert_eq!(stock_of(state.pool(), &product).await, 4);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_concurrent_checkouts_never_oversell() {
    let state = db_state().await;
    let product = seed_product(state.pool(), 1_500, 3).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let state = state.clone();
        let product_id = product.id;
        handles.push(tokio::spawn(async move {
            CheckoutService::new(&state)
                .start_checkout(
                    checkout_request(
                        vec![CartItem {
                            product_id,
                            quantity: 1,
                        }],
                        PaymentMethod::Cod,
                    ),
                    None,
                )
                .await
                .is_ok()
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap() {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 3);
    assert_eq!(stock_of(state.pool(), &product).await, 0);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_expired_session_is_released_once() {
    let state = db_state().await;
    let product = seed_product(state.pool(), 3_000, 5).await;
    let session = open_session(
        state.pool(),
        &product,
        2,
        PaymentMethod::Benefit,
        Utc::now() - Duration::minutes(1),
    )
    .await;
    assert_eq!(stock_of(state.pool(), &product).await, 3);

    let service = CheckoutService::new(&state);
    let report = service.release_expired(DEFAULT_SWEEP_BATCH).await.unwrap();
    assert!(report.expired >= 1);

    let expired = CheckoutSessionRepository::new(state.pool())
        .get(session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(expired.status, CheckoutStatus::Expired);
    assert!(expired.inventory_released_at.is_some());
    assert_eq!(stock_of(state.pool(), &product).await, 5);

    // A late failure notification must not give the stock back twice
    let settlement = service
        .fail_payment(session.id, "NOT CAPTURED", None)
        .await
        .unwrap();
    assert!(matches!(
        settlement,
        Settlement::AlreadySettled(CheckoutStatus::Expired)
    ));
    service.release_expired(DEFAULT_SWEEP_BATCH).await.unwrap();
    assert_eq!(stock_of(state.pool(), &product).await, 5);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_benefit_notification_converts_once() {
    let state = db_state().await;
    let product = seed_product(state.pool(), 7_250, 5).await;
    let session = open_session(
        state.pool(),
        &product,
        1,
        PaymentMethod::Benefit,
        Utc::now() + Duration::minutes(30),
    )
    .await;

    let plaintext = format!(
        "paymentid=100202412345&result=CAPTURED&auth=A1B2C3&ref=4412&tranid=2024001&trackid={id}&udf1={id}&amt={amt}",
        id = session.id,
        amt = session.total.to_gateway_string(),
    );
    let trandata = state.benefit().unwrap().encrypt(&plaintext).unwrap();

    for _ in 0..2 {
        let response = send(
            app(state.clone()),
            request("POST", "/api/payments/benefit/notify")
                .header("content-type", "application/x-www-form-urlencoded")
                .body(Body::from(format!("trandata={trandata}")))
                .unwrap(),
        )
        .await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            response.body,
            format!(
                "REDIRECT=https://shop.test/checkout/result?session={}&status=paid",
                session.id
            )
        );
    }

    let paid = CheckoutSessionRepository::new(state.pool())
        .get(session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paid.status, CheckoutStatus::Paid);
    assert_eq!(paid.payment_status, PaymentStatus::Paid);

    let order = OrderRepository::new(state.pool())
        .get_by_session(session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paid.order_id, Some(order.id));
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(stock_of(state.pool(), &product).await, 4);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_benefit_decline_releases_stock() {
    let state = db_state().await;
    let product = seed_product(state.pool(), 2_000, 2).await;
    let session = open_session(
        state.pool(),
        &product,
        2,
        PaymentMethod::Benefit,
        Utc::now() + Duration::minutes(30),
    )
    .await;

    let plaintext = format!("result=NOT%20CAPTURED&trackid={id}&udf1={id}", id = session.id);
    let trandata = state.benefit().unwrap().encrypt(&plaintext).unwrap();

    let response = send(
        app(state.clone()),
        request("POST", "/api/payments/benefit/error")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(format!("trandata={trandata}")))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::SEE_OTHER);

    let failed = CheckoutSessionRepository::new(state.pool())
        .get(session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, CheckoutStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("NOT CAPTURED"));
    assert_eq!(stock_of(state.pool(), &product).await, 2);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_late_payment_converts_when_stock_allows() {
    let state = db_state().await;
    let product = seed_product(state.pool(), 5_000, 3).await;
    let session = open_session(
        state.pool(),
        &product,
        1,
        PaymentMethod::Benefit,
        Utc::now() - Duration::minutes(1),
    )
    .await;

    let service = CheckoutService::new(&state);
    service.release_expired(DEFAULT_SWEEP_BATCH).await.unwrap();
    assert_eq!(stock_of(state.pool(), &product).await, 3);

    let settlement = service.confirm_payment(session.id, None, None).await.unwrap();
    assert!(matches!(settlement, Settlement::Converted(_)));
    assert_eq!(stock_of(state.pool(), &product).await, 2);

    let converted = CheckoutSessionRepository::new(state.pool())
        .get(session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(converted.status, CheckoutStatus::Paid);
    assert!(converted.order_id.is_some());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_late_payment_without_stock_requires_review() {
    let state = db_state().await;
    let product = seed_product(state.pool(), 5_000, 1).await;
    let late = open_session(
        state.pool(),
        &product,
        1,
        PaymentMethod::Benefit,
        Utc::now() - Duration::minutes(1),
    )
    .await;

    let service = CheckoutService::new(&state);
    service.release_expired(DEFAULT_SWEEP_BATCH).await.unwrap();

    // Someone else buys the last unit before the late payment lands
    open_session(
        state.pool(),
        &product,
        1,
        PaymentMethod::Benefit,
        Utc::now() + Duration::minutes(30),
    )
    .await;
    assert_eq!(stock_of(state.pool(), &product).await, 0);

    let settlement = service.confirm_payment(late.id, None, None).await.unwrap();
    assert!(matches!(settlement, Settlement::RequiresReview));

    let flagged = CheckoutSessionRepository::new(state.pool())
        .get(late.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flagged.status, CheckoutStatus::Expired);
    assert_eq!(flagged.payment_status, PaymentStatus::Paid);
    assert!(flagged.order_id.is_none());
    assert_eq!(stock_of(state.pool(), &product).await, 0);

    // Repeating the notification changes nothing
    let again = service.confirm_payment(late.id, None, None).await.unwrap();
    assert!(matches!(again, Settlement::RequiresReview));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_signed_eazypay_webhook_converts() {
    let state = db_state().await;
    let product = seed_product(state.pool(), 9_900, 2).await;
    let session = open_session(
        state.pool(),
        &product,
        1,
        PaymentMethod::Eazypay,
        Utc::now() + Duration::minutes(30),
    )
    .await;
    let invoice_id = format!("inv-{}", uuid::Uuid::new_v4());
    CheckoutSessionRepository::new(state.pool())
        .set_gateway_reference(session.id, &invoice_id)
        .await
        .unwrap();

    let body = format!(r#"{{"globalTransactionsId":"{invoice_id}","status":"PAID","amount":"9.900"}}"#);
    let timestamp = Utc::now().timestamp_millis().to_string();
    let signature = eazypay::sign(EAZYPAY_SECRET.as_bytes(), &timestamp, &[&body]).unwrap();

    let response = send(
        app(state.clone()),
        request("POST", "/api/payments/eazypay/webhook")
            .header("content-type", "application/json")
            .header("Timestamp", &timestamp)
            .header("Secret-Hash", &signature)
            .body(Body::from(body))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json()["settlement"], "converted");
    assert!(
        OrderRepository::new(state.pool())
            .get_by_session(session.id)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_webhook_before_invoice_id_is_stored_converts() {
    let state = db_state().await;
    let product = seed_product(state.pool(), 3_300, 2).await;
    let session = open_session(
        state.pool(),
        &product,
        1,
        PaymentMethod::Eazypay,
        Utc::now() + Duration::minutes(30),
    )
    .await;
    assert!(session.gateway_reference.is_none());

    let invoice_id = format!("inv-{}", uuid::Uuid::new_v4());
    let body = format!(
        r#"{{"globalTransactionsId":"{invoice_id}","status":"PAID","merchantReference":"{}"}}"#,
        session.id
    );
    let timestamp = Utc::now().timestamp_millis().to_string();
    let signature = eazypay::sign(EAZYPAY_SECRET.as_bytes(), &timestamp, &[&body]).unwrap();

    let response = send(
        app(state.clone()),
        request("POST", "/api/payments/eazypay/webhook")
            .header("content-type", "application/json")
            .header("Timestamp", &timestamp)
            .header("Secret-Hash", &signature)
            .body(Body::from(body))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json()["settlement"], "converted");

    let sessions = CheckoutSessionRepository::new(state.pool());
    let paid = sessions.get(session.id).await.unwrap().unwrap();
    assert_eq!(paid.status, CheckoutStatus::Paid);
    assert_eq!(paid.gateway_reference.as_deref(), Some(invoice_id.as_str()));

    // The checkout hand-off storing the same invoice id afterwards still succeeds
    sessions
        .set_gateway_reference(session.id, &invoice_id)
        .await
        .unwrap();
    assert_eq!(stock_of(state.pool(), &product).await, 1);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_webhook_for_unknown_session_is_not_found() {
    let state = db_state().await;

    let body = format!(
        r#"{{"globalTransactionsId":"inv-{}","status":"PAID","merchantReference":"{}"}}"#,
        uuid::Uuid::new_v4(),
        uuid::Uuid::new_v4()
    );
    let timestamp = Utc::now().timestamp_millis().to_string();
    let signature = eazypay::sign(EAZYPAY_SECRET.as_bytes(), &timestamp, &[&body]).unwrap();

    let response = send(
        app(state),
        request("POST", "/api/payments/eazypay/webhook")
            .header("content-type", "application/json")
            .header("Timestamp", &timestamp)
            .header("Secret-Hash", &signature)
            .body(Body::from(body))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_delivered_cod_order_is_paid() {
    let state = db_state().await;
    let product = seed_product(state.pool(), 1_250, 3).await;
    let order = CheckoutService::new(&state)
        .start_checkout(
            checkout_request(
                vec![CartItem {
                    product_id: product.id,
                    quantity: 1,
                }],
                PaymentMethod::Cod,
            ),
            None,
        )
        .await
        .unwrap()
        .order
        .unwrap();

    let orders = OrderService::new(state.pool());
    for status in [OrderStatus::Processing, OrderStatus::Shipped] {
        let moved = orders.update_status(order.id, status).await.unwrap();
        assert_eq!(moved.payment_status, PaymentStatus::Pending, "{status}");
    }

    let delivered = orders
        .update_status(order.id, OrderStatus::Delivered)
        .await
        .unwrap();
    assert_eq!(delivered.status, OrderStatus::Delivered);
    assert_eq!(delivered.payment_status, PaymentStatus::Paid);

    let stored = OrderRepository::new(state.pool())
        .get(order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.payment_status, PaymentStatus::Paid);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_cancelled_order_restocks_once() {
    let state = db_state().await;
    let product = seed_product(state.pool(), 2_500, 5).await;
    let order = CheckoutService::new(&state)
        .start_checkout(
            checkout_request(
                vec![CartItem {
                    product_id: product.id,
                    quantity: 2,
                }],
                PaymentMethod::Cod,
            ),
            None,
        )
        .await
        .unwrap()
        .order
        .unwrap();
    assert_eq!(stock_of(state.pool(), &product).await, 3);

    let orders = OrderService::new(state.pool());
    let cancelled = orders
        .update_status(order.id, OrderStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(stock_of(state.pool(), &product).await, 5);

    let err = orders
        .update_status(order.id, OrderStatus::Cancelled)
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::InvalidTransition { .. }));
    assert_eq!(stock_of(state.pool(), &product).await, 5);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_cron_sweep_endpoint() {
    let state = db_state().await;

    let response = send(
        app(state),
        request("POST", "/api/cron/expire-reservations")
            .header("authorization", format!("Bearer {CRON_SECRET}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    let body = response.json();
    assert!(body["released"]["scanned"].is_u64());
    assert!(body["reconciled"]["errors"].is_u64());
}
