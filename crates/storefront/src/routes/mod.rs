//! HTTP route handlers for the storefront JSON API.
//!
//! # Route Structure
//!
//! ```text
//! GET  /health                              - Liveness
//! GET  /health/ready                        - Readiness (database reachable)
//!
//! # Catalog
//! GET  /api/products                        - Product listing
//! GET  /api/products/{id}                   - Product detail
//! GET  /api/categories                      - Category listing
//!
//! # Cart (requires auth)
//! GET    /api/cart                          - Saved cart
//! PUT    /api/cart                          - Replace saved cart
//! DELETE /api/cart                          - Empty saved cart
//!
//! # Checkout
//! POST /api/checkout                        - Reserve stock and start payment
//! GET  /api/checkout/{id}                   - Session status
//! POST /api/checkout/{id}/cancel            - Cancel and release stock
//!
//! # Payment gateways
//! POST     /api/payments/benefit/notify     - BENEFIT server notification
//! GET|POST /api/payments/benefit/error      - BENEFIT error redirect
//! POST     /api/payments/eazypay/webhook    - EazyPay signed webhook
//! GET      /api/payments/eazypay/return     - EazyPay customer return
//!
//! # Auth
//! POST /api/auth/register                   - Create account
//! POST /api/auth/login                      - Sign in
//! POST /api/auth/logout                     - Sign out
//! GET  /api/auth/me                         - Current user
//!
//! # Account (requires auth)
//! GET  /api/account/orders                  - Order history
//! GET  /api/account/orders/{id}             - Order detail
//!
//! # Cron (Bearer CRON_SECRET)
//! POST /api/cron/expire-reservations        - Reconcile and release stock
//! POST /api/cron/cleanup-sessions           - Purge old sessions
//!
//! # Admin (requires admin role)
//! GET   /api/admin/orders                   - Order listing
//! GET   /api/admin/orders/{id}              - Order detail
//! PATCH /api/admin/orders/{id}/status       - Fulfilment status
//! GET   /api/admin/checkout-sessions        - Session listing
//! POST  /api/admin/checkout-sessions/{id}/refund - Close a refunded late payment
//! GET   /api/admin/products                 - Product listing (incl. inactive)
//! POST  /api/admin/products                 - Create product
//! PUT   /api/admin/products/{id}            - Update product
//! POST  /api/admin/products/{id}/stock      - Adjust stock
//! POST  /api/admin/categories               - Create category
//! ```

pub mod account;
pub mod admin;
pub mod auth;
pub mod cart;
pub mod checkout;
pub mod cron;
pub mod health;
pub mod payments;
pub mod products;

use axum::{
    Router,
    routing::{get, patch, post, put},
};

use crate::middleware::{auth_rate_limiter, checkout_rate_limiter};
use crate::state::AppState;

/// Create the health check router.
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(health::health))
        .route("/ready", get(health::ready))
}

/// Create the auth routes router.
pub fn auth_routes() -> Router<AppState> {
    let limited = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .layer(auth_rate_limiter());

    Router::new()
        .route("/logout", post(auth::logout))
        .route("/me", get(auth::me))
        .merge(limited)
}

/// Create the catalog routes router.
pub fn product_routes() -> Router<AppState> {
    Router::new()
        .route("/products", get(products::index))
        .route("/products/{id}", get(products::show))
        .route("/categories", get(products::categories))
}

/// Create the cart routes router.
pub fn cart_routes() -> Router<AppState> {
    Router::new().route("/", get(cart::show).put(cart::replace).delete(cart::clear))
}

/// Create the checkout routes router.
pub fn checkout_routes() -> Router<AppState> {
    let limited = Router::new()
        .route("/", post(checkout::start))
        .route("/{id}/cancel", post(checkout::cancel))
        .layer(checkout_rate_limiter());

    Router::new()
        .route("/{id}", get(checkout::status))
        .merge(limited)
}

/// Create the payment gateway callback router.
pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/benefit/notify", post(payments::benefit_notify))
        .route(
            "/benefit/error",
            get(payments::benefit_error).post(payments::benefit_error_form),
        )
        .route("/eazypay/webhook", post(payments::eazypay_webhook))
        .route("/eazypay/return", get(payments::eazypay_return))
}

/// Create the account routes router.
pub fn account_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", get(account::orders))
        .route("/orders/{id}", get(account::order))
}

/// Create the scheduled job routes router.
pub fn cron_routes() -> Router<AppState> {
    Router::new()
        .route("/expire-reservations", post(cron::expire_reservations))
        .route("/cleanup-sessions", post(cron::cleanup_sessions))
}

/// Create the admin routes router.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", get(admin::orders))
        .route("/orders/{id}", get(admin::order))
        .route("/orders/{id}/status", patch(admin::update_order_status))
        .route("/checkout-sessions", get(admin::checkout_sessions))
        .route("/checkout-sessions/{id}/refund", post(admin::record_refund))
        .route("/products", get(admin::products).post(admin::create_product))
        .route("/products/{id}", put(admin::update_product))
        .route("/products/{id}/stock", post(admin::adjust_stock))
        .route("/categories", post(admin::create_category))
}

/// Create all routes for the storefront.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/health", health_routes())
        // Catalog
        .nest("/api", product_routes())
        .nest("/api/cart", cart_routes())
        .nest("/api/checkout", checkout_routes())
        // Gateway callbacks carry no session cookie
        .nest("/api/payments", payment_routes())
        .nest("/api/auth", auth_routes())
        .nest("/api/account", account_routes())
        .nest("/api/cron", cron_routes())
        .nest("/api/admin", admin_routes())
}
