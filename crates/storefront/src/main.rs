//! Souq storefront server.
//!
//! Serves the JSON API on port 3000 by default.
//!
//! # Architecture
//!
//! - Axum web framework, JSON in camelCase
//! - `PostgreSQL` for catalog, carts, checkout sessions, orders and sessions
//! - BENEFIT and EazyPay hosted payment pages, confirmed by server callbacks
//! - Reservation sweeper run by an external cron (`/api/cron/*`) and,
//!   optionally, in-process
//!
//! Migrations are NOT run on startup; use `souq-cli migrate`.

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::net::SocketAddr;
use std::time::Duration;

use sentry::integrations::tracing as sentry_tracing;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use souq_storefront::config::StorefrontConfig;
use souq_storefront::db;
use souq_storefront::services::checkout::{
    CheckoutService, DEFAULT_SWEEP_BATCH, RECONCILE_AFTER_MINUTES,
};
use souq_storefront::state::AppState;

/// Initialize Sentry error tracking and return guard that must be kept alive.
fn init_sentry(config: &StorefrontConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_ref()?;

    let guard = sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: config
                .sentry_environment
                .clone()
                .map(std::borrow::Cow::Owned),
            attach_stacktrace: true,
            ..Default::default()
        },
    ));

    tracing::info!("Sentry initialized");
    Some(guard)
}

/// Filter tracing events to Sentry event types.
fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN => sentry_tracing::EventFilter::Event,
        tracing::Level::INFO | tracing::Level::DEBUG => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    }
}

/// Run the reservation sweeper every `interval` until shutdown.
///
/// Safe alongside the cron endpoint: every release is a compare-and-set.
fn spawn_sweeper(state: AppState, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let service = CheckoutService::new(&state);
            if let Err(e) = service
                .reconcile_pending(
                    chrono::Duration::minutes(RECONCILE_AFTER_MINUTES),
                    DEFAULT_SWEEP_BATCH,
                )
                .await
            {
                tracing::error!(error = %e, "Payment reconciliation failed");
            }
            if let Err(e) = service.release_expired(DEFAULT_SWEEP_BATCH).await {
                tracing::error!(error = %e, "Reservation sweep failed");
            }
        }
    });
    tracing::info!(interval_secs = interval.as_secs(), "In-process reservation sweeper started");
}

#[tokio::main]
async fn main() {
    // Load configuration from environment (needed for Sentry init)
    let config = StorefrontConfig::from_env().expect("Failed to load configuration");

    // Initialize Sentry (must be done before tracing subscriber)
    let _sentry_guard = init_sentry(&config);

    // Defaults to info level for our crate if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "souq_storefront=info,tower_http=info".into());

    // JSON logs when LOG_FORMAT=json, text otherwise
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let json_layer = json_logs.then(|| tracing_subscriber::fmt::layer().json().flatten_event(true));
    let text_layer = (!json_logs).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();

    let pool = db::create_pool(&config.database_url)
        .await
        .expect("Failed to create database pool");
    tracing::info!("Database pool created");

    let state = AppState::new(config.clone(), pool).expect("Failed to build payment clients");
    tracing::info!(
        benefit = state.benefit().is_some(),
        eazypay = state.eazypay().is_some(),
        "Payment gateways configured"
    );

    if let Some(interval) = config.sweep_interval {
        spawn_sweeper(state.clone(), interval);
    }

    let app = souq_storefront::app(state);

    let addr = config.socket_addr();
    tracing::info!("storefront listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    // Connect info feeds the rate limiter when no proxy header is present
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Server error");
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
