//! HTTP middleware stack for storefront.
//!
//! # Middleware Order (outermost first)
//!
//! 1. Sentry layers (hub per request, HTTP context)
//! 2. `TraceLayer` (request span)
//! 3. Request ID (recorded on the span, echoed in the response)
//! 4. CORS (origins from `STOREFRONT_ALLOWED_ORIGINS`)
//! 5. Session layer (tower-sessions with `PostgreSQL` store)
//! 6. Rate limiting on auth and checkout routes (governor)
//!
//! Authentication is enforced per handler with the extractors in [`auth`]
//! and [`cron`].

pub mod auth;
pub mod cron;
pub mod rate_limit;
pub mod request_id;
pub mod session;

pub use auth::{OptionalAuth, RequireAdmin, RequireAuth, clear_current_user, set_current_user};
pub use cron::RequireCron;
pub use rate_limit::{auth_rate_limiter, checkout_rate_limiter};
pub use request_id::request_id_middleware;
pub use session::create_session_layer;
