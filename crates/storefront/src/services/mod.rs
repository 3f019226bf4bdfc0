//! Business logic services for the storefront.
//!
//! # Services
//!
//! - `auth` - Email and password accounts
//! - `checkout` - Stock reservation, payment reconciliation, reservation sweeper
//! - `orders` - Order fulfilment status and cancellation restock

pub mod auth;
pub mod checkout;
pub mod orders;
