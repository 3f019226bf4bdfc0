//! Domain models for the storefront.
//!
//! These are validated domain objects, separate from the row types in
//! [`crate::db`]. All of them serialize to camelCase JSON for the API.

pub mod cart;
pub mod catalog;
pub mod checkout;
pub mod order;
pub mod session;
pub mod user;

pub use cart::{Cart, CartItem};
pub use catalog::{Category, Product};
pub use checkout::{CheckoutLine, CheckoutSession, CustomerDetails, ShippingAddress};
pub use order::{Order, OrderItem, OrderWithItems};
pub use session::CurrentUser;
pub use user::User;
