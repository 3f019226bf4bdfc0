//! Status enums for checkout sessions, payments, orders and users.
//!
//! All of these are stored as `TEXT` columns. The `Display`/`FromStr`
//! pair is the canonical string form, shared by serde, sqlx and logs.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a stored or submitted status string is unknown.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {value}")]
pub struct ParseStatusError {
    kind: &'static str,
    value: String,
}

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Canonical string form.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(ParseStatusError {
                        kind: $kind,
                        value: s.to_owned(),
                    }),
                }
            }
        }

        #[cfg(feature = "postgres")]
        impl sqlx::Type<sqlx::Postgres> for $name {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <String as sqlx::Type<sqlx::Postgres>>::type_info()
            }

            fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                <String as sqlx::Type<sqlx::Postgres>>::compatible(ty)
            }
        }

        #[cfg(feature = "postgres")]
        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $name {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
                Ok(s.parse()?)
            }
        }

        #[cfg(feature = "postgres")]
        impl sqlx::Encode<'_, sqlx::Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <&str as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&self.as_str(), buf)
            }
        }
    };
}

text_enum! {
    /// Lifecycle of a checkout session.
    ///
    /// ```text
    /// initiated ──► paid
    ///     │
    ///     ├──────► failed
    ///     └──────► expired
    /// ```
    ///
    /// Only `initiated` holds reserved stock. Every other state is terminal.
    CheckoutStatus, "checkout status" {
        /// Stock reserved, waiting for payment (or COD confirmation).
        Initiated => "initiated",
        /// Converted into an order.
        Paid => "paid",
        /// Payment declined or cancelled; stock released.
        Failed => "failed",
        /// Reservation window elapsed; stock released.
        Expired => "expired",
    }
}

impl CheckoutStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Initiated)
    }

    /// Whether the session state machine allows `self -> next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initiated, Self::Paid | Self::Failed | Self::Expired)
        )
    }
}

text_enum! {
    /// Money movement status, tracked on both sessions and orders.
    PaymentStatus, "payment status" {
        Pending => "pending",
        Paid => "paid",
        Failed => "failed",
        Refunded => "refunded",
    }
}

text_enum! {
    /// How the customer pays.
    PaymentMethod, "payment method" {
        /// Cash on delivery; confirmed synchronously at checkout.
        Cod => "cod",
        /// BENEFIT debit card gateway (hosted page + encrypted notification).
        Benefit => "benefit",
        /// EazyPay invoice (hosted page + webhook / polling).
        Eazypay => "eazypay",
    }
}

impl PaymentMethod {
    /// Whether the method needs an asynchronous gateway confirmation.
    #[must_use]
    pub const fn is_online(self) -> bool {
        !matches!(self, Self::Cod)
    }
}

text_enum! {
    /// Fulfilment lifecycle of an order.
    ///
    /// ```text
    /// pending ──► processing ──► shipped ──► delivered
    ///    │             │
    ///    └─────────────┴──► cancelled
    /// ```
    OrderStatus, "order status" {
        Pending => "pending",
        Processing => "processing",
        Shipped => "shipped",
        Delivered => "delivered",
        Cancelled => "cancelled",
    }
}

impl OrderStatus {
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing | Self::Cancelled)
                | (Self::Processing, Self::Shipped | Self::Cancelled)
                | (Self::Shipped, Self::Delivered)
        )
    }
}

text_enum! {
    /// Account role.
    UserRole, "user role" {
        Customer => "customer",
        Admin => "admin",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ALL_CHECKOUT: [CheckoutStatus; 4] = [
        CheckoutStatus::Initiated,
        CheckoutStatus::Paid,
        CheckoutStatus::Failed,
        CheckoutStatus::Expired,
    ];

    #[test]
    fn test_only_initiated_moves() {
        for from in ALL_CHECKOUT {
            for to in ALL_CHECKOUT {
                let allowed = from.can_transition_to(to);
                let expected = from == CheckoutStatus::Initiated && to != from;
                assert_eq!(allowed, expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!CheckoutStatus::Initiated.is_terminal());
        assert!(CheckoutStatus::Paid.is_terminal());
        assert!(CheckoutStatus::Failed.is_terminal());
        assert!(CheckoutStatus::Expired.is_terminal());
    }

    #[test]
    fn test_order_transitions() {
        use OrderStatus::{Cancelled, Delivered, Pending, Processing, Shipped};
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Cancelled));
        assert!(Shipped.can_transition_to(Delivered));
        assert!(!Shipped.can_transition_to(Cancelled));
        assert!(!Delivered.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Delivered));
    }

    #[test]
    fn test_string_round_trip_and_errors() {
        assert_eq!("eazypay".parse::<PaymentMethod>().unwrap(), PaymentMethod::Eazypay);
        assert_eq!(PaymentMethod::Cod.to_string(), "cod");
        assert!(!PaymentMethod::Cod.is_online());
        assert!(PaymentMethod::Benefit.is_online());

        let err = "shipped_twice".parse::<OrderStatus>().unwrap_err();
        assert_eq!(err.to_string(), "invalid order status: shipped_twice");
    }

    #[test]
    fn test_serde_matches_display() {
        let json = serde_json::to_string(&CheckoutStatus::Expired).unwrap();
        assert_eq!(json, "\"expired\"");
        let role: UserRole = serde_json::from_str("\"admin\"").unwrap();
        assert_eq!(role, UserRole::Admin);
    }
}
