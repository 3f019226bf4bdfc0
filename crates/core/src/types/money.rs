//! Monetary amounts in Bahraini dinar.
//!
//! The store sells in a single currency. BHD has three minor digits (fils),
//! so every [`Money`] value is normalized to exactly three decimal places
//! on construction. Arithmetic is checked; a checkout total that overflows
//! is a bug to report, not a value to wrap.

use core::fmt;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Number of minor digits for BHD.
pub const MINOR_DIGITS: u32 = 3;

/// Errors from money construction and arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
    #[error("amount cannot be negative: {0}")]
    Negative(Decimal),
    #[error("amount overflow")]
    Overflow,
}

/// ISO 4217 currency code. Only the store currency is modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CurrencyCode {
    #[default]
    BHD,
}

impl CurrencyCode {
    /// Alphabetic ISO code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BHD => "BHD",
        }
    }

    /// Numeric ISO code, used by card gateways.
    #[must_use]
    pub const fn numeric(self) -> &'static str {
        match self {
            Self::BHD => "048",
        }
    }
}

/// A non-negative BHD amount with three decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Money(Decimal);

impl Money {
    /// Zero dinar.
    pub const ZERO: Self = Self(Decimal::ZERO);

    /// Create a new amount, rounding half away from zero to fils.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Negative`] for amounts below zero.
    pub fn new(amount: Decimal) -> Result<Self, MoneyError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(MoneyError::Negative(amount));
        }
        let mut rounded =
            amount.round_dp_with_strategy(MINOR_DIGITS, RoundingStrategy::MidpointAwayFromZero);
        rounded.rescale(MINOR_DIGITS);
        Ok(Self(rounded))
    }

    /// Build from an integer number of fils (1/1000 BHD).
    #[must_use]
    pub fn from_fils(fils: u32) -> Self {
        Self(Decimal::new(i64::from(fils), MINOR_DIGITS))
    }

    #[must_use]
    pub const fn amount(&self) -> Decimal {
        self.0
    }

    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// Add two amounts.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the sum does not fit.
    pub fn checked_add(self, other: Self) -> Result<Self, MoneyError> {
        self.0
            .checked_add(other.0)
            .ok_or(MoneyError::Overflow)
            .and_then(Self::new)
    }

    /// Multiply by a line quantity.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the product does not fit.
    pub fn checked_mul(self, quantity: u32) -> Result<Self, MoneyError> {
        self.0
            .checked_mul(Decimal::from(quantity))
            .ok_or(MoneyError::Overflow)
            .and_then(Self::new)
    }

    /// Sum an iterator of amounts.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the running total does not fit.
    pub fn sum<I: IntoIterator<Item = Self>>(items: I) -> Result<Self, MoneyError> {
        items
            .into_iter()
            .try_fold(Self::ZERO, |acc, m| acc.checked_add(m))
    }

    /// Amount as sent to card gateways: plain decimal with three places,
    /// e.g. `"12.500"`.
    #[must_use]
    pub fn to_gateway_string(&self) -> String {
        self.0.to_string()
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", CurrencyCode::BHD.as_str(), self.0)
    }
}

impl TryFrom<Decimal> for Money {
    type Error = MoneyError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Money> for Decimal {
    fn from(m: Money) -> Self {
        m.0
    }
}

#[cfg(feature = "postgres")]
impl sqlx::Type<sqlx::Postgres> for Money {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <Decimal as sqlx::Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <Decimal as sqlx::Type<sqlx::Postgres>>::compatible(ty)
    }
}

#[cfg(feature = "postgres")]
impl<'r> sqlx::Decode<'r, sqlx::Postgres> for Money {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let amount = <Decimal as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(Self::new(amount)?)
    }
}

#[cfg(feature = "postgres")]
impl sqlx::Encode<'_, sqlx::Postgres> for Money {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <Decimal as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&self.0, buf)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn bhd(s: &str) -> Money {
        Money::new(Decimal::from_str(s).unwrap()).unwrap()
    }

    #[test]
    fn test_normalizes_to_three_places() {
        assert_eq!(bhd("12.5").to_gateway_string(), "12.500");
        assert_eq!(bhd("7").to_gateway_string(), "7.000");
        assert_eq!(bhd("0.0005").to_gateway_string(), "0.001");
        assert_eq!(bhd("0.0004").to_gateway_string(), "0.000");
    }

    #[test]
    fn test_rejects_negative() {
        let result = Money::new(Decimal::from_str("-0.100").unwrap());
        assert!(matches!(result, Err(MoneyError::Negative(_))));
    }

    #[test]
    fn test_line_and_cart_totals() {
        let line = bhd("3.250").checked_mul(3).unwrap();
        assert_eq!(line, bhd("9.750"));

        let total = Money::sum([line, bhd("1.000"), Money::from_fils(250)]).unwrap();
        assert_eq!(total.to_gateway_string(), "11.000");
    }

    #[test]
    fn test_serde_uses_decimal_string() {
        let json = serde_json::to_string(&bhd("4.2")).unwrap();
        assert_eq!(json, "\"4.200\"");

        let back: Money = serde_json::from_str("\"4.2\"").unwrap();
        assert_eq!(back, bhd("4.200"));

        assert!(serde_json::from_str::<Money>("\"-1\"").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(bhd("1.5").to_string(), "BHD 1.500");
        assert_eq!(CurrencyCode::BHD.numeric(), "048");
    }
}
