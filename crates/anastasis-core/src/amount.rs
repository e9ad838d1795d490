//! Monetary amounts in the `CUR:VALUE.FRACTION` format used by the
//! payment backend, e.g. `EUR:4.99` or `KUDOS:0.5`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Fractional base: one unit is 10^8 fractions.
pub const FRACTION_BASE: u32 = 100_000_000;

/// Maximum value so that additions cannot overflow an i64 backend.
pub const MAX_AMOUNT_VALUE: u64 = 1 << 52;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("malformed amount string: {0}")]
    Malformed(String),

    #[error("currency mismatch: {0} vs {1}")]
    CurrencyMismatch(String, String),

    #[error("amount arithmetic overflow")]
    Overflow,
}

/// An amount of a single currency. Value and fraction are normalized so
/// that `fraction < FRACTION_BASE` always holds.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Amount {
    currency: String,
    value: u64,
    fraction: u32,
}

impl Amount {
    pub fn new(currency: &str, value: u64, fraction: u32) -> Result<Self, AmountError> {
        if !currency_valid(currency) {
            return Err(AmountError::Malformed(currency.to_string()));
        }
        let mut a = Amount {
            currency: currency.to_string(),
            value,
            fraction,
        };
        a.normalize()?;
        Ok(a)
    }

    /// The zero amount of `currency`.
    pub fn zero(currency: &str) -> Result<Self, AmountError> {
        Self::new(currency, 0, 0)
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn fraction(&self) -> u32 {
        self.fraction
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0 && self.fraction == 0
    }

    fn normalize(&mut self) -> Result<(), AmountError> {
        self.value = self
            .value
            .checked_add(u64::from(self.fraction / FRACTION_BASE))
            .ok_or(AmountError::Overflow)?;
        self.fraction %= FRACTION_BASE;
        if self.value > MAX_AMOUNT_VALUE {
            return Err(AmountError::Overflow);
        }
        Ok(())
    }

    /// Checked addition; both operands must share a currency.
    pub fn checked_add(&self, other: &Amount) -> Result<Amount, AmountError> {
        if self.currency != other.currency {
            return Err(AmountError::CurrencyMismatch(
                self.currency.clone(),
                other.currency.clone(),
            ));
        }
        let mut out = Amount {
            currency: self.currency.clone(),
            value: self
                .value
                .checked_add(other.value)
                .ok_or(AmountError::Overflow)?,
            fraction: self.fraction + other.fraction,
        };
        out.normalize()?;
        Ok(out)
    }

    /// Multiply by a scalar (e.g. a number of storage years).
    pub fn checked_mul(&self, factor: u32) -> Result<Amount, AmountError> {
        let total_fraction = u64::from(self.fraction) * u64::from(factor);
        let mut out = Amount {
            currency: self.currency.clone(),
            value: self
                .value
                .checked_mul(u64::from(factor))
                .ok_or(AmountError::Overflow)?
                .checked_add(total_fraction / u64::from(FRACTION_BASE))
                .ok_or(AmountError::Overflow)?,
            fraction: (total_fraction % u64::from(FRACTION_BASE)) as u32,
        };
        out.normalize()?;
        Ok(out)
    }

    /// How many times `unit` fits into `self` (integer division).
    /// Used to turn a paid total back into a number of years.
    pub fn divide2(&self, unit: &Amount) -> Result<u32, AmountError> {
        if self.currency != unit.currency {
            return Err(AmountError::CurrencyMismatch(
                self.currency.clone(),
                unit.currency.clone(),
            ));
        }
        if unit.is_zero() {
            return Ok(0);
        }
        let total = u128::from(self.value) * u128::from(FRACTION_BASE) + u128::from(self.fraction);
        let unit_total =
            u128::from(unit.value) * u128::from(FRACTION_BASE) + u128::from(unit.fraction);
        Ok((total / unit_total).min(u128::from(u32::MAX)) as u32)
    }

    /// Total order within one currency.
    pub fn cmp_same_currency(&self, other: &Amount) -> Result<Ordering, AmountError> {
        if self.currency != other.currency {
            return Err(AmountError::CurrencyMismatch(
                self.currency.clone(),
                other.currency.clone(),
            ));
        }
        Ok((self.value, self.fraction).cmp(&(other.value, other.fraction)))
    }
}

fn currency_valid(c: &str) -> bool {
    (1..=11).contains(&c.len()) && c.bytes().all(|b| b.is_ascii_uppercase())
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fraction == 0 {
            return write!(f, "{}:{}", self.currency, self.value);
        }
        let mut frac = self.fraction;
        let mut digits = String::new();
        while frac > 0 {
            digits.push((b'0' + (frac / (FRACTION_BASE / 10)) as u8) as char);
            frac = (frac % (FRACTION_BASE / 10)) * 10;
        }
        write!(f, "{}:{}.{}", self.currency, self.value, digits)
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({self})")
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AmountError::Malformed(s.to_string());
        let (currency, rest) = s.split_once(':').ok_or_else(malformed)?;
        if !currency_valid(currency) {
            return Err(malformed());
        }
        let (value_s, frac_s) = match rest.split_once('.') {
            Some((v, f)) => (v, Some(f)),
            None => (rest, None),
        };
        let value: u64 = value_s.parse().map_err(|_| malformed())?;
        let fraction = match frac_s {
            None => 0,
            Some(f) => {
                if f.is_empty() || f.len() > 8 || !f.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(malformed());
                }
                let mut frac: u32 = 0;
                let mut unit = FRACTION_BASE / 10;
                for b in f.bytes() {
                    frac += u32::from(b - b'0') * unit;
                    unit /= 10;
                }
                frac
            }
        };
        Amount::new(currency, value, fraction)
    }
}

impl TryFrom<String> for Amount {
    type Error = AmountError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Amount> for String {
    fn from(a: Amount) -> String {
        a.to_string()
    }
}
