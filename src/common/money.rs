//! Fixed-point monetary amounts.
//!
//! Amounts are kept in hundredths of the currency unit. Anything finer is rounded
//! half-to-even when parsed, so `"1.005"` becomes `1.00` and `"1.015"` becomes `1.02`.

use crate::core::{DomainError, Result};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Money {
    minor: i64,
    currency: String,
}

impl Money {
    pub fn new(minor_units: i64, currency: impl Into<String>) -> Result<Self> {
        let currency = normalize_currency(currency.into())?;
        Ok(Self {
            minor: minor_units,
            currency,
        })
    }

    pub fn zero(currency: impl Into<String>) -> Result<Self> {
        Self::new(0, currency)
    }

    /// Parses `"12.50 INR"`. A bare amount like `"12.50"` takes `default_currency`.
    pub fn parse(input: &str, default_currency: Option<&str>) -> Result<Self> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        let (amount, currency) = match parts.as_slice() {
            [amount] => (*amount, default_currency),
            [amount, currency] => (*amount, Some(*currency)),
            _ => {
                return Err(DomainError::validation(format!(
                    "Cannot initialize money with amount {}",
                    input
                )));
            }
        };
        let currency = currency.ok_or_else(|| {
            DomainError::InvalidState("Could not resolve currency for money value".into())
        })?;
        Self::new(parse_minor_units(amount)?, currency)
    }

    /// Accepts `{ "amount": "12.50" | 12.5, "currency": "INR" }` or a string.
    pub fn from_json(value: &serde_json::Value, default_currency: Option<&str>) -> Result<Self> {
        match value {
            serde_json::Value::String(s) => Self::parse(s, default_currency),
            serde_json::Value::Number(n) => {
                let currency = default_currency.ok_or_else(|| {
                    DomainError::InvalidState("Could not resolve currency for money value".into())
                })?;
                Self::new(parse_minor_units(&n.to_string())?, currency)
            }
            serde_json::Value::Object(map) => {
                let amount = match map.get("amount") {
                    Some(serde_json::Value::String(s)) => parse_minor_units(s)?,
                    Some(serde_json::Value::Number(n)) => parse_minor_units(&n.to_string())?,
                    _ => return Err(DomainError::validation("Money requires an amount")),
                };
                let currency = match map.get("currency") {
                    Some(serde_json::Value::String(c)) => c.as_str(),
                    _ => default_currency.ok_or_else(|| {
                        DomainError::validation("Money requires a currency")
                    })?,
                };
                Self::new(amount, currency)
            }
            other => Err(DomainError::validation(format!(
                "Cannot build money from {}",
                other
            ))),
        }
    }

    pub fn minor_units(&self) -> i64 {
        self.minor
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.minor == 0
    }

    /// Decimal rendering with exactly two fractional digits.
    pub fn amount(&self) -> String {
        let sign = if self.minor < 0 { "-" } else { "" };
        let abs = self.minor.unsigned_abs();
        format!("{}{}.{:02}", sign, abs / 100, abs % 100)
    }

    pub fn as_f64(&self) -> f64 {
        self.minor as f64 / 100.0
    }

    pub fn checked_add(&self, other: &Money) -> Result<Money> {
        self.ensure_same_currency(other, "Adding")?;
        let minor = self
            .minor
            .checked_add(other.minor)
            .ok_or_else(|| DomainError::validation("Money overflow"))?;
        Ok(Money {
            minor,
            currency: self.currency.clone(),
        })
    }

    pub fn checked_sub(&self, other: &Money) -> Result<Money> {
        self.ensure_same_currency(other, "Subtracting")?;
        let minor = self
            .minor
            .checked_sub(other.minor)
            .ok_or_else(|| DomainError::validation("Money overflow"))?;
        Ok(Money {
            minor,
            currency: self.currency.clone(),
        })
    }

    pub fn multiply(&self, factor: i64) -> Result<Money> {
        let minor = self
            .minor
            .checked_mul(factor)
            .ok_or_else(|| DomainError::validation("Money overflow"))?;
        Ok(Money {
            minor,
            currency: self.currency.clone(),
        })
    }

    pub fn negate(&self) -> Money {
        Money {
            minor: -self.minor,
            currency: self.currency.clone(),
        }
    }

    pub fn abs(&self) -> Money {
        Money {
            minor: self.minor.abs(),
            currency: self.currency.clone(),
        }
    }

    /// Orders two amounts of the same currency.
    pub fn compare(&self, other: &Money) -> Result<Ordering> {
        self.ensure_same_currency(other, "Comparing")?;
        Ok(self.minor.cmp(&other.minor))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "amount": self.amount(),
            "currency": self.currency,
        })
    }

    fn ensure_same_currency(&self, other: &Money, operation: &str) -> Result<()> {
        if self.currency != other.currency {
            return Err(DomainError::validation(format!(
                "{} two different currencies: {} and {}",
                operation, self.currency, other.currency
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount(), self.currency)
    }
}

fn normalize_currency(currency: String) -> Result<String> {
    let code = currency.trim().to_ascii_uppercase();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(DomainError::validation(format!(
            "Invalid currency code '{}'",
            currency
        )));
    }
    Ok(code)
}

fn parse_minor_units(raw: &str) -> Result<i64> {
    let invalid = || DomainError::validation(format!("Invalid money amount '{}'", raw));
    let trimmed = raw.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let (whole, fraction) = match digits.split_once('.') {
        Some((w, f)) => (w, f),
        None => (digits, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid());
    }

    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let mut cents = 0i64;
    for (idx, c) in fraction.chars().take(2).enumerate() {
        let digit = c.to_digit(10).map(i64::from).ok_or_else(invalid)?;
        cents += if idx == 0 { digit * 10 } else { digit };
    }

    let mut minor = whole
        .checked_mul(100)
        .and_then(|v| v.checked_add(cents))
        .ok_or_else(invalid)?;

    let rest: Vec<u32> = fraction.chars().skip(2).filter_map(|c| c.to_digit(10)).collect();
    if let Some(first) = rest.first() {
        let tail_nonzero = rest.iter().skip(1).any(|d| *d != 0);
        let round_up = match first {
            6..=9 => true,
            5 if tail_nonzero => true,
            5 => minor % 2 != 0,
            _ => false,
        };
        if round_up {
            minor += 1;
        }
    }

    Ok(if negative { -minor } else { minor })
}
