use crate::core::{DomainError, Result, Value};
use crate::types::base_enum::BaseEnum;
use std::fmt;
use std::marker::PhantomData;

/// Set of enum flags packed into one integer by OR-ing each variant's bit mask.
///
/// Stored on entities as an integer column (see `ElementType::BitMask`).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BitMask<E: BaseEnum> {
    raw: u64,
    _marker: PhantomData<E>,
}

impl<E: BaseEnum> BitMask<E> {
    pub fn empty() -> Self {
        Self {
            raw: 0,
            _marker: PhantomData,
        }
    }

    pub fn from_flags<I: IntoIterator<Item = E>>(flags: I) -> Self {
        let mut mask = Self::empty();
        for flag in flags {
            mask.add(flag);
        }
        mask
    }

    /// Rejects bits no variant declares.
    pub fn from_int(raw: u64) -> Result<Self> {
        let known = E::enum_type().full_mask();
        if raw & !known != 0 {
            return Err(DomainError::validation(format!(
                "{} has bits outside {}",
                raw,
                E::NAME
            )));
        }
        Ok(Self {
            raw,
            _marker: PhantomData,
        })
    }

    pub fn from_values<S: AsRef<str>>(values: &[S]) -> Result<Self> {
        let mut mask = Self::empty();
        for value in values {
            mask.add(E::parse(value.as_ref())?);
        }
        Ok(mask)
    }

    /// Accepts the stored integer or a list of variant values.
    pub fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::empty());
        }
        if let Some(raw) = value.as_i64() {
            return Self::from_int(raw as u64);
        }
        let items = value.clone().into_items().ok_or_else(|| {
            DomainError::validation(format!("{} expects an integer or a list", E::NAME))
        })?;
        let mut mask = Self::empty();
        for item in items {
            let name = item
                .as_str()
                .ok_or_else(|| DomainError::validation(format!("{} is not a {}", item, E::NAME)))?;
            mask.add(E::parse(name)?);
        }
        Ok(mask)
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }

    pub fn add(&mut self, flag: E) {
        self.raw |= flag.bit_mask();
    }

    pub fn remove(&mut self, flag: E) {
        self.raw &= !flag.bit_mask();
    }

    pub fn contains(&self, flag: E) -> bool {
        let mask = flag.bit_mask();
        mask != 0 && self.raw & mask == mask
    }

    /// Bits shared with `other`.
    pub fn overlap(&self, other: &Self) -> u64 {
        self.raw & other.raw
    }

    pub fn is_subset(&self, other: &Self) -> bool {
        self.raw & !other.raw == 0
    }

    pub fn flags(&self) -> Vec<E> {
        E::variants()
            .iter()
            .copied()
            .filter(|v| self.contains(*v))
            .collect()
    }

    pub fn data(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.flags()
                .into_iter()
                .map(|f| serde_json::Value::String(f.value().to_string()))
                .collect(),
        )
    }

    pub fn to_value(&self) -> Value {
        Value::Integer(self.raw as i64)
    }
}

impl<E: BaseEnum> Default for BitMask<E> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<E: BaseEnum> fmt::Debug for BitMask<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple(E::NAME).field(&self.flags()).finish()
    }
}

impl<E: BaseEnum> From<BitMask<E>> for Value {
    fn from(mask: BitMask<E>) -> Self {
        mask.to_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::base_enum! {
        enum Weekday {
            Mon = "mon" ("Monday", 1),
            Tue = "tue" ("Tuesday", 2),
            Wed = "wed" ("Wednesday", 4),
        }
    }

    #[test]
    fn test_add_remove_is_idempotent() {
        let mut days = BitMask::from_flags([Weekday::Mon, Weekday::Wed]);
        assert_eq!(days.raw(), 5);
        days.remove(Weekday::Tue);
        assert_eq!(days.raw(), 5);
        days.remove(Weekday::Mon);
        days.remove(Weekday::Mon);
        assert_eq!(days.flags(), vec![Weekday::Wed]);
    }

    #[test]
    fn test_from_int_and_list() {
        let a = BitMask::<Weekday>::from_value(&Value::Integer(3)).unwrap();
        let b = BitMask::<Weekday>::from_value(&Value::List(vec!["mon".into(), "tue".into()]))
            .unwrap();
        assert_eq!(a, b);
        assert!(BitMask::<Weekday>::from_int(8).is_err());
        assert_eq!(a.data(), serde_json::json!(["mon", "tue"]));
    }

    #[test]
    fn test_subset_and_overlap() {
        let weekend_free = BitMask::from_flags([Weekday::Mon]);
        let all = BitMask::from_flags([Weekday::Mon, Weekday::Tue, Weekday::Wed]);
        assert!(weekend_free.is_subset(&all));
        assert!(!all.is_subset(&weekend_free));
        assert_eq!(all.overlap(&weekend_free), 1);
    }
}
