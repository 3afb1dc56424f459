use crate::core::{DomainError, Result, Value};
use std::fmt;
use std::sync::Arc;

/// Closed set of string-valued variants with optional label and bit mask.
///
/// Implemented through [`base_enum!`](crate::base_enum); the trait exists so that
/// typed aggregates can read enum attributes back as Rust enums.
pub trait BaseEnum: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    const NAME: &'static str;

    fn variants() -> &'static [Self];

    fn value(&self) -> &'static str;

    fn label(&self) -> &'static str;

    fn bit_mask(&self) -> u64;

    fn from_value(value: &str) -> Option<Self> {
        Self::variants().iter().copied().find(|v| v.value() == value)
    }

    fn parse(value: &str) -> Result<Self> {
        Self::from_value(value).ok_or_else(|| {
            DomainError::validation(format!("'{}' is not a valid {}", value, Self::NAME))
        })
    }

    fn all() -> Vec<&'static str> {
        Self::variants().iter().map(|v| v.value()).collect()
    }

    fn enum_type() -> EnumType {
        EnumType {
            name: Self::NAME,
            variants: Self::variants()
                .iter()
                .map(|v| EnumVariant {
                    value: v.value(),
                    label: v.label(),
                    bit_mask: v.bit_mask(),
                })
                .collect::<Vec<_>>()
                .into(),
        }
    }

    fn to_value(&self) -> Value {
        Value::Text(self.value().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumVariant {
    pub value: &'static str,
    pub label: &'static str,
    pub bit_mask: u64,
}

/// Runtime descriptor of a [`BaseEnum`], stored in field metadata.
#[derive(Debug, Clone)]
pub struct EnumType {
    name: &'static str,
    variants: Arc<[EnumVariant]>,
}

impl EnumType {
    pub fn of<E: BaseEnum>() -> Self {
        E::enum_type()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn variants(&self) -> &[EnumVariant] {
        &self.variants
    }

    pub fn contains(&self, value: &str) -> bool {
        self.variants.iter().any(|v| v.value == value)
    }

    pub fn variant(&self, value: &str) -> Option<&EnumVariant> {
        self.variants.iter().find(|v| v.value == value)
    }

    pub fn full_mask(&self) -> u64 {
        self.variants.iter().fold(0, |acc, v| acc | v.bit_mask)
    }
}

impl PartialEq for EnumType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

/// Declares a [`BaseEnum`].
///
/// Each variant takes a value and, optionally, a label and a bit mask:
///
/// ```
/// dddkit::base_enum! {
///     pub enum Permission {
///         Read = "read" ("Read", 1),
///         Write = "write" ("Write", 2),
///         Admin = "admin",
///     }
/// }
/// use dddkit::types::BaseEnum;
/// assert_eq!(Permission::Write.bit_mask(), 2);
/// assert_eq!(Permission::Admin.label(), "admin");
/// ```
#[macro_export]
macro_rules! base_enum {
    (@label $value:literal) => { $value };
    (@label $value:literal, $label:literal) => { $label };
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $variant:ident = $value:literal $( ( $label:literal $(, $mask:literal)? ) )? ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $( $variant ),+
        }

        impl $crate::types::BaseEnum for $name {
            const NAME: &'static str = stringify!($name);

            fn variants() -> &'static [Self] {
                &[ $( Self::$variant ),+ ]
            }

            fn value(&self) -> &'static str {
                match self {
                    $( Self::$variant => $value ),+
                }
            }

            fn label(&self) -> &'static str {
                match self {
                    $( Self::$variant => $crate::base_enum!(@label $value $(, $label)?) ),+
                }
            }

            fn bit_mask(&self) -> u64 {
                match self {
                    $( Self::$variant => 0 $( $( | $mask )? )? ),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str($crate::types::BaseEnum::value(self))
            }
        }

        impl From<$name> for $crate::core::Value {
            fn from(v: $name) -> Self {
                $crate::types::BaseEnum::to_value(&v)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::base_enum! {
        enum Colour {
            Red = "red" ("Red", 1),
            Green = "green" ("Green", 2),
            Blue = "blue",
        }
    }

    #[test]
    fn test_values_and_labels() {
        assert_eq!(Colour::all(), vec!["red", "green", "blue"]);
        assert_eq!(Colour::Red.label(), "Red");
        assert_eq!(Colour::Blue.label(), "blue");
        assert_eq!(Colour::from_value("green"), Some(Colour::Green));
        assert!(Colour::parse("purple").is_err());
    }

    #[test]
    fn test_enum_type_descriptor() {
        let et = EnumType::of::<Colour>();
        assert_eq!(et.name(), "Colour");
        assert!(et.contains("red"));
        assert_eq!(et.full_mask(), 3);
        assert_eq!(Value::from(Colour::Red), Value::Text("red".into()));
    }
}
