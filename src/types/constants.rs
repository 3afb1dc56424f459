use serde::{Serialize, Serializer};
use std::fmt;

/// Coarse discriminator written into every dirty entry as `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreDataType {
    Entity,
    Set,
    List,
    Map,
    EntityList,
    ValueObject,
    MutableValueObject,
    Enum,
    /// Plain scalars, tagged with their element type name (`str`, `int`, `datetime`...).
    Primitive(&'static str),
}

impl CoreDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Set => "set",
            Self::List => "list",
            Self::Map => "map",
            Self::EntityList => "entity_list",
            Self::ValueObject => "value_object",
            Self::MutableValueObject => "mutable_value_object",
            Self::Enum => "enum",
            Self::Primitive(name) => name,
        }
    }
}

impl fmt::Display for CoreDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CoreDataType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
