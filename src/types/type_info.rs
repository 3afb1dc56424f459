//! Declarative per-attribute metadata.

use crate::common::dateutils::{from_timestamp, parse_date, parse_datetime, parse_time};
use crate::common::money::Money;
use crate::core::{DomainError, Result, Value};
use crate::types::base_enum::EnumType;
use crate::types::constants::CoreDataType;
use crate::types::entity::EntitySchema;
use crate::types::value_object::{ValueObject, ValueObjectSchema};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Declared element type of an attribute (or of the items of a container).
#[derive(Debug, Clone)]
pub enum ElementType {
    Any,
    Str,
    Int,
    Float,
    Bool,
    DateTime,
    Date,
    Time,
    Json,
    Money,
    Enum(EnumType),
    BitMask(EnumType),
    ValueObject(Arc<ValueObjectSchema>),
    Entity(Arc<EntitySchema>),
}

impl ElementType {
    pub fn type_name(&self) -> String {
        match self {
            Self::Any => "any".into(),
            Self::Str => "str".into(),
            Self::Int => "int".into(),
            Self::Float => "float".into(),
            Self::Bool => "bool".into(),
            Self::DateTime => "datetime".into(),
            Self::Date => "date".into(),
            Self::Time => "time".into(),
            Self::Json => "dict".into(),
            Self::Money => "Money".into(),
            Self::Enum(et) | Self::BitMask(et) => et.name().to_string(),
            Self::ValueObject(schema) => schema.name().to_string(),
            Self::Entity(schema) => schema.class_name().to_string(),
        }
    }

    pub fn core_type(&self) -> CoreDataType {
        match self {
            Self::Enum(_) => CoreDataType::Enum,
            Self::BitMask(_) => CoreDataType::ValueObject,
            Self::ValueObject(schema) if schema.is_mutable() => CoreDataType::MutableValueObject,
            Self::ValueObject(_) => CoreDataType::ValueObject,
            Self::Entity(_) => CoreDataType::Entity,
            Self::Any => CoreDataType::Primitive("any"),
            Self::Str => CoreDataType::Primitive("str"),
            Self::Int => CoreDataType::Primitive("int"),
            Self::Float => CoreDataType::Primitive("float"),
            Self::Bool => CoreDataType::Primitive("bool"),
            Self::DateTime => CoreDataType::Primitive("datetime"),
            Self::Date => CoreDataType::Primitive("date"),
            Self::Time => CoreDataType::Primitive("time"),
            Self::Json => CoreDataType::Primitive("dict"),
            Self::Money => CoreDataType::Primitive("Money"),
        }
    }

    pub fn is_entity(&self) -> bool {
        matches!(self, Self::Entity(_))
    }

    pub fn entity_schema(&self) -> Option<&Arc<EntitySchema>> {
        match self {
            Self::Entity(schema) => Some(schema),
            _ => None,
        }
    }

    /// Coerces a raw value into this element type. `Null` passes through untouched;
    /// nullability is the field's concern.
    pub fn coerce(&self, value: Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self {
            Self::Any => Ok(value),
            Self::Str => match value {
                Value::Text(_) => Ok(value),
                Value::Json(serde_json::Value::String(s)) => Ok(Value::Text(s)),
                other => Err(self.mismatch(&other)),
            },
            Self::Int => match value.as_i64() {
                Some(i) => Ok(Value::Integer(i)),
                None => match &value {
                    Value::Text(s) => s
                        .trim()
                        .parse::<i64>()
                        .map(Value::Integer)
                        .map_err(|_| self.mismatch(&value)),
                    _ => Err(self.mismatch(&value)),
                },
            },
            Self::Float => match value.as_f64() {
                Some(f) => Ok(Value::Float(f)),
                None => match &value {
                    Value::Text(s) => s
                        .trim()
                        .parse::<f64>()
                        .map(Value::Float)
                        .map_err(|_| self.mismatch(&value)),
                    _ => Err(self.mismatch(&value)),
                },
            },
            Self::Bool => match value.as_bool() {
                Some(b) => Ok(Value::Boolean(b)),
                None => match value.as_str() {
                    Some("true") => Ok(Value::Boolean(true)),
                    Some("false") => Ok(Value::Boolean(false)),
                    _ => Err(self.mismatch(&value)),
                },
            },
            Self::DateTime => match value {
                Value::Timestamp(_) => Ok(value),
                Value::Date(d) => Ok(Value::Timestamp(crate::common::dateutils::localize(
                    d.and_time(chrono::NaiveTime::MIN),
                ))),
                Value::Integer(secs) => Ok(Value::Timestamp(from_timestamp(secs)?)),
                ref other => match other.as_str() {
                    Some(s) => Ok(Value::Timestamp(parse_datetime(s)?)),
                    None => Err(self.mismatch(other)),
                },
            },
            Self::Date => match value {
                Value::Date(_) => Ok(value),
                Value::Timestamp(ts) => Ok(Value::Date(ts.date_naive())),
                ref other => match other.as_str() {
                    Some(s) => Ok(Value::Date(parse_date(s)?)),
                    None => Err(self.mismatch(other)),
                },
            },
            Self::Time => match value {
                Value::Time(_) => Ok(value),
                ref other => match other.as_str() {
                    Some(s) => Ok(Value::Time(parse_time(s)?)),
                    None => Err(self.mismatch(other)),
                },
            },
            Self::Json => match value {
                Value::Json(_) => Ok(value),
                other => Ok(Value::Json(other.to_json())),
            },
            Self::Money => match value {
                Value::Money(_) => Ok(value),
                Value::Text(s) => Ok(Value::Money(Money::parse(&s, None)?)),
                Value::Map(_) | Value::Json(_) => {
                    Ok(Value::Money(Money::from_json(&value.to_json(), None)?))
                }
                other => Err(self.mismatch(&other)),
            },
            Self::Enum(et) => match value.as_str() {
                Some(s) if et.contains(s) => Ok(Value::Text(s.to_string())),
                Some(s) => Err(DomainError::validation(format!(
                    "'{}' is not a valid {}",
                    s,
                    et.name()
                ))),
                None => Err(self.mismatch(&value)),
            },
            Self::BitMask(et) => coerce_bitmask(et, value),
            Self::ValueObject(schema) => match value {
                Value::Object(vo) if vo.schema().name() == schema.name() => Ok(Value::Object(vo)),
                other => Ok(Value::Object(ValueObject::from_value(schema, other)?)),
            },
            Self::Entity(schema) => Err(DomainError::InvalidState(format!(
                "{} values are built by their owning entity",
                schema.class_name()
            ))),
        }
    }

    fn mismatch(&self, value: &Value) -> DomainError {
        DomainError::validation(format!(
            "{} is invalid value for type {}",
            value,
            self.type_name()
        ))
    }
}

fn coerce_bitmask(et: &EnumType, value: Value) -> Result<Value> {
    if let Some(raw) = value.as_i64() {
        let raw = raw as u64;
        if raw & !et.full_mask() != 0 {
            return Err(DomainError::validation(format!(
                "{} has bits outside {}",
                raw,
                et.name()
            )));
        }
        return Ok(Value::Integer(raw as i64));
    }
    let items = value.into_items().ok_or_else(|| {
        DomainError::validation(format!("{} expects an integer or a list of values", et.name()))
    })?;
    let mut raw = 0u64;
    for item in items {
        let name = item.as_str().ok_or_else(|| {
            DomainError::validation(format!("{} is not a {} value", item, et.name()))
        })?;
        let variant = et.variant(name).ok_or_else(|| {
            DomainError::validation(format!("'{}' is not a valid {}", name, et.name()))
        })?;
        raw |= variant.bit_mask;
    }
    Ok(Value::Integer(raw as i64))
}

/// Polymorphic field: the element type is picked from the value of `selector_key`.
#[derive(Debug, Clone)]
pub struct OneOf {
    selector_key: String,
    mapping: Vec<(String, ElementType)>,
}

impl OneOf {
    pub fn new(selector_key: impl Into<String>) -> Self {
        Self {
            selector_key: selector_key.into(),
            mapping: Vec::new(),
        }
    }

    pub fn variant(mut self, discriminant: impl Into<String>, element: ElementType) -> Self {
        self.mapping.push((discriminant.into(), element));
        self
    }

    pub fn selector_key(&self) -> &str {
        &self.selector_key
    }

    pub fn resolve(&self, selector: &Value) -> Result<ElementType> {
        let key = selector.as_str().ok_or_else(|| {
            DomainError::validation(format!(
                "'{}' must be set before its dependent attribute",
                self.selector_key
            ))
        })?;
        self.mapping
            .iter()
            .find(|(discriminant, _)| discriminant == key)
            .map(|(_, element)| element.clone())
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "'{}' has no type mapped for {}='{}'",
                    self.selector_key, self.selector_key, key
                ))
            })
    }

    pub fn elements(&self) -> impl Iterator<Item = &ElementType> {
        self.mapping.iter().map(|(_, element)| element)
    }
}

#[derive(Debug, Clone)]
pub enum FieldKind {
    Single(ElementType),
    OneOf(OneOf),
}

/// Default used when a keyword is absent at construction time.
#[derive(Debug, Clone)]
pub enum DefaultValue {
    Value(Value),
    Factory(fn() -> Value),
}

impl DefaultValue {
    pub fn resolve(&self) -> Value {
        match self {
            Self::Value(v) => v.clone(),
            Self::Factory(f) => f(),
        }
    }
}

pub type ValueParser = fn(Value) -> Result<Value>;

#[derive(Debug, Clone)]
pub struct FieldInfo {
    name: String,
    kind: FieldKind,
    pub many: bool,
    pub unique: bool,
    pub mapped: bool,
    pub required: bool,
    pub allow_none: bool,
    pub primary_key: bool,
    pub hidden: bool,
    default: Option<DefaultValue>,
    parser: Option<ValueParser>,
    id_parts: Option<usize>,
    description: Option<String>,
}

impl FieldInfo {
    pub fn new(name: impl Into<String>, element: ElementType) -> Self {
        Self::with_kind(name, FieldKind::Single(element))
    }

    pub fn one_of(name: impl Into<String>, one_of: OneOf) -> Self {
        Self::with_kind(name, FieldKind::OneOf(one_of))
    }

    fn with_kind(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            many: false,
            unique: false,
            mapped: false,
            required: true,
            allow_none: true,
            primary_key: false,
            hidden: false,
            default: None,
            parser: None,
            id_parts: None,
            description: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ElementType::Str)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ElementType::Int)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, ElementType::Float)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ElementType::Bool)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, ElementType::DateTime)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, ElementType::Date)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, ElementType::Json)
    }

    pub fn money(name: impl Into<String>) -> Self {
        Self::new(name, ElementType::Money)
    }

    pub fn enumeration(name: impl Into<String>, enum_type: EnumType) -> Self {
        Self::new(name, ElementType::Enum(enum_type))
    }

    pub fn bitmask(name: impl Into<String>, enum_type: EnumType) -> Self {
        Self::new(name, ElementType::BitMask(enum_type))
    }

    pub fn value_object(name: impl Into<String>, schema: Arc<ValueObjectSchema>) -> Self {
        Self::new(name, ElementType::ValueObject(schema))
    }

    pub fn entity(name: impl Into<String>, schema: Arc<EntitySchema>) -> Self {
        Self::new(name, ElementType::Entity(schema))
    }

    pub fn entity_set(name: impl Into<String>, schema: Arc<EntitySchema>) -> Self {
        Self::new(name, ElementType::Entity(schema)).many()
    }

    pub fn many(mut self) -> Self {
        self.many = true;
        self
    }

    /// Set semantics for a `many` attribute.
    pub fn unique(mut self) -> Self {
        self.many = true;
        self.unique = true;
        self
    }

    pub fn mapped(mut self) -> Self {
        self.mapped = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.allow_none = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Value(value.into()));
        self.required = false;
        self
    }

    pub fn default_factory(mut self, factory: fn() -> Value) -> Self {
        self.default = Some(DefaultValue::Factory(factory));
        self.required = false;
        self
    }

    pub fn parser(mut self, parser: ValueParser) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Random parts in ids an entity set synthesizes for this attribute.
    pub fn id_parts(mut self, parts: usize) -> Self {
        self.id_parts = Some(parts);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn id_parts_override(&self) -> Option<usize> {
        self.id_parts
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    pub fn get_default_value(&self) -> Option<Value> {
        self.default.as_ref().map(DefaultValue::resolve)
    }

    /// Statically declared element type; `None` for one-of fields.
    pub fn element(&self) -> Option<&ElementType> {
        match &self.kind {
            FieldKind::Single(element) => Some(element),
            FieldKind::OneOf(_) => None,
        }
    }

    pub fn selector_key(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::OneOf(one_of) => Some(one_of.selector_key()),
            FieldKind::Single(_) => None,
        }
    }

    /// Every element type this field can hold.
    pub fn element_types(&self) -> Vec<&ElementType> {
        match &self.kind {
            FieldKind::Single(element) => vec![element],
            FieldKind::OneOf(one_of) => one_of.elements().collect(),
        }
    }

    pub fn is_entity(&self) -> bool {
        self.element_types().iter().any(|e| e.is_entity())
    }

    /// Picks the concrete element type, consulting the selector for one-of fields.
    pub fn resolve_element(&self, selector: Option<&Value>) -> Result<ElementType> {
        match &self.kind {
            FieldKind::Single(element) => Ok(element.clone()),
            FieldKind::OneOf(one_of) => one_of.resolve(selector.unwrap_or(&Value::Null)),
        }
    }

    /// Resolves the element type for `payload`. A one-of field with neither a
    /// selector nor a payload takes its first mapped type, so unset pairs stay null.
    pub fn resolve_element_for(
        &self,
        selector: Option<&Value>,
        payload: &Value,
    ) -> Result<ElementType> {
        match &self.kind {
            FieldKind::OneOf(one_of) if payload.is_null() && selector.is_none_or(Value::is_null) => {
                one_of.elements().next().cloned().ok_or_else(|| {
                    DomainError::Configuration(format!("one_of mapping for {} is empty", self.name))
                })
            }
            _ => self.resolve_element(selector),
        }
    }

    /// Runs the custom parser or the element coercion, then enforces `allow_none`.
    pub fn coerce(&self, element: &ElementType, value: Value) -> Result<Value> {
        let value = match self.parser {
            Some(parser) if !value.is_null() => parser(value)?,
            _ => element.coerce(value)?,
        };
        if value.is_null() && !self.allow_none {
            return Err(DomainError::validation(format!(
                "{} cannot be null",
                self.name
            )));
        }
        Ok(value)
    }

    /// Definition-time checks, run by schema builders.
    pub(crate) fn check_definition(&self, siblings: &[FieldInfo]) -> Result<()> {
        if self.mapped && self.many {
            return Err(DomainError::Configuration(format!(
                "{} cannot be both mapped and many",
                self.name
            )));
        }
        if self.primary_key && (self.many || self.mapped || self.is_entity()) {
            return Err(DomainError::Configuration(format!(
                "{} cannot be a primary key",
                self.name
            )));
        }
        if let FieldKind::OneOf(one_of) = &self.kind {
            if one_of.mapping.is_empty() {
                return Err(DomainError::Configuration(format!(
                    "one_of mapping for {} is empty",
                    self.name
                )));
            }
            let mut seen = BTreeSet::new();
            for (discriminant, _) in &one_of.mapping {
                if !seen.insert(discriminant.as_str()) {
                    return Err(DomainError::Configuration(format!(
                        "one_of mapping for {} repeats '{}'",
                        self.name, discriminant
                    )));
                }
            }
            let selector = siblings
                .iter()
                .find(|f| f.name == one_of.selector_key)
                .ok_or_else(|| {
                    DomainError::Configuration(format!(
                        "one_of selector '{}' for {} is not a declared attribute",
                        one_of.selector_key, self.name
                    ))
                })?;
            if selector.selector_key().is_some() || selector.many || selector.mapped {
                return Err(DomainError::Configuration(format!(
                    "one_of selector '{}' must be a plain scalar attribute",
                    one_of.selector_key
                )));
            }
            if let Some(ElementType::Enum(et)) = selector.element() {
                if let Some((bad, _)) = one_of.mapping.iter().find(|(d, _)| !et.contains(d)) {
                    return Err(DomainError::Configuration(format!(
                        "one_of mapping for {} uses '{}', which is not a {}",
                        self.name,
                        bad,
                        et.name()
                    )));
                }
            }
        }
        Ok(())
    }
}
