//! Composite values without identity.
//!
//! A [`ValueObject`] is frozen once built. Schemas flagged `mutable` produce
//! mutable value objects instead: writes are allowed and raise a dirty flag.

use crate::core::{DomainError, Result, Value};
use crate::types::constants::CoreDataType;
use crate::types::dirty::DirtyTrackable;
use crate::types::type_info::FieldInfo;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

static NULL: Value = Value::Null;

/// Hook run after a value object has been assembled, before it is frozen.
pub type ValueObjectCheck = fn(&ValueObject) -> Result<()>;

pub struct ValueObjectSchema {
    name: String,
    fields: Vec<FieldInfo>,
    mutable: bool,
    eq_keys: Option<Vec<String>>,
    check: Option<ValueObjectCheck>,
}

impl fmt::Debug for ValueObjectSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueObjectSchema")
            .field("name", &self.name)
            .field("mutable", &self.mutable)
            .field("fields", &self.fields.iter().map(FieldInfo::name).collect::<Vec<_>>())
            .finish()
    }
}

impl ValueObjectSchema {
    pub fn builder(name: impl Into<String>) -> ValueObjectSchemaBuilder {
        ValueObjectSchemaBuilder {
            name: name.into(),
            fields: Vec::new(),
            mutable: false,
            eq_keys: None,
            check: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn core_type(&self) -> CoreDataType {
        if self.mutable {
            CoreDataType::MutableValueObject
        } else {
            CoreDataType::ValueObject
        }
    }

    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name() == name)
    }
}

pub struct ValueObjectSchemaBuilder {
    name: String,
    fields: Vec<FieldInfo>,
    mutable: bool,
    eq_keys: Option<Vec<String>>,
    check: Option<ValueObjectCheck>,
}

impl ValueObjectSchemaBuilder {
    pub fn field(mut self, field: FieldInfo) -> Self {
        self.fields.push(field);
        self
    }

    pub fn mutable(mut self) -> Self {
        self.mutable = true;
        self
    }

    /// Restricts structural equality to the given fields.
    pub fn eq_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.eq_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn check(mut self, check: ValueObjectCheck) -> Self {
        self.check = Some(check);
        self
    }

    pub fn build(self) -> Result<Arc<ValueObjectSchema>> {
        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name() == field.name()) {
                return Err(DomainError::Configuration(format!(
                    "{} declares {} twice",
                    self.name,
                    field.name()
                )));
            }
            if field.is_entity() {
                return Err(DomainError::Configuration(format!(
                    "value object {} cannot hold entity attribute {}",
                    self.name,
                    field.name()
                )));
            }
            field.check_definition(&self.fields)?;
        }
        if let Some(keys) = &self.eq_keys {
            if let Some(bad) = keys.iter().find(|k| !self.fields.iter().any(|f| f.name() == *k)) {
                return Err(DomainError::Configuration(format!(
                    "{} compares on unknown field {}",
                    self.name, bad
                )));
            }
        }
        Ok(Arc::new(ValueObjectSchema {
            name: self.name,
            fields: self.fields,
            mutable: self.mutable,
            eq_keys: self.eq_keys,
            check: self.check,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct ValueObject {
    schema: Arc<ValueObjectSchema>,
    fields: BTreeMap<String, Value>,
    dirty: bool,
}

impl ValueObject {
    pub fn new(schema: &Arc<ValueObjectSchema>, mut kwargs: BTreeMap<String, Value>) -> Result<Self> {
        if let Some(unknown) = kwargs.keys().find(|k| schema.field(k).is_none()) {
            return Err(DomainError::validation(format!(
                "{} is an invalid keyword argument for {}",
                unknown, schema.name
            )));
        }
        let mut fields = BTreeMap::new();
        let (typed, plain): (Vec<&FieldInfo>, Vec<&FieldInfo>) = schema
            .fields
            .iter()
            .partition(|field| field.selector_key().is_some());
        for field in plain.into_iter().chain(typed) {
            let value = match kwargs.remove(field.name()) {
                Some(raw) => parse_field(schema, field, raw, &fields)?,
                None => missing_field(schema, field)?,
            };
            let value = if value.is_null() {
                field.get_default_value().unwrap_or(Value::Null)
            } else {
                value
            };
            if value.is_null() && !field.allow_none {
                return Err(DomainError::validation(format!(
                    "{} cannot be null for {}",
                    field.name(),
                    schema.name
                )));
            }
            fields.insert(field.name().to_string(), value);
        }
        let vo = Self {
            schema: Arc::clone(schema),
            fields,
            dirty: false,
        };
        if let Some(check) = schema.check {
            check(&vo)?;
        }
        Ok(vo)
    }

    /// Builds from a map, a JSON object, another value object, or a bare scalar
    /// when the schema has a single field.
    pub fn from_value(schema: &Arc<ValueObjectSchema>, value: Value) -> Result<Self> {
        match value {
            Value::Object(vo) if vo.schema.name == schema.name => Ok(vo),
            other if is_keyword_like(&other) => match other.into_keywords() {
                Some(kwargs) => Self::new(schema, kwargs),
                None => Err(DomainError::validation(format!(
                    "{} expects an object",
                    schema.name
                ))),
            },
            other => Self::from_scalar(schema, other),
        }
    }

    /// Single-field schemas accept their lone value directly.
    pub fn from_scalar(schema: &Arc<ValueObjectSchema>, value: Value) -> Result<Self> {
        match &schema.fields[..] {
            [only] => {
                let mut kwargs = BTreeMap::new();
                kwargs.insert(only.name().to_string(), value);
                Self::new(schema, kwargs)
            }
            _ => Err(DomainError::validation(format!(
                "{} cannot be built from a scalar",
                schema.name
            ))),
        }
    }

    pub fn schema(&self) -> &Arc<ValueObjectSchema> {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn is_mutable(&self) -> bool {
        self.schema.mutable
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Field value, `Null` for unknown names.
    pub fn value(&self, name: &str) -> &Value {
        self.fields.get(name).unwrap_or(&NULL)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.value(name).as_str()
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        if !self.schema.mutable {
            return Err(DomainError::InvalidState(format!(
                "cannot set attribute in value object {}",
                self.schema.name
            )));
        }
        let schema = Arc::clone(&self.schema);
        let field = schema.field(name).ok_or_else(|| {
            DomainError::validation(format!("{} has no attribute {}", schema.name, name))
        })?;
        let value = parse_field(&schema, field, value.into(), &self.fields)?;
        if value.is_null() && !field.allow_none {
            return Err(DomainError::validation(format!(
                "{} cannot be null for {}",
                name, schema.name
            )));
        }
        if self.fields.get(name) != Some(&value) {
            self.fields.insert(name.to_string(), value);
            self.dirty = true;
        }
        Ok(())
    }

    pub fn to_keywords(&self) -> BTreeMap<String, Value> {
        self.fields.clone()
    }

    pub fn data(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

fn parse_field(
    schema: &ValueObjectSchema,
    field: &FieldInfo,
    raw: Value,
    parsed: &BTreeMap<String, Value>,
) -> Result<Value> {
    let selector = field.selector_key().and_then(|key| parsed.get(key));
    let element = field.resolve_element_for(selector, &raw)?;
    if field.mapped {
        if raw.is_null() {
            return Ok(Value::Map(BTreeMap::new()));
        }
        let entries = raw.into_keywords().ok_or_else(|| {
            DomainError::validation(format!(
                "{} should be a map for {}",
                field.name(),
                schema.name
            ))
        })?;
        let entries = entries
            .into_iter()
            .map(|(k, v)| element.coerce(v).map(|v| (k, v)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        return Ok(Value::Map(entries));
    }
    if field.many {
        if raw.is_null() {
            return Ok(Value::List(Vec::new()));
        }
        let items = raw.into_items().ok_or_else(|| {
            DomainError::validation(format!(
                "{} should be a list for {}",
                field.name(),
                schema.name
            ))
        })?;
        let mut parsed_items: Vec<Value> = Vec::with_capacity(items.len());
        for item in items {
            let item = field.coerce(&element, item)?;
            if !(field.unique && parsed_items.contains(&item)) {
                parsed_items.push(item);
            }
        }
        return Ok(Value::List(parsed_items));
    }
    field.coerce(&element, raw)
}

fn is_keyword_like(value: &Value) -> bool {
    matches!(
        value,
        Value::Map(_) | Value::Object(_) | Value::Json(serde_json::Value::Object(_))
    )
}

fn missing_field(schema: &ValueObjectSchema, field: &FieldInfo) -> Result<Value> {
    if field.mapped {
        return Ok(Value::Map(BTreeMap::new()));
    }
    if field.many {
        return Ok(Value::List(Vec::new()));
    }
    if field.required && !field.has_default() {
        return Err(DomainError::validation(format!(
            "{} is a required field for {}",
            field.name(),
            schema.name
        )));
    }
    Ok(field.get_default_value().unwrap_or(Value::Null))
}

impl PartialEq for ValueObject {
    fn eq(&self, other: &Self) -> bool {
        if self.schema.name != other.schema.name {
            return false;
        }
        match &self.schema.eq_keys {
            Some(keys) => keys.iter().all(|k| self.fields.get(k) == other.fields.get(k)),
            None => self.fields == other.fields,
        }
    }
}

impl DirtyTrackable for ValueObject {
    fn is_dirty(&self) -> bool {
        self.schema.mutable
            && (self.dirty
                || self
                    .fields
                    .values()
                    .any(|v| matches!(v, Value::Object(vo) if vo.is_dirty())))
    }

    fn dirty(&mut self) -> Option<serde_json::Value> {
        if self.is_dirty() {
            Some(self.data())
        } else {
            None
        }
    }

    fn data(&self) -> serde_json::Value {
        ValueObject::data(self)
    }

    fn mark_persisted(&mut self) {
        self.dirty = false;
        for value in self.fields.values_mut() {
            if let Value::Object(vo) = value {
                vo.mark_persisted();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use serde_json::json;

    fn address() -> Arc<ValueObjectSchema> {
        ValueObjectSchema::builder("Address")
            .field(FieldInfo::string("city"))
            .field(FieldInfo::string("pin").optional())
            .field(FieldInfo::string("tags").many())
            .build()
            .unwrap()
    }

    #[test]
    fn test_required_field_missing() {
        let err = ValueObject::new(&address(), attrs! { "pin" => "560001" }).unwrap_err();
        assert!(err.to_string().contains("city is a required field"));
    }

    #[test]
    fn test_unknown_keyword_rejected() {
        assert!(ValueObject::new(&address(), attrs! { "city" => "Pune", "zip" => "1" }).is_err());
    }

    #[test]
    fn test_frozen_after_construction() {
        let mut vo = ValueObject::new(&address(), attrs! { "city" => "Pune" }).unwrap();
        assert!(matches!(vo.set("city", "Goa"), Err(DomainError::InvalidState(_))));
        assert_eq!(vo.data(), json!({"city": "Pune", "pin": null, "tags": []}));
    }

    #[test]
    fn test_mutable_tracks_writes() {
        let schema = ValueObjectSchema::builder("Preferences")
            .mutable()
            .field(FieldInfo::string("theme").default_value("light"))
            .build()
            .unwrap();
        let mut vo = ValueObject::new(&schema, attrs! {}).unwrap();
        assert!(!vo.is_dirty());
        vo.set("theme", "light").unwrap();
        assert!(!vo.is_dirty());
        vo.set("theme", "dark").unwrap();
        assert_eq!(vo.dirty(), Some(json!({"theme": "dark"})));
        vo.mark_persisted();
        assert!(vo.dirty().is_none());
    }

    #[test]
    fn test_eq_keys_limit_comparison() {
        let schema = ValueObjectSchema::builder("Tag")
            .field(FieldInfo::string("code"))
            .field(FieldInfo::string("label").optional())
            .eq_keys(["code"])
            .build()
            .unwrap();
        let a = ValueObject::new(&schema, attrs! { "code" => "x", "label" => "X" }).unwrap();
        let b = ValueObject::new(&schema, attrs! { "code" => "x" }).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_nested_from_json() {
        let outer = ValueObjectSchema::builder("Site")
            .field(FieldInfo::value_object("address", address()))
            .build()
            .unwrap();
        let vo = ValueObject::from_value(
            &outer,
            Value::Json(json!({"address": {"city": "Pune", "tags": ["a", "a"]}})),
        )
        .unwrap();
        assert_eq!(
            vo.value("address").as_object().unwrap().value("city"),
            &Value::from("Pune")
        );
    }

    #[test]
    fn test_entity_fields_rejected() {
        let entity = crate::types::entity::EntitySchema::builder("NoteEntity")
            .field(FieldInfo::string("note_id").primary_key())
            .build()
            .unwrap();
        let err = ValueObjectSchema::builder("Bad")
            .field(FieldInfo::entity("note", entity))
            .build()
            .unwrap_err();
        assert!(matches!(err, DomainError::Configuration(_)));
    }
}
