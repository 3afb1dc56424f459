//! Versioned, dirty-tracked domain objects.
//!
//! An [`Entity`] is a schema-driven attribute bag. Every write goes through
//! [`Entity::set`] (or a container handle), which keeps a journal of the first old
//! value and the latest new value per attribute. The version is bumped at most
//! once between two persisted states, guarded by a latch that storage reopens
//! after each load or save.

use crate::common::value_objects::{ActionLog, ActionRequest};
use crate::core::{DomainError, RequestContext, Result, UserRole, Value};
use crate::types::base_enum::BaseEnum;
use crate::types::constants::CoreDataType;
use crate::types::dirty::DirtyTrackable;
use crate::types::entity_set_object::EntitySetObject;
use crate::types::list_object::ListObject;
use crate::types::map_object::MapObject;
use crate::types::set_object::SetObject;
use crate::types::state_machine::StateMachineDefinition;
use crate::types::type_info::{ElementType, FieldInfo};
use crate::types::value_object::ValueObject;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub const DELETED: &str = "deleted";
pub const VERSION: &str = "version";
pub const TENANT_ID: &str = "tenant_id";

static NULL: Value = Value::Null;

/// Aggregate-specific invariants checked before every save and update.
pub type EntityCheck = fn(&Entity) -> Result<()>;

/// A relationship attribute: a primary-key column of another entity.
#[derive(Debug, Clone)]
pub struct RelatedEntity {
    pub attribute: String,
    pub entity_name: String,
}

pub struct EntitySchema {
    class_name: String,
    entity_name: String,
    fields: Vec<FieldInfo>,
    primary_key: String,
    multi_tenant: bool,
    id_prefix: String,
    state_machine: Option<StateMachineDefinition>,
    check: Option<EntityCheck>,
    related: Vec<RelatedEntity>,
}

impl fmt::Debug for EntitySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitySchema")
            .field("class_name", &self.class_name)
            .field("entity_name", &self.entity_name)
            .field("primary_key", &self.primary_key)
            .field("multi_tenant", &self.multi_tenant)
            .finish()
    }
}

impl EntitySchema {
    pub fn builder(class_name: impl Into<String>) -> EntitySchemaBuilder {
        EntitySchemaBuilder {
            class_name: class_name.into(),
            entity_name: None,
            fields: Vec::new(),
            multi_tenant: false,
            id_prefix: String::new(),
            state_machine: None,
            check: None,
            related: Vec::new(),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Stable external name used for record mappings and domain events.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn is_multi_tenant(&self) -> bool {
        self.multi_tenant
    }

    pub fn id_prefix(&self) -> &str {
        &self.id_prefix
    }

    pub fn state_machine(&self) -> Option<&StateMachineDefinition> {
        self.state_machine.as_ref()
    }

    pub fn related_entities(&self) -> &[RelatedEntity] {
        &self.related
    }

    /// Entity-typed attributes and the schema of the children they hold.
    pub fn child_schemas(&self) -> Vec<(&FieldInfo, &Arc<EntitySchema>)> {
        self.fields
            .iter()
            .filter_map(|f| f.element().and_then(ElementType::entity_schema).map(|s| (f, s)))
            .collect()
    }
}

pub struct EntitySchemaBuilder {
    class_name: String,
    entity_name: Option<String>,
    fields: Vec<FieldInfo>,
    multi_tenant: bool,
    id_prefix: String,
    state_machine: Option<StateMachineDefinition>,
    check: Option<EntityCheck>,
    related: Vec<RelatedEntity>,
}

impl EntitySchemaBuilder {
    pub fn field(mut self, field: FieldInfo) -> Self {
        self.fields.push(field);
        self
    }

    pub fn multi_tenant(mut self) -> Self {
        self.multi_tenant = true;
        self
    }

    pub fn id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }

    pub fn entity_name(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }

    pub fn state_machine(mut self, definition: StateMachineDefinition) -> Self {
        self.state_machine = Some(definition);
        self
    }

    pub fn check(mut self, check: EntityCheck) -> Self {
        self.check = Some(check);
        self
    }

    /// Declares a string attribute holding the primary id of `related`.
    pub fn related(mut self, related: &EntitySchema) -> Self {
        self.fields.push(FieldInfo::string(related.primary_key()).optional());
        self.related.push(RelatedEntity {
            attribute: related.primary_key().to_string(),
            entity_name: related.entity_name().to_string(),
        });
        self
    }

    pub fn build(self) -> Result<Arc<EntitySchema>> {
        let entity_name = match self.entity_name {
            Some(name) => name,
            None => derive_entity_name(&self.class_name)?,
        };
        let mut fields = self.fields;
        for reserved in [DELETED, VERSION, TENANT_ID] {
            if fields.iter().any(|f| f.name() == reserved) {
                return Err(DomainError::Configuration(format!(
                    "{} cannot declare the reserved attribute {}",
                    self.class_name, reserved
                )));
            }
        }
        fields.push(FieldInfo::boolean(DELETED).default_value(false));
        fields.push(FieldInfo::integer(VERSION).default_value(1));
        if self.multi_tenant {
            fields.push(FieldInfo::string(TENANT_ID));
        }

        let mut primary_key = None;
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.name() == field.name()) {
                return Err(DomainError::Configuration(format!(
                    "{} declares {} twice",
                    self.class_name,
                    field.name()
                )));
            }
            field.check_definition(&fields)?;
            if field.is_entity() && (field.mapped || field.selector_key().is_some()) {
                return Err(DomainError::Configuration(format!(
                    "{}.{} must be a plain entity or entity set",
                    self.class_name,
                    field.name()
                )));
            }
            if field.primary_key {
                if primary_key.is_some() {
                    return Err(DomainError::Configuration(format!(
                        "{} can have only one primary key.",
                        self.class_name
                    )));
                }
                primary_key = Some(field.name().to_string());
            }
        }
        let primary_key = primary_key.ok_or_else(|| {
            DomainError::Configuration(format!("{} has no primary key defined.", self.class_name))
        })?;

        if let Some(machine) = &self.state_machine {
            let state_type = fields
                .iter()
                .find(|f| f.name() == machine.state_key())
                .and_then(FieldInfo::element);
            let Some(ElementType::Enum(states)) = state_type else {
                return Err(DomainError::Configuration(
                    "State machine key should be of type enum".into(),
                ));
            };
            for transition in machine.transitions() {
                let unknown = transition
                    .source
                    .iter()
                    .chain(std::iter::once(&transition.destination))
                    .find(|s| !states.contains(s));
                if let Some(state) = unknown {
                    return Err(DomainError::Configuration(format!(
                        "transition {} uses unknown state {}",
                        transition.trigger, state
                    )));
                }
            }
        }

        Ok(Arc::new(EntitySchema {
            class_name: self.class_name,
            entity_name,
            fields,
            primary_key,
            multi_tenant: self.multi_tenant,
            id_prefix: self.id_prefix,
            state_machine: self.state_machine,
            check: self.check,
            related: self.related,
        }))
    }
}

/// `JobAggregate` -> `job`, `RunLogEntity` -> `runlog`.
fn derive_entity_name(class_name: &str) -> Result<String> {
    ["Aggregate", "Entity"]
        .iter()
        .find_map(|suffix| class_name.strip_suffix(suffix))
        .filter(|stem| !stem.is_empty())
        .map(str::to_lowercase)
        .ok_or_else(|| {
            DomainError::Configuration(format!(
                "{} must end in Aggregate or Entity, or declare an entity name",
                class_name
            ))
        })
}

/// Storage for one attribute.
#[derive(Debug, Clone)]
pub enum Attr {
    Value(Value),
    List(ListObject),
    Set(SetObject),
    Map(MapObject),
    /// `None` when unset or when the owner was loaded shallow.
    Entity(Option<Box<Entity>>),
    /// `None` only on shallow entities.
    EntitySet(Option<EntitySetObject>),
}

impl Attr {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    fn is_dirty(&self) -> bool {
        match self {
            Self::Value(Value::Object(vo)) => vo.is_dirty(),
            Self::Value(_) => false,
            Self::List(list) => list.is_dirty(),
            Self::Set(set) => set.is_dirty(),
            Self::Map(map) => map.is_dirty(),
            Self::Entity(child) => child.as_ref().is_some_and(|c| c.is_dirty()),
            Self::EntitySet(set) => set.as_ref().is_some_and(|s| s.is_dirty()),
        }
    }

    fn dirty(&mut self) -> Option<serde_json::Value> {
        match self {
            Self::Value(Value::Object(vo)) => vo.dirty().map(|data| {
                json!({ "type": vo.schema().core_type(), "data": data })
            }),
            Self::Value(_) => None,
            Self::List(list) => list.dirty(),
            Self::Set(set) => set.dirty(),
            Self::Map(map) => map.dirty(),
            Self::Entity(child) => child.as_mut().and_then(|c| c.dirty()),
            Self::EntitySet(set) => set.as_mut().and_then(|s| s.dirty()),
        }
    }

    fn data(&self) -> serde_json::Value {
        match self {
            Self::Value(v) => v.to_json(),
            Self::List(list) => list.data(),
            Self::Set(set) => set.data(),
            Self::Map(map) => map.data(),
            Self::Entity(Some(child)) => child.data(),
            Self::EntitySet(Some(set)) => set.data(),
            Self::Entity(None) | Self::EntitySet(None) => serde_json::Value::Null,
        }
    }

    fn mark_persisted(&mut self) {
        match self {
            Self::Value(Value::Object(vo)) => vo.mark_persisted(),
            Self::Value(_) => {}
            Self::List(list) => list.mark_persisted(),
            Self::Set(set) => set.mark_persisted(),
            Self::Map(map) => map.mark_persisted(),
            Self::Entity(child) => {
                if let Some(child) = child {
                    child.mark_persisted();
                }
            }
            Self::EntitySet(set) => {
                if let Some(set) = set {
                    set.mark_persisted();
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub core_type: CoreDataType,
    pub old: Value,
    pub new: Value,
}

impl JournalEntry {
    pub fn data(&self) -> serde_json::Value {
        json!({
            "type": self.core_type,
            "data": { "old": self.old.to_json(), "new": self.new.to_json() }
        })
    }
}

#[derive(Debug, Clone)]
pub struct Entity {
    schema: Arc<EntitySchema>,
    attrs: BTreeMap<String, Attr>,
    journal: BTreeMap<String, JournalEntry>,
    version_updated: bool,
    shallow: bool,
    action_requests: Vec<ActionRequest>,
    action_log: Vec<ActionLog>,
    context: RequestContext,
}

impl Entity {
    pub fn new(
        schema: &Arc<EntitySchema>,
        kwargs: BTreeMap<String, Value>,
        context: &RequestContext,
    ) -> Result<Self> {
        Self::build(schema, kwargs, context, false)
    }

    /// Read-only projection without children; entity attributes stay empty.
    pub fn new_shallow(
        schema: &Arc<EntitySchema>,
        kwargs: BTreeMap<String, Value>,
        context: &RequestContext,
    ) -> Result<Self> {
        Self::build(schema, kwargs, context, true)
    }

    fn build(
        schema: &Arc<EntitySchema>,
        mut kwargs: BTreeMap<String, Value>,
        context: &RequestContext,
        shallow: bool,
    ) -> Result<Self> {
        if let Some(unknown) = kwargs.keys().find(|k| schema.field(k).is_none()) {
            return Err(DomainError::InvalidState(format!(
                "Entity {} got invalid keyword argument: {}",
                schema.class_name, unknown
            )));
        }
        let mut entity = Self {
            schema: Arc::clone(schema),
            attrs: BTreeMap::new(),
            journal: BTreeMap::new(),
            version_updated: true,
            shallow,
            action_requests: Vec::new(),
            action_log: Vec::new(),
            context: context.clone(),
        };
        // one-of fields resolve against selectors, so those are built first
        let (typed, plain): (Vec<&FieldInfo>, Vec<&FieldInfo>) = schema
            .fields
            .iter()
            .partition(|field| field.selector_key().is_some());
        for field in plain.into_iter().chain(typed) {
            let attr = match kwargs.remove(field.name()) {
                Some(raw) => entity.build_attr(field, raw)?,
                None => entity.default_attr(field)?,
            };
            entity.attrs.insert(field.name().to_string(), attr);
        }
        Ok(entity)
    }

    fn id_parts(&self, field: &FieldInfo) -> usize {
        field
            .id_parts_override()
            .unwrap_or_else(|| self.context.entity_set_id_parts())
    }

    fn build_attr(&self, field: &FieldInfo, raw: Value) -> Result<Attr> {
        if let Some(child_schema) = field.element().and_then(ElementType::entity_schema) {
            if field.many {
                if self.shallow {
                    return Ok(Attr::EntitySet(None));
                }
                let mut set = EntitySetObject::new(
                    Arc::clone(child_schema),
                    self.id_parts(field),
                    self.context.clone(),
                );
                if !raw.is_null() {
                    set.update(raw)?;
                }
                return Ok(Attr::EntitySet(Some(set)));
            }
            if raw.is_null() || self.shallow {
                self.check_child_presence(field, raw.is_null())?;
                return Ok(Attr::Entity(None));
            }
            let kwargs = raw.into_keywords().ok_or_else(|| {
                DomainError::validation(format!(
                    "{} is invalid value for {} for {}",
                    child_schema.class_name,
                    field.name(),
                    self.schema.class_name
                ))
            })?;
            let child = Entity::new(child_schema, kwargs, &self.context)?;
            return Ok(Attr::Entity(Some(Box::new(child))));
        }
        let element = field.resolve_element_for(self.selector_for(field), &raw)?;
        if field.many {
            let items = if raw.is_null() {
                Vec::new()
            } else {
                raw.into_items().ok_or_else(|| {
                    DomainError::validation(format!("{} takes a list of items", field.name()))
                })?
            };
            return if field.unique {
                SetObject::with_items(element, items).map(Attr::Set)
            } else {
                ListObject::with_items(element, items).map(Attr::List)
            };
        }
        if field.mapped {
            let entries = if raw.is_null() {
                BTreeMap::new()
            } else {
                raw.into_keywords().ok_or_else(|| {
                    DomainError::validation(format!("{} takes a map of values", field.name()))
                })?
            };
            return MapObject::with_items(element, entries).map(Attr::Map);
        }
        let value = field.coerce(&element, raw)?;
        let value = match (value.is_null(), field.get_default_value()) {
            (true, Some(default)) => field.coerce(&element, default)?,
            _ => value,
        };
        Ok(Attr::Value(value))
    }

    fn default_attr(&self, field: &FieldInfo) -> Result<Attr> {
        if let Some(child_schema) = field.element().and_then(ElementType::entity_schema) {
            if field.many {
                return Ok(Attr::EntitySet((!self.shallow).then(|| {
                    EntitySetObject::new(
                        Arc::clone(child_schema),
                        self.id_parts(field),
                        self.context.clone(),
                    )
                })));
            }
            return Ok(Attr::Entity(None));
        }
        if field.many || field.mapped {
            return self.build_attr(field, Value::Null);
        }
        if field.name() == TENANT_ID {
            return Ok(Attr::Value(Value::Text(self.context.tenant_id().to_string())));
        }
        match field.get_default_value() {
            Some(default) => {
                let element = field.resolve_element(self.selector_for(field))?;
                Ok(Attr::Value(field.coerce(&element, default)?))
            }
            None => Ok(Attr::Value(Value::Null)),
        }
    }

    fn check_child_presence(&self, field: &FieldInfo, missing: bool) -> Result<()> {
        if missing && !field.allow_none && !self.shallow {
            return Err(DomainError::validation(format!(
                "{} cannot be none for {}",
                field.name(),
                self.schema.class_name
            )));
        }
        Ok(())
    }

    fn selector_for(&self, field: &FieldInfo) -> Option<&Value> {
        field
            .selector_key()
            .and_then(|key| self.attrs.get(key))
            .and_then(Attr::as_value)
    }

    // ---- identity ----------------------------------------------------------

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    pub fn class_name(&self) -> &str {
        &self.schema.class_name
    }

    pub fn entity_name(&self) -> &str {
        &self.schema.entity_name
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn primary_key(&self) -> &str {
        &self.schema.primary_key
    }

    pub fn primary_value(&self) -> &Value {
        self.value(&self.schema.primary_key)
    }

    /// Primary key value rendered as a string (empty when unset).
    pub fn primary_id(&self) -> String {
        match self.primary_value() {
            Value::Null => String::new(),
            value => value.to_string(),
        }
    }

    pub fn primary_data(&self) -> BTreeMap<String, Value> {
        let mut data = BTreeMap::new();
        data.insert(self.schema.primary_key.clone(), self.primary_value().clone());
        data
    }

    pub fn version(&self) -> i64 {
        self.value(VERSION).as_i64().unwrap_or(1)
    }

    pub fn is_deleted(&self) -> bool {
        self.value(DELETED).as_bool().unwrap_or(false)
    }

    pub fn tenant_id(&self) -> Option<&str> {
        if self.schema.multi_tenant {
            self.value(TENANT_ID).as_str()
        } else {
            None
        }
    }

    pub fn is_shallow(&self) -> bool {
        self.shallow
    }

    // ---- reads -------------------------------------------------------------

    pub fn attr(&self, name: &str) -> Option<&Attr> {
        self.attrs.get(name)
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&FieldInfo, &Attr)> {
        self.schema
            .fields
            .iter()
            .filter_map(|f| self.attrs.get(f.name()).map(|a| (f, a)))
    }

    /// Scalar attribute value; `Null` for containers, children and unknown names.
    pub fn value(&self, name: &str) -> &Value {
        self.attrs
            .get(name)
            .and_then(Attr::as_value)
            .unwrap_or(&NULL)
    }

    pub fn get(&self, name: &str) -> Result<&Value> {
        match self.attrs.get(name) {
            Some(Attr::Value(v)) => Ok(v),
            Some(_) => Err(DomainError::InvalidState(format!(
                "{}.{} is not a scalar attribute",
                self.schema.class_name, name
            ))),
            None => Err(self.unknown(name)),
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.value(name).as_str()
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.value(name).as_i64()
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.value(name).as_bool()
    }

    pub fn get_timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        self.value(name).as_timestamp()
    }

    pub fn get_enum<E: BaseEnum>(&self, name: &str) -> Result<E> {
        let raw = self.value(name).as_str().ok_or_else(|| {
            DomainError::InvalidState(format!("{}.{} is not set", self.schema.class_name, name))
        })?;
        E::parse(raw)
    }

    /// Attribute as a plain value; containers are materialized.
    pub fn value_of(&self, name: &str) -> Result<Value> {
        match self.attrs.get(name) {
            Some(Attr::Value(v)) => Ok(v.clone()),
            Some(Attr::List(list)) => Ok(list.to_value()),
            Some(Attr::Set(set)) => Ok(set.to_value()),
            Some(Attr::Map(map)) => Ok(map.to_value()),
            Some(_) => Err(DomainError::InvalidState(format!(
                "{}.{} holds entities",
                self.schema.class_name, name
            ))),
            None => Err(self.unknown(name)),
        }
    }

    pub fn state(&self) -> Option<&str> {
        self.schema
            .state_machine
            .as_ref()
            .and_then(|m| self.value(m.state_key()).as_str())
    }

    pub fn changes(&self) -> &BTreeMap<String, JournalEntry> {
        &self.journal
    }

    fn unknown(&self, name: &str) -> DomainError {
        DomainError::validation(format!(
            "{} has no attribute {}",
            self.schema.class_name, name
        ))
    }

    // ---- container and child handles ---------------------------------------

    pub fn list(&self, name: &str) -> Result<&ListObject> {
        match self.attrs.get(name) {
            Some(Attr::List(list)) => Ok(list),
            _ => Err(self.wrong_kind(name, "list")),
        }
    }

    pub fn list_mut(&mut self, name: &str) -> Result<&mut ListObject> {
        let err = self.wrong_kind(name, "list");
        match self.attrs.get_mut(name) {
            Some(Attr::List(list)) => Ok(list),
            _ => Err(err),
        }
    }

    pub fn set_object(&self, name: &str) -> Result<&SetObject> {
        match self.attrs.get(name) {
            Some(Attr::Set(set)) => Ok(set),
            _ => Err(self.wrong_kind(name, "set")),
        }
    }

    pub fn set_object_mut(&mut self, name: &str) -> Result<&mut SetObject> {
        let err = self.wrong_kind(name, "set");
        match self.attrs.get_mut(name) {
            Some(Attr::Set(set)) => Ok(set),
            _ => Err(err),
        }
    }

    pub fn map(&self, name: &str) -> Result<&MapObject> {
        match self.attrs.get(name) {
            Some(Attr::Map(map)) => Ok(map),
            _ => Err(self.wrong_kind(name, "map")),
        }
    }

    pub fn map_mut(&mut self, name: &str) -> Result<&mut MapObject> {
        let err = self.wrong_kind(name, "map");
        match self.attrs.get_mut(name) {
            Some(Attr::Map(map)) => Ok(map),
            _ => Err(err),
        }
    }

    pub fn child(&self, name: &str) -> Result<Option<&Entity>> {
        match self.attrs.get(name) {
            Some(Attr::Entity(child)) => Ok(child.as_deref()),
            _ => Err(self.wrong_kind(name, "entity")),
        }
    }

    pub fn child_mut(&mut self, name: &str) -> Result<Option<&mut Entity>> {
        let err = self.wrong_kind(name, "entity");
        match self.attrs.get_mut(name) {
            Some(Attr::Entity(child)) => Ok(child.as_deref_mut()),
            _ => Err(err),
        }
    }

    pub fn entity_set(&self, name: &str) -> Result<&EntitySetObject> {
        match self.attrs.get(name) {
            Some(Attr::EntitySet(Some(set))) => Ok(set),
            Some(Attr::EntitySet(None)) => Err(self.shallow_error()),
            _ => Err(self.wrong_kind(name, "entity set")),
        }
    }

    pub fn entity_set_mut(&mut self, name: &str) -> Result<&mut EntitySetObject> {
        let shallow = self.shallow_error();
        let err = self.wrong_kind(name, "entity set");
        match self.attrs.get_mut(name) {
            Some(Attr::EntitySet(Some(set))) => Ok(set),
            Some(Attr::EntitySet(None)) => Err(shallow),
            _ => Err(err),
        }
    }

    /// In-place access to a mutable value object attribute.
    pub fn value_object_mut(&mut self, name: &str) -> Result<&mut ValueObject> {
        let err = self.wrong_kind(name, "mutable value object");
        match self.attrs.get_mut(name) {
            Some(Attr::Value(Value::Object(vo))) if vo.is_mutable() => Ok(vo),
            _ => Err(err),
        }
    }

    fn wrong_kind(&self, name: &str, kind: &str) -> DomainError {
        DomainError::InvalidState(format!(
            "{}.{} is not a {} attribute",
            self.schema.class_name, name, kind
        ))
    }

    fn shallow_error(&self) -> DomainError {
        DomainError::InvalidState(format!(
            "Cannot update value of {} as its shallow",
            self.schema.class_name
        ))
    }

    /// Sets a child entity on an empty entity attribute.
    pub fn attach(&mut self, name: &str, child: Entity) -> Result<()> {
        if self.shallow {
            return Err(self.shallow_error());
        }
        let err = self.wrong_kind(name, "entity");
        let class_name = self.schema.class_name.clone();
        match self.attrs.get_mut(name) {
            Some(Attr::Entity(slot @ None)) => {
                *slot = Some(Box::new(child));
                Ok(())
            }
            Some(Attr::Entity(Some(_))) => Err(DomainError::InvalidState(format!(
                "Cannot update value of entity attribute {} in {}",
                name, class_name
            ))),
            _ => Err(err),
        }
    }

    /// Installs children read from storage without recording a change.
    pub(crate) fn install_child(&mut self, name: &str, child: Option<Entity>) {
        self.attrs
            .insert(name.to_string(), Attr::Entity(child.map(Box::new)));
    }

    pub(crate) fn install_children(&mut self, name: &str, set: EntitySetObject) {
        self.attrs.insert(name.to_string(), Attr::EntitySet(Some(set)));
    }

    // ---- writes ------------------------------------------------------------

    /// Assigns an attribute, journaling the change.
    ///
    /// Container attributes are updated in place by diff. The version is
    /// read-only, entity attributes that already hold a child cannot be
    /// replaced, and the state of a state-machine entity only moves through
    /// [`Entity::act`].
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if name == VERSION {
            return Err(DomainError::InvalidState(
                "version is a read-only attribute".into(),
            ));
        }
        let schema = Arc::clone(&self.schema);
        let field = schema.field(name).ok_or_else(|| self.unknown(name))?;
        if name == DELETED {
            let deleted = field.coerce(&ElementType::Bool, value)?;
            self.attrs.insert(DELETED.to_string(), Attr::Value(deleted));
            return Ok(());
        }
        if schema
            .state_machine
            .as_ref()
            .is_some_and(|m| m.state_key() == name)
        {
            return Err(DomainError::InvalidState(format!(
                "{} changes only through act()",
                name
            )));
        }
        if self.shallow && field.is_entity() {
            return Err(self.shallow_error());
        }
        let err = self.wrong_kind(name, "scalar");
        let outcome = match self.attrs.get_mut(name) {
            Some(Attr::Entity(Some(_))) => Err(DomainError::InvalidState(format!(
                "Cannot update value of entity attribute {} in {}",
                name, schema.class_name
            ))),
            Some(Attr::Entity(None)) => {
                if value.is_null() {
                    return Ok(());
                }
                let child_schema = field
                    .element()
                    .and_then(ElementType::entity_schema)
                    .ok_or(err)?;
                let kwargs = value.into_keywords().ok_or_else(|| {
                    DomainError::validation(format!("{} takes a map of attributes", name))
                })?;
                let child = Entity::new(child_schema, kwargs, &self.context)?;
                self.attach(name, child)
            }
            Some(Attr::List(list)) => list.update(value),
            Some(Attr::Set(set)) => set.update(value),
            Some(Attr::Map(map)) => map.update(value),
            Some(Attr::EntitySet(Some(set))) => set.update(value),
            Some(Attr::EntitySet(None)) => Err(self.shallow_error()),
            Some(Attr::Value(_)) => {
                let element = field.resolve_element_for(self.selector_for(field), &value)?;
                let value = field.coerce(&element, value)?;
                self.write_value(name, element.core_type(), value);
                Ok(())
            }
            None => Err(err),
        };
        if outcome.is_ok() {
            self.update_version(false);
        }
        outcome
    }

    fn write_value(&mut self, name: &str, core_type: CoreDataType, new: Value) {
        let Some(Attr::Value(current)) = self.attrs.get_mut(name) else {
            return;
        };
        if *current == new {
            return;
        }
        let old = std::mem::replace(current, new.clone());
        match self.journal.get_mut(name) {
            Some(entry) if entry.old == new => {
                self.journal.remove(name);
            }
            Some(entry) => entry.new = new,
            None => {
                self.journal.insert(
                    name.to_string(),
                    JournalEntry { core_type, old, new },
                );
            }
        }
        self.update_version(false);
    }

    pub fn update(&mut self, values: BTreeMap<String, Value>) -> Result<()> {
        for (name, value) in values {
            self.set(&name, value)?;
        }
        Ok(())
    }

    /// Changes a one-of selector and the attribute it types in one step.
    pub fn update_one_of(
        &mut self,
        selector: (&str, Value),
        attribute: (&str, Value),
    ) -> Result<()> {
        let field = self
            .schema
            .field(attribute.0)
            .ok_or_else(|| self.unknown(attribute.0))?;
        if field.selector_key() != Some(selector.0) {
            return Err(DomainError::validation(format!(
                "{} is not typed by {}",
                attribute.0, selector.0
            )));
        }
        let element = field.resolve_element(Some(&selector.1))?;
        let value = field.coerce(&element, attribute.1)?;
        self.set(selector.0, selector.1)?;
        self.set(attribute.0, value)
    }

    // ---- versioning --------------------------------------------------------

    /// Bumps the version once per dirty episode.
    pub fn update_version(&mut self, force: bool) {
        if !self.version_updated && (force || self.is_dirty()) {
            let next = self.version() + 1;
            self.attrs
                .insert(VERSION.to_string(), Attr::Value(Value::Integer(next)));
            self.version_updated = true;
        }
    }

    pub fn get_latest_version(&mut self) -> i64 {
        self.update_version(false);
        self.version()
    }

    /// Reopens the version latch on this entity and every owned child.
    pub fn reset_version_lock(&mut self) {
        self.version_updated = false;
        for attr in self.attrs.values_mut() {
            match attr {
                Attr::Entity(Some(child)) => child.reset_version_lock(),
                Attr::EntitySet(Some(set)) => {
                    for child in set.entities_mut() {
                        child.reset_version_lock();
                    }
                }
                _ => {}
            }
        }
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Marks this entity and everything it owns as deleted.
    pub fn delete(&mut self) {
        self.attrs
            .insert(DELETED.to_string(), Attr::Value(Value::Boolean(true)));
        for attr in self.attrs.values_mut() {
            match attr {
                Attr::Entity(Some(child)) => child.delete(),
                Attr::EntitySet(Some(set)) => set.delete(),
                _ => {}
            }
        }
    }

    /// Required attributes are set, then the schema check runs, then children.
    pub fn validate(&self) -> Result<()> {
        for (field, attr) in self.attrs() {
            if let Attr::Value(Value::Null) = attr {
                if field.required && !field.has_default() {
                    return Err(DomainError::validation(format!(
                        "{} is a required field for {}",
                        field.name(),
                        self.schema.class_name
                    )));
                }
            }
        }
        if let Some(check) = self.schema.check {
            check(self)?;
        }
        for attr in self.attrs.values() {
            match attr {
                Attr::Entity(Some(child)) => child.validate()?,
                Attr::EntitySet(Some(set)) => {
                    for child in set.iter() {
                        child.validate()?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ---- actions -----------------------------------------------------------

    /// Fires a state-machine trigger on behalf of a user holding `user_roles`.
    pub fn act(&mut self, request: ActionRequest, user_roles: &[UserRole]) -> Result<()> {
        self.action_requests.push(request.clone());
        let schema = Arc::clone(&self.schema);
        let definition = schema.state_machine.as_ref().ok_or_else(|| {
            DomainError::InvalidState(format!(
                "{} has no state machine",
                schema.class_name
            ))
        })?;
        let old_state = self
            .value(definition.state_key())
            .as_str()
            .unwrap_or_default()
            .to_string();
        let mut machine = definition.machine(old_state.clone());
        if !machine.is_authorised(&request.action, user_roles)? {
            return Err(DomainError::Authorization(
                "User does not have the right privileges.".into(),
            ));
        }
        let new_state = machine
            .fire(&request.action)
            .map_err(|err| {
                DomainError::validation_with("Invalid state transition", err.to_string())
            })?
            .to_string();
        self.write_value(
            definition.state_key(),
            CoreDataType::Enum,
            Value::Text(new_state.clone()),
        );
        self.action_log.push(ActionLog {
            action_request: request.data(),
            old_state,
            new_state,
        });
        Ok(())
    }

    pub fn action_requests(&self) -> &[ActionRequest] {
        &self.action_requests
    }

    pub fn action_log(&self) -> &[ActionLog] {
        &self.action_log
    }

    pub fn has_actions(&self) -> bool {
        !self.action_requests.is_empty()
    }

    pub fn get_actions_update(&mut self) -> serde_json::Value {
        json!({
            "actions": self.action_log.iter().map(ActionLog::data).collect::<Vec<_>>(),
            "requests": self.action_requests.iter().map(ActionRequest::data).collect::<Vec<_>>(),
            "update": self.dirty(),
        })
    }
}

impl DirtyTrackable for Entity {
    fn is_dirty(&self) -> bool {
        !self.journal.is_empty() || self.attrs.values().any(Attr::is_dirty)
    }

    /// `{id, type: "entity", name, data: {attr: diff}}`. Settles the pending
    /// version bump.
    fn dirty(&mut self) -> Option<serde_json::Value> {
        let mut data = serde_json::Map::new();
        for field in &self.schema.fields {
            let name = field.name();
            if let Some(entry) = self.journal.get(name) {
                data.insert(name.to_string(), entry.data());
            } else if let Some(diff) = self.attrs.get_mut(name).and_then(Attr::dirty) {
                data.insert(name.to_string(), diff);
            }
        }
        if data.is_empty() {
            return None;
        }
        self.update_version(true);
        Some(json!({
            "id": self.primary_value().to_json(),
            "type": CoreDataType::Entity,
            "name": self.schema.entity_name,
            "data": data,
        }))
    }

    fn data(&self) -> serde_json::Value {
        let mut data = serde_json::Map::new();
        for (field, attr) in self.attrs() {
            if field.hidden || field.name() == DELETED {
                continue;
            }
            data.insert(field.name().to_string(), attr.data());
        }
        if let Some(definition) = &self.schema.state_machine {
            let state = self.value(definition.state_key()).as_str().unwrap_or_default();
            let machine = definition.machine(state);
            data.insert(
                "transitions".to_string(),
                serde_json::Value::Array(
                    machine
                        .visible_transitions()
                        .into_iter()
                        .map(|t| t.data())
                        .collect(),
                ),
            );
        }
        serde_json::Value::Object(data)
    }

    fn mark_persisted(&mut self) {
        self.journal.clear();
        for attr in self.attrs.values_mut() {
            attr.mark_persisted();
        }
        self.version_updated = false;
    }
}

/// Typed handle over an [`Entity`] with a fixed schema.
pub trait Aggregate: Sized + Send + Sync + 'static {
    fn schema() -> Result<Arc<EntitySchema>>;

    fn from_entity(entity: Entity) -> Result<Self>;

    fn entity(&self) -> &Entity;

    fn entity_mut(&mut self) -> &mut Entity;

    fn into_entity(self) -> Entity;

    fn create(kwargs: BTreeMap<String, Value>, context: &RequestContext) -> Result<Self> {
        let entity = Entity::new(&Self::schema()?, kwargs, context)?;
        Self::from_entity(entity)
    }
}

/// Declares a newtype [`Aggregate`] over [`Entity`] whose schema is built once by
/// the given function.
///
/// ```
/// use dddkit::types::{EntitySchema, FieldInfo};
/// use std::sync::Arc;
///
/// fn note_schema() -> dddkit::Result<Arc<EntitySchema>> {
///     EntitySchema::builder("NoteAggregate")
///         .field(FieldInfo::string("note_id").primary_key())
///         .build()
/// }
///
/// dddkit::aggregate! {
///     pub struct NoteAggregate => note_schema;
/// }
/// ```
#[macro_export]
macro_rules! aggregate {
    ($(#[$meta:meta])* $vis:vis struct $name:ident => $schema:path;) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name($crate::types::Entity);

        impl $crate::types::Aggregate for $name {
            fn schema() -> $crate::core::Result<::std::sync::Arc<$crate::types::EntitySchema>> {
                $crate::lazy_static::lazy_static! {
                    static ref SCHEMA: $crate::core::Result<
                        ::std::sync::Arc<$crate::types::EntitySchema>,
                    > = $schema();
                }
                SCHEMA.clone()
            }

            fn from_entity(entity: $crate::types::Entity) -> $crate::core::Result<Self> {
                let schema = <Self as $crate::types::Aggregate>::schema()?;
                if entity.class_name() != schema.class_name() {
                    return Err($crate::core::DomainError::InvalidState(format!(
                        "{} cannot wrap a {}",
                        schema.class_name(),
                        entity.class_name()
                    )));
                }
                Ok(Self(entity))
            }

            fn entity(&self) -> &$crate::types::Entity {
                &self.0
            }

            fn entity_mut(&mut self) -> &mut $crate::types::Entity {
                &mut self.0
            }

            fn into_entity(self) -> $crate::types::Entity {
                self.0
            }
        }

        impl ::std::ops::Deref for $name {
            type Target = $crate::types::Entity;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl ::std::ops::DerefMut for $name {
            fn deref_mut(&mut self) -> &mut Self::Target {
                &mut self.0
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use crate::types::state_machine::StateTransition;

    crate::base_enum! {
        enum TicketStatus {
            Open = "open",
            Closed = "closed",
        }
    }

    crate::base_enum! {
        enum TicketAction {
            Close = "close",
            Reopen = "reopen",
        }
    }

    fn comment_schema() -> Arc<EntitySchema> {
        EntitySchema::builder("CommentEntity")
            .field(FieldInfo::string("comment_id").primary_key())
            .field(FieldInfo::string("body").optional())
            .build()
            .unwrap()
    }

    fn ticket_schema() -> Arc<EntitySchema> {
        EntitySchema::builder("TicketAggregate")
            .multi_tenant()
            .field(FieldInfo::string("ticket_id").primary_key())
            .field(FieldInfo::string("title"))
            .field(
                FieldInfo::enumeration("status", TicketStatus::enum_type())
                    .default_value(TicketStatus::Open),
            )
            .field(FieldInfo::string("labels").unique())
            .field(FieldInfo::string("secret").optional().hidden())
            .field(FieldInfo::entity_set("comments", comment_schema()))
            .state_machine(
                StateMachineDefinition::new("status")
                    .transition(StateTransition::new(
                        TicketAction::Close,
                        &[TicketStatus::Open],
                        TicketStatus::Closed,
                    ))
                    .transition(
                        StateTransition::new(
                            TicketAction::Reopen,
                            &[TicketStatus::Closed],
                            TicketStatus::Open,
                        )
                        .roles(["support"]),
                    ),
            )
            .build()
            .unwrap()
    }

    fn ticket() -> Entity {
        let ctx = RequestContext::new("T1");
        let mut entity = Entity::new(
            &ticket_schema(),
            attrs! { "ticket_id" => "t-1", "title" => "Broken" },
            &ctx,
        )
        .unwrap();
        entity.mark_persisted();
        entity
    }

    #[test]
    fn test_entity_name_derivation() {
        assert_eq!(ticket_schema().entity_name(), "ticket");
        assert_eq!(comment_schema().entity_name(), "comment");
        let err = EntitySchema::builder("Ticket")
            .field(FieldInfo::string("id").primary_key())
            .build()
            .unwrap_err();
        assert!(matches!(err, DomainError::Configuration(_)));
        let named = EntitySchema::builder("Ticket")
            .entity_name("ticket_v2")
            .field(FieldInfo::string("id").primary_key())
            .build()
            .unwrap();
        assert_eq!(named.entity_name(), "ticket_v2");
    }

    #[test]
    fn test_exactly_one_primary_key() {
        let none = EntitySchema::builder("NoKeyEntity")
            .field(FieldInfo::string("a"))
            .build();
        assert!(none.is_err());
        let two = EntitySchema::builder("TwoKeyEntity")
            .field(FieldInfo::string("a").primary_key())
            .field(FieldInfo::string("b").primary_key())
            .build();
        assert!(two.is_err());
    }

    #[test]
    fn test_construction_fills_implicit_attributes() {
        let entity = ticket();
        assert_eq!(entity.version(), 1);
        assert!(!entity.is_deleted());
        assert_eq!(entity.tenant_id(), Some("T1"));
        assert_eq!(entity.get_str("status"), Some("open"));
        assert!(entity.entity_set("comments").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_keyword_is_invalid_state() {
        let err = Entity::new(
            &ticket_schema(),
            attrs! { "ticket_id" => "t", "nope" => 1 },
            &RequestContext::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn test_journal_keeps_first_old_value() {
        let mut entity = ticket();
        entity.set("title", "Still broken").unwrap();
        entity.set("title", "Fixed?").unwrap();
        let entry = &entity.changes()["title"];
        assert_eq!(entry.old, Value::from("Broken"));
        assert_eq!(entry.new, Value::from("Fixed?"));
        entity.set("title", "Broken").unwrap();
        assert!(entity.changes().is_empty());
    }

    #[test]
    fn test_version_bumps_once_per_episode() {
        let mut entity = ticket();
        entity.set("title", "a").unwrap();
        entity.set("title", "b").unwrap();
        entity.set("labels", Value::List(vec!["x".into()])).unwrap();
        assert_eq!(entity.version(), 2);
        entity.dirty();
        assert_eq!(entity.version(), 2);
    }

    #[test]
    fn test_read_only_and_guarded_attributes() {
        let mut entity = ticket();
        assert!(matches!(entity.set("version", 5), Err(DomainError::InvalidState(_))));
        assert!(matches!(entity.set("status", "closed"), Err(DomainError::InvalidState(_))));
        assert!(entity.changes().is_empty());
        assert_eq!(entity.version(), 1);
    }

    #[test]
    fn test_container_assignment_delegates_to_update() {
        let mut entity = ticket();
        entity
            .set("labels", Value::List(vec!["ui".into(), "ui".into()]))
            .unwrap();
        assert_eq!(entity.set_object("labels").unwrap().len(), 1);
        assert!(entity.changes().is_empty());
        let dirty = entity.dirty().unwrap();
        assert_eq!(dirty["data"]["labels"]["data"]["added"], json!(["ui"]));
    }

    #[test]
    fn test_dirty_none_when_clean() {
        let mut entity = ticket();
        assert!(entity.dirty().is_none());
        assert_eq!(entity.version(), 1);
    }

    #[test]
    fn test_data_projection() {
        let mut entity = ticket();
        entity.set("secret", "s3cr3t").unwrap();
        let data = entity.data();
        assert!(data.get("secret").is_none());
        assert!(data.get("deleted").is_none());
        assert_eq!(data["transitions"][0]["trigger"], "close");
        assert_eq!(data["transitions"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_cascades() {
        let mut entity = ticket();
        entity
            .entity_set_mut("comments")
            .unwrap()
            .add(attrs! { "body" => "first" })
            .unwrap();
        entity.mark_persisted();
        entity.delete();
        assert!(entity.is_deleted());
        let comments = entity.entity_set("comments").unwrap();
        assert!(comments.is_empty());
        assert!(comments.entries().all(|(c, _)| c.is_deleted()));
    }

    #[test]
    fn test_act_records_single_log_entry() {
        let mut entity = ticket();
        entity.act(ActionRequest::new(TicketAction::Close), &[]).unwrap();
        assert_eq!(entity.get_str("status"), Some("closed"));
        assert_eq!(entity.action_log().len(), 1);
        assert_eq!(entity.action_log()[0].old_state, "open");
        assert!(entity.has_actions());

        let err = entity
            .act(ActionRequest::new(TicketAction::Close), &[])
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation { .. }));

        let err = entity
            .act(ActionRequest::new(TicketAction::Reopen), &[UserRole::new("guest")])
            .unwrap_err();
        assert!(matches!(err, DomainError::Authorization(_)));
        assert_eq!(entity.get_str("status"), Some("closed"));
        assert_eq!(entity.action_log().len(), 1);
        assert_eq!(entity.action_requests().len(), 3);
    }

    #[test]
    fn test_validate_requires_fields() {
        let entity = Entity::new(
            &ticket_schema(),
            attrs! { "ticket_id" => "t-2" },
            &RequestContext::default(),
        )
        .unwrap();
        let err = entity.validate().unwrap_err();
        assert!(err.to_string().contains("title is a required field"));
    }

    #[test]
    fn test_shallow_rejects_child_writes() {
        let mut entity = Entity::new_shallow(
            &ticket_schema(),
            attrs! { "ticket_id" => "t-3", "title" => "x" },
            &RequestContext::default(),
        )
        .unwrap();
        assert!(entity.entity_set("comments").is_err());
        assert!(entity.set("comments", Value::List(vec![])).is_err());
    }
}
