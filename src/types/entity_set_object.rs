use crate::common::id_generator::{extract_id_salt, simple_id_generator};
use crate::core::{DomainError, RequestContext, Result, Value};
use crate::types::constants::CoreDataType;
use crate::types::dirty::DirtyTrackable;
use crate::types::entity::{Entity, EntitySchema};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    New,
    Old,
    Deleted,
}

#[derive(Debug, Clone)]
struct EntitySetEntry {
    entity: Entity,
    state: EntryState,
}

/// Owned child entities keyed by their primary id, kept in insertion order.
///
/// Children added without a primary id get one from [`simple_id_generator`],
/// salted with a counter that stays above every numeric id suffix seen so far.
#[derive(Debug, Clone)]
pub struct EntitySetObject {
    schema: Arc<EntitySchema>,
    entries: Vec<EntitySetEntry>,
    max_id_salt: u64,
    id_parts: usize,
    context: RequestContext,
}

impl EntitySetObject {
    pub fn new(schema: Arc<EntitySchema>, id_parts: usize, context: RequestContext) -> Self {
        Self {
            schema,
            entries: Vec::new(),
            max_id_salt: 0,
            id_parts,
            context,
        }
    }

    /// Wraps children read from storage; they form the baseline.
    pub fn loaded(
        schema: Arc<EntitySchema>,
        items: Vec<Entity>,
        id_parts: usize,
        context: RequestContext,
    ) -> Result<Self> {
        let mut set = Self::new(schema, id_parts, context);
        for entity in items {
            set.check_type(&entity)?;
            let id = entity.primary_id();
            if set.position(&id).is_some() {
                return Err(DomainError::validation(format!(
                    "{} appears twice in {}",
                    id,
                    set.schema.class_name()
                )));
            }
            set.bump_salt(&id);
            set.entries.push(EntitySetEntry {
                entity,
                state: EntryState::Old,
            });
        }
        Ok(set)
    }

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    pub fn max_salt(&self) -> u64 {
        self.max_id_salt
    }

    pub fn get_next_id(&self) -> Result<String> {
        let salt = self.max_id_salt.checked_add(1).ok_or_else(|| {
            DomainError::validation(format!(
                "No ids left to generate for {}",
                self.schema.class_name()
            ))
        })?;
        Ok(simple_id_generator(salt, self.id_parts))
    }

    fn bump_salt(&mut self, id: &str) {
        self.max_id_salt = match extract_id_salt(id) {
            Some(salt) => self.max_id_salt.max(salt),
            None => self.max_id_salt.saturating_add(1),
        };
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.entity.primary_id() == id)
    }

    fn check_type(&self, entity: &Entity) -> Result<()> {
        if entity.schema().class_name() != self.schema.class_name() {
            return Err(DomainError::validation(format!(
                "Items can only be of type {} in EntitySetObject",
                self.schema.class_name()
            )));
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entries
            .iter()
            .find(|e| e.state != EntryState::Deleted && e.entity.primary_id() == id)
            .map(|e| &e.entity)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Entity> {
        self.entries
            .iter_mut()
            .find(|e| e.state != EntryState::Deleted && e.entity.primary_id() == id)
            .map(|e| &mut e.entity)
    }

    pub fn entry_state(&self, id: &str) -> Option<EntryState> {
        self.position(id).map(|i| self.entries[i].state)
    }

    /// Builds a child from keyword attributes, generating its id when absent.
    pub fn add(&mut self, mut kwargs: BTreeMap<String, Value>) -> Result<&mut Entity> {
        let pk = self.schema.primary_key().to_string();
        if kwargs.get(&pk).is_none_or(Value::is_empty) {
            kwargs.insert(pk, Value::Text(self.get_next_id()?));
        }
        let entity = Entity::new(&self.schema, kwargs, &self.context)?;
        self.add_entity(entity)
    }

    pub fn add_entity(&mut self, entity: Entity) -> Result<&mut Entity> {
        self.check_type(&entity)?;
        let id = entity.primary_id();
        let index = match self.position(&id) {
            Some(i) if self.entries[i].state == EntryState::Deleted => {
                self.entries[i] = EntitySetEntry {
                    entity,
                    state: EntryState::Old,
                };
                i
            }
            Some(_) => {
                return Err(DomainError::validation(format!(
                    "{} already present in the set",
                    id
                )));
            }
            None => {
                self.entries.push(EntitySetEntry {
                    entity,
                    state: EntryState::New,
                });
                self.entries.len() - 1
            }
        };
        self.bump_salt(&id);
        Ok(&mut self.entries[index].entity)
    }

    /// Drops a never-stored child outright; stored children are deleted in cascade
    /// and kept as tombstones until the next save.
    pub fn remove(&mut self, id: &str) -> Result<()> {
        let index = self
            .position(id)
            .filter(|i| self.entries[*i].state != EntryState::Deleted)
            .ok_or_else(|| DomainError::validation(format!("{} not present in the set", id)))?;
        if self.entries[index].state == EntryState::New {
            self.entries.remove(index);
        } else {
            let entry = &mut self.entries[index];
            entry.entity.delete();
            entry.state = EntryState::Deleted;
        }
        Ok(())
    }

    pub fn remove_missing(&mut self, keep: &BTreeSet<String>) -> Result<()> {
        let stale: Vec<String> = self
            .iter()
            .map(Entity::primary_id)
            .filter(|id| !keep.contains(id))
            .collect();
        for id in stale {
            self.remove(&id)?;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.retain(|e| e.state != EntryState::New);
        for entry in &mut self.entries {
            if entry.state != EntryState::Deleted {
                entry.entity.delete();
                entry.state = EntryState::Deleted;
            }
        }
    }

    /// Upserts each item by primary id, then removes children not mentioned.
    pub fn update(&mut self, value: Value) -> Result<()> {
        let items = value
            .into_items()
            .ok_or_else(|| DomainError::validation("entity set attributes take a list of items"))?;
        let pk = self.schema.primary_key().to_string();
        let mut keep = BTreeSet::new();
        for item in items {
            let kwargs = item.into_keywords().ok_or_else(|| {
                DomainError::validation(format!(
                    "{} items must be maps",
                    self.schema.class_name()
                ))
            })?;
            let existing = kwargs
                .get(&pk)
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
                .filter(|id| self.get(id).is_some());
            let id = match existing {
                Some(id) => {
                    if let Some(child) = self.get_mut(&id) {
                        child.update(kwargs)?;
                    }
                    id
                }
                None => self.add(kwargs)?.primary_id(),
            };
            keep.insert(id);
        }
        self.remove_missing(&keep)
    }

    pub fn delete(&mut self) {
        self.clear();
    }

    /// Live children.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entries
            .iter()
            .filter(|e| e.state != EntryState::Deleted)
            .map(|e| &e.entity)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.entries
            .iter_mut()
            .filter(|e| e.state != EntryState::Deleted)
            .map(|e| &mut e.entity)
    }

    /// Every child including tombstones, with its entry state.
    pub fn entries(&self) -> impl Iterator<Item = (&Entity, EntryState)> {
        self.entries.iter().map(|e| (&e.entity, e.state))
    }

    pub(crate) fn entities_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.entries.iter_mut().map(|e| &mut e.entity)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DirtyTrackable for EntitySetObject {
    fn is_dirty(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.state != EntryState::Old || e.entity.is_dirty())
    }

    fn dirty(&mut self) -> Option<serde_json::Value> {
        let mut added = Vec::new();
        let mut deleted = Vec::new();
        let mut updated = Vec::new();
        for entry in &mut self.entries {
            match entry.state {
                EntryState::New => added.push(entry.entity.data()),
                EntryState::Deleted => deleted.push(entry.entity.data()),
                EntryState::Old => {
                    if let Some(diff) = entry.entity.dirty() {
                        updated.push(diff);
                    }
                }
            }
        }
        if added.is_empty() && deleted.is_empty() && updated.is_empty() {
            return None;
        }
        Some(json!({
            "type": CoreDataType::EntityList,
            "data": { "deleted": deleted, "added": added, "updated": updated }
        }))
    }

    fn data(&self) -> serde_json::Value {
        serde_json::Value::Array(self.iter().map(Entity::data).collect())
    }

    fn mark_persisted(&mut self) {
        self.entries.retain(|e| e.state != EntryState::Deleted);
        for entry in &mut self.entries {
            entry.state = EntryState::Old;
            entry.entity.mark_persisted();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use crate::types::type_info::FieldInfo;

    fn line_schema() -> Arc<EntitySchema> {
        EntitySchema::builder("LineEntity")
            .field(FieldInfo::string("line_id").primary_key())
            .field(FieldInfo::integer("qty").default_value(1))
            .build()
            .unwrap()
    }

    fn empty_set() -> EntitySetObject {
        EntitySetObject::new(line_schema(), 2, RequestContext::default())
    }

    fn stored(ids: &[&str]) -> EntitySetObject {
        let schema = line_schema();
        let ctx = RequestContext::default();
        let items = ids
            .iter()
            .map(|id| Entity::new(&schema, attrs! { "line_id" => *id }, &ctx).unwrap())
            .collect();
        EntitySetObject::loaded(schema, items, 2, ctx).unwrap()
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let mut set = empty_set();
        let a = set.add(attrs! { "line_id" => Value::Null }).unwrap().primary_id();
        let b = set.add(attrs! { "line_id" => Value::Null }).unwrap().primary_id();
        assert_ne!(a, b);
        assert!(set.get(&a).is_some());
        assert!(set.get(&b).is_some());
    }

    #[test]
    fn test_salt_skips_past_external_suffix() {
        let mut set = stored(&["1-2-41"]);
        assert_eq!(set.max_salt(), 41);
        let id = set.add(attrs! {}).unwrap().primary_id();
        assert_eq!(extract_id_salt(&id), Some(42));
    }

    #[test]
    fn test_exhausted_salt_is_an_error() {
        let mut set = stored(&["ext-18446744073709551615", "plain"]);
        assert_eq!(set.max_salt(), u64::MAX);
        assert!(matches!(
            set.add(attrs! {}),
            Err(DomainError::Validation { .. })
        ));
        set.add(attrs! { "line_id" => "given" }).unwrap();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut set = stored(&["a"]);
        assert!(set.add(attrs! { "line_id" => "a" }).is_err());
    }

    #[test]
    fn test_remove_new_vs_stored() {
        let mut set = stored(&["a"]);
        let fresh = set.add(attrs! {}).unwrap().primary_id();
        set.remove(&fresh).unwrap();
        assert_eq!(set.entry_state(&fresh), None);

        set.remove("a").unwrap();
        assert_eq!(set.entry_state("a"), Some(EntryState::Deleted));
        assert!(set.get("a").is_none());
        assert!(set.entries().any(|(e, _)| e.is_deleted()));
        assert!(set.remove("a").is_err());
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_update_upserts_and_prunes() {
        let mut set = stored(&["a", "b"]);
        set.update(Value::List(vec![
            Value::Map(attrs! { "line_id" => "a", "qty" => 5 }),
            Value::Map(attrs! { "qty" => 2 }),
        ]))
        .unwrap();
        let dirty = set.dirty().unwrap();
        let data = &dirty["data"];
        assert_eq!(data["added"].as_array().unwrap().len(), 1);
        assert_eq!(data["deleted"][0]["line_id"], "b");
        assert_eq!(data["updated"][0]["data"]["qty"]["data"], json!({"old": 1, "new": 5}));

        set.mark_persisted();
        assert!(!set.is_dirty());
        assert_eq!(set.len(), 2);
    }
}
