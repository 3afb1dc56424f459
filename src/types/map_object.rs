use crate::core::{DomainError, Result, Value};
use crate::types::constants::CoreDataType;
use crate::types::dirty::DirtyTrackable;
use crate::types::type_info::ElementType;
use serde_json::json;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapEntryState {
    New,
    Old,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
struct MapEntry {
    state: MapEntryState,
    /// Current value; `None` once deleted.
    value: Option<Value>,
    /// Value held at load time, kept for `Updated` and `Deleted` entries.
    original: Option<Value>,
    /// Value the key held when it was deleted.
    removed: Option<Value>,
}

/// String-keyed container with per-key change state.
#[derive(Debug, Clone)]
pub struct MapObject {
    element: ElementType,
    entries: BTreeMap<String, MapEntry>,
}

impl MapObject {
    pub fn new(element: ElementType) -> Self {
        Self {
            element,
            entries: BTreeMap::new(),
        }
    }

    pub fn with_items(element: ElementType, items: BTreeMap<String, Value>) -> Result<Self> {
        let mut map = Self::new(element);
        for (key, value) in items {
            let value = map.element.coerce(value)?;
            map.entries.insert(
                key,
                MapEntry {
                    state: MapEntryState::Old,
                    value: Some(value),
                    original: None,
                    removed: None,
                },
            );
        }
        Ok(map)
    }

    pub fn element(&self) -> &ElementType {
        &self.element
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).and_then(|e| e.value.as_ref())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn entry_state(&self, key: &str) -> Option<MapEntryState> {
        self.entries.get(key).map(|e| e.state)
    }

    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| e.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.iter().map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries
            .iter()
            .filter_map(|(k, e)| e.value.as_ref().map(|v| (k.as_str(), v)))
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        let value = self.element.coerce(value.into())?;
        match self.entries.get_mut(&key) {
            None => {
                self.entries.insert(
                    key,
                    MapEntry {
                        state: MapEntryState::New,
                        value: Some(value),
                        original: None,
                        removed: None,
                    },
                );
            }
            Some(entry) => match entry.state {
                MapEntryState::New => entry.value = Some(value),
                MapEntryState::Old => {
                    if entry.value.as_ref() != Some(&value) {
                        entry.original = entry.value.replace(value);
                        entry.state = MapEntryState::Updated;
                    }
                }
                MapEntryState::Updated | MapEntryState::Deleted => {
                    entry.removed = None;
                    if entry.original.as_ref() == Some(&value) {
                        entry.value = entry.original.take();
                        entry.state = MapEntryState::Old;
                    } else {
                        entry.value = Some(value);
                        entry.state = MapEntryState::Updated;
                    }
                }
            },
        }
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Result<Value> {
        let state = self
            .entries
            .get(key)
            .filter(|e| e.value.is_some())
            .map(|e| e.state)
            .ok_or_else(|| DomainError::validation(format!("{} not present in the map", key)))?;
        if state == MapEntryState::New {
            let removed = self.entries.remove(key).and_then(|e| e.value);
            return Ok(removed.unwrap_or(Value::Null));
        }
        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(Value::Null);
        };
        match state {
            MapEntryState::New => Ok(Value::Null),
            MapEntryState::Old => {
                entry.state = MapEntryState::Deleted;
                entry.original = entry.value.take();
                entry.removed = entry.original.clone();
                Ok(entry.original.clone().unwrap_or(Value::Null))
            }
            MapEntryState::Updated | MapEntryState::Deleted => {
                entry.state = MapEntryState::Deleted;
                entry.removed = entry.value.take();
                Ok(entry.removed.clone().unwrap_or(Value::Null))
            }
        }
    }

    /// Sets every incoming key and deletes the ones that are missing.
    pub fn update(&mut self, value: Value) -> Result<()> {
        let incoming = value
            .into_keywords()
            .ok_or_else(|| DomainError::validation("mapped attributes take a map of values"))?;
        let stale: Vec<String> = self
            .keys()
            .filter(|k| !incoming.contains_key(*k))
            .map(str::to_string)
            .collect();
        for (key, value) in incoming {
            self.set(key, value)?;
        }
        for key in stale {
            self.delete(&key)?;
        }
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        let keys: Vec<String> = self.keys().map(str::to_string).collect();
        for key in keys {
            self.delete(&key)?;
        }
        Ok(())
    }

    pub fn to_value(&self) -> Value {
        Value::Map(
            self.iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }
}

fn json_or_null(value: Option<&Value>) -> serde_json::Value {
    value.map(Value::to_json).unwrap_or(serde_json::Value::Null)
}

impl DirtyTrackable for MapObject {
    fn is_dirty(&self) -> bool {
        self.entries
            .values()
            .any(|e| e.state != MapEntryState::Old)
    }

    fn dirty(&mut self) -> Option<serde_json::Value> {
        if !self.is_dirty() {
            return None;
        }
        let mut added = serde_json::Map::new();
        let mut updated = serde_json::Map::new();
        let mut deleted = serde_json::Map::new();
        for (key, entry) in &self.entries {
            let old = match entry.state {
                MapEntryState::Deleted => entry.removed.as_ref(),
                _ => entry.original.as_ref(),
            };
            let change = json!({
                "old": json_or_null(old),
                "new": json_or_null(entry.value.as_ref()),
            });
            match entry.state {
                MapEntryState::New => {
                    added.insert(key.clone(), change);
                }
                MapEntryState::Updated => {
                    updated.insert(key.clone(), change);
                }
                MapEntryState::Deleted => {
                    deleted.insert(key.clone(), change);
                }
                MapEntryState::Old => {}
            }
        }
        Some(json!({
            "type": CoreDataType::Map,
            "data": { "deleted": deleted, "added": added, "updated": updated }
        }))
    }

    fn data(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.iter()
                .map(|(k, v)| (k.to_string(), v.to_json()))
                .collect(),
        )
    }

    fn mark_persisted(&mut self) {
        self.entries.retain(|_, e| e.state != MapEntryState::Deleted);
        for entry in self.entries.values_mut() {
            entry.state = MapEntryState::Old;
            entry.original = None;
            entry.removed = None;
        }
    }
}
