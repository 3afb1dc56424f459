use crate::core::{DomainError, Result, Value};
use crate::types::constants::CoreDataType;
use crate::types::dirty::DirtyTrackable;
use crate::types::type_info::ElementType;
use serde_json::json;

/// Ordered collection that remembers what was added and removed since load.
#[derive(Debug, Clone)]
pub struct ListObject {
    element: ElementType,
    items: Vec<Value>,
    new_entries: Vec<Value>,
    deleted_entries: Vec<Value>,
}

impl ListObject {
    pub fn new(element: ElementType) -> Self {
        Self {
            element,
            items: Vec::new(),
            new_entries: Vec::new(),
            deleted_entries: Vec::new(),
        }
    }

    /// Builds a clean list; the given items form the baseline.
    pub fn with_items(element: ElementType, items: Vec<Value>) -> Result<Self> {
        let mut list = Self::new(element);
        for item in items {
            let item = list.element.coerce(item)?;
            list.items.push(item);
        }
        Ok(list)
    }

    pub fn element(&self) -> &ElementType {
        &self.element
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    pub fn contains(&self, item: &Value) -> bool {
        self.items.contains(item)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.items.iter()
    }

    pub fn list(&self) -> &[Value] {
        &self.items
    }

    pub fn add(&mut self, item: impl Into<Value>) -> Result<()> {
        let item = self.element.coerce(item.into())?;
        match self.deleted_entries.iter().position(|d| d == &item) {
            Some(pos) => {
                self.deleted_entries.remove(pos);
            }
            None => self.new_entries.push(item.clone()),
        }
        self.items.push(item);
        Ok(())
    }

    pub fn remove(&mut self, item: impl Into<Value>) -> Result<()> {
        let item = self.element.coerce(item.into())?;
        let pos = self
            .items
            .iter()
            .position(|i| i == &item)
            .ok_or_else(|| DomainError::validation(format!("{} not present in the list", item)))?;
        self.items.remove(pos);
        match self.new_entries.iter().position(|n| n == &item) {
            Some(new_pos) => {
                self.new_entries.remove(new_pos);
            }
            None => self.deleted_entries.push(item),
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        for item in std::mem::take(&mut self.items) {
            match self.new_entries.iter().position(|n| n == &item) {
                Some(pos) => {
                    self.new_entries.remove(pos);
                }
                None => self.deleted_entries.push(item),
            }
        }
    }

    /// Replaces the contents, tracking the difference item by item.
    pub fn update(&mut self, value: Value) -> Result<()> {
        let items = value
            .into_items()
            .ok_or_else(|| DomainError::validation("list attributes take a list of items"))?;
        let items = items
            .into_iter()
            .map(|item| self.element.coerce(item))
            .collect::<Result<Vec<_>>>()?;
        self.clear();
        for item in items {
            self.add(item)?;
        }
        Ok(())
    }

    pub fn added(&self) -> &[Value] {
        &self.new_entries
    }

    pub fn deleted(&self) -> &[Value] {
        &self.deleted_entries
    }

    pub fn to_value(&self) -> Value {
        Value::List(self.items.clone())
    }
}

impl DirtyTrackable for ListObject {
    fn is_dirty(&self) -> bool {
        !self.new_entries.is_empty() || !self.deleted_entries.is_empty()
    }

    fn dirty(&mut self) -> Option<serde_json::Value> {
        if !self.is_dirty() {
            return None;
        }
        Some(json!({
            "type": CoreDataType::List,
            "data": {
                "deleted": self.deleted_entries.iter().map(Value::to_json).collect::<Vec<_>>(),
                "added": self.new_entries.iter().map(Value::to_json).collect::<Vec<_>>(),
            }
        }))
    }

    fn data(&self) -> serde_json::Value {
        serde_json::Value::Array(self.items.iter().map(Value::to_json).collect())
    }

    fn mark_persisted(&mut self) {
        self.new_entries.clear();
        self.deleted_entries.clear();
    }
}
