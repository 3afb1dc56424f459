use crate::core::{DomainError, Result, Value};
use crate::types::constants::CoreDataType;
use crate::types::dirty::DirtyTrackable;
use crate::types::type_info::ElementType;
use serde_json::json;

/// Deduplicated collection diffed against the set it held when loaded.
///
/// The baseline only moves in [`DirtyTrackable::mark_persisted`], so calling
/// `dirty()` repeatedly yields the same diff.
#[derive(Debug, Clone)]
pub struct SetObject {
    element: ElementType,
    items: Vec<Value>,
    baseline: Vec<Value>,
}

impl SetObject {
    pub fn new(element: ElementType) -> Self {
        Self {
            element,
            items: Vec::new(),
            baseline: Vec::new(),
        }
    }

    pub fn with_items(element: ElementType, items: Vec<Value>) -> Result<Self> {
        let mut set = Self::new(element);
        for item in items {
            let item = set.element.coerce(item)?;
            if !set.items.contains(&item) {
                set.items.push(item);
            }
        }
        set.baseline = set.items.clone();
        Ok(set)
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

    pub fn contains(&self, item: &Value) -> bool {
        self.items.contains(item)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.items.iter()
    }

    pub fn list(&self) -> &[Value] {
        &self.items
    }

    /// Sets have no positional access.
    pub fn get(&self, _index: usize) -> Result<&Value> {
        Err(DomainError::InvalidState(
            "get is not a valid function in set object".into(),
        ))
    }

    pub fn add(&mut self, item: impl Into<Value>) -> Result<()> {
        let item = self.element.coerce(item.into())?;
        if !self.items.contains(&item) {
            self.items.push(item);
        }
        Ok(())
    }

    /// Swaps an equal item for the given one.
    pub fn replace(&mut self, item: impl Into<Value>) -> Result<()> {
        let item = self.element.coerce(item.into())?;
        self.items.retain(|i| i != &item);
        self.items.push(item);
        Ok(())
    }

    pub fn remove(&mut self, item: impl Into<Value>) -> Result<()> {
        let item = self.element.coerce(item.into())?;
        let before = self.items.len();
        self.items.retain(|i| i != &item);
        if self.items.len() == before {
            return Err(DomainError::validation(format!(
                "{} not present in the set",
                item
            )));
        }
        Ok(())
    }

    pub fn discard(&mut self, item: &Value) {
        self.items.retain(|i| i != item);
    }

    pub fn is_subset(&self, other: &[Value]) -> bool {
        self.items.iter().all(|i| other.contains(i))
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn update(&mut self, value: Value) -> Result<()> {
        let items = value
            .into_items()
            .ok_or_else(|| DomainError::validation("set attributes take a list of items"))?;
        let mut next = Vec::with_capacity(items.len());
        for item in items {
            let item = self.element.coerce(item)?;
            if !next.contains(&item) {
                next.push(item);
            }
        }
        self.items = next;
        Ok(())
    }

    pub fn added(&self) -> Vec<&Value> {
        self.items
            .iter()
            .filter(|i| !self.baseline.contains(i))
            .collect()
    }

    pub fn removed(&self) -> Vec<&Value> {
        self.baseline
            .iter()
            .filter(|i| !self.items.contains(i))
            .collect()
    }

    pub fn to_value(&self) -> Value {
        Value::List(self.items.clone())
    }
}

impl DirtyTrackable for SetObject {
    fn is_dirty(&self) -> bool {
        !self.added().is_empty() || !self.removed().is_empty()
    }

    fn dirty(&mut self) -> Option<serde_json::Value> {
        let added = self.added();
        let removed = self.removed();
        if added.is_empty() && removed.is_empty() {
            return None;
        }
        Some(json!({
            "type": CoreDataType::Set,
            "data": {
                "added": added.into_iter().map(Value::to_json).collect::<Vec<_>>(),
                "removed": removed.into_iter().map(Value::to_json).collect::<Vec<_>>(),
            }
        }))
    }

    fn data(&self) -> serde_json::Value {
        serde_json::Value::Array(self.items.iter().map(Value::to_json).collect())
    }

    fn mark_persisted(&mut self) {
        self.baseline = self.items.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles() -> SetObject {
        SetObject::with_items(ElementType::Str, vec!["admin".into(), "ops".into()]).unwrap()
    }

    #[test]
    fn test_duplicates_collapse() {
        let mut set = roles();
        set.add("admin").unwrap();
        assert_eq!(set.len(), 2);
        assert!(!set.is_dirty());
    }

    #[test]
    fn test_diff_is_stable_until_persisted() {
        let mut set = roles();
        set.add("audit").unwrap();
        set.remove("ops").unwrap();
        let first = set.dirty().unwrap();
        let second = set.dirty().unwrap();
        assert_eq!(first, second);
        assert_eq!(first["data"]["added"], json!(["audit"]));
        assert_eq!(first["data"]["removed"], json!(["ops"]));

        set.mark_persisted();
        assert!(set.dirty().is_none());
    }

    #[test]
    fn test_remove_missing_fails_but_discard_does_not() {
        let mut set = roles();
        assert!(set.remove("nobody").is_err());
        set.discard(&Value::from("nobody"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_get_is_not_supported() {
        assert!(matches!(roles().get(0), Err(DomainError::InvalidState(_))));
    }

    #[test]
    fn test_update_back_to_baseline_is_clean() {
        let mut set = roles();
        set.update(Value::List(vec!["ops".into()])).unwrap();
        assert!(set.is_dirty());
        set.update(Value::List(vec!["ops".into(), "admin".into()])).unwrap();
        assert!(!set.is_dirty());
    }
}
