use crate::core::{ConversionErrorCode, DomainError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A scalar list attribute stored one item per row in its own table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListAttributeInfo {
    pub table: String,
    /// Column holding the item; the remaining columns are the owner's keys.
    pub data_key: String,
}

/// How one entity class is laid out in storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMapping {
    table: String,
    exclude_keys: BTreeSet<String>,
    list_attributes: BTreeMap<String, ListAttributeInfo>,
}

impl RecordMapping {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            exclude_keys: BTreeSet::new(),
            list_attributes: BTreeMap::new(),
        }
    }

    /// Attribute that is never written to or read from the row.
    pub fn exclude(mut self, key: impl Into<String>) -> Self {
        self.exclude_keys.insert(key.into());
        self
    }

    pub fn list_attribute(
        mut self,
        attribute: impl Into<String>,
        table: impl Into<String>,
        data_key: impl Into<String>,
    ) -> Self {
        self.list_attributes.insert(
            attribute.into(),
            ListAttributeInfo {
                table: table.into(),
                data_key: data_key.into(),
            },
        );
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_excluded(&self, key: &str) -> bool {
        self.exclude_keys.contains(key)
    }

    pub fn exclude_keys(&self) -> &BTreeSet<String> {
        &self.exclude_keys
    }

    pub fn list_attribute_info(&self, attribute: &str) -> Option<&ListAttributeInfo> {
        self.list_attributes.get(attribute)
    }

    pub fn list_attributes(&self) -> impl Iterator<Item = (&String, &ListAttributeInfo)> {
        self.list_attributes.iter()
    }
}

/// Entity class name to record layout.
#[derive(Debug, Clone, Default)]
pub struct EntityMap {
    mappings: HashMap<String, RecordMapping>,
}

impl EntityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, class_name: impl Into<String>, mapping: RecordMapping) -> Self {
        self.insert(class_name, mapping);
        self
    }

    /// Returns the mapping previously registered under the name, if any.
    pub fn insert(
        &mut self,
        class_name: impl Into<String>,
        mapping: RecordMapping,
    ) -> Option<RecordMapping> {
        self.mappings.insert(class_name.into(), mapping)
    }

    pub fn get(&self, class_name: &str) -> Result<&RecordMapping> {
        self.mappings.get(class_name).ok_or_else(|| {
            DomainError::conversion(
                ConversionErrorCode::MapMissing,
                format!("No record mapping registered for {}", class_name),
            )
        })
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.mappings.contains_key(class_name)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_mapping_is_conversion_error() {
        let map = EntityMap::new().with("JobAggregate", RecordMapping::new("job"));
        assert_eq!(map.get("JobAggregate").unwrap().table(), "job");
        assert!(matches!(
            map.get("RecurringJobAggregate"),
            Err(DomainError::Conversion {
                code: ConversionErrorCode::MapMissing,
                ..
            })
        ));
    }

    #[test]
    fn test_mapping_builder() {
        let mapping = RecordMapping::new("ticket")
            .exclude("comments_cache")
            .list_attribute("tags", "ticket_tag", "tag");
        assert!(mapping.is_excluded("comments_cache"));
        assert_eq!(mapping.list_attribute_info("tags").unwrap().data_key, "tag");
        assert!(mapping.list_attribute_info("labels").is_none());
    }
}
