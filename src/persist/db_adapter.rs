//! Bidirectional mapping between entity graphs and flat records.
//!
//! Writing walks the graph and emits one record per entity. Child records
//! carry the primary-key columns of every ancestor so they can be found again
//! by the root id. Scalar list attributes registered as list attributes live
//! in their own tables, one row per item, and are written by diffing against
//! the rows already stored.
//!
//! Loading reads the root rows, prefetches every descendant table with one
//! query per table keyed by the root ids, and assembles children from that
//! index.

use super::entity_map::{EntityMap, ListAttributeInfo};
use super::session::Session;
use crate::core::{ConversionErrorCode, DomainError, RequestContext, Result, Value};
use crate::storage::{Filter, QueryOptions, Record, TableSchema};
use crate::types::entity::{DELETED, TENANT_ID};
use crate::types::{Attr, Entity, EntitySchema, EntitySetObject, EntryState};
use async_recursion::async_recursion;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{Level, event};

/// Row locking requested by a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    None,
    ForUpdate,
    ForUpdateNowait,
}

impl LockMode {
    pub fn for_update(nowait: bool) -> Self {
        if nowait {
            Self::ForUpdateNowait
        } else {
            Self::ForUpdate
        }
    }

    pub fn is_locking(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Which roots to load and how.
#[derive(Debug, Clone, Default)]
pub struct AggregateQuery {
    pub filter: Filter,
    pub options: QueryOptions,
    pub lock: LockMode,
    pub shallow: bool,
}

impl AggregateQuery {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn lock(mut self, lock: LockMode) -> Self {
        self.lock = lock;
        self
    }

    pub fn shallow(mut self, shallow: bool) -> Self {
        self.shallow = shallow;
        self
    }
}

type IndexKey = (String, BTreeMap<String, String>);

/// Prefetched descendant records, grouped by class and ancestor keys.
#[derive(Debug, Default)]
struct RecordIndex {
    records: HashMap<IndexKey, Vec<Record>>,
}

impl RecordIndex {
    fn key(class_name: &str, columns: &[String], record: &Record) -> IndexKey {
        let keys = columns
            .iter()
            .map(|c| (c.clone(), record.get(c).to_string()))
            .collect();
        (class_name.to_string(), keys)
    }

    fn owner_key(class_name: &str, owner_keys: &BTreeMap<String, Value>) -> IndexKey {
        let keys = owner_keys
            .iter()
            .map(|(c, v)| (c.clone(), v.to_string()))
            .collect();
        (class_name.to_string(), keys)
    }

    fn push(&mut self, key: IndexKey, record: Record) {
        self.records.entry(key).or_default().push(record);
    }

    fn get(&self, key: &IndexKey) -> &[Record] {
        self.records.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

struct LoadScope<'a> {
    session: &'a dyn Session,
    context: &'a RequestContext,
    index: &'a RecordIndex,
    shallow: bool,
}

pub struct DbAdapter {
    entity_map: Arc<EntityMap>,
}

impl DbAdapter {
    pub fn new(entity_map: Arc<EntityMap>) -> Self {
        Self { entity_map }
    }

    pub fn entity_map(&self) -> &EntityMap {
        &self.entity_map
    }

    /// Table holding rows of the given entity class.
    pub fn table_for(&self, class_name: &str) -> Result<&str> {
        Ok(self.entity_map.get(class_name)?.table())
    }

    /// Table of the aggregate plus the filter every root query starts from:
    /// the request tenant for multi-tenant aggregates and `deleted = false`
    /// on soft-delete tables.
    pub async fn root_scope(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        schema: &EntitySchema,
    ) -> Result<(TableSchema, Filter)> {
        let table = session.table_schema(self.table_for(schema.class_name())?).await?;
        let mut filter = Filter::new();
        if schema.is_multi_tenant() {
            filter = filter.eq(TENANT_ID, context.tenant_id());
        }
        if table.is_soft_delete() {
            filter = filter.eq(DELETED, false);
        }
        Ok((table, filter))
    }

    // ---- entity -> records -------------------------------------------------

    /// Flattens an entity graph into records. Rows removed from hard-delete
    /// tables are deleted through the session as a side effect.
    pub async fn to_records(&self, session: &dyn Session, entity: &Entity) -> Result<Vec<Record>> {
        let records = self
            .entity_records(session, entity, &BTreeMap::new())
            .await
            .map_err(conversion_failure)?;
        event!(
            Level::DEBUG,
            entity = entity.class_name(),
            id = %entity.primary_id(),
            records = records.len(),
            "entity flattened"
        );
        Ok(records)
    }

    #[async_recursion]
    async fn entity_records(
        &self,
        session: &dyn Session,
        entity: &Entity,
        parent_keys: &BTreeMap<String, Value>,
    ) -> Result<Vec<Record>> {
        let mapping = self.entity_map.get(entity.class_name())?;
        let mut owner_keys = entity.primary_data();
        owner_keys.extend(parent_keys.clone());

        let mut record = Record::from_values(mapping.table(), parent_keys.clone());
        let mut records = Vec::new();

        for (field, attr) in entity.attrs() {
            let name = field.name();
            if mapping.is_excluded(name) {
                continue;
            }
            if let Some(info) = mapping.list_attribute_info(name) {
                let items = entity.value_of(name)?.into_items().unwrap_or_default();
                records.extend(self.list_records(session, info, items, &owner_keys).await?);
                continue;
            }
            match attr {
                Attr::Entity(None) | Attr::EntitySet(None) => {}
                Attr::Entity(Some(child)) => {
                    records.extend(self.entity_records(session, child, &owner_keys).await?);
                }
                Attr::EntitySet(Some(set)) => {
                    records.extend(self.entity_set_records(session, set, &owner_keys).await?);
                }
                _ => record.set(name, make_db_ready(entity.value_of(name)?)),
            }
        }

        records.push(record);
        Ok(records)
    }

    async fn entity_set_records(
        &self,
        session: &dyn Session,
        set: &EntitySetObject,
        owner_keys: &BTreeMap<String, Value>,
    ) -> Result<Vec<Record>> {
        let table = self.table_for(set.schema().class_name())?;
        let soft_delete = session.table_schema(table).await?.is_soft_delete();

        let mut records = Vec::new();
        for (child, state) in set.entries() {
            let child_records = self.entity_records(session, child, owner_keys).await?;
            if state == EntryState::Deleted && !soft_delete {
                for record in &child_records {
                    session.delete(record).await?;
                }
            } else {
                records.extend(child_records);
            }
        }
        Ok(records)
    }

    async fn list_records(
        &self,
        session: &dyn Session,
        info: &ListAttributeInfo,
        items: Vec<Value>,
        owner_keys: &BTreeMap<String, Value>,
    ) -> Result<Vec<Record>> {
        let soft_delete = session.table_schema(&info.table).await?.is_soft_delete();
        let current = self.list_data(session, info, owner_keys).await?;

        let mut pending = items;
        let mut records = Vec::new();
        for entry in current {
            if let Some(position) = pending.iter().position(|item| *item == entry) {
                pending.remove(position);
                continue;
            }
            let record = list_record(info, owner_keys, entry);
            if soft_delete {
                records.push(record.with(DELETED, true));
            } else {
                session.delete(&record).await?;
            }
        }
        for entry in pending {
            let record = list_record(info, owner_keys, entry);
            records.push(if soft_delete {
                record.with(DELETED, false)
            } else {
                record
            });
        }
        Ok(records)
    }

    /// Stored items of a list attribute for one owner.
    async fn list_data(
        &self,
        session: &dyn Session,
        info: &ListAttributeInfo,
        owner_keys: &BTreeMap<String, Value>,
    ) -> Result<Vec<Value>> {
        let mut filter = Filter::from_columns(owner_keys.iter());
        if session.table_schema(&info.table).await?.is_soft_delete() {
            filter = filter.eq(DELETED, false);
        }
        let records = session
            .query(&info.table, &filter, &QueryOptions::new())
            .await?;
        Ok(records
            .into_iter()
            .map(|mut r| r.remove(&info.data_key).unwrap_or(Value::Null))
            .collect())
    }

    // ---- records -> entity -------------------------------------------------

    pub async fn load_aggregate(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        schema: &Arc<EntitySchema>,
        id: &str,
        lock: LockMode,
        shallow: bool,
    ) -> Result<Entity> {
        let query = AggregateQuery::new(Filter::new().eq(schema.primary_key(), id))
            .lock(lock)
            .shallow(shallow);
        let mut entities = self.load_aggregates(session, context, schema, query).await?;
        if entities.len() > 1 {
            return Err(DomainError::validation(format!(
                "Multiple {} found with id {}",
                schema.entity_name(),
                id
            )));
        }
        entities
            .pop()
            .ok_or_else(|| DomainError::AggregateNotFound {
                entity: schema.entity_name().to_string(),
                ids: vec![id.to_string()],
            })
    }

    pub async fn load_aggregates(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        schema: &Arc<EntitySchema>,
        query: AggregateQuery,
    ) -> Result<Vec<Entity>> {
        let (table, scope) = self.root_scope(session, context, schema).await?;
        let filter = scope.and(query.filter);
        let records = match query.lock {
            LockMode::None => session.query(table.name(), &filter, &query.options).await?,
            lock => {
                session
                    .query_for_update(
                        table.name(),
                        &filter,
                        &query.options,
                        lock == LockMode::ForUpdateNowait,
                    )
                    .await?
            }
        };
        self.load_by_records(session, context, schema, records, query.shallow)
            .await
    }

    /// Assembles aggregates from root records already read.
    pub async fn load_by_records(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        schema: &Arc<EntitySchema>,
        records: Vec<Record>,
        shallow: bool,
    ) -> Result<Vec<Entity>> {
        let primary_key = schema.primary_key().to_string();
        let mut index = RecordIndex::default();
        if !shallow && !records.is_empty() {
            let ids: Vec<Value> = records.iter().map(|r| r.get(&primary_key).clone()).collect();
            self.load_all_records(
                session,
                schema,
                &primary_key,
                &ids,
                std::slice::from_ref(&primary_key),
                &mut index,
            )
            .await?;
        }

        let scope = LoadScope {
            session,
            context,
            index: &index,
            shallow,
        };
        let mut entities = Vec::with_capacity(records.len());
        for record in records {
            let keys = BTreeMap::from([(primary_key.clone(), record.get(&primary_key).clone())]);
            entities.push(self.to_entity(&scope, schema, record, &keys).await?);
        }
        event!(
            Level::DEBUG,
            entity = schema.class_name(),
            loaded = entities.len(),
            shallow,
            "aggregates loaded"
        );
        Ok(entities)
    }

    /// One query per descendant table, keyed by the root ids.
    #[async_recursion]
    async fn load_all_records(
        &self,
        session: &dyn Session,
        schema: &EntitySchema,
        root_key: &str,
        ids: &[Value],
        key_columns: &[String],
        index: &mut RecordIndex,
    ) -> Result<()> {
        let mut seen = BTreeSet::new();
        for (_, child_schema) in schema.child_schemas() {
            if !seen.insert(child_schema.class_name().to_string()) {
                continue;
            }
            let table = self.table_for(child_schema.class_name())?;
            let mut filter = Filter::new().is_in(root_key, ids.iter().cloned());
            if session.table_schema(table).await?.is_soft_delete() {
                filter = filter.eq(DELETED, false);
            }
            for record in session.query(table, &filter, &QueryOptions::new()).await? {
                let key = RecordIndex::key(child_schema.class_name(), key_columns, &record);
                index.push(key, record);
            }

            let mut child_columns = key_columns.to_vec();
            child_columns.push(child_schema.primary_key().to_string());
            self.load_all_records(session, child_schema, root_key, ids, &child_columns, index)
                .await?;
        }
        Ok(())
    }

    /// `keys` identifies the entity: its ancestors' primary keys and its own.
    #[async_recursion]
    async fn to_entity<'s>(
        &self,
        scope: &LoadScope<'s>,
        schema: &Arc<EntitySchema>,
        record: Record,
        keys: &BTreeMap<String, Value>,
    ) -> Result<Entity> {
        let mapping = self.entity_map.get(schema.class_name())?;
        let mut values = record.into_values();
        values.retain(|column, _| {
            !mapping.is_excluded(column)
                && (column == schema.primary_key() || !keys.contains_key(column))
                && schema
                    .field(column)
                    .is_some_and(|f| !f.is_entity())
        });
        for (attribute, info) in mapping.list_attributes() {
            let items = self.list_data(scope.session, info, keys).await?;
            values.insert(attribute.clone(), Value::List(items));
        }

        if scope.shallow {
            let mut entity = Entity::new_shallow(schema, values, scope.context)?;
            entity.reset_version_lock();
            return Ok(entity);
        }

        let mut entity = Entity::new(schema, values, scope.context)?;
        for (field, child_schema) in schema.child_schemas() {
            let owner = RecordIndex::owner_key(child_schema.class_name(), keys);
            let child_pk = child_schema.primary_key();
            let mut children = Vec::new();
            for child_record in scope.index.get(&owner) {
                let mut child_keys = keys.clone();
                child_keys.insert(child_pk.to_string(), child_record.get(child_pk).clone());
                children.push(
                    self.to_entity(scope, child_schema, child_record.clone(), &child_keys)
                        .await?,
                );
            }
            if field.many {
                let id_parts = field
                    .id_parts_override()
                    .unwrap_or_else(|| scope.context.entity_set_id_parts());
                let set = EntitySetObject::loaded(
                    Arc::clone(child_schema),
                    children,
                    id_parts,
                    scope.context.clone(),
                )?;
                entity.install_children(field.name(), set);
            } else {
                entity.install_child(field.name(), children.into_iter().next());
            }
        }
        entity.reset_version_lock();
        Ok(entity)
    }
}

fn list_record(
    info: &ListAttributeInfo,
    owner_keys: &BTreeMap<String, Value>,
    entry: Value,
) -> Record {
    Record::from_values(info.table.clone(), owner_keys.clone()).with(info.data_key.clone(), entry)
}

/// Storage form of an attribute value: composites become JSON documents and
/// empty maps become null.
pub fn make_db_ready(value: Value) -> Value {
    match value {
        Value::Map(ref map) if map.is_empty() => Value::Null,
        Value::Json(serde_json::Value::Object(ref map)) if map.is_empty() => Value::Null,
        Value::Money(_) | Value::Object(_) | Value::List(_) | Value::Map(_) => {
            Value::Json(value.to_json())
        }
        other => other,
    }
}

fn conversion_failure(err: DomainError) -> DomainError {
    match err {
        DomainError::Conversion { .. } | DomainError::Database(_) | DomainError::Lock(_) => err,
        other => DomainError::conversion(ConversionErrorCode::ConversionError, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use crate::common::Money;
    use crate::persist::entity_map::RecordMapping;
    use crate::persist::memory_session::MemoryDatabase;
    use crate::core::FrameworkConfig;
    use crate::types::{DirtyTrackable, FieldInfo};

    fn line_schema() -> Arc<EntitySchema> {
        EntitySchema::builder("OrderLineEntity")
            .field(FieldInfo::string("line_id").primary_key())
            .field(FieldInfo::string("sku"))
            .field(FieldInfo::integer("quantity").default_value(1))
            .build()
            .unwrap()
    }

    fn order_schema() -> Arc<EntitySchema> {
        EntitySchema::builder("OrderAggregate")
            .multi_tenant()
            .field(FieldInfo::string("order_id").primary_key())
            .field(FieldInfo::money("total").optional())
            .field(FieldInfo::string("tags").many())
            .field(FieldInfo::entity_set("lines", line_schema()))
            .build()
            .unwrap()
    }

    fn adapter() -> DbAdapter {
        DbAdapter::new(Arc::new(
            EntityMap::new()
                .with(
                    "OrderAggregate",
                    RecordMapping::new("orders").list_attribute("tags", "order_tag", "tag"),
                )
                .with("OrderLineEntity", RecordMapping::new("order_line")),
        ))
    }

    async fn database() -> Arc<MemoryDatabase> {
        let db = MemoryDatabase::new(FrameworkConfig::new());
        db.create_table(TableSchema::new("orders", ["order_id"]).soft_delete())
            .await
            .unwrap();
        db.create_table(TableSchema::new("order_line", ["order_id", "line_id"]))
            .await
            .unwrap();
        db.create_table(TableSchema::new("order_tag", ["order_id", "tag"]).soft_delete())
            .await
            .unwrap();
        db
    }

    fn order(ctx: &RequestContext) -> Entity {
        Entity::new(
            &order_schema(),
            attrs! {
                "order_id" => "o1",
                "total" => Money::parse("12.50 INR", None).unwrap(),
                "tags" => vec![Value::from("rush"), Value::from("gift")],
                "lines" => vec![Value::Map(attrs! { "line_id" => "l1", "sku" => "A" })],
            },
            ctx,
        )
        .unwrap()
    }

    #[test]
    fn test_make_db_ready() {
        assert_eq!(make_db_ready(Value::Map(BTreeMap::new())), Value::Null);
        assert_eq!(make_db_ready(Value::Integer(3)), Value::Integer(3));
        assert!(matches!(
            make_db_ready(Value::List(vec![Value::from("a")])),
            Value::Json(serde_json::Value::Array(_))
        ));
    }

    #[tokio::test]
    async fn test_records_carry_parent_keys() {
        let db = database().await;
        let session = db.session();
        let ctx = RequestContext::default();
        let records = adapter().to_records(&session, &order(&ctx)).await.unwrap();

        let line = records.iter().find(|r| r.table() == "order_line").unwrap();
        assert_eq!(line.get("order_id"), &Value::from("o1"));
        let tags: Vec<_> = records.iter().filter(|r| r.table() == "order_tag").collect();
        assert_eq!(tags.len(), 2);
        let root = records.iter().find(|r| r.table() == "orders").unwrap();
        assert!(!root.contains("tags"));
        assert!(!root.contains("lines"));
    }

    #[tokio::test]
    async fn test_missing_mapping() {
        let db = database().await;
        let ctx = RequestContext::default();
        let adapter = DbAdapter::new(Arc::new(EntityMap::new()));
        let result = adapter.to_records(&db.session(), &order(&ctx)).await;
        assert!(matches!(
            result,
            Err(DomainError::Conversion {
                code: ConversionErrorCode::MapMissing,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_round_trip_with_children() {
        let db = database().await;
        let session = db.session();
        let ctx = RequestContext::default();
        let adapter = adapter();
        let original = order(&ctx);
        session
            .add_all(adapter.to_records(&session, &original).await.unwrap())
            .await
            .unwrap();

        let mut loaded = adapter
            .load_aggregate(&session, &ctx, &order_schema(), "o1", LockMode::None, false)
            .await
            .unwrap();
        assert_eq!(loaded.data(), original.data());
        assert!(loaded.dirty().is_none());

        let shallow = adapter
            .load_aggregate(&session, &ctx, &order_schema(), "o1", LockMode::None, true)
            .await
            .unwrap();
        assert!(shallow.is_shallow());
        assert!(shallow.entity_set("lines").is_err());
    }

    #[tokio::test]
    async fn test_other_tenant_cannot_load() {
        let db = database().await;
        let session = db.session();
        let ctx = RequestContext::default();
        let adapter = adapter();
        session
            .add_all(adapter.to_records(&session, &order(&ctx)).await.unwrap())
            .await
            .unwrap();

        let other = RequestContext::default().with_tenant("ACME");
        let result = adapter
            .load_aggregate(&session, &other, &order_schema(), "o1", LockMode::None, false)
            .await;
        assert!(matches!(result, Err(DomainError::AggregateNotFound { .. })));
    }

    #[tokio::test]
    async fn test_removed_list_items_are_soft_deleted() {
        let db = database().await;
        let session = db.session();
        let ctx = RequestContext::default();
        let adapter = adapter();
        let mut entity = order(&ctx);
        session
            .add_all(adapter.to_records(&session, &entity).await.unwrap())
            .await
            .unwrap();

        entity.list_mut("tags").unwrap().remove("gift").unwrap();
        for record in adapter.to_records(&session, &entity).await.unwrap() {
            session.merge(record).await.unwrap();
        }

        let loaded = adapter
            .load_aggregate(&session, &ctx, &order_schema(), "o1", LockMode::None, false)
            .await
            .unwrap();
        assert_eq!(loaded.value_of("tags").unwrap(), Value::List(vec![Value::from("rush")]));
    }
}
