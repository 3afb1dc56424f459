use super::db_adapter::{AggregateQuery, DbAdapter, LockMode};
use super::session::Session;
use crate::core::{DomainError, FrameworkConfig, RequestContext, Result, Value};
use crate::storage::{Filter, QueryOptions, Record};
use crate::types::entity::DELETED;
use crate::types::{Aggregate, DirtyTrackable, Entity};
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Transaction-scoped CRUD for one aggregate type.
///
/// Every call takes the session it runs in and, for reads, the request
/// context that scopes multi-tenant aggregates.
pub struct AggregateRepository<A: Aggregate> {
    adapter: Arc<DbAdapter>,
    nowait: bool,
    marker: PhantomData<fn() -> A>,
}

impl<A: Aggregate> Clone for AggregateRepository<A> {
    fn clone(&self) -> Self {
        Self {
            adapter: Arc::clone(&self.adapter),
            nowait: self.nowait,
            marker: PhantomData,
        }
    }
}

impl<A: Aggregate> AggregateRepository<A> {
    pub fn new(adapter: Arc<DbAdapter>) -> Self {
        Self {
            adapter,
            nowait: true,
            marker: PhantomData,
        }
    }

    pub fn from_config(adapter: Arc<DbAdapter>, config: &FrameworkConfig) -> Self {
        Self::new(adapter).with_nowait(config.lock_nowait)
    }

    /// Whether locking loads fail at once when a row is already locked.
    pub fn with_nowait(mut self, nowait: bool) -> Self {
        self.nowait = nowait;
        self
    }

    pub fn adapter(&self) -> &Arc<DbAdapter> {
        &self.adapter
    }

    /// Lock taken by loads that ask for one.
    pub fn lock_mode(&self, for_update: bool) -> LockMode {
        if for_update {
            LockMode::for_update(self.nowait)
        } else {
            LockMode::None
        }
    }

    fn wrap(entities: Vec<Entity>) -> Result<Vec<A>> {
        entities.into_iter().map(A::from_entity).collect()
    }

    // ---- writes ------------------------------------------------------------

    /// Inserts a new aggregate.
    pub async fn save(&self, session: &dyn Session, aggregate: &mut A) -> Result<()> {
        let entity = aggregate.entity_mut();
        let span = info_span!(
            "repository.save",
            aggregate = entity.class_name(),
            id = %entity.primary_id()
        );
        async {
            entity.validate()?;
            let records = self.adapter.to_records(session, entity).await?;
            session.add_all(records).await?;
            session.flush().await?;
            entity.mark_persisted();
            Ok(())
        }
        .instrument(span)
        .await
    }

    pub async fn save_all(&self, session: &dyn Session, aggregates: &mut [A]) -> Result<()> {
        let mut records = Vec::new();
        for aggregate in aggregates.iter() {
            let entity = aggregate.entity();
            entity.validate()?;
            records.extend(self.adapter.to_records(session, entity).await?);
        }
        if records.is_empty() {
            return Ok(());
        }
        session.add_all(records).await?;
        session.flush().await?;
        for aggregate in aggregates.iter_mut() {
            aggregate.entity_mut().mark_persisted();
        }
        Ok(())
    }

    /// Writes pending changes. An aggregate that is neither dirty nor deleted
    /// is left alone.
    pub async fn update(&self, session: &dyn Session, aggregate: &mut A) -> Result<()> {
        let entity = aggregate.entity_mut();
        if !entity.is_dirty() && !entity.is_deleted() {
            return Ok(());
        }
        let span = info_span!(
            "repository.update",
            aggregate = entity.class_name(),
            id = %entity.primary_id()
        );
        async {
            let records = self.prepare_update(session, entity).await?;
            self.write_update(session, entity.is_deleted(), records).await?;
            session.flush().await?;
            entity.mark_persisted();
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Updates every dirty aggregate, or all of them when `force` is set.
    pub async fn update_all(
        &self,
        session: &dyn Session,
        aggregates: &mut [A],
        force: bool,
    ) -> Result<()> {
        let mut written = Vec::new();
        for (position, aggregate) in aggregates.iter_mut().enumerate() {
            let entity = aggregate.entity_mut();
            if !force && !entity.is_dirty() && !entity.is_deleted() {
                continue;
            }
            let records = self.prepare_update(session, entity).await?;
            self.write_update(session, entity.is_deleted(), records).await?;
            written.push(position);
        }
        if written.is_empty() {
            return Ok(());
        }
        session.flush().await?;
        for position in written {
            aggregates[position].entity_mut().mark_persisted();
        }
        Ok(())
    }

    async fn prepare_update(&self, session: &dyn Session, entity: &mut Entity) -> Result<Vec<Record>> {
        entity.update_version(true);
        entity.validate()?;
        self.adapter.to_records(session, entity).await
    }

    async fn write_update(
        &self,
        session: &dyn Session,
        deleted: bool,
        records: Vec<Record>,
    ) -> Result<()> {
        let hard_delete = match records.last() {
            Some(root) => deleted && !session.table_schema(root.table()).await?.is_soft_delete(),
            None => false,
        };
        for record in records {
            if hard_delete {
                session.delete(&record).await?;
            } else {
                session.merge(record).await?;
            }
        }
        Ok(())
    }

    /// Cascades the delete through the aggregate and writes it.
    pub async fn delete(&self, session: &dyn Session, aggregate: &mut A) -> Result<()> {
        aggregate.entity_mut().delete();
        self.update(session, aggregate).await
    }

    pub async fn delete_all(&self, session: &dyn Session, aggregates: &mut [A]) -> Result<()> {
        for aggregate in aggregates.iter_mut() {
            aggregate.entity_mut().delete();
        }
        self.update_all(session, aggregates, true).await
    }

    /// Bulk soft delete by predicate. Skips hydration and dirty tracking.
    pub async fn mark_deleted(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        filter: Filter,
    ) -> Result<usize> {
        let schema = A::schema()?;
        let (table, scope) = self.adapter.root_scope(session, context, &schema).await?;
        let values = BTreeMap::from([(DELETED.to_string(), Value::Boolean(true))]);
        let count = session
            .update_where(table.name(), &scope.and(filter), values)
            .await?;
        event!(
            Level::DEBUG,
            aggregate = schema.class_name(),
            count,
            "aggregates marked deleted"
        );
        Ok(count)
    }

    // ---- reads -------------------------------------------------------------

    /// Loads one aggregate. With an expected `version`, a different stored
    /// version fails with `OutdatedVersion`.
    pub async fn load(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        id: &str,
        version: Option<i64>,
        for_update: bool,
    ) -> Result<A> {
        let schema = A::schema()?;
        let span = info_span!(
            "repository.load",
            aggregate = schema.class_name(),
            id = %id,
            for_update
        );
        async {
            let entity = self
                .adapter
                .load_aggregate(session, context, &schema, id, self.lock_mode(for_update), false)
                .await?;
            if let Some(expected) = version
                && expected != entity.version()
            {
                return Err(DomainError::OutdatedVersion {
                    entity: schema.class_name().to_string(),
                    id: id.to_string(),
                    current: entity.version(),
                });
            }
            A::from_entity(entity)
        }
        .instrument(span)
        .await
    }

    /// Root only; entity attributes stay unpopulated and the result is
    /// read-only.
    pub async fn load_shallow(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        id: &str,
    ) -> Result<A> {
        let schema = A::schema()?;
        let entity = self
            .adapter
            .load_aggregate(session, context, &schema, id, LockMode::None, true)
            .await?;
        A::from_entity(entity)
    }

    /// Loads several aggregates by id. With `find_all`, any missing id fails
    /// with `AggregateNotFound` naming exactly the missing ids.
    pub async fn load_many(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        ids: &[String],
        find_all: bool,
        for_update: bool,
    ) -> Result<Vec<A>> {
        let schema = A::schema()?;
        let wanted: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        let filter = Filter::new().is_in(schema.primary_key(), wanted.iter().copied());
        let query = AggregateQuery::new(filter).lock(self.lock_mode(for_update));
        let entities = self
            .adapter
            .load_aggregates(session, context, &schema, query)
            .await?;

        if find_all && entities.len() != wanted.len() {
            let found: BTreeSet<String> = entities.iter().map(Entity::primary_id).collect();
            let missing: Vec<String> = wanted
                .iter()
                .filter(|id| !found.contains(**id))
                .map(|id| id.to_string())
                .collect();
            return Err(DomainError::AggregateNotFound {
                entity: schema.entity_name().to_string(),
                ids: missing,
            });
        }
        Self::wrap(entities)
    }

    /// Aggregates whose root columns equal the given values.
    pub async fn load_by_keys(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        columns: &BTreeMap<String, Value>,
        for_update: bool,
    ) -> Result<Vec<A>> {
        let query = AggregateQuery::new(Filter::from_columns(columns.iter()))
            .lock(self.lock_mode(for_update));
        self.load_where(session, context, query).await
    }

    pub async fn load_all(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        options: QueryOptions,
    ) -> Result<Vec<A>> {
        let query = AggregateQuery::new(Filter::new()).options(options);
        self.load_where(session, context, query).await
    }

    pub async fn load_multiple_shallow(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        columns: &BTreeMap<String, Value>,
    ) -> Result<Vec<A>> {
        let query = AggregateQuery::new(Filter::from_columns(columns.iter())).shallow(true);
        self.load_where(session, context, query).await
    }

    pub async fn load_where(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        query: AggregateQuery,
    ) -> Result<Vec<A>> {
        let schema = A::schema()?;
        let entities = self
            .adapter
            .load_aggregates(session, context, &schema, query)
            .await?;
        Self::wrap(entities)
    }

    pub async fn exists(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        id: &str,
    ) -> Result<bool> {
        let schema = A::schema()?;
        let filter = Filter::new().eq(schema.primary_key(), id);
        Ok(self.count(session, context, filter).await? > 0)
    }

    pub async fn count(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        filter: Filter,
    ) -> Result<usize> {
        let schema = A::schema()?;
        let (table, scope) = self.adapter.root_scope(session, context, &schema).await?;
        let records = session
            .query(table.name(), &scope.and(filter), &QueryOptions::new())
            .await?;
        Ok(records.len())
    }
}
