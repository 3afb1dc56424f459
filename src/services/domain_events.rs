//! Domain events: per-request batches of entity changes, persisted as
//! aggregates and handed to a publisher afterwards.

use crate::common::dateutils::utcnow;
use crate::common::generate_id_with_prefix;
use crate::core::{DomainError, RequestContext, Result, Value};
use crate::persist::{AggregateQuery, AggregateRepository, LockMode, RecordMapping, Session};
use crate::storage::{Filter, QueryOptions, SortOrder, TableSchema};
use crate::types::{
    Aggregate, BaseEnum, DirtyTrackable, Entity, EntitySchema, FieldInfo, ValueObject,
    ValueObjectSchema,
};
use async_trait::async_trait;
use log::{info, warn};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DOMAIN_EVENT_TABLE: &str = "domain_event";
pub const DOMAIN_EVENT_PREFIX: &str = "DE";

crate::base_enum! {
    pub enum UpdateType {
        Created = "created" ("Created"),
        Updated = "updated" ("Updated"),
        Deleted = "deleted" ("Deleted"),
        Action = "action" ("Action"),
    }
}

crate::base_enum! {
    pub enum DomainEventStatus {
        Created = "created" ("Created"),
        Published = "published" ("Published"),
        Failed = "failed" ("Failed"),
        Processed = "processed" ("Processed"),
        Ignored = "ignored" ("Ignored"),
        RetryPending = "retry_pending" ("Retry Pending"),
        Retrying = "retrying" ("Retrying"),
    }
}

fn event_data_schema() -> Result<Arc<ValueObjectSchema>> {
    ValueObjectSchema::builder("DomainEventData")
        .field(FieldInfo::string("entity"))
        .field(FieldInfo::string("entity_id"))
        .field(FieldInfo::integer("version"))
        .field(FieldInfo::enumeration("event_type", UpdateType::enum_type()))
        .field(FieldInfo::json("event_data").optional())
        .build()
}

lazy_static::lazy_static! {
    static ref EVENT_DATA_SCHEMA: Result<Arc<ValueObjectSchema>> = event_data_schema();
}

/// One change to one entity inside a domain event.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEventData {
    pub entity: String,
    pub entity_id: String,
    pub version: i64,
    pub event_type: UpdateType,
    pub event_data: serde_json::Value,
}

impl DomainEventData {
    pub fn schema() -> Result<Arc<ValueObjectSchema>> {
        EVENT_DATA_SCHEMA.clone()
    }

    pub fn to_value_object(&self) -> Result<ValueObject> {
        ValueObject::new(
            &Self::schema()?,
            crate::attrs! {
                "entity" => self.entity.as_str(),
                "entity_id" => self.entity_id.as_str(),
                "version" => self.version,
                "event_type" => self.event_type,
                "event_data" => self.event_data.clone(),
            },
        )
    }

    pub fn from_value_object(vo: &ValueObject) -> Result<Self> {
        let text = |name: &str| {
            vo.str(name).map(str::to_string).ok_or_else(|| {
                DomainError::InvalidState(format!("DomainEventData.{} is not set", name))
            })
        };
        Ok(Self {
            entity: text("entity")?,
            entity_id: text("entity_id")?,
            version: vo.value("version").as_i64().unwrap_or_default(),
            event_type: UpdateType::parse(&text("event_type")?)?,
            event_data: vo.value("event_data").to_json(),
        })
    }

    pub fn data(&self) -> serde_json::Value {
        json!({
            "entity": self.entity,
            "entity_id": self.entity_id,
            "version": self.version,
            "event_type": self.event_type.value(),
            "event_data": self.event_data,
        })
    }
}

fn domain_event_schema() -> Result<Arc<EntitySchema>> {
    EntitySchema::builder("DomainEventAggregate")
        .id_prefix(DOMAIN_EVENT_PREFIX)
        .field(FieldInfo::string("event_id").primary_key())
        .field(FieldInfo::string("domain"))
        .field(FieldInfo::string("transaction_id").optional())
        .field(FieldInfo::value_object("updates", DomainEventData::schema()?).many())
        .field(FieldInfo::datetime("generated_at"))
        .field(FieldInfo::string("user_id").optional())
        .field(FieldInfo::string("editor_organisation_id").optional())
        .field(
            FieldInfo::enumeration("status", DomainEventStatus::enum_type())
                .optional()
                .default_value(DomainEventStatus::Created),
        )
        .build()
}

crate::aggregate! {
    /// A batch of entity changes made in one domain during one request.
    pub struct DomainEventAggregate => domain_event_schema;
}

impl DomainEventAggregate {
    pub fn record_mapping() -> RecordMapping {
        RecordMapping::new(DOMAIN_EVENT_TABLE)
    }

    pub fn table_schema() -> TableSchema {
        TableSchema::new(DOMAIN_EVENT_TABLE, ["event_id"]).soft_delete()
    }

    /// Empty event with a `DE-<domain>-...` id, stamped now.
    pub fn begin(
        domain: &str,
        transaction_id: Option<&str>,
        context: &RequestContext,
    ) -> Result<Self> {
        let user = context.user();
        let prefix = Self::schema()?.id_prefix().to_string();
        Self::create(
            crate::attrs! {
                "event_id" => generate_id_with_prefix(&prefix, Some(domain), context.id_suffix_length()),
                "domain" => domain,
                "transaction_id" => transaction_id,
                "generated_at" => utcnow(),
                "user_id" => user.map(|u| u.user_id.as_str()),
                "editor_organisation_id" => user.and_then(|u| u.organisation_id.as_deref()),
            },
            context,
        )
    }

    pub fn event_id(&self) -> String {
        self.primary_id()
    }

    pub fn domain(&self) -> Option<&str> {
        self.get_str("domain")
    }

    pub fn status(&self) -> Result<DomainEventStatus> {
        self.get_enum("status")
    }

    pub fn set_status(&mut self, status: DomainEventStatus) -> Result<()> {
        self.entity_mut().set("status", status)
    }

    pub fn updates(&self) -> Result<Vec<DomainEventData>> {
        self.list("updates")?
            .iter()
            .map(|item| match item {
                Value::Object(vo) => DomainEventData::from_value_object(vo),
                other => Err(DomainError::InvalidState(format!(
                    "{} is not a domain event update",
                    other
                ))),
            })
            .collect()
    }

    pub fn has_data(&self) -> bool {
        self.list("updates").is_ok_and(|updates| !updates.is_empty())
    }

    pub fn add_event(&mut self, data: DomainEventData) -> Result<()> {
        let vo = data.to_value_object()?;
        self.entity_mut().list_mut("updates")?.add(vo)
    }

    /// Records a change to `entity`. Without an explicit type it is inferred:
    /// version 1 is a creation, then deletion, then a state-machine action,
    /// and anything else an update.
    pub fn write(&mut self, entity: &mut Entity, event_type: Option<UpdateType>) -> Result<()> {
        let event_type = event_type.unwrap_or_else(|| infer_update_type(entity));
        let event_data = match event_type {
            UpdateType::Created | UpdateType::Deleted => entity.data(),
            UpdateType::Updated => entity.dirty().unwrap_or(serde_json::Value::Null),
            UpdateType::Action => entity.get_actions_update(),
        };
        self.add_event(DomainEventData {
            entity: entity.entity_name().to_string(),
            entity_id: entity.primary_id(),
            version: entity.get_latest_version(),
            event_type,
            event_data,
        })
    }

    /// Publishable projection of the event.
    pub fn message(&self) -> Result<serde_json::Value> {
        Ok(json!({
            "event_id": self.event_id(),
            "domain": self.domain(),
            "transaction_id": self.get_str("transaction_id"),
            "user_id": self.get_str("user_id"),
            "editor_organisation_id": self.get_str("editor_organisation_id"),
            "generated_at": self.value("generated_at").to_json(),
            "updates": self.updates()?.iter().map(DomainEventData::data).collect::<Vec<_>>(),
        }))
    }
}

fn infer_update_type(entity: &Entity) -> UpdateType {
    if entity.version() == 1 {
        UpdateType::Created
    } else if entity.is_deleted() {
        UpdateType::Deleted
    } else if entity.has_actions() {
        UpdateType::Action
    } else {
        UpdateType::Updated
    }
}

/// Collects writes for one domain. `flush` closes the current event and
/// `commit` persists every closed one.
pub struct DomainEventWriter {
    domain: String,
    transaction_id: Option<String>,
    context: RequestContext,
    current: Option<DomainEventAggregate>,
    queued: Vec<DomainEventAggregate>,
}

impl DomainEventWriter {
    pub fn new(
        domain: impl Into<String>,
        transaction_id: Option<String>,
        context: RequestContext,
    ) -> Self {
        Self {
            domain: domain.into(),
            transaction_id,
            context,
            current: None,
            queued: Vec::new(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn write(&mut self, entity: &mut Entity, event_type: Option<UpdateType>) -> Result<&mut Self> {
        let current = match self.current.take() {
            Some(current) => current,
            None => DomainEventAggregate::begin(
                &self.domain,
                self.transaction_id.as_deref(),
                &self.context,
            )?,
        };
        let current = self.current.insert(current);
        current.write(entity, event_type)?;
        Ok(self)
    }

    pub fn flush(&mut self) {
        match self.current.take() {
            Some(event) if event.has_data() => self.queued.push(event),
            Some(event) => warn!(
                "Dropping domain event {} for {} without updates",
                event.event_id(),
                self.domain
            ),
            None => {}
        }
    }

    pub fn pending(&self) -> usize {
        self.queued.len() + usize::from(self.current.is_some())
    }

    /// Saves all queued events, closing the open one first.
    pub async fn commit(
        &mut self,
        session: &dyn Session,
        repository: &AggregateRepository<DomainEventAggregate>,
    ) -> Result<Vec<DomainEventAggregate>> {
        self.flush();
        let mut events = std::mem::take(&mut self.queued);
        repository.save_all(session, &mut events).await?;
        Ok(events)
    }
}

/// Destination for published domain events.
#[async_trait]
pub trait DomainEventPublisher: Send + Sync {
    async fn publish(&self, event: &DomainEventAggregate) -> Result<()>;
}

/// Publisher that keeps every message in memory.
#[derive(Debug, Default)]
pub struct InMemoryEventSink {
    messages: Mutex<Vec<serde_json::Value>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<serde_json::Value> {
        self.messages.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }
}

#[async_trait]
impl DomainEventPublisher for InMemoryEventSink {
    async fn publish(&self, event: &DomainEventAggregate) -> Result<()> {
        let message = event.message()?;
        self.messages.lock().await.push(message);
        Ok(())
    }
}

/// Request-scoped entry point: one writer per domain, committed together and
/// published later.
pub struct DomainEventService {
    repository: AggregateRepository<DomainEventAggregate>,
    publisher: Arc<dyn DomainEventPublisher>,
    writers: BTreeMap<String, DomainEventWriter>,
    transaction_id: Option<String>,
}

impl DomainEventService {
    pub fn new(
        repository: AggregateRepository<DomainEventAggregate>,
        publisher: Arc<dyn DomainEventPublisher>,
    ) -> Self {
        Self {
            repository,
            publisher,
            writers: BTreeMap::new(),
            transaction_id: None,
        }
    }

    /// Correlation id stamped on events from writers created afterwards.
    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn repository(&self) -> &AggregateRepository<DomainEventAggregate> {
        &self.repository
    }

    pub fn writer(&mut self, domain: &str, context: &RequestContext) -> &mut DomainEventWriter {
        let transaction_id = self.transaction_id.clone();
        self.writers
            .entry(domain.to_string())
            .or_insert_with(|| DomainEventWriter::new(domain, transaction_id, context.clone()))
    }

    /// Persists the events of every writer and forgets the writers.
    pub async fn commit_all(&mut self, session: &dyn Session) -> Result<Vec<DomainEventAggregate>> {
        let mut committed = Vec::new();
        for (_, mut writer) in std::mem::take(&mut self.writers) {
            committed.extend(writer.commit(session, &self.repository).await?);
        }
        if committed.is_empty() {
            warn!("Committing domain events with no updates");
        }
        Ok(committed)
    }

    pub async fn get_event(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        event_id: &str,
    ) -> Result<DomainEventAggregate> {
        self.repository
            .load(session, context, event_id, None, false)
            .await
    }

    pub async fn get_events_by_transaction_id(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        transaction_id: &str,
    ) -> Result<Vec<DomainEventAggregate>> {
        let columns = crate::attrs! { "transaction_id" => transaction_id };
        self.repository
            .load_by_keys(session, context, &columns, false)
            .await
    }

    /// Publishes every created or previously failed event, oldest first.
    /// Returns how many were attempted and how many failed.
    pub async fn publish_latest(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        domain: Option<&str>,
    ) -> Result<(usize, usize)> {
        let mut filter = Filter::new().is_in(
            "status",
            [DomainEventStatus::Created, DomainEventStatus::Failed].map(|s| s.value()),
        );
        if let Some(domain) = domain {
            filter = filter.eq("domain", domain);
        }
        let query = AggregateQuery::new(filter)
            .options(QueryOptions::new().order_by("generated_at", SortOrder::Asc))
            .lock(LockMode::for_update(false));
        let mut events = self.repository.load_where(session, context, query).await?;

        let mut failures = 0;
        for event in events.iter_mut() {
            let status = match self.publisher.publish(event).await {
                Ok(()) => DomainEventStatus::Published,
                Err(err) => {
                    failures += 1;
                    warn!(
                        "Error while publishing domain event {}: {}",
                        event.event_id(),
                        err
                    );
                    DomainEventStatus::Failed
                }
            };
            event.set_status(status)?;
        }
        self.repository.update_all(session, &mut events, false).await?;
        info!(
            "Published {} domain events, {} failed",
            events.len() - failures,
            failures
        );
        Ok((events.len(), failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use crate::core::{CurrentUser, FrameworkConfig};
    use crate::persist::{DbAdapter, EntityMap, MemoryDatabase};

    fn note_schema() -> Result<Arc<EntitySchema>> {
        EntitySchema::builder("NoteAggregate")
            .field(FieldInfo::string("note_id").primary_key())
            .field(FieldInfo::string("body"))
            .build()
    }

    crate::aggregate! {
        struct NoteAggregate => note_schema;
    }

    fn note(ctx: &RequestContext) -> NoteAggregate {
        NoteAggregate::create(attrs! { "note_id" => "n1", "body" => "draft" }, ctx).unwrap()
    }

    async fn service(publisher: Arc<dyn DomainEventPublisher>) -> (Arc<MemoryDatabase>, DomainEventService) {
        let db = MemoryDatabase::new(FrameworkConfig::new());
        db.create_table(DomainEventAggregate::table_schema()).await.unwrap();
        let map = EntityMap::new().with("DomainEventAggregate", DomainEventAggregate::record_mapping());
        let repository = AggregateRepository::new(Arc::new(DbAdapter::new(Arc::new(map))));
        (db, DomainEventService::new(repository, publisher).with_transaction_id("req-1"))
    }

    struct FailingPublisher;

    #[async_trait]
    impl DomainEventPublisher for FailingPublisher {
        async fn publish(&self, _event: &DomainEventAggregate) -> Result<()> {
            Err(DomainError::Database("broker unavailable".into()))
        }
    }

    #[test]
    fn test_update_type_inference() {
        let ctx = RequestContext::default();
        let mut note = note(&ctx);
        let mut event = DomainEventAggregate::begin("notes", None, &ctx).unwrap();
        event.write(note.entity_mut(), None).unwrap();

        note.entity_mut().mark_persisted();
        note.set("body", "final").unwrap();
        event.write(note.entity_mut(), None).unwrap();

        note.entity_mut().mark_persisted();
        note.delete();
        event.write(note.entity_mut(), None).unwrap();

        let updates = event.updates().unwrap();
        let kinds: Vec<UpdateType> = updates.iter().map(|u| u.event_type).collect();
        assert_eq!(kinds, vec![UpdateType::Created, UpdateType::Updated, UpdateType::Deleted]);
        assert_eq!(updates[1].version, 2);
        assert_eq!(updates[1].event_data["data"]["body"]["data"]["new"], json!("final"));
        assert!(event.event_id().starts_with("DE-notes-"));
    }

    #[test]
    fn test_event_carries_user() {
        let ctx = RequestContext::default()
            .with_user(CurrentUser::new("u1").with_organisation("org1"));
        let event = DomainEventAggregate::begin("notes", Some("req-9"), &ctx).unwrap();
        let message = event.message().unwrap();
        assert_eq!(message["user_id"], json!("u1"));
        assert_eq!(message["editor_organisation_id"], json!("org1"));
        assert_eq!(message["transaction_id"], json!("req-9"));
        assert_eq!(event.status().unwrap(), DomainEventStatus::Created);
        assert!(!event.has_data());
    }

    #[tokio::test]
    async fn test_commit_and_publish() {
        let sink = Arc::new(InMemoryEventSink::new());
        let (db, mut service) = service(sink.clone()).await;
        let session = db.session();
        let ctx = RequestContext::default();
        let mut note = note(&ctx);

        service.writer("notes", &ctx).write(note.entity_mut(), None).unwrap();
        let committed = service.commit_all(&session).await.unwrap();
        assert_eq!(committed.len(), 1);

        let stored = service
            .get_events_by_transaction_id(&session, &ctx, "req-1")
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].updates().unwrap()[0].entity, "note");

        assert_eq!(service.publish_latest(&session, &ctx, None).await.unwrap(), (1, 0));
        assert_eq!(sink.len().await, 1);
        let event = service
            .get_event(&session, &ctx, &committed[0].event_id())
            .await
            .unwrap();
        assert_eq!(event.status().unwrap(), DomainEventStatus::Published);
        assert_eq!(service.publish_latest(&session, &ctx, None).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_failed_publish_is_retried() {
        let (db, mut service) = service(Arc::new(FailingPublisher)).await;
        let session = db.session();
        let ctx = RequestContext::default();
        let mut note = note(&ctx);

        service.writer("notes", &ctx).write(note.entity_mut(), None).unwrap();
        service.commit_all(&session).await.unwrap();

        assert_eq!(service.publish_latest(&session, &ctx, Some("notes")).await.unwrap(), (1, 1));
        assert_eq!(service.publish_latest(&session, &ctx, Some("notes")).await.unwrap(), (1, 1));
        assert_eq!(service.publish_latest(&session, &ctx, Some("other")).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_empty_writer_commits_nothing() {
        let (db, mut service) = service(Arc::new(InMemoryEventSink::new())).await;
        let ctx = RequestContext::default();
        service.writer("notes", &ctx);
        assert!(service.commit_all(&db.session()).await.unwrap().is_empty());
    }
}
