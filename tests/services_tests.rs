use chrono::{Duration, NaiveTime};
use dddkit::prelude::*;
use dddkit::services::jobs::{JOB_TABLE, RECURRING_JOB_TABLE};
use dddkit::services::{
    AsyncJobStatus, DomainEventAggregate, DomainEventService, DomainEventStatus,
    IdGeneratorService, InMemoryEventSink, IntervalUnit, JobAggregate, JobFactory, JobRepository,
    RecurringJobAggregate, RecurringJobRepository, RecurringJobSchedule, UpdateType,
};
use serde_json::json;
use std::sync::Arc;

fn ticket_schema() -> Result<Arc<EntitySchema>> {
    EntitySchema::builder("TicketAggregate")
        .multi_tenant()
        .field(FieldInfo::string("ticket_id").primary_key())
        .field(FieldInfo::string("title"))
        .build()
}

aggregate! {
    pub struct TicketAggregate => ticket_schema;
}

fn registry() -> Registry {
    Registry::builder(FrameworkConfig::new())
        .aggregate::<TicketAggregate>(RecordMapping::new("ticket"))
        .aggregate::<DomainEventAggregate>(DomainEventAggregate::record_mapping())
        .aggregate::<JobAggregate>(JobAggregate::record_mapping())
        .aggregate::<RecurringJobAggregate>(RecurringJobAggregate::record_mapping())
        .entity(
            RecurringJobAggregate::run_log_schema().unwrap(),
            RecurringJobAggregate::run_log_mapping(),
        )
        .repository("tickets", |adapter, config| {
            AggregateRepository::<TicketAggregate>::from_config(adapter, config)
        })
        .repository("domain_events", |adapter, config| {
            AggregateRepository::<DomainEventAggregate>::from_config(adapter, config)
        })
        .repository("jobs", |adapter, config| {
            JobRepository::new(AggregateRepository::from_config(adapter, config))
        })
        .repository("recurring_jobs", |adapter, config| {
            RecurringJobRepository::new(AggregateRepository::from_config(adapter, config))
        })
        .service("id_generator", IdGeneratorService::new())
        .build()
        .unwrap()
}

async fn database(registry: &Registry) -> Arc<MemoryDatabase> {
    let db = MemoryDatabase::new(registry.config().clone());
    db.create_table(TableSchema::new("ticket", ["ticket_id"]).soft_delete())
        .await
        .unwrap();
    db.create_table(DomainEventAggregate::table_schema()).await.unwrap();
    db.create_table(JobAggregate::table_schema()).await.unwrap();
    for table in RecurringJobAggregate::table_schemas() {
        db.create_table(table).await.unwrap();
    }
    let ids = registry.service::<IdGeneratorService>("id_generator").unwrap();
    db.create_table(ids.table_schema()).await.unwrap();
    db
}

#[test]
fn test_job_failure_scenario() {
    let ctx = RequestContext::default();
    let mut job = JobAggregate::create(
        attrs! { "job_id" => "job1", "status" => AsyncJobStatus::Created, "tries" => 0 },
        &ctx,
    )
    .unwrap();
    job.mark_persisted();

    job.update_status(AsyncJobStatus::Failed, "boom", false).unwrap();

    assert_eq!(job.tries(), 1);
    assert_eq!(job.status().unwrap(), AsyncJobStatus::Failed);
    assert_eq!(job.response(), Some("boom"));
    let dirty = job.entity_mut().dirty().unwrap();
    assert_eq!(dirty["data"]["status"]["data"]["new"], "failed");
    assert_eq!(dirty["data"]["tries"]["data"], json!({"old": 0, "new": 1}));
    assert_eq!(dirty["data"]["response"]["data"]["new"], "boom");
}

#[tokio::test]
async fn test_worker_picks_up_due_jobs_once() {
    let registry = registry();
    let db = database(&registry).await;
    let ctx = RequestContext::default();
    let jobs = registry.repository::<JobRepository>("jobs").unwrap();

    let now = chrono::Utc::now();
    let mut due = JobFactory::create_job("email", json!({"to": "a@b.c"}), Some(now), &ctx).unwrap();
    jobs.save(&db.session(), &mut due).await.unwrap();
    let mut future =
        JobFactory::create_job("email", json!({}), Some(now + Duration::hours(1)), &ctx).unwrap();
    jobs.save(&db.session(), &mut future).await.unwrap();

    let worker = db.begin().await.unwrap();
    let mut picked = jobs.get_jobs(&worker, &ctx, now, true).await.unwrap();
    assert_eq!(picked.len(), 1);
    assert_eq!(picked[0].job_data().data, json!({"to": "a@b.c"}));
    picked[0]
        .update_status(AsyncJobStatus::Processing, "", false)
        .unwrap();
    jobs.update_all(&worker, &mut picked, false).await.unwrap();
    worker.commit().await.unwrap();

    let again = jobs.get_jobs(&db.session(), &ctx, now, false).await.unwrap();
    assert!(again.is_empty());
    assert_eq!(
        jobs.count(&db.session(), &ctx, Filter::new()).await.unwrap(),
        2
    );
    assert_eq!(JOB_TABLE, "job");
}

#[tokio::test]
async fn test_recurring_job_issues_runs() {
    let registry = registry();
    let db = database(&registry).await;
    let session = db.session();
    let ctx = RequestContext::default();
    let recurring_jobs = registry
        .repository::<RecurringJobRepository>("recurring_jobs")
        .unwrap();
    let jobs = registry.repository::<JobRepository>("jobs").unwrap();

    let schedule = RecurringJobSchedule::new(IntervalUnit::Days, 1)
        .at(NaiveTime::from_hms_opt(2, 0, 0).unwrap());
    let mut nightly =
        JobFactory::create_recurring_job("nightly", "cleanup", json!({}), schedule, true, &ctx)
            .unwrap();
    let first_run = nightly.next_run_datetime().unwrap();
    recurring_jobs.save(&session, &mut nightly).await.unwrap();

    let mut paused =
        JobFactory::create_recurring_job("paused", "cleanup", json!({}), schedule, false, &ctx)
            .unwrap();
    recurring_jobs.save(&session, &mut paused).await.unwrap();

    let mut due = recurring_jobs
        .get_jobs(&session, &ctx, first_run, true)
        .await
        .unwrap();
    assert_eq!(due.len(), 1);

    let recurring = &mut due[0];
    let mut job = JobFactory::create_job("cleanup", json!({}), Some(first_run), &ctx).unwrap();
    recurring.log_run(&job).unwrap();
    jobs.save(&session, &mut job).await.unwrap();
    recurring_jobs.update(&session, recurring).await.unwrap();

    let stored = recurring_jobs
        .load(&session, &ctx, &nightly.primary_id(), None, false)
        .await
        .unwrap();
    assert_eq!(stored.next_run_datetime(), Some(first_run + Duration::days(1)));
    assert_eq!(stored.entity_set("run_log").unwrap().len(), 1);
    assert_eq!(stored.get_str("status"), Some("enqueue"));
    assert!(
        recurring_jobs
            .get_jobs(&session, &ctx, first_run, false)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(RECURRING_JOB_TABLE, "recurring_job");
}

#[tokio::test]
async fn test_domain_events_follow_aggregate_changes() {
    let registry = registry();
    let db = database(&registry).await;
    let ctx = RequestContext::default();
    let tickets = registry
        .repository::<AggregateRepository<TicketAggregate>>("tickets")
        .unwrap();
    let event_repository = registry
        .repository::<AggregateRepository<DomainEventAggregate>>("domain_events")
        .unwrap();
    let sink = Arc::new(InMemoryEventSink::new());
    let mut events = DomainEventService::new((*event_repository).clone(), sink.clone())
        .with_transaction_id("txn-1");

    let session = db.begin().await.unwrap();
    let mut ticket = TicketAggregate::create(
        attrs! { "ticket_id" => "t1", "title" => "Printer on fire" },
        &ctx,
    )
    .unwrap();
    events
        .writer("support", &ctx)
        .write(ticket.entity_mut(), None)
        .unwrap();
    tickets.save(&session, &mut ticket).await.unwrap();

    ticket.set("title", "Printer still on fire").unwrap();
    events
        .writer("support", &ctx)
        .write(ticket.entity_mut(), None)
        .unwrap();
    tickets.update(&session, &mut ticket).await.unwrap();

    let committed = events.commit_all(&session).await.unwrap();
    session.commit().await.unwrap();
    assert_eq!(committed.len(), 1);

    let session = db.session();
    let stored = events
        .get_events_by_transaction_id(&session, &ctx, "txn-1")
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    let updates = stored[0].updates().unwrap();
    let kinds: Vec<UpdateType> = updates.iter().map(|u| u.event_type).collect();
    assert_eq!(kinds, [UpdateType::Created, UpdateType::Updated]);
    assert_eq!(updates[1].version, 2);

    assert_eq!(events.publish_latest(&session, &ctx, None).await.unwrap(), (1, 0));
    assert_eq!(sink.len().await, 1);
    let published = events
        .get_event(&session, &ctx, &stored[0].event_id())
        .await
        .unwrap();
    assert_eq!(published.status().unwrap(), DomainEventStatus::Published);
}

#[tokio::test]
async fn test_id_generator_from_registry() {
    let registry = registry();
    let db = database(&registry).await;
    let ids = registry.service::<IdGeneratorService>("id_generator").unwrap();

    let first = db
        .with_transaction(|session| {
            let ids = Arc::clone(&ids);
            async move { ids.generate_prefixed_id(&session, "ticket", Some("TCK")).await }
        })
        .await
        .unwrap();
    let second = ids
        .generate_prefixed_id(&db.session(), "ticket", Some("TCK"))
        .await
        .unwrap();
    assert_eq!(first, "TCK1");
    assert_eq!(second, "TCK2");
}

#[test]
fn test_registry_rejects_unmapped_children() {
    let result = Registry::builder(FrameworkConfig::new())
        .aggregate::<RecurringJobAggregate>(RecurringJobAggregate::record_mapping())
        .build();
    assert!(matches!(result, Err(DomainError::Configuration(_))));
}
