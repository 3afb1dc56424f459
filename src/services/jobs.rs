//! Asynchronous jobs: one-off jobs, recurring schedules and the repositories
//! workers poll for due work.

use crate::common::dateutils::utcnow;
use crate::common::generate_id_with_prefix;
use crate::core::{DomainError, RequestContext, Result, Value};
use crate::persist::{AggregateQuery, AggregateRepository, RecordMapping, Session};
use crate::storage::{Filter, QueryOptions, SortOrder, TableSchema};
use crate::types::{
    Aggregate, BaseEnum, ElementType, EntitySchema, FieldInfo, ValueObject, ValueObjectSchema,
};
use chrono::{DateTime, Months, NaiveTime, TimeDelta, Timelike, Utc};
use log::info;
use serde::Serialize;
use std::ops::Deref;
use std::sync::Arc;

pub const JOB_TABLE: &str = "job";
pub const RECURRING_JOB_TABLE: &str = "recurring_job";
pub const RECURRING_JOB_RUN_LOG_TABLE: &str = "recurring_job_run_log";

crate::base_enum! {
    pub enum AsyncJobStatus {
        Created = "created" ("Created"),
        Enqueue = "enqueue" ("Enqueue"),
        Processing = "processing" ("Processing"),
        Failed = "failed" ("Failed"),
        Finished = "finished" ("Finished"),
        Closed = "closed" ("Closed"),
    }
}

crate::base_enum! {
    pub enum IntervalUnit {
        Seconds = "seconds" ("Seconds"),
        Minutes = "minutes" ("Minutes"),
        Hours = "hours" ("Hours"),
        Days = "days" ("Days"),
        Weeks = "weeks" ("Weeks"),
        Months = "months" ("Months"),
    }
}

fn now() -> Value {
    Value::Timestamp(utcnow())
}

fn empty_object() -> Value {
    Value::Json(serde_json::Value::Object(serde_json::Map::new()))
}

// ---- job -------------------------------------------------------------------

fn job_schema() -> Result<Arc<EntitySchema>> {
    EntitySchema::builder("JobAggregate")
        .multi_tenant()
        .id_prefix("job")
        .field(FieldInfo::string("job_id").primary_key())
        .field(FieldInfo::json("extra_data").default_factory(empty_object))
        .field(FieldInfo::datetime("run_time").optional())
        .field(FieldInfo::string("job_name").optional())
        .field(FieldInfo::enumeration("status", AsyncJobStatus::enum_type()))
        .field(FieldInfo::string("response").optional())
        .field(FieldInfo::integer("tries").default_value(0))
        .field(FieldInfo::datetime("created_at").default_factory(now))
        .field(FieldInfo::datetime("modified_at").default_factory(now))
        .build()
}

crate::aggregate! {
    /// A unit of background work run once at or after `run_time`.
    pub struct JobAggregate => job_schema;
}

/// What a worker needs to run a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobData {
    pub job_id: String,
    pub job_name: Option<String>,
    pub run_time: Option<DateTime<Utc>>,
    pub data: serde_json::Value,
}

impl JobAggregate {
    pub fn record_mapping() -> RecordMapping {
        RecordMapping::new(JOB_TABLE)
    }

    pub fn table_schema() -> TableSchema {
        TableSchema::new(JOB_TABLE, ["job_id"]).soft_delete()
    }

    pub fn job_id(&self) -> String {
        self.primary_id()
    }

    pub fn status(&self) -> Result<AsyncJobStatus> {
        self.get_enum("status")
    }

    pub fn tries(&self) -> i64 {
        self.get_i64("tries").unwrap_or_default()
    }

    pub fn response(&self) -> Option<&str> {
        self.get_str("response")
    }

    pub fn run_time(&self) -> Option<DateTime<Utc>> {
        self.get_timestamp("run_time")
    }

    /// Moves the job to `status`. A failure counts as one more try. With
    /// `append`, a non-empty response is added to the one already stored.
    pub fn update_status(
        &mut self,
        status: AsyncJobStatus,
        response: &str,
        append: bool,
    ) -> Result<()> {
        if status == AsyncJobStatus::Failed {
            let tries = self.tries();
            self.set("tries", tries + 1)?;
        }
        self.set("status", status)?;
        let response = match self.response() {
            Some(current) if append && !current.is_empty() && !response.is_empty() => {
                format!("{}{}", current, response)
            }
            _ => response.to_string(),
        };
        self.set("response", response)?;
        self.set("modified_at", utcnow())
    }

    pub fn job_data(&self) -> JobData {
        JobData {
            job_id: self.job_id(),
            job_name: self.get_str("job_name").map(str::to_string),
            run_time: self.run_time(),
            data: self.value("extra_data").to_json(),
        }
    }
}

// ---- recurring schedule ----------------------------------------------------

fn schedule_schema() -> Result<Arc<ValueObjectSchema>> {
    ValueObjectSchema::builder("RecurringJobSchedule")
        .field(FieldInfo::enumeration("interval_type", IntervalUnit::enum_type()))
        .field(FieldInfo::integer("interval"))
        .field(FieldInfo::new("when", ElementType::Time).optional())
        .build()
}

lazy_static::lazy_static! {
    static ref SCHEDULE_SCHEMA: Result<Arc<ValueObjectSchema>> = schedule_schema();
}

/// Every `interval` units, optionally pinned to a time of day. `when` pins
/// the seconds for minute schedules, minutes and seconds for hourly ones and
/// the full time of day for anything longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecurringJobSchedule {
    pub interval_type: IntervalUnit,
    pub interval: u32,
    pub when: Option<NaiveTime>,
}

impl RecurringJobSchedule {
    pub fn new(interval_type: IntervalUnit, interval: u32) -> Self {
        Self {
            interval_type,
            interval,
            when: None,
        }
    }

    pub fn at(mut self, when: NaiveTime) -> Self {
        self.when = Some(when);
        self
    }

    pub fn schema() -> Result<Arc<ValueObjectSchema>> {
        SCHEDULE_SCHEMA.clone()
    }

    pub fn to_value_object(&self) -> Result<ValueObject> {
        ValueObject::new(
            &Self::schema()?,
            crate::attrs! {
                "interval_type" => self.interval_type,
                "interval" => i64::from(self.interval),
                "when" => self.when,
            },
        )
    }

    pub fn from_value_object(vo: &ValueObject) -> Result<Self> {
        let interval_type = IntervalUnit::parse(vo.str("interval_type").unwrap_or_default())?;
        let interval = vo
            .value("interval")
            .as_i64()
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| DomainError::validation("Schedule interval must be a positive integer"))?;
        let when = match vo.value("when") {
            Value::Time(t) => Some(*t),
            _ => None,
        };
        Ok(Self {
            interval_type,
            interval,
            when,
        })
    }

    pub fn next_run(&self, last_run: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if self.interval == 0 {
            return Err(DomainError::validation("Schedule interval must be positive"));
        }
        let count = i64::from(self.interval);
        let next = match self.interval_type {
            IntervalUnit::Seconds => Some(last_run + TimeDelta::seconds(count)),
            IntervalUnit::Minutes => Some(last_run + TimeDelta::minutes(count)),
            IntervalUnit::Hours => Some(last_run + TimeDelta::hours(count)),
            IntervalUnit::Days => Some(last_run + TimeDelta::days(count)),
            IntervalUnit::Weeks => Some(last_run + TimeDelta::weeks(count)),
            IntervalUnit::Months => last_run.checked_add_months(Months::new(self.interval)),
        };
        let pinned = match (next, self.when) {
            (Some(next), Some(when)) => match self.interval_type {
                IntervalUnit::Seconds => Some(next),
                IntervalUnit::Minutes => next.with_second(when.second()),
                IntervalUnit::Hours => next
                    .with_minute(when.minute())
                    .and_then(|t| t.with_second(when.second())),
                _ => Some(next.date_naive().and_time(when).and_utc()),
            },
            (next, None) => next,
            (None, _) => None,
        };
        pinned.ok_or_else(|| {
            DomainError::InvalidState(format!("No next run time found for schedule {:?}", self))
        })
    }
}

// ---- recurring job ---------------------------------------------------------

fn run_log_schema() -> Result<Arc<EntitySchema>> {
    EntitySchema::builder("RecurringJobRunLogEntity")
        .multi_tenant()
        .field(FieldInfo::string("recurring_job_run_log_id").primary_key())
        .field(FieldInfo::string("job_id"))
        .field(FieldInfo::enumeration("status", AsyncJobStatus::enum_type()))
        .field(FieldInfo::datetime("run_datetime").optional())
        .build()
}

fn recurring_job_schema() -> Result<Arc<EntitySchema>> {
    EntitySchema::builder("RecurringJobAggregate")
        .multi_tenant()
        .id_prefix("rjob")
        .field(FieldInfo::string("recurring_job_id").primary_key())
        .field(FieldInfo::json("extra_data").default_factory(empty_object))
        .field(FieldInfo::string("name"))
        .field(FieldInfo::string("job_name").optional())
        .field(FieldInfo::datetime("last_run_datetime").optional())
        .field(FieldInfo::datetime("next_run_datetime").optional())
        .field(FieldInfo::enumeration("status", AsyncJobStatus::enum_type()))
        .field(FieldInfo::boolean("is_active").default_value(true))
        .field(FieldInfo::value_object("schedule", RecurringJobSchedule::schema()?))
        .field(FieldInfo::entity_set("run_log", run_log_schema()?))
        .field(FieldInfo::boolean("schedule_pending").default_value(false))
        .field(FieldInfo::datetime("created_at").default_factory(now))
        .field(FieldInfo::datetime("modified_at").default_factory(now))
        .build()
}

crate::aggregate! {
    /// A job template re-issued on a schedule, with a log of the runs so far.
    pub struct RecurringJobAggregate => recurring_job_schema;
}

impl RecurringJobAggregate {
    pub fn record_mapping() -> RecordMapping {
        RecordMapping::new(RECURRING_JOB_TABLE)
    }

    pub fn run_log_mapping() -> RecordMapping {
        RecordMapping::new(RECURRING_JOB_RUN_LOG_TABLE)
    }

    pub fn run_log_schema() -> Result<Arc<EntitySchema>> {
        run_log_schema()
    }

    pub fn table_schemas() -> [TableSchema; 2] {
        [
            TableSchema::new(RECURRING_JOB_TABLE, ["recurring_job_id"]).soft_delete(),
            TableSchema::new(
                RECURRING_JOB_RUN_LOG_TABLE,
                ["recurring_job_id", "recurring_job_run_log_id"],
            )
            .soft_delete(),
        ]
    }

    pub fn schedule(&self) -> Result<RecurringJobSchedule> {
        match self.value("schedule") {
            Value::Object(vo) => RecurringJobSchedule::from_value_object(vo),
            other => Err(DomainError::InvalidState(format!(
                "{} is not a schedule",
                other
            ))),
        }
    }

    pub fn next_run_datetime(&self) -> Option<DateTime<Utc>> {
        self.get_timestamp("next_run_datetime")
    }

    pub fn update_next_run_datetime(&mut self, last_run: DateTime<Utc>) -> Result<()> {
        let next = self.schedule()?.next_run(last_run)?;
        self.set("next_run_datetime", next)
    }

    /// Records that `job` was issued for this schedule and advances it.
    pub fn log_run(&mut self, job: &JobAggregate) -> Result<()> {
        let run_time = job.run_time().unwrap_or_else(utcnow);
        self.set("status", AsyncJobStatus::Enqueue)?;
        self.set("last_run_datetime", run_time)?;
        self.update_next_run_datetime(run_time)?;
        self.entity_set_mut("run_log")?.add(crate::attrs! {
            "job_id" => job.job_id(),
            "status" => AsyncJobStatus::Created,
            "run_datetime" => run_time,
        })?;
        Ok(())
    }
}

// ---- factory ---------------------------------------------------------------

pub struct JobFactory;

impl JobFactory {
    /// New job in the created state, due at `run_time` or now.
    pub fn create_job(
        job_name: &str,
        extra_data: serde_json::Value,
        run_time: Option<DateTime<Utc>>,
        context: &RequestContext,
    ) -> Result<JobAggregate> {
        let prefix = JobAggregate::schema()?.id_prefix().to_string();
        JobAggregate::create(
            crate::attrs! {
                "job_id" => generate_id_with_prefix(&prefix, None, context.id_suffix_length()),
                "job_name" => job_name,
                "extra_data" => extra_data,
                "run_time" => run_time.unwrap_or_else(utcnow),
                "status" => AsyncJobStatus::Created,
            },
            context,
        )
    }

    pub fn create_recurring_job(
        name: &str,
        job_name: &str,
        extra_data: serde_json::Value,
        schedule: RecurringJobSchedule,
        is_active: bool,
        context: &RequestContext,
    ) -> Result<RecurringJobAggregate> {
        let prefix = RecurringJobAggregate::schema()?.id_prefix().to_string();
        let mut job = RecurringJobAggregate::create(
            crate::attrs! {
                "recurring_job_id" => generate_id_with_prefix(&prefix, None, context.id_suffix_length()),
                "name" => name,
                "job_name" => job_name,
                "extra_data" => extra_data,
                "status" => AsyncJobStatus::Created,
                "is_active" => is_active,
                "schedule" => schedule.to_value_object()?,
            },
            context,
        )?;
        job.update_next_run_datetime(utcnow())?;
        Ok(job)
    }
}

// ---- repositories ----------------------------------------------------------

/// Job storage with the polling query workers use.
pub struct JobRepository {
    inner: AggregateRepository<JobAggregate>,
}

impl Deref for JobRepository {
    type Target = AggregateRepository<JobAggregate>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl JobRepository {
    pub fn new(inner: AggregateRepository<JobAggregate>) -> Self {
        Self { inner }
    }

    /// Created jobs due at or before `run_at`, oldest first. With
    /// `for_update` the rows stay locked until the transaction ends.
    pub async fn get_jobs(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        run_at: DateTime<Utc>,
        for_update: bool,
    ) -> Result<Vec<JobAggregate>> {
        let filter = Filter::new()
            .eq("status", AsyncJobStatus::Created)
            .lte("run_time", run_at);
        let query = AggregateQuery::new(filter)
            .options(QueryOptions::new().order_by("created_at", SortOrder::Asc))
            .lock(self.inner.lock_mode(for_update));
        let jobs = self.inner.load_where(session, context, query).await?;
        if !jobs.is_empty() {
            info!("Picked up {} due jobs", jobs.len());
        }
        Ok(jobs)
    }
}

pub struct RecurringJobRepository {
    inner: AggregateRepository<RecurringJobAggregate>,
}

impl Deref for RecurringJobRepository {
    type Target = AggregateRepository<RecurringJobAggregate>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl RecurringJobRepository {
    pub fn new(inner: AggregateRepository<RecurringJobAggregate>) -> Self {
        Self { inner }
    }

    /// Active schedules whose next run is at or before `run_at`.
    pub async fn get_jobs(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        run_at: DateTime<Utc>,
        for_update: bool,
    ) -> Result<Vec<RecurringJobAggregate>> {
        let filter = Filter::new()
            .lte("next_run_datetime", run_at)
            .eq("is_active", true);
        let query = AggregateQuery::new(filter)
            .options(QueryOptions::new().order_by("created_at", SortOrder::Asc))
            .lock(self.inner.lock_mode(for_update));
        self.inner.load_where(session, context, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use crate::core::FrameworkConfig;
    use crate::persist::{DbAdapter, EntityMap, MemoryDatabase};
    use crate::types::DirtyTrackable;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 31, h, m, s).unwrap()
    }

    fn adapter() -> Arc<DbAdapter> {
        Arc::new(DbAdapter::new(Arc::new(
            EntityMap::new()
                .with("JobAggregate", JobAggregate::record_mapping())
                .with("RecurringJobAggregate", RecurringJobAggregate::record_mapping())
                .with("RecurringJobRunLogEntity", RecurringJobAggregate::run_log_mapping()),
        )))
    }

    async fn database() -> Arc<MemoryDatabase> {
        let db = MemoryDatabase::new(FrameworkConfig::new());
        db.create_table(JobAggregate::table_schema()).await.unwrap();
        for table in RecurringJobAggregate::table_schemas() {
            db.create_table(table).await.unwrap();
        }
        db
    }

    #[test]
    fn test_failed_status_counts_a_try() {
        let ctx = RequestContext::default();
        let mut job = JobAggregate::create(
            attrs! { "job_id" => "job1", "status" => AsyncJobStatus::Created, "tries" => 0 },
            &ctx,
        )
        .unwrap();
        job.update_status(AsyncJobStatus::Failed, "boom", true).unwrap();

        assert_eq!(job.tries(), 1);
        assert_eq!(job.status().unwrap(), AsyncJobStatus::Failed);
        assert_eq!(job.response(), Some("boom"));
        let dirty = job.entity_mut().dirty().unwrap();
        for key in ["status", "tries", "response"] {
            assert!(dirty["data"].get(key).is_some(), "{} missing from dirty", key);
        }

        job.update_status(AsyncJobStatus::Failed, " again", true).unwrap();
        assert_eq!(job.response(), Some("boom again"));
        job.update_status(AsyncJobStatus::Finished, "done", false).unwrap();
        assert_eq!(job.response(), Some("done"));
        assert_eq!(job.tries(), 2);
    }

    #[test]
    fn test_schedule_next_run() {
        let every_two_hours = RecurringJobSchedule::new(IntervalUnit::Hours, 2)
            .at(NaiveTime::from_hms_opt(0, 15, 0).unwrap());
        assert_eq!(every_two_hours.next_run(at(9, 40, 12)).unwrap(), at(11, 15, 0));

        let daily = RecurringJobSchedule::new(IntervalUnit::Days, 1)
            .at(NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        assert_eq!(
            daily.next_run(at(22, 0, 0)).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 6, 0, 0).unwrap()
        );

        let monthly = RecurringJobSchedule::new(IntervalUnit::Months, 1);
        assert_eq!(
            monthly.next_run(at(8, 0, 0)).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 29, 8, 0, 0).unwrap()
        );

        assert!(RecurringJobSchedule::new(IntervalUnit::Seconds, 0)
            .next_run(at(8, 0, 0))
            .is_err());
    }

    #[test]
    fn test_log_run_appends_to_run_log() {
        let ctx = RequestContext::default();
        let schedule = RecurringJobSchedule::new(IntervalUnit::Minutes, 30);
        let mut recurring =
            JobFactory::create_recurring_job("nightly", "cleanup", json!({}), schedule, true, &ctx)
                .unwrap();
        assert_eq!(recurring.schedule().unwrap(), schedule);

        let job = JobFactory::create_job("cleanup", json!({"scope": "all"}), Some(at(1, 0, 0)), &ctx)
            .unwrap();
        recurring.log_run(&job).unwrap();

        assert_eq!(recurring.next_run_datetime(), Some(at(1, 30, 0)));
        let run_log = recurring.entity_set("run_log").unwrap();
        assert_eq!(run_log.len(), 1);
        let entry = run_log.iter().next().unwrap();
        assert_eq!(entry.get_str("job_id"), Some(job.job_id().as_str()));
        assert!(job.job_id().starts_with("job-"));
        assert_eq!(job.job_data().data, json!({"scope": "all"}));
    }

    #[tokio::test]
    async fn test_get_jobs_returns_due_created_jobs_in_order() {
        let db = database().await;
        let session = db.session();
        let ctx = RequestContext::default();
        let repository = JobRepository::new(AggregateRepository::new(adapter()));

        let mut due = Vec::new();
        for (minute, (name, run_time)) in [("first", at(2, 0, 0)), ("second", at(1, 0, 0))]
            .into_iter()
            .enumerate()
        {
            let mut job = JobFactory::create_job(name, json!({}), Some(run_time), &ctx).unwrap();
            job.set("created_at", at(0, minute as u32, 0)).unwrap();
            repository.save(&session, &mut job).await.unwrap();
            due.push(job.job_id());
        }
        let mut later = JobFactory::create_job("later", json!({}), Some(at(5, 0, 0)), &ctx).unwrap();
        repository.save(&session, &mut later).await.unwrap();
        let mut finished = JobFactory::create_job("done", json!({}), Some(at(1, 0, 0)), &ctx).unwrap();
        finished.update_status(AsyncJobStatus::Finished, "ok", false).unwrap();
        repository.save(&session, &mut finished).await.unwrap();

        let jobs = repository.get_jobs(&session, &ctx, at(3, 0, 0), false).await.unwrap();
        let ids: Vec<String> = jobs.iter().map(JobAggregate::job_id).collect();
        assert_eq!(ids, due);
    }

    #[tokio::test]
    async fn test_get_jobs_locks_rows() {
        let db = database().await;
        let ctx = RequestContext::default();
        let repository = JobRepository::new(AggregateRepository::new(adapter()));
        let mut job = JobFactory::create_job("sync", json!({}), Some(at(1, 0, 0)), &ctx).unwrap();
        repository.save(&db.session(), &mut job).await.unwrap();

        let worker = db.begin().await.unwrap();
        assert_eq!(repository.get_jobs(&worker, &ctx, at(2, 0, 0), true).await.unwrap().len(), 1);

        let other = db.begin().await.unwrap();
        let result = repository.get_jobs(&other, &ctx, at(2, 0, 0), true).await;
        assert!(matches!(result, Err(DomainError::Lock(_))));
        worker.commit().await.unwrap();
        other.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_recurring_job_round_trip() {
        let db = database().await;
        let session = db.session();
        let ctx = RequestContext::default();
        let repository = RecurringJobRepository::new(AggregateRepository::new(adapter()));
        let schedule = RecurringJobSchedule::new(IntervalUnit::Days, 1)
            .at(NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        let mut recurring =
            JobFactory::create_recurring_job("daily", "report", json!({}), schedule, true, &ctx)
                .unwrap();
        let job = JobFactory::create_job("report", json!({}), Some(at(6, 0, 0)), &ctx).unwrap();
        recurring.log_run(&job).unwrap();
        repository.save(&session, &mut recurring).await.unwrap();

        let loaded = repository
            .load(&session, &ctx, &recurring.primary_id(), None, false)
            .await
            .unwrap();
        assert_eq!(loaded.schedule().unwrap(), schedule);
        assert_eq!(loaded.next_run_datetime(), recurring.next_run_datetime());
        assert_eq!(loaded.entity_set("run_log").unwrap().len(), 1);

        let due = repository
            .get_jobs(&session, &ctx, Utc.with_ymd_and_hms(2024, 2, 1, 6, 0, 0).unwrap(), false)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
    }
}
