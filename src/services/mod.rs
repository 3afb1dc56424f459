//! Application services built on the persistence layer: sequential ids,
//! domain event journaling and background jobs.

pub mod domain_events;
pub mod id_generator;
pub mod jobs;

pub use domain_events::{
    DomainEventAggregate, DomainEventData, DomainEventPublisher, DomainEventService,
    DomainEventStatus, DomainEventWriter, InMemoryEventSink, UpdateType,
};
pub use id_generator::IdGeneratorService;
pub use jobs::{
    AsyncJobStatus, IntervalUnit, JobAggregate, JobData, JobFactory, JobRepository,
    RecurringJobAggregate, RecurringJobRepository, RecurringJobSchedule,
};
