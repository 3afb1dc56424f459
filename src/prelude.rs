//! The names most application code needs, in one import.
//!
//! ```
//! use dddkit::prelude::*;
//! ```

pub use crate::common::{ActionRequest, Money};
pub use crate::core::{
    CurrentUser, DomainError, FrameworkConfig, RequestContext, Result, UserRole, Value,
};
pub use crate::persist::{
    AggregateQuery, AggregateRepository, DbAdapter, EntityMap, MemoryDatabase, MemorySession,
    RecordMapping, Registry, Session,
};
pub use crate::storage::{Filter, QueryOptions, SortOrder, TableSchema};
pub use crate::types::{
    Aggregate, BaseEnum, DirtyTrackable, Entity, EntitySchema, FieldInfo, ValueObject,
    ValueObjectSchema,
};
pub use crate::{aggregate, attrs, base_enum};
