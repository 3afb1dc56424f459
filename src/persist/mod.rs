//! Aggregate persistence: sessions over the in-memory store, the mapping from
//! entity trees to table rows, and the repositories built on top of them.

pub mod db_adapter;
pub mod entity_map;
pub mod memory_session;
pub mod registry;
pub mod relationship_repository;
pub mod repository;
pub mod session;

pub use db_adapter::{AggregateQuery, DbAdapter, LockMode, make_db_ready};
pub use entity_map::{EntityMap, ListAttributeInfo, RecordMapping};
pub use memory_session::{MemoryDatabase, MemorySession};
pub use registry::{Registry, RegistryBuilder};
pub use relationship_repository::{RelationshipRepository, RelationshipService};
pub use repository::AggregateRepository;
pub use session::Session;
