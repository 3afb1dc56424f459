// ============================================================================
// dddkit Library
// ============================================================================
//
// Domain-driven building blocks: typed entities and aggregates with change
// journals, value objects and enums, and repositories that persist aggregate
// trees into row tables inside read-committed transactions.
//
// ============================================================================

pub mod common;
pub mod core;
pub mod persist;
pub mod prelude;
pub mod services;
pub mod storage;
pub mod transaction;
pub mod types;

pub use core::{DomainError, Result, Value};

#[doc(hidden)]
pub use lazy_static;
