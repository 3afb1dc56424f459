pub mod filter;
pub mod memory;
pub mod record;
pub mod table;

pub use filter::{Condition, Filter, QueryOptions, SortOrder};
pub use memory::InMemoryStorage;
pub use record::Record;
pub use table::{Snapshot, Table, TableSchema};
