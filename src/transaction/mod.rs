// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Read-committed transactions over the MVCC tables in `storage`. Row writes
// are versioned with the writing transaction id and become visible to other
// transactions once it commits.
//
// ============================================================================

pub mod change;
pub mod manager;
pub mod state;

pub use change::Change;
pub use manager::TransactionManager;
pub use state::{Transaction, TransactionId, TransactionState};
