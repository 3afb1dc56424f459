/// A row write recorded by a transaction, kept for flush accounting and
/// diagnostics. Storage is already versioned, so nothing is replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Insert { table: String, key: String },
    Update { table: String, key: String },
    Delete { table: String, key: String },
}

impl Change {
    pub fn table(&self) -> &str {
        match self {
            Change::Insert { table, .. }
            | Change::Update { table, .. }
            | Change::Delete { table, .. } => table,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Change::Insert { key, .. } | Change::Update { key, .. } | Change::Delete { key, .. } => {
                key
            }
        }
    }
}
