use crate::core::{DomainError, Result, Value};
use crate::persist::Session;
use crate::storage::{Filter, Record, TableSchema};
use tracing::{Level, event};

pub const ID_GENERATOR_TABLE: &str = "id_generator";
const SCOPE: &str = "scope";
const COUNTER: &str = "counter";

/// Sequential counters, one per scope, kept in a table row that is locked for
/// the rest of the caller's transaction.
#[derive(Debug, Clone)]
pub struct IdGeneratorService {
    table: String,
}

impl Default for IdGeneratorService {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGeneratorService {
    pub fn new() -> Self {
        Self {
            table: ID_GENERATOR_TABLE.to_string(),
        }
    }

    pub fn with_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// Layout of the backing table, keyed by scope.
    pub fn table_schema(&self) -> TableSchema {
        TableSchema::new(self.table.as_str(), [SCOPE])
    }

    /// Next counter value for `scope`. The first call for a scope yields 1.
    pub async fn generate_id(&self, session: &dyn Session, scope: &str) -> Result<i64> {
        let filter = Filter::new().eq(SCOPE, scope);
        let next = match session.get_for_update(&self.table, &filter, false).await? {
            Some(mut row) => {
                let current = row.get(COUNTER).as_i64().ok_or_else(|| {
                    DomainError::Database(format!(
                        "{} holds a non-numeric counter for scope {}",
                        self.table, scope
                    ))
                })?;
                row.set(COUNTER, current + 1);
                session.merge(row).await?;
                current + 1
            }
            None => {
                session
                    .add(Record::new(self.table.as_str()).with(SCOPE, scope).with(COUNTER, 1))
                    .await?;
                1
            }
        };
        session.flush().await?;
        event!(Level::DEBUG, scope = %scope, id = next, "id generated");
        Ok(next)
    }

    /// Counter value behind an optional prefix, e.g. `INV42`.
    pub async fn generate_prefixed_id(
        &self,
        session: &dyn Session,
        scope: &str,
        prefix: Option<&str>,
    ) -> Result<String> {
        let id = self.generate_id(session, scope).await?;
        Ok(match prefix {
            Some(prefix) => format!("{}{}", prefix, id),
            None => Value::Integer(id).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FrameworkConfig;
    use crate::persist::MemoryDatabase;

    #[tokio::test]
    async fn test_counters_are_per_scope() {
        let service = IdGeneratorService::new();
        let db = MemoryDatabase::new(FrameworkConfig::new());
        db.create_table(service.table_schema()).await.unwrap();
        let session = db.session();

        assert_eq!(service.generate_id(&session, "invoice").await.unwrap(), 1);
        assert_eq!(service.generate_id(&session, "invoice").await.unwrap(), 2);
        assert_eq!(service.generate_id(&session, "order").await.unwrap(), 1);
        assert_eq!(
            service
                .generate_prefixed_id(&session, "invoice", Some("INV"))
                .await
                .unwrap(),
            "INV3"
        );
    }

    #[tokio::test]
    async fn test_rolled_back_ids_are_reissued() {
        let service = IdGeneratorService::new();
        let db = MemoryDatabase::new(FrameworkConfig::new());
        db.create_table(service.table_schema()).await.unwrap();

        let session = db.begin().await.unwrap();
        assert_eq!(service.generate_id(&session, "invoice").await.unwrap(), 1);
        session.rollback().await.unwrap();

        assert_eq!(service.generate_id(&db.session(), "invoice").await.unwrap(), 1);
    }
}
