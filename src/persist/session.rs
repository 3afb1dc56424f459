use crate::core::{DomainError, Result, Value};
use crate::storage::{Filter, QueryOptions, Record, TableSchema};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Row-level persistence surface the adapter and repositories are written
/// against. Every call runs inside the session's transaction when it has one.
#[async_trait]
pub trait Session: Send + Sync {
    async fn table_schema(&self, table: &str) -> Result<TableSchema>;

    async fn query(
        &self,
        table: &str,
        filter: &Filter,
        options: &QueryOptions,
    ) -> Result<Vec<Record>>;

    /// Rows whose columns equal every given value.
    async fn filter_by(
        &self,
        table: &str,
        columns: &BTreeMap<String, Value>,
    ) -> Result<Vec<Record>> {
        let filter = Filter::from_columns(columns.iter());
        self.query(table, &filter, &QueryOptions::new()).await
    }

    /// At most one matching row. Several matches is a validation failure.
    async fn get(&self, table: &str, filter: &Filter) -> Result<Option<Record>> {
        let records = self.query(table, filter, &QueryOptions::new()).await?;
        single(table, records)
    }

    async fn query_for_update(
        &self,
        table: &str,
        filter: &Filter,
        options: &QueryOptions,
        nowait: bool,
    ) -> Result<Vec<Record>>;

    async fn get_for_update(
        &self,
        table: &str,
        filter: &Filter,
        nowait: bool,
    ) -> Result<Option<Record>> {
        let records = self
            .query_for_update(table, filter, &QueryOptions::new(), nowait)
            .await?;
        single(table, records)
    }

    async fn add(&self, record: Record) -> Result<()>;

    async fn add_all(&self, records: Vec<Record>) -> Result<()> {
        for record in records {
            self.add(record).await?;
        }
        Ok(())
    }

    /// Insert, or overwrite the row holding the same primary key.
    async fn merge(&self, record: Record) -> Result<()>;

    /// Removes the row with the record's primary key, if there is one.
    async fn delete(&self, record: &Record) -> Result<()>;

    /// Sets `values` on every matching row and returns how many changed.
    async fn update_where(
        &self,
        table: &str,
        filter: &Filter,
        values: BTreeMap<String, Value>,
    ) -> Result<usize>;

    /// Number of writes issued since the previous flush.
    async fn flush(&self) -> Result<usize>;
}

fn single(table: &str, mut records: Vec<Record>) -> Result<Option<Record>> {
    match records.len() {
        0 => Ok(None),
        1 => Ok(records.pop()),
        count => Err(DomainError::validation(format!(
            "Multiple objects found in {} where one was expected ({} rows)",
            table, count
        ))),
    }
}
