use super::{Filter, Record, Table, TableSchema};
use crate::core::{DomainError, Result, Value};
use crate::storage::table::Snapshot;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Named tables, each behind its own lock.
pub struct InMemoryStorage {
    tables: RwLock<HashMap<String, Arc<RwLock<Table>>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create_table(&self, schema: TableSchema) -> Result<()> {
        let name = schema.name().to_string();
        let mut tables = self.tables.write().await;
        if tables.contains_key(&name) {
            return Err(DomainError::Configuration(format!(
                "Table {} already exists",
                name
            )));
        }
        tables.insert(name, Arc::new(RwLock::new(Table::new(schema))));
        Ok(())
    }

    pub async fn get_table(&self, name: &str) -> Result<Arc<RwLock<Table>>> {
        self.tables
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| DomainError::Database(format!("Table {} does not exist", name)))
    }

    pub async fn table_exists(&self, name: &str) -> bool {
        self.tables.read().await.contains_key(name)
    }

    pub async fn list_tables(&self) -> Vec<String> {
        self.tables.read().await.keys().cloned().collect()
    }

    pub async fn get_schema(&self, name: &str) -> Result<TableSchema> {
        let handle = self.get_table(name).await?;
        let table = handle.read().await;
        Ok(table.schema().clone())
    }

    pub async fn insert_row(
        &self,
        table_name: &str,
        values: BTreeMap<String, Value>,
        snapshot: &Snapshot,
    ) -> Result<usize> {
        let handle = self.get_table(table_name).await?;
        let mut table = handle.write().await;
        table.insert(values, snapshot)
    }

    pub async fn scan(
        &self,
        table_name: &str,
        filter: &Filter,
        snapshot: &Snapshot,
    ) -> Result<Vec<(usize, Record)>> {
        let handle = self.get_table(table_name).await?;
        let table = handle.read().await;
        table.scan(filter, snapshot)
    }

    pub async fn find_by_key(
        &self,
        table_name: &str,
        key: &str,
        snapshot: &Snapshot,
    ) -> Result<Option<(usize, Record)>> {
        let handle = self.get_table(table_name).await?;
        let table = handle.read().await;
        Ok(table.find_by_key(key, snapshot))
    }

    pub async fn update_row(
        &self,
        table_name: &str,
        id: usize,
        values: BTreeMap<String, Value>,
        snapshot: &Snapshot,
    ) -> Result<bool> {
        let handle = self.get_table(table_name).await?;
        let mut table = handle.write().await;
        table.update(id, values, snapshot)
    }

    pub async fn delete_row(&self, table_name: &str, id: usize, snapshot: &Snapshot) -> Result<bool> {
        let handle = self.get_table(table_name).await?;
        let mut table = handle.write().await;
        table.delete(id, snapshot)
    }

    pub async fn row_count(&self, table_name: &str) -> Result<usize> {
        let handle = self.get_table(table_name).await?;
        let table = handle.read().await;
        Ok(table.row_count())
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use std::collections::HashSet;

    fn snapshot(tx_id: u64) -> Snapshot {
        Snapshot {
            tx_id,
            active: Arc::new(HashSet::new()),
            aborted: Arc::new(HashSet::new()),
            max_tx_id: tx_id + 1,
        }
    }

    #[tokio::test]
    async fn test_create_and_scan() {
        let storage = InMemoryStorage::new();
        storage
            .create_table(TableSchema::new("job", ["job_id"]))
            .await
            .unwrap();
        assert!(storage
            .create_table(TableSchema::new("job", ["job_id"]))
            .await
            .is_err());
        storage
            .insert_row("job", attrs! { "job_id" => "a", "tries" => 1 }, &snapshot(1))
            .await
            .unwrap();
        let rows = storage
            .scan("job", &Filter::new().eq("tries", 1), &snapshot(2))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(storage.get_table("missing").await.is_err());
    }
}
