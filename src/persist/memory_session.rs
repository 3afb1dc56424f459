use super::session::Session;
use crate::core::{DomainError, FrameworkConfig, Result, Value};
use crate::storage::{Filter, InMemoryStorage, QueryOptions, Record, TableSchema};
use crate::transaction::{Change, TransactionId, TransactionManager};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, timeout_at};
use tracing::{Level, event};

type RowLockKey = (String, String);

/// Shared in-memory database: MVCC tables, transactions and the row locks
/// taken by `get_for_update`.
///
/// ```
/// use dddkit::core::FrameworkConfig;
/// use dddkit::persist::{MemoryDatabase, Session};
/// use dddkit::storage::{Filter, QueryOptions, Record, TableSchema};
///
/// # tokio_test::block_on(async {
/// let db = MemoryDatabase::new(FrameworkConfig::new());
/// db.create_table(TableSchema::new("counter", ["name"])).await?;
///
/// let session = db.begin().await?;
/// session.add(Record::new("counter").with("name", "visits").with("value", 1)).await?;
/// session.commit().await?;
///
/// let rows = db
///     .session()
///     .query("counter", &Filter::new(), &QueryOptions::new())
///     .await?;
/// assert_eq!(rows.len(), 1);
/// # Ok::<(), dddkit::DomainError>(())
/// # }).unwrap();
/// ```
pub struct MemoryDatabase {
    storage: InMemoryStorage,
    transactions: TransactionManager,
    locks: Mutex<HashMap<RowLockKey, TransactionId>>,
    lock_released: Notify,
    config: FrameworkConfig,
}

impl MemoryDatabase {
    pub fn new(config: FrameworkConfig) -> Arc<Self> {
        Arc::new(Self {
            storage: InMemoryStorage::new(),
            transactions: TransactionManager::new(),
            locks: Mutex::new(HashMap::new()),
            lock_released: Notify::new(),
            config,
        })
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    pub async fn create_table(&self, schema: TableSchema) -> Result<()> {
        self.storage.create_table(schema).await
    }

    pub async fn table_exists(&self, table: &str) -> bool {
        self.storage.table_exists(table).await
    }

    /// Session that runs every statement in its own transaction.
    pub fn session(self: &Arc<Self>) -> MemorySession {
        MemorySession {
            db: self.clone(),
            transaction_id: None,
        }
    }

    pub async fn begin(self: &Arc<Self>) -> Result<MemorySession> {
        let transaction_id = self.transactions.begin().await?;
        Ok(MemorySession {
            db: self.clone(),
            transaction_id: Some(transaction_id),
        })
    }

    /// Runs `op` in a fresh transaction: commit on `Ok`, rollback on `Err`.
    pub async fn with_transaction<F, Fut, T>(self: &Arc<Self>, op: F) -> Result<T>
    where
        F: FnOnce(MemorySession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = self.begin().await?;
        let handle = session.clone();

        match op(session).await {
            Ok(value) => {
                if let Err(err) = handle.commit().await {
                    let _ = handle.rollback().await;
                    return Err(err);
                }
                Ok(value)
            }
            Err(err) => {
                let _ = handle.rollback().await;
                Err(err)
            }
        }
    }

    async fn commit_transaction(&self, transaction_id: TransactionId) -> Result<()> {
        let result = self.transactions.commit(transaction_id).await;
        self.release_locks(transaction_id).await;
        result
    }

    async fn rollback_transaction(&self, transaction_id: TransactionId) -> Result<()> {
        let result = self.transactions.rollback(transaction_id).await;
        self.release_locks(transaction_id).await;
        result
    }

    async fn acquire_lock(
        &self,
        table: &str,
        key: &str,
        transaction_id: TransactionId,
        nowait: bool,
    ) -> Result<()> {
        let lock_key = (table.to_string(), key.to_string());
        let deadline = Instant::now() + self.config.lock_wait_timeout;

        loop {
            let released = {
                let mut locks = self.locks.lock().await;
                match locks.get(&lock_key) {
                    None => {
                        locks.insert(lock_key, transaction_id);
                        return Ok(());
                    }
                    Some(owner) if *owner == transaction_id => return Ok(()),
                    Some(owner) if nowait => {
                        return Err(DomainError::Lock(format!(
                            "could not obtain lock on row {} in {}: held by {}",
                            key, table, owner
                        )));
                    }
                    // Registered while the map is still held so a release
                    // between here and the await is not missed.
                    Some(_) => self.lock_released.notified(),
                }
            };

            if timeout_at(deadline, released).await.is_err() {
                return Err(DomainError::Lock(format!(
                    "timed out waiting for lock on row {} in {}",
                    key, table
                )));
            }
        }
    }

    async fn release_locks(&self, transaction_id: TransactionId) {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, owner| *owner != transaction_id);
        if locks.len() != before {
            self.lock_released.notify_waiters();
        }
    }
}

/// Handle onto a [`MemoryDatabase`], bound to a transaction or autocommitting.
#[derive(Clone)]
pub struct MemorySession {
    db: Arc<MemoryDatabase>,
    transaction_id: Option<TransactionId>,
}

impl MemorySession {
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction_id
    }

    pub fn database(&self) -> Arc<MemoryDatabase> {
        self.db.clone()
    }

    pub async fn commit(&self) -> Result<()> {
        let transaction_id = self.bound_transaction()?;
        self.db.commit_transaction(transaction_id).await
    }

    pub async fn rollback(&self) -> Result<()> {
        let transaction_id = self.bound_transaction()?;
        self.db.rollback_transaction(transaction_id).await
    }

    fn bound_transaction(&self) -> Result<TransactionId> {
        self.transaction_id
            .ok_or_else(|| DomainError::Database("Session is not bound to a transaction".into()))
    }

    /// Transaction for the next statement; `true` when it was opened just
    /// for that statement.
    async fn open(&self) -> Result<(TransactionId, bool)> {
        match self.transaction_id {
            Some(transaction_id) => Ok((transaction_id, false)),
            None => Ok((self.db.transactions.begin().await?, true)),
        }
    }

    async fn finish<T>(&self, transaction_id: TransactionId, owned: bool, result: Result<T>) -> Result<T> {
        if !owned {
            return result;
        }
        match result {
            Ok(value) => {
                self.db.commit_transaction(transaction_id).await?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.db.rollback_transaction(transaction_id).await;
                Err(err)
            }
        }
    }

    async fn scan(
        &self,
        transaction_id: TransactionId,
        table: &str,
        filter: &Filter,
        options: &QueryOptions,
    ) -> Result<Vec<Record>> {
        let snapshot = self.db.transactions.statement_snapshot(transaction_id).await?;
        let rows = self.db.storage.scan(table, filter, &snapshot).await?;
        Ok(options.apply(rows.into_iter().map(|(_, record)| record).collect()))
    }

    async fn lock_rows(
        &self,
        transaction_id: TransactionId,
        table: &str,
        filter: &Filter,
        options: &QueryOptions,
        nowait: bool,
    ) -> Result<Vec<Record>> {
        let schema = self.db.storage.get_schema(table).await?;
        let candidates = self.scan(transaction_id, table, filter, options).await?;
        for record in &candidates {
            let key = record.key(schema.primary_key())?;
            self.db.acquire_lock(table, &key, transaction_id, nowait).await?;
        }

        // Rows may have changed while we waited; read again under the locks.
        let records = self.scan(transaction_id, table, filter, options).await?;
        for record in &records {
            let key = record.key(schema.primary_key())?;
            self.db.acquire_lock(table, &key, transaction_id, nowait).await?;
        }
        Ok(records)
    }

    async fn insert(&self, transaction_id: TransactionId, record: Record) -> Result<()> {
        let schema = self.db.storage.get_schema(record.table()).await?;
        let key = record.key(schema.primary_key())?;
        let table = record.table().to_string();
        let snapshot = self.db.transactions.statement_snapshot(transaction_id).await?;
        self.db
            .storage
            .insert_row(&table, record.into_values(), &snapshot)
            .await?;
        self.db
            .transactions
            .record_change(transaction_id, Change::Insert { table, key })
            .await
    }

    async fn upsert(&self, transaction_id: TransactionId, record: Record) -> Result<()> {
        let schema = self.db.storage.get_schema(record.table()).await?;
        let key = record.key(schema.primary_key())?;
        let table = record.table().to_string();
        let snapshot = self.db.transactions.statement_snapshot(transaction_id).await?;

        if let Some((row_id, existing)) = self.db.storage.find_by_key(&table, &key, &snapshot).await? {
            let mut values = existing.into_values();
            values.extend(record.values().clone());
            if self.db.storage.update_row(&table, row_id, values, &snapshot).await? {
                return self
                    .db
                    .transactions
                    .record_change(transaction_id, Change::Update { table, key })
                    .await;
            }
        }
        self.insert(transaction_id, record).await
    }

    async fn remove(&self, transaction_id: TransactionId, record: &Record) -> Result<()> {
        let schema = self.db.storage.get_schema(record.table()).await?;
        let key = record.key(schema.primary_key())?;
        let table = record.table().to_string();
        let snapshot = self.db.transactions.statement_snapshot(transaction_id).await?;

        let Some((row_id, _)) = self.db.storage.find_by_key(&table, &key, &snapshot).await? else {
            return Ok(());
        };
        if self.db.storage.delete_row(&table, row_id, &snapshot).await? {
            self.db
                .transactions
                .record_change(transaction_id, Change::Delete { table, key })
                .await?;
        }
        Ok(())
    }

    async fn bulk_update(
        &self,
        transaction_id: TransactionId,
        table: &str,
        filter: &Filter,
        values: &BTreeMap<String, Value>,
    ) -> Result<usize> {
        let schema = self.db.storage.get_schema(table).await?;
        let snapshot = self.db.transactions.statement_snapshot(transaction_id).await?;
        let rows = self.db.storage.scan(table, filter, &snapshot).await?;

        let mut updated = 0;
        for (row_id, record) in rows {
            let key = record.key(schema.primary_key())?;
            let mut row = record.into_values();
            row.extend(values.clone());
            if self.db.storage.update_row(table, row_id, row, &snapshot).await? {
                self.db
                    .transactions
                    .record_change(
                        transaction_id,
                        Change::Update {
                            table: table.to_string(),
                            key,
                        },
                    )
                    .await?;
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn table_schema(&self, table: &str) -> Result<TableSchema> {
        self.db.storage.get_schema(table).await
    }

    async fn query(
        &self,
        table: &str,
        filter: &Filter,
        options: &QueryOptions,
    ) -> Result<Vec<Record>> {
        let (transaction_id, owned) = self.open().await?;
        let result = self.scan(transaction_id, table, filter, options).await;
        self.finish(transaction_id, owned, result).await
    }

    async fn query_for_update(
        &self,
        table: &str,
        filter: &Filter,
        options: &QueryOptions,
        nowait: bool,
    ) -> Result<Vec<Record>> {
        let (transaction_id, owned) = self.open().await?;
        let result = self
            .lock_rows(transaction_id, table, filter, options, nowait)
            .await;
        self.finish(transaction_id, owned, result).await
    }

    async fn add(&self, record: Record) -> Result<()> {
        let (transaction_id, owned) = self.open().await?;
        let result = self.insert(transaction_id, record).await;
        self.finish(transaction_id, owned, result).await
    }

    async fn merge(&self, record: Record) -> Result<()> {
        let (transaction_id, owned) = self.open().await?;
        let result = self.upsert(transaction_id, record).await;
        self.finish(transaction_id, owned, result).await
    }

    async fn delete(&self, record: &Record) -> Result<()> {
        let (transaction_id, owned) = self.open().await?;
        let result = self.remove(transaction_id, record).await;
        self.finish(transaction_id, owned, result).await
    }

    async fn update_where(
        &self,
        table: &str,
        filter: &Filter,
        values: BTreeMap<String, Value>,
    ) -> Result<usize> {
        let (transaction_id, owned) = self.open().await?;
        let result = self
            .bulk_update(transaction_id, table, filter, &values)
            .await;
        self.finish(transaction_id, owned, result).await
    }

    async fn flush(&self) -> Result<usize> {
        let Some(transaction_id) = self.transaction_id else {
            return Ok(0);
        };
        let pending = self.db.transactions.take_pending(transaction_id).await?;
        event!(
            Level::DEBUG,
            transaction = %transaction_id,
            writes = pending.len(),
            "session flushed"
        );
        Ok(pending.len())
    }
}
