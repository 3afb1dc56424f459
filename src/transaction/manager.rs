// ============================================================================
// Transaction Manager
// ============================================================================

use super::{Change, Transaction, TransactionId, TransactionState};
use crate::core::{DomainError, Result};
use crate::storage::Snapshot;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct TransactionManager {
    transactions: Arc<RwLock<HashMap<TransactionId, Transaction>>>,

    // Copy-on-write sets so snapshots share them without copying.
    active_ids: Arc<RwLock<Arc<HashSet<u64>>>>,
    aborted_ids: Arc<RwLock<Arc<HashSet<u64>>>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            transactions: Arc::new(RwLock::new(HashMap::new())),
            active_ids: Arc::new(RwLock::new(Arc::new(HashSet::new()))),
            aborted_ids: Arc::new(RwLock::new(Arc::new(HashSet::new()))),
        }
    }

    pub async fn begin(&self) -> Result<TransactionId> {
        let transaction_id = TransactionId::new();
        {
            let mut active_lock = self.active_ids.write().await;
            let mut new_set = (**active_lock).clone();
            new_set.insert(transaction_id.0);
            *active_lock = Arc::new(new_set);
        }
        let mut transactions = self.transactions.write().await;
        transactions.insert(transaction_id, Transaction::new(transaction_id));
        Ok(transaction_id)
    }

    /// Fresh snapshot for the next statement of `txn_id`: sees everything
    /// committed so far plus the transaction's own writes.
    pub async fn statement_snapshot(&self, txn_id: TransactionId) -> Result<Snapshot> {
        self.ensure_active(txn_id).await?;
        let active = self.active_ids.read().await.clone();
        let aborted = self.aborted_ids.read().await.clone();
        Ok(Snapshot {
            tx_id: txn_id.0,
            active,
            aborted,
            max_tx_id: TransactionId::next_raw(),
        })
    }

    async fn ensure_active(&self, txn_id: TransactionId) -> Result<()> {
        let transactions = self.transactions.read().await;
        match transactions.get(&txn_id) {
            Some(txn) if txn.state().is_active() => Ok(()),
            _ => Err(DomainError::Database(format!(
                "Transaction {} is not active",
                txn_id
            ))),
        }
    }

    pub async fn record_change(&self, txn_id: TransactionId, change: Change) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        let transaction = transactions
            .get_mut(&txn_id)
            .ok_or_else(|| DomainError::Database(format!("Transaction {} not found", txn_id)))?;
        transaction.record_change(change)
    }

    pub async fn take_pending(&self, txn_id: TransactionId) -> Result<Vec<Change>> {
        let mut transactions = self.transactions.write().await;
        let transaction = transactions
            .get_mut(&txn_id)
            .ok_or_else(|| DomainError::Database(format!("Transaction {} not found", txn_id)))?;
        Ok(transaction.take_pending())
    }

    pub async fn commit(&self, txn_id: TransactionId) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        let transaction = transactions
            .get_mut(&txn_id)
            .ok_or_else(|| DomainError::Database(format!("Transaction {} not found", txn_id)))?;

        if transaction.state() != TransactionState::Active {
            return Err(DomainError::Database("Transaction not active".into()));
        }

        transaction.commit()?;
        transactions.remove(&txn_id);

        let mut active_lock = self.active_ids.write().await;
        if active_lock.contains(&txn_id.0) {
            let mut new_set = (**active_lock).clone();
            new_set.remove(&txn_id.0);
            *active_lock = Arc::new(new_set);
        }
        Ok(())
    }

    pub async fn rollback(&self, txn_id: TransactionId) -> Result<()> {
        let mut transactions = self.transactions.write().await;

        if let Some(transaction) = transactions.get_mut(&txn_id) {
            transaction.rollback()?;
            transactions.remove(&txn_id);

            // Aborted before leaving the active set so no snapshot sees the
            // writes as committed in between.
            {
                let mut aborted_lock = self.aborted_ids.write().await;
                let mut new_set = (**aborted_lock).clone();
                new_set.insert(txn_id.0);
                *aborted_lock = Arc::new(new_set);
            }
            {
                let mut active_lock = self.active_ids.write().await;
                if active_lock.contains(&txn_id.0) {
                    let mut new_set = (**active_lock).clone();
                    new_set.remove(&txn_id.0);
                    *active_lock = Arc::new(new_set);
                }
            }
        }
        Ok(())
    }
}
