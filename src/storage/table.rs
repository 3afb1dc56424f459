use super::{Filter, Record};
use crate::core::{DomainError, Result, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MvccRow {
    pub values: BTreeMap<String, Value>,
    pub xmin: u64,         // Transaction ID that created this version
    pub xmax: Option<u64>, // Transaction ID that deleted/updated this version
}

/// Table metadata. `soft_delete` tables keep deleted rows flagged instead of
/// removing them.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    name: String,
    primary_key: Vec<String>,
    soft_delete: bool,
}

impl TableSchema {
    pub fn new<I, S>(name: impl Into<String>, primary_key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            primary_key: primary_key.into_iter().map(Into::into).collect(),
            soft_delete: false,
        }
    }

    pub fn soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn is_soft_delete(&self) -> bool {
        self.soft_delete
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tx_id: u64,
    pub active: Arc<HashSet<u64>>,
    pub aborted: Arc<HashSet<u64>>,
    pub max_tx_id: u64,
}

impl Snapshot {
    fn is_committed(&self, tx_id: u64) -> bool {
        tx_id < self.max_tx_id && !self.active.contains(&tx_id) && !self.aborted.contains(&tx_id)
    }
}

/// Multi-version row store keyed by the table's primary-key columns.
#[derive(Debug, Clone)]
pub struct Table {
    schema: TableSchema,
    rows: BTreeMap<usize, Vec<MvccRow>>,
    next_row_id: usize,
    primary_index: BTreeMap<String, Vec<usize>>,
}

impl Table {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
            next_row_id: 0,
            primary_index: BTreeMap::new(),
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn key_of(&self, values: &BTreeMap<String, Value>) -> Result<String> {
        Record::from_values(self.schema.name.clone(), values.clone()).key(&self.schema.primary_key)
    }

    pub fn insert(&mut self, values: BTreeMap<String, Value>, snapshot: &Snapshot) -> Result<usize> {
        let key = self.key_of(&values)?;
        self.check_uniqueness(&key, None, snapshot)?;

        let id = self.next_row_id;
        self.next_row_id += 1;
        self.rows.insert(
            id,
            vec![MvccRow {
                values,
                xmin: snapshot.tx_id,
                xmax: None,
            }],
        );
        self.primary_index.entry(key).or_default().push(id);
        Ok(id)
    }

    /// Newest version not written by an aborted transaction.
    fn current_version(&mut self, id: usize, snapshot: &Snapshot) -> Option<&mut MvccRow> {
        self.rows
            .get_mut(&id)?
            .iter_mut()
            .rev()
            .find(|v| !snapshot.aborted.contains(&v.xmin))
    }

    /// Claims the current version of a row for this transaction. `Ok(false)`
    /// when the row is already gone.
    fn claim(&mut self, id: usize, snapshot: &Snapshot) -> Result<bool> {
        let table = self.schema.name.clone();
        let Some(latest) = self.current_version(id, snapshot) else {
            return Ok(false);
        };
        match latest.xmax {
            Some(xmax) if xmax == snapshot.tx_id => Ok(false),
            Some(xmax) if snapshot.aborted.contains(&xmax) => {
                latest.xmax = Some(snapshot.tx_id);
                Ok(true)
            }
            Some(xmax) if snapshot.is_committed(xmax) => Ok(false),
            Some(_) => Err(DomainError::Lock(format!(
                "Write-write conflict on {}",
                table
            ))),
            None => {
                latest.xmax = Some(snapshot.tx_id);
                Ok(true)
            }
        }
    }

    pub fn delete(&mut self, id: usize, snapshot: &Snapshot) -> Result<bool> {
        self.claim(id, snapshot)
    }

    pub fn update(
        &mut self,
        id: usize,
        values: BTreeMap<String, Value>,
        snapshot: &Snapshot,
    ) -> Result<bool> {
        let key = self.key_of(&values)?;
        self.check_uniqueness(&key, Some(id), snapshot)?;
        if !self.claim(id, snapshot)? {
            return Ok(false);
        }
        if let Some(versions) = self.rows.get_mut(&id) {
            versions.push(MvccRow {
                values,
                xmin: snapshot.tx_id,
                xmax: None,
            });
        }
        let ids = self.primary_index.entry(key).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
        Ok(true)
    }

    pub fn scan_with_ids(&self, snapshot: &Snapshot) -> Vec<(usize, Record)> {
        self.rows
            .keys()
            .filter_map(|id| self.get_visible_row(*id, snapshot).map(|r| (*id, r)))
            .collect()
    }

    pub fn scan(&self, filter: &Filter, snapshot: &Snapshot) -> Result<Vec<(usize, Record)>> {
        let mut matched = Vec::new();
        for (id, record) in self.scan_with_ids(snapshot) {
            if filter.matches(&record)? {
                matched.push((id, record));
            }
        }
        Ok(matched)
    }

    pub fn get_visible_row(&self, id: usize, snapshot: &Snapshot) -> Option<Record> {
        self.rows
            .get(&id)?
            .iter()
            .rev()
            .find(|v| is_visible(v, snapshot))
            .map(|v| Record::from_values(self.schema.name.clone(), v.values.clone()))
    }

    /// Visible row with the given primary key.
    pub fn find_by_key(&self, key: &str, snapshot: &Snapshot) -> Option<(usize, Record)> {
        self.primary_index
            .get(key)?
            .iter()
            .find_map(|id| self.get_visible_row(*id, snapshot).map(|r| (*id, r)))
    }

    // Pessimistic: a key held by a live version in any transaction conflicts.
    fn check_uniqueness(&self, key: &str, ignore_id: Option<usize>, snapshot: &Snapshot) -> Result<()> {
        let Some(ids) = self.primary_index.get(key) else {
            return Ok(());
        };
        for id in ids.iter().filter(|id| Some(**id) != ignore_id) {
            let Some(versions) = self.rows.get(id) else {
                continue;
            };
            let live = versions.iter().rev().any(|v| {
                is_version_live(v, snapshot)
                    && Record::from_values(self.schema.name.clone(), v.values.clone())
                        .key(&self.schema.primary_key)
                        .is_ok_and(|k| k == key)
            });
            if live {
                return Err(DomainError::Database(format!(
                    "Unique constraint violation: {} already contains key {}",
                    self.schema.name, key
                )));
            }
        }
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

fn is_version_live(row: &MvccRow, snapshot: &Snapshot) -> bool {
    if snapshot.aborted.contains(&row.xmin) {
        return false;
    }
    match row.xmax {
        None => true,
        Some(xmax) if xmax == snapshot.tx_id => false,
        Some(xmax) if snapshot.aborted.contains(&xmax) => true,
        Some(xmax) => !snapshot.is_committed(xmax),
    }
}

fn is_visible(row: &MvccRow, snapshot: &Snapshot) -> bool {
    if row.xmin == snapshot.tx_id {
        return row.xmax != Some(snapshot.tx_id);
    }
    if !snapshot.is_committed(row.xmin) {
        return false;
    }
    match row.xmax {
        Some(xmax) => xmax != snapshot.tx_id && !snapshot.is_committed(xmax),
        None => true,
    }
}
