//! In-memory table: the same contract as the persistent one, no files.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{Indexes, Table, TableMeta};
use crate::config::{TableConfig, TableKind};
use crate::error::{Error, Result};
use crate::errinput;
use crate::lockqueue::LockQueue;
use crate::query::{
    finish_select, DeleteQuery, Filter, IndexSpec, InsertQuery, InsertResult, SelectQuery,
    UpdateQuery, WhereFn,
};

struct Inner {
    rows: BTreeMap<i64, Value>,
    indexes: Indexes,
}

/// A table whose rows live only in RAM: closing discards everything.
pub struct MemoryTable {
    name: String,
    config: TableConfig,
    inner: Mutex<Inner>,
    write_queue: LockQueue,
    next_id: AtomicI64,
    closed: AtomicBool,
}

impl MemoryTable {
    pub fn new(name: &str, config: TableConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(Inner {
                rows: BTreeMap::new(),
                indexes: Indexes::new(Vec::new()),
            }),
            write_queue: LockQueue::new(),
            next_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TableNotOpen(self.name.clone()));
        }
        Ok(())
    }

    /// Copy rows (optionally filtered) into a fresh in-memory table.
    pub async fn clone_in_memory(
        &self,
        name: &str,
        filter: Option<WhereFn>,
    ) -> Result<Arc<MemoryTable>> {
        self.check_open()?;
        let clone = Arc::new(MemoryTable::new(name, self.config.clone()));
        let inner = self.inner.lock().await;
        for spec in inner.indexes.specs() {
            clone.create_index(spec.clone()).await?;
        }
        let rows: Vec<Value> = inner
            .rows
            .values()
            .filter(|row| filter.as_ref().is_none_or(|f| f(row)))
            .cloned()
            .collect();
        drop(inner);
        if !rows.is_empty() {
            clone.insert(InsertQuery::rows(rows)).await?;
        }
        Ok(clone)
    }

    fn matching_ids(&self, inner: &Inner, filter: &Filter) -> Vec<i64> {
        match filter {
            Filter::All => inner.rows.keys().copied().collect(),
            Filter::Ids(list) => {
                let mut ids: Vec<i64> = list
                    .iter()
                    .copied()
                    .filter(|id| inner.rows.contains_key(id))
                    .collect();
                ids.sort_unstable();
                ids.dedup();
                ids
            }
            Filter::Range { field, lo, hi } => {
                if let Some(ids) = inner.indexes.range_lookup(field, lo, hi) {
                    ids
                } else {
                    inner
                        .rows
                        .iter()
                        .filter(|(_, row)| filter.matches(row))
                        .map(|(id, _)| *id)
                        .collect()
                }
            }
            Filter::Where(f) => inner
                .rows
                .iter()
                .filter(|(_, row)| f(row))
                .map(|(id, _)| *id)
                .collect(),
        }
    }
}

#[async_trait]
impl Table for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TableKind {
        TableKind::Memory
    }

    fn config(&self) -> TableConfig {
        self.config.clone()
    }

    async fn select(&self, query: SelectQuery) -> Result<Vec<Value>> {
        self.check_open()?;
        let inner = self.inner.lock().await;
        let ids = self.matching_ids(&inner, &query.filter);
        let rows: Vec<Value> = ids
            .into_iter()
            .filter_map(|id| inner.rows.get(&id).cloned())
            .collect();
        Ok(finish_select(rows, &query))
    }

    async fn insert(&self, query: InsertQuery) -> Result<InsertResult> {
        if query.rows.is_empty() {
            return Err(Error::MissingParameter("rows".to_string()));
        }
        self.check_open()?;
        let _write = self.write_queue.lock().await?;
        let mut inner = self.inner.lock().await;

        let mut prepared: Vec<(i64, Value, bool)> = Vec::new();
        let mut claimed: HashSet<i64> = HashSet::new();
        for row in &query.rows {
            let Some(obj) = row.as_object() else {
                return errinput!("row must be an object");
            };
            let id = match obj.get("id") {
                Some(v) => v
                    .as_i64()
                    .ok_or_else(|| Error::InvalidInput("row id must be an integer".to_string()))?,
                None => self.next_id.fetch_add(1, Ordering::SeqCst),
            };
            let exists = inner.rows.contains_key(&id) || claimed.contains(&id);
            if exists {
                if query.ignore && !query.replace {
                    continue;
                }
                if !query.replace {
                    return errinput!("duplicate row id {id} in table {}", self.name);
                }
            }
            self.next_id.fetch_max(id + 1, Ordering::SeqCst);
            claimed.insert(id);
            let mut row = row.clone();
            row.as_object_mut().unwrap().insert("id".to_string(), id.into());
            prepared.push((id, row, exists));
        }

        let mut result = InsertResult::default();
        for (id, row, replaces) in prepared {
            if replaces {
                if let Some(old) = inner.rows.get(&id).cloned() {
                    inner.indexes.on_delete(id, &old);
                }
                result.replaced += 1;
            } else {
                result.inserted += 1;
            }
            inner.indexes.on_insert(id, &row);
            inner.rows.insert(id, row);
            result.last_insert_id = id;
        }
        Ok(result)
    }

    async fn update(&self, query: UpdateQuery) -> Result<u64> {
        self.check_open()?;
        let _write = self.write_queue.lock().await?;
        let mut inner = self.inner.lock().await;

        let ids = self.matching_ids(&inner, &query.filter);
        let mut updated = 0u64;
        for id in ids {
            let Some(old) = inner.rows.get(&id).cloned() else {
                continue;
            };
            let mut row = old.clone();
            (query.modify)(&mut row);
            if let Some(obj) = row.as_object_mut() {
                obj.insert("id".to_string(), id.into());
            }
            if row == old {
                continue;
            }
            inner.indexes.on_delete(id, &old);
            inner.indexes.on_insert(id, &row);
            inner.rows.insert(id, row);
            updated += 1;
        }
        Ok(updated)
    }

    async fn delete(&self, query: DeleteQuery) -> Result<u64> {
        self.check_open()?;
        let _write = self.write_queue.lock().await?;
        let mut inner = self.inner.lock().await;

        let ids = self.matching_ids(&inner, &query.filter);
        let mut deleted = 0u64;
        for id in ids {
            if let Some(old) = inner.rows.remove(&id) {
                inner.indexes.on_delete(id, &old);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn create_index(&self, spec: IndexSpec) -> Result<()> {
        self.check_open()?;
        let _write = self.write_queue.lock().await?;
        let mut inner = self.inner.lock().await;
        inner.indexes.add_spec(spec.clone())?;
        let inner = &mut *inner;
        for (id, row) in &inner.rows {
            inner.indexes.apply_spec(&spec, *id, row);
        }
        Ok(())
    }

    async fn drop_index(&self, field: &str) -> Result<()> {
        self.check_open()?;
        let _write = self.write_queue.lock().await?;
        let mut inner = self.inner.lock().await;
        if !inner.indexes.remove_field(field) {
            return errinput!("no index on field {field:?}");
        }
        Ok(())
    }

    async fn meta(&self) -> Result<TableMeta> {
        let inner = self.inner.lock().await;
        Ok(TableMeta {
            name: self.name.clone(),
            kind: TableKind::Memory,
            row_count: inner.rows.len() as u64,
            indexes: inner.indexes.specs().to_vec(),
        })
    }

    async fn row_count(&self) -> Result<u64> {
        self.check_open()?;
        let inner = self.inner.lock().await;
        Ok(inner.rows.len() as u64)
    }

    async fn clone_to(&self, _target: &Path, _filter: Option<WhereFn>) -> Result<()> {
        errinput!("memory tables are cloned in memory, not to a path")
    }

    async fn mark_corrupted(&self, message: &str) -> Result<()> {
        tracing::error!(table = %self.name, message, "memory table marked corrupted");
        self.close().await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock().await;
        inner.rows.clear();
        inner.indexes = Indexes::new(Vec::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_crud_round_trip() -> Result<()> {
        let table = MemoryTable::new("m", TableConfig::new(TableKind::Memory));

        let result = table
            .insert(InsertQuery::rows([json!({"a": 1}), json!({"a": 2})]))
            .await?;
        assert_eq!(result.inserted, 2);
        assert_eq!(result.last_insert_id, 2);

        let updated = table
            .update(UpdateQuery::new(Filter::ids([1]), |r| {
                r["a"] = json!(10)
            }))
            .await?;
        assert_eq!(updated, 1);

        let rows = table.select(SelectQuery::all()).await?;
        assert_eq!(rows[0]["a"], json!(10));

        let deleted = table.delete(DeleteQuery::filter(Filter::ids([2]))).await?;
        assert_eq!(deleted, 1);
        assert_eq!(table.row_count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_close_discards_state() -> Result<()> {
        let table = MemoryTable::new("m", TableConfig::new(TableKind::Memory));
        table.insert(InsertQuery::rows([json!({"a": 1})])).await?;
        table.close().await?;

        assert!(matches!(
            table.select(SelectQuery::all()).await,
            Err(Error::TableNotOpen(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_range_index() -> Result<()> {
        let table = MemoryTable::new("m", TableConfig::new(TableKind::Memory));
        table
            .insert(InsertQuery::rows((1..=9).map(|i| json!({"id": i, "n": i}))))
            .await?;
        table
            .create_index(IndexSpec::new(crate::query::IndexKind::Range, "n"))
            .await?;
        let rows = table
            .select(SelectQuery::all().filter(Filter::range("n", json!(3), json!(5))))
            .await?;
        assert_eq!(rows.len(), 3);
        Ok(())
    }
}
