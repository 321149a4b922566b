//! Persistent table over the block storage engine.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, MutexGuard};

use super::{Indexes, Table, TableMeta, META_FILE};
use crate::config::{TableConfig, TableKind};
use crate::error::{Error, Result};
use crate::errinput;
use crate::lockqueue::LockQueue;
use crate::query::{
    finish_select, json_cmp, DeleteQuery, Filter, IndexSpec, InsertQuery, InsertResult,
    SelectQuery, UpdateQuery, WhereFn,
};
use crate::store::{encoded_size, file, BlockStore, StoreConfig, STATE_FILE};

struct Inner {
    store: BlockStore,
    indexes: Indexes,
}

/// A persistent table: rows in block files, secondary indexes in memory,
/// writes serialized into monotonic delta steps.
pub struct BasicTable {
    name: String,
    path: PathBuf,
    config: TableConfig,
    inner: Mutex<Inner>,
    write_queue: LockQueue,
    delta_step: AtomicU64,
    next_id: AtomicI64,
    saving: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl BasicTable {
    pub async fn open(name: &str, path: &Path, config: TableConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(path)?;

        let state_path = path.join(STATE_FILE);
        let state = match std::fs::read_to_string(&state_path) {
            Ok(s) => s,
            Err(_) => {
                std::fs::write(&state_path, "1")?;
                "1".to_string()
            }
        };

        let mut store = BlockStore::new(StoreConfig::from_table(path, &config));
        let seed = if state.trim() == "0" {
            if !config.auto_repair {
                return Err(Error::TableCorrupted(format!(
                    "{name}: state marker is 0; reopen with auto_repair"
                )));
            }
            let seed = store.load_corrupted().await?;
            std::fs::write(&state_path, "1")?;
            tracing::info!(table = name, "table repaired");
            seed
        } else {
            match store.load().await {
                Ok(seed) => seed,
                Err(e) if config.auto_repair => {
                    tracing::warn!(table = name, error = %e, "load failed; running repair");
                    store = BlockStore::new(StoreConfig::from_table(path, &config));
                    let seed = store.load_corrupted().await?;
                    std::fs::write(&state_path, "1")?;
                    seed
                }
                Err(e) => return Err(e),
            }
        };

        let meta_path = path.join(META_FILE);
        let specs: Vec<IndexSpec> = if meta_path.exists() {
            file::read_data_file(&meta_path, config.auto_repair)?
        } else {
            Vec::new()
        };
        let mut indexes = Indexes::new(specs);
        if !indexes.is_empty() {
            let mut ids: Vec<i64> = store.ids().collect();
            ids.sort_unstable();
            for id in ids {
                if let Some(row) = store.get(id).await? {
                    indexes.on_insert(id, &row);
                }
            }
            store.unload_blocks_if_needed();
        }

        let (shutdown, _) = broadcast::channel(1);
        let table = Arc::new(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            config,
            inner: Mutex::new(Inner { store, indexes }),
            write_queue: LockQueue::new(),
            delta_step: AtomicU64::new(0),
            next_id: AtomicI64::new(seed.max(1)),
            saving: AtomicBool::new(false),
            shutdown,
        });
        Self::spawn_evictor(&table);
        tracing::debug!(table = name, "table opened");
        Ok(table)
    }

    /// Periodic LRU pass; exits once the store is destroyed.
    fn spawn_evictor(table: &Arc<Self>) {
        let table = Arc::clone(table);
        let mut shutdown = table.shutdown.subscribe();
        let interval = table.config.evict_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut inner = table.inner.lock().await;
                        if inner.store.is_destroyed() {
                            break;
                        }
                        inner.store.unload_blocks_if_needed();
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    /// Keep the autoincrement counter at or above `min`.
    pub fn ensure_seed(&self, min: i64) {
        self.next_id.fetch_max(min, Ordering::SeqCst);
    }

    pub fn next_step(&self) -> u64 {
        self.delta_step.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn check_open(&self, inner: &Inner) -> Result<()> {
        if inner.store.is_destroyed() {
            return Err(Error::TableNotOpen(self.name.clone()));
        }
        if let Some(e) = inner.store.file_error() {
            return Err(e.clone());
        }
        Ok(())
    }

    /// Resolve a filter to the matching row ids, ascending. Range filters go
    /// through the ordered index when one covers the field.
    async fn matching_ids(&self, inner: &mut Inner, filter: &Filter) -> Result<Vec<i64>> {
        let mut ids = match filter {
            Filter::All => {
                let mut ids: Vec<i64> = inner.store.ids().collect();
                ids.sort_unstable();
                ids
            }
            Filter::Ids(list) => {
                let mut ids: Vec<i64> = list
                    .iter()
                    .copied()
                    .filter(|id| inner.store.has(*id))
                    .collect();
                ids.sort_unstable();
                ids.dedup();
                ids
            }
            Filter::Range { field, lo, hi } => {
                if let Some(ids) = inner.indexes.range_lookup(field, lo, hi) {
                    ids
                } else {
                    let mut ids: Vec<i64> = inner.store.ids().collect();
                    ids.sort_unstable();
                    let mut matched = Vec::new();
                    for id in ids {
                        let Some(row) = inner.store.get(id).await? else {
                            continue;
                        };
                        if let Some(v) = row.get(field.as_str()) {
                            if json_cmp(v, lo) != std::cmp::Ordering::Less
                                && json_cmp(v, hi) != std::cmp::Ordering::Greater
                            {
                                matched.push(id);
                            }
                        }
                    }
                    matched
                }
            }
            Filter::Where(f) => {
                let mut ids: Vec<i64> = inner.store.ids().collect();
                ids.sort_unstable();
                let mut matched = Vec::new();
                for id in ids {
                    let Some(row) = inner.store.get(id).await? else {
                        continue;
                    };
                    if f(&row) {
                        matched.push(id);
                    }
                }
                matched
            }
        };
        ids.sort_unstable();
        Ok(ids)
    }

    async fn commit(&self, inner: &mut Inner, step: u64) -> Result<()> {
        self.saving.store(true, Ordering::SeqCst);
        let result = inner.store.commit_delta(step).await;
        self.saving.store(false, Ordering::SeqCst);
        result
    }

    fn persist_specs(&self, inner: &Inner) -> Result<()> {
        let meta = self.path.join(META_FILE);
        let tmp = self.path.join(format!("{META_FILE}.tmp"));
        file::write_final_file(&meta, &tmp, &inner.indexes.specs().to_vec(), 0)?;
        Ok(())
    }

    async fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().await
    }
}

#[async_trait]
impl Table for BasicTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TableKind {
        TableKind::Basic
    }

    fn config(&self) -> TableConfig {
        self.config.clone()
    }

    async fn select(&self, query: SelectQuery) -> Result<Vec<Value>> {
        let mut inner = self.lock_inner().await;
        self.check_open(&inner)?;
        let ids = self.matching_ids(&mut inner, &query.filter).await?;
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = inner.store.get(id).await? {
                rows.push(row);
            }
        }
        Ok(finish_select(rows, &query))
    }

    async fn insert(&self, query: InsertQuery) -> Result<InsertResult> {
        if query.rows.is_empty() {
            return Err(Error::MissingParameter("rows".to_string()));
        }
        let _write = self.write_queue.lock().await?;
        let step = self.next_step();
        let mut inner = self.lock_inner().await;
        self.check_open(&inner)?;

        // Validate the whole batch before mutating anything.
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
            let exists = inner.store.has(id) || claimed.contains(&id);
            if exists {
                if query.ignore && !query.replace {
                    continue;
                }
                if !query.replace {
                    return errinput!("duplicate row id {id} in table {}", self.name);
                }
            }
            self.ensure_seed(id + 1);
            claimed.insert(id);
            let mut row = row.clone();
            row.as_object_mut().unwrap().insert("id".to_string(), id.into());
            prepared.push((id, row, exists));
        }

        let mut result = InsertResult::default();
        for (id, row, replaces) in prepared {
            if replaces {
                if let Some(old) = inner.store.get(id).await? {
                    inner.indexes.on_delete(id, &old);
                }
                result.replaced += 1;
            } else {
                result.inserted += 1;
            }
            let encoded = encoded_size(id, &row);
            inner.indexes.on_insert(id, &row);
            inner.store.set(id, row, encoded, step);
            result.last_insert_id = id;
        }

        self.commit(&mut inner, step).await?;
        Ok(result)
    }

    async fn update(&self, query: UpdateQuery) -> Result<u64> {
        let _write = self.write_queue.lock().await?;
        let step = self.next_step();
        let mut inner = self.lock_inner().await;
        self.check_open(&inner)?;

        let ids = self.matching_ids(&mut inner, &query.filter).await?;
        let mut updated = 0u64;
        for id in ids {
            let Some(old) = inner.store.get(id).await? else {
                continue;
            };
            let mut row = old.clone();
            (query.modify)(&mut row);
            // The id field is not updatable.
            if let Some(obj) = row.as_object_mut() {
                obj.insert("id".to_string(), id.into());
            }
            if row == old {
                continue;
            }
            inner.indexes.on_delete(id, &old);
            inner.indexes.on_insert(id, &row);
            let encoded = encoded_size(id, &row);
            inner.store.set(id, row, encoded, step);
            updated += 1;
        }

        if updated == 0 {
            inner.store.cancel_delta(step);
            return Ok(0);
        }
        self.commit(&mut inner, step).await?;
        Ok(updated)
    }

    async fn delete(&self, query: DeleteQuery) -> Result<u64> {
        let _write = self.write_queue.lock().await?;
        let step = self.next_step();
        let mut inner = self.lock_inner().await;
        self.check_open(&inner)?;

        let ids = self.matching_ids(&mut inner, &query.filter).await?;
        let mut deleted = 0u64;
        for id in ids {
            if let Some(old) = inner.store.get(id).await? {
                inner.indexes.on_delete(id, &old);
            }
            if inner.store.del(id, step) {
                deleted += 1;
            }
        }

        if deleted == 0 {
            inner.store.cancel_delta(step);
            return Ok(0);
        }
        self.commit(&mut inner, step).await?;
        Ok(deleted)
    }

    async fn create_index(&self, spec: IndexSpec) -> Result<()> {
        let _write = self.write_queue.lock().await?;
        let mut inner = self.lock_inner().await;
        self.check_open(&inner)?;

        inner.indexes.add_spec(spec.clone())?;
        // Backfill from existing rows.
        let mut ids: Vec<i64> = inner.store.ids().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(row) = inner.store.get(id).await? {
                inner.indexes.apply_spec(&spec, id, &row);
            }
        }
        self.persist_specs(&inner)?;
        Ok(())
    }

    async fn drop_index(&self, field: &str) -> Result<()> {
        let _write = self.write_queue.lock().await?;
        let mut inner = self.lock_inner().await;
        self.check_open(&inner)?;

        if !inner.indexes.remove_field(field) {
            return errinput!("no index on field {field:?}");
        }
        self.persist_specs(&inner)?;
        Ok(())
    }

    async fn meta(&self) -> Result<TableMeta> {
        let inner = self.lock_inner().await;
        Ok(TableMeta {
            name: self.name.clone(),
            kind: TableKind::Basic,
            row_count: inner.store.row_count(),
            indexes: inner.indexes.specs().to_vec(),
        })
    }

    async fn row_count(&self) -> Result<u64> {
        let inner = self.lock_inner().await;
        self.check_open(&inner)?;
        Ok(inner.store.row_count())
    }

    async fn clone_to(&self, target: &Path, filter: Option<WhereFn>) -> Result<()> {
        if target.exists() {
            return errinput!("clone target {} already exists", target.display());
        }
        std::fs::create_dir_all(target)?;
        std::fs::write(target.join(super::TYPE_FILE), TableKind::Basic.as_str())?;

        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("clone")
            .to_string();
        let clone_config = TableConfig {
            recreate: false,
            ..self.config.clone()
        };
        let clone = BasicTable::open(&name, target, clone_config).await?;

        for spec in self.meta().await?.indexes {
            clone.create_index(spec).await?;
        }

        let ids = {
            let inner = self.lock_inner().await;
            self.check_open(&inner)?;
            let mut ids: Vec<i64> = inner.store.ids().collect();
            ids.sort_unstable();
            ids
        };
        for chunk in ids.chunks(500) {
            let mut rows = Vec::with_capacity(chunk.len());
            {
                let mut inner = self.lock_inner().await;
                for &id in chunk {
                    let Some(row) = inner.store.get(id).await? else {
                        continue;
                    };
                    if filter.as_ref().is_none_or(|f| f(&row)) {
                        rows.push(row);
                    }
                }
            }
            if !rows.is_empty() {
                clone.insert(InsertQuery::rows(rows)).await?;
            }
        }

        clone.close().await?;
        tracing::info!(table = %self.name, target = %target.display(), "table cloned");
        Ok(())
    }

    async fn mark_corrupted(&self, message: &str) -> Result<()> {
        {
            let mut inner = self.lock_inner().await;
            let error = Error::TableCorrupted(format!("{}: {message}", self.name));
            inner.store.mark_failed(&error);
        }
        self.close().await
    }

    async fn close(&self) -> Result<()> {
        // Bounded drain of an in-flight save before taking the write queue.
        for _ in 0..200 {
            if !self.saving.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _write = self.write_queue.lock().await?;
        let mut inner = self.lock_inner().await;
        inner.store.destroy();
        self.shutdown.send(()).ok();
        tracing::debug!(table = %self.name, "table closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{IndexKind, Sort};
    use crate::tmpfs::TempDir;
    use serde_json::json;

    async fn open_test_table(dir: &TempDir) -> Result<Arc<BasicTable>> {
        BasicTable::open("t", &dir.path().join("t"), TableConfig::default()).await
    }

    #[tokio::test]
    async fn test_insert_select_round_trip() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let table = open_test_table(&dir).await?;

        let result = table
            .insert(InsertQuery::rows([
                json!({"id": 1, "a": "x"}),
                json!({"id": 2, "a": "y"}),
            ]))
            .await?;
        assert_eq!(result.inserted, 2);
        assert_eq!(result.replaced, 0);
        assert_eq!(result.last_insert_id, 2);

        let rows = table.select(SelectQuery::all()).await?;
        assert_eq!(rows, vec![json!({"id": 1, "a": "x"}), json!({"id": 2, "a": "y"})]);

        table.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_autoincrement_and_reopen() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("t");
        {
            let table = BasicTable::open("t", &path, TableConfig::default()).await?;
            let result = table
                .insert(InsertQuery::rows([json!({"a": 1}), json!({"a": 2})]))
                .await?;
            assert_eq!(result.last_insert_id, 2);
            // Explicit high id pulls the counter forward.
            table.insert(InsertQuery::rows([json!({"id": 10, "a": 3})])).await?;
            let result = table.insert(InsertQuery::rows([json!({"a": 4})])).await?;
            assert_eq!(result.last_insert_id, 11);
            table.close().await?;
        }
        let table = BasicTable::open("t", &path, TableConfig::default()).await?;
        assert_eq!(table.row_count().await?, 4);
        let result = table.insert(InsertQuery::rows([json!({"a": 5})])).await?;
        assert_eq!(result.last_insert_id, 12);
        table.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_insert_replace_and_ignore() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let table = open_test_table(&dir).await?;

        table.insert(InsertQuery::rows([json!({"id": 1, "v": "a"})])).await?;

        // Plain duplicate is rejected and leaves nothing behind.
        assert!(table
            .insert(InsertQuery::rows([json!({"id": 1, "v": "b"})]))
            .await
            .is_err());
        let rows = table.select(SelectQuery::all()).await?;
        assert_eq!(rows[0]["v"], json!("a"));

        let result = table
            .insert(InsertQuery::rows([json!({"id": 1, "v": "c"})]).replace(true))
            .await?;
        assert_eq!(result.replaced, 1);
        let rows = table.select(SelectQuery::all()).await?;
        assert_eq!(rows[0]["v"], json!("c"));

        let result = table
            .insert(InsertQuery::rows([json!({"id": 1, "v": "d"}), json!({"id": 2, "v": "e"})]).ignore(true))
            .await?;
        assert_eq!((result.inserted, result.replaced), (1, 0));
        let rows = table.select(SelectQuery::all()).await?;
        assert_eq!(rows[0]["v"], json!("c"));

        table.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_update_and_delete() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let table = open_test_table(&dir).await?;

        table
            .insert(InsertQuery::rows((1..=10).map(|i| json!({"id": i, "n": i}))))
            .await?;

        let updated = table
            .update(UpdateQuery::new(
                Filter::wher(|r| r["n"].as_i64().unwrap() % 2 == 0),
                |r| r["even"] = json!(true),
            ))
            .await?;
        assert_eq!(updated, 5);

        let evens = table
            .select(SelectQuery::all().filter(Filter::wher(|r| r["even"] == json!(true))))
            .await?;
        assert_eq!(evens.len(), 5);

        let deleted = table
            .delete(DeleteQuery::filter(Filter::wher(|r| r["even"] == json!(true))))
            .await?;
        assert_eq!(deleted, 5);
        assert_eq!(table.row_count().await?, 5);

        // Deleted ids do not resurrect the autoincrement.
        let result = table.insert(InsertQuery::rows([json!({"n": 0})])).await?;
        assert_eq!(result.last_insert_id, 11);

        table.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_range_index_select() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let table = open_test_table(&dir).await?;

        table
            .insert(InsertQuery::rows((1..=20).map(|i| json!({"id": i, "n": i * 10}))))
            .await?;
        table.create_index(IndexSpec::new(IndexKind::Range, "n")).await?;

        let rows = table
            .select(SelectQuery::all().filter(Filter::range("n", json!(30), json!(60))))
            .await?;
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0]["n"], json!(30));

        // Same result without the index (scan path).
        table.drop_index("n").await?;
        let scanned = table
            .select(SelectQuery::all().filter(Filter::range("n", json!(30), json!(60))))
            .await?;
        assert_eq!(scanned, rows);

        table.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_index_survives_reopen() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("t");
        {
            let table = BasicTable::open("t", &path, TableConfig::default()).await?;
            table.insert(InsertQuery::rows([json!({"id": 1, "n": 5})])).await?;
            table.create_index(IndexSpec::new(IndexKind::Range, "n")).await?;
            table.close().await?;
        }
        let table = BasicTable::open("t", &path, TableConfig::default()).await?;
        let meta = table.meta().await?;
        assert_eq!(meta.indexes.len(), 1);
        let rows = table
            .select(SelectQuery::all().filter(Filter::range("n", json!(0), json!(9))))
            .await?;
        assert_eq!(rows.len(), 1);
        table.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_sort_limit_offset_map() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let table = open_test_table(&dir).await?;

        table
            .insert(InsertQuery::rows([
                json!({"id": 1, "n": 3}),
                json!({"id": 2, "n": 1}),
                json!({"id": 3, "n": 2}),
            ]))
            .await?;

        let rows = table
            .select(
                SelectQuery::all()
                    .sort(Sort::by_field("n", true))
                    .offset(1)
                    .limit(1)
                    .map(|r| r["n"].clone()),
            )
            .await?;
        assert_eq!(rows, vec![json!(2)]);

        table.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_block_roll_and_auto_repair() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("t");
        let config = TableConfig::default().block_size(200);
        {
            let table = BasicTable::open("t", &path, config.clone()).await?;
            table
                .insert(InsertQuery::rows((1..=50).map(|i| json!({"id": i, "p": "xxxxxxxx"}))))
                .await?;
            table.close().await?;
        }

        // Torn trailing write on the row index journal.
        let journal = path.join("blockindex.1");
        let mut data = std::fs::read(&journal)?;
        data.extend_from_slice(b",{");
        std::fs::write(&journal, &data)?;

        assert!(BasicTable::open("t", &path, config.clone()).await.is_err());

        let table = BasicTable::open("t", &path, config.auto_repair(true)).await?;
        assert_eq!(table.row_count().await?, 50);
        table.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupted_state_marker_requires_repair() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("t");
        {
            let table = BasicTable::open("t", &path, TableConfig::default()).await?;
            table.insert(InsertQuery::rows([json!({"id": 1})])).await?;
            table.close().await?;
        }
        std::fs::write(path.join(STATE_FILE), "0")?;

        assert!(matches!(
            BasicTable::open("t", &path, TableConfig::default()).await,
            Err(Error::TableCorrupted(_))
        ));

        let table =
            BasicTable::open("t", &path, TableConfig::default().auto_repair(true)).await?;
        assert_eq!(table.row_count().await?, 1);
        assert_eq!(std::fs::read_to_string(path.join(STATE_FILE))?, "1");
        table.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_closed_table_rejects_calls() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let table = open_test_table(&dir).await?;
        table.close().await?;

        assert!(matches!(
            table.select(SelectQuery::all()).await,
            Err(Error::TableNotOpen(_))
        ));
        assert!(matches!(
            table.insert(InsertQuery::rows([json!({"a": 1})])).await,
            Err(Error::TableNotOpen(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_clone_with_filter() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let table = open_test_table(&dir).await?;
        table
            .insert(InsertQuery::rows((1..=10).map(|i| json!({"id": i, "n": i}))))
            .await?;

        let target = dir.path().join("t2");
        let keep: WhereFn = Arc::new(|r: &Value| r["n"].as_i64().unwrap() > 5);
        table.clone_to(&target, Some(keep)).await?;
        table.close().await?;

        let clone = BasicTable::open("t2", &target, TableConfig::default()).await?;
        assert_eq!(clone.row_count().await?, 5);
        let rows = clone.select(SelectQuery::all()).await?;
        assert!(rows.iter().all(|r| r["n"].as_i64().unwrap() > 5));
        clone.close().await?;
        Ok(())
    }
}
