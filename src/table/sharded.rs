//! Sharded table: many basic tables behind one contract.
//!
//! On disk a sharded table is a directory of nested basic tables: `meta`
//! holds the declared index specs, `shards` holds one record per shard
//! (`{shard, num, count}`, plus the info record with the empty name carrying
//! the aggregate count), and each shard's rows live under `s<num>/`.
//!
//! At most `cache_shards` shard tables are open at once. The cache gate is a
//! semaphore; every open shard holds a permit plus a pair of pins: `locks`
//! counts in-flight operations, `pers` is the long-lived pin a select can set
//! or clear. A shard is closable only when both are clear, and an admission
//! that finds the gate full first closes closable shards in open order, then
//! suspends on the semaphore.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use super::{basic::BasicTable, Table, TableMeta, TYPE_FILE};
use crate::config::{TableConfig, TableKind};
use crate::error::{Error, Result};
use crate::errinput;
use crate::lockqueue::LockQueue;
use crate::query::{
    DeleteQuery, Filter, IndexSpec, InsertQuery, InsertResult, SelectQuery, ShardSelector,
    UpdateQuery, WhereFn,
};

/// Autoincrement stride between shards; keeps ids disjoint across shards.
pub const SHARD_COUNT_STEP: i64 = 1 << 32;
/// Reserved shard name delegating placement to the coordinator.
pub const AUTO_SHARD: &str = "___auto";

const AUTO_PREFIX: &str = "auto_";
const META_DIR: &str = "meta";
const SHARDS_DIR: &str = "shards";

struct ShardRec {
    row_id: i64,
    num: u64,
    count: u64,
}

struct OpenShard {
    table: Arc<BasicTable>,
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
    locks: u32,
    pers: bool,
}

#[derive(Default)]
struct ShardState {
    recs: HashMap<String, ShardRec>,
    info_row_id: i64,
    total: u64,
    open: HashMap<String, OpenShard>,
    open_order: VecDeque<String>,
    free_nums: Vec<u64>,
    auto_seq: u64,
    specs: Vec<IndexSpec>,
}

pub struct ShardedTable {
    name: String,
    path: PathBuf,
    config: TableConfig,
    meta_table: Arc<BasicTable>,
    shards_table: Arc<BasicTable>,
    state: Mutex<ShardState>,
    gate: Arc<Semaphore>,
    gate_waiters: AtomicUsize,
    shard_queues: std::sync::Mutex<HashMap<String, Arc<LockQueue>>>,
    closed: AtomicBool,
}

async fn open_nested_basic(
    name: &str,
    path: &Path,
    config: TableConfig,
) -> Result<Arc<BasicTable>> {
    std::fs::create_dir_all(path)?;
    let type_path = path.join(TYPE_FILE);
    if !type_path.exists() {
        std::fs::write(&type_path, TableKind::Basic.as_str())?;
    }
    BasicTable::open(name, path, config).await
}

impl ShardedTable {
    pub async fn open(name: &str, path: &Path, config: TableConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(path)?;
        let type_path = path.join(TYPE_FILE);
        if !type_path.exists() {
            std::fs::write(&type_path, TableKind::Sharded.as_str())?;
        }

        let mut nested = config.clone();
        nested.kind = TableKind::Basic;
        nested.recreate = false;

        let meta_table =
            open_nested_basic(&format!("{name}/meta"), &path.join(META_DIR), nested.clone())
                .await?;
        let shards_table = open_nested_basic(
            &format!("{name}/shards"),
            &path.join(SHARDS_DIR),
            nested.clone(),
        )
        .await?;

        let mut state = ShardState {
            auto_seq: 1,
            ..Default::default()
        };

        for row in shards_table.select(SelectQuery::all()).await? {
            let row_id = row["id"].as_i64().unwrap_or(0);
            let shard = row["shard"].as_str().unwrap_or_default().to_string();
            let num = row["num"].as_u64().unwrap_or(0);
            let count = row["count"].as_u64().unwrap_or(0);
            if shard.is_empty() {
                state.info_row_id = row_id;
                state.total = count;
            } else {
                if let Some(seq) = shard
                    .strip_prefix(AUTO_PREFIX)
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    state.auto_seq = state.auto_seq.max(seq + 1);
                }
                state.recs.insert(shard, ShardRec { row_id, num, count });
            }
        }
        if state.info_row_id == 0 {
            let result = shards_table
                .insert(InsertQuery::rows([json!({"shard": "", "num": 0, "count": 0})]))
                .await?;
            state.info_row_id = result.last_insert_id;
        }

        for row in meta_table.select(SelectQuery::all()).await? {
            match serde_json::from_value::<IndexSpec>(row) {
                Ok(spec) => state.specs.push(spec),
                Err(e) => tracing::warn!(table = name, error = %e, "skipping bad index spec row"),
            }
        }

        let cache_shards = config.cache_shards.max(1);
        tracing::debug!(
            table = name,
            shards = state.recs.len(),
            rows = state.total,
            "sharded table opened"
        );
        Ok(Arc::new(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            config,
            meta_table,
            shards_table,
            state: Mutex::new(state),
            gate: Arc::new(Semaphore::new(cache_shards)),
            gate_waiters: AtomicUsize::new(0),
            shard_queues: std::sync::Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TableNotOpen(self.name.clone()));
        }
        Ok(())
    }

    fn shard_queue(&self, name: &str) -> Arc<LockQueue> {
        let mut queues = self.shard_queues.lock().expect("shard queue map poisoned");
        queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(LockQueue::new()))
            .clone()
    }

    fn alloc_num(state: &mut ShardState) -> u64 {
        if let Some(num) = state.free_nums.pop() {
            return num;
        }
        let used: BTreeSet<u64> = state.recs.values().map(|r| r.num).collect();
        let max = used.iter().max().copied().unwrap_or(0);
        let mut free: Vec<u64> = (1..=max).filter(|n| !used.contains(n)).collect();
        free.push(max + 1);
        // Pop from the back hands out the smallest first.
        free.sort_unstable_by(|a, b| b.cmp(a));
        let num = free.pop().unwrap();
        state.free_nums = free;
        num
    }

    /// Close the first open shard with no pins. Returns whether one closed.
    async fn close_one_closable(&self) -> Result<bool> {
        let victim = {
            let mut state = self.state.lock().await;
            let name = state
                .open_order
                .iter()
                .find(|name| {
                    state
                        .open
                        .get(*name)
                        .is_some_and(|os| os.locks == 0 && !os.pers)
                })
                .cloned();
            match name {
                Some(name) => {
                    state.open_order.retain(|n| n != &name);
                    state.open.remove(&name).map(|os| (name, os))
                }
                None => None,
            }
        };
        match victim {
            Some((name, os)) => {
                os.table.close().await?;
                tracing::debug!(table = %self.name, shard = %name, "shard evicted from cache");
                // Dropping `os` releases the permit to the next admission.
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pin a shard for use, opening it (and allocating its record) if
    /// needed. Every `lock_shard` is paired with an `unlock_shard`.
    async fn lock_shard(&self, name: &str, create: bool) -> Result<Arc<BasicTable>> {
        if name.is_empty() || name == AUTO_SHARD || name.contains('/') {
            return errinput!("invalid shard name {name:?}");
        }
        let queue = self.shard_queue(name);
        let _guard = queue.lock().await?;

        {
            let mut state = self.state.lock().await;
            if let Some(os) = state.open.get_mut(name) {
                os.locks += 1;
                return Ok(os.table.clone());
            }
            if !state.recs.contains_key(name) && !create {
                return Err(Error::ShardNotFound(format!("{}/{name}", self.name)));
            }
        }

        // Admission: take a cache slot, closing idle shards when full.
        let permit = loop {
            match self.gate.clone().try_acquire_owned() {
                Ok(permit) => break permit,
                Err(_) => {
                    if self.close_one_closable().await? {
                        continue;
                    }
                    self.gate_waiters.fetch_add(1, Ordering::SeqCst);
                    let acquired = self.gate.clone().acquire_owned().await;
                    self.gate_waiters.fetch_sub(1, Ordering::SeqCst);
                    match acquired {
                        Ok(permit) => break permit,
                        Err(_) => return Err(Error::TableNotOpen(self.name.clone())),
                    }
                }
            }
        };

        let num = {
            let mut state = self.state.lock().await;
            match state.recs.get(name) {
                Some(rec) => rec.num,
                None => {
                    let num = Self::alloc_num(&mut state);
                    let result = self
                        .shards_table
                        .insert(InsertQuery::rows([
                            json!({"shard": name, "num": num, "count": 0}),
                        ]))
                        .await?;
                    state.recs.insert(
                        name.to_string(),
                        ShardRec {
                            row_id: result.last_insert_id,
                            num,
                            count: 0,
                        },
                    );
                    tracing::debug!(table = %self.name, shard = name, num, "shard allocated");
                    num
                }
            }
        };

        let mut shard_config = self.config.clone();
        shard_config.kind = TableKind::Basic;
        shard_config.recreate = false;
        let table = open_nested_basic(
            &format!("{}/s{num}", self.name),
            &self.path.join(format!("s{num}")),
            shard_config,
        )
        .await?;
        table.ensure_seed(num as i64 * SHARD_COUNT_STEP);

        // Bring the shard's indexes up to the declared set.
        let existing = table.meta().await?.indexes;
        let specs = self.state.lock().await.specs.clone();
        for spec in specs {
            if !existing
                .iter()
                .any(|s| s.field == spec.field && s.kind == spec.kind)
            {
                table.create_index(spec).await?;
            }
        }

        let mut state = self.state.lock().await;
        state.open.insert(
            name.to_string(),
            OpenShard {
                table: table.clone(),
                permit,
                locks: 1,
                pers: false,
            },
        );
        state.open_order.push_back(name.to_string());
        Ok(table)
    }

    /// Drop an operation pin; optionally set or clear the persistent pin.
    /// A shard left unpinned is closed straight away when admissions are
    /// waiting on the gate.
    async fn unlock_shard(&self, name: &str, set_pers: Option<bool>) -> Result<()> {
        let closing = {
            let mut state = self.state.lock().await;
            let Some(os) = state.open.get_mut(name) else {
                return Ok(());
            };
            os.locks = os.locks.saturating_sub(1);
            if let Some(pers) = set_pers {
                os.pers = pers;
            }
            let closable = os.locks == 0 && !os.pers;
            if closable && self.gate_waiters.load(Ordering::SeqCst) > 0 {
                state.open_order.retain(|n| n != name);
                state.open.remove(name)
            } else {
                None
            }
        };
        if let Some(os) = closing {
            os.table.close().await?;
            tracing::debug!(table = %self.name, shard = name, "shard closed for waiting admission");
        }
        Ok(())
    }

    /// Shards a call fans out to: opened shards first, then the rest.
    async fn resolve_shards(&self, selector: Option<&ShardSelector>) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = match selector {
            Some(ShardSelector::List(list)) => {
                for name in list {
                    if !state.recs.contains_key(name) {
                        return Err(Error::ShardNotFound(format!("{}/{name}", self.name)));
                    }
                }
                list.clone()
            }
            Some(ShardSelector::Filter(f)) => {
                state.recs.keys().filter(|n| f(n.as_str())).cloned().collect()
            }
            None => state.recs.keys().cloned().collect(),
        };
        names.sort_unstable();
        names.dedup();
        let (opened, rest): (Vec<String>, Vec<String>) = names
            .into_iter()
            .partition(|name| state.open.contains_key(name));
        let mut ordered = opened;
        ordered.extend(rest);
        Ok(ordered)
    }

    /// Pick a shard for an `___auto` row: an open shard with room first,
    /// then any shard with room, else a fresh `auto_<n>` name.
    fn pick_auto(
        working: &HashMap<String, u64>,
        open_order: &[String],
        auto_seq: &mut u64,
        cap: u64,
    ) -> String {
        for name in open_order {
            if working.get(name).copied().unwrap_or(0) < cap {
                return name.clone();
            }
        }
        let mut known: Vec<&String> = working.keys().collect();
        known.sort();
        for name in known {
            if working[name] < cap {
                return name.clone();
            }
        }
        loop {
            let candidate = format!("{AUTO_PREFIX}{auto_seq}");
            *auto_seq += 1;
            if !working.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Apply a count change to one shard record and the info record, and
    /// persist both.
    async fn bump_counts(&self, shard: &str, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let (row_id, new_count, info_row_id, new_total) = {
            let mut state = self.state.lock().await;
            let Some(rec) = state.recs.get_mut(shard) else {
                return Err(Error::ShardNotFound(format!("{}/{shard}", self.name)));
            };
            rec.count = (rec.count as i64 + delta).max(0) as u64;
            let pair = (rec.row_id, rec.count);
            state.total = (state.total as i64 + delta).max(0) as u64;
            (pair.0, pair.1, state.info_row_id, state.total)
        };
        self.shards_table
            .update(UpdateQuery::new(Filter::ids([row_id]), move |row| {
                row["count"] = json!(new_count)
            }))
            .await?;
        self.shards_table
            .update(UpdateQuery::new(Filter::ids([info_row_id]), move |row| {
                row["count"] = json!(new_total)
            }))
            .await?;
        Ok(())
    }

    /// Remove an emptied auto shard: close it, drop its record and files,
    /// recycle its num and reset the auto-shard naming step.
    async fn drop_shard(&self, name: &str) -> Result<()> {
        let queue = self.shard_queue(name);
        let _guard = queue.lock().await?;

        let (stashed, removed) = {
            let mut state = self.state.lock().await;
            if let Some(os) = state.open.get(name) {
                if os.locks > 0 || os.pers {
                    return Ok(()); // pinned; leave it alone
                }
            }
            let stashed = state.open.remove(name);
            state.open_order.retain(|n| n != name);
            let Some(rec) = state.recs.remove(name) else {
                return Ok(());
            };
            state.free_nums.push(rec.num);
            state.auto_seq = 1;
            (stashed, rec)
        };
        if let Some(os) = stashed {
            os.table.close().await?;
        }
        self.shards_table
            .delete(DeleteQuery::filter(Filter::ids([removed.row_id])))
            .await?;
        let dir = self.path.join(format!("s{}", removed.num));
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        tracing::info!(table = %self.name, shard = name, "empty auto shard dropped");
        Ok(())
    }
}

#[async_trait]
impl Table for ShardedTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TableKind {
        TableKind::Sharded
    }

    fn config(&self) -> TableConfig {
        self.config.clone()
    }

    async fn select(&self, query: SelectQuery) -> Result<Vec<Value>> {
        self.check_open()?;
        let names = self.resolve_shards(query.shards.as_ref()).await?;
        let mut out = Vec::new();
        for name in names {
            let table = self.lock_shard(&name, false).await?;
            let shard_query = SelectQuery {
                filter: query.filter.clone(),
                sort: query.sort.clone(),
                map: query.map.clone(),
                limit: query.limit,
                offset: query.offset,
                join: None,
                shards: None,
                persistent: None,
            };
            let result = table.select(shard_query).await;
            self.unlock_shard(&name, query.persistent).await?;
            out.extend(result?);
        }
        Ok(out)
    }

    async fn insert(&self, query: InsertQuery) -> Result<InsertResult> {
        self.check_open()?;
        if query.rows.is_empty() {
            return Err(Error::MissingParameter("rows".to_string()));
        }

        // Resolve every row to a shard up front, counting pending placements
        // so auto-sharding fills shards to the budget within one call.
        let mut groups: Vec<(String, Vec<Value>)> = Vec::new();
        let mut group_idx: HashMap<String, usize> = HashMap::new();
        {
            let mut state = self.state.lock().await;
            let mut working: HashMap<String, u64> = state
                .recs
                .iter()
                .map(|(name, rec)| (name.clone(), rec.count))
                .collect();
            let open_order: Vec<String> = state.open_order.iter().cloned().collect();
            let mut auto_seq = state.auto_seq;

            for row in &query.rows {
                let Some(obj) = row.as_object() else {
                    return errinput!("row must be an object");
                };
                if obj.contains_key("id") {
                    return errinput!("sharded inserts assign ids; remove the id field");
                }
                let mut row = row.clone();
                let shard = match row.as_object_mut().unwrap().remove("shard") {
                    Some(Value::String(s)) => s,
                    Some(_) => return errinput!("shard field must be a string"),
                    None => match &query.shard_gen {
                        Some(gen) => gen(&row),
                        None => return Err(Error::MissingParameter("shard".to_string())),
                    },
                };
                let shard = if shard == AUTO_SHARD {
                    Self::pick_auto(
                        &working,
                        &open_order,
                        &mut auto_seq,
                        self.config.auto_shard_size,
                    )
                } else {
                    shard
                };
                *working.entry(shard.clone()).or_insert(0) += 1;
                match group_idx.get(&shard) {
                    Some(&i) => groups[i].1.push(row),
                    None => {
                        group_idx.insert(shard.clone(), groups.len());
                        groups.push((shard, vec![row]));
                    }
                }
            }
            state.auto_seq = auto_seq;
        }

        let mut result = InsertResult::default();
        for (shard, rows) in groups {
            let table = self.lock_shard(&shard, true).await?;
            let outcome = table.insert(InsertQuery::rows(rows)).await;
            self.unlock_shard(&shard, None).await?;
            let done = outcome?;
            result.inserted += done.inserted;
            result.last_insert_id = done.last_insert_id;
            self.bump_counts(&shard, done.inserted as i64).await?;
        }
        Ok(result)
    }

    async fn update(&self, query: UpdateQuery) -> Result<u64> {
        self.check_open()?;
        let names = self.resolve_shards(query.shards.as_ref()).await?;
        let mut total = 0u64;
        for name in names {
            let table = self.lock_shard(&name, false).await?;
            let shard_query = UpdateQuery {
                filter: query.filter.clone(),
                modify: query.modify.clone(),
                shards: None,
            };
            let result = table.update(shard_query).await;
            self.unlock_shard(&name, None).await?;
            total += result?;
        }
        Ok(total)
    }

    async fn delete(&self, query: DeleteQuery) -> Result<u64> {
        self.check_open()?;
        let names = self.resolve_shards(query.shards.as_ref()).await?;
        let mut total = 0u64;
        let mut emptied: Vec<String> = Vec::new();
        for name in names {
            let table = self.lock_shard(&name, false).await?;
            let shard_query = DeleteQuery {
                filter: query.filter.clone(),
                shards: None,
            };
            let result = table.delete(shard_query).await;
            self.unlock_shard(&name, None).await?;
            let deleted = result?;
            if deleted > 0 {
                self.bump_counts(&name, -(deleted as i64)).await?;
            }
            total += deleted;

            let emptied_now = {
                let state = self.state.lock().await;
                state.recs.get(&name).map(|r| r.count).unwrap_or(0) == 0
            };
            if emptied_now && name.starts_with(AUTO_PREFIX) {
                emptied.push(name);
            }
        }
        for name in emptied {
            self.drop_shard(&name).await?;
        }
        Ok(total)
    }

    async fn create_index(&self, spec: IndexSpec) -> Result<()> {
        self.check_open()?;
        if spec.unique {
            return Err(Error::UniqueConstraintUnsupported);
        }
        let open_tables: Vec<Arc<BasicTable>> = {
            let mut state = self.state.lock().await;
            if state
                .specs
                .iter()
                .any(|s| s.field == spec.field && s.kind == spec.kind)
            {
                return errinput!("index on field {:?} already exists", spec.field);
            }
            state.specs.push(spec.clone());
            state.open.values().map(|os| os.table.clone()).collect()
        };
        self.meta_table
            .insert(InsertQuery::rows([serde_json::to_value(&spec)?]))
            .await?;
        for table in open_tables {
            table.create_index(spec.clone()).await?;
        }
        Ok(())
    }

    async fn drop_index(&self, field: &str) -> Result<()> {
        self.check_open()?;
        let open_tables: Vec<Arc<BasicTable>> = {
            let mut state = self.state.lock().await;
            let before = state.specs.len();
            state.specs.retain(|s| s.field != field);
            if state.specs.len() == before {
                return errinput!("no index on field {field:?}");
            }
            state.open.values().map(|os| os.table.clone()).collect()
        };
        let field_owned = field.to_string();
        self.meta_table
            .delete(DeleteQuery::filter(Filter::wher(move |row| {
                row["field"].as_str() == Some(field_owned.as_str())
            })))
            .await?;
        for table in open_tables {
            // A shard opened before the spec landed may not have it.
            let _ = table.drop_index(field).await;
        }
        Ok(())
    }

    async fn meta(&self) -> Result<TableMeta> {
        let state = self.state.lock().await;
        Ok(TableMeta {
            name: self.name.clone(),
            kind: TableKind::Sharded,
            row_count: state.total,
            indexes: state.specs.clone(),
        })
    }

    async fn row_count(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.state.lock().await.total)
    }

    async fn clone_to(&self, target: &Path, filter: Option<WhereFn>) -> Result<()> {
        self.check_open()?;
        if target.exists() {
            return errinput!("clone target {} already exists", target.display());
        }
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("clone")
            .to_string();
        let mut clone_config = self.config.clone();
        clone_config.recreate = false;
        let clone = ShardedTable::open(&name, target, clone_config).await?;

        let specs = self.state.lock().await.specs.clone();
        for spec in specs {
            clone.create_index(spec).await?;
        }

        // Naive per-shard fan-out; rows are re-inserted so the clone assigns
        // fresh ids and recomputes every count itself.
        let names = self.resolve_shards(None).await?;
        for shard in names {
            let table = self.lock_shard(&shard, false).await?;
            let rows = table.select(SelectQuery::all()).await;
            self.unlock_shard(&shard, None).await?;
            let mut rows = rows?;
            if let Some(f) = &filter {
                rows.retain(|row| f(row));
            }
            for chunk in rows.chunks(500) {
                let prepared: Vec<Value> = chunk
                    .iter()
                    .map(|row| {
                        let mut row = row.clone();
                        if let Some(obj) = row.as_object_mut() {
                            obj.remove("id");
                            obj.insert("shard".to_string(), json!(shard));
                        }
                        row
                    })
                    .collect();
                clone.insert(InsertQuery::rows(prepared)).await?;
            }
        }
        clone.close().await?;
        tracing::info!(table = %self.name, target = %target.display(), "sharded table cloned");
        Ok(())
    }

    async fn mark_corrupted(&self, message: &str) -> Result<()> {
        tracing::error!(table = %self.name, message, "sharded table marked corrupted");
        self.close().await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let open: Vec<OpenShard> = {
            let mut state = self.state.lock().await;
            state.open_order.clear();
            state.open.drain().map(|(_, os)| os).collect()
        };
        for os in open {
            os.table.close().await?;
        }
        self.meta_table.close().await?;
        self.shards_table.close().await?;
        tracing::debug!(table = %self.name, "sharded table closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::IndexKind;
    use crate::tmpfs::TempDir;
    use std::time::Duration;

    async fn open_test_table(dir: &TempDir, config: TableConfig) -> Result<Arc<ShardedTable>> {
        ShardedTable::open("s", &dir.path().join("s"), config).await
    }

    fn sharded_config() -> TableConfig {
        TableConfig::new(TableKind::Sharded)
    }

    #[tokio::test]
    async fn test_insert_routes_by_shard_field() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let table = open_test_table(&dir, sharded_config()).await?;

        let result = table
            .insert(InsertQuery::rows([
                json!({"shard": "a", "v": 1}),
                json!({"shard": "b", "v": 2}),
                json!({"shard": "a", "v": 3}),
            ]))
            .await?;
        assert_eq!(result.inserted, 3);

        let rows = table.select(SelectQuery::all().shards(["a"])).await?;
        assert_eq!(rows.len(), 2);
        // Shard ids live in disjoint ranges.
        assert!(rows.iter().all(|r| r["id"].as_i64().unwrap() >= SHARD_COUNT_STEP));

        assert_eq!(table.row_count().await?, 3);
        table.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_insert_rejects_explicit_id() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let table = open_test_table(&dir, sharded_config()).await?;
        assert!(table
            .insert(InsertQuery::rows([json!({"id": 1, "shard": "a"})]))
            .await
            .is_err());
        table.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_auto_sharding_fills_to_budget() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let table = open_test_table(&dir, sharded_config().auto_shard_size(3)).await?;

        table
            .insert(InsertQuery::rows(
                (0..10).map(|i| json!({"shard": AUTO_SHARD, "v": i})),
            ))
            .await?;

        let state = table.state.lock().await;
        let mut names: Vec<&String> = state.recs.keys().collect();
        names.sort();
        assert_eq!(names, ["auto_1", "auto_2", "auto_3", "auto_4"]);
        for rec in state.recs.values() {
            assert!((1..=3).contains(&rec.count), "count {} out of range", rec.count);
        }
        let sum: u64 = state.recs.values().map(|r| r.count).sum();
        assert_eq!(sum, 10);
        assert_eq!(state.total, 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_counts_persist_and_agree() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("s");
        {
            let table = ShardedTable::open("s", &path, sharded_config()).await?;
            table
                .insert(InsertQuery::rows([
                    json!({"shard": "a", "v": 1}),
                    json!({"shard": "b", "v": 2}),
                    json!({"shard": "b", "v": 3}),
                ]))
                .await?;
            table.close().await?;
        }

        let table = ShardedTable::open("s", &path, sharded_config()).await?;
        assert_eq!(table.row_count().await?, 3);

        // Invariant: shard counts sum to the info record's total.
        let rows = table.shards_table.select(SelectQuery::all()).await?;
        let mut total = 0;
        let mut info = 0;
        for row in &rows {
            if row["shard"] == json!("") {
                info = row["count"].as_u64().unwrap();
            } else {
                total += row["count"].as_u64().unwrap();
            }
        }
        assert_eq!(total, info);
        assert_eq!(info, 3);
        table.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_adjusts_counts_and_drops_empty_auto_shards() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let table = open_test_table(&dir, sharded_config().auto_shard_size(2)).await?;

        table
            .insert(InsertQuery::rows(
                (0..4).map(|i| json!({"shard": AUTO_SHARD, "v": i})),
            ))
            .await?;
        let nums: Vec<u64> = {
            let state = table.state.lock().await;
            state.recs.values().map(|r| r.num).collect()
        };
        assert_eq!(nums.len(), 2);

        let deleted = table
            .delete(DeleteQuery::filter(Filter::wher(|r| {
                r["v"].as_i64().unwrap() < 2
            })))
            .await?;
        assert_eq!(deleted, 2);
        assert_eq!(table.row_count().await?, 2);

        // One shard emptied out: record gone, directory gone, num recycled.
        let state = table.state.lock().await;
        assert_eq!(state.recs.len(), 1);
        assert_eq!(state.auto_seq, 1);
        let live_num = state.recs.values().next().unwrap().num;
        for num in nums {
            let dir_exists = dir.path().join("s").join(format!("s{num}")).exists();
            assert_eq!(dir_exists, num == live_num);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_update_fans_out() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let table = open_test_table(&dir, sharded_config()).await?;
        table
            .insert(InsertQuery::rows([
                json!({"shard": "a", "v": 1}),
                json!({"shard": "b", "v": 2}),
            ]))
            .await?;

        let updated = table
            .update(UpdateQuery::new(Filter::All, |row| {
                row["touched"] = json!(true)
            }))
            .await?;
        assert_eq!(updated, 2);

        let rows = table.select(SelectQuery::all()).await?;
        assert!(rows.iter().all(|r| r["touched"] == json!(true)));
        table.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_unique_index_rejected() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let table = open_test_table(&dir, sharded_config()).await?;
        assert_eq!(
            table
                .create_index(IndexSpec::new(IndexKind::Hash, "v").unique(true))
                .await,
            Err(Error::UniqueConstraintUnsupported)
        );
        table.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_index_specs_reach_shards() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("s");
        {
            let table = ShardedTable::open("s", &path, sharded_config()).await?;
            table.create_index(IndexSpec::new(IndexKind::Range, "v")).await?;
            table.insert(InsertQuery::rows([json!({"shard": "a", "v": 5})])).await?;
            table.close().await?;
        }
        let table = ShardedTable::open("s", &path, sharded_config()).await?;
        assert_eq!(table.meta().await?.indexes.len(), 1);
        let rows = table
            .select(SelectQuery::all().filter(Filter::range("v", json!(0), json!(9))))
            .await?;
        assert_eq!(rows.len(), 1);
        table.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_persistent_pin_blocks_eviction() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let table = open_test_table(&dir, sharded_config().cache_shards(1)).await?;
        table
            .insert(InsertQuery::rows([
                json!({"shard": "a", "v": 1}),
                json!({"shard": "b", "v": 2}),
            ]))
            .await?;

        // Pin shard a persistently.
        table
            .select(SelectQuery::all().shards(["a"]).persistent(true))
            .await?;
        assert!(table.state.lock().await.open["a"].pers);

        // A select against b must wait until the pin clears.
        let blocked = {
            let table = table.clone();
            tokio::spawn(async move { table.select(SelectQuery::all().shards(["b"])).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "select should wait on the pinned cache");

        // Clearing the pin lets the waiter through.
        table
            .select(SelectQuery::all().shards(["a"]).persistent(false))
            .await?;
        let rows = blocked.await.unwrap()?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["v"], json!(2));

        table.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_shard_cache_evicts_in_open_order() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let table = open_test_table(&dir, sharded_config().cache_shards(2)).await?;
        table
            .insert(InsertQuery::rows([
                json!({"shard": "a", "v": 1}),
                json!({"shard": "b", "v": 2}),
                json!({"shard": "c", "v": 3}),
            ]))
            .await?;

        // Only the cache budget stays open.
        let state = table.state.lock().await;
        assert!(state.open.len() <= 2);
        drop(state);

        // Everything remains reachable regardless of cache churn.
        let rows = table.select(SelectQuery::all()).await?;
        assert_eq!(rows.len(), 3);
        table.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_clone_recomputes_counts() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let table = open_test_table(&dir, sharded_config()).await?;
        table
            .insert(InsertQuery::rows(
                (0..6).map(|i| json!({"shard": if i % 2 == 0 { "a" } else { "b" }, "v": i})),
            ))
            .await?;

        let target = dir.path().join("s2");
        let keep: WhereFn = Arc::new(|row: &Value| row["v"].as_i64().unwrap() >= 2);
        table.clone_to(&target, Some(keep)).await?;
        table.close().await?;

        let clone = ShardedTable::open("s2", &target, sharded_config()).await?;
        assert_eq!(clone.row_count().await?, 4);
        let rows = clone.select(SelectQuery::all()).await?;
        assert!(rows.iter().all(|r| r["v"].as_i64().unwrap() >= 2));
        clone.close().await?;
        Ok(())
    }
}
