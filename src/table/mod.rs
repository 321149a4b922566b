//! Table contract and flavors: persistent, in-memory, sharded.

pub mod basic;
pub mod memory;
pub mod sharded;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{TableConfig, TableKind};
use crate::error::{Error, Result};
use crate::query::{
    json_cmp, DeleteQuery, IndexKind, IndexSpec, InsertQuery, InsertResult, SelectQuery,
    UpdateQuery, WhereFn,
};
use crate::{errdata, errinput};

pub use basic::BasicTable;
pub use memory::MemoryTable;
pub use sharded::ShardedTable;

/// Table flavor marker file.
pub const TYPE_FILE: &str = "type";
/// Index specs for basic tables, flag-framed JSON.
pub const META_FILE: &str = "meta";
/// Directory-name infix marking half-finished truncate/clone leftovers.
pub const TEMPORARY_MARKER: &str = "___temporary";

#[derive(Debug, Clone)]
pub struct TableMeta {
    pub name: String,
    pub kind: TableKind,
    pub row_count: u64,
    pub indexes: Vec<IndexSpec>,
}

/// The contract every table flavor implements.
#[async_trait]
pub trait Table: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> TableKind;
    fn config(&self) -> TableConfig;

    async fn select(&self, query: SelectQuery) -> Result<Vec<Value>>;
    async fn insert(&self, query: InsertQuery) -> Result<InsertResult>;
    async fn update(&self, query: UpdateQuery) -> Result<u64>;
    async fn delete(&self, query: DeleteQuery) -> Result<u64>;

    async fn create_index(&self, spec: IndexSpec) -> Result<()>;
    async fn drop_index(&self, field: &str) -> Result<()>;

    async fn meta(&self) -> Result<TableMeta>;
    async fn row_count(&self) -> Result<u64>;

    /// Copy live rows (optionally filtered) into a fresh table directory.
    async fn clone_to(&self, target: &Path, filter: Option<WhereFn>) -> Result<()>;

    /// Mark the table failed and close it; later calls fail fast.
    async fn mark_corrupted(&self, message: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Open (or create) the table at `path`, dispatching on its `type` file.
pub async fn open_table(
    name: &str,
    path: &Path,
    mut config: TableConfig,
    create: bool,
) -> Result<Arc<dyn Table>> {
    if config.recreate && path.exists() {
        std::fs::remove_dir_all(path)?;
    }

    let type_path = path.join(TYPE_FILE);
    if !path.exists() || !type_path.exists() {
        if !create && !config.recreate {
            return Err(Error::TableNotFound(name.to_string()));
        }
        std::fs::create_dir_all(path)?;
        std::fs::write(&type_path, config.kind.as_str())?;
    } else {
        let on_disk = std::fs::read_to_string(&type_path)?;
        let Some(kind) = TableKind::parse(&on_disk) else {
            return errdata!("unknown table type {on_disk:?} for {name}");
        };
        if kind != config.kind {
            if !config.type_compat_mode {
                return errinput!(
                    "table {name} is {} on disk, {} requested",
                    kind.as_str(),
                    config.kind.as_str()
                );
            }
            config.kind = kind;
        }
    }

    let table: Arc<dyn Table> = match config.kind {
        TableKind::Basic => BasicTable::open(name, path, config).await?,
        TableKind::Memory => Arc::new(MemoryTable::new(name, config)),
        TableKind::Sharded => ShardedTable::open(name, path, config).await?,
    };
    Ok(table)
}

/// JSON value with a total order, usable as a range-index key.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OrdValue(pub Value);

impl Eq for OrdValue {}

impl PartialOrd for OrdValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdValue {
    fn cmp(&self, other: &Self) -> Ordering {
        json_cmp(&self.0, &other.0)
    }
}

/// In-memory secondary index structures shared by the table flavors.
#[derive(Default)]
pub(crate) struct Indexes {
    specs: Vec<IndexSpec>,
    /// field -> ids with a truthy value
    flags: HashMap<String, BTreeSet<i64>>,
    /// field -> rendered value -> ids
    hash: HashMap<String, HashMap<String, BTreeSet<i64>>>,
    /// field -> ordered value -> ids
    range: HashMap<String, BTreeMap<OrdValue, BTreeSet<i64>>>,
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

impl Indexes {
    pub fn new(specs: Vec<IndexSpec>) -> Self {
        let mut indexes = Self::default();
        for spec in specs {
            indexes.register(&spec);
            indexes.specs.push(spec);
        }
        indexes
    }

    fn register(&mut self, spec: &IndexSpec) {
        match spec.kind {
            IndexKind::Flag => {
                self.flags.entry(spec.field.clone()).or_default();
            }
            IndexKind::Hash => {
                self.hash.entry(spec.field.clone()).or_default();
            }
            IndexKind::Range => {
                self.range.entry(spec.field.clone()).or_default();
            }
        }
    }

    pub fn specs(&self) -> &[IndexSpec] {
        &self.specs
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Add a declaration; the caller populates it via `apply_spec`.
    pub fn add_spec(&mut self, spec: IndexSpec) -> Result<()> {
        if self
            .specs
            .iter()
            .any(|s| s.field == spec.field && s.kind == spec.kind)
        {
            return errinput!("index on field {:?} already exists", spec.field);
        }
        self.register(&spec);
        self.specs.push(spec);
        Ok(())
    }

    /// Drop every index declared on the field. Returns whether any existed.
    pub fn remove_field(&mut self, field: &str) -> bool {
        let before = self.specs.len();
        self.specs.retain(|s| s.field != field);
        self.flags.remove(field);
        self.hash.remove(field);
        self.range.remove(field);
        before != self.specs.len()
    }

    /// Index one row under a single spec (used when backfilling a new index).
    pub fn apply_spec(&mut self, spec: &IndexSpec, id: i64, row: &Value) {
        let Some(value) = row.get(spec.field.as_str()) else {
            return;
        };
        match spec.kind {
            IndexKind::Flag => {
                if truthy(value) {
                    self.flags.entry(spec.field.clone()).or_default().insert(id);
                }
            }
            IndexKind::Hash => {
                self.hash
                    .entry(spec.field.clone())
                    .or_default()
                    .entry(crate::util::esc(value))
                    .or_default()
                    .insert(id);
            }
            IndexKind::Range => {
                self.range
                    .entry(spec.field.clone())
                    .or_default()
                    .entry(OrdValue(value.clone()))
                    .or_default()
                    .insert(id);
            }
        }
    }

    pub fn on_insert(&mut self, id: i64, row: &Value) {
        let specs: Vec<IndexSpec> = self.specs.clone();
        for spec in &specs {
            self.apply_spec(spec, id, row);
        }
    }

    pub fn on_delete(&mut self, id: i64, row: &Value) {
        for spec in &self.specs.clone() {
            let Some(value) = row.get(spec.field.as_str()) else {
                continue;
            };
            match spec.kind {
                IndexKind::Flag => {
                    if let Some(set) = self.flags.get_mut(&spec.field) {
                        set.remove(&id);
                    }
                }
                IndexKind::Hash => {
                    if let Some(buckets) = self.hash.get_mut(&spec.field) {
                        let key = crate::util::esc(value);
                        if let Some(set) = buckets.get_mut(&key) {
                            set.remove(&id);
                            if set.is_empty() {
                                buckets.remove(&key);
                            }
                        }
                    }
                }
                IndexKind::Range => {
                    if let Some(tree) = self.range.get_mut(&spec.field) {
                        let key = OrdValue(value.clone());
                        if let Some(set) = tree.get_mut(&key) {
                            set.remove(&id);
                            if set.is_empty() {
                                tree.remove(&key);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Serve a range filter from the ordered index, if one covers the field.
    pub fn range_lookup(&self, field: &str, lo: &Value, hi: &Value) -> Option<Vec<i64>> {
        let tree = self.range.get(field)?;
        let mut ids = Vec::new();
        for (_, set) in tree.range(OrdValue(lo.clone())..=OrdValue(hi.clone())) {
            ids.extend(set.iter().copied());
        }
        ids.sort_unstable();
        Some(ids)
    }
}
