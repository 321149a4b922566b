//! Database directory manager: owns the table map, the directory lock, the
//! scheduler, and the monitoring interception.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::{DbConfig, TableConfig, TableKind};
use crate::error::{Error, Result};
use crate::errinput;
use crate::flock::{FileLock, LockMode};
use crate::lockqueue::LockQueue;
use crate::monitor::{Monitor, SweepTask};
use crate::query::{
    DeleteQuery, Filter, IndexSpec, InsertQuery, InsertResult, SelectQuery, UpdateQuery, WhereFn,
};
use crate::scheduler::Scheduler;
use crate::table::{self, MemoryTable, Table, TableMeta, TEMPORARY_MARKER, TYPE_FILE};

/// Size breakdown for one table directory.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub kind: Option<TableKind>,
    pub open: bool,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct DbInfo {
    pub path: PathBuf,
    pub tables: Vec<TableInfo>,
}

/// One database directory: many tables behind per-table serialization, all
/// under a single directory lock.
pub struct Database {
    config: DbConfig,
    tables: Mutex<HashMap<String, Arc<dyn Table>>>,
    table_queues: std::sync::Mutex<HashMap<String, Arc<LockQueue>>>,
    lock: std::sync::Mutex<Option<FileLock>>,
    scheduler: Scheduler,
    monitor: Option<Arc<Monitor>>,
    closed: AtomicBool,
}

impl Database {
    /// Open the directory under its file lock, creating it when configured.
    pub async fn open(config: DbConfig) -> Result<Arc<Self>> {
        if !config.path.exists() {
            if !config.create {
                return errinput!("database directory {} does not exist", config.path.display());
            }
            std::fs::create_dir_all(&config.path)?;
        }
        let mode = if config.ignore_lock {
            LockMode::Ignore
        } else if config.soft_lock {
            LockMode::Soft
        } else {
            LockMode::Hard
        };
        let lock = FileLock::acquire(&config.path, mode).await?;

        let monitor = config
            .monitor
            .enable
            .then(|| Arc::new(Monitor::new(config.monitor.clone())));

        let db = Arc::new(Self {
            config,
            tables: Mutex::new(HashMap::new()),
            table_queues: std::sync::Mutex::new(HashMap::new()),
            lock: std::sync::Mutex::new(Some(lock)),
            scheduler: Scheduler::new(),
            monitor,
            closed: AtomicBool::new(false),
        });
        if let Some(monitor) = &db.monitor {
            db.tables
                .lock()
                .await
                .insert(monitor.table_name().to_string(), monitor.table());
            db.scheduler.register(Arc::new(SweepTask {
                monitor: monitor.clone(),
            }));
        }
        tracing::info!(path = %db.config.path.display(), "database opened");
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::DatabaseClosed);
        }
        Ok(())
    }

    fn check_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::MissingParameter("table".to_string()));
        }
        if name.contains('/') || name.contains(TEMPORARY_MARKER) {
            return errinput!("invalid table name {name:?}");
        }
        Ok(())
    }

    fn table_queue(&self, name: &str) -> Arc<LockQueue> {
        let mut queues = self.table_queues.lock().expect("table queue map poisoned");
        queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(LockQueue::new()))
            .clone()
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.config.path.join(name)
    }

    fn merged_config(&self, config: Option<TableConfig>) -> TableConfig {
        config.unwrap_or_else(|| self.config.table_defaults.clone())
    }

    /// Book a monitoring record around an operation when interception is on.
    async fn monitored<T, F>(&self, method: &'static str, query: String, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let Some(monitor) = &self.monitor else {
            return op.await;
        };
        let id = monitor.begin(method, &query).await?;
        let result = op.await;
        let error = result.as_ref().err().map(|e| e.to_string());
        monitor.end(id, error).await;
        result
    }

    async fn get_table(&self, name: &str) -> Result<Arc<dyn Table>> {
        if let Some(table) = self.tables.lock().await.get(name) {
            return Ok(table.clone());
        }
        if self.table_path(name).is_dir() {
            Err(Error::TableNotOpen(name.to_string()))
        } else {
            Err(Error::TableNotFound(name.to_string()))
        }
    }

    async fn exists_inner(&self, name: &str) -> bool {
        if self.tables.lock().await.contains_key(name) {
            return true;
        }
        self.table_path(name).join(TYPE_FILE).is_file()
    }

    /// Whether the table is open or present on disk.
    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        self.check_open()?;
        self.monitored("exists", format!("exists {name}"), async {
            Ok(self.exists_inner(name).await)
        })
        .await
    }

    /// Create a table and leave it open.
    pub async fn create_table(&self, name: &str, config: Option<TableConfig>) -> Result<()> {
        self.check_open()?;
        Self::check_name(name)?;
        self.monitored("create", format!("create {name}"), async {
            let queue = self.table_queue(name);
            let _guard = queue.lock().await?;
            if self.exists_inner(name).await {
                return Err(Error::TableAlreadyExists(name.to_string()));
            }
            let config = self.merged_config(config);
            let table = table::open_table(name, &self.table_path(name), config, true).await?;
            self.tables.lock().await.insert(name.to_string(), table);
            tracing::info!(table = name, "table created");
            Ok(())
        })
        .await
    }

    /// Open an existing table; a no-op when it is already open.
    pub async fn open_table(&self, name: &str, config: Option<TableConfig>) -> Result<()> {
        self.check_open()?;
        Self::check_name(name)?;
        self.monitored("open", format!("open {name}"), self.open_table_inner(name, config))
            .await
    }

    async fn open_table_inner(&self, name: &str, config: Option<TableConfig>) -> Result<()> {
        if self.tables.lock().await.contains_key(name) {
            return Ok(());
        }
        let config = self.merged_config(config);
        let table = table::open_table(name, &self.table_path(name), config, false).await?;
        let mut tables = self.tables.lock().await;
        // A racing open may have won; keep the first instance.
        tables.entry(name.to_string()).or_insert(table);
        Ok(())
    }

    /// Close a table, keeping its files.
    pub async fn close_table(&self, name: &str) -> Result<()> {
        self.check_open()?;
        self.monitored("close", format!("close {name}"), async {
            let Some(table) = self.tables.lock().await.remove(name) else {
                return Ok(());
            };
            table.close().await
        })
        .await
    }

    /// Open every table directory, `___temporary` leftovers excluded.
    pub async fn open_all(&self, config: Option<TableConfig>) -> Result<Vec<String>> {
        self.check_open()?;
        self.monitored("open_all", "open_all".to_string(), async {
            let mut names: Vec<String> = Vec::new();
            for entry in std::fs::read_dir(&self.config.path)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let Some(name) = entry.file_name().to_str().map(String::from) else {
                    continue;
                };
                if name.contains(TEMPORARY_MARKER) {
                    continue;
                }
                names.push(name);
            }
            names.sort();
            for name in &names {
                let mut table_config = self.merged_config(config.clone());
                // The on-disk type wins for tables opened in bulk.
                table_config.type_compat_mode = true;
                self.open_table_inner(name, Some(table_config)).await?;
            }
            Ok(names)
        })
        .await
    }

    /// Drop a table: close it and delete its directory.
    pub async fn drop_table(&self, name: &str) -> Result<()> {
        self.check_open()?;
        Self::check_name(name)?;
        self.monitored("drop", format!("drop {name}"), async {
            let queue = self.table_queue(name);
            let _guard = queue.lock().await?;
            let table = self.tables.lock().await.remove(name);
            let path = self.table_path(name);
            if table.is_none() && !path.is_dir() {
                return Err(Error::TableNotFound(name.to_string()));
            }
            if let Some(table) = table {
                table.close().await?;
            }
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            }
            tracing::info!(table = name, "table dropped");
            Ok(())
        })
        .await
    }

    /// Empty a table in place. Disk tables are renamed aside, recreated
    /// empty, and the old directory removed; memory tables are replaced.
    pub async fn truncate(&self, name: &str) -> Result<()> {
        self.check_open()?;
        Self::check_name(name)?;
        self.monitored("truncate", format!("truncate {name}"), async {
            let queue = self.table_queue(name);
            let _guard = queue.lock().await?;
            let Some(table) = self.tables.lock().await.remove(name) else {
                return Err(if self.table_path(name).is_dir() {
                    Error::TableNotOpen(name.to_string())
                } else {
                    Error::TableNotFound(name.to_string())
                });
            };
            let config = table.config();

            if table.kind() == TableKind::Memory {
                table.close().await?;
                let fresh: Arc<dyn Table> = Arc::new(MemoryTable::new(name, config));
                self.tables.lock().await.insert(name.to_string(), fresh);
                return Ok(());
            }

            table.close().await?;
            let live = self.table_path(name);
            let parked = self
                .config
                .path
                .join(format!("{name}{TEMPORARY_MARKER}_truncating"));
            if parked.exists() {
                std::fs::remove_dir_all(&parked)?;
            }
            std::fs::rename(&live, &parked)?;

            let fresh = table::open_table(name, &live, config, true).await?;
            std::fs::remove_dir_all(&parked)?;
            self.tables.lock().await.insert(name.to_string(), fresh);
            tracing::info!(table = name, "table truncated");
            Ok(())
        })
        .await
    }

    /// Copy a table under a new name, optionally filtered, and open the copy.
    pub async fn clone_table(
        &self,
        source: &str,
        target: &str,
        filter: Option<WhereFn>,
    ) -> Result<()> {
        self.check_open()?;
        Self::check_name(source)?;
        Self::check_name(target)?;
        if source == target {
            return errinput!("clone source and target are the same table");
        }
        self.monitored("clone", format!("clone {source} -> {target}"), async {
            // Queue both sides in name order so concurrent clones cannot
            // deadlock each other.
            let mut names = [source, target];
            names.sort_unstable();
            let first = self.table_queue(names[0]);
            let second = self.table_queue(names[1]);
            let _first = first.lock().await?;
            let _second = second.lock().await?;

            if self.exists_inner(target).await {
                return Err(Error::TableAlreadyExists(target.to_string()));
            }
            let table = self.get_table(source).await?;

            if table.kind() == TableKind::Memory {
                let rows = match filter {
                    Some(f) => {
                        table
                            .select(SelectQuery::all().filter(Filter::Where(f)))
                            .await?
                    }
                    None => table.select(SelectQuery::all()).await?,
                };
                let fresh = MemoryTable::new(target, table.config());
                if !rows.is_empty() {
                    fresh.insert(InsertQuery::rows(rows)).await?;
                }
                self.tables
                    .lock()
                    .await
                    .insert(target.to_string(), Arc::new(fresh));
                return Ok(());
            }

            table.clone_to(&self.table_path(target), filter).await?;
            let clone = table::open_table(target, &self.table_path(target), table.config(), false)
                .await?;
            self.tables.lock().await.insert(target.to_string(), clone);
            Ok(())
        })
        .await
    }

    /// Select from a table; a `join` clause merges rows from another table
    /// into each result row, keyed by an id field.
    pub async fn select(&self, name: &str, query: SelectQuery) -> Result<Vec<Value>> {
        self.check_open()?;
        self.monitored("select", format!("{name}: {}", query.describe()), async {
            let table = self.get_table(name).await?;
            let join = query.join.clone();
            let mut rows = table.select(query).await?;

            if let Some(join) = join {
                let mut ids: Vec<i64> = rows
                    .iter()
                    .filter_map(|row| row.get(join.field.as_str()).and_then(Value::as_i64))
                    .collect();
                ids.sort_unstable();
                ids.dedup();
                let joined = self
                    .get_table(&join.table)
                    .await?
                    .select(SelectQuery::all().filter(Filter::Ids(ids)))
                    .await?;
                let by_id: HashMap<i64, Value> = joined
                    .into_iter()
                    .filter_map(|row| row.get("id").and_then(Value::as_i64).map(|id| (id, row)))
                    .collect();
                for row in &mut rows {
                    let Some(fid) = row.get(join.field.as_str()).and_then(Value::as_i64) else {
                        continue;
                    };
                    if let (Some(joined_row), Some(obj)) = (by_id.get(&fid), row.as_object_mut()) {
                        obj.insert(join.target.clone(), joined_row.clone());
                    }
                }
            }
            Ok(rows)
        })
        .await
    }

    pub async fn insert(&self, name: &str, query: InsertQuery) -> Result<InsertResult> {
        self.check_open()?;
        self.monitored("insert", format!("{name}: {}", query.describe()), async {
            self.get_table(name).await?.insert(query).await
        })
        .await
    }

    pub async fn update(&self, name: &str, query: UpdateQuery) -> Result<u64> {
        self.check_open()?;
        self.monitored("update", format!("{name}: {}", query.describe()), async {
            self.get_table(name).await?.update(query).await
        })
        .await
    }

    pub async fn delete(&self, name: &str, query: DeleteQuery) -> Result<u64> {
        self.check_open()?;
        self.monitored("delete", format!("{name}: {}", query.describe()), async {
            self.get_table(name).await?.delete(query).await
        })
        .await
    }

    pub async fn create_index(&self, name: &str, spec: IndexSpec) -> Result<()> {
        self.check_open()?;
        self.monitored("create_index", format!("{name}: {}", spec.field), async {
            self.get_table(name).await?.create_index(spec).await
        })
        .await
    }

    pub async fn drop_index(&self, name: &str, field: &str) -> Result<()> {
        self.check_open()?;
        self.monitored("drop_index", format!("{name}: {field}"), async {
            self.get_table(name).await?.drop_index(field).await
        })
        .await
    }

    pub async fn table_meta(&self, name: &str) -> Result<TableMeta> {
        self.check_open()?;
        self.monitored("meta", format!("meta {name}"), async {
            self.get_table(name).await?.meta().await
        })
        .await
    }

    /// Per-table directory sizes and open state.
    pub async fn db_info(&self) -> Result<DbInfo> {
        self.check_open()?;
        self.monitored("db_info", "db_info".to_string(), async {
            let open_names: Vec<String> = self.tables.lock().await.keys().cloned().collect();
            let mut tables: Vec<TableInfo> = Vec::new();

            for entry in std::fs::read_dir(&self.config.path)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let Some(name) = entry.file_name().to_str().map(String::from) else {
                    continue;
                };
                if name.contains(TEMPORARY_MARKER) {
                    continue;
                }
                let path = entry.path();
                let kind = std::fs::read_to_string(path.join(TYPE_FILE))
                    .ok()
                    .and_then(|s| TableKind::parse(&s));
                tables.push(TableInfo {
                    open: open_names.contains(&name),
                    name,
                    kind,
                    size: dir_size(&path)?,
                });
            }
            // Memory tables have no directory but are part of the picture.
            for name in open_names {
                if !tables.iter().any(|t| t.name == name) {
                    tables.push(TableInfo {
                        name,
                        kind: Some(TableKind::Memory),
                        open: true,
                        size: 0,
                    });
                }
            }
            tables.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(DbInfo {
                path: self.config.path.clone(),
                tables,
            })
        })
        .await
    }

    /// Total on-disk size of the database directory.
    pub async fn db_size(&self) -> Result<u64> {
        self.check_open()?;
        self.monitored("db_size", "db_size".to_string(), async {
            dir_size(&self.config.path)
        })
        .await
    }

    /// Close every table, stop background tasks, release the directory lock.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.scheduler.shutdown().await?;
        let tables: Vec<(String, Arc<dyn Table>)> =
            self.tables.lock().await.drain().collect();
        for (name, table) in tables {
            if let Err(e) = table.close().await {
                tracing::error!(table = %name, error = %e, "table close failed");
            }
        }
        let lock = self.lock.lock()?.take();
        if let Some(lock) = lock {
            lock.release().await?;
        }
        tracing::info!(path = %self.config.path.display(), "database closed");
        Ok(())
    }
}

fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}
