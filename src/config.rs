use std::path::PathBuf;
use std::time::Duration;

/// On-disk table flavor, recorded in the table's `type` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Basic,
    Memory,
    Sharded,
}

impl TableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableKind::Basic => "basic",
            TableKind::Memory => "memory",
            TableKind::Sharded => "sharded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "basic" => Some(TableKind::Basic),
            "memory" => Some(TableKind::Memory),
            "sharded" => Some(TableKind::Sharded),
            _ => None,
        }
    }
}

/// Configuration for opening one table.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Table flavor (default: basic)
    pub kind: TableKind,

    /// Row-block LRU budget: how many blocks may hold their rows in memory (default: 5)
    pub cache_size: usize,

    /// How many shard tables may be open at once (sharded tables only, default: 1)
    pub cache_shards: usize,

    /// Row count at which the auto-shard generator moves to a new shard (default: 1,000,000)
    pub auto_shard_size: u64,

    /// DEFLATE level for finalized files and dumps, 0 disables compression (default: 0)
    pub compressed: u32,

    /// Block size ceiling in encoded bytes before the current block rolls over (default: 64KB)
    pub block_size: usize,

    /// Wipe any existing table data before opening (default: false)
    pub recreate: bool,

    /// Run the corruption-tolerant rescue load when the table state is bad (default: false)
    pub auto_repair: bool,

    /// Close journal file handles after every commit (default: false)
    pub force_file_closing: bool,

    /// Open a table whose on-disk type differs from the requested kind (default: false)
    pub type_compat_mode: bool,

    /// How often the block LRU eviction pass runs (default: 250ms)
    pub evict_interval: Duration,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            kind: TableKind::Basic,
            cache_size: 5,
            cache_shards: 1,
            auto_shard_size: 1_000_000,
            compressed: 0,
            block_size: 64 * 1024,
            recreate: false,
            auto_repair: false,
            force_file_closing: false,
            type_compat_mode: false,
            evict_interval: Duration::from_millis(250),
        }
    }
}

impl TableConfig {
    pub fn new(kind: TableKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// Set the block LRU budget
    pub fn cache_size(mut self, blocks: usize) -> Self {
        self.cache_size = blocks;
        self
    }

    /// Set the open-shard cache capacity
    pub fn cache_shards(mut self, shards: usize) -> Self {
        self.cache_shards = shards;
        self
    }

    /// Set the auto-shard row budget
    pub fn auto_shard_size(mut self, rows: u64) -> Self {
        self.auto_shard_size = rows;
        self
    }

    /// Set the DEFLATE level (0-9)
    pub fn compressed(mut self, level: u32) -> Self {
        self.compressed = level.min(9);
        self
    }

    /// Set the block size ceiling
    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Wipe existing data before opening
    pub fn recreate(mut self, yes: bool) -> Self {
        self.recreate = yes;
        self
    }

    /// Enable the rescue load for corrupted tables
    pub fn auto_repair(mut self, yes: bool) -> Self {
        self.auto_repair = yes;
        self
    }

    /// Close journal handles after each commit
    pub fn force_file_closing(mut self, yes: bool) -> Self {
        self.force_file_closing = yes;
        self
    }

    /// Accept a differing on-disk table type
    pub fn type_compat_mode(mut self, yes: bool) -> Self {
        self.type_compat_mode = yes;
        self
    }

    /// Set the eviction pass interval
    pub fn evict_interval(mut self, interval: Duration) -> Self {
        self.evict_interval = interval;
        self
    }
}

/// Monitoring interception settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Intercept public database calls into the monitoring table (default: false)
    pub enable: bool,

    /// Name of the in-memory monitoring table (default: "__monitoring")
    pub table: String,

    /// Completed records older than this many minutes are swept (default: 15)
    pub interval_minutes: u64,

    /// Captured query descriptions are truncated to this length (default: 200)
    pub max_query_length: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enable: false,
            table: "__monitoring".to_string(),
            interval_minutes: 15,
            max_query_length: 200,
        }
    }
}

impl MonitorConfig {
    pub fn enabled() -> Self {
        Self {
            enable: true,
            ..Default::default()
        }
    }

    pub fn table(mut self, name: impl Into<String>) -> Self {
        self.table = name.into();
        self
    }

    pub fn interval_minutes(mut self, minutes: u64) -> Self {
        self.interval_minutes = minutes;
        self
    }

    pub fn max_query_length(mut self, chars: usize) -> Self {
        self.max_query_length = chars;
        self
    }
}

/// Configuration for opening a database directory.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Directory holding one subdirectory per table
    pub path: PathBuf,

    /// Create the directory if it does not exist (default: false)
    pub create: bool,

    /// Steal the directory lock when its marker has gone stale (default: false)
    pub soft_lock: bool,

    /// Open regardless of any existing directory lock (default: false)
    pub ignore_lock: bool,

    /// Defaults merged under per-call table options
    pub table_defaults: TableConfig,

    /// Monitoring interception settings
    pub monitor: MonitorConfig,
}

impl DbConfig {
    /// Create a new config with the given directory
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            create: false,
            soft_lock: false,
            ignore_lock: false,
            table_defaults: TableConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }

    /// Create the directory if missing
    pub fn create(mut self, yes: bool) -> Self {
        self.create = yes;
        self
    }

    /// Steal stale directory locks
    pub fn soft_lock(mut self, yes: bool) -> Self {
        self.soft_lock = yes;
        self
    }

    /// Ignore any existing directory lock
    pub fn ignore_lock(mut self, yes: bool) -> Self {
        self.ignore_lock = yes;
        self
    }

    /// Set table defaults
    pub fn table_defaults(mut self, defaults: TableConfig) -> Self {
        self.table_defaults = defaults;
        self
    }

    /// Configure monitoring
    pub fn monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_defaults() {
        let config = TableConfig::default();
        assert_eq!(config.kind, TableKind::Basic);
        assert_eq!(config.cache_size, 5);
        assert_eq!(config.cache_shards, 1);
        assert_eq!(config.auto_shard_size, 1_000_000);
        assert_eq!(config.compressed, 0);
        assert!(!config.auto_repair);
    }

    #[test]
    fn test_builders() {
        let config = DbConfig::new("/tmp/db")
            .create(true)
            .soft_lock(true)
            .table_defaults(
                TableConfig::new(TableKind::Sharded)
                    .cache_shards(4)
                    .compressed(12),
            );

        assert_eq!(config.path, PathBuf::from("/tmp/db"));
        assert!(config.create);
        assert!(config.soft_lock);
        assert!(!config.ignore_lock);
        assert_eq!(config.table_defaults.kind, TableKind::Sharded);
        assert_eq!(config.table_defaults.cache_shards, 4);
        // level is clamped to the DEFLATE maximum
        assert_eq!(config.table_defaults.compressed, 9);
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [TableKind::Basic, TableKind::Memory, TableKind::Sharded] {
            assert_eq!(TableKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TableKind::parse("lsm"), None);
        assert_eq!(TableKind::parse(" memory\n"), Some(TableKind::Memory));
    }
}
