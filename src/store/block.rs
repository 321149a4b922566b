use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One persistence unit: a numbered file holding its rows.
#[derive(Debug)]
pub struct Block {
    pub index: u64,
    /// `None` when the rows have been unloaded from RAM.
    pub rows: Option<HashMap<i64, Value>>,
    /// Rows appended since the block was created.
    pub add_count: u64,
    /// Rows deleted or overwritten since the block was created.
    pub del_count: u64,
    /// Row count written to disk the last time the block was persisted.
    pub rows_length: u64,
    /// Encoded byte size estimate.
    pub size: u64,
    /// Whether the block file is in finalized (self-contained) form.
    pub finalized: bool,
}

impl Block {
    pub fn new(index: u64) -> Self {
        Self {
            index,
            rows: Some(HashMap::new()),
            add_count: 0,
            del_count: 0,
            rows_length: 0,
            size: 0,
            finalized: false,
        }
    }

    pub fn from_record(record: &BlockRecord) -> Self {
        Self {
            index: record.index,
            rows: None,
            add_count: record.add_count,
            del_count: record.del_count,
            rows_length: record.rows_length,
            size: record.size,
            finalized: record.finalized,
        }
    }

    pub fn record(&self) -> BlockRecord {
        BlockRecord {
            index: self.index,
            deleted: 0,
            add_count: self.add_count,
            del_count: self.del_count,
            rows_length: self.rows_length,
            size: self.size,
            finalized: self.finalized,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.rows.is_some()
    }
}

fn is_zero(n: &u8) -> bool {
    *n == 0
}

/// Block metadata as journaled to `blocklist.1` and dumped to `blocklist.0`.
/// A record with `deleted: 1` removes the block on replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub index: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub deleted: u8,
    #[serde(default)]
    pub add_count: u64,
    #[serde(default)]
    pub del_count: u64,
    #[serde(default)]
    pub rows_length: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default, rename = "final")]
    pub finalized: bool,
}

impl BlockRecord {
    pub fn deleted(index: u64) -> Self {
        Self {
            index,
            deleted: 1,
            add_count: 0,
            del_count: 0,
            rows_length: 0,
            size: 0,
            finalized: false,
        }
    }
}

/// One write batch's journal entry, committed atomically.
#[derive(Debug, Default)]
pub struct Delta {
    /// `(id, block)` bindings; block 0 denotes deletion.
    pub block_index: Vec<(i64, u64)>,
    /// `(block, exists)` transitions in append order.
    pub block_list: Vec<(u64, bool)>,
    /// `(block, id, row)` appends in write order.
    pub block_rows: Vec<(u64, i64, Value)>,
    /// Block files to unlink once the journal is durable.
    pub del_files: Vec<u64>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.block_index.is_empty()
            && self.block_list.is_empty()
            && self.block_rows.is_empty()
            && self.del_files.is_empty()
    }
}

/// Encoded size of one `[id, row]` journal record, trailing comma included.
pub fn encoded_size(id: i64, row: &Value) -> usize {
    serde_json::to_vec(&(id, row)).map(|v| v.len() + 1).unwrap_or(64)
}
