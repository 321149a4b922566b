//! Append-only block storage engine.
//!
//! A table's rows live in numbered block files inside the table directory.
//! Two map files track where everything is:
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │ blockindex.* │   │ blocklist.*  │
//! │  id → block  │   │ block → meta │
//! └──────┬───────┘   └──────┬───────┘
//!        │                  │
//!        ▼                  ▼
//!   ┌─────────┐  ┌─────────┐  ┌─────────┐
//!   │ 000001  │  │ 000002  │  │ 000003  │  ← one .jem file per block
//!   │ .jem    │  │ .jem    │  │ .jem ◄──┼─── current block (pinned in RAM)
//!   └─────────┘  └─────────┘  └─────────┘
//! ```
//!
//! Each map is a compacted dump (`.0`) plus an append-only journal (`.1`);
//! every write batch commits one delta that appends to both journals and to
//! the touched block files, so replaying dump-then-journal reproduces the
//! in-memory maps. Blocks behind the save frontier are finalized into
//! self-contained (optionally compressed) files, sparse blocks are
//! defragmented into the current block, and cold blocks are unloaded from
//! RAM by an LRU pass.

pub mod block;
pub mod engine;
pub mod file;

pub use block::{encoded_size, Block, BlockRecord, Delta};
pub use engine::{BlockStore, StoreConfig};

/// Table health marker: `"1"` is clean, `"0"` forces a repair on next open.
pub const STATE_FILE: &str = "state";
