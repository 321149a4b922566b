//! Block file framing.
//!
//! Every data file the engine writes starts with a one-byte flag:
//!
//! | flag  | meaning              | body                                  |
//! |-------|----------------------|---------------------------------------|
//! | `'0'` | open journal         | `[` then records with trailing commas |
//! | `'1'` | finalized            | a JSON array                          |
//! | `'2'` | finalized compressed | DEFLATE bytes of the JSON array       |
//!
//! A journal is closed by rewriting its trailing comma to `]` at read time;
//! a partially-written trailing record can be dropped by truncating back to
//! the last complete one when the caller allows corrupted input.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errdata;
use crate::error::Result;
use crate::util::{deflate, inflate};

pub const FLAG_JOURNAL: u8 = b'0';
pub const FLAG_FINAL: u8 = b'1';
pub const FLAG_FINAL_COMPRESSED: u8 = b'2';

const BLOCK_SUFFIX: &str = ".jem";

/// Zero-padded block file name: six digits below one million, twelve above,
/// so directory listings sort in block order.
pub fn block_file_name(index: u64) -> String {
    if index < 1_000_000 {
        format!("{index:06}{BLOCK_SUFFIX}")
    } else {
        format!("{index:012}{BLOCK_SUFFIX}")
    }
}

/// Parse a block index back out of a directory entry name.
pub fn parse_block_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(BLOCK_SUFFIX)?;
    if stem.len() != 6 && stem.len() != 12 {
        return None;
    }
    if !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Read a framed data file into records of type `T`.
///
/// Flags 1 and 2 are accepted as finalized. Flag 0 is closed in memory; with
/// `allow_corrupted` a torn trailing record is dropped by walking back to the
/// last complete one.
pub fn read_data_file<T: DeserializeOwned>(path: &Path, allow_corrupted: bool) -> Result<Vec<T>> {
    let data = std::fs::read(path)?;
    let Some((&flag, body)) = data.split_first() else {
        if allow_corrupted {
            return Ok(Vec::new());
        }
        return errdata!("empty data file {}", path.display());
    };

    match flag {
        FLAG_FINAL => Ok(serde_json::from_slice(body)?),
        FLAG_FINAL_COMPRESSED => Ok(serde_json::from_slice(&inflate(body)?)?),
        FLAG_JOURNAL => read_journal_body(path, body, allow_corrupted),
        other => errdata!("bad framing flag {other:#04x} in {}", path.display()),
    }
}

fn read_journal_body<T: DeserializeOwned>(
    path: &Path,
    body: &[u8],
    allow_corrupted: bool,
) -> Result<Vec<T>> {
    if body.is_empty() || body[0] != b'[' {
        if allow_corrupted {
            return Ok(Vec::new());
        }
        return errdata!("journal missing open bracket in {}", path.display());
    }
    if body == b"[" {
        return Ok(Vec::new());
    }

    let mut buf = body.to_vec();
    if buf.last() == Some(&b',') {
        *buf.last_mut().unwrap() = b']';
        match serde_json::from_slice(&buf) {
            Ok(records) => return Ok(records),
            Err(e) if !allow_corrupted => return Err(e.into()),
            Err(_) => {}
        }
    } else if !allow_corrupted {
        return errdata!("truncated journal {}", path.display());
    }

    // Walk back comma by comma until a prefix parses; a torn record may
    // itself contain commas, so one step is not always enough.
    loop {
        let Some(pos) = buf.iter().rposition(|&b| b == b',') else {
            return Ok(Vec::new());
        };
        buf.truncate(pos + 1);
        *buf.last_mut().unwrap() = b']';
        if let Ok(records) = serde_json::from_slice(&buf) {
            tracing::warn!(path = %path.display(), "dropped torn trailing journal record");
            return Ok(records);
        }
    }
}

/// Append-only writer for a flag-0 journal file. Creates the file with the
/// `0[` header on first touch and tracks the on-disk length for dump
/// threshold checks.
pub struct JournalWriter {
    file: File,
    path: PathBuf,
    len: u64,
}

impl JournalWriter {
    pub fn open(path: &Path) -> Result<Self> {
        let mut len = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if len == 0 {
            file.write_all(&[FLAG_JOURNAL, b'['])?;
            len = 2;
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
        })
    }

    /// Append one record followed by its trailing comma.
    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let mut buf = serde_json::to_vec(record)?;
        buf.push(b',');
        self.file.write_all(&buf)?;
        self.len += buf.len() as u64;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len <= 2
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write a finalized (flag 1/2) file through a temp path and atomic rename.
/// Returns the byte length of the finished file.
pub fn write_final_file<T: Serialize>(
    path: &Path,
    tmp: &Path,
    value: &T,
    compression: u32,
) -> Result<u64> {
    let json = serde_json::to_vec(value)?;
    let (flag, body) = if compression > 0 {
        (FLAG_FINAL_COMPRESSED, deflate(&json, compression)?)
    } else {
        (FLAG_FINAL, json)
    };

    let mut file = File::create(tmp)?;
    file.write_all(&[flag])?;
    file.write_all(&body)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(tmp, path)?;

    Ok(body.len() as u64 + 1)
}
