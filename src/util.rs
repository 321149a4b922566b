use std::io::{Read, Write};
use std::path::Path;

use serde_json::Value;

use crate::error::Result;

/// Structural clone of a JSON value: objects and arrays are rebuilt node by
/// node so the result shares no allocations with the input.
pub fn deep_clone(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(deep_clone).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), deep_clone(v)))
                .collect(),
        ),
        Value::Null => Value::Null,
        Value::Bool(b) => Value::Bool(*b),
        Value::Number(n) => Value::Number(n.clone()),
        Value::String(s) => Value::String(s.clone()),
    }
}

/// Whether the path resolves to an existing file or directory.
pub fn path_exists(path: &Path) -> bool {
    path.exists()
}

/// DEFLATE-compress a buffer at the given level (1-9).
pub fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::new(level.min(9)));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress a DEFLATE buffer.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Renders a value as a literal suitable for embedding into query text:
/// strings are escaped and quoted, arrays become list syntax, everything
/// else renders as its JSON form.
pub fn esc(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(esc).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}
