//! Array helpers: nested-sequence layout and file exchange

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{BridgeError, Result};

use super::value::Value;

static EXCHANGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write an encoded array to a fresh file in `dir` and return its path.
pub fn write_exchange_file(dir: &Path, encoded: &str) -> Result<PathBuf> {
    let n = EXCHANGE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = dir.join(format!("pyrelay-host-{}-{}.txt", std::process::id(), n));
    fs::write(&path, encoded)?;
    log::debug!("Array handed off through {}", path.display());
    Ok(path)
}

/// Read an exchange file written by the peer and remove it.
pub fn take_exchange_file(path: &Path) -> Result<String> {
    let contents = fs::read_to_string(path).map_err(|e| {
        BridgeError::framing(format!(
            "cannot read array exchange file {}: {}",
            path.display(),
            e
        ))
    })?;
    if let Err(e) = fs::remove_file(path) {
        log::warn!(
            "Failed to remove array exchange file {}: {}",
            path.display(),
            e
        );
    }
    Ok(contents)
}

/// Flatten a nested list literal of the given shape into row-major order.
pub fn flatten_nested(nested: Value, shape: &[usize], out: &mut Vec<Value>) -> Result<()> {
    let Some((&dim, rest)) = shape.split_first() else {
        out.push(nested);
        return Ok(());
    };

    match nested {
        Value::List(items) | Value::Tuple(items) if items.len() == dim => {
            for item in items {
                flatten_nested(item, rest, out)?;
            }
            Ok(())
        }
        other => Err(BridgeError::framing(format!(
            "array data does not match shape {:?}: found {} where a sequence of {} was expected",
            shape,
            other.type_name(),
            dim
        ))),
    }
}

/// Row-major chunks for the first axis of `shape`.
pub fn split_first_axis<'a>(data: &'a [Value], shape: &[usize]) -> Vec<&'a [Value]> {
    let Some((&dim, rest)) = shape.split_first() else {
        return vec![data];
    };
    let chunk: usize = rest.iter().product();
    (0..dim).map(|i| &data[i * chunk..(i + 1) * chunk]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i128]) -> Vec<Value> {
        values.iter().map(|v| Value::Int(*v)).collect()
    }

    #[test]
    fn test_flatten_nested() {
        let nested = Value::List(vec![
            Value::List(ints(&[1, 2, 3])),
            Value::List(ints(&[4, 5, 6])),
        ]);
        let mut out = Vec::new();
        flatten_nested(nested, &[2, 3], &mut out).unwrap();
        assert_eq!(out, ints(&[1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn test_flatten_zero_length_axis() {
        let nested = Value::List(vec![Value::List(vec![]), Value::List(vec![])]);
        let mut out = Vec::new();
        flatten_nested(nested, &[2, 0], &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_flatten_rejects_ragged() {
        let nested = Value::List(vec![Value::List(ints(&[1])), Value::List(ints(&[2, 3]))]);
        let mut out = Vec::new();
        assert!(flatten_nested(nested, &[2, 2], &mut out).is_err());
    }

    #[test]
    fn test_split_first_axis() {
        let data = ints(&[1, 2, 3, 4, 5, 6]);
        let rows = split_first_axis(&data, &[3, 2]);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2], &ints(&[5, 6])[..]);

        let empty: Vec<Value> = Vec::new();
        let rows = split_first_axis(&empty, &[2, 0]);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.is_empty()));
    }

    #[test]
    fn test_exchange_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_exchange_file(dir.path(), "ndarray((1,), [1])").unwrap();
        assert!(path.exists());
        assert_eq!(take_exchange_file(&path).unwrap(), "ndarray((1,), [1])");
        assert!(!path.exists());
    }
}
