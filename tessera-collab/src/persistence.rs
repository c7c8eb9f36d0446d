//! Pluggable storage for document updates.
//!
//! The manager replays [`Persistence::load`] when a document is first
//! opened, appends every committed update from the fan-out task, and
//! periodically folds the log into one snapshot with
//! [`Persistence::compact`].
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  snapshot ◄── update ◄── update ◄── ...  │
//! │  (LZ4)        (LZ4)      (LZ4)           │
//! │                                          │
//! │  compact: snapshot + N updates → snapshot│
//! └──────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Mutex;

/// Storage backend for document update logs.
pub trait Persistence: Send + Sync {
    /// Stored updates of `document`, oldest first. Unknown documents yield
    /// an empty list.
    fn load(&self, document: &str) -> Result<Vec<Vec<u8>>, PersistenceError>;

    /// Append one committed update.
    fn save_update(&self, document: &str, update: &[u8]) -> Result<(), PersistenceError>;

    /// Replace the whole log of `document` with one snapshot update.
    fn compact(&self, document: &str, snapshot: &[u8]) -> Result<(), PersistenceError>;

    /// Number of stored entries for `document`.
    fn entry_count(&self, document: &str) -> Result<usize, PersistenceError>;
}

/// An LZ4-compressed log entry.
#[derive(Debug, Clone)]
pub struct CompressedUpdate {
    /// Uncompressed size in bytes
    pub original_size: u32,
    /// LZ4-compressed payload, size-prefixed
    pub compressed: Vec<u8>,
}

impl CompressedUpdate {
    pub fn compress(data: &[u8]) -> Self {
        Self {
            original_size: data.len() as u32,
            compressed: lz4_flex::compress_prepend_size(data),
        }
    }

    pub fn decompress(&self) -> Result<Vec<u8>, PersistenceError> {
        lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| PersistenceError::DecompressionFailed(e.to_string()))
    }

    /// Compression ratio (original / compressed).
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed.is_empty() {
            return 0.0;
        }
        self.original_size as f64 / self.compressed.len() as f64
    }
}

/// In-process update log, for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    logs: Mutex<HashMap<String, Vec<CompressedUpdate>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total compressed bytes held for `document`.
    pub fn stored_bytes(&self, document: &str) -> Result<usize, PersistenceError> {
        let logs = self.logs.lock().map_err(|_| PersistenceError::LockPoisoned)?;
        Ok(logs
            .get(document)
            .map(|log| log.iter().map(|u| u.compressed.len()).sum())
            .unwrap_or(0))
    }
}

impl Persistence for MemoryStore {
    fn load(&self, document: &str) -> Result<Vec<Vec<u8>>, PersistenceError> {
        let logs = self.logs.lock().map_err(|_| PersistenceError::LockPoisoned)?;
        match logs.get(document) {
            Some(log) => log.iter().map(CompressedUpdate::decompress).collect(),
            None => Ok(Vec::new()),
        }
    }

    fn save_update(&self, document: &str, update: &[u8]) -> Result<(), PersistenceError> {
        let mut logs = self.logs.lock().map_err(|_| PersistenceError::LockPoisoned)?;
        logs.entry(document.to_string())
            .or_default()
            .push(CompressedUpdate::compress(update));
        Ok(())
    }

    fn compact(&self, document: &str, snapshot: &[u8]) -> Result<(), PersistenceError> {
        let mut logs = self.logs.lock().map_err(|_| PersistenceError::LockPoisoned)?;
        logs.insert(document.to_string(), vec![CompressedUpdate::compress(snapshot)]);
        Ok(())
    }

    fn entry_count(&self, document: &str) -> Result<usize, PersistenceError> {
        let logs = self.logs.lock().map_err(|_| PersistenceError::LockPoisoned)?;
        Ok(logs.get(document).map(Vec::len).unwrap_or(0))
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    DecompressionFailed(String),
    LockPoisoned,
    Backend(String),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DecompressionFailed(e) => write!(f, "Decompression failed: {e}"),
            Self::LockPoisoned => write!(f, "Store lock poisoned"),
            Self::Backend(e) => write!(f, "Storage backend error: {e}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_decompress() {
        let data = b"abcabcabcabcabcabcabcabcabcabcabcabc".to_vec();
        let entry = CompressedUpdate::compress(&data);
        assert_eq!(entry.decompress().unwrap(), data);
        assert!(entry.compression_ratio() > 1.0);
    }

    #[test]
    fn test_corrupt_entry_reports_error() {
        let entry = CompressedUpdate {
            original_size: 10,
            compressed: vec![1, 2],
        };
        assert!(matches!(
            entry.decompress(),
            Err(PersistenceError::DecompressionFailed(_))
        ));
    }

    #[test]
    fn test_memory_store_appends_in_order() {
        let store = MemoryStore::new();
        store.save_update("doc", &[1, 2]).unwrap();
        store.save_update("doc", &[3]).unwrap();
        store.save_update("other", &[9]).unwrap();
        assert_eq!(store.load("doc").unwrap(), vec![vec![1, 2], vec![3]]);
        assert_eq!(store.entry_count("doc").unwrap(), 2);
        assert!(store.load("missing").unwrap().is_empty());
    }

    #[test]
    fn test_compact_replaces_log() {
        let store = MemoryStore::new();
        for i in 0..5u8 {
            store.save_update("doc", &[i]).unwrap();
        }
        store.compact("doc", &[7, 7, 7]).unwrap();
        assert_eq!(store.load("doc").unwrap(), vec![vec![7, 7, 7]]);
        assert_eq!(store.entry_count("doc").unwrap(), 1);
        assert!(store.stored_bytes("doc").unwrap() > 0);
    }
}
