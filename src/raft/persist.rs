use crate::raft::log::LogEntry;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

/// The durable subset of replica state: exactly `{current_term,
/// voted_for, log}`. Everything else is rebuilt after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentRecord {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,
}

/// Encode a persistent record to bytes.
pub fn encode(record: &PersistentRecord) -> bincode::Result<Vec<u8>> {
    bincode::serialize(record)
}

/// Decode a persistent record from bytes.
pub fn decode(bytes: &[u8]) -> bincode::Result<PersistentRecord> {
    bincode::deserialize(bytes)
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Durable byte blob store. `write` must be atomic with respect to
/// crashes: after a crash the store holds either the previous contents
/// or the new ones, never a mix.
pub trait Storage: Send + Sync {
    fn read(&self) -> Result<Vec<u8>, StorageError>;
    fn write(&self, bytes: &[u8]) -> Result<(), StorageError>;
}

/// In-process store that survives replica restarts within a process.
///
/// Shared between a test harness (or embedder) and the replica, so a
/// crashed replica can be rebuilt from the state its predecessor wrote.
#[derive(Debug, Default)]
pub struct MemStorage {
    bytes: Mutex<Vec<u8>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }
}

impl Storage for MemStorage {
    fn read(&self) -> Result<Vec<u8>, StorageError> {
        Ok(self.bytes.lock().unwrap().clone())
    }

    fn write(&self, bytes: &[u8]) -> Result<(), StorageError> {
        *self.bytes.lock().unwrap() = bytes.to_vec();
        Ok(())
    }
}
