//! Namespaced log storage abstraction
//!
//! A log stores `(sequence, bytes)` entries per namespace. Sequences
//! are assigned by the caller and may contain holes after deletion;
//! backends never renumber. The trait is object-safe so the engine can
//! hold backends as `Arc<dyn LogStorage>`.

use std::fmt::Display;

use async_trait::async_trait;
use bytes::Bytes;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Storage backend error
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Entry failed integrity checks on read
    #[error("corrupt entry in {0}: {1}")]
    Corrupt(String, String),

    /// Invalid value format
    #[error("invalid value format: {0}")]
    InvalidValue(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Namespace not found
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),
}

/// A namespace for organizing log data, one per stream
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StorageNamespace(String);

impl StorageNamespace {
    /// Create a new storage namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the namespace as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StorageNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log storage trait - stores indexed byte sequences per namespace
#[async_trait]
pub trait LogStorage: Send + Sync + 'static {
    /// Atomically append entries (one or more)
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(u64, Bytes)>,
    ) -> StorageResult<()>;

    /// Get the current bounds of the log (first_index, last_index)
    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>>;

    /// Read a range of entries [start, end)
    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>>;

    /// Read a single entry, if present
    async fn read_entry(
        &self,
        namespace: &StorageNamespace,
        index: u64,
    ) -> StorageResult<Option<Bytes>>;

    /// Remove all entries up to and including the given index
    async fn compact_before(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()>;

    /// Delete a specific entry, returning whether it existed
    ///
    /// Streams purge individual sequences under Interest and WorkQueue
    /// retention, so deletion is part of the base contract here.
    async fn delete_entry(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<bool>;

    /// Drop an entire namespace and its entries
    async fn remove_namespace(&self, namespace: &StorageNamespace) -> StorageResult<()>;
}
