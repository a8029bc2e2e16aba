//! In-memory log storage implementation

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rill_storage::{LogStorage, StorageNamespace, StorageResult};
use tokio::sync::RwLock;

/// In-memory log storage using a BTreeMap per namespace for ordering
#[derive(Clone, Default)]
pub struct MemoryStorage {
    /// Log storage: namespace -> (index -> bytes)
    logs: Arc<RwLock<HashMap<StorageNamespace, BTreeMap<u64, Bytes>>>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage instance
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStorage for MemoryStorage {
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(u64, Bytes)>,
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut logs = self.logs.write().await;
        let log = logs.entry(namespace.clone()).or_default();
        for (index, data) in entries {
            log.insert(index, data);
        }

        Ok(())
    }

    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>> {
        let logs = self.logs.read().await;

        Ok(logs.get(namespace).and_then(|log| {
            match (log.keys().next(), log.keys().next_back()) {
                (Some(&first), Some(&last)) => Some((first, last)),
                _ => None,
            }
        }))
    }

    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>> {
        let logs = self.logs.read().await;

        Ok(logs.get(namespace).map_or_else(Vec::new, |log| {
            log.range(start..end)
                .map(|(&idx, data)| (idx, data.clone()))
                .collect()
        }))
    }

    async fn read_entry(
        &self,
        namespace: &StorageNamespace,
        index: u64,
    ) -> StorageResult<Option<Bytes>> {
        let logs = self.logs.read().await;

        Ok(logs
            .get(namespace)
            .and_then(|log| log.get(&index).cloned()))
    }

    async fn compact_before(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()> {
        let mut logs = self.logs.write().await;

        if let Some(log) = logs.get_mut(namespace) {
            log.retain(|&idx, _| idx > index);
        }

        Ok(())
    }

    async fn delete_entry(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<bool> {
        let mut logs = self.logs.write().await;

        Ok(logs
            .get_mut(namespace)
            .is_some_and(|log| log.remove(&index).is_some()))
    }

    async fn remove_namespace(&self, namespace: &StorageNamespace) -> StorageResult<()> {
        self.logs.write().await.remove(namespace);
        Ok(())
    }
}
