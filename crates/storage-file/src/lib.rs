//! File-backed log storage implementation
//!
//! Each namespace is persisted as one append-only file of CRC-framed
//! records. The full entry set is kept in memory and rebuilt from the
//! file on open, so reads never touch disk. Deletions and compactions
//! are appended as tombstone records rather than rewriting the file;
//! a partial trailing record (torn write) is truncated on recovery.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rill_storage::{LogStorage, StorageError, StorageNamespace, StorageResult};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Record kinds in the on-disk framing
const KIND_ENTRY: u8 = 1;
const KIND_DELETE: u8 = 2;
const KIND_COMPACT: u8 = 3;

/// Fixed header: kind (1) + sequence (8) + payload length (4) + crc (4)
const HEADER_LEN: usize = 17;

struct NamespaceLog {
    file: File,
    entries: BTreeMap<u64, Bytes>,
}

/// File-backed log storage rooted at a directory
#[derive(Clone)]
pub struct FileStorage {
    dir: PathBuf,
    logs: Arc<RwLock<HashMap<StorageNamespace, Arc<Mutex<NamespaceLog>>>>>,
}

impl FileStorage {
    /// Create a storage instance rooted at `dir`, creating it if needed
    pub async fn new(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        Ok(Self {
            dir,
            logs: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn log_path(&self, namespace: &StorageNamespace) -> PathBuf {
        self.dir.join(format!("{namespace}.log"))
    }

    /// Open (or recover) the log for a namespace
    async fn open(&self, namespace: &StorageNamespace) -> StorageResult<Arc<Mutex<NamespaceLog>>> {
        if let Some(log) = self.logs.read().await.get(namespace) {
            return Ok(log.clone());
        }

        let mut logs = self.logs.write().await;
        // Lost the race to another opener
        if let Some(log) = logs.get(namespace) {
            return Ok(log.clone());
        }

        let path = self.log_path(namespace);
        let entries = recover(namespace, &path).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        debug!(
            namespace = %namespace,
            entries = entries.len(),
            "opened file log"
        );

        let log = Arc::new(Mutex::new(NamespaceLog { file, entries }));
        logs.insert(namespace.clone(), log.clone());
        Ok(log)
    }
}

fn encode_record(kind: u8, index: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(kind);
    buf.put_u64_le(index);
    buf.put_u32_le(payload.len() as u32);
    buf.put_u32_le(crc32fast::hash(payload));
    buf.put_slice(payload);
    buf.freeze()
}

/// Rebuild the entry map by replaying the record stream
async fn recover(
    namespace: &StorageNamespace,
    path: &Path,
) -> StorageResult<BTreeMap<u64, Bytes>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => Bytes::from(data),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = BTreeMap::new();
    let mut buf = data.clone();
    let mut valid_len = 0usize;

    while buf.remaining() >= HEADER_LEN {
        let kind = buf.get_u8();
        let index = buf.get_u64_le();
        let len = buf.get_u32_le() as usize;
        let crc = buf.get_u32_le();

        if buf.remaining() < len {
            // Torn final record, replay stops here
            break;
        }
        let payload = buf.copy_to_bytes(len);

        match kind {
            KIND_ENTRY => {
                if crc32fast::hash(&payload) != crc {
                    return Err(StorageError::Corrupt(
                        namespace.to_string(),
                        format!("crc mismatch at index {index}"),
                    ));
                }
                entries.insert(index, payload);
            }
            KIND_DELETE => {
                entries.remove(&index);
            }
            KIND_COMPACT => {
                entries.retain(|&idx, _| idx > index);
            }
            other => {
                return Err(StorageError::Corrupt(
                    namespace.to_string(),
                    format!("unknown record kind {other}"),
                ));
            }
        }
        valid_len = data.len() - buf.remaining();
    }

    if valid_len < data.len() {
        warn!(
            namespace = %namespace,
            dropped = data.len() - valid_len,
            "truncating torn tail of file log"
        );
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(valid_len as u64).await?;
        file.sync_all().await?;
    }

    Ok(entries)
}

impl NamespaceLog {
    async fn write_record(&mut self, record: Bytes) -> StorageResult<()> {
        self.file.write_all(&record).await?;
        self.file.sync_data().await?;
        Ok(())
    }
}

#[async_trait]
impl LogStorage for FileStorage {
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(u64, Bytes)>,
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let log = self.open(namespace).await?;
        let mut log = log.lock().await;

        let mut batch = BytesMut::new();
        for (index, data) in &entries {
            batch.put_slice(&encode_record(KIND_ENTRY, *index, data));
        }
        log.write_record(batch.freeze()).await?;

        for (index, data) in entries {
            log.entries.insert(index, data);
        }

        Ok(())
    }

    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>> {
        let log = self.open(namespace).await?;
        let log = log.lock().await;

        Ok(
            match (log.entries.keys().next(), log.entries.keys().next_back()) {
                (Some(&first), Some(&last)) => Some((first, last)),
                _ => None,
            },
        )
    }

    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>> {
        let log = self.open(namespace).await?;
        let log = log.lock().await;

        Ok(log
            .entries
            .range(start..end)
            .map(|(&idx, data)| (idx, data.clone()))
            .collect())
    }

    async fn read_entry(
        &self,
        namespace: &StorageNamespace,
        index: u64,
    ) -> StorageResult<Option<Bytes>> {
        let log = self.open(namespace).await?;
        let log = log.lock().await;

        Ok(log.entries.get(&index).cloned())
    }

    async fn compact_before(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()> {
        let log = self.open(namespace).await?;
        let mut log = log.lock().await;

        log.write_record(encode_record(KIND_COMPACT, index, &[]))
            .await?;
        log.entries.retain(|&idx, _| idx > index);

        Ok(())
    }

    async fn delete_entry(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<bool> {
        let log = self.open(namespace).await?;
        let mut log = log.lock().await;

        if !log.entries.contains_key(&index) {
            return Ok(false);
        }

        log.write_record(encode_record(KIND_DELETE, index, &[]))
            .await?;
        log.entries.remove(&index);

        Ok(true)
    }

    async fn remove_namespace(&self, namespace: &StorageNamespace) -> StorageResult<()> {
        self.logs.write().await.remove(namespace);

        match tokio::fs::remove_file(self.log_path(namespace)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
