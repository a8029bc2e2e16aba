//! Durable message streams
//!
//! A stream is an append-only, sequence-numbered log of messages for a
//! set of subject patterns, with a retention policy deciding when old
//! entries may be purged. Appends are serialized by a single writer
//! lock so sequence assignment is race-free; purges take the same lock.

mod retention;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use rill_storage::{LogStorage, StorageError, StorageNamespace};
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{debug, error, info, warn};

use crate::config::{DeliverPolicy, RetentionPolicy, StorageMode, StreamConfig};
use crate::consumer::Consumer;
use crate::engine::EngineContext;
use crate::error::{Error, Result};
use crate::subject::Subject;
use crate::types::{ConsumerName, PublishAck, StoredMessage, StreamInfo, now_ms};

/// Reserved storage index holding the last assigned sequence, so a
/// fully purged stream never reuses sequence numbers after recovery.
const META_INDEX: u64 = 0;

#[derive(Debug, Clone)]
struct DedupEntry {
    sequence: u64,
    expires_at_ms: u64,
}

/// Mutable log state, guarded by the stream writer lock
#[derive(Default)]
pub(crate) struct LogInner {
    /// Retained messages by sequence; holes come from purges only
    pub(crate) messages: BTreeMap<u64, StoredMessage>,
    /// Highest sequence ever assigned
    pub(crate) last_seq: u64,
    /// Total retained payload bytes
    pub(crate) byte_count: u64,
    /// Dedup ids seen within the dedup window
    dedup: HashMap<String, DedupEntry>,
    /// Interest retention: per-message set of consumers that have not
    /// yet acked, captured at append time
    interest: HashMap<u64, HashSet<ConsumerName>>,
    /// Permanent failure reason after storage corruption
    failed: Option<String>,
}

impl LogInner {
    /// Drop a message's storage slot without renumbering
    pub(crate) fn purge(&mut self, seq: u64) {
        if let Some(message) = self.messages.remove(&seq) {
            self.byte_count -= message.payload.len() as u64;
        }
        self.interest.remove(&seq);
    }

    fn prune_dedup(&mut self, now_ms: u64) {
        self.dedup.retain(|_, entry| entry.expires_at_ms > now_ms);
    }
}

/// An append-only, sequence-numbered message stream
pub struct Stream {
    config: StreamConfig,
    inner: Mutex<LogInner>,
    /// Notifies delivery with the latest appended sequence
    notify: watch::Sender<u64>,
    consumers: DashMap<ConsumerName, Arc<Consumer>>,
    /// Serializes consumer creation so conflict checks cannot race
    create_lock: Mutex<()>,
    namespace: Option<StorageNamespace>,
    context: Arc<EngineContext>,
}

impl Stream {
    /// Open a stream, recovering persisted state for file mode
    pub(crate) async fn open(config: StreamConfig, context: Arc<EngineContext>) -> Result<Arc<Self>> {
        config.validate()?;

        let mut inner = LogInner::default();
        let namespace = match config.storage {
            StorageMode::Memory => None,
            StorageMode::File => {
                if context.storage.is_none() {
                    return Err(Error::InvalidConfig(format!(
                        "stream {} requires a storage backend for file mode",
                        config.name
                    )));
                }
                Some(StorageNamespace::new(config.name.as_str()))
            }
        };

        if let (Some(namespace), Some(storage)) = (&namespace, &context.storage) {
            recover(&mut inner, storage.as_ref(), namespace).await?;
            if !inner.messages.is_empty() {
                info!(
                    stream = %config.name,
                    messages = inner.messages.len(),
                    last_seq = inner.last_seq,
                    "recovered stream from storage"
                );
            }
        }

        let (notify, _) = watch::channel(inner.last_seq);

        Ok(Arc::new(Self {
            config,
            inner: Mutex::new(inner),
            notify,
            consumers: DashMap::new(),
            create_lock: Mutex::new(()),
            namespace,
            context,
        }))
    }

    /// The stream's name
    pub fn name(&self) -> &crate::types::StreamName {
        &self.config.name
    }

    /// The stream's configuration
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Whether a subject matches one of the configured patterns
    pub fn accepts(&self, subject: &Subject) -> bool {
        self.config
            .subjects
            .iter()
            .any(|pattern| pattern.matches(subject))
    }

    /// Subscribe to append notifications; the value is the latest
    /// appended sequence
    pub(crate) fn notified(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    fn ensure_available(&self, inner: &LogInner) -> Result<()> {
        match &inner.failed {
            Some(reason) => Err(Error::StreamUnavailable(
                self.config.name.clone(),
                reason.clone(),
            )),
            None => Ok(()),
        }
    }

    /// Record a storage failure, making the stream permanently
    /// unavailable while leaving other streams operative
    fn poison(&self, inner: &mut LogInner, err: &StorageError) -> Error {
        error!(stream = %self.config.name, error = %err, "storage failure, stream marked unavailable");
        inner.failed = Some(err.to_string());
        Error::StreamUnavailable(self.config.name.clone(), err.to_string())
    }

    /// Append a message
    ///
    /// Assigns the next sequence, stores the message, runs the
    /// post-append retention check, then notifies delivery. A dedup id
    /// seen within the dedup window short-circuits with the prior
    /// sequence and `duplicate = true`.
    pub async fn append(
        &self,
        subject: Subject,
        payload: Bytes,
        dedup_id: Option<String>,
    ) -> Result<PublishAck> {
        if !self.accepts(&subject) {
            return Err(Error::SubjectNotAccepted {
                stream: self.config.name.clone(),
                subject,
            });
        }

        let mut inner = self.inner.lock().await;
        self.ensure_available(&inner)?;

        let now = now_ms();
        inner.prune_dedup(now);

        if let Some(id) = &dedup_id
            && let Some(entry) = inner.dedup.get(id)
        {
            debug!(stream = %self.config.name, dedup_id = %id, sequence = entry.sequence, "duplicate publish");
            return Ok(PublishAck {
                stream: self.config.name.clone(),
                sequence: entry.sequence,
                duplicate: true,
            });
        }

        if retention::rejects_append(&inner, &self.config, payload.len() as u64) {
            return Err(Error::MaxMsgsReached(self.config.name.clone()));
        }

        let sequence = inner.last_seq + 1;
        let message = StoredMessage {
            sequence,
            subject,
            payload,
            timestamp_ms: now,
            dedup_id: dedup_id.clone(),
        };

        if let (Some(namespace), Some(storage)) = (&self.namespace, &self.context.storage) {
            let entries = vec![
                (META_INDEX, encode_meta(sequence)?),
                (sequence, encode_message(&message)?),
            ];
            if let Err(e) = storage.append(namespace, entries).await {
                return Err(self.poison(&mut inner, &e));
            }
        }

        inner.last_seq = sequence;
        if let Some(id) = dedup_id {
            inner.dedup.insert(
                id,
                DedupEntry {
                    sequence,
                    expires_at_ms: now + self.config.dedup_window.as_millis() as u64,
                },
            );
        }

        let mut retained = true;
        if self.config.retention == RetentionPolicy::Interest {
            let interested: HashSet<ConsumerName> = self
                .consumers
                .iter()
                .filter(|entry| entry.value().matches(&message.subject))
                .map(|entry| entry.key().clone())
                .collect();
            if interested.is_empty() {
                // Nobody bound with matching interest; do not retain
                retained = false;
            } else {
                inner.interest.insert(sequence, interested);
            }
        }

        if retained {
            inner.byte_count += message.payload.len() as u64;
            inner.messages.insert(sequence, message);
            let purged = retention::enforce_limits(&mut inner, &self.config, now);
            self.purge_persisted(&mut inner, &purged).await?;
        } else if let (Some(namespace), Some(storage)) = (&self.namespace, &self.context.storage) {
            if let Err(e) = storage.delete_entry(namespace, sequence).await {
                return Err(self.poison(&mut inner, &e));
            }
        }

        drop(inner);
        let _ = self.notify.send(sequence);
        debug!(stream = %self.config.name, sequence, "appended message");

        Ok(PublishAck {
            stream: self.config.name.clone(),
            sequence,
            duplicate: false,
        })
    }

    /// Read the message with the given sequence
    pub async fn read(&self, sequence: u64) -> Result<StoredMessage> {
        let inner = self.inner.lock().await;
        self.ensure_available(&inner)?;

        inner
            .messages
            .get(&sequence)
            .cloned()
            .ok_or(Error::MessageNotFound(sequence))
    }

    /// Current stream state summary
    pub async fn info(&self) -> Result<StreamInfo> {
        let inner = self.inner.lock().await;
        self.ensure_available(&inner)?;

        Ok(StreamInfo {
            first_seq: inner
                .messages
                .keys()
                .next()
                .copied()
                .unwrap_or(inner.last_seq + 1),
            last_seq: inner.last_seq,
            message_count: inner.messages.len() as u64,
            byte_count: inner.byte_count,
        })
    }

    /// Acquire the log state for delivery collection
    pub(crate) async fn lock_log(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().await
    }

    /// Retention hook invoked whenever a consumer settles a delivery,
    /// by ack or by termination
    ///
    /// A terminated message will never be consumed, so for retention it
    /// counts the same as an acked one: work-queue slots are purged and
    /// interest entries drained either way.
    pub(crate) async fn settled(&self, consumer: &ConsumerName, sequence: u64) {
        if !retention::purges_on_settle(self.config.retention) {
            return;
        }

        let mut inner = self.inner.lock().await;
        let purged = match self.config.retention {
            RetentionPolicy::WorkQueue => {
                if inner.messages.contains_key(&sequence) {
                    inner.purge(sequence);
                    vec![sequence]
                } else {
                    Vec::new()
                }
            }
            RetentionPolicy::Interest => {
                let drained = match inner.interest.get_mut(&sequence) {
                    Some(set) => {
                        set.remove(consumer);
                        set.is_empty()
                    }
                    None => false,
                };
                if drained {
                    inner.purge(sequence);
                    vec![sequence]
                } else {
                    Vec::new()
                }
            }
            RetentionPolicy::Limits => Vec::new(),
        };

        if !purged.is_empty() {
            debug!(stream = %self.config.name, sequence, "purged after settle");
        }
        let _ = self.purge_persisted(&mut inner, &purged).await;
    }

    /// Periodic retention pass for age-based expiry
    pub(crate) async fn sweep_retention(&self) {
        if self.config.max_age.is_none() {
            return;
        }

        let mut inner = self.inner.lock().await;
        if inner.failed.is_some() {
            return;
        }
        let purged = retention::enforce_limits(&mut inner, &self.config, now_ms());
        if !purged.is_empty() {
            debug!(stream = %self.config.name, count = purged.len(), "aged out messages");
        }
        let _ = self.purge_persisted(&mut inner, &purged).await;
    }

    async fn purge_persisted(&self, inner: &mut LogInner, purged: &[u64]) -> Result<()> {
        if purged.is_empty() {
            return Ok(());
        }
        if let (Some(namespace), Some(storage)) = (&self.namespace, &self.context.storage) {
            for &seq in purged {
                if let Err(e) = storage.delete_entry(namespace, seq).await {
                    return Err(self.poison(inner, &e));
                }
            }
        }
        Ok(())
    }

    /// Create a consumer, or bind to an existing durable one by name
    pub async fn create_consumer(self: &Arc<Self>, config: crate::config::ConsumerConfig) -> Result<Arc<Consumer>> {
        config.validate()?;
        let _create = self.create_lock.lock().await;

        if let Some(existing) = self.consumers.get(&config.name) {
            if config.durable && existing.config().durable {
                return Ok(existing.clone());
            }
            return Err(Error::InvalidConfig(format!(
                "consumer {} already exists on stream {}",
                config.name, self.config.name
            )));
        }

        if self.config.retention == RetentionPolicy::WorkQueue {
            let proposed = filter_or_all(&config);
            for entry in self.consumers.iter() {
                let existing = filter_or_all(entry.value().config());
                if proposed.overlaps(&existing) {
                    return Err(Error::ConsumerConflict {
                        proposed: config.name.clone(),
                        existing: entry.key().clone(),
                    });
                }
            }
        }

        let cursor = match config.deliver_policy {
            DeliverPolicy::All => 1,
            DeliverPolicy::New => {
                let inner = self.inner.lock().await;
                inner.last_seq + 1
            }
        };

        info!(
            stream = %self.config.name,
            consumer = %config.name,
            durable = config.durable,
            "created consumer"
        );

        let consumer = Consumer::new(
            config,
            self.config.name.clone(),
            Arc::downgrade(self),
            self.context.clone(),
            cursor,
        );
        self.consumers.insert(consumer.name().clone(), consumer.clone());
        Ok(consumer)
    }

    /// Look up a consumer by name
    pub fn get_consumer(&self, name: &ConsumerName) -> Result<Arc<Consumer>> {
        self.consumers
            .get(name)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::ConsumerNotFound(name.clone()))
    }

    /// Remove a consumer, releasing any interest it still holds
    pub async fn delete_consumer(&self, name: &ConsumerName) -> Result<()> {
        let (_, consumer) = self
            .consumers
            .remove(name)
            .ok_or_else(|| Error::ConsumerNotFound(name.clone()))?;
        consumer.shutdown();
        self.release_interest(name).await;
        info!(stream = %self.config.name, consumer = %name, "deleted consumer");
        Ok(())
    }

    /// Drop a departed consumer's name from every interest set and
    /// purge messages whose interest drained
    pub(crate) async fn release_interest(&self, name: &ConsumerName) {
        if self.config.retention != RetentionPolicy::Interest {
            return;
        }

        let mut inner = self.inner.lock().await;
        let drained: Vec<u64> = inner
            .interest
            .iter_mut()
            .filter_map(|(&seq, set)| {
                set.remove(name);
                set.is_empty().then_some(seq)
            })
            .collect();
        for &seq in &drained {
            inner.purge(seq);
        }
        let _ = self.purge_persisted(&mut inner, &drained).await;
    }

    /// Snapshot of the bound consumers
    pub(crate) fn consumers(&self) -> Vec<Arc<Consumer>> {
        self.consumers.iter().map(|entry| entry.clone()).collect()
    }

    /// Collect idle ephemeral consumers past their inactivity threshold
    pub(crate) async fn collect_ephemeral(&self) {
        let idle: Vec<ConsumerName> = self
            .consumers
            .iter()
            .filter(|entry| entry.value().is_collectible())
            .map(|entry| entry.key().clone())
            .collect();

        for name in idle {
            warn!(stream = %self.config.name, consumer = %name, "collecting idle ephemeral consumer");
            let _ = self.delete_consumer(&name).await;
        }
    }

    /// Tear the stream down, dropping all consumers and any persisted
    /// state
    pub(crate) async fn delete(&self) -> Result<()> {
        let names: Vec<ConsumerName> = self.consumers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, consumer)) = self.consumers.remove(&name) {
                consumer.shutdown();
            }
        }

        if let (Some(namespace), Some(storage)) = (&self.namespace, &self.context.storage) {
            storage.remove_namespace(namespace).await?;
        }
        info!(stream = %self.config.name, "deleted stream");
        Ok(())
    }
}

fn filter_or_all(config: &crate::config::ConsumerConfig) -> crate::subject::SubjectPattern {
    config
        .filter_subject
        .clone()
        .unwrap_or_else(|| crate::subject::SubjectPattern::new(">").expect("valid pattern"))
}

fn encode_message(message: &StoredMessage) -> Result<Bytes> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(message, &mut buf)
        .map_err(|e| Error::Storage(StorageError::InvalidValue(e.to_string())))?;
    Ok(Bytes::from(buf))
}

fn decode_message(bytes: &[u8]) -> Result<StoredMessage> {
    ciborium::de::from_reader(bytes)
        .map_err(|e| Error::Storage(StorageError::InvalidValue(e.to_string())))
}

fn encode_meta(last_seq: u64) -> Result<Bytes> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&last_seq, &mut buf)
        .map_err(|e| Error::Storage(StorageError::InvalidValue(e.to_string())))?;
    Ok(Bytes::from(buf))
}

fn decode_meta(bytes: &[u8]) -> Result<u64> {
    ciborium::de::from_reader(bytes)
        .map_err(|e| Error::Storage(StorageError::InvalidValue(e.to_string())))
}

/// Rebuild in-memory log state from the storage backend
async fn recover(
    inner: &mut LogInner,
    storage: &dyn LogStorage,
    namespace: &StorageNamespace,
) -> Result<()> {
    let entries = storage.read_range(namespace, 0, u64::MAX).await?;

    for (index, bytes) in entries {
        if index == META_INDEX {
            inner.last_seq = inner.last_seq.max(decode_meta(&bytes)?);
            continue;
        }
        let message = decode_message(&bytes)?;
        inner.byte_count += message.payload.len() as u64;
        inner.last_seq = inner.last_seq.max(message.sequence);
        inner.messages.insert(message.sequence, message);
    }

    Ok(())
}
