//! Configuration for streams, consumers and the engine
//!
//! Every recognized option is an explicit field with a default,
//! validated eagerly at creation time.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rill_storage::LogStorage;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::subject::SubjectPattern;
use crate::types::{ConsumerName, DomainName, StreamName};

/// Where a stream's message log lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StorageMode {
    /// Messages held in memory only
    #[default]
    Memory,
    /// Messages written through to the engine's storage backend
    File,
}

/// Rule governing when a message may be purged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetentionPolicy {
    /// Keep messages until count, byte or age limits are exceeded
    #[default]
    Limits,
    /// Purge once every consumer with matching interest has acked
    Interest,
    /// Purge as soon as one consumer has acked; single consumer per
    /// overlapping filter
    WorkQueue,
}

/// What to do when an append would exceed a limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiscardPolicy {
    /// Evict the oldest messages to make room
    #[default]
    Old,
    /// Reject the incoming append instead
    New,
}

/// Acknowledgment requirements for a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AckPolicy {
    /// No acknowledgment; messages are acked on hand-out
    None,
    /// Acking a sequence acks everything pending up to it
    All,
    /// Every delivery must be acked individually
    #[default]
    Explicit,
}

/// Replay pacing for a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplayPolicy {
    /// Deliver as fast as the consumer accepts
    #[default]
    Instant,
    /// Deliver at the original publish cadence
    Original,
}

/// Where a consumer's cursor starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeliverPolicy {
    /// From the first available message
    #[default]
    All,
    /// Only messages appended after the consumer was created
    New,
}

/// Configuration for a stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Unique stream name
    pub name: StreamName,
    /// Subject patterns the stream captures
    pub subjects: Vec<SubjectPattern>,
    /// Optional free-form description
    pub description: Option<String>,
    /// Storage mode
    pub storage: StorageMode,
    /// Retention policy
    pub retention: RetentionPolicy,
    /// Discard policy applied when a limit is hit
    pub discard: DiscardPolicy,
    /// Maximum message count (None = unlimited)
    pub max_msgs: Option<u64>,
    /// Maximum total payload bytes (None = unlimited)
    pub max_bytes: Option<u64>,
    /// Maximum message age (None = unlimited)
    pub max_age: Option<Duration>,
    /// Desired replica count; recorded for the replication substrate,
    /// not enforced here
    pub replicas: usize,
    /// Window during which a repeated dedup id is a duplicate
    pub dedup_window: Duration,
}

impl StreamConfig {
    /// Default deduplication window
    pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(120);

    /// Create a config with defaults for everything but name and subjects
    pub fn new(name: impl Into<StreamName>, subjects: Vec<SubjectPattern>) -> Self {
        Self {
            name: name.into(),
            subjects,
            description: None,
            storage: StorageMode::Memory,
            retention: RetentionPolicy::Limits,
            discard: DiscardPolicy::Old,
            max_msgs: None,
            max_bytes: None,
            max_age: None,
            replicas: 1,
            dedup_window: Self::DEFAULT_DEDUP_WINDOW,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.as_str().is_empty() {
            return Err(Error::InvalidConfig("stream name cannot be empty".into()));
        }
        if self
            .name
            .as_str()
            .contains(['.', '*', '>', ' '])
        {
            return Err(Error::InvalidConfig(format!(
                "stream name contains reserved characters: {}",
                self.name
            )));
        }
        if self.subjects.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "stream {} must capture at least one subject",
                self.name
            )));
        }
        if self.replicas == 0 {
            return Err(Error::InvalidConfig(
                "replica count must be at least 1".into(),
            ));
        }
        if self.discard == DiscardPolicy::New && self.retention != RetentionPolicy::Limits {
            return Err(Error::InvalidConfig(
                "discard policy New requires Limits retention".into(),
            ));
        }
        if self.max_msgs == Some(0) {
            return Err(Error::InvalidConfig("max_msgs cannot be zero".into()));
        }
        Ok(())
    }
}

/// Configuration for a consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer name; durable consumers are keyed by it
    pub name: ConsumerName,
    /// Whether the consumer survives its delivery contexts closing
    pub durable: bool,
    /// Subject filter; None means every message in the stream
    pub filter_subject: Option<SubjectPattern>,
    /// Acknowledgment policy
    pub ack_policy: AckPolicy,
    /// Maximum delivery attempts per message (1 = no redelivery)
    pub max_deliver: u64,
    /// How long a delivery may stay unacked before redelivery
    pub ack_wait: Duration,
    /// Ceiling on in-flight unacked deliveries (None = unbounded)
    pub max_ack_pending: Option<usize>,
    /// Replay pacing
    pub replay_policy: ReplayPolicy,
    /// Cursor start position
    pub deliver_policy: DeliverPolicy,
    /// How long an idle ephemeral consumer lingers before collection
    pub inactivity_threshold: Duration,
}

impl ConsumerConfig {
    /// Default acknowledgment wait
    pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

    /// Default ephemeral inactivity threshold
    pub const DEFAULT_INACTIVITY_THRESHOLD: Duration = Duration::from_secs(5);

    /// Create a durable consumer config with defaults
    pub fn durable(name: impl Into<ConsumerName>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            filter_subject: None,
            ack_policy: AckPolicy::Explicit,
            max_deliver: 1,
            ack_wait: Self::DEFAULT_ACK_WAIT,
            max_ack_pending: None,
            replay_policy: ReplayPolicy::Instant,
            deliver_policy: DeliverPolicy::All,
            inactivity_threshold: Self::DEFAULT_INACTIVITY_THRESHOLD,
        }
    }

    /// Create an ephemeral consumer config with a generated name
    pub fn ephemeral() -> Self {
        let mut config = Self::durable(format!("eph_{}", uuid::Uuid::new_v4().simple()));
        config.durable = false;
        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.as_str().is_empty() {
            return Err(Error::InvalidConfig("consumer name cannot be empty".into()));
        }
        if self.max_deliver == 0 {
            return Err(Error::InvalidConfig(
                "max_deliver must be at least 1".into(),
            ));
        }
        if self.ack_wait.is_zero() {
            return Err(Error::InvalidConfig("ack_wait cannot be zero".into()));
        }
        if self.max_ack_pending == Some(0) {
            return Err(Error::InvalidConfig(
                "max_ack_pending cannot be zero".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for an engine instance
#[derive(Clone)]
pub struct EngineConfig {
    /// Domain this engine serves
    pub domain: DomainName,
    /// Redelivery sweep tick
    pub sweep_interval: Duration,
    /// Number of push-delivery workers
    pub worker_pool_size: usize,
    /// Depth of the bounded delivery hand-off queue
    pub delivery_queue_depth: usize,
    /// Storage backend for file-mode streams
    pub storage: Option<Arc<dyn LogStorage>>,
}

impl EngineConfig {
    /// Create a config for the given domain with defaults
    pub fn new(domain: impl Into<DomainName>) -> Self {
        Self {
            domain: domain.into(),
            sweep_interval: Duration::from_millis(250),
            worker_pool_size: 4,
            delivery_queue_depth: 64,
            storage: None,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.domain.as_str().is_empty() {
            return Err(Error::InvalidConfig("domain cannot be empty".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::InvalidConfig("sweep_interval cannot be zero".into()));
        }
        if self.worker_pool_size == 0 || self.delivery_queue_depth == 0 {
            return Err(Error::InvalidConfig(
                "worker pool and delivery queue must be non-empty".into(),
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("core")
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("domain", &self.domain)
            .field("sweep_interval", &self.sweep_interval)
            .field("worker_pool_size", &self.worker_pool_size)
            .field("delivery_queue_depth", &self.delivery_queue_depth)
            .field("storage", &self.storage.is_some())
            .finish()
    }
}
