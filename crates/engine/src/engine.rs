//! Engine: the per-domain root object
//!
//! Owns the stream registry, the plain pub/sub router, the push
//! delivery worker pool and the background sweeper that drives
//! redelivery expiry, age-based retention and ephemeral consumer
//! collection. Every test gets its own isolated instance; there is no
//! process-wide state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use rill_storage::LogStorage;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{EngineConfig, StreamConfig};
use crate::consumer::DeliveryPool;
use crate::error::{Error, Result};
use crate::pubsub::{PubSubRouter, Subscription};
use crate::stream::Stream;
use crate::subject::{Subject, SubjectPattern};
use crate::types::{DomainName, PublishAck, StreamName};

/// Shared handles threaded through streams and consumers
pub(crate) struct EngineContext {
    /// Push delivery worker pool
    pub(crate) pool: DeliveryPool,
    /// Root cancellation token; consumers derive child tokens
    pub(crate) cancel: CancellationToken,
    /// Redelivery sweep tick, also the poll floor for blocked fetches
    pub(crate) sweep_interval: Duration,
    /// Backend for file-mode streams
    pub(crate) storage: Option<Arc<dyn LogStorage>>,
}

/// A stream engine serving one domain
pub struct Engine {
    config: EngineConfig,
    context: Arc<EngineContext>,
    streams: DashMap<StreamName, Arc<Stream>>,
    pubsub: Arc<PubSubRouter>,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Engine {
    /// Create an engine and start its background sweeper
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let context = Arc::new(EngineContext {
            pool: DeliveryPool::new(config.worker_pool_size, config.delivery_queue_depth),
            cancel: cancel.clone(),
            sweep_interval: config.sweep_interval,
            storage: config.storage.clone(),
        });

        let engine = Arc::new(Self {
            config,
            context,
            streams: DashMap::new(),
            pubsub: Arc::new(PubSubRouter::default()),
            sweeper: parking_lot::Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        let sweeper = tokio::spawn(sweep_loop(
            Arc::downgrade(&engine),
            cancel,
            engine.config.sweep_interval,
        ));
        *engine.sweeper.lock() = Some(sweeper);

        info!(domain = %engine.config.domain, "engine started");
        Ok(engine)
    }

    /// The domain this engine serves
    pub fn domain(&self) -> &DomainName {
        &self.config.domain
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Create a stream
    ///
    /// Subject patterns may not overlap those of an existing stream;
    /// every subject must route to at most one stream.
    pub async fn create_stream(&self, config: StreamConfig) -> Result<Arc<Stream>> {
        self.ensure_running()?;
        config.validate()?;

        if self.streams.contains_key(&config.name) {
            return Err(Error::StreamExists(config.name));
        }
        for entry in self.streams.iter() {
            for theirs in &entry.value().config().subjects {
                for ours in &config.subjects {
                    if ours.overlaps(theirs) {
                        return Err(Error::InvalidConfig(format!(
                            "subject {} overlaps stream {}",
                            ours,
                            entry.key()
                        )));
                    }
                }
            }
        }

        let stream = Stream::open(config, self.context.clone()).await?;
        match self.streams.entry(stream.name().clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::StreamExists(stream.name().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                info!(domain = %self.config.domain, stream = %stream.name(), "created stream");
                vacant.insert(stream.clone());
                Ok(stream)
            }
        }
    }

    /// Look up a stream by name
    pub fn get_stream(&self, name: &StreamName) -> Result<Arc<Stream>> {
        self.ensure_running()?;
        self.streams
            .get(name)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::StreamNotFound(name.clone()))
    }

    /// Delete a stream, dropping its consumers and persisted state
    pub async fn delete_stream(&self, name: &StreamName) -> Result<()> {
        self.ensure_running()?;
        let (_, stream) = self
            .streams
            .remove(name)
            .ok_or_else(|| Error::StreamNotFound(name.clone()))?;
        stream.delete().await
    }

    /// Names of all live streams
    pub fn stream_names(&self) -> Vec<StreamName> {
        self.streams.iter().map(|entry| entry.key().clone()).collect()
    }

    /// The stream whose subject set captures `subject`
    pub fn stream_for_subject(&self, subject: &Subject) -> Result<Arc<Stream>> {
        self.ensure_running()?;
        self.streams
            .iter()
            .find(|entry| entry.value().accepts(subject))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NoStreamForSubject(subject.clone()))
    }

    /// Publish a message
    ///
    /// Fans out to plain subscribers, and appends to the stream that
    /// captures the subject if one exists; the returned ack is `None`
    /// for a subject no stream captures.
    pub async fn publish(&self, subject: Subject, payload: Bytes) -> Result<Option<PublishAck>> {
        self.publish_inner(subject, payload, None).await
    }

    /// Publish with a dedup id; a repeat within the stream's dedup
    /// window returns the prior sequence with `duplicate = true`
    pub async fn publish_with_id(
        &self,
        subject: Subject,
        payload: Bytes,
        dedup_id: impl Into<String>,
    ) -> Result<Option<PublishAck>> {
        self.publish_inner(subject, payload, Some(dedup_id.into()))
            .await
    }

    async fn publish_inner(
        &self,
        subject: Subject,
        payload: Bytes,
        dedup_id: Option<String>,
    ) -> Result<Option<PublishAck>> {
        self.ensure_running()?;

        let fanned_out = self.pubsub.publish(&subject, &payload);
        if fanned_out > 0 {
            debug!(%subject, count = fanned_out, "fanned out to subscribers");
        }

        match self.stream_for_subject(&subject) {
            Ok(stream) => stream.append(subject, payload, dedup_id).await.map(Some),
            Err(Error::NoStreamForSubject(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Subscribe to every message matching `pattern`
    pub fn subscribe(&self, pattern: SubjectPattern) -> Result<Subscription> {
        self.ensure_running()?;
        Ok(self.pubsub.subscribe(pattern))
    }

    /// Join a queue group; each matching message is load-balanced to
    /// exactly one member per group
    pub fn queue_subscribe(
        &self,
        pattern: SubjectPattern,
        group: impl Into<String>,
    ) -> Result<Subscription> {
        self.ensure_running()?;
        Ok(self.pubsub.queue_subscribe(pattern, group))
    }

    /// Shut the engine down, draining in-flight push deliveries
    ///
    /// Dispatchers stop accepting new work, handlers already accepted
    /// by the pool run to completion, then workers exit. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(domain = %self.config.domain, "engine shutting down");

        self.context.cancel.cancel();
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper
            && let Err(err) = sweeper.await
        {
            error!(error = %err, "sweeper task panicked");
        }

        for entry in self.streams.iter() {
            for consumer in entry.value().consumers() {
                consumer.shutdown();
            }
        }

        self.context.pool.shutdown().await;
        info!(domain = %self.config.domain, "engine stopped");
    }
}

/// Background pass driving time-based behavior: age retention,
/// exhausted-redelivery expiry and ephemeral consumer collection
async fn sweep_loop(
    engine: std::sync::Weak<Engine>,
    cancel: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let Some(engine) = engine.upgrade() else {
            return;
        };
        let streams: Vec<Arc<Stream>> = engine
            .streams
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        drop(engine);

        for stream in streams {
            stream.sweep_retention().await;
            for consumer in stream.consumers() {
                consumer.sweep().await;
            }
            stream.collect_ephemeral().await;
        }
    }
}
