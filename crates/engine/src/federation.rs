//! Domain federation
//!
//! Engines register with a router keyed by domain name. A client
//! connects through one domain and addresses streams in any registered
//! domain; operations on a remote domain are relayed to the owning
//! engine and the result handed back unchanged. Sequence numbers, acks
//! and retention are always evaluated by the owning domain, so a
//! consumer reached through a forwarding domain is indistinguishable
//! from one bound directly.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::{ConsumerConfig, StreamConfig};
use crate::consumer::Consumer;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::subject::Subject;
use crate::types::{DomainName, PublishAck, StreamInfo, StreamName};

/// Registry of engines by domain name
#[derive(Default)]
pub struct DomainRouter {
    domains: DashMap<DomainName, Arc<Engine>>,
}

impl DomainRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an engine under its domain name
    pub fn register(&self, engine: Arc<Engine>) {
        info!(domain = %engine.domain(), "registered domain");
        self.domains.insert(engine.domain().clone(), engine);
    }

    /// Remove a domain from the federation
    pub fn deregister(&self, domain: &DomainName) -> Option<Arc<Engine>> {
        self.domains.remove(domain).map(|(_, engine)| engine)
    }

    fn engine(&self, domain: &DomainName) -> Result<Arc<Engine>> {
        self.domains
            .get(domain)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::DomainNotFound(domain.clone()))
    }

    /// Connect through a domain, producing a client that can address
    /// streams in any registered domain
    pub fn connect(self: &Arc<Self>, domain: &DomainName) -> Result<DomainClient> {
        let local = self.engine(domain)?;
        Ok(DomainClient {
            local,
            router: self.clone(),
        })
    }
}

/// A connection point into the federation
///
/// Operations addressed to the connected domain run locally; anything
/// else is forwarded to the owning domain's engine.
pub struct DomainClient {
    local: Arc<Engine>,
    router: Arc<DomainRouter>,
}

impl DomainClient {
    /// The domain this client is connected through
    pub fn domain(&self) -> &DomainName {
        self.local.domain()
    }

    fn engine_for(&self, domain: &DomainName) -> Result<Arc<Engine>> {
        if domain == self.local.domain() {
            return Ok(self.local.clone());
        }
        debug!(from = %self.local.domain(), to = %domain, "forwarding to owning domain");
        self.router.engine(domain)
    }

    /// Create a stream owned by `domain`
    pub async fn create_stream(
        &self,
        domain: &DomainName,
        config: StreamConfig,
    ) -> Result<Arc<Stream>> {
        self.engine_for(domain)?.create_stream(config).await
    }

    /// Look up a stream owned by `domain`
    pub fn get_stream(&self, domain: &DomainName, name: &StreamName) -> Result<Arc<Stream>> {
        self.engine_for(domain)?.get_stream(name)
    }

    /// Publish into `domain`; the owning engine assigns the sequence
    pub async fn publish(
        &self,
        domain: &DomainName,
        subject: Subject,
        payload: Bytes,
    ) -> Result<Option<PublishAck>> {
        self.engine_for(domain)?.publish(subject, payload).await
    }

    /// Publish into `domain` with a dedup id
    pub async fn publish_with_id(
        &self,
        domain: &DomainName,
        subject: Subject,
        payload: Bytes,
        dedup_id: impl Into<String>,
    ) -> Result<Option<PublishAck>> {
        self.engine_for(domain)?
            .publish_with_id(subject, payload, dedup_id)
            .await
    }

    /// Create a consumer on a stream owned by `domain`
    ///
    /// The handle is the owning engine's consumer; fetch and ack
    /// round-trips go straight to the owning domain.
    pub async fn create_consumer(
        &self,
        domain: &DomainName,
        stream: &StreamName,
        config: ConsumerConfig,
    ) -> Result<Arc<Consumer>> {
        self.engine_for(domain)?
            .get_stream(stream)?
            .create_consumer(config)
            .await
    }

    /// State summary of a stream owned by `domain`
    pub async fn stream_info(&self, domain: &DomainName, stream: &StreamName) -> Result<StreamInfo> {
        self.engine_for(domain)?.get_stream(stream)?.info().await
    }
}
