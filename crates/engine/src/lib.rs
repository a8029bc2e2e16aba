//! Durable stream engine
//!
//! An embeddable messaging core built around subject-addressed,
//! append-only streams. Messages published to a subject are captured
//! by the stream whose patterns match it, retained according to the
//! stream's retention policy, and handed out to consumers that track
//! acknowledgment and redelivery state per message. Alongside streams
//! there is plain at-most-once pub/sub with queue-group load
//! balancing, and a federation layer that lets engines serving
//! different domains reach each other's streams transparently.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use rill_engine::{
//!     ConsumerConfig, Engine, EngineConfig, StreamConfig, Subject, SubjectPattern,
//! };
//!
//! # async fn example() -> rill_engine::Result<()> {
//! let engine = Engine::new(EngineConfig::new("core"))?;
//!
//! let stream = engine
//!     .create_stream(StreamConfig::new(
//!         "ORDERS",
//!         vec![SubjectPattern::new("orders.>")?],
//!     ))
//!     .await?;
//!
//! engine
//!     .publish(Subject::new("orders.created")?, Bytes::from_static(b"o1"))
//!     .await?;
//!
//! let consumer = stream
//!     .create_consumer(ConsumerConfig::durable("biller"))
//!     .await?;
//! for delivery in consumer
//!     .fetch(10, std::time::Duration::from_secs(1))
//!     .await?
//! {
//!     consumer.ack(delivery.message.sequence).await?;
//! }
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod consumer;
mod engine;
mod error;
mod federation;
mod pubsub;
mod stream;
mod subject;
mod types;

pub use config::{
    AckPolicy, ConsumerConfig, DeliverPolicy, DiscardPolicy, EngineConfig, ReplayPolicy,
    RetentionPolicy, StorageMode, StreamConfig,
};
pub use consumer::{Consumer, ConsumerInfo, DeliveryHandle, DeliveryHandler};
pub use engine::Engine;
pub use error::{Error, Result};
pub use federation::{DomainClient, DomainRouter};
pub use pubsub::{PubSubMessage, Subscription};
pub use stream::Stream;
pub use subject::{Subject, SubjectError, SubjectPattern, subject_matches};
pub use types::{
    ConsumerName, Delivery, DomainName, PublishAck, StoredMessage, StreamInfo, StreamName,
};
