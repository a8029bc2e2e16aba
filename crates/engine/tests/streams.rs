//! Stream log, retention and dedup behavior

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rill_engine::{
    AckPolicy, ConsumerConfig, DiscardPolicy, Engine, EngineConfig, Error, RetentionPolicy,
    StorageMode, StreamConfig, Subject, SubjectPattern,
};
use rill_storage_file::FileStorage;

fn subject(s: &str) -> Subject {
    Subject::new(s).unwrap()
}

fn pattern(s: &str) -> SubjectPattern {
    SubjectPattern::new(s).unwrap()
}

fn engine() -> Arc<Engine> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut config = EngineConfig::new("test");
    config.sweep_interval = Duration::from_millis(50);
    Engine::new(config).unwrap()
}

fn payload(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

#[tokio::test]
async fn test_sequences_are_monotonic_without_reuse() {
    let engine = engine();
    let mut config = StreamConfig::new("SEQ", vec![pattern("seq.*")]);
    config.max_msgs = Some(2);
    engine.create_stream(config).await.unwrap();

    // Eviction along the way must never cause sequence reuse
    for i in 1..=8u64 {
        let ack = engine
            .publish(subject("seq.x"), payload(&format!("m{i}")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.sequence, i);
        assert!(!ack.duplicate);
    }

    let info = engine
        .get_stream(&"SEQ".into())
        .unwrap()
        .info()
        .await
        .unwrap();
    assert_eq!(info.last_seq, 8);
    assert_eq!(info.message_count, 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_dedup_returns_prior_sequence() {
    let engine = engine();
    engine
        .create_stream(StreamConfig::new("DEDUP", vec![pattern("orders.*")]))
        .await
        .unwrap();

    let first = engine
        .publish_with_id(subject("orders.created"), payload("o1"), "order-1")
        .await
        .unwrap()
        .unwrap();
    assert!(!first.duplicate);

    let second = engine
        .publish_with_id(subject("orders.created"), payload("o1"), "order-1")
        .await
        .unwrap()
        .unwrap();
    assert!(second.duplicate);
    assert_eq!(second.sequence, first.sequence);

    let info = engine
        .get_stream(&"DEDUP".into())
        .unwrap()
        .info()
        .await
        .unwrap();
    assert_eq!(info.message_count, 1);
    assert_eq!(info.last_seq, first.sequence);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_limits_eviction_keeps_newest() {
    let engine = engine();
    let mut config = StreamConfig::new("EVICT", vec![pattern("e.*")]);
    config.max_msgs = Some(3);
    engine.create_stream(config).await.unwrap();

    for i in 1..=5u64 {
        engine
            .publish(subject("e.x"), payload(&format!("m{i}")))
            .await
            .unwrap();
    }

    let stream = engine.get_stream(&"EVICT".into()).unwrap();
    let info = stream.info().await.unwrap();
    assert_eq!(info.first_seq, 3);
    assert_eq!(info.last_seq, 5);
    assert!(matches!(
        stream.read(1).await,
        Err(Error::MessageNotFound(1))
    ));
    assert!(matches!(
        stream.read(2).await,
        Err(Error::MessageNotFound(2))
    ));
    for seq in 3..=5 {
        assert_eq!(stream.read(seq).await.unwrap().sequence, seq);
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn test_discard_new_rejects_at_limit() {
    let engine = engine();
    let mut config = StreamConfig::new("FULL", vec![pattern("f.*")]);
    config.max_msgs = Some(2);
    config.discard = DiscardPolicy::New;
    engine.create_stream(config).await.unwrap();

    engine.publish(subject("f.x"), payload("a")).await.unwrap();
    engine.publish(subject("f.x"), payload("b")).await.unwrap();
    assert!(matches!(
        engine.publish(subject("f.x"), payload("c")).await,
        Err(Error::MaxMsgsReached(_))
    ));

    // Nothing was evicted
    let info = engine
        .get_stream(&"FULL".into())
        .unwrap()
        .info()
        .await
        .unwrap();
    assert_eq!(info.message_count, 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_max_age_expires_messages() {
    let engine = engine();
    let mut config = StreamConfig::new("AGE", vec![pattern("a.*")]);
    config.max_age = Some(Duration::from_millis(200));
    engine.create_stream(config).await.unwrap();

    engine.publish(subject("a.x"), payload("old")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let info = engine
        .get_stream(&"AGE".into())
        .unwrap()
        .info()
        .await
        .unwrap();
    assert_eq!(info.message_count, 0);
    assert_eq!(info.last_seq, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_subject_not_accepted() {
    let engine = engine();
    let stream = engine
        .create_stream(StreamConfig::new("ORDERS", vec![pattern("orders.*")]))
        .await
        .unwrap();

    assert!(matches!(
        stream
            .append(subject("invoices.created"), payload("x"), None)
            .await,
        Err(Error::SubjectNotAccepted { .. })
    ));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_overlapping_stream_subjects_rejected() {
    let engine = engine();
    engine
        .create_stream(StreamConfig::new("ORDERS", vec![pattern("orders.*")]))
        .await
        .unwrap();

    assert!(matches!(
        engine
            .create_stream(StreamConfig::new("ALSO", vec![pattern("orders.created")]))
            .await,
        Err(Error::InvalidConfig(_))
    ));
    assert!(matches!(
        engine
            .create_stream(StreamConfig::new("ORDERS", vec![pattern("other.*")]))
            .await,
        Err(Error::StreamExists(_))
    ));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_work_queue_purges_on_ack() {
    let engine = engine();
    let mut config = StreamConfig::new("JOBS", vec![pattern("jobs.*")]);
    config.retention = RetentionPolicy::WorkQueue;
    let stream = engine.create_stream(config).await.unwrap();

    for i in 0..20 {
        engine
            .publish(subject("jobs.run"), payload(&format!("job-{i}")))
            .await
            .unwrap();
    }

    let consumer = stream
        .create_consumer(ConsumerConfig::durable("worker"))
        .await
        .unwrap();
    let deliveries = consumer.fetch(20, Duration::from_secs(1)).await.unwrap();
    assert_eq!(deliveries.len(), 20);
    for delivery in &deliveries {
        consumer.ack(delivery.message.sequence).await.unwrap();
    }

    // Every acked message is purged; the stream converges to empty
    let info = stream.info().await.unwrap();
    assert_eq!(info.message_count, 0);
    assert_eq!(info.byte_count, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_work_queue_rejects_overlapping_consumers() {
    let engine = engine();
    let mut config = StreamConfig::new("JOBS", vec![pattern("jobs.>")]);
    config.retention = RetentionPolicy::WorkQueue;
    let stream = engine.create_stream(config).await.unwrap();

    let mut first = ConsumerConfig::durable("a");
    first.filter_subject = Some(pattern("jobs.images.*"));
    stream.create_consumer(first).await.unwrap();

    let mut overlapping = ConsumerConfig::durable("b");
    overlapping.filter_subject = Some(pattern("jobs.*.resize"));
    assert!(matches!(
        stream.create_consumer(overlapping).await,
        Err(Error::ConsumerConflict { .. })
    ));

    let mut disjoint = ConsumerConfig::durable("c");
    disjoint.filter_subject = Some(pattern("jobs.audio.*"));
    stream.create_consumer(disjoint).await.unwrap();
    engine.shutdown().await;
}

#[tokio::test]
async fn test_interest_retention_requires_all_acks() {
    let engine = engine();
    let mut config = StreamConfig::new("EVENTS", vec![pattern("events.*")]);
    config.retention = RetentionPolicy::Interest;
    let stream = engine.create_stream(config).await.unwrap();

    let first = stream
        .create_consumer(ConsumerConfig::durable("audit"))
        .await
        .unwrap();
    let second = stream
        .create_consumer(ConsumerConfig::durable("billing"))
        .await
        .unwrap();

    engine
        .publish(subject("events.created"), payload("e1"))
        .await
        .unwrap();

    first.fetch(1, Duration::from_secs(1)).await.unwrap();
    first.ack(1).await.unwrap();
    // One ack of two is not enough to purge
    assert_eq!(stream.info().await.unwrap().message_count, 1);

    second.fetch(1, Duration::from_secs(1)).await.unwrap();
    second.ack(1).await.unwrap();
    assert_eq!(stream.info().await.unwrap().message_count, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_interest_without_consumers_is_not_retained() {
    let engine = engine();
    let mut config = StreamConfig::new("EVENTS", vec![pattern("events.*")]);
    config.retention = RetentionPolicy::Interest;
    let stream = engine.create_stream(config).await.unwrap();

    let ack = engine
        .publish(subject("events.created"), payload("e1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ack.sequence, 1);

    // Sequence advanced but nothing was retained
    let info = stream.info().await.unwrap();
    assert_eq!(info.last_seq, 1);
    assert_eq!(info.message_count, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_deleting_consumer_releases_interest() {
    let engine = engine();
    let mut config = StreamConfig::new("EVENTS", vec![pattern("events.*")]);
    config.retention = RetentionPolicy::Interest;
    let stream = engine.create_stream(config).await.unwrap();

    let keeper = stream
        .create_consumer(ConsumerConfig::durable("keeper"))
        .await
        .unwrap();
    stream
        .create_consumer(ConsumerConfig::durable("leaver"))
        .await
        .unwrap();

    engine
        .publish(subject("events.created"), payload("e1"))
        .await
        .unwrap();
    keeper.fetch(1, Duration::from_secs(1)).await.unwrap();
    keeper.ack(1).await.unwrap();
    assert_eq!(stream.info().await.unwrap().message_count, 1);

    // The departing consumer's interest drains, allowing the purge
    stream.delete_consumer(&"leaver".into()).await.unwrap();
    assert_eq!(stream.info().await.unwrap().message_count, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_terminating_releases_interest() {
    let engine = engine();
    let mut config = StreamConfig::new("EVENTS", vec![pattern("events.*")]);
    config.retention = RetentionPolicy::Interest;
    let stream = engine.create_stream(config).await.unwrap();

    let acker = stream
        .create_consumer(ConsumerConfig::durable("acker"))
        .await
        .unwrap();
    let termer = stream
        .create_consumer(ConsumerConfig::durable("termer"))
        .await
        .unwrap();

    engine
        .publish(subject("events.created"), payload("e1"))
        .await
        .unwrap();
    acker.fetch(1, Duration::from_secs(1)).await.unwrap();
    acker.ack(1).await.unwrap();
    assert_eq!(stream.info().await.unwrap().message_count, 1);

    // Terminating settles the delivery, draining the last interest
    termer.fetch(1, Duration::from_secs(1)).await.unwrap();
    termer.term(1).await.unwrap();
    assert_eq!(stream.info().await.unwrap().message_count, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_work_queue_binds_admit_exactly_one() {
    let engine = engine();
    let mut config = StreamConfig::new("JOBS", vec![pattern("jobs.>")]);
    config.retention = RetentionPolicy::WorkQueue;
    let stream = engine.create_stream(config).await.unwrap();

    let mut first = ConsumerConfig::durable("a");
    first.filter_subject = Some(pattern("jobs.images.*"));
    let mut second = ConsumerConfig::durable("b");
    second.filter_subject = Some(pattern("jobs.*.resize"));

    // Simultaneous binds with overlapping filters must not both pass
    // the conflict check
    let (first, second) = tokio::join!(
        stream.create_consumer(first),
        stream.create_consumer(second)
    );
    assert_eq!(
        u32::from(first.is_ok()) + u32::from(second.is_ok()),
        1,
        "exactly one overlapping consumer may bind"
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn test_file_mode_recovers_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    let mut stream_config = StreamConfig::new("DURABLE", vec![pattern("d.*")]);
    stream_config.storage = StorageMode::File;

    {
        let mut config = EngineConfig::new("test");
        config.storage = Some(Arc::new(FileStorage::new(dir.path()).await.unwrap()));
        let engine = Engine::new(config).unwrap();
        engine.create_stream(stream_config.clone()).await.unwrap();
        for i in 1..=3u64 {
            engine
                .publish(subject("d.x"), payload(&format!("m{i}")))
                .await
                .unwrap();
        }
        engine.shutdown().await;
    }

    let mut config = EngineConfig::new("test");
    config.storage = Some(Arc::new(FileStorage::new(dir.path()).await.unwrap()));
    let engine = Engine::new(config).unwrap();
    let stream = engine.create_stream(stream_config).await.unwrap();

    let info = stream.info().await.unwrap();
    assert_eq!(info.last_seq, 3);
    assert_eq!(info.message_count, 3);
    assert_eq!(stream.read(2).await.unwrap().payload, payload("m2"));

    // New appends continue the old sequence
    let ack = engine
        .publish(subject("d.x"), payload("m4"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ack.sequence, 4);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_file_mode_never_reuses_sequences_after_purge() {
    let dir = tempfile::tempdir().unwrap();

    let mut stream_config = StreamConfig::new("WORK", vec![pattern("w.*")]);
    stream_config.storage = StorageMode::File;
    stream_config.retention = RetentionPolicy::WorkQueue;

    {
        let mut config = EngineConfig::new("test");
        config.storage = Some(Arc::new(FileStorage::new(dir.path()).await.unwrap()));
        let engine = Engine::new(config).unwrap();
        let stream = engine.create_stream(stream_config.clone()).await.unwrap();
        let consumer = stream
            .create_consumer(ConsumerConfig::durable("worker"))
            .await
            .unwrap();

        engine.publish(subject("w.x"), payload("j1")).await.unwrap();
        engine.publish(subject("w.x"), payload("j2")).await.unwrap();
        for delivery in consumer.fetch(2, Duration::from_secs(1)).await.unwrap() {
            consumer.ack(delivery.message.sequence).await.unwrap();
        }
        assert_eq!(stream.info().await.unwrap().message_count, 0);
        engine.shutdown().await;
    }

    // All messages were purged, yet the sequence counter survives
    let mut config = EngineConfig::new("test");
    config.storage = Some(Arc::new(FileStorage::new(dir.path()).await.unwrap()));
    let engine = Engine::new(config).unwrap();
    engine.create_stream(stream_config).await.unwrap();
    let ack = engine
        .publish(subject("w.x"), payload("j3"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ack.sequence, 3);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_any_log_backend_can_serve_file_mode() {
    // A shared in-memory backend behaves like any other log store
    let backend = Arc::new(rill_storage_memory::MemoryStorage::new());

    let mut stream_config = StreamConfig::new("SHARED", vec![pattern("s.*")]);
    stream_config.storage = StorageMode::File;

    {
        let mut config = EngineConfig::new("test");
        config.storage = Some(backend.clone());
        let engine = Engine::new(config).unwrap();
        engine.create_stream(stream_config.clone()).await.unwrap();
        engine.publish(subject("s.x"), payload("m1")).await.unwrap();
        engine.shutdown().await;
    }

    let mut config = EngineConfig::new("test");
    config.storage = Some(backend);
    let engine = Engine::new(config).unwrap();
    let stream = engine.create_stream(stream_config).await.unwrap();
    assert_eq!(stream.info().await.unwrap().last_seq, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_publish_without_stream_returns_no_ack() {
    let engine = engine();
    let ack = engine
        .publish(subject("nobody.listens"), payload("x"))
        .await
        .unwrap();
    assert!(ack.is_none());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_ack_policy_none_is_rejected_nowhere_but_consumes_immediately() {
    let engine = engine();
    let mut config = StreamConfig::new("FIRE", vec![pattern("fire.*")]);
    config.retention = RetentionPolicy::WorkQueue;
    let stream = engine.create_stream(config).await.unwrap();

    for i in 0..5 {
        engine
            .publish(subject("fire.x"), payload(&format!("m{i}")))
            .await
            .unwrap();
    }

    let mut consumer_config = ConsumerConfig::durable("sampler");
    consumer_config.ack_policy = AckPolicy::None;
    let consumer = stream.create_consumer(consumer_config).await.unwrap();

    let deliveries = consumer.fetch(5, Duration::from_secs(1)).await.unwrap();
    assert_eq!(deliveries.len(), 5);

    // Hand-out doubles as ack, so the work queue drains with no
    // explicit acks and nothing stays pending
    assert_eq!(stream.info().await.unwrap().message_count, 0);
    assert_eq!(consumer.info().await.num_pending, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_rejects_further_operations() {
    let engine = engine();
    engine.shutdown().await;

    assert!(matches!(
        engine.publish(subject("x.y"), payload("z")).await,
        Err(Error::Shutdown)
    ));
    assert!(matches!(
        engine
            .create_stream(StreamConfig::new("LATE", vec![pattern("l.*")]))
            .await,
        Err(Error::Shutdown)
    ));
    // Shutting down twice is harmless
    engine.shutdown().await;
}
