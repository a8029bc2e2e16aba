//! Federation: leaf and hub paths must be indistinguishable

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rill_engine::{
    ConsumerConfig, DomainName, DomainRouter, Engine, EngineConfig, StreamConfig, Subject,
    SubjectPattern,
};

fn subject(s: &str) -> Subject {
    Subject::new(s).unwrap()
}

fn engine(domain: &str) -> Arc<Engine> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Engine::new(EngineConfig::new(domain)).unwrap()
}

fn pattern(s: &str) -> SubjectPattern {
    SubjectPattern::new(s).unwrap()
}

#[tokio::test]
async fn test_leaf_and_hub_consumers_observe_identical_state() {
    let router = DomainRouter::new();
    let hub = engine("hub");
    let leaf = engine("leaf");
    router.register(hub.clone());
    router.register(leaf.clone());

    let hub_domain: DomainName = "hub".into();
    hub.create_stream(StreamConfig::new(
        "ORDERS",
        vec![pattern("orders.*")],
    ))
    .await
    .unwrap();

    let via_leaf = router.connect(&"leaf".into()).unwrap();
    let via_hub = router.connect(&"hub".into()).unwrap();

    // Publishes through either path land on the same sequence line
    for i in 1..=3u64 {
        let client = if i % 2 == 0 { &via_hub } else { &via_leaf };
        let ack = client
            .publish(
                &hub_domain,
                subject("orders.created"),
                Bytes::from(format!("o{i}")),
            )
            .await
            .unwrap()
            .expect("stream ack");
        assert_eq!(ack.sequence, i);
    }

    let forwarded = via_leaf
        .create_consumer(&hub_domain, &"ORDERS".into(), ConsumerConfig::durable("fwd"))
        .await
        .unwrap();
    let direct = via_hub
        .create_consumer(&hub_domain, &"ORDERS".into(), ConsumerConfig::durable("dir"))
        .await
        .unwrap();

    let forwarded_seqs: Vec<u64> = forwarded
        .fetch(10, Duration::from_secs(1))
        .await
        .unwrap()
        .iter()
        .map(|d| d.message.sequence)
        .collect();
    let direct_seqs: Vec<u64> = direct
        .fetch(10, Duration::from_secs(1))
        .await
        .unwrap()
        .iter()
        .map(|d| d.message.sequence)
        .collect();

    assert_eq!(forwarded_seqs, vec![1, 2, 3]);
    assert_eq!(forwarded_seqs, direct_seqs);

    // Ack round-trips succeed identically through both paths
    for seq in forwarded_seqs {
        forwarded.ack(seq).await.unwrap();
        direct.ack(seq).await.unwrap();
    }
    assert_eq!(forwarded.info().await.num_pending, 0);
    assert_eq!(direct.info().await.num_pending, 0);

    let info = via_leaf
        .stream_info(&hub_domain, &"ORDERS".into())
        .await
        .unwrap();
    assert_eq!(info.last_seq, 3);

    leaf.shutdown().await;
    hub.shutdown().await;
}

#[tokio::test]
async fn test_deregistered_domain_is_unreachable() {
    let router = DomainRouter::new();
    let hub = engine("hub");
    let leaf = engine("leaf");
    router.register(hub.clone());
    router.register(leaf.clone());

    let client = router.connect(&"leaf".into()).unwrap();
    router.deregister(&"hub".into()).unwrap();

    assert!(
        client
            .get_stream(&"hub".into(), &"ORDERS".into())
            .is_err()
    );

    leaf.shutdown().await;
    hub.shutdown().await;
}
