//! Integration tests for the NATS JetStream backend
//!
//! Run with: cargo test -p mqclient --test nats_integration -- --ignored
//! Requires: docker run -p 4222:4222 nats:latest -js

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;

use mqclient::{codec, Broker};

const ADDRESS: &str = "localhost:4222";
const TIMEOUT: Duration = Duration::from_secs(2);

fn unique_queue(prefix: &str) -> String {
    format!("{prefix}-{}", std::process::id())
}

#[tokio::test]
#[ignore] // Requires NATS server with JetStream
async fn test_nats_publish_receive_ack_roundtrip() {
    let client = Broker::Nats.client();
    let queue = unique_queue("mq-nats-roundtrip");

    let mut pub_q = client.create_pub_queue(ADDRESS, &queue, None).await.unwrap();
    pub_q
        .send(codec::serialize(json!("foo, bar"), HashMap::new()).unwrap())
        .await
        .unwrap();
    pub_q.close().await.unwrap();

    let mut sub_q = client.create_sub_queue(ADDRESS, &queue, 1, None).await.unwrap();
    let mut msg = sub_q.receive(Some(TIMEOUT)).await.unwrap().expect("message expected");
    assert_eq!(msg.data().unwrap(), &json!("foo, bar"));
    sub_q.ack(&mut msg).await.unwrap();

    assert!(sub_q.receive(Some(TIMEOUT)).await.unwrap().is_none());
    sub_q.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires NATS server with JetStream
async fn test_nats_ack_is_per_message() {
    let client = Broker::Nats.client();
    let queue = unique_queue("mq-nats-per-message");

    let mut pub_q = client.create_pub_queue(ADDRESS, &queue, None).await.unwrap();
    for i in 0..3 {
        pub_q
            .send(codec::serialize(json!(i), HashMap::new()).unwrap())
            .await
            .unwrap();
    }
    pub_q.close().await.unwrap();

    let mut sub_q = client.create_sub_queue(ADDRESS, &queue, 3, None).await.unwrap();
    let mut msgs = Vec::new();
    for _ in 0..3 {
        msgs.push(sub_q.receive(Some(TIMEOUT)).await.unwrap().expect("message expected"));
    }

    // acking the 3rd leaves the other 2 outstanding
    let mut third = msgs.pop().unwrap();
    sub_q.ack(&mut third).await.unwrap();
    // close naks the two unacked messages so they redeliver immediately
    sub_q.close().await.unwrap();

    let mut sub2 = client.create_sub_queue(ADDRESS, &queue, 3, None).await.unwrap();
    let first = sub2.receive(Some(TIMEOUT)).await.unwrap().expect("redelivery expected");
    let second = sub2.receive(Some(TIMEOUT)).await.unwrap().expect("redelivery expected");
    assert_eq!(first.data().unwrap(), &json!(0));
    assert_eq!(second.data().unwrap(), &json!(1));
    assert!(sub2.receive(Some(TIMEOUT)).await.unwrap().is_none());
    sub2.close().await.unwrap();
}
