//! End-to-end pub/sub flow over the in-process backend, driven through the
//! factory surface exactly as a caller would use a real broker.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;

use mqclient::stream::{MessageStream, Outcome, StreamItem, StreamOptions};
use mqclient::{codec, Broker, MqError, DEFAULT_TIMEOUT_MILLIS};

const TIMEOUT: Duration = Duration::from_millis(DEFAULT_TIMEOUT_MILLIS);

#[tokio::test]
async fn test_publish_receive_ack_roundtrip() {
    let client = Broker::Memory.client();
    assert_eq!(client.name(), "memory");

    let mut pub_q = client.create_pub_queue("e2e-roundtrip", "q", None).await.unwrap();
    let payload = codec::serialize(json!("foo, bar"), HashMap::new()).unwrap();
    pub_q.send(payload).await.unwrap();
    pub_q.close().await.unwrap();

    let mut sub_q = client.create_sub_queue("e2e-roundtrip", "q", 1, None).await.unwrap();
    let mut msg = sub_q.receive(Some(TIMEOUT)).await.unwrap().expect("message expected");
    assert_eq!(msg.data().unwrap(), &json!("foo, bar"));
    assert!(msg.headers().unwrap().is_empty());

    sub_q.ack(&mut msg).await.unwrap();

    // queue drained: nothing arrives within the default timeout
    assert!(sub_q.receive(Some(TIMEOUT)).await.unwrap().is_none());
    sub_q.close().await.unwrap();
}

#[tokio::test]
async fn test_headers_survive_the_broker() {
    let client = Broker::Memory.client();
    let headers = HashMap::from([("trace-id".to_string(), "abc123".to_string())]);

    let mut pub_q = client.create_pub_queue("e2e-headers", "q", None).await.unwrap();
    pub_q
        .send(codec::serialize(json!({"k": 1}), headers.clone()).unwrap())
        .await
        .unwrap();

    let mut sub_q = client.create_sub_queue("e2e-headers", "q", 1, None).await.unwrap();
    let msg = sub_q.receive(Some(TIMEOUT)).await.unwrap().unwrap();
    assert_eq!(msg.headers().unwrap(), &headers);
}

#[tokio::test]
async fn test_stream_driven_consumption_with_ack() {
    let client = Broker::Memory.client();

    let mut pub_q = client.create_pub_queue("e2e-stream", "work", None).await.unwrap();
    for i in 0..5 {
        pub_q
            .send(codec::serialize(json!({"task": i}), HashMap::new()).unwrap())
            .await
            .unwrap();
    }
    pub_q.close().await.unwrap();

    let mut sub_q = client.create_sub_queue("e2e-stream", "work", 1, None).await.unwrap();
    let opts = StreamOptions {
        inactivity_timeout: Duration::from_millis(100),
        ..StreamOptions::default()
    };
    let mut stream = MessageStream::new(sub_q.as_mut(), opts);

    let mut seen = Vec::new();
    while let Some(item) = stream.next().await.unwrap() {
        match item {
            StreamItem::Delivered(mut msg) => {
                seen.push(msg.data().unwrap().clone());
                stream.ack(&mut msg).await.unwrap();
                stream.resolve(Outcome::Continue);
            }
            StreamItem::Skipped => unreachable!("no downstream failures reported"),
        }
    }

    let expected: Vec<_> = (0..5).map(|i| json!({"task": i})).collect();
    assert_eq!(seen, expected);
    sub_q.close().await.unwrap();
}

#[tokio::test]
async fn test_factory_close_is_not_idempotent() {
    let client = Broker::Memory.client();
    let mut pub_q = client.create_pub_queue("e2e-close", "q", None).await.unwrap();
    pub_q.close().await.unwrap();
    assert!(matches!(pub_q.close().await, Err(MqError::AlreadyClosed)));
}
