use std::collections::HashMap;
use std::time::Duration;

use async_nats::jetstream::consumer::pull;
use async_nats::jetstream::consumer::{AckPolicy, PullConsumer};
use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy, StorageType};
use async_nats::jetstream::{self, AckKind, Context};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{debug, info};

use crate::client::BrokerClient;
use crate::error::{MqError, Result};
use crate::message::{AckStatus, Message, MessageId};
use crate::nats::{normalize_address, stream_name, ACK_WAIT_ENV, SUBSCRIPTION_NAME};
use crate::queue::{Lifecycle, Pub, QueueState, RawQueue, Sub, CLOSE_GRACE};
use crate::retry::{ErrorClass, RetryPolicy, RetryRound};

/// Chunk length for an unbounded (`timeout: None`) receive; the fetch is
/// simply re-entered until a message shows up.
const BLOCK_CHUNK: Duration = Duration::from_secs(30);

/// Connection-loss signals worth a reconnect; anything unrecognized is a
/// broker-side rejection and surfaces immediately.
const TRANSIENT_SIGNALS: &[&str] = &[
    "connection closed",
    "connection reset",
    "connection refused",
    "broken pipe",
    "disconnected",
    "io error",
];

fn classify(text: &str) -> ErrorClass {
    // the client reports fetch expiry as an error string rather than a type
    let lowered = text.to_lowercase();
    if lowered.contains("timed out") || lowered.contains("timeout") {
        ErrorClass::Timeout
    } else if TRANSIENT_SIGNALS.iter().any(|sig| lowered.contains(sig)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

fn sequence_of(msg: &Message) -> std::result::Result<u64, String> {
    match msg.msg_id() {
        MessageId::Sequence(seq) => Ok(*seq),
        other => Err(format!("foreign message id: {other}")),
    }
}

fn ack_wait_from_env() -> Option<Duration> {
    let secs = std::env::var(ACK_WAIT_ENV).ok()?.parse::<u64>().ok()?;
    (secs > 10).then(|| Duration::from_secs(secs))
}

/// Connection handle and lifecycle shared by the pub and sub adapters.
struct NatsLink {
    address: String,
    queue: String,
    auth_token: Option<String>,
    retry: RetryPolicy,
    lifecycle: Lifecycle,
    client: Option<async_nats::Client>,
    js: Option<Context>,
}

impl NatsLink {
    fn new(address: &str, queue: &str, auth_token: Option<&str>) -> Self {
        Self {
            address: normalize_address(address),
            queue: queue.to_string(),
            auth_token: auth_token.map(str::to_string),
            retry: RetryPolicy::default(),
            lifecycle: Lifecycle::new(),
            client: None,
            js: None,
        }
    }

    /// Dial the server and make sure the queue's work stream exists.
    async fn establish(&mut self) -> Result<jetstream::stream::Stream> {
        self.lifecycle.check_connect()?;
        debug!(address = %self.address, queue = %self.queue, "connecting");

        let client = match &self.auth_token {
            Some(token) => async_nats::ConnectOptions::with_token(token.clone())
                .connect(&self.address)
                .await,
            None => async_nats::connect(&self.address).await,
        }
        .map_err(|e| MqError::ConnectingFailed(e.to_string()))?;

        let js = jetstream::new(client.clone());
        // work-queue retention keeps a message until some subscriber acks it
        let stream = js
            .get_or_create_stream(StreamConfig {
                name: stream_name(&self.queue),
                subjects: vec![self.queue.clone()],
                retention: RetentionPolicy::WorkQueue,
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| MqError::ConnectingFailed(e.to_string()))?;

        self.client = Some(client);
        self.js = Some(js);
        Ok(stream)
    }

    async fn shut(&mut self) -> Result<()> {
        self.lifecycle.check_close()?;
        let client = self
            .client
            .take()
            .ok_or_else(|| MqError::ClosingFailed("no client to close".into()))?;
        self.js = None;
        self.lifecycle.mark_closed();
        client
            .flush()
            .await
            .map_err(|e| MqError::ClosingFailed(e.to_string()))?;
        debug!(queue = %self.queue, "closed");
        Ok(())
    }
}

pub struct NatsPub {
    link: NatsLink,
}

impl NatsPub {
    pub fn new(address: &str, queue: &str, auth_token: Option<&str>) -> Self {
        Self { link: NatsLink::new(address, queue, auth_token) }
    }

    async fn reconnect(&mut self) -> Result<()> {
        if let Err(e) = self.close().await {
            debug!(error = %e, "close during reconnect failed");
        }
        tokio::time::sleep(self.link.retry.delay).await;
        self.link.lifecycle.reset();
        self.connect().await
    }
}

#[async_trait]
impl RawQueue for NatsPub {
    fn state(&self) -> QueueState {
        self.link.lifecycle.state()
    }

    async fn connect(&mut self) -> Result<()> {
        self.link.establish().await?;
        self.link.lifecycle.mark_connected();
        info!(address = %self.link.address, queue = %self.link.queue, "publisher connected");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.link.shut().await
    }
}

#[async_trait]
impl Pub for NatsPub {
    async fn send(&mut self, payload: Bytes) -> Result<()> {
        self.link.lifecycle.require_connected()?;
        let mut round = RetryRound::new(self.link.retry);
        loop {
            let js = self.link.js.clone().ok_or(MqError::NotConnected)?;
            let published = match js.publish(self.link.queue.clone(), payload.clone()).await {
                Ok(ack) => ack.await.map(|_| ()).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match published {
                Ok(()) => {
                    debug!(queue = %self.link.queue, bytes = payload.len(), "sent message");
                    return Ok(());
                }
                Err(e) => match classify(&e) {
                    ErrorClass::Fatal => return Err(MqError::Channel(e)),
                    _ => {
                        debug!(error = %e, attempt = round.attempt(), "publish failed");
                        round.again()?;
                        self.reconnect().await?;
                    }
                },
            }
        }
    }
}

pub struct NatsSub {
    link: NatsLink,
    prefetch: usize,
    consumer: Option<PullConsumer>,
    /// Delivery handles for received-but-unsettled messages, keyed by stream
    /// sequence; settlement resolves the stored handle.
    outstanding: HashMap<u64, jetstream::Message>,
}

impl NatsSub {
    pub fn new(address: &str, queue: &str, prefetch: usize, auth_token: Option<&str>) -> Self {
        Self {
            link: NatsLink::new(address, queue, auth_token),
            prefetch: prefetch.max(1),
            consumer: None,
            outstanding: HashMap::new(),
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        if let Err(e) = self.close().await {
            debug!(error = %e, "close during reconnect failed");
        }
        tokio::time::sleep(self.link.retry.delay).await;
        self.link.lifecycle.reset();
        self.connect().await
    }

    async fn fetch_one(&mut self, expires: Duration) -> std::result::Result<Option<Message>, String> {
        let consumer = self.consumer.as_ref().ok_or_else(|| "no consumer".to_string())?;
        let batch = consumer
            .fetch()
            .max_messages(1)
            .expires(expires)
            .messages()
            .await
            .map_err(|e| e.to_string())?;

        tokio::pin!(batch);
        match batch.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(e.to_string()),
            Some(Ok(delivery)) => {
                let seq = delivery.info().map_err(|e| e.to_string())?.stream_sequence;
                let message = Message::new(MessageId::Sequence(seq), delivery.payload.clone());
                self.outstanding.insert(seq, delivery);
                Ok(Some(message))
            }
        }
    }
}

#[async_trait]
impl RawQueue for NatsSub {
    fn state(&self) -> QueueState {
        self.link.lifecycle.state()
    }

    async fn connect(&mut self) -> Result<()> {
        let stream = self.link.establish().await?;

        let mut config = pull::Config {
            durable_name: Some(SUBSCRIPTION_NAME.to_string()),
            ack_policy: AckPolicy::Explicit,
            max_ack_pending: self.prefetch as i64,
            ..Default::default()
        };
        if let Some(wait) = ack_wait_from_env() {
            config.ack_wait = wait;
        }
        let consumer = stream
            .get_or_create_consumer(SUBSCRIPTION_NAME, config)
            .await
            .map_err(|e| MqError::ConnectingFailed(e.to_string()))?;

        self.consumer = Some(consumer);
        self.link.lifecycle.mark_connected();
        info!(
            address = %self.link.address,
            queue = %self.link.queue,
            prefetch = self.prefetch,
            "subscriber connected"
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.link.lifecycle.check_close()?;
        // let in-flight settlement calls land first
        tokio::time::sleep(CLOSE_GRACE).await;
        let outstanding: Vec<_> = self.outstanding.drain().collect();
        if !outstanding.is_empty() {
            debug!(
                queue = %self.link.queue,
                count = outstanding.len(),
                "nacking unacked messages on close"
            );
        }
        for (seq, delivery) in outstanding {
            if let Err(e) = delivery.ack_with(AckKind::Nak(None)).await {
                debug!(msg_id = seq, error = %e, "nak on close failed");
            }
        }
        self.consumer = None;
        self.link.shut().await
    }
}

#[async_trait]
impl Sub for NatsSub {
    async fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<Message>> {
        self.link.lifecycle.require_connected()?;
        let mut round = RetryRound::new(self.link.retry);
        let expires = timeout.unwrap_or(BLOCK_CHUNK);
        loop {
            match self.fetch_one(expires).await {
                Ok(Some(msg)) => {
                    debug!(queue = %self.link.queue, msg_id = %msg.msg_id(), "received message");
                    return Ok(Some(msg));
                }
                Ok(None) => {
                    if timeout.is_some() {
                        debug!(queue = %self.link.queue, "no message within timeout");
                        return Ok(None);
                    }
                    // timeout: None blocks until a message arrives
                }
                Err(text) => match classify(&text) {
                    ErrorClass::Timeout => {
                        debug!(queue = %self.link.queue, "no message within timeout");
                        return Ok(None);
                    }
                    ErrorClass::Fatal => return Err(MqError::Channel(text)),
                    ErrorClass::Transient => {
                        debug!(error = %text, attempt = round.attempt(), "receive failed");
                        round.again()?;
                        self.reconnect().await?;
                    }
                },
            }
        }
    }

    async fn ack(&mut self, msg: &mut Message) -> Result<()> {
        self.link.lifecycle.require_connected()?;
        let seq = sequence_of(msg).map_err(MqError::Ack)?;
        let delivery = self
            .outstanding
            .get(&seq)
            .ok_or_else(|| MqError::Ack(format!("unknown message id: {seq}")))?;
        delivery.ack().await.map_err(|e| MqError::Ack(e.to_string()))?;
        self.outstanding.remove(&seq);
        msg.set_ack_status(AckStatus::Acked);
        debug!(queue = %self.link.queue, msg_id = seq, "acked message");
        Ok(())
    }

    async fn reject(&mut self, msg: &mut Message) -> Result<()> {
        self.link.lifecycle.require_connected()?;
        let seq = sequence_of(msg).map_err(MqError::Nack)?;
        let delivery = self
            .outstanding
            .get(&seq)
            .ok_or_else(|| MqError::Nack(format!("unknown message id: {seq}")))?;
        delivery
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| MqError::Nack(e.to_string()))?;
        self.outstanding.remove(&seq);
        msg.set_ack_status(AckStatus::Nacked);
        debug!(queue = %self.link.queue, msg_id = seq, "nacked message");
        Ok(())
    }
}

/// Factory for NATS JetStream queues.
pub struct NatsBrokerClient;

#[async_trait]
impl BrokerClient for NatsBrokerClient {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn create_pub_queue(
        &self,
        address: &str,
        name: &str,
        auth_token: Option<&str>,
    ) -> Result<Box<dyn Pub>> {
        let mut queue = NatsPub::new(address, name, auth_token);
        queue.connect().await?;
        Ok(Box::new(queue))
    }

    async fn create_sub_queue(
        &self,
        address: &str,
        name: &str,
        prefetch: usize,
        auth_token: Option<&str>,
    ) -> Result<Box<dyn Sub>> {
        let mut queue = NatsSub::new(address, name, prefetch, auth_token);
        queue.connect().await?;
        Ok(Box::new(queue))
    }
}
