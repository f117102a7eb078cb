use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::debug;

use crate::client::BrokerClient;
use crate::error::{MqError, Result};
use crate::memory::broker::{AckMode, MemoryBroker, QueueSlot};
use crate::message::{AckStatus, Message, MessageId};
use crate::queue::{Lifecycle, Pub, QueueState, RawQueue, Sub, CLOSE_GRACE};
use crate::retry::{RetryPolicy, RetryRound};

pub struct MemoryPub {
    broker: Arc<MemoryBroker>,
    queue: String,
    slot: Option<Arc<QueueSlot>>,
    lifecycle: Lifecycle,
}

impl MemoryPub {
    pub(crate) fn new(broker: Arc<MemoryBroker>, queue: &str) -> Self {
        Self { broker, queue: queue.to_string(), slot: None, lifecycle: Lifecycle::new() }
    }
}

#[async_trait]
impl RawQueue for MemoryPub {
    fn state(&self) -> QueueState {
        self.lifecycle.state()
    }

    async fn connect(&mut self) -> Result<()> {
        self.lifecycle.check_connect()?;
        self.slot = Some(self.broker.slot(&self.queue));
        self.lifecycle.mark_connected();
        debug!(queue = %self.queue, "publisher connected");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.lifecycle.check_close()?;
        self.slot = None;
        self.lifecycle.mark_closed();
        debug!(queue = %self.queue, "publisher closed");
        Ok(())
    }
}

#[async_trait]
impl Pub for MemoryPub {
    async fn send(&mut self, payload: Bytes) -> Result<()> {
        self.lifecycle.require_connected()?;
        let slot = self.slot.as_ref().ok_or(MqError::NotConnected)?;
        let id = slot.push_back(payload).await;
        debug!(queue = %self.queue, msg_id = id, "sent message");
        Ok(())
    }
}

pub struct MemorySub {
    broker: Arc<MemoryBroker>,
    queue: String,
    prefetch: usize,
    retry: RetryPolicy,
    slot: Option<Arc<QueueSlot>>,
    lifecycle: Lifecycle,
    /// Received-but-unsettled messages, in delivery order.
    outstanding: Vec<(u64, Bytes)>,
}

impl MemorySub {
    pub(crate) fn new(broker: Arc<MemoryBroker>, queue: &str, prefetch: usize) -> Self {
        Self {
            broker,
            queue: queue.to_string(),
            prefetch: prefetch.max(1),
            retry: RetryPolicy::default(),
            slot: None,
            lifecycle: Lifecycle::new(),
            outstanding: Vec::new(),
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        if let Err(e) = self.close().await {
            debug!(error = %e, "close during reconnect failed");
        }
        tokio::time::sleep(self.retry.delay).await;
        self.lifecycle.reset();
        self.connect().await
    }

    /// Number of received-but-unsettled messages.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    fn position_of(&self, msg: &Message) -> Result<usize> {
        let id = match msg.msg_id() {
            MessageId::Sequence(id) => *id,
            other => return Err(MqError::Ack(format!("foreign message id: {other}"))),
        };
        self.outstanding
            .iter()
            .position(|(out_id, _)| *out_id == id)
            .ok_or_else(|| MqError::Ack(format!("unknown message id: {id}")))
    }

    /// Remove the settlement window for `pos` per the broker's ack mode.
    fn settle(&mut self, pos: usize) -> Vec<(u64, Bytes)> {
        match self.broker.ack_mode() {
            AckMode::PerMessage => vec![self.outstanding.remove(pos)],
            AckMode::Cumulative => self.outstanding.drain(..=pos).collect(),
        }
    }
}

#[async_trait]
impl RawQueue for MemorySub {
    fn state(&self) -> QueueState {
        self.lifecycle.state()
    }

    async fn connect(&mut self) -> Result<()> {
        self.lifecycle.check_connect()?;
        self.slot = Some(self.broker.slot(&self.queue));
        self.lifecycle.mark_connected();
        debug!(queue = %self.queue, prefetch = self.prefetch, "subscriber connected");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.lifecycle.check_close()?;
        tokio::time::sleep(CLOSE_GRACE).await;
        if !self.outstanding.is_empty() {
            debug!(
                queue = %self.queue,
                count = self.outstanding.len(),
                "requeueing unacked messages on close"
            );
            let payloads = self.outstanding.drain(..).map(|(_, p)| p).collect();
            if let Some(slot) = &self.slot {
                slot.requeue_front(payloads).await;
            }
        }
        self.slot = None;
        self.lifecycle.mark_closed();
        debug!(queue = %self.queue, "subscriber closed");
        Ok(())
    }
}

#[async_trait]
impl Sub for MemorySub {
    async fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<Message>> {
        self.lifecycle.require_connected()?;
        let mut round = RetryRound::new(self.retry);
        while self.broker.take_receive_fault() {
            debug!(queue = %self.queue, attempt = round.attempt(), "receive failed");
            round.again()?;
            self.reconnect().await?;
        }
        let slot = self.slot.clone().ok_or(MqError::NotConnected)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // prefetch bounds the unsettled window
            if self.outstanding.len() < self.prefetch {
                if let Some((id, payload)) = slot.pop_front().await {
                    self.outstanding.push((id, payload.clone()));
                    debug!(queue = %self.queue, msg_id = id, "received message");
                    return Ok(Some(Message::new(MessageId::Sequence(id), payload)));
                }
            }

            match deadline {
                None => slot.notified().await,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(queue = %self.queue, "no message within timeout");
                        return Ok(None);
                    }
                    if tokio::time::timeout(deadline - now, slot.notified()).await.is_err() {
                        debug!(queue = %self.queue, "no message within timeout");
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn ack(&mut self, msg: &mut Message) -> Result<()> {
        self.lifecycle.require_connected()?;
        let pos = self.position_of(msg)?;
        let settled = self.settle(pos);
        msg.set_ack_status(AckStatus::Acked);
        debug!(queue = %self.queue, msg_id = %msg.msg_id(), settled = settled.len(), "acked message");
        Ok(())
    }

    async fn reject(&mut self, msg: &mut Message) -> Result<()> {
        self.lifecycle.require_connected()?;
        let pos = self
            .position_of(msg)
            .map_err(|e| MqError::Nack(e.to_string()))?;
        let requeued = self.settle(pos);
        if let Some(slot) = &self.slot {
            slot.requeue_front(requeued.into_iter().map(|(_, p)| p).collect()).await;
        }
        msg.set_ack_status(AckStatus::Nacked);
        debug!(queue = %self.queue, msg_id = %msg.msg_id(), "nacked message");
        Ok(())
    }
}

/// Factory for in-process queues.
pub struct MemoryBrokerClient;

#[async_trait]
impl BrokerClient for MemoryBrokerClient {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_pub_queue(
        &self,
        address: &str,
        name: &str,
        _auth_token: Option<&str>,
    ) -> Result<Box<dyn Pub>> {
        let mut queue = MemoryBroker::at(address).pub_queue(name);
        queue.connect().await?;
        Ok(Box::new(queue))
    }

    async fn create_sub_queue(
        &self,
        address: &str,
        name: &str,
        prefetch: usize,
        _auth_token: Option<&str>,
    ) -> Result<Box<dyn Sub>> {
        let mut queue = MemoryBroker::at(address).sub_queue(name, prefetch);
        queue.connect().await?;
        Ok(Box::new(queue))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::codec;

    fn payload(data: serde_json::Value) -> Bytes {
        codec::serialize(data, HashMap::new()).unwrap()
    }

    async fn connected_pair(
        broker: &Arc<MemoryBroker>,
        prefetch: usize,
    ) -> (MemoryPub, MemorySub) {
        let mut pub_q = broker.pub_queue("q");
        pub_q.connect().await.unwrap();
        let mut sub_q = broker.sub_queue("q", prefetch);
        sub_q.connect().await.unwrap();
        (pub_q, sub_q)
    }

    #[tokio::test]
    async fn test_close_before_connect_fails() {
        let broker = MemoryBroker::new(AckMode::PerMessage);
        let mut pub_q = broker.pub_queue("q");
        assert!(matches!(pub_q.close().await, Err(MqError::ClosingFailed(_))));
    }

    #[tokio::test]
    async fn test_double_close_fails_with_already_closed() {
        let broker = MemoryBroker::new(AckMode::PerMessage);
        let (mut pub_q, _sub) = connected_pair(&broker, 1).await;
        pub_q.close().await.unwrap();
        assert!(matches!(pub_q.close().await, Err(MqError::AlreadyClosed)));
    }

    #[tokio::test]
    async fn test_data_operations_require_connected() {
        let broker = MemoryBroker::new(AckMode::PerMessage);
        let mut pub_q = broker.pub_queue("q");
        assert!(matches!(pub_q.send(payload(json!(1))).await, Err(MqError::NotConnected)));

        let mut sub_q = broker.sub_queue("q", 1);
        assert!(matches!(sub_q.receive(None).await, Err(MqError::NotConnected)));
    }

    #[tokio::test]
    async fn test_per_message_ack_leaves_others_outstanding() {
        let broker = MemoryBroker::new(AckMode::PerMessage);
        let (mut pub_q, mut sub_q) = connected_pair(&broker, 10).await;

        for i in 0..3 {
            pub_q.send(payload(json!(i))).await.unwrap();
        }
        let mut msgs = Vec::new();
        for _ in 0..3 {
            msgs.push(sub_q.receive(Some(Duration::from_millis(100))).await.unwrap().unwrap());
        }

        let mut third = msgs.pop().unwrap();
        sub_q.ack(&mut third).await.unwrap();
        assert_eq!(third.ack_status(), AckStatus::Acked);
        assert_eq!(sub_q.outstanding(), 2);
    }

    #[tokio::test]
    async fn test_cumulative_ack_settles_earlier_messages() {
        let broker = MemoryBroker::new(AckMode::Cumulative);
        let (mut pub_q, mut sub_q) = connected_pair(&broker, 10).await;

        for i in 0..3 {
            pub_q.send(payload(json!(i))).await.unwrap();
        }
        let mut msgs = Vec::new();
        for _ in 0..3 {
            msgs.push(sub_q.receive(Some(Duration::from_millis(100))).await.unwrap().unwrap());
        }

        let mut third = msgs.pop().unwrap();
        sub_q.ack(&mut third).await.unwrap();
        assert_eq!(sub_q.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_reject_requeues_with_a_fresh_id() {
        let broker = MemoryBroker::new(AckMode::PerMessage);
        let (mut pub_q, mut sub_q) = connected_pair(&broker, 1).await;

        pub_q.send(payload(json!("redeliver me"))).await.unwrap();
        let mut msg = sub_q.receive(Some(Duration::from_millis(100))).await.unwrap().unwrap();
        let original_id = msg.msg_id().clone();
        sub_q.reject(&mut msg).await.unwrap();
        assert_eq!(msg.ack_status(), AckStatus::Nacked);

        let redelivered = sub_q.receive(Some(Duration::from_millis(100))).await.unwrap().unwrap();
        assert_eq!(redelivered, msg);
        assert_ne!(redelivered.msg_id(), &original_id);
    }

    #[tokio::test]
    async fn test_prefetch_blocks_receive_while_window_is_full() {
        let broker = MemoryBroker::new(AckMode::PerMessage);
        let (mut pub_q, mut sub_q) = connected_pair(&broker, 1).await;

        pub_q.send(payload(json!(1))).await.unwrap();
        pub_q.send(payload(json!(2))).await.unwrap();

        let mut first = sub_q.receive(Some(Duration::from_millis(100))).await.unwrap().unwrap();
        // window full: second message is not delivered until the first settles
        assert!(sub_q.receive(Some(Duration::from_millis(50))).await.unwrap().is_none());

        sub_q.ack(&mut first).await.unwrap();
        assert!(sub_q.receive(Some(Duration::from_millis(100))).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_close_requeues_unacked_for_redelivery() {
        let broker = MemoryBroker::new(AckMode::PerMessage);
        let (mut pub_q, mut sub_q) = connected_pair(&broker, 10).await;

        pub_q.send(payload(json!("a"))).await.unwrap();
        pub_q.send(payload(json!("b"))).await.unwrap();
        let _a = sub_q.receive(Some(Duration::from_millis(100))).await.unwrap().unwrap();
        let _b = sub_q.receive(Some(Duration::from_millis(100))).await.unwrap().unwrap();
        sub_q.close().await.unwrap();

        let mut sub2 = broker.sub_queue("q", 10);
        sub2.connect().await.unwrap();
        let first = sub2.receive(Some(Duration::from_millis(100))).await.unwrap().unwrap();
        let second = sub2.receive(Some(Duration::from_millis(100))).await.unwrap().unwrap();
        assert_eq!(first.data().unwrap(), &json!("a"));
        assert_eq!(second.data().unwrap(), &json!("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_receive_faults_reconnect_and_recover() {
        let broker = MemoryBroker::new(AckMode::PerMessage);
        let (mut pub_q, mut sub_q) = connected_pair(&broker, 1).await;
        pub_q.send(payload(json!("after recovery"))).await.unwrap();

        // two dropped attempts stay within the retry bound
        broker.inject_receive_faults(2);
        let msg = sub_q.receive(Some(Duration::from_millis(100))).await.unwrap().unwrap();
        assert_eq!(msg.data().unwrap(), &json!("after recovery"));
        assert_eq!(sub_q.state(), QueueState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_fault_exhaustion_is_disconnected() {
        let broker = MemoryBroker::new(AckMode::PerMessage);
        let (_pub_q, mut sub_q) = connected_pair(&broker, 1).await;

        broker.inject_receive_faults(crate::queue::TRY_ATTEMPTS);
        assert!(matches!(
            sub_q.receive(Some(Duration::from_millis(100))).await,
            Err(MqError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_ack_unknown_id_fails() {
        let broker = MemoryBroker::new(AckMode::PerMessage);
        let (mut pub_q, mut sub_q) = connected_pair(&broker, 1).await;
        pub_q.send(payload(json!("x"))).await.unwrap();
        let mut msg = sub_q.receive(Some(Duration::from_millis(100))).await.unwrap().unwrap();
        sub_q.ack(&mut msg).await.unwrap();
        // settling twice: the id is no longer outstanding
        assert!(matches!(sub_q.ack(&mut msg).await, Err(MqError::Ack(_))));
    }
}
