use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::BrokerClient;
use crate::error::{MqError, Result};
use crate::message::{AckStatus, Message, MessageId};
use crate::queue::{Lifecycle, Pub, QueueState, RawQueue, Sub, CLOSE_GRACE};
use crate::rabbitmq::normalize_address;
use crate::retry::{ErrorClass, RetryPolicy, RetryRound};

/// Pause between empty `basic_get` polls.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const CLOSE_REPLY_SUCCESS: u16 = 200;

/// Channel-level protocol errors are structurally fatal; everything else is
/// treated as a recoverable connection failure.
fn classify(err: &lapin::Error) -> ErrorClass {
    match err {
        lapin::Error::InvalidChannelState(_) | lapin::Error::ProtocolError(_) => ErrorClass::Fatal,
        _ => ErrorClass::Transient,
    }
}

fn delivery_tag_of(msg: &Message) -> std::result::Result<u64, String> {
    match msg.msg_id() {
        MessageId::Sequence(tag) => Ok(*tag),
        other => Err(format!("foreign message id: {other}")),
    }
}

/// Connection/channel handle and lifecycle shared by the pub and sub
/// adapters.
struct AmqpLink {
    address: String,
    queue: String,
    retry: RetryPolicy,
    lifecycle: Lifecycle,
    connection: Option<Connection>,
    channel: Option<Channel>,
}

impl AmqpLink {
    fn new(address: &str, queue: &str) -> Self {
        Self {
            address: normalize_address(address),
            queue: queue.to_string(),
            retry: RetryPolicy::default(),
            lifecycle: Lifecycle::new(),
            connection: None,
            channel: None,
        }
    }

    /// Dial the broker, open a channel, and declare the queue.
    async fn establish(&mut self) -> Result<()> {
        self.lifecycle.check_connect()?;
        debug!(address = %self.address, queue = %self.queue, "connecting");

        let connection = Connection::connect(&self.address, ConnectionProperties::default())
            .await
            .map_err(|e| MqError::ConnectingFailed(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| MqError::ConnectingFailed(e.to_string()))?;
        channel
            .queue_declare(&self.queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|e| MqError::ConnectingFailed(e.to_string()))?;

        self.connection = Some(connection);
        self.channel = Some(channel);
        Ok(())
    }

    fn channel(&self) -> Result<&Channel> {
        self.lifecycle.require_connected()?;
        self.channel.as_ref().ok_or(MqError::NotConnected)
    }

    async fn shut(&mut self) -> Result<()> {
        self.lifecycle.check_close()?;
        let connection = self
            .connection
            .take()
            .ok_or_else(|| MqError::ClosingFailed("no connection to close".into()))?;
        let channel = self.channel.take();
        self.lifecycle.mark_closed();
        connection
            .close(CLOSE_REPLY_SUCCESS, "closing")
            .await
            .map_err(|e| MqError::ClosingFailed(e.to_string()))?;
        if let Some(channel) = channel {
            if channel.status().connected() {
                warn!(queue = %self.queue, "channel remains open after connection close");
            }
        }
        debug!(queue = %self.queue, "closed");
        Ok(())
    }
}

pub struct RabbitPub {
    link: AmqpLink,
}

impl RabbitPub {
    pub fn new(address: &str, queue: &str) -> Self {
        Self { link: AmqpLink::new(address, queue) }
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
impl RawQueue for RabbitPub {
    fn state(&self) -> QueueState {
        self.link.lifecycle.state()
    }

    async fn connect(&mut self) -> Result<()> {
        self.link.establish().await?;
        // publisher confirms: a send only succeeds once the broker owns it
        self.link
            .channel
            .as_ref()
            .ok_or_else(|| MqError::ConnectingFailed("no channel to configure".into()))?
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| MqError::ConnectingFailed(e.to_string()))?;
        self.link.lifecycle.mark_connected();
        info!(address = %self.link.address, queue = %self.link.queue, "publisher connected");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.link.shut().await
    }
}

#[async_trait]
impl Pub for RabbitPub {
    async fn send(&mut self, payload: Bytes) -> Result<()> {
        let mut round = RetryRound::new(self.link.retry);
        loop {
            let channel = self.link.channel()?;
            let published = match channel
                .basic_publish(
                    "",
                    &self.link.queue,
                    BasicPublishOptions::default(),
                    &payload,
                    BasicProperties::default(),
                )
                .await
            {
                Ok(confirm) => confirm.await.map(|_| ()),
                Err(e) => Err(e),
            };
            match published {
                Ok(()) => {
                    debug!(queue = %self.link.queue, bytes = payload.len(), "sent message");
                    return Ok(());
                }
                Err(e) => match classify(&e) {
                    ErrorClass::Fatal => return Err(MqError::Channel(e.to_string())),
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

pub struct RabbitSub {
    link: AmqpLink,
    prefetch: u16,
}

impl RabbitSub {
    pub fn new(address: &str, queue: &str, prefetch: u16) -> Self {
        Self { link: AmqpLink::new(address, queue), prefetch: prefetch.max(1) }
    }

    async fn reconnect(&mut self) -> Result<()> {
        if let Err(e) = self.close().await {
            debug!(error = %e, "close during reconnect failed");
        }
        tokio::time::sleep(self.link.retry.delay).await;
        self.link.lifecycle.reset();
        self.connect().await
    }

    /// Settle up to and including `tag`; `multiple = true` makes this
    /// cumulative over all earlier deliveries on the channel.
    async fn settle(&mut self, tag: u64, nack: bool) -> std::result::Result<(), lapin::Error> {
        let channel = match self.link.channel() {
            Ok(c) => c,
            // caller validated the state already; treat as gone mid-call
            Err(_) => return Ok(()),
        };
        if nack {
            channel
                .basic_nack(tag, BasicNackOptions { multiple: true, requeue: true })
                .await
        } else {
            channel.basic_ack(tag, BasicAckOptions { multiple: true }).await
        }
    }
}

#[async_trait]
impl RawQueue for RabbitSub {
    fn state(&self) -> QueueState {
        self.link.lifecycle.state()
    }

    async fn connect(&mut self) -> Result<()> {
        self.link.establish().await?;
        self.link
            .channel
            .as_ref()
            .ok_or_else(|| MqError::ConnectingFailed("no channel to configure".into()))?
            .basic_qos(self.prefetch, BasicQosOptions { global: true })
            .await
            .map_err(|e| MqError::ConnectingFailed(e.to_string()))?;
        self.link.lifecycle.mark_connected();
        info!(
            address = %self.link.address,
            queue = %self.link.queue,
            prefetch = self.prefetch,
            "subscriber connected"
        );
        Ok(())
    }

    /// Closing the channel implicitly requeues every unacked delivery; the
    /// grace period lets in-flight settlement calls land first.
    async fn close(&mut self) -> Result<()> {
        self.link.lifecycle.check_close()?;
        tokio::time::sleep(CLOSE_GRACE).await;
        self.link.shut().await
    }
}

#[async_trait]
impl Sub for RabbitSub {
    async fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<Message>> {
        self.link.lifecycle.require_connected()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut round = RetryRound::new(self.link.retry);
        loop {
            let channel = self.link.channel()?;
            match channel.basic_get(&self.link.queue, BasicGetOptions::default()).await {
                Ok(Some(delivery)) => {
                    let tag = delivery.delivery.delivery_tag;
                    let message = Message::new(
                        MessageId::Sequence(tag),
                        Bytes::from(delivery.delivery.data),
                    );
                    debug!(queue = %self.link.queue, msg_id = tag, "received message");
                    return Ok(Some(message));
                }
                Ok(None) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            debug!(queue = %self.link.queue, "no message within timeout");
                            return Ok(None);
                        }
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => match classify(&e) {
                    ErrorClass::Fatal => return Err(MqError::Channel(e.to_string())),
                    _ => {
                        debug!(error = %e, attempt = round.attempt(), "receive failed");
                        round.again()?;
                        self.reconnect().await?;
                    }
                },
            }
        }
    }

    /// Acks in channel order: acking the Nth outstanding message also acks
    /// the N-1 before it. Settlement reconnects and retries on connection
    /// loss like `send` and `receive`.
    async fn ack(&mut self, msg: &mut Message) -> Result<()> {
        self.link.lifecycle.require_connected()?;
        let tag = delivery_tag_of(msg).map_err(MqError::Ack)?;
        let mut round = RetryRound::new(self.link.retry);
        loop {
            match self.settle(tag, false).await {
                Ok(()) => break,
                Err(e) => match classify(&e) {
                    ErrorClass::Fatal => return Err(MqError::Ack(e.to_string())),
                    _ => {
                        debug!(error = %e, attempt = round.attempt(), "ack failed");
                        round.again()?;
                        self.reconnect().await?;
                    }
                },
            }
        }
        msg.set_ack_status(AckStatus::Acked);
        debug!(queue = %self.link.queue, msg_id = tag, "acked message");
        Ok(())
    }

    /// Nacks in channel order, requeueing for redelivery; nacking the Nth
    /// outstanding message also nacks the N-1 before it.
    async fn reject(&mut self, msg: &mut Message) -> Result<()> {
        self.link.lifecycle.require_connected()?;
        let tag = delivery_tag_of(msg).map_err(MqError::Nack)?;
        let mut round = RetryRound::new(self.link.retry);
        loop {
            match self.settle(tag, true).await {
                Ok(()) => break,
                Err(e) => match classify(&e) {
                    ErrorClass::Fatal => return Err(MqError::Nack(e.to_string())),
                    _ => {
                        debug!(error = %e, attempt = round.attempt(), "nack failed");
                        round.again()?;
                        self.reconnect().await?;
                    }
                },
            }
        }
        msg.set_ack_status(AckStatus::Nacked);
        debug!(queue = %self.link.queue, msg_id = tag, "nacked message");
        Ok(())
    }
}

/// Factory for RabbitMQ queues.
///
/// The AMQP client authenticates via credentials in the address URL, so
/// `auth_token` is unused here.
pub struct RabbitBrokerClient;

#[async_trait]
impl BrokerClient for RabbitBrokerClient {
    fn name(&self) -> &'static str {
        "rabbitmq"
    }

    async fn create_pub_queue(
        &self,
        address: &str,
        name: &str,
        _auth_token: Option<&str>,
    ) -> Result<Box<dyn Pub>> {
        let mut queue = RabbitPub::new(address, name);
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
        let mut queue = RabbitSub::new(address, name, prefetch.min(u16::MAX as usize) as u16);
        queue.connect().await?;
        Ok(Box::new(queue))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_channel_level_errors_are_fatal() {
        let err = lapin::Error::InvalidChannelState(lapin::ChannelState::Closed);
        assert_eq!(classify(&err), ErrorClass::Fatal);
    }

    #[test]
    fn test_connection_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(classify(&lapin::Error::IOError(Arc::new(io))), ErrorClass::Transient);
    }
}
