use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::memory::queue::{MemoryPub, MemorySub};

/// Brokers keyed by address, so the factory surface reaches the same broker
/// from independent pub and sub queues.
static REGISTRY: Lazy<DashMap<String, Arc<MemoryBroker>>> = Lazy::new(DashMap::new);

/// Settlement granularity of a [`MemoryBroker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Settling a message affects only that message.
    PerMessage,
    /// Settling the Nth outstanding message also settles all earlier
    /// outstanding messages on the same connection.
    Cumulative,
}

pub(crate) struct SlotInner {
    pending: VecDeque<(u64, Bytes)>,
    next_id: u64,
}

/// One named queue on the broker.
pub(crate) struct QueueSlot {
    inner: Mutex<SlotInner>,
    notify: Notify,
}

impl QueueSlot {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner { pending: VecDeque::new(), next_id: 0 }),
            notify: Notify::new(),
        }
    }

    pub(crate) async fn push_back(&self, payload: Bytes) -> u64 {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.pending.push_back((id, payload));
        drop(inner);
        self.notify.notify_one();
        id
    }

    /// Requeue payloads at the front, oldest first, under fresh ids.
    /// Redelivered messages never keep their original id.
    pub(crate) async fn requeue_front(&self, payloads: Vec<Bytes>) {
        let mut inner = self.inner.lock().await;
        for payload in payloads.into_iter().rev() {
            let id = inner.next_id;
            inner.next_id += 1;
            inner.pending.push_front((id, payload));
        }
        drop(inner);
        self.notify.notify_one();
    }

    pub(crate) async fn pop_front(&self) -> Option<(u64, Bytes)> {
        self.inner.lock().await.pending.pop_front()
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// An in-process broker instance.
pub struct MemoryBroker {
    ack_mode: AckMode,
    queues: DashMap<String, Arc<QueueSlot>>,
    /// Pending injected connection faults; each one fails a single receive
    /// attempt as if the connection dropped.
    receive_faults: AtomicUsize,
}

impl MemoryBroker {
    pub fn new(ack_mode: AckMode) -> Arc<Self> {
        Arc::new(Self {
            ack_mode,
            queues: DashMap::new(),
            receive_faults: AtomicUsize::new(0),
        })
    }

    /// Make the next `n` receive attempts fail with a transient connection
    /// fault, driving subscribers through their reconnect path.
    pub fn inject_receive_faults(&self, n: usize) {
        self.receive_faults.fetch_add(n, Ordering::SeqCst);
    }

    pub(crate) fn take_receive_fault(&self) -> bool {
        self.receive_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// The shared broker behind an address; created on first use with
    /// per-message settlement.
    pub fn at(address: &str) -> Arc<Self> {
        REGISTRY
            .entry(address.to_string())
            .or_insert_with(|| {
                debug!(address, "starting in-process broker");
                MemoryBroker::new(AckMode::PerMessage)
            })
            .clone()
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// An unconnected publisher bound to this broker.
    pub fn pub_queue(self: &Arc<Self>, name: &str) -> MemoryPub {
        MemoryPub::new(Arc::clone(self), name)
    }

    /// An unconnected subscriber bound to this broker.
    pub fn sub_queue(self: &Arc<Self>, name: &str, prefetch: usize) -> MemorySub {
        MemorySub::new(Arc::clone(self), name, prefetch)
    }

    pub(crate) fn slot(&self, name: &str) -> Arc<QueueSlot> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueSlot::new()))
            .clone()
    }
}
