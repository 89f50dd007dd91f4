//! Live update fan-out to subscribers.
//!
//! Every subscriber owns a bounded queue; when it overflows, the oldest
//! pending message on that subscriber is dropped and counted, leaving all
//! other subscribers untouched. The first message a subscriber ever sees
//! is `initial_state`, enqueued before the subscriber becomes visible to
//! publishers. The fabric holds its subscriber-set lock only long enough
//! to copy the current set.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Notify;

use crate::devices::Device;
use crate::flow::FlowRecord;
use crate::threat::Threat;

/// Self-describing message: a `type` discriminator plus the persisted
/// shape of the entity as `payload`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Notification {
    InitialState(InitialState),
    DeviceUpdate(Device),
    FlowUpdate(FlowRecord),
    ThreatUpdate(Threat),
}

/// Snapshot delivered once per subscription: the device set, active and
/// recently closed flows (bounded), and active threats.
#[derive(Debug, Clone, Serialize)]
pub struct InitialState {
    pub devices: Vec<Device>,
    pub flows: Vec<FlowRecord>,
    pub threats: Vec<Threat>,
}

struct SubscriberQueue {
    queue: Mutex<VecDeque<Notification>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
    capacity: usize,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, message: Notification) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.queue.lock().expect("subscriber queue lock");
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<Notification> {
        loop {
            // Arm before checking so a push between check and await is not
            // missed.
            let notified = self.notify.notified();
            if let Some(message) = self.queue.lock().expect("subscriber queue lock").pop_front() {
                return Some(message);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    fn depth(&self) -> usize {
        self.queue.lock().expect("subscriber queue lock").len()
    }
}

#[derive(Default)]
pub struct NotificationFabric {
    subscribers: Mutex<HashMap<u64, Arc<SubscriberQueue>>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    fabric: Arc<NotificationFabric>,
}

impl NotificationFabric {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        })
    }

    /// Register a subscriber. The initial-state message is enqueued before
    /// the subscriber is visible to publishers, so it is delivered strictly
    /// before any incremental update.
    pub fn subscribe(self: &Arc<Self>, initial: InitialState) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(self.capacity));
        queue.push(Notification::InitialState(initial));
        self.subscribers
            .lock()
            .expect("subscriber set lock")
            .insert(id, queue.clone());
        Subscription {
            id,
            queue,
            fabric: self.clone(),
        }
    }

    /// Deliver to every current subscriber. The set lock is held only to
    /// copy the set; slow consumers cost themselves, not each other.
    pub fn publish(&self, message: Notification) {
        let targets: Vec<Arc<SubscriberQueue>> = self
            .subscribers
            .lock()
            .expect("subscriber set lock")
            .values()
            .cloned()
            .collect();
        for queue in targets {
            queue.push(message.clone());
        }
    }

    pub fn publish_device(&self, device: Device) {
        self.publish(Notification::DeviceUpdate(device));
    }

    pub fn publish_flow(&self, flow: FlowRecord) {
        self.publish(Notification::FlowUpdate(flow));
    }

    pub fn publish_threat(&self, threat: Threat) {
        self.publish(Notification::ThreatUpdate(threat));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscriber set lock").len()
    }

    /// Total messages currently queued across subscribers.
    pub fn queue_depth(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber set lock")
            .values()
            .map(|q| q.depth())
            .sum()
    }

    /// Close every subscriber stream (shutdown).
    pub fn close_all(&self) {
        let targets: Vec<Arc<SubscriberQueue>> = self
            .subscribers
            .lock()
            .expect("subscriber set lock")
            .values()
            .cloned()
            .collect();
        for queue in targets {
            queue.close();
        }
    }

    fn unsubscribe(&self, id: u64) {
        if let Some(queue) = self
            .subscribers
            .lock()
            .expect("subscriber set lock")
            .remove(&id)
        {
            queue.close();
        }
    }
}

impl Subscription {
    /// Next message, or `None` once the stream is closed and drained.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.queue.pop().await
    }

    /// Non-blocking variant.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.queue
            .queue
            .lock()
            .expect("subscriber queue lock")
            .pop_front()
    }

    /// Messages this subscriber lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn depth(&self) -> usize {
        self.queue.depth()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.fabric.unsubscribe(self.id);
    }
}
