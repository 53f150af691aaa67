//! Topic-keyed pub/sub fabric between nodes.
//!
//! Topics are owned by a single producer: either one node's output port or
//! one external stream. Structural changes (subscribe, unsubscribe, sweep)
//! take short write locks on the routing tables; the publish path clones an
//! `Arc` snapshot of the subscriber list under a read lock and then pushes
//! into per-subscription rings lock-free.
//!
//! Per (topic, subscription) delivery order equals publish order. Nothing is
//! promised across topics or across subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::utils::Backoff;
use metrics::counter;
use tickflow_types::ahash::RandomState;
use tickflow_types::ids::{NodeId, StreamId, SubscriptionId};
use tickflow_types::message::Message;
use tickflow_types::parking_lot::RwLock;

use crate::errors::ExecutionError;
use crate::node::PortHandle;
use crate::queue::spsc::Ring;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Topic {
    /// Output port of a dag node.
    Node { node: NodeId, port: PortHandle },
    /// External ingestion stream.
    Stream(StreamId),
}

impl Topic {
    pub fn node(node: NodeId, port: PortHandle) -> Topic {
        Topic::Node { node, port }
    }

    pub fn stream(stream: StreamId) -> Topic {
        Topic::Stream(stream)
    }
}

/// One typed, ordered channel from a topic to a consuming node.
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: Topic,
    /// Consuming node.
    pub node: NodeId,
    /// Input port messages are stamped with on delivery.
    pub port: PortHandle,
    queue: Ring<Message>,
    block_producer: bool,
    tombstoned: AtomicBool,
    pub delivered: AtomicU64,
    pub drops: AtomicU64,
}

impl Subscription {
    /// Queue-level delivery. Fails with `QueueFull` at capacity; the
    /// broker's fan-out turns that into drop accounting for non-blocking
    /// subscriptions.
    pub fn deliver(&self, message: Message) -> Result<(), ExecutionError> {
        self.queue
            .push(message)
            .map_err(|_| ExecutionError::QueueFull)
    }

    pub fn pop(&self) -> Option<Message> {
        self.queue.pop()
    }

    /// Oldest queued message, if any, without consuming it.
    pub fn peek(&self) -> Option<Message> {
        self.queue.peek()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("node", &self.node)
            .field("port", &self.port)
            .field("queued", &self.queue.len())
            .finish()
    }
}

/// Delivery summary of one publish call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub delivered: u32,
    pub dropped: u32,
}

type SubscriberList = Arc<Vec<Arc<Subscription>>>;

pub struct MessageBroker {
    topics: RwLock<HashMap<Topic, SubscriberList, RandomState>>,
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<Subscription>, RandomState>>,
    next_subscription: AtomicU64,
    queue_capacity: usize,
    default_block: bool,
}

impl MessageBroker {
    pub fn new(queue_capacity: usize, block_on_full: bool) -> MessageBroker {
        MessageBroker {
            topics: RwLock::new(HashMap::default()),
            subscriptions: RwLock::new(HashMap::default()),
            next_subscription: AtomicU64::new(1),
            queue_capacity,
            default_block: block_on_full,
        }
    }

    /// Attaches a subscription with the broker-wide blocking default.
    pub fn subscribe(&self, topic: Topic, node: NodeId, port: PortHandle) -> SubscriptionId {
        self.subscribe_with(topic, node, port, self.default_block)
    }

    pub fn subscribe_with(
        &self,
        topic: Topic,
        node: NodeId,
        port: PortHandle,
        block_producer: bool,
    ) -> SubscriptionId {
        let index = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let id = SubscriptionId::from_parts(index as u32, 1);
        let subscription = Arc::new(Subscription {
            id,
            topic,
            node,
            port,
            queue: Ring::with_capacity(self.queue_capacity),
            block_producer,
            tombstoned: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        });

        self.subscriptions
            .write()
            .insert(id, Arc::clone(&subscription));
        let mut topics = self.topics.write();
        let list = topics.entry(topic).or_default();
        let mut updated = Vec::with_capacity(list.len() + 1);
        updated.extend(list.iter().cloned());
        updated.push(subscription);
        *list = Arc::new(updated);
        id
    }

    /// Marks the subscription dead. The entry is skipped by publishes and
    /// reclaimed on the next [`sweep`](Self::sweep).
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ExecutionError> {
        let subscriptions = self.subscriptions.read();
        let subscription = subscriptions
            .get(&id)
            .ok_or(ExecutionError::UnknownSubscription(id))?;
        subscription.tombstoned.store(true, Ordering::Release);
        Ok(())
    }

    /// Reaps tombstoned subscriptions out of both tables.
    pub fn sweep(&self) {
        let mut subscriptions = self.subscriptions.write();
        let mut topics = self.topics.write();
        subscriptions.retain(|_, subscription| !subscription.is_tombstoned());
        for list in topics.values_mut() {
            if list.iter().any(|s| s.is_tombstoned()) {
                *list = Arc::new(
                    list.iter()
                        .filter(|s| !s.is_tombstoned())
                        .cloned()
                        .collect(),
                );
            }
        }
        topics.retain(|_, list| !list.is_empty());
    }

    fn snapshot(&self, topic: Topic) -> Option<SubscriberList> {
        self.topics.read().get(&topic).cloned()
    }

    /// Non-blocking fan-out.
    ///
    /// If any `BlockProducer` subscription is full the call fails with
    /// `WouldBlock` before delivering anything, so a retry cannot duplicate
    /// messages. Non-blocking subscriptions lose messages on overflow; each
    /// loss is counted on the subscription and in the outcome.
    pub fn try_publish(
        &self,
        topic: Topic,
        message: &Message,
    ) -> Result<PublishOutcome, ExecutionError> {
        self.try_publish_with(topic, message, &mut |_| {})
    }

    /// Same as [`try_publish`](Self::try_publish) but reports each delivered
    /// subscription, letting the executor arm readiness inline.
    pub fn try_publish_with(
        &self,
        topic: Topic,
        message: &Message,
        on_delivered: &mut dyn FnMut(&Arc<Subscription>),
    ) -> Result<PublishOutcome, ExecutionError> {
        let Some(list) = self.snapshot(topic) else {
            return Ok(PublishOutcome::default());
        };

        // Gate first: topics have a single producer, so space observed here
        // cannot be taken by anyone else before the delivery pass.
        for subscription in list.iter() {
            if subscription.block_producer
                && !subscription.is_tombstoned()
                && subscription.queue_len() >= subscription.queue.capacity()
            {
                return Err(ExecutionError::WouldBlock);
            }
        }

        let mut outcome = PublishOutcome::default();
        for subscription in list.iter() {
            if subscription.is_tombstoned() {
                continue;
            }
            let mut delivery = *message;
            delivery.port = subscription.port;
            match subscription.deliver(delivery) {
                Ok(()) => {
                    subscription.delivered.fetch_add(1, Ordering::Relaxed);
                    outcome.delivered += 1;
                    on_delivered(subscription);
                }
                Err(_) => {
                    subscription.drops.fetch_add(1, Ordering::Relaxed);
                    outcome.dropped += 1;
                }
            }
        }
        if outcome.dropped > 0 {
            counter!("tickflow_broker_dropped", outcome.dropped as u64);
        }
        Ok(outcome)
    }

    /// Publishes, spinning through `WouldBlock` with a cooperative backoff
    /// (pause a few rounds, then yield). A `deadline` turns an endless wait
    /// into `Timeout`.
    pub fn publish_deadline(
        &self,
        topic: Topic,
        message: &Message,
        deadline: Option<Instant>,
    ) -> Result<PublishOutcome, ExecutionError> {
        let backoff = Backoff::new();
        loop {
            match self.try_publish(topic, message) {
                Err(ExecutionError::WouldBlock) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Err(ExecutionError::Timeout);
                        }
                    }
                    backoff.snooze();
                }
                other => return other,
            }
        }
    }

    pub fn subscription(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.subscriptions.read().get(&id).cloned()
    }

    /// Every live subscription feeding `node`, in creation order.
    pub fn subscriptions_for_node(&self, node: NodeId) -> Vec<Arc<Subscription>> {
        let mut list: Vec<_> = self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.node == node && !s.is_tombstoned())
            .cloned()
            .collect();
        list.sort_by_key(|s| s.id);
        list
    }
}
