//! In-process broker with AMQP 0-9-1 queue semantics.
//!
//! Used by tests and by `standalone` runs without a real broker. Models the
//! parts of AMQP the relay depends on: idempotent queue declaration with
//! conflict detection, default-exchange routing, round-robin dispatch to
//! manual-ack consumers, channel-scoped delivery tags, requeue of
//! unacknowledged deliveries when a channel closes, and durability across a
//! simulated broker restart.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{
    Broker, BrokerChannel, BrokerError, Delivery, DeliveryMode, DeliveryTag, MessageProperties,
    PublishOptions, QueueInfo, QueueSpec,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

// ---------------------------------------------------------------------------
// Broker state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct Subscriber {
    channel_id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    subscribers: Vec<Subscriber>,
    next_subscriber: usize,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            subscribers: Vec::new(),
            next_subscriber: 0,
        }
    }
}

#[derive(Default)]
struct ChannelState {
    epoch: u64,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
    subscription: Option<String>,
}

#[derive(Default)]
struct BrokerState {
    /// `false` while the simulated connection is down.
    available: bool,
    /// Bumped whenever every open channel must be invalidated.
    epoch: u64,
    reject_publishes: bool,
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
    next_channel_id: u64,
}

impl BrokerState {
    fn check_available(&self) -> Result<(), BrokerError> {
        if self.available {
            Ok(())
        } else {
            Err(BrokerError::Transport("connection refused".to_string()))
        }
    }

    fn channel_valid(&self, id: u64) -> bool {
        self.available && self.channels.get(&id).is_some_and(|c| c.epoch == self.epoch)
    }

    /// Hands ready messages to subscribers of `queue` until one side runs out.
    fn dispatch(&mut self, queue: &str) {
        let Self {
            queues, channels, ..
        } = self;
        let Some(state) = queues.get_mut(queue) else {
            return;
        };

        while !state.ready.is_empty() && !state.subscribers.is_empty() {
            let index = state.next_subscriber % state.subscribers.len();
            let channel_id = state.subscribers[index].channel_id;
            let Some(channel) = channels.get_mut(&channel_id) else {
                state.subscribers.remove(index);
                continue;
            };
            let Some(message) = state.ready.pop_front() else {
                break;
            };

            channel.next_tag += 1;
            let tag = channel.next_tag;
            let delivery = Delivery {
                tag: DeliveryTag(tag),
                body: message.body.clone(),
                properties: message.properties.clone(),
                redelivered: message.redelivered,
            };

            if state.subscribers[index].tx.send(delivery).is_err() {
                // Receiver gone: drop the subscriber and keep the message at the head.
                state.ready.push_front(message);
                state.subscribers.remove(index);
                continue;
            }
            channel.unacked.insert(tag, (queue.to_string(), message));
            state.next_subscriber = index + 1;
        }
    }

    /// Removes the channel, cancels its subscription, and requeues its
    /// unacknowledged deliveries at the head of their queues in tag order.
    fn release_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };
        if let Some(queue) = &channel.subscription {
            if let Some(state) = self.queues.get_mut(queue) {
                state.subscribers.retain(|s| s.channel_id != id);
            }
        }

        let mut touched = Vec::new();
        for (_, (queue, mut message)) in channel.unacked.into_iter().rev() {
            message.redelivered = true;
            if let Some(state) = self.queues.get_mut(&queue) {
                state.ready.push_front(message);
                if !touched.contains(&queue) {
                    touched.push(queue);
                }
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn release_all_channels(&mut self) {
        let ids: Vec<u64> = self.channels.keys().copied().collect();
        for id in ids {
            self.release_channel(id);
        }
        self.epoch += 1;
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// Shared handle to an in-process broker. Cloning shares the same queues.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Creates an empty, reachable broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                ..BrokerState::default()
            })),
        }
    }

    /// Simulates the connection going down (`false`) or coming back (`true`).
    ///
    /// Going down closes every channel, which requeues their unacknowledged
    /// deliveries exactly as a real broker does when a connection drops.
    pub fn set_available(&self, available: bool) {
        let mut state = self.state.lock();
        if !available && state.available {
            state.release_all_channels();
        }
        state.available = available;
    }

    /// Makes the broker refuse (nack) every confirmed publish.
    pub fn set_reject_publishes(&self, reject: bool) {
        self.state.lock().reject_publishes = reject;
    }

    /// Simulates a broker restart: every channel is closed, non-durable
    /// queues disappear and durable queues keep only persistent messages.
    pub fn restart(&self) {
        let mut state = self.state.lock();
        state.release_all_channels();
        state.queues.retain(|_, q| q.spec.durable);
        for queue in state.queues.values_mut() {
            queue
                .ready
                .retain(|m| m.properties.delivery_mode == DeliveryMode::Persistent);
        }
    }

    /// Number of messages ready for delivery on `queue`, `None` if undeclared.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Bodies of the messages ready on `queue`, head first.
    #[must_use]
    pub fn ready_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Properties of the messages ready on `queue`, head first.
    #[must_use]
    pub fn ready_properties(&self, queue: &str) -> Vec<MessageProperties> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.properties.clone()).collect())
            .unwrap_or_default()
    }

    /// Deliveries handed out on any channel and not yet acknowledged.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    /// Channels currently open.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.state.lock().channels.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBroker")
            .field("available", &state.available)
            .field("queues", &state.queues.len())
            .field("channels", &state.channels.len())
            .finish()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.next_channel_id += 1;
        let id = state.next_channel_id;
        let epoch = state.epoch;
        state.channels.insert(
            id,
            ChannelState {
                epoch,
                ..ChannelState::default()
            },
        );
        drop(state);

        debug!(channel = id, "opened in-memory channel");
        Ok(Box::new(MemoryChannel {
            id,
            state: Arc::clone(&self.state),
            deliveries: None,
            closed: false,
        }))
    }

    fn is_connected(&self) -> bool {
        self.state.lock().available
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

/// A channel on a [`MemoryBroker`]. Dropping it closes it.
pub struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    deliveries: Option<mpsc::UnboundedReceiver<Delivery>>,
    closed: bool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::ChannelClosed);
        }
        let state = self.state.lock();
        state.check_available()?;
        if state.channel_valid(self.id) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    /// Closes the channel as the broker does after a channel-level error.
    fn fail(&mut self, err: BrokerError) -> BrokerError {
        self.shutdown();
        err
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.deliveries = None;
        self.state.lock().release_channel(self.id);
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&mut self, spec: &QueueSpec) -> Result<QueueInfo, BrokerError> {
        self.ensure_open()?;
        let result = {
            let mut state = self.state.lock();
            let queue = state
                .queues
                .entry(spec.name.clone())
                .or_insert_with(|| QueueState::new(spec.clone()));
            if spec.conflicts_with(&queue.spec) {
                Err(BrokerError::QueueConflict {
                    queue: spec.name.clone(),
                    detail: spec.describe_conflict(&queue.spec),
                })
            } else {
                Ok(QueueInfo {
                    name: spec.name.clone(),
                    message_count: u32::try_from(queue.ready.len()).unwrap_or(u32::MAX),
                    consumer_count: u32::try_from(queue.subscribers.len()).unwrap_or(u32::MAX),
                })
            }
        };
        result.map_err(|e| self.fail(e))
    }

    async fn publish(
        &mut self,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if options.confirm && state.reject_publishes {
            return Err(BrokerError::Nacked {
                routing_key: routing_key.to_string(),
            });
        }
        let Some(queue) = state.queues.get_mut(routing_key) else {
            if options.mandatory {
                return Err(BrokerError::Unroutable {
                    routing_key: routing_key.to_string(),
                });
            }
            debug!(routing_key, "dropping unroutable message");
            return Ok(());
        };
        queue.ready.push_back(StoredMessage {
            body: body.to_vec(),
            properties: properties.clone(),
            redelivered: false,
        });
        state.dispatch(routing_key);
        Ok(())
    }

    async fn subscribe(&mut self, queue: &str, consumer_tag: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if self.deliveries.is_some() {
            return Err(BrokerError::Transport(format!(
                "channel already consuming; cannot register {consumer_tag}"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let result = {
            let mut state = self.state.lock();
            match state.queues.get_mut(queue) {
                Some(q) => {
                    q.subscribers.push(Subscriber {
                        channel_id: self.id,
                        tx,
                    });
                    if let Some(channel) = state.channels.get_mut(&self.id) {
                        channel.subscription = Some(queue.to_string());
                    }
                    state.dispatch(queue);
                    Ok(())
                }
                None => Err(BrokerError::QueueNotFound {
                    queue: queue.to_string(),
                }),
            }
        };
        match result {
            Ok(()) => {
                debug!(channel = self.id, queue, consumer_tag, "subscribed");
                self.deliveries = Some(rx);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError> {
        self.ensure_open()?;
        let Some(rx) = self.deliveries.as_mut() else {
            return Ok(None);
        };
        let next = rx.recv().await;
        // The connection may have dropped while waiting; anything received
        // after that has already been requeued.
        self.ensure_open()?;
        match next {
            Some(delivery) => Ok(Some(delivery)),
            None => Err(BrokerError::ChannelClosed),
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let removed = {
            let mut state = self.state.lock();
            state
                .channels
                .get_mut(&self.id)
                .and_then(|c| c.unacked.remove(&tag.0))
        };
        match removed {
            Some(_) => Ok(()),
            None => Err(self.fail(BrokerError::UnknownDeliveryTag(tag))),
        }
    }

    async fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let removed = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&tag.0));
        let Some((queue, mut message)) = removed else {
            drop(state);
            return Err(self.fail(BrokerError::UnknownDeliveryTag(tag)));
        };
        if requeue {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_front(message);
            }
            state.dispatch(&queue);
        }
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.deliveries = None;
        let mut state = self.state.lock();
        let subscription = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.subscription.take());
        if let Some(queue) = subscription {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.subscribers.retain(|s| s.channel_id != self.id);
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.shutdown();
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed && self.state.lock().channel_valid(self.id)
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
