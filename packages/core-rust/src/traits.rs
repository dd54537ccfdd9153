use async_trait::async_trait;

use crate::queue::{
    BrokerError, Delivery, DeliveryTag, MessageProperties, PublishOptions, QueueInfo, QueueSpec,
};

/// A connection to a message broker that hands out channels.
///
/// Implementations own connection lifecycle, including reconnecting after
/// the broker drops them. Callers only ever see channels.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a fresh channel, reconnecting first if the connection is gone.
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError>;

    /// Whether the underlying connection is currently up.
    fn is_connected(&self) -> bool;

    /// Short label for logs and health output (`amqp`, `memory`).
    fn kind(&self) -> &'static str;
}

/// One logical channel on a broker connection.
///
/// Delivery tags are scoped to the channel that received them. Closing or
/// dropping a channel returns its unacknowledged deliveries to their queue.
#[async_trait]
pub trait BrokerChannel: Send {
    /// Idempotently declares a queue.
    async fn declare_queue(&mut self, spec: &QueueSpec) -> Result<QueueInfo, BrokerError>;

    /// Publishes `body` through the default exchange with `routing_key`.
    async fn publish(
        &mut self,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
        options: PublishOptions,
    ) -> Result<(), BrokerError>;

    /// Registers a manual-ack consumer on `queue`.
    async fn subscribe(&mut self, queue: &str, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Waits for the next delivery of the active subscription.
    ///
    /// Returns `Ok(None)` once the subscription has been cancelled.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledges a single delivery.
    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Rejects a single delivery, optionally putting it back on the queue.
    async fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    /// Cancels the active subscription. Pending unacknowledged deliveries stay
    /// outstanding until acked, rejected or the channel closes.
    async fn cancel(&mut self) -> Result<(), BrokerError>;

    /// Closes the channel, requeueing anything still unacknowledged.
    async fn close(&mut self) -> Result<(), BrokerError>;

    /// Whether the channel can still be used.
    fn is_open(&self) -> bool;
}
