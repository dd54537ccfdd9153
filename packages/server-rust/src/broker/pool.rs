//! Bounded pool of broker channels shared by every request.
//!
//! A semaphore caps the number of channels leased at once. Released channels
//! go back to an idle list (up to `max_idle`) and are reused by the next
//! acquirer; a channel that failed an operation, holds a subscription or was
//! closed by the broker is dropped instead.

use std::sync::Arc;
use std::time::Instant;

use courier_core::{
    Broker, BrokerChannel, BrokerError, Delivery, DeliveryTag, MessageProperties, PublishOptions,
    QueueInfo, QueueSpec,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::PoolConfig;

type IdleList = Arc<Mutex<Vec<Box<dyn BrokerChannel>>>>;

/// Point-in-time pool usage, reported by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_channels: usize,
    pub leased: usize,
    pub idle: usize,
}

/// Process-wide channel pool over a single broker connection.
pub struct ChannelPool {
    broker: Arc<dyn Broker>,
    permits: Arc<Semaphore>,
    idle: IdleList,
    config: PoolConfig,
}

impl ChannelPool {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, config: PoolConfig) -> Self {
        Self {
            broker,
            permits: Arc::new(Semaphore::new(config.max_channels)),
            idle: Arc::new(Mutex::new(Vec::new())),
            config,
        }
    }

    /// The broker channels are opened on.
    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Leases a channel, reusing an idle one when possible.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Exhausted`] if no permit frees up within the configured
    /// acquire timeout, or whatever opening a new channel fails with.
    pub async fn acquire(&self) -> Result<ChannelLease, BrokerError> {
        let started = Instant::now();
        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| BrokerError::Exhausted {
            waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })?
        .map_err(|_| BrokerError::ChannelClosed)?;

        let channel = match self.take_idle() {
            Some(channel) => channel,
            None => self.broker.open_channel().await?,
        };

        Ok(ChannelLease {
            channel: Some(channel),
            idle: Arc::clone(&self.idle),
            max_idle: self.config.max_idle,
            reusable: true,
            _permit: permit,
        })
    }

    fn take_idle(&self) -> Option<Box<dyn BrokerChannel>> {
        let mut idle = self.idle.lock();
        while let Some(channel) = idle.pop() {
            if channel.is_open() {
                return Some(channel);
            }
            debug!("discarding closed idle channel");
        }
        None
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_channels: self.config.max_channels,
            leased: self
                .config
                .max_channels
                .saturating_sub(self.permits.available_permits()),
            idle: self.idle.lock().len(),
        }
    }
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("broker", &self.broker.kind())
            .field("stats", &self.stats())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ChannelLease
// ---------------------------------------------------------------------------

/// RAII handle on a pooled channel.
///
/// Dropping the lease returns the channel to the idle list if it is still
/// healthy, otherwise drops (and thereby closes) it. The pool permit is
/// released either way.
pub struct ChannelLease {
    channel: Option<Box<dyn BrokerChannel>>,
    idle: IdleList,
    max_idle: usize,
    reusable: bool,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLease")
            .field("open", &self.channel.is_some())
            .field("reusable", &self.reusable)
            .finish_non_exhaustive()
    }
}

impl ChannelLease {
    fn inner(&mut self) -> Result<&mut Box<dyn BrokerChannel>, BrokerError> {
        self.channel.as_mut().ok_or(BrokerError::ChannelClosed)
    }

    fn track<T>(&mut self, result: Result<T, BrokerError>) -> Result<T, BrokerError> {
        if result.is_err() {
            self.reusable = false;
        }
        result
    }

    /// See [`BrokerChannel::declare_queue`].
    ///
    /// # Errors
    ///
    /// Propagates the channel error; the channel is then not reused.
    pub async fn declare_queue(&mut self, spec: &QueueSpec) -> Result<QueueInfo, BrokerError> {
        let result = self.inner()?.declare_queue(spec).await;
        self.track(result)
    }

    /// See [`BrokerChannel::publish`].
    ///
    /// # Errors
    ///
    /// Propagates the channel error; the channel is then not reused.
    pub async fn publish(
        &mut self,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        let result = self
            .inner()?
            .publish(routing_key, body, properties, options)
            .await;
        self.track(result)
    }

    /// Subscribes on this channel. A subscribed channel is never returned to
    /// the idle list.
    ///
    /// # Errors
    ///
    /// Propagates the channel error.
    pub async fn subscribe(&mut self, queue: &str, consumer_tag: &str) -> Result<(), BrokerError> {
        self.reusable = false;
        self.inner()?.subscribe(queue, consumer_tag).await
    }

    /// See [`BrokerChannel::next_delivery`].
    ///
    /// # Errors
    ///
    /// Propagates the channel error.
    pub async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError> {
        let result = self.inner()?.next_delivery().await;
        self.track(result)
    }

    /// See [`BrokerChannel::ack`].
    ///
    /// # Errors
    ///
    /// Propagates the channel error.
    pub async fn ack(&mut self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let result = self.inner()?.ack(tag).await;
        self.track(result)
    }

    /// See [`BrokerChannel::reject`].
    ///
    /// # Errors
    ///
    /// Propagates the channel error.
    pub async fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let result = self.inner()?.reject(tag, requeue).await;
        self.track(result)
    }

    /// See [`BrokerChannel::cancel`].
    ///
    /// # Errors
    ///
    /// Propagates the channel error.
    pub async fn cancel(&mut self) -> Result<(), BrokerError> {
        let result = self.inner()?.cancel().await;
        self.track(result)
    }

    /// Closes the channel instead of returning it to the pool.
    ///
    /// # Errors
    ///
    /// Propagates the close error. The channel is gone either way.
    pub async fn close(mut self) -> Result<(), BrokerError> {
        match self.channel.take() {
            Some(mut channel) => channel.close().await,
            None => Ok(()),
        }
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        if !self.reusable || !channel.is_open() {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(channel);
        }
    }
}
