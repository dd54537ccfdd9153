//! Windowed queue drain with manual, per-delivery acknowledgment.

use std::sync::Arc;
use std::time::Duration;

use courier_core::{BrokerError, Delivery, Envelope, QueueSpec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{ChannelLease, ChannelPool};
use crate::error::RelayError;
use crate::telemetry;

/// What to do with a delivery once its body has been inspected.
pub(crate) enum Decoded {
    /// A readable envelope: hand the body text on, then ack.
    Text(String),
    /// Not UTF-8, not JSON, or tagged with a kind or schema version this
    /// build does not know: reject without requeue so it cannot loop forever.
    Poison,
}

/// Checks a delivery against the envelope contract, logging and counting
/// poison messages. The body text is passed on verbatim.
pub(crate) fn decode(queue: &str, delivery: &Delivery) -> Decoded {
    let text = match std::str::from_utf8(&delivery.body) {
        Ok(text) => text,
        Err(e) => return poison(queue, delivery, &e),
    };
    match Envelope::decode(&delivery.body, &delivery.properties) {
        Ok(_) => Decoded::Text(text.to_owned()),
        Err(e) => poison(queue, delivery, &e),
    }
}

fn poison(queue: &str, delivery: &Delivery, error: &dyn std::fmt::Display) -> Decoded {
    warn!(
        queue,
        tag = %delivery.tag,
        kind = delivery.properties.kind.as_deref(),
        error = %error,
        "rejecting undecodable delivery"
    );
    telemetry::record_rejected_delivery(queue);
    Decoded::Poison
}

/// Declares `queue` on a fresh lease and subscribes to it with manual acks.
pub(crate) async fn subscribe(
    pool: &ChannelPool,
    queue: &str,
    purpose: &str,
) -> Result<ChannelLease, BrokerError> {
    let mut lease = pool.acquire().await?;
    lease.declare_queue(&QueueSpec::durable(queue)).await?;
    let consumer_tag = format!("courier-{purpose}-{}", Uuid::new_v4());
    lease.subscribe(queue, &consumer_tag).await?;
    Ok(lease)
}

/// Cancels the subscription and closes the channel, returning anything
/// still unacknowledged to the queue.
pub(crate) async fn release(mut lease: ChannelLease, queue: &str) {
    if let Err(e) = lease.cancel().await {
        debug!(queue, error = %e, "cancel failed; closing anyway");
    }
    if let Err(e) = lease.close().await {
        debug!(queue, error = %e, "channel close failed");
    }
}

/// Collects deliveries from a queue for a bounded window.
#[derive(Debug)]
pub struct Consumer {
    pool: Arc<ChannelPool>,
}

impl Consumer {
    #[must_use]
    pub fn new(pool: Arc<ChannelPool>) -> Self {
        Self { pool }
    }

    /// Drains `queue` for `window` and returns the payloads in receipt order.
    ///
    /// # Errors
    ///
    /// See [`Consumer::drain_until`].
    pub async fn drain(&self, queue: &str, window: Duration) -> Result<Vec<String>, RelayError> {
        self.drain_until(queue, window, &CancellationToken::new()).await
    }

    /// Drains `queue` until `window` elapses or `cancel` fires.
    ///
    /// Each delivery is recorded and then acknowledged by its own tag. On the
    /// way out the subscription is cancelled and the channel closed, so
    /// anything received but not yet acknowledged goes back to the queue.
    /// Dropping the returned future mid-window has the same effect.
    ///
    /// # Errors
    ///
    /// [`RelayError::TransportFailure`] if the channel cannot be set up or
    /// fails mid-window, [`RelayError::QueueConflict`] if the queue exists
    /// with other properties.
    #[tracing::instrument(skip(self, cancel), fields(window_ms = window.as_millis()))]
    pub async fn drain_until(
        &self,
        queue: &str,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, RelayError> {
        let mut lease = subscribe(&self.pool, queue, "drain").await?;
        let collected = collect(&mut lease, queue, window, cancel).await;
        release(lease, queue).await;

        let messages = collected?;
        debug!(queue, count = messages.len(), "drain finished");
        Ok(messages)
    }
}

async fn collect(
    lease: &mut ChannelLease,
    queue: &str,
    window: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<String>, RelayError> {
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    let mut messages = Vec::new();
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = &mut deadline => break,
            next = lease.next_delivery() => next,
        };
        let delivery = match next {
            Ok(Some(delivery)) => delivery,
            Ok(None) => break,
            Err(e) => return cut_short(queue, messages, e),
        };

        debug!(queue, tag = %delivery.tag, redelivered = delivery.redelivered, "received");
        let settled = match decode(queue, &delivery) {
            Decoded::Text(text) => {
                messages.push(text);
                lease.ack(delivery.tag).await.map(|()| telemetry::record_drained(queue))
            }
            Decoded::Poison => lease.reject(delivery.tag, false).await,
        };
        if let Err(e) = settled {
            return cut_short(queue, messages, e);
        }
    }
    Ok(messages)
}

/// Ends a window on a channel failure.
///
/// Payloads already collected may have been acknowledged and so exist
/// nowhere else; they are returned and the failure only logged. With
/// nothing collected the failure is reported.
fn cut_short(
    queue: &str,
    messages: Vec<String>,
    err: BrokerError,
) -> Result<Vec<String>, RelayError> {
    if messages.is_empty() {
        return Err(err.into());
    }
    warn!(
        queue,
        collected = messages.len(),
        error = %err,
        "channel failed mid-window; returning what was collected"
    );
    Ok(messages)
}
