//! Publishes envelopes to a durable queue through the default exchange.

use std::sync::Arc;

use courier_core::{Envelope, EventKind, PublishOptions, QueueSpec};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::ChannelPool;
use crate::error::RelayError;
use crate::telemetry;

/// What a successful publish reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub queue: String,
    pub message_id: String,
    pub kind: EventKind,
    pub bytes: usize,
    /// Whether the broker acknowledged the message (publisher confirms on).
    pub confirmed: bool,
}

/// Hands envelopes to the broker with persistent, non-mandatory delivery.
#[derive(Debug)]
pub struct Publisher {
    pool: Arc<ChannelPool>,
    options: PublishOptions,
}

impl Publisher {
    /// Creates a publisher. With `confirms` set every publish waits for the
    /// broker ack and a nack is reported as a transport failure.
    #[must_use]
    pub fn new(pool: Arc<ChannelPool>, confirms: bool) -> Self {
        Self {
            pool,
            options: PublishOptions {
                mandatory: false,
                confirm: confirms,
            },
        }
    }

    /// Declares `queue` and publishes `envelope` to it.
    ///
    /// # Errors
    ///
    /// [`RelayError::TransportFailure`] for connection, channel and pool
    /// failures, [`RelayError::QueueConflict`] if `queue` exists with other
    /// properties.
    #[tracing::instrument(skip(self, envelope), fields(kind = envelope.kind().as_str()))]
    pub async fn publish(&self, queue: &str, envelope: &Envelope) -> Result<PublishReceipt, RelayError> {
        self.try_publish(queue, envelope).await.map_err(|err| {
            let reason = err.label();
            warn!(queue, reason, error = %err, "publish failed");
            telemetry::record_publish_failure(queue, reason);
            err
        })
    }

    async fn try_publish(&self, queue: &str, envelope: &Envelope) -> Result<PublishReceipt, RelayError> {
        let mut lease = self.pool.acquire().await?;
        lease.declare_queue(&QueueSpec::durable(queue)).await?;

        let body = envelope.encode()?;
        let message_id = Uuid::new_v4().to_string();
        let mut properties = envelope.properties();
        properties.message_id = Some(message_id.clone());

        lease.publish(queue, &body, &properties, self.options).await?;

        debug!(queue, %message_id, bytes = body.len(), "published");
        telemetry::record_published(queue, envelope.kind());
        Ok(PublishReceipt {
            queue: queue.to_string(),
            message_id,
            kind: envelope.kind(),
            bytes: body.len(),
            confirmed: self.options.confirm,
        })
    }
}
