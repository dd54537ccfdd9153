//! Queue, delivery and broker error types shared by publisher and consumer.
//!
//! The vocabulary follows AMQP 0-9-1: queues are declared with durability
//! flags, messages go through the default exchange with the queue name as
//! routing key, and deliveries are acknowledged by channel-scoped tags.

use std::fmt;

/// Queue the gateway publishes user updates to.
pub const USER_UPDATES_QUEUE: &str = "user_updates";

// ---------------------------------------------------------------------------
// QueueSpec
// ---------------------------------------------------------------------------

/// Declaration properties of a queue.
///
/// Redeclaring a queue with identical properties is a no-op; any difference
/// is a [`BrokerError::QueueConflict`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueSpec {
    pub name: String,
    /// Survives a broker restart.
    pub durable: bool,
    /// Usable only by the declaring connection.
    pub exclusive: bool,
    /// Deleted once its last consumer is cancelled.
    pub auto_delete: bool,
}

impl QueueSpec {
    /// Durable, shared, never auto-deleted. The shape both services declare.
    #[must_use]
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Whether redeclaring `self` over an existing `other` must fail.
    #[must_use]
    pub fn conflicts_with(&self, other: &QueueSpec) -> bool {
        self.durable != other.durable
            || self.exclusive != other.exclusive
            || self.auto_delete != other.auto_delete
    }

    /// Human-readable list of the differing properties, used in conflict errors.
    #[must_use]
    pub fn describe_conflict(&self, existing: &QueueSpec) -> String {
        let mut parts = Vec::new();
        if self.durable != existing.durable {
            parts.push(format!("durable={} (existing {})", self.durable, existing.durable));
        }
        if self.exclusive != existing.exclusive {
            parts.push(format!("exclusive={} (existing {})", self.exclusive, existing.exclusive));
        }
        if self.auto_delete != existing.auto_delete {
            parts.push(format!(
                "auto_delete={} (existing {})",
                self.auto_delete, existing.auto_delete
            ));
        }
        parts.join(", ")
    }
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self::durable(USER_UPDATES_QUEUE)
    }
}

/// Result of a successful queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    /// Messages ready for delivery (excludes unacknowledged ones).
    pub message_count: u32,
    pub consumer_count: u32,
}

// ---------------------------------------------------------------------------
// Messages and deliveries
// ---------------------------------------------------------------------------

/// AMQP delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Held in memory only; lost on broker restart.
    #[default]
    Transient,
    /// Written to disk by the broker; survives restart when the queue is durable.
    Persistent,
}

impl DeliveryMode {
    /// The numeric AMQP value (1 or 2).
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Transient => 1,
            Self::Persistent => 2,
        }
    }

    /// Reads an AMQP delivery mode; anything but 2 is transient.
    #[must_use]
    pub fn from_u8(mode: u8) -> Self {
        if mode == 2 {
            Self::Persistent
        } else {
            Self::Transient
        }
    }
}

/// Message properties travelling alongside the body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    /// Event kind label (AMQP `type` property).
    pub kind: Option<String>,
    /// Envelope schema version (`x-schema-version` header).
    pub schema_version: Option<u32>,
    pub delivery_mode: DeliveryMode,
    pub message_id: Option<String>,
}

/// Per-publish flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    /// Fail instead of dropping when no queue matches the routing key.
    pub mandatory: bool,
    /// Wait for a broker ack before reporting success.
    pub confirm: bool,
}

/// Channel-scoped identifier of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a consumer, pending acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    /// Set when the message was delivered before and not acknowledged.
    pub redelivered: bool,
}

// ---------------------------------------------------------------------------
// BrokerError
// ---------------------------------------------------------------------------

/// Failures talking to the broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker transport failure: {0}")]
    Transport(String),
    #[error("queue {queue} already declared with different properties: {detail}")]
    QueueConflict { queue: String, detail: String },
    #[error("no queue bound for routing key {routing_key}")]
    Unroutable { routing_key: String },
    #[error("queue {queue} does not exist")]
    QueueNotFound { queue: String },
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(DeliveryTag),
    #[error("broker refused message for {routing_key}")]
    Nacked { routing_key: String },
    #[error("channel is closed")]
    ChannelClosed,
    #[error("no broker channel available after {waited_ms}ms")]
    Exhausted { waited_ms: u64 },
}

impl BrokerError {
    /// Whether the same call may succeed if retried later without operator action.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::ChannelClosed | Self::Exhausted { .. } | Self::Nacked { .. }
        )
    }

    /// Short, stable label for logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::QueueConflict { .. } => "queue_conflict",
            Self::Unroutable { .. } => "unroutable",
            Self::QueueNotFound { .. } => "queue_not_found",
            Self::UnknownDeliveryTag(_) => "unknown_delivery_tag",
            Self::Nacked { .. } => "nacked",
            Self::ChannelClosed => "channel_closed",
            Self::Exhausted { .. } => "exhausted",
        }
    }
}
