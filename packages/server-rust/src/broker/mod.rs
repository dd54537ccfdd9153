//! Broker adapters and the channel pool built on top of them.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;
pub mod pool;

use std::sync::Arc;

use courier_core::Broker;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;
pub use pool::{ChannelLease, ChannelPool, PoolStats};

use crate::config::{BrokerConfig, BrokerKind};

/// Builds the broker adapter selected by configuration. Does not connect.
///
/// # Errors
///
/// Returns an error when AMQP is requested but the crate was built without
/// the `amqp` feature.
pub fn from_config(config: &BrokerConfig) -> anyhow::Result<Arc<dyn Broker>> {
    match config.kind {
        BrokerKind::Memory => Ok(Arc::new(MemoryBroker::new())),
        #[cfg(feature = "amqp")]
        BrokerKind::Amqp => Ok(Arc::new(AmqpBroker::new(config.amqp_uri.clone()))),
        #[cfg(not(feature = "amqp"))]
        BrokerKind::Amqp => anyhow::bail!("built without the `amqp` feature"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_kind_builds_memory_broker() {
        let config = BrokerConfig {
            kind: BrokerKind::Memory,
            ..BrokerConfig::default()
        };
        let broker = from_config(&config).unwrap();
        assert_eq!(broker.kind(), "memory");
        assert!(broker.is_connected());
    }
}
