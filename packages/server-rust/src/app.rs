//! Process assembly: wires the broker, pool, role contexts and network module.

use std::future::Future;
use std::sync::Arc;

use courier_core::{Broker, BrokerError, ClockSource, QueueSpec, SystemClock};
use tracing::{info, warn};

use crate::broker::{self, ChannelPool};
use crate::config::Settings;
use crate::network::{GatewayClient, GatewayContext, NetworkModule, RelayContext};
use crate::relay::{Consumer, MessageFeed, Publisher};

/// Builds every component for `settings.role` on top of `broker` and binds
/// the listener. Returns the module, ready to serve, and the bound port.
///
/// # Errors
///
/// Returns an error if the port cannot be bound, a signing key is
/// unusable, the HTTP client cannot be built, or the queue exists with
/// conflicting properties.
pub async fn launch(
    settings: &Settings,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn ClockSource>,
) -> anyhow::Result<(NetworkModule, u16)> {
    let role = settings.role;
    let queue: Arc<str> = Arc::from(settings.broker.queue.as_str());
    let pool = Arc::new(ChannelPool::new(broker, settings.broker.pool));

    warm_up(&pool, &queue).await?;

    let mut module = NetworkModule::new(settings.network.clone(), Arc::clone(&pool), role);
    let port = module.start().await?;

    if role.serves_gateway() {
        let ctx = GatewayContext {
            validator: Arc::new(settings.auth.validator(Arc::clone(&clock))?),
            publisher: Arc::new(Publisher::new(
                Arc::clone(&pool),
                settings.gateway.publisher_confirms,
            )),
            queue: Arc::clone(&queue),
            schema_mode: settings.gateway.schema_mode,
        };
        module = module.with_gateway(ctx);
    }

    if role.serves_relay() {
        let gateway_url = settings
            .relay
            .gateway_url
            .clone()
            .unwrap_or_else(|| settings.network.local_url(port));
        let shutdown = module.shutdown_controller().child_token();

        let feed = settings.relay.continuous.then(|| {
            Arc::new(MessageFeed::start(
                Arc::clone(&pool),
                &*queue,
                settings.relay.feed_capacity,
                shutdown.clone(),
            ))
        });

        info!(gateway = %gateway_url, continuous = feed.is_some(), "relay configured");
        let ctx = RelayContext {
            issuer: Arc::new(settings.auth.issuer(clock)?),
            gateway: GatewayClient::new(gateway_url, settings.network.request_timeout)?,
            consumer: Arc::new(Consumer::new(Arc::clone(&pool))),
            feed,
            queue: Arc::clone(&queue),
            window: settings.relay.window,
            caller_id: Arc::from(settings.relay.caller_id.as_str()),
            probe_payload: Arc::new(settings.relay.probe_payload.clone()),
            shutdown,
        };
        module = module.with_relay(ctx);
    }

    Ok((module, port))
}

/// Declares the queue once up front so misconfiguration shows at startup.
///
/// An unreachable broker is only logged: requests fail with 503 and the
/// readiness probe reports not-ready until it comes back.
async fn warm_up(pool: &ChannelPool, queue: &str) -> anyhow::Result<()> {
    let result = match pool.acquire().await {
        Ok(mut lease) => lease.declare_queue(&QueueSpec::durable(queue)).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(declared) => {
            info!(
                queue,
                broker = pool.broker().kind(),
                messages = declared.message_count,
                consumers = declared.consumer_count,
                "queue declared"
            );
            Ok(())
        }
        Err(BrokerError::QueueConflict { queue, detail }) => {
            anyhow::bail!("queue {queue} already exists with different properties: {detail}")
        }
        Err(e) => {
            warn!(queue, error = %e, "broker not reachable at startup; will retry per request");
            Ok(())
        }
    }
}

/// Runs one process until `shutdown` resolves.
///
/// # Errors
///
/// Anything [`launch`] or [`NetworkModule::serve`] reports.
pub async fn run(
    settings: Settings,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let broker = broker::from_config(&settings.broker)?;
    let (module, port) = launch(&settings, broker, Arc::new(SystemClock)).await?;
    info!(
        role = settings.role.as_str(),
        port,
        queue = %settings.broker.queue,
        "courier ready"
    );
    module.serve(shutdown).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_core::USER_UPDATES_QUEUE;

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::Role;

    fn settings(role: Role) -> Settings {
        let mut settings = Settings::new(role, "app-test-key");
        settings.network.host = "127.0.0.1".to_string();
        settings.relay.window = Duration::from_millis(50);
        settings
    }

    #[tokio::test]
    async fn launch_declares_queue_and_binds() {
        let broker = MemoryBroker::new();
        let (_module, port) = launch(
            &settings(Role::Gateway),
            Arc::new(broker.clone()),
            Arc::new(SystemClock),
        )
        .await
        .unwrap();
        assert!(port > 0);
        assert_eq!(broker.queue_depth(USER_UPDATES_QUEUE), Some(0));
    }

    #[tokio::test]
    async fn unavailable_broker_does_not_block_startup() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let launched = launch(
            &settings(Role::Standalone),
            Arc::new(broker),
            Arc::new(SystemClock),
        )
        .await;
        assert!(launched.is_ok());
    }

    #[tokio::test]
    async fn conflicting_queue_fails_startup() {
        let broker = MemoryBroker::new();
        let mut channel = broker.open_channel().await.unwrap();
        channel
            .declare_queue(&QueueSpec {
                durable: false,
                ..QueueSpec::durable(USER_UPDATES_QUEUE)
            })
            .await
            .unwrap();

        let err = launch(
            &settings(Role::Gateway),
            Arc::new(broker.clone()),
            Arc::new(SystemClock),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("different properties"));
    }
}
