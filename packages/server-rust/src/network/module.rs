//! Network module with deferred startup lifecycle.
//!
//! `new()` allocates shared state, `start()` binds the TCP listener, and
//! `serve()` accepts connections. Between `start()` and `serve()` the
//! caller knows the bound port and attaches the role contexts, which is how
//! a standalone process points its relay at its own gateway.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::middleware::from_fn_with_state;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{gateway_router, health_router, relay_router, AppState, GatewayContext, RelayContext};
use super::middleware::{track_in_flight, with_http_layers};
use super::shutdown::ShutdownController;
use crate::broker::ChannelPool;
use crate::config::Role;

/// Manages the HTTP server lifecycle for one process.
pub struct NetworkModule {
    config: NetworkConfig,
    role: Role,
    pool: Arc<ChannelPool>,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
    gateway: Option<GatewayContext>,
    relay: Option<RelayContext>,
}

impl std::fmt::Debug for NetworkModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkModule")
            .field("role", &self.role)
            .field("bound", &self.listener.is_some())
            .field("gateway", &self.gateway.is_some())
            .field("relay", &self.relay.is_some())
            .finish_non_exhaustive()
    }
}

impl NetworkModule {
    /// Creates the module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, pool: Arc<ChannelPool>, role: Role) -> Self {
        Self {
            config,
            role,
            pool,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
            gateway: None,
            relay: None,
        }
    }

    /// Serves `POST /send-message` from `ctx`.
    #[must_use]
    pub fn with_gateway(mut self, ctx: GatewayContext) -> Self {
        self.gateway = Some(ctx);
        self
    }

    /// Serves `GET /consume` from `ctx`.
    #[must_use]
    pub fn with_relay(mut self, ctx: RelayContext) -> Self {
        self.relay = Some(ctx);
        self
    }

    /// Returns a shared reference to the shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the router: health endpoints always, role routes when
    /// their context is attached.
    ///
    /// Routes:
    /// - `GET /health`, `GET /health/live`, `GET /health/ready`
    /// - `POST /send-message` (gateway)
    /// - `GET /consume` (relay)
    pub fn build_router(&self) -> Router {
        let state = AppState {
            shutdown: Arc::clone(&self.shutdown),
            start_time: Instant::now(),
            pool: Arc::clone(&self.pool),
            role: self.role,
        };

        let mut router = health_router(state);
        if let Some(ctx) = &self.gateway {
            router = router.merge(gateway_router(ctx.clone()));
        }
        if let Some(ctx) = &self.relay {
            router = router.merge(relay_router(ctx.clone()));
        }

        let router = router.layer(from_fn_with_state(Arc::clone(&self.shutdown), track_in_flight));
        with_http_layers(router, &self.config)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which differs from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, role = self.role.as_str(), "TCP listener bound");

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until `shutdown` resolves, then drains.
    ///
    /// After the signal the health state moves to Draining, every child
    /// token is cancelled so open collection windows close, and in-flight
    /// requests get up to `drain_timeout` to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server hits
    /// a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let Some(listener) = self.listener.take() else {
            anyhow::bail!("start() must be called before serve()");
        };
        let router = self.build_router();
        let controller = Arc::clone(&self.shutdown);
        let signal_controller = Arc::clone(&self.shutdown);

        controller.set_ready();
        info!("serving HTTP");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                // Cancel open windows now so their requests can finish.
                signal_controller.trigger_shutdown();
            })
            .await?;

        controller.trigger_shutdown();
        if controller.wait_for_drain(self.config.drain_timeout).await {
            info!("all in-flight requests drained");
        } else {
            warn!("drain timeout expired with in-flight requests remaining");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::PoolConfig;
    use crate::network::HealthState;

    fn module(role: Role) -> NetworkModule {
        let pool = Arc::new(ChannelPool::new(
            Arc::new(MemoryBroker::new()),
            PoolConfig::default(),
        ));
        NetworkModule::new(NetworkConfig::default(), pool, role)
    }

    #[test]
    fn new_creates_module_without_binding() {
        let module = module(Role::Gateway);
        assert!(module.listener.is_none());
    }

    #[test]
    fn shutdown_controller_returns_shared_arc() {
        let module = module(Role::Gateway);
        assert!(Arc::ptr_eq(
            &module.shutdown_controller(),
            &module.shutdown_controller()
        ));
    }

    #[tokio::test]
    async fn router_without_contexts_serves_only_health() {
        let router = module(Role::Relay).build_router();

        let live = router
            .clone()
            .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(live.status(), StatusCode::OK);
        assert!(live.headers().contains_key("x-request-id"));

        let consume = router
            .oneshot(Request::builder().uri("/consume").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(consume.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = module(Role::Gateway);
        let port = module.start().await.unwrap();
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let err = module(Role::Gateway)
            .serve(std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn serve_stops_on_signal_and_reports_stopped() {
        let mut module = module(Role::Standalone);
        module.start().await.unwrap();
        let controller = module.shutdown_controller();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let server = tokio::spawn(module.serve(async move {
            let _ = rx.await;
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.health_state(), HealthState::Ready);

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(controller.health_state(), HealthState::Stopped);
        assert!(controller.is_shutting_down());
    }
}
