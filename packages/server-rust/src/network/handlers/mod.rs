//! HTTP handlers and the per-role state they run against.
//!
//! Each role gets its own router with its own state type; the network
//! module merges the routers a process serves. Cloning any of the state
//! types is cheap: everything shared sits behind an `Arc`.

pub mod consume;
pub mod health;
pub mod send_message;

pub use consume::consume_handler;
pub use health::{health_handler, liveness_handler, readiness_handler};
pub use send_message::send_message_handler;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::FromRef;
use axum::routing::{get, post};
use axum::Router;
use courier_core::{SchemaMode, TokenIssuer, TokenValidator};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{GatewayClient, ShutdownController};
use crate::broker::ChannelPool;
use crate::config::Role;
use crate::relay::{Consumer, MessageFeed, Publisher};

/// State shared by the health endpoints.
#[derive(Clone)]
pub struct AppState {
    /// Graceful shutdown controller with health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
    pub pool: Arc<ChannelPool>,
    pub role: Role,
}

/// State behind `POST /send-message`.
#[derive(Clone)]
pub struct GatewayContext {
    pub validator: Arc<TokenValidator>,
    pub publisher: Arc<Publisher>,
    pub queue: Arc<str>,
    pub schema_mode: SchemaMode,
}

impl FromRef<GatewayContext> for Arc<TokenValidator> {
    fn from_ref(ctx: &GatewayContext) -> Self {
        Arc::clone(&ctx.validator)
    }
}

/// State behind `GET /consume`.
#[derive(Clone)]
pub struct RelayContext {
    pub issuer: Arc<TokenIssuer>,
    pub gateway: GatewayClient,
    pub consumer: Arc<Consumer>,
    /// Set in continuous mode; `/consume` then reads the buffer instead of
    /// opening a window.
    pub feed: Option<Arc<MessageFeed>>,
    pub queue: Arc<str>,
    pub window: Duration,
    pub caller_id: Arc<str>,
    pub probe_payload: Arc<Value>,
    /// Cancelled on shutdown so open windows close early.
    pub shutdown: CancellationToken,
}

pub fn health_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .with_state(state)
}

pub fn gateway_router(ctx: GatewayContext) -> Router {
    Router::new()
        .route("/send-message", post(send_message_handler))
        .with_state(ctx)
}

pub fn relay_router(ctx: RelayContext) -> Router {
    Router::new()
        .route("/consume", get(consume_handler))
        .with_state(ctx)
}
