//! `GET /consume`: push a probe through the gateway, then read the queue.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use super::RelayContext;
use crate::error::RelayError;

/// Mints a credential, posts the probe payload to the gateway and returns
/// what the queue yields.
///
/// In windowed mode this opens a subscription for the configured window
/// (cut short on shutdown); in continuous mode it returns whatever the
/// background feed has buffered.
pub async fn consume_handler(State(ctx): State<RelayContext>) -> Result<Json<Value>, RelayError> {
    let credential = ctx.issuer.issue(&ctx.caller_id)?;
    ctx.gateway
        .send_message(&credential, &ctx.probe_payload)
        .await?;

    let messages = match &ctx.feed {
        Some(feed) => feed.snapshot(),
        None => {
            ctx.consumer
                .drain_until(&ctx.queue, ctx.window, &ctx.shutdown)
                .await?
        }
    };

    info!(queue = %ctx.queue, count = messages.len(), "consume served");
    Ok(Json(json!({ "Messages": messages })))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::header::CONTENT_TYPE;
    use axum::http::{Request, StatusCode};
    use courier_core::{ManualClock, SigningSecret, TokenIssuer, USER_UPDATES_QUEUE};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use super::*;
    use crate::broker::{ChannelPool, MemoryBroker};
    use crate::config::PoolConfig;
    use crate::network::handlers::relay_router;
    use crate::network::GatewayClient;
    use crate::relay::Consumer;

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    fn context(gateway_url: String, broker: &MemoryBroker) -> RelayContext {
        let secret = SigningSecret::new("relay-test-key").unwrap();
        let pool = Arc::new(ChannelPool::new(Arc::new(broker.clone()), PoolConfig::default()));
        RelayContext {
            issuer: Arc::new(TokenIssuer::new(&secret, Arc::new(ManualClock::new(0)))),
            gateway: GatewayClient::new(gateway_url, Duration::from_secs(2)).unwrap(),
            consumer: Arc::new(Consumer::new(pool)),
            feed: None,
            queue: Arc::from(USER_UPDATES_QUEUE),
            window: Duration::from_millis(50),
            caller_id: Arc::from("123"),
            probe_payload: Arc::new(json!({"UserId": "user_123", "NewEmail": "newemail@example.com"})),
            shutdown: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn unreachable_gateway_is_502() {
        let broker = MemoryBroker::new();
        let url = format!("http://127.0.0.1:{}", closed_port().await);
        let response = relay_router(context(url, &broker))
            .oneshot(Request::builder().uri("/consume").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_ne!(response.headers()[CONTENT_TYPE], "application/problem+json");
        // The queue is never touched when the probe cannot be sent.
        assert_eq!(broker.open_channels(), 0);
    }
}
