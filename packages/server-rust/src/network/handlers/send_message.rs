//! `POST /send-message`: authenticate, classify, publish.

use axum::extract::State;
use axum::Json;
use courier_core::Envelope;
use serde_json::{json, Value};
use tracing::info;

use super::GatewayContext;
use crate::error::RelayError;
use crate::network::auth::Authenticated;

pub const SENT_CONFIRMATION: &str = "Message sent to queue!";

/// Publishes the request body to the configured queue.
///
/// The credential is checked before the body is read, so an unauthenticated
/// request never reaches the publisher.
pub async fn send_message_handler(
    State(ctx): State<GatewayContext>,
    Authenticated(claims): Authenticated,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, RelayError> {
    let envelope = Envelope::classify(payload, ctx.schema_mode)?;
    let receipt = ctx.publisher.publish(&ctx.queue, &envelope).await?;

    info!(
        user_id = %claims.user_id,
        queue = %receipt.queue,
        message_id = %receipt.message_id,
        kind = receipt.kind.as_str(),
        "message accepted"
    );
    Ok(Json(json!({ "Message": SENT_CONFIRMATION })))
}
