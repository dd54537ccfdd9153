//! HTTP-facing error taxonomy.
//!
//! Every failure a handler can surface maps to exactly one status code.
//! Authentication rejections carry a `WWW-Authenticate` challenge; a failed
//! downstream gateway call is relayed as an RFC 7807 problem document that
//! keeps the gateway's status and body.

use axum::http::header::{CONTENT_TYPE, WWW_AUTHENTICATE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use courier_core::{AuthRejection, BrokerError, CredentialError, SchemaError};
use serde_json::json;

const PROBLEM_JSON: &str = "application/problem+json";
const BEARER_CHALLENGE: &str = r#"Bearer error="invalid_token""#;

/// Errors returned by the gateway and relay handlers.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("authentication rejected: {0}")]
    AuthRejected(#[from] AuthRejection),
    #[error("invalid payload: {0}")]
    Schema(#[from] SchemaError),
    #[error("broker unavailable: {0}")]
    TransportFailure(BrokerError),
    #[error("queue {queue} already declared with different properties: {detail}")]
    QueueConflict { queue: String, detail: String },
    #[error("gateway responded with {status}")]
    Downstream { status: StatusCode, body: String },
    #[error("gateway unreachable: {0}")]
    GatewayUnreachable(String),
    #[error("credential configuration error: {0}")]
    Credential(#[from] CredentialError),
}

impl From<BrokerError> for RelayError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::QueueConflict { queue, detail } => Self::QueueConflict { queue, detail },
            other => Self::TransportFailure(other),
        }
    }
}

impl RelayError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthRejected(_) => StatusCode::UNAUTHORIZED,
            Self::Schema(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::TransportFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Downstream { status, .. } => *status,
            Self::GatewayUnreachable(_) => StatusCode::BAD_GATEWAY,
            Self::QueueConflict { .. } | Self::Credential(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short, stable label used in response bodies and logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::AuthRejected(_) => "unauthorized",
            Self::Schema(_) => "invalid_payload",
            Self::TransportFailure(_) => "broker_unavailable",
            Self::QueueConflict { .. } => "queue_conflict",
            Self::Downstream { .. } => "downstream_failure",
            Self::GatewayUnreachable(_) => "gateway_unreachable",
            Self::Credential(_) => "credential_error",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "request failed");
        }

        match self {
            Self::AuthRejected(rejection) => {
                let body = json!({
                    "error": "unauthorized",
                    "reason": rejection.reason(),
                });
                let mut response = (status, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(WWW_AUTHENTICATE, HeaderValue::from_static(BEARER_CHALLENGE));
                response
            }
            Self::Downstream { status, body } => {
                let problem = json!({
                    "type": "about:blank",
                    "title": status.canonical_reason().unwrap_or("Downstream Failure"),
                    "status": status.as_u16(),
                    "detail": body,
                });
                let mut response = (status, Json(problem)).into_response();
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(PROBLEM_JSON));
                response
            }
            other => {
                let body = json!({
                    "error": other.label(),
                    "message": other.to_string(),
                });
                (status, Json(body)).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn auth_rejection_is_401_with_challenge() {
        let response = RelayError::AuthRejected(AuthRejection::Missing).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[WWW_AUTHENTICATE],
            r#"Bearer error="invalid_token""#
        );
        assert_eq!(body_json(response).await["reason"], "missing");
    }

    #[tokio::test]
    async fn downstream_failure_keeps_status_and_body() {
        let err = RelayError::Downstream {
            status: StatusCode::UNAUTHORIZED,
            body: "token expired".to_string(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[CONTENT_TYPE], PROBLEM_JSON);

        let problem = body_json(response).await;
        assert_eq!(problem["status"], 401);
        assert_eq!(problem["detail"], "token expired");
        assert_eq!(problem["title"], "Unauthorized");
    }

    #[test]
    fn broker_errors_split_into_conflict_and_transport() {
        let conflict: RelayError = BrokerError::QueueConflict {
            queue: "q".into(),
            detail: "durable".into(),
        }
        .into();
        assert_eq!(conflict.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let down: RelayError = BrokerError::Transport("refused".into()).into();
        assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);

        let exhausted: RelayError = BrokerError::Exhausted { waited_ms: 5 }.into();
        assert_eq!(exhausted.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn other_errors_carry_label_and_message() {
        let response = RelayError::GatewayUnreachable("connection refused".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["error"], "gateway_unreachable");
        assert!(body["message"].as_str().unwrap().contains("connection refused"));
    }
}
