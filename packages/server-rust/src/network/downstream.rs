//! HTTP client the relay uses to call a gateway's `/send-message`.

use std::time::Duration;

use courier_core::Credential;
use serde_json::Value;
use tracing::debug;

use crate::error::RelayError;

pub const SEND_MESSAGE_PATH: &str = "/send-message";

/// Calls a gateway on behalf of the relay.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
}

impl GatewayClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built (TLS backend failure).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Posts `payload` as JSON with `credential` as the bearer token and
    /// returns the response body.
    ///
    /// # Errors
    ///
    /// [`RelayError::GatewayUnreachable`] if no response arrives,
    /// [`RelayError::Downstream`] carrying the gateway's status and body for
    /// any non-2xx answer.
    #[tracing::instrument(skip_all, fields(url = %self.base_url))]
    pub async fn send_message(&self, credential: &Credential, payload: &Value) -> Result<String, RelayError> {
        let url = format!("{}{SEND_MESSAGE_PATH}", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(credential.as_str())
            .json(payload)
            .send()
            .await
            .map_err(|e| RelayError::GatewayUnreachable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RelayError::GatewayUnreachable(e.to_string()))?;

        if !status.is_success() {
            return Err(RelayError::Downstream { status, body });
        }
        debug!(status = status.as_u16(), "gateway accepted message");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = GatewayClient::new("http://localhost:5000/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://localhost:5000");
    }

    #[tokio::test]
    async fn unreachable_gateway_is_reported() {
        use courier_core::{ManualClock, SigningSecret, TokenIssuer};
        use std::sync::Arc;

        // Bind then drop a listener so the port is known to be closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let secret = SigningSecret::new("k").unwrap();
        let credential = TokenIssuer::new(&secret, Arc::new(ManualClock::new(0)))
            .issue("123")
            .unwrap();
        let client = GatewayClient::new(format!("http://127.0.0.1:{port}"), Duration::from_secs(2)).unwrap();
        let err = client
            .send_message(&credential, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::GatewayUnreachable(_)));
    }
}
