//! Bearer credential extractor for gateway routes.

use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use courier_core::{AuthRejection, Claims, TokenValidator};
use tracing::warn;

use crate::error::RelayError;
use crate::telemetry;

/// Claims of a request whose `Authorization: Bearer` credential verified.
///
/// Handlers that take this extractor never run for unauthenticated
/// requests; extraction fails with a 401 before the body is read.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Claims);

impl<S> FromRequestParts<S> for Authenticated
where
    Arc<TokenValidator>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = RelayError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let validator = Arc::<TokenValidator>::from_ref(state);
        let header = match parts.headers.get(AUTHORIZATION) {
            None => None,
            Some(value) => match value.to_str() {
                Ok(text) => Some(text),
                Err(_) => return Err(reject(&AuthRejection::malformed("authorization header is not ASCII"))),
            },
        };

        match validator.validate_header(header) {
            Ok(claims) => Ok(Self(claims)),
            Err(rejection) => Err(reject(&rejection)),
        }
    }
}

fn reject(rejection: &AuthRejection) -> RelayError {
    warn!(reason = rejection.reason(), error = %rejection, "rejected credential");
    telemetry::record_auth_rejection(rejection.reason());
    RelayError::AuthRejected(rejection.clone())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use courier_core::{ManualClock, SigningSecret, TokenIssuer};
    use tower::ServiceExt;

    use super::*;

    const SECRET: &str = "test-signing-key";

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(1_700_000_000_000))
    }

    fn validator(clock: Arc<ManualClock>) -> Arc<TokenValidator> {
        let secret = SigningSecret::new(SECRET).unwrap();
        Arc::new(TokenValidator::new([&secret], clock).unwrap())
    }

    fn app(validator: Arc<TokenValidator>) -> Router {
        Router::new()
            .route(
                "/whoami",
                get(|Authenticated(claims): Authenticated| async move { claims.user_id }),
            )
            .with_state(validator)
    }

    async fn call(app: Router, authorization: Option<&str>) -> (StatusCode, String) {
        let mut request = Request::builder().uri("/whoami");
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn valid_credential_exposes_claims() {
        let clock = clock();
        let secret = SigningSecret::new(SECRET).unwrap();
        let credential = TokenIssuer::new(&secret, clock.clone()).issue("123").unwrap();

        let (status, body) = call(app(validator(clock)), Some(&credential.bearer())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "123");
    }

    #[tokio::test]
    async fn missing_header_is_401() {
        let (status, body) = call(app(validator(clock())), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("\"missing\""));
    }

    #[tokio::test]
    async fn wrong_scheme_is_malformed() {
        let (status, body) = call(app(validator(clock())), Some("Basic dXNlcjpwYXNz")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("\"malformed\""));
    }

    #[tokio::test]
    async fn credential_signed_with_other_key_is_401() {
        let clock = clock();
        let other = SigningSecret::new("some-other-key").unwrap();
        let credential = TokenIssuer::new(&other, clock.clone()).issue("123").unwrap();

        let (status, body) = call(app(validator(clock)), Some(&credential.bearer())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("\"invalid_signature\""));
    }

    #[tokio::test]
    async fn expired_credential_is_401() {
        let clock = clock();
        let secret = SigningSecret::new(SECRET).unwrap();
        let credential = TokenIssuer::new(&secret, clock.clone()).issue("123").unwrap();
        clock.advance(std::time::Duration::from_secs(16 * 60));

        let (status, body) = call(app(validator(clock)), Some(&credential.bearer())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("\"expired\""));
    }
}
