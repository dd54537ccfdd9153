//! Bearer credentials: HS256 JWT issue and validation.
//!
//! Trust model: every holder of a signature made with one of the configured
//! shared secrets is trusted. Issuer and audience are never checked. Tokens
//! carry a single identity claim (`user_id`) plus `iat`/`exp` and live for
//! [`DEFAULT_TOKEN_TTL`] unless configured otherwise.
//!
//! Validation runs three steps and stops at the first failure:
//! 1. the token is present and parses (header, claims, required `exp`)
//! 2. the signature verifies under a configured key
//! 3. the injected clock reads strictly before `exp`

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::clock::ClockSource;

/// Name of the identity claim carried by every credential.
pub const USER_ID_CLAIM: &str = "user_id";

/// Lifetime of an issued credential.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

/// Only algorithm issued or accepted.
const ALGORITHM: Algorithm = Algorithm::HS256;

// ---------------------------------------------------------------------------
// Claims and errors
// ---------------------------------------------------------------------------

/// Claims carried by a courier credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Identity of the calling service or user.
    pub user_id: String,
    /// Issued-at, seconds since Unix epoch. Absent in tokens minted by older producers.
    #[serde(default)]
    pub iat: u64,
    /// Absolute expiry, seconds since Unix epoch.
    pub exp: u64,
}

/// Why a presented credential was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthRejection {
    #[error("missing bearer credential")]
    Missing,
    #[error("malformed credential: {reason}")]
    Malformed { reason: String },
    #[error("credential signature does not verify")]
    InvalidSignature,
    #[error("credential expired at {expired_at}")]
    Expired { expired_at: u64 },
}

impl AuthRejection {
    /// Short, stable label used in logs, metrics and the 401 body.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Malformed { .. } => "malformed",
            Self::InvalidSignature => "invalid_signature",
            Self::Expired { .. } => "expired",
        }
    }

    /// Convenience constructor for [`AuthRejection::Malformed`].
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Configuration-level failures while setting up or using signing keys.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("signing secret must not be empty")]
    EmptySecret,
    #[error("at least one verification key is required")]
    NoVerificationKeys,
    #[error("failed to sign credential: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

// ---------------------------------------------------------------------------
// SigningSecret
// ---------------------------------------------------------------------------

/// Shared HMAC secret with an optional key id used for rotation.
///
/// `Debug` never prints the secret bytes.
#[derive(Clone)]
pub struct SigningSecret {
    kid: Option<String>,
    bytes: Vec<u8>,
}

impl SigningSecret {
    /// Wraps a shared secret.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::EmptySecret`] for an empty secret.
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, CredentialError> {
        let bytes = secret.into();
        if bytes.is_empty() {
            return Err(CredentialError::EmptySecret);
        }
        Ok(Self { kid: None, bytes })
    }

    /// Attaches a key id, written to the JWT `kid` header on issue.
    #[must_use]
    pub fn with_kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = Some(kid.into());
        self
    }

    /// The key id, if one was configured.
    #[must_use]
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningSecret")
            .field("kid", &self.kid)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// A freshly minted bearer credential together with the claims it asserts.
#[derive(Clone)]
pub struct Credential {
    token: String,
    claims: Claims,
}

impl Credential {
    /// The compact JWT string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// Claims asserted by this credential.
    #[must_use]
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// Value for an `Authorization` header.
    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("claims", &self.claims)
            .field("token", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TokenIssuer
// ---------------------------------------------------------------------------

/// Mints short-lived credentials signed with the active secret.
pub struct TokenIssuer {
    key: EncodingKey,
    kid: Option<String>,
    ttl: Duration,
    clock: Arc<dyn ClockSource>,
}

impl TokenIssuer {
    /// Creates an issuer signing with `secret` and reading time from `clock`.
    #[must_use]
    pub fn new(secret: &SigningSecret, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            key: EncodingKey::from_secret(&secret.bytes),
            kid: secret.kid.clone(),
            ttl: DEFAULT_TOKEN_TTL,
            clock,
        }
    }

    /// Overrides the credential lifetime.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Issues a credential asserting `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Signing`] if the claims cannot be encoded.
    pub fn issue(&self, user_id: &str) -> Result<Credential, CredentialError> {
        let iat = self.clock.now_secs();
        let claims = Claims {
            user_id: user_id.to_string(),
            iat,
            exp: iat + self.ttl.as_secs(),
        };

        let mut header = Header::new(ALGORITHM);
        header.kid.clone_from(&self.kid);

        let token = encode(&header, &claims, &self.key)?;
        tracing::debug!(user_id, exp = claims.exp, "issued credential");
        Ok(Credential { token, claims })
    }
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("kid", &self.kid)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// TokenValidator
// ---------------------------------------------------------------------------

struct VerificationKey {
    kid: Option<String>,
    key: DecodingKey,
}

/// Accepts or rejects presented credentials.
///
/// Holds the active key and any previous keys still inside their rotation
/// window. A token whose `kid` names a known key is checked against that key
/// only; otherwise every key is tried in order.
pub struct TokenValidator {
    keys: Vec<VerificationKey>,
    clock: Arc<dyn ClockSource>,
    parse_only: Validation,
    verify: Validation,
}

impl TokenValidator {
    /// Creates a validator trusting the given secrets, first one being the active key.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::NoVerificationKeys`] when `secrets` is empty.
    pub fn new<'a>(
        secrets: impl IntoIterator<Item = &'a SigningSecret>,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self, CredentialError> {
        let keys: Vec<_> = secrets
            .into_iter()
            .map(|s| VerificationKey {
                kid: s.kid.clone(),
                key: DecodingKey::from_secret(&s.bytes),
            })
            .collect();
        if keys.is_empty() {
            return Err(CredentialError::NoVerificationKeys);
        }

        // Expiry is checked against the injected clock, not jsonwebtoken's.
        let mut verify = Validation::new(ALGORITHM);
        verify.validate_exp = false;
        verify.validate_aud = false;
        verify.set_required_spec_claims(&["exp"]);

        let mut parse_only = verify.clone();
        parse_only.insecure_disable_signature_validation();

        Ok(Self {
            keys,
            clock,
            parse_only,
            verify,
        })
    }

    /// Number of keys accepted for verification.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Validates a raw compact token.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthRejection`] of the first failing step.
    pub fn validate(&self, raw: &str) -> Result<Claims, AuthRejection> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AuthRejection::Missing);
        }

        // Step 1: structure and required claims, before any key is consulted.
        let unverified = decode::<Claims>(raw, &DecodingKey::from_secret(&[]), &self.parse_only)
            .map_err(|e| AuthRejection::malformed(e.to_string()))?;

        // Step 2: signature.
        let claims = self.verify_signature(raw, unverified.header.kid.as_deref())?;

        // Step 3: expiry.
        let now = self.clock.now_secs();
        if now >= claims.exp {
            return Err(AuthRejection::Expired {
                expired_at: claims.exp,
            });
        }
        Ok(claims)
    }

    /// Validates the value of an `Authorization` header.
    ///
    /// # Errors
    ///
    /// [`AuthRejection::Missing`] when the header is absent, or
    /// [`AuthRejection::Malformed`] when the scheme is not `Bearer`; otherwise
    /// whatever [`TokenValidator::validate`] returns.
    pub fn validate_header(&self, header: Option<&str>) -> Result<Claims, AuthRejection> {
        let token = bearer_token(header)?;
        self.validate(token)
    }

    fn verify_signature(&self, raw: &str, kid: Option<&str>) -> Result<Claims, AuthRejection> {
        let pinned = kid.and_then(|kid| self.keys.iter().find(|k| k.kid.as_deref() == Some(kid)));
        let candidates: Vec<&VerificationKey> = match pinned {
            Some(key) => vec![key],
            None => self.keys.iter().collect(),
        };

        for candidate in candidates {
            match decode::<Claims>(raw, &candidate.key, &self.verify) {
                Ok(data) => return Ok(data.claims),
                Err(e) => match e.kind() {
                    ErrorKind::InvalidSignature => {}
                    ErrorKind::InvalidAlgorithm => return Err(AuthRejection::InvalidSignature),
                    _ => return Err(AuthRejection::malformed(e.to_string())),
                },
            }
        }
        Err(AuthRejection::InvalidSignature)
    }
}

impl fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kids: Vec<_> = self.keys.iter().map(|k| k.kid.as_deref()).collect();
        f.debug_struct("TokenValidator")
            .field("kids", &kids)
            .finish_non_exhaustive()
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
///
/// # Errors
///
/// [`AuthRejection::Missing`] for an absent or blank header,
/// [`AuthRejection::Malformed`] for any other scheme.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthRejection> {
    let value = header.map(str::trim).filter(|v| !v.is_empty());
    let Some(value) = value else {
        return Err(AuthRejection::Missing);
    };
    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
            Ok(token.trim())
        }
        _ => Err(AuthRejection::malformed("authorization scheme must be Bearer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const T0_MILLIS: u64 = 1_700_000_000_000;

    fn secret(bytes: &str) -> SigningSecret {
        SigningSecret::new(bytes).unwrap()
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(T0_MILLIS))
    }

    #[test]
    fn issued_credential_validates() {
        let clock = clock();
        let key = secret("shared-secret-for-tests-0123456789");
        let issuer = TokenIssuer::new(&key, clock.clone());
        let validator = TokenValidator::new([&key], clock).unwrap();

        let credential = issuer.issue("123").unwrap();
        let claims = validator.validate(credential.as_str()).unwrap();

        assert_eq!(claims.user_id, "123");
        assert_eq!(claims.iat, T0_MILLIS / 1000);
        assert_eq!(claims.exp, claims.iat + 15 * 60);
        assert_eq!(&claims, credential.claims());
    }

    #[test]
    fn expired_credential_with_valid_signature_is_rejected() {
        let clock = clock();
        let key = secret("shared-secret-for-tests-0123456789");
        let issuer = TokenIssuer::new(&key, clock.clone());
        let validator = TokenValidator::new([&key], clock.clone()).unwrap();

        let credential = issuer.issue("123").unwrap();
        clock.advance(Duration::from_secs(15 * 60));

        let err = validator.validate(credential.as_str()).unwrap_err();
        assert_eq!(
            err,
            AuthRejection::Expired {
                expired_at: credential.claims().exp
            }
        );
    }

    #[test]
    fn credential_is_valid_until_the_last_second() {
        let clock = clock();
        let key = secret("shared-secret-for-tests-0123456789");
        let issuer = TokenIssuer::new(&key, clock.clone());
        let validator = TokenValidator::new([&key], clock.clone()).unwrap();

        let credential = issuer.issue("123").unwrap();
        clock.advance(Duration::from_secs(15 * 60 - 1));
        assert!(validator.validate(credential.as_str()).is_ok());
    }

    #[test]
    fn credential_signed_with_other_key_is_rejected() {
        let clock = clock();
        let issuer = TokenIssuer::new(&secret("attacker-secret"), clock.clone());
        let validator = TokenValidator::new([&secret("real-secret")], clock).unwrap();

        let credential = issuer.issue("123").unwrap();
        let err = validator.validate(credential.as_str()).unwrap_err();
        assert_eq!(err, AuthRejection::InvalidSignature);
    }

    #[test]
    fn signature_is_checked_before_expiry() {
        let clock = clock();
        let issuer = TokenIssuer::new(&secret("attacker-secret"), clock.clone());
        let validator = TokenValidator::new([&secret("real-secret")], clock.clone()).unwrap();

        let credential = issuer.issue("123").unwrap();
        clock.advance(Duration::from_secs(3600));
        assert_eq!(
            validator.validate(credential.as_str()).unwrap_err(),
            AuthRejection::InvalidSignature
        );
    }

    #[test]
    fn garbage_is_malformed_not_bad_signature() {
        let validator = TokenValidator::new([&secret("real-secret")], clock()).unwrap();
        for raw in ["not-a-jwt", "a.b.c", "eyJhbGciOiJIUzI1NiJ9.e30"] {
            let err = validator.validate(raw).unwrap_err();
            assert_eq!(err.reason(), "malformed", "input {raw:?} gave {err:?}");
        }
    }

    #[test]
    fn blank_token_is_missing() {
        let validator = TokenValidator::new([&secret("real-secret")], clock()).unwrap();
        assert_eq!(validator.validate("   ").unwrap_err(), AuthRejection::Missing);
    }

    #[test]
    fn token_without_exp_is_malformed() {
        #[derive(Serialize)]
        struct NoExpiry<'a> {
            user_id: &'a str,
        }

        let key = secret("real-secret");
        let token = encode(
            &Header::new(Algorithm::HS256),
            &NoExpiry { user_id: "123" },
            &EncodingKey::from_secret(b"real-secret"),
        )
        .unwrap();
        let validator = TokenValidator::new([&key], clock()).unwrap();
        assert_eq!(validator.validate(&token).unwrap_err().reason(), "malformed");
    }

    #[test]
    fn other_algorithms_are_rejected_as_bad_signature() {
        let key = secret("real-secret");
        let claims = Claims {
            user_id: "123".into(),
            iat: T0_MILLIS / 1000,
            exp: T0_MILLIS / 1000 + 60,
        };
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(b"real-secret"),
        )
        .unwrap();
        let validator = TokenValidator::new([&key], clock()).unwrap();
        assert_eq!(
            validator.validate(&token).unwrap_err(),
            AuthRejection::InvalidSignature
        );
    }

    #[test]
    fn previous_key_still_validates_during_rotation() {
        let clock = clock();
        let old = secret("old-secret").with_kid("2024-01");
        let new = secret("new-secret").with_kid("2024-02");
        let old_issuer = TokenIssuer::new(&old, clock.clone());
        let validator = TokenValidator::new([&new, &old], clock).unwrap();
        assert_eq!(validator.key_count(), 2);

        let credential = old_issuer.issue("123").unwrap();
        assert_eq!(validator.validate(credential.as_str()).unwrap().user_id, "123");
    }

    #[test]
    fn unlabelled_tokens_try_every_key() {
        let clock = clock();
        let old = secret("old-secret");
        let new = secret("new-secret");
        let issuer = TokenIssuer::new(&old, clock.clone());
        let validator = TokenValidator::new([&new, &old], clock).unwrap();

        let credential = issuer.issue("abc").unwrap();
        assert!(validator.validate(credential.as_str()).is_ok());
    }

    #[test]
    fn pinned_kid_does_not_fall_back_to_other_keys() {
        let clock = clock();
        // Same bytes as the active key but labelled with the retired key's id.
        let forged = secret("new-secret").with_kid("old");
        let validator = TokenValidator::new(
            [&secret("new-secret").with_kid("new"), &secret("old-secret").with_kid("old")],
            clock.clone(),
        )
        .unwrap();
        let credential = TokenIssuer::new(&forged, clock).issue("123").unwrap();
        assert_eq!(
            validator.validate(credential.as_str()).unwrap_err(),
            AuthRejection::InvalidSignature
        );
    }

    #[test]
    fn custom_ttl_is_applied() {
        let clock = clock();
        let key = secret("k");
        let issuer = TokenIssuer::new(&key, clock).with_ttl(Duration::from_secs(30));
        let credential = issuer.issue("123").unwrap();
        assert_eq!(credential.claims().exp - credential.claims().iat, 30);
    }

    #[test]
    fn bearer_header_parsing() {
        assert_eq!(bearer_token(Some("Bearer abc")).unwrap(), "abc");
        assert_eq!(bearer_token(Some("bearer   abc ")).unwrap(), "abc");
        assert_eq!(bearer_token(None).unwrap_err(), AuthRejection::Missing);
        assert_eq!(bearer_token(Some("  ")).unwrap_err(), AuthRejection::Missing);
        assert_eq!(bearer_token(Some("Basic dXNlcg==")).unwrap_err().reason(), "malformed");
        assert_eq!(bearer_token(Some("Bearer")).unwrap_err().reason(), "malformed");
    }

    #[test]
    fn validate_header_round_trip() {
        let clock = clock();
        let key = secret("k");
        let credential = TokenIssuer::new(&key, clock.clone()).issue("123").unwrap();
        let validator = TokenValidator::new([&key], clock).unwrap();
        let claims = validator.validate_header(Some(&credential.bearer())).unwrap();
        assert_eq!(claims.user_id, "123");
    }

    #[test]
    fn empty_secret_is_a_config_error() {
        assert!(matches!(SigningSecret::new(""), Err(CredentialError::EmptySecret)));
        let none: [&SigningSecret; 0] = [];
        assert!(matches!(
            TokenValidator::new(none, clock()),
            Err(CredentialError::NoVerificationKeys)
        ));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let key = secret("super-secret-value").with_kid("k1");
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("super-secret-value"));
        assert!(rendered.contains("k1"));

        let credential = TokenIssuer::new(&key, clock()).issue("123").unwrap();
        assert!(!format!("{credential:?}").contains(credential.as_str()));
    }
}
