//! Message envelope: JSON payload plus the transport metadata that travels
//! with it.
//!
//! On the wire the message body is exactly the JSON payload. The event kind
//! and schema version ride in message properties so consumers that only care
//! about the body never see them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::queue::{DeliveryMode, MessageProperties};

/// Content type of every body written by the publisher.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Current envelope schema version.
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Event kind tag, carried in the AMQP `type` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A user's contact details changed. Body is a [`UserUpdate`].
    UserUpdate,
    /// Any other JSON value, accepted in permissive mode.
    Untyped,
}

impl EventKind {
    /// Wire label for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserUpdate => "user_update",
            Self::Untyped => "untyped",
        }
    }

    /// Parses a wire label.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownKind`] for labels this build does not know.
    pub fn parse(label: &str) -> Result<Self, SchemaError> {
        match label {
            "user_update" => Ok(Self::UserUpdate),
            "untyped" => Ok(Self::Untyped),
            other => Err(SchemaError::UnknownKind(other.to_string())),
        }
    }
}

/// How strictly the gateway checks inbound payload shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaMode {
    /// Only recognised event shapes are accepted.
    Strict,
    /// Any JSON value is accepted; unrecognised shapes are tagged `untyped`.
    #[default]
    Permissive,
}

/// User contact update, the event the gateway was built for.
///
/// Field names are `PascalCase` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct UserUpdate {
    pub user_id: String,
    pub new_email: String,
}

impl UserUpdate {
    fn check(&self) -> Result<(), SchemaError> {
        if self.user_id.trim().is_empty() {
            return Err(SchemaError::InvalidField {
                field: "UserId",
                reason: "must not be empty",
            });
        }
        if !self.new_email.contains('@') {
            return Err(SchemaError::InvalidField {
                field: "NewEmail",
                reason: "must be an email address",
            });
        }
        Ok(())
    }
}

/// Payload rejected at the boundary or undecodable off the queue.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("payload must be a JSON object, got {found}")]
    NotAnObject { found: &'static str },
    #[error("payload does not match any known event schema: {0}")]
    UnrecognizedShape(String),
    #[error("field {field} {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("unknown event kind: {0}")]
    UnknownKind(String),
    #[error("unsupported schema version {found}")]
    UnsupportedVersion { found: u32 },
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A JSON payload tagged with its event kind and schema version.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    kind: EventKind,
    version: u32,
    payload: Value,
}

impl Envelope {
    /// Wraps a payload without shape checks. Used for internally produced events.
    #[must_use]
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            version: SCHEMA_VERSION,
            payload,
        }
    }

    /// Classifies an inbound payload at the HTTP boundary.
    ///
    /// An object that deserializes as a [`UserUpdate`] is tagged as such and
    /// must pass its field checks in either mode. Anything else, objects,
    /// arrays and scalars alike, is tagged [`EventKind::Untyped`] in
    /// [`SchemaMode::Permissive`]. [`SchemaMode::Strict`] rejects it. The
    /// payload is kept verbatim.
    ///
    /// # Errors
    ///
    /// See [`SchemaError`].
    pub fn classify(payload: Value, mode: SchemaMode) -> Result<Self, SchemaError> {
        let mismatch = if payload.is_object() {
            match UserUpdate::deserialize(&payload) {
                Ok(update) => {
                    update.check()?;
                    return Ok(Self::new(EventKind::UserUpdate, payload));
                }
                Err(e) => SchemaError::UnrecognizedShape(e.to_string()),
            }
        } else {
            SchemaError::NotAnObject {
                found: json_type_name(&payload),
            }
        };

        match mode {
            SchemaMode::Permissive => Ok(Self::new(EventKind::Untyped, payload)),
            SchemaMode::Strict => Err(mismatch),
        }
    }

    /// Event kind tag.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Schema version.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The JSON payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Serializes the payload to the message body.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Json`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, SchemaError> {
        Ok(serde_json::to_vec(&self.payload)?)
    }

    /// Message properties for publishing this envelope: JSON content type,
    /// persistent delivery, kind tag and schema version.
    #[must_use]
    pub fn properties(&self) -> MessageProperties {
        MessageProperties {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            kind: Some(self.kind.as_str().to_string()),
            schema_version: Some(self.version),
            delivery_mode: DeliveryMode::Persistent,
            message_id: None,
        }
    }

    /// Rebuilds an envelope from a received body and its properties.
    ///
    /// Missing kind or version are read as `untyped` and the current version,
    /// so bodies from producers that set no properties still decode.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] for unknown kinds, newer versions or invalid JSON.
    pub fn decode(body: &[u8], properties: &MessageProperties) -> Result<Self, SchemaError> {
        let kind = match properties.kind.as_deref() {
            Some(label) => EventKind::parse(label)?,
            None => EventKind::Untyped,
        };
        let version = properties.schema_version.unwrap_or(SCHEMA_VERSION);
        if version > SCHEMA_VERSION {
            return Err(SchemaError::UnsupportedVersion { found: version });
        }
        let payload = serde_json::from_slice(body)?;
        Ok(Self {
            kind,
            version,
            payload,
        })
    }
}
