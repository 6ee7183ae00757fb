//! Codec layer for encoding/decoding transport messages.
//!
//! A [`Codec`] turns a payload-model value into wire bytes and back; the
//! [`CodecAdapter`] wraps one with envelope validation. Byte strings are
//! modeled as a `{"$t": "<base64>"}` sentinel object so arbitrary binary
//! survives both codecs.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;

use crate::TransportMessage;

/// Envelope fields that must be present on every decoded message.
const REQUIRED_FIELDS: [&str; 7] = ["id", "from", "to", "seq", "ack", "payload", "streamId"];

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to serialize message: {0}")]
    Serialize(String),
    #[error("failed to deserialize message: {0}")]
    Deserialize(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("expected an object envelope")]
    NotAnObject,
}

/// A pluggable codec over the payload-model `Value`.
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;
    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>, CodecError>;
    fn from_bytes(&self, buf: &[u8]) -> Result<Value, CodecError>;
}

// ---------------------------------------------------------------------------
// Byte-string sentinel
// ---------------------------------------------------------------------------

/// Wrap raw bytes as the `{"$t": "<base64>"}` sentinel value.
pub fn byte_string(bytes: &[u8]) -> Value {
    serde_json::json!({ "$t": BASE64.encode(bytes) })
}

/// Unwrap a byte-string sentinel back into raw bytes.
pub fn as_byte_string(value: &Value) -> Option<Vec<u8>> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    BASE64.decode(obj.get("$t")?.as_str()?).ok()
}

// ---------------------------------------------------------------------------
// JSON codec
// ---------------------------------------------------------------------------

/// JSON codec. Byte strings ride as the `$t` base64 sentinel; on decode a
/// `{"$b": "<digits>"}` sentinel is folded back into a plain integer when
/// it fits 64 bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "naive"
    }

    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Serialize(e.to_string()))
    }

    fn from_bytes(&self, buf: &[u8]) -> Result<Value, CodecError> {
        let value: Value =
            serde_json::from_slice(buf).map_err(|e| CodecError::Deserialize(e.to_string()))?;
        Ok(fold_big_ints(value))
    }
}

/// Replace `{"$b": <digits>}` sentinels with plain numbers, recursively.
fn fold_big_ints(value: Value) -> Value {
    match value {
        Value::Object(obj) => {
            if obj.len() == 1 {
                if let Some(folded) = obj.get("$b").and_then(parse_big_int) {
                    return folded;
                }
            }
            Value::Object(obj.into_iter().map(|(k, v)| (k, fold_big_ints(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(fold_big_ints).collect()),
        other => other,
    }
}

fn parse_big_int(raw: &Value) -> Option<Value> {
    if raw.is_i64() || raw.is_u64() {
        return Some(raw.clone());
    }
    let digits = raw.as_str()?;
    if let Ok(n) = digits.parse::<i64>() {
        return Some(Value::from(n));
    }
    digits.parse::<u64>().ok().map(Value::from)
}

// ---------------------------------------------------------------------------
// Msgpack codec
// ---------------------------------------------------------------------------

/// Msgpack codec via `rmp-serde`. Round-trips the same payload model as
/// the JSON codec (byte strings stay in sentinel form).
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec_named(value).map_err(|e| CodecError::Serialize(e.to_string()))
    }

    fn from_bytes(&self, buf: &[u8]) -> Result<Value, CodecError> {
        rmp_serde::from_slice(buf).map_err(|e| CodecError::Deserialize(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Wraps a [`Codec`] with envelope validation for [`TransportMessage`].
#[derive(Clone)]
pub struct CodecAdapter {
    codec: Arc<dyn Codec>,
}

impl CodecAdapter {
    pub fn new(codec: impl Codec + 'static) -> Self {
        CodecAdapter {
            codec: Arc::new(codec),
        }
    }

    pub fn codec_name(&self) -> &'static str {
        self.codec.name()
    }

    /// Serialize a transport message to wire bytes.
    pub fn encode(&self, msg: &TransportMessage) -> Result<Vec<u8>, CodecError> {
        let value = serde_json::to_value(msg).map_err(|e| CodecError::Serialize(e.to_string()))?;
        self.codec.to_bytes(&value)
    }

    /// Deserialize wire bytes into a transport message, validating that
    /// every required envelope field is present.
    pub fn decode(&self, buf: &[u8]) -> Result<TransportMessage, CodecError> {
        let value = self.codec.from_bytes(buf)?;
        let obj = value.as_object().ok_or(CodecError::NotAnObject)?;
        for field in REQUIRED_FIELDS {
            if !obj.contains_key(field) {
                return Err(CodecError::MissingField(field));
            }
        }
        serde_json::from_value(value).map_err(|e| CodecError::Deserialize(e.to_string()))
    }
}

impl std::fmt::Debug for CodecAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecAdapter")
            .field("codec", &self.codec.name())
            .finish()
    }
}

impl Default for CodecAdapter {
    fn default() -> Self {
        CodecAdapter::new(JsonCodec)
    }
}
