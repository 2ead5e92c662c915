//! Inbound messages, decoded events, and the decoder between them.
//!
//! The [`Decoder`] turns a transport payload into an [`Event`]:
//! - bytes must be UTF-8 and parse as a JSON object
//! - the `event_type` field, when it is a string, becomes the category
//! - an `ingested_at` field is added with the decode-time wall clock
//!
//! Anything else is a [`DecodeFailure`]. Failures are values, not panics or
//! propagated errors, so a poison message never stops the caller.

use crate::error::Error;
use crate::routing::Category;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Payload field naming the event category.
pub const EVENT_TYPE_FIELD: &str = "event_type";

/// Field added by the decoder with the ingestion timestamp.
pub const INGESTED_AT_FIELD: &str = "ingested_at";

/// Bytes of payload kept in failure reports.
const PREVIEW_BYTES: usize = 256;

/// A payload as delivered by the inbound transport.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Transport-assigned message id.
    pub message_id: String,

    /// Transport publish time, if known.
    pub publish_time: Option<DateTime<Utc>>,

    /// Opaque payload bytes.
    pub data: Vec<u8>,
}

impl RawMessage {
    pub fn new(message_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            message_id: message_id.into(),
            publish_time: None,
            data,
        }
    }

    pub fn with_publish_time(mut self, publish_time: DateTime<Utc>) -> Self {
        self.publish_time = Some(publish_time);
        self
    }
}

/// A decoded business event.
///
/// Immutable once built. Clones share the field map.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    message_id: String,
    category: Option<Category>,
    fields: Arc<Map<String, Value>>,
    ingested_at: DateTime<Utc>,
}

impl Event {
    /// Transport message id this event was decoded from.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Category named by `event_type`, if present and a string.
    pub fn category(&self) -> Option<&Category> {
        self.category.as_ref()
    }

    /// All payload fields, including the added `ingested_at`.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Look up a single field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// When the decoder built this event.
    pub fn ingested_at(&self) -> DateTime<Utc> {
        self.ingested_at
    }

    /// Canonical JSON encoding of the fields.
    ///
    /// Keys come out sorted: without serde_json's `preserve_order` feature
    /// `Map` is a `BTreeMap`.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self.fields.as_ref())?)
    }
}

/// A message that could not be decoded.
#[derive(Debug, thiserror::Error)]
#[error("failed to decode message {message_id}: {error}")]
pub struct DecodeFailure {
    /// Transport message id.
    pub message_id: String,

    /// Underlying cause.
    #[source]
    pub error: Error,

    /// Payload size in bytes.
    pub payload_len: usize,

    /// Lossy UTF-8 rendering of the start of the payload.
    pub preview: String,
}

/// Outcome of decoding one message.
pub type Decoded = std::result::Result<Event, DecodeFailure>;

/// Converts [`RawMessage`]s into [`Event`]s.
///
/// The ingestion clock never runs backwards within one decoder, even if the
/// wall clock does.
#[derive(Debug, Default)]
pub struct Decoder {
    last_micros: AtomicI64,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode using the current wall-clock time as `ingested_at`.
    pub fn decode(&self, raw: &RawMessage) -> Decoded {
        let now = self.monotonic(Utc::now());
        self.decode_at(raw, now)
    }

    /// Decode with an explicit ingestion time.
    pub fn decode_at(&self, raw: &RawMessage, ingested_at: DateTime<Utc>) -> Decoded {
        let fail = |error: Error| DecodeFailure {
            message_id: raw.message_id.clone(),
            error,
            payload_len: raw.data.len(),
            preview: preview(&raw.data),
        };

        let text = std::str::from_utf8(&raw.data).map_err(|e| fail(e.into()))?;
        let value: Value = serde_json::from_str(text).map_err(|e| fail(e.into()))?;

        let mut fields = match value {
            Value::Object(map) => map,
            other => {
                return Err(fail(Error::NotAnObject {
                    found: json_type(&other),
                }));
            }
        };

        let category = fields
            .get(EVENT_TYPE_FIELD)
            .and_then(Value::as_str)
            .map(Category::new);

        if fields.contains_key(INGESTED_AT_FIELD) {
            tracing::debug!(
                message_id = %raw.message_id,
                "payload already carries {}, overwriting", INGESTED_AT_FIELD
            );
        }
        fields.insert(
            INGESTED_AT_FIELD.to_string(),
            Value::String(format_timestamp(ingested_at)),
        );

        Ok(Event {
            message_id: raw.message_id.clone(),
            category,
            fields: Arc::new(fields),
            ingested_at,
        })
    }

    fn monotonic(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let micros = now.timestamp_micros();
        let prev = self.last_micros.fetch_max(micros, Ordering::AcqRel);
        if prev > micros {
            DateTime::from_timestamp_micros(prev).unwrap_or(now)
        } else {
            now
        }
    }
}

/// RFC 3339 rendering used for `ingested_at`.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn preview(data: &[u8]) -> String {
    let end = data.len().min(PREVIEW_BYTES);
    let mut s = String::from_utf8_lossy(&data[..end]).into_owned();
    if data.len() > PREVIEW_BYTES {
        s.push('…');
    }
    s
}
