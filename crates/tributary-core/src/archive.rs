//! Archive key derivation.
//!
//! Every routed event is archived as one blob under a key partitioned by
//! category and event time:
//!
//! ```text
//! [prefix/]{category}/{YYYY}/{MM}/{DD}/{HH}/{mm}/{category}_{YYYYMMDDHHMMSS}.json
//! ```
//!
//! All numeric segments are zero-padded, so lexical key order within a
//! category equals chronological order. That property is relied on by
//! downstream range scans.
//!
//! The event time comes from the route's time field. When that field is
//! missing, not a string, or unparsable, the event's `ingested_at` is used
//! instead. Derivation never fails.

use crate::event::Event;
use crate::routing::{Route, UNROUTABLE_CATEGORY};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use std::fmt;

/// Naive layouts accepted for event times, tried in order.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Deterministic blob key for an archived event.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchiveKey(String);

impl ArchiveKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ArchiveKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Why the ingestion time was used instead of the event's own timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// The time field is absent.
    Missing,
    /// The time field holds a non-string JSON value.
    NotAString,
    /// The time field is a string that doesn't parse as a timestamp.
    Unparsable(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("missing"),
            Self::NotAString => f.write_str("not a string"),
            Self::Unparsable(v) => write!(f, "unparsable value {:?}", v),
        }
    }
}

/// Where a derived key's timestamp came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTimeSource {
    /// Parsed from the event's time field.
    Event,
    /// Ingestion time, for the given reason.
    Fallback(FallbackReason),
}

impl EventTimeSource {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

/// A derived archive key with the timestamp used to build it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKey {
    pub key: ArchiveKey,
    pub event_time: DateTime<Utc>,
    pub source: EventTimeSource,
}

/// Per-deployment archive layout settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveLayout {
    prefix: String,
    unique_suffix: bool,
}

impl ArchiveLayout {
    /// Create a layout rooted at `prefix` (may be empty).
    pub fn new(prefix: impl AsRef<str>) -> Self {
        Self {
            prefix: prefix.as_ref().trim_matches('/').to_string(),
            unique_suffix: false,
        }
    }

    /// Append the transport message id to each filename.
    ///
    /// Distinct events archived in the same second then never share a key,
    /// and a redelivered message lands on the key it had the first time.
    pub fn with_unique_suffix(mut self, enabled: bool) -> Self {
        self.unique_suffix = enabled;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Derive the archive key for a routed event.
    pub fn derive(&self, event: &Event, route: &Route) -> DerivedKey {
        let (event_time, source) = resolve_event_time(event, &route.time_field);
        let key = self.key_for(route.category.as_str(), event_time, event.message_id());
        DerivedKey {
            key,
            event_time,
            source,
        }
    }

    /// Derive the archive key for an event that no route accepted.
    ///
    /// Filed under the reserved `_unroutable` category by ingestion time.
    pub fn derive_unroutable(&self, event: &Event) -> DerivedKey {
        let event_time = event.ingested_at();
        DerivedKey {
            key: self.key_for(UNROUTABLE_CATEGORY, event_time, event.message_id()),
            event_time,
            source: EventTimeSource::Fallback(FallbackReason::Missing),
        }
    }

    fn key_for(&self, category: &str, ts: DateTime<Utc>, message_id: &str) -> ArchiveKey {
        let dir = ts.format("%Y/%m/%d/%H/%M");
        let stamp = ts.format("%Y%m%d%H%M%S");

        let filename = if self.unique_suffix {
            format!("{}_{}_{}.json", category, stamp, sanitize(message_id))
        } else {
            format!("{}_{}.json", category, stamp)
        };

        let key = if self.prefix.is_empty() {
            format!("{}/{}/{}", category, dir, filename)
        } else {
            format!("{}/{}/{}/{}", self.prefix, category, dir, filename)
        };
        ArchiveKey(key)
    }
}

/// Pick the event time from `time_field`, falling back to `ingested_at`.
pub fn resolve_event_time(event: &Event, time_field: &str) -> (DateTime<Utc>, EventTimeSource) {
    let reason = match event.get(time_field) {
        None | Some(Value::Null) => FallbackReason::Missing,
        Some(Value::String(s)) => match parse_event_time(s) {
            Some(ts) => return (ts, EventTimeSource::Event),
            None => FallbackReason::Unparsable(s.clone()),
        },
        Some(_) => FallbackReason::NotAString,
    };
    (event.ingested_at(), EventTimeSource::Fallback(reason))
}

/// Parse an ISO-8601-like timestamp.
///
/// A trailing `Z` is accepted. Explicit offsets are converted to UTC and
/// naive values are taken as UTC. A bare date means midnight.
pub fn parse_event_time(input: &str) -> Option<DateTime<Utc>> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%:z") {
        return Some(ts.with_timezone(&Utc));
    }

    let naive = s.strip_suffix(['Z', 'z']).unwrap_or(s);
    for format in NAIVE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(ts.and_utc());
        }
    }

    NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
