//! Core types and pure logic for the tributary event router.
//!
//! This crate provides:
//! - Decoding of transport payloads into [`Event`]s
//! - Category routing via a [`RoutingTable`]
//! - Archive key derivation ([`ArchiveLayout`])
//! - Prometheus metrics and health helpers
//! - Shared error types
//!
//! Nothing in here performs I/O on the data path; the sinks and the driver
//! live in `tributary-ingest`.

pub mod archive;
mod error;
pub mod event;
pub mod metrics;
pub mod routing;

pub use archive::{
    ArchiveKey, ArchiveLayout, DerivedKey, EventTimeSource, FallbackReason, parse_event_time,
    resolve_event_time,
};
pub use error::{Error, Result};
pub use event::{
    DecodeFailure, Decoded, Decoder, EVENT_TYPE_FIELD, Event, INGESTED_AT_FIELD, RawMessage,
    format_timestamp,
};
pub use routing::{
    Category, Classification, DEFAULT_ROUTES, DEFAULT_TIME_FIELD, Route, RoutingTable,
    UNROUTABLE_CATEGORY, UnroutableReason,
};
