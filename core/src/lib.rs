//! Per-user event storage layouts over a key-value backend.
//!
//! Answers one question three different ways: "how many times did user U
//! perform action A on campaign C in the last N days?"
//!
//! - [`store::MapStore`]: one record per user holding a timestamp -> event map,
//!   fetched in one round trip and scanned client-side.
//! - [`store::RecordStore`]: a per-user counter plus one small record per
//!   event, fetched with a batch read.
//! - [`store::ServerAggregateStore`]: the map layout, counted by an aggregation
//!   module running next to the data.
//!
//! [`load::LoadGenerator`] populates both physical layouts from a seeded
//! workload and [`query::QueryEngine`] runs the same query against every
//! strategy with per-strategy timings.

pub mod backend;
pub mod clock;
pub mod consistency;
pub mod error;
pub mod event;
pub mod load;
pub mod logging;
pub mod query;
pub mod store;
pub mod udf;

pub use error::{Error, Result};
pub use event::{EventFilter, EventRecord};
pub use logging::initialize_logger;

/// Milliseconds in one day. Calendar effects (DST, leap seconds) are ignored.
pub const MILLIS_PER_DAY: i64 = 1000 * 60 * 60 * 24;

/// Default retention applied to every written record.
pub const DEFAULT_RETENTION_DAYS: u32 = 90;
