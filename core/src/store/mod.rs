//! The three storage strategies and the common query trait.
//!
//! - [`MapStore`]: set `events-map`, one record per user, bin `events` holds
//!   the timestamp -> `campaign:action` map
//! - [`RecordStore`]: set `events-records`, record `<user>` holds the
//!   `event-count` counter, records `<user>:<seq>` hold one event each
//! - [`ServerAggregateStore`]: the `events-map` layout counted by the
//!   `event_module` aggregation module

pub mod aggregate;
pub mod map;
pub mod record;

pub use aggregate::ServerAggregateStore;
pub use map::MapStore;
pub use record::RecordStore;

use crate::error::Result;
use crate::event::EventFilter;

pub const EVENTS_MAP_SET: &str = "events-map";
pub const EVENTS_RECORDS_SET: &str = "events-records";

pub const NAME_BIN: &str = "name";
pub const EVENTS_BIN: &str = "events";
pub const EVENT_COUNT_BIN: &str = "event-count";
pub const TIMESTAMP_BIN: &str = "ts";
pub const EVENT_BIN: &str = "event";

/// A strategy able to answer the count query for one user.
pub trait UserEventStore: Send + Sync {
    /// Short name used in comparisons and reports.
    fn name(&self) -> &'static str;

    /// Number of the user's events matching `filter`. Unknown users count 0.
    fn count_matching(&self, user_id: &str, filter: &EventFilter) -> Result<u64>;
}
