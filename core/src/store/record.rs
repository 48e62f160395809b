use super::{
    UserEventStore, EVENTS_RECORDS_SET, EVENT_BIN, EVENT_COUNT_BIN, NAME_BIN, TIMESTAMP_BIN,
};
use crate::backend::{Backend, Bin, Key, Record, WritePolicy};
use crate::error::{Error, Result};
use crate::event::{EventFilter, EventRecord};
use std::sync::Arc;

/// A per-user counter record plus one small record per event.
///
/// The counter is incremented before the matching event record is written,
/// and nothing ties the two writes together: a reader can see a count `N`
/// while record `N` is still missing. Reads skip absent records.
pub struct RecordStore {
    backend: Arc<dyn Backend>,
    namespace: String,
    policy: WritePolicy,
}

impl RecordStore {
    pub fn new(backend: Arc<dyn Backend>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            policy: WritePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: WritePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Key of the user's counter record.
    pub fn counter_key(&self, user_id: &str) -> Key {
        Key::new(self.namespace.as_str(), EVENTS_RECORDS_SET, user_id)
    }

    /// Key of one event record.
    pub fn event_key(&self, user_id: &str, sequence: u64) -> Key {
        Key::new(
            self.namespace.as_str(),
            EVENTS_RECORDS_SET,
            format!("{user_id}:{sequence}"),
        )
    }

    /// Create or reset the user's counter record with a count of 0. Event
    /// records from an earlier load above the new count are never read.
    pub fn register_user(&self, user_id: &str) -> Result<()> {
        let key = self.counter_key(user_id);
        self.backend
            .put(
                &key,
                &[Bin::new(NAME_BIN, user_id), Bin::new(EVENT_COUNT_BIN, 0)],
                &self.policy,
            )
            .map_err(|source| Error::backend("register user", user_id, &key, source))
    }

    /// Atomically bump the user's event count and return the new value,
    /// which is the sequence number of the next event.
    pub fn increment_count(&self, user_id: &str) -> Result<u64> {
        let key = self.counter_key(user_id);
        let count = self
            .backend
            .add(&key, EVENT_COUNT_BIN, 1, &self.policy)
            .map_err(|source| Error::backend("increment count", user_id, &key, source))?;
        Ok(count.max(0) as u64)
    }

    pub fn get_count(&self, user_id: &str) -> Result<u64> {
        let key = self.counter_key(user_id);
        let record = self
            .backend
            .get(&key)
            .map_err(|source| Error::backend("get count", user_id, &key, source))?;
        let count = match record {
            Some(record) => record
                .int(EVENT_COUNT_BIN)
                .map_err(|source| Error::backend("get count", user_id, &key, source))?
                .unwrap_or(0),
            None => 0,
        };
        Ok(count.max(0) as u64)
    }

    pub fn put_event(&self, user_id: &str, sequence: u64, event: &EventRecord) -> Result<()> {
        let key = self.event_key(user_id, sequence);
        self.backend
            .put(
                &key,
                &[
                    Bin::new(NAME_BIN, user_id),
                    Bin::new(TIMESTAMP_BIN, event.timestamp_millis()),
                    Bin::new(EVENT_BIN, event.encode()),
                ],
                &self.policy,
            )
            .map_err(|source| Error::backend("put event", user_id, &key, source))
    }

    /// Point read of one event; `None` when the record is absent.
    pub fn get_event(&self, user_id: &str, sequence: u64) -> Result<Option<EventRecord>> {
        let key = self.event_key(user_id, sequence);
        let record = self
            .backend
            .get(&key)
            .map_err(|source| Error::backend("get event", user_id, &key, source))?;
        match record {
            Some(record) => decode_event(&key, &record),
            None => Ok(None),
        }
    }

    /// All readable events of the user in sequence order.
    pub fn events(&self, user_id: &str) -> Result<Vec<EventRecord>> {
        Ok(self
            .fetch_all(user_id, "list events")?
            .into_iter()
            .flatten()
            .collect())
    }

    /// Counter read plus one batch read of `user:1..=count`. Events that are
    /// absent or unreadable come back as `None`.
    fn fetch_all(
        &self,
        user_id: &str,
        operation: &'static str,
    ) -> Result<Vec<Option<EventRecord>>> {
        let count = self.get_count(user_id)?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let keys: Vec<Key> = (1..=count)
            .map(|sequence| self.event_key(user_id, sequence))
            .collect();
        let records = self.backend.batch_get(&keys).map_err(|source| {
            Error::backend(operation, user_id, &self.counter_key(user_id), source)
        })?;

        Ok(keys
            .iter()
            .zip(records)
            .map(|(key, record)| {
                let record = record?;
                match decode_event(key, &record) {
                    Ok(event) => event,
                    Err(err) => {
                        log::warn!("Skipping record {key}: {err}");
                        None
                    }
                }
            })
            .collect())
    }
}

/// Rebuild an event from its `ts` and `event` bins. A record missing either
/// bin reads as `None`.
fn decode_event(key: &Key, record: &Record) -> Result<Option<EventRecord>> {
    let user = key.user_key.as_str();
    let ts = record
        .int(TIMESTAMP_BIN)
        .map_err(|source| Error::backend("decode event", user, key, source))?;
    let value = record
        .str(EVENT_BIN)
        .map_err(|source| Error::backend("decode event", user, key, source))?;
    match (ts, value) {
        (Some(ts), Some(value)) => EventRecord::decode(ts, value).map(Some),
        _ => Ok(None),
    }
}

impl UserEventStore for RecordStore {
    fn name(&self) -> &'static str {
        "records"
    }

    fn count_matching(&self, user_id: &str, filter: &EventFilter) -> Result<u64> {
        let count = self
            .fetch_all(user_id, "records count")?
            .iter()
            .flatten()
            .filter(|event| filter.matches(event))
            .count();
        Ok(count as u64)
    }
}
