use super::{UserEventStore, EVENTS_BIN, EVENTS_MAP_SET, NAME_BIN};
use crate::backend::{Backend, Bin, Key, WritePolicy};
use crate::error::{Error, Result};
use crate::event::{EventFilter, EventRecord};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One record per user; the whole event history travels in one round trip
/// and is scanned client-side.
pub struct MapStore {
    backend: Arc<dyn Backend>,
    namespace: String,
    policy: WritePolicy,
}

impl MapStore {
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

    pub fn key(&self, user_id: &str) -> Key {
        Key::new(self.namespace.as_str(), EVENTS_MAP_SET, user_id)
    }

    /// Write the user's full event map. Timestamps must strictly increase.
    pub fn put(&self, user_id: &str, events: &[EventRecord]) -> Result<()> {
        let mut map = BTreeMap::new();
        let mut last: Option<i64> = None;
        for event in events {
            let ts = event.timestamp_millis();
            if last.is_some_and(|prev| ts <= prev) {
                return Err(Error::InvalidEvent(format!(
                    "timestamp {ts} for {user_id} does not follow {}",
                    last.unwrap_or_default()
                )));
            }
            last = Some(ts);
            map.insert(ts, event.encode());
        }

        let key = self.key(user_id);
        self.backend
            .put(
                &key,
                &[Bin::new(NAME_BIN, user_id), Bin::new(EVENTS_BIN, map)],
                &self.policy,
            )
            .map_err(|source| Error::backend("map put", user_id, &key, source))
    }

    /// The user's events in timestamp order; empty for an unknown user.
    /// Undecodable entries are logged and left out.
    pub fn get(&self, user_id: &str) -> Result<Vec<EventRecord>> {
        let key = self.key(user_id);
        let Some(record) = self
            .backend
            .get(&key)
            .map_err(|source| Error::backend("map get", user_id, &key, source))?
        else {
            return Ok(Vec::new());
        };
        let events = record
            .map(EVENTS_BIN)
            .map_err(|source| Error::backend("map get", user_id, &key, source))?;

        Ok(events
            .into_iter()
            .flatten()
            .filter_map(|(ts, value)| match EventRecord::decode(*ts, value) {
                Ok(event) => Some(event),
                Err(err) => {
                    log::warn!("Skipping entry in {key}: {err}");
                    None
                }
            })
            .collect())
    }
}

impl UserEventStore for MapStore {
    fn name(&self) -> &'static str {
        "map"
    }

    fn count_matching(&self, user_id: &str, filter: &EventFilter) -> Result<u64> {
        let key = self.key(user_id);
        let Some(record) = self
            .backend
            .get(&key)
            .map_err(|source| Error::backend("map count", user_id, &key, source))?
        else {
            return Ok(0);
        };
        let Some(events) = record
            .map(EVENTS_BIN)
            .map_err(|source| Error::backend("map count", user_id, &key, source))?
        else {
            return Ok(0);
        };

        let mut count = 0;
        for (ts, value) in events {
            match filter.matches_entry(*ts, value) {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(err) => log::warn!("Skipping entry in {key}: {err}"),
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, Value};

    fn store() -> (Arc<MemoryBackend>, MapStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = MapStore::new(backend.clone(), "test");
        (backend, store)
    }

    fn event(campaign: &str, action: &str, ts: i64) -> EventRecord {
        EventRecord::new(campaign, action, ts).unwrap()
    }

    #[test]
    fn test_put_get_preserves_order() {
        let (_, store) = store();
        let events = vec![
            event("birds", "tap", 10),
            event("cats", "run", 20),
            event("birds", "clap", 30),
        ];
        store.put("user1", &events).unwrap();
        assert_eq!(store.get("user1").unwrap(), events);
    }

    #[test]
    fn test_put_rejects_non_increasing_timestamps() {
        let (_, store) = store();
        let events = vec![event("birds", "tap", 10), event("cats", "run", 10)];
        assert!(matches!(
            store.put("user1", &events),
            Err(Error::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_unknown_user() {
        let (_, store) = store();
        assert!(store.get("ghost").unwrap().is_empty());
        let filter = EventFilter::new("tap", "birds", 0);
        assert_eq!(store.count_matching("ghost", &filter).unwrap(), 0);
    }

    #[test]
    fn test_count_matching_uses_one_round_trip() {
        let (backend, store) = store();
        let events: Vec<_> = (1..=50).map(|i| event("birds", "tap", i)).collect();
        store.put("user1", &events).unwrap();

        let before = backend.round_trips();
        let filter = EventFilter::new("tap", "birds", 25);
        assert_eq!(store.count_matching("user1", &filter).unwrap(), 25);
        assert_eq!(backend.round_trips() - before, 1);
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let (backend, store) = store();
        let mut map = BTreeMap::new();
        map.insert(10, "birds:tap".to_string());
        map.insert(20, "birdstap".to_string());
        map.insert(30, "birds:tap".to_string());
        backend
            .put(
                &store.key("user1"),
                &[Bin::new(EVENTS_BIN, Value::Map(map))],
                &WritePolicy::default(),
            )
            .unwrap();

        let filter = EventFilter::new("tap", "birds", 0);
        assert_eq!(store.count_matching("user1", &filter).unwrap(), 2);
        assert_eq!(store.get("user1").unwrap().len(), 2);
    }

    #[test]
    fn test_backend_failure_carries_context() {
        let (backend, store) = store();
        backend.set_offline(true);
        let err = store
            .count_matching("user7", &EventFilter::new("tap", "birds", 0))
            .unwrap_err();
        match err {
            Error::BackendUnavailable { user, key, .. } => {
                assert_eq!(user, "user7");
                assert_eq!(key, "test:events-map:user7");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
