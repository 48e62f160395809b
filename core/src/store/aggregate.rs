use super::{UserEventStore, EVENTS_MAP_SET};
use crate::backend::{Backend, BackendError, Key, Value};
use crate::error::{Error, Result};
use crate::event::EventFilter;
use crate::udf::EVENT_MODULE_NAME;
use std::sync::Arc;

/// The map layout, counted by the `event_module` aggregation module next to
/// the data. Only the count crosses the wire.
///
/// There is no client-side fallback: a backend without the module fails
/// with [`Error::CapabilityUnavailable`].
pub struct ServerAggregateStore {
    backend: Arc<dyn Backend>,
    namespace: String,
}

impl ServerAggregateStore {
    pub fn new(backend: Arc<dyn Backend>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
        }
    }

    fn key(&self, user_id: &str) -> Key {
        Key::new(self.namespace.as_str(), EVENTS_MAP_SET, user_id)
    }
}

impl UserEventStore for ServerAggregateStore {
    fn name(&self) -> &'static str {
        "aggregate"
    }

    fn count_matching(&self, user_id: &str, filter: &EventFilter) -> Result<u64> {
        let key = self.key(user_id);
        let args = [
            Value::from(filter.action.as_str()),
            Value::from(filter.campaign.as_str()),
            Value::Int(filter.since_millis),
        ];
        let result = self
            .backend
            .execute(&key, EVENT_MODULE_NAME, &args)
            .map_err(|source| {
                if source.is_capability_missing() {
                    Error::CapabilityUnavailable {
                        module: EVENT_MODULE_NAME.to_string(),
                        source,
                    }
                } else {
                    Error::backend("aggregate count", user_id, &key, source)
                }
            })?;

        match result {
            Value::Int(count) if count >= 0 => Ok(count as u64),
            other => Err(Error::backend(
                "aggregate count",
                user_id,
                &key,
                BackendError::Corrupt(format!(
                    "{EVENT_MODULE_NAME} returned {other:?}"
                )),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::event::EventRecord;
    use crate::store::MapStore;
    use crate::udf::{ensure_registered, EVENT_MODULE};
    use std::time::Duration;

    #[test]
    fn test_matches_client_side_scan() {
        let backend = Arc::new(MemoryBackend::new());
        ensure_registered(&*backend, &EVENT_MODULE, Duration::from_secs(1)).unwrap();
        let map = MapStore::new(backend.clone(), "test");
        let aggregate = ServerAggregateStore::new(backend.clone(), "test");

        let events: Vec<_> = (1..=30)
            .map(|i| {
                let campaign = if i % 3 == 0 { "birds" } else { "cats" };
                EventRecord::new(campaign, "tap", i * 10).unwrap()
            })
            .collect();
        map.put("user1", &events).unwrap();

        for since in [0, 100, 150, 300] {
            let filter = EventFilter::new("tap", "birds", since);
            assert_eq!(
                aggregate.count_matching("user1", &filter).unwrap(),
                map.count_matching("user1", &filter).unwrap(),
                "since {since}"
            );
        }
    }

    #[test]
    fn test_single_round_trip() {
        let backend = Arc::new(MemoryBackend::new());
        ensure_registered(&*backend, &EVENT_MODULE, Duration::from_secs(1)).unwrap();
        let aggregate = ServerAggregateStore::new(backend.clone(), "test");

        let before = backend.round_trips();
        aggregate
            .count_matching("user1", &EventFilter::new("tap", "birds", 0))
            .unwrap();
        assert_eq!(backend.round_trips() - before, 1);
    }

    #[test]
    fn test_unregistered_module_fails_fast() {
        let backend = Arc::new(MemoryBackend::new());
        let aggregate = ServerAggregateStore::new(backend, "test");
        let err = aggregate
            .count_matching("user1", &EventFilter::new("tap", "birds", 0))
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityUnavailable { .. }));
    }

    #[test]
    fn test_backend_without_modules() {
        let backend = Arc::new(MemoryBackend::without_modules());
        let aggregate = ServerAggregateStore::new(backend, "test");
        let err = aggregate
            .count_matching("user1", &EventFilter::new("tap", "birds", 0))
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityUnavailable { .. }));
    }
}
