//! Cross-checks the two physical layouts of a user's history.

use crate::error::Result;
use crate::event::EventRecord;
use crate::store::{MapStore, RecordStore};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub user_id: String,
    pub map_events: usize,
    pub record_events: usize,
    /// Present in the map layout but not among the event records.
    pub missing_from_records: Vec<EventRecord>,
    /// Present among the event records but not in the map layout.
    pub missing_from_map: Vec<EventRecord>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_from_records.is_empty() && self.missing_from_map.is_empty()
    }
}

/// Compare the user's map entries with their event records.
pub fn verify_user(
    map: &MapStore,
    records: &RecordStore,
    user_id: &str,
) -> Result<ConsistencyReport> {
    let from_map: BTreeSet<EventRecord> = map.get(user_id)?.into_iter().collect();
    let from_records: BTreeSet<EventRecord> = records.events(user_id)?.into_iter().collect();

    let report = ConsistencyReport {
        user_id: user_id.to_string(),
        map_events: from_map.len(),
        record_events: from_records.len(),
        missing_from_records: from_map.difference(&from_records).cloned().collect(),
        missing_from_map: from_records.difference(&from_map).cloned().collect(),
    };
    if !report.is_consistent() {
        log::warn!(
            "{user_id}: {} map events missing from records, {} records missing from map",
            report.missing_from_records.len(),
            report.missing_from_map.len()
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use std::sync::Arc;

    #[test]
    fn test_detects_lost_event_record() {
        let backend = Arc::new(MemoryBackend::new());
        let map = MapStore::new(backend.clone(), "test");
        let records = RecordStore::new(backend.clone(), "test");
        let events: Vec<_> = (1..=3)
            .map(|i| EventRecord::new("birds", "tap", i).unwrap())
            .collect();

        map.put("user1", &events).unwrap();
        records.register_user("user1").unwrap();
        for event in &events {
            let sequence = records.increment_count("user1").unwrap();
            records.put_event("user1", sequence, event).unwrap();
        }
        assert!(verify_user(&map, &records, "user1").unwrap().is_consistent());

        backend.remove(&records.event_key("user1", 2));
        let report = verify_user(&map, &records, "user1").unwrap();
        assert!(!report.is_consistent());
        assert_eq!(report.missing_from_records, vec![events[1].clone()]);
        assert!(report.missing_from_map.is_empty());
        assert_eq!((report.map_events, report.record_events), (3, 2));
    }

    #[test]
    fn test_unknown_user_is_consistent() {
        let backend = Arc::new(MemoryBackend::new());
        let map = MapStore::new(backend.clone(), "test");
        let records = RecordStore::new(backend, "test");
        assert!(verify_user(&map, &records, "ghost").unwrap().is_consistent());
    }
}
