//! Runs the same count query against every strategy and times each one.

use crate::backend::Backend;
use crate::clock::Clock;
use crate::error::Result;
use crate::event::EventFilter;
use crate::store::{MapStore, RecordStore, ServerAggregateStore, UserEventStore};
use crate::MILLIS_PER_DAY;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Count and wall time of one strategy's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryTiming {
    pub count: u64,
    pub elapsed: Duration,
}

impl QueryTiming {
    pub fn elapsed_millis(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

#[derive(Debug)]
pub struct StrategyOutcome {
    pub strategy: &'static str,
    pub result: Result<QueryTiming>,
}

/// One query, answered by every strategy in a fixed order.
#[derive(Debug)]
pub struct Comparison {
    pub user_id: String,
    pub filter: EventFilter,
    pub outcomes: Vec<StrategyOutcome>,
}

impl Comparison {
    pub fn get(&self, strategy: &str) -> Option<&StrategyOutcome> {
        self.outcomes.iter().find(|o| o.strategy == strategy)
    }

    /// Counts of the strategies that succeeded.
    pub fn counts(&self) -> Vec<(&'static str, u64)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|t| (o.strategy, t.count)))
            .collect()
    }

    /// True when every strategy that answered returned the same count.
    pub fn counts_agree(&self) -> bool {
        let counts = self.counts();
        counts.windows(2).all(|w| w[0].1 == w[1].1)
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}

pub struct QueryEngine {
    stores: Vec<Box<dyn UserEventStore>>,
    clock: Arc<dyn Clock>,
}

impl QueryEngine {
    /// Map scan, server aggregate, then per-event records.
    pub fn new(backend: Arc<dyn Backend>, namespace: &str, clock: Arc<dyn Clock>) -> Self {
        let stores: Vec<Box<dyn UserEventStore>> = vec![
            Box::new(MapStore::new(backend.clone(), namespace)),
            Box::new(ServerAggregateStore::new(backend.clone(), namespace)),
            Box::new(RecordStore::new(backend, namespace)),
        ];
        Self::with_stores(stores, clock)
    }

    pub fn with_stores(stores: Vec<Box<dyn UserEventStore>>, clock: Arc<dyn Clock>) -> Self {
        Self { stores, clock }
    }

    pub fn strategies(&self) -> Vec<&'static str> {
        self.stores.iter().map(|s| s.name()).collect()
    }

    /// Lower bound of a window ending now. Evaluated once per comparison so
    /// every strategy sees the same bound.
    pub fn since_for(&self, window_days: u32) -> i64 {
        self.clock.now_millis() - i64::from(window_days) * MILLIS_PER_DAY
    }

    pub fn filter_for(&self, action: &str, campaign: &str, window_days: u32) -> EventFilter {
        EventFilter::new(action, campaign, self.since_for(window_days))
    }

    pub fn run_comparison(
        &self,
        user_id: &str,
        action: &str,
        campaign: &str,
        window_days: u32,
    ) -> Comparison {
        let filter = self.filter_for(action, campaign, window_days);
        self.compare(user_id, &filter)
    }

    /// Every strategy is tried even if an earlier one fails.
    pub fn compare(&self, user_id: &str, filter: &EventFilter) -> Comparison {
        let outcomes = self
            .stores
            .iter()
            .map(|store| {
                let started = Instant::now();
                let result = store.count_matching(user_id, filter).map(|count| QueryTiming {
                    count,
                    elapsed: started.elapsed(),
                });
                match &result {
                    Ok(timing) => log::debug!(
                        "{} counted {} for {user_id} in {:.3} ms",
                        store.name(),
                        timing.count,
                        timing.elapsed_millis()
                    ),
                    Err(err) => log::warn!("{} failed for {user_id}: {err}", store.name()),
                }
                StrategyOutcome {
                    strategy: store.name(),
                    result,
                }
            })
            .collect();

        Comparison {
            user_id: user_id.to_string(),
            filter: filter.clone(),
            outcomes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::clock::SteppingClock;
    use crate::error::Error;
    use crate::event::EventRecord;
    use crate::udf::{ensure_registered, EVENT_MODULE};

    const NOW: i64 = 100 * MILLIS_PER_DAY;

    fn seed(backend: &Arc<MemoryBackend>, user: &str, events: &[EventRecord]) {
        MapStore::new(backend.clone(), "test")
            .put(user, events)
            .unwrap();
        let records = RecordStore::new(backend.clone(), "test");
        records.register_user(user).unwrap();
        for event in events {
            let sequence = records.increment_count(user).unwrap();
            records.put_event(user, sequence, event).unwrap();
        }
    }

    fn engine(backend: &Arc<MemoryBackend>) -> QueryEngine {
        QueryEngine::new(
            backend.clone(),
            "test",
            Arc::new(SteppingClock::fixed(NOW)),
        )
    }

    #[test]
    fn test_strategy_order() {
        let backend = Arc::new(MemoryBackend::new());
        assert_eq!(
            engine(&backend).strategies(),
            vec!["map", "aggregate", "records"]
        );
    }

    #[test]
    fn test_all_strategies_agree() {
        let backend = Arc::new(MemoryBackend::new());
        ensure_registered(&*backend, &EVENT_MODULE, Duration::from_secs(1)).unwrap();
        let events = vec![
            // Outside the 90 day window.
            EventRecord::new("birds", "tap", 5 * MILLIS_PER_DAY).unwrap(),
            // Exactly on the bound: excluded.
            EventRecord::new("birds", "tap", 10 * MILLIS_PER_DAY).unwrap(),
            EventRecord::new("birds", "tap", 10 * MILLIS_PER_DAY + 1).unwrap(),
            EventRecord::new("cats", "tap", 50 * MILLIS_PER_DAY).unwrap(),
            EventRecord::new("birds", "run", 60 * MILLIS_PER_DAY).unwrap(),
            EventRecord::new("birds", "tap", 99 * MILLIS_PER_DAY).unwrap(),
        ];
        seed(&backend, "user689", &events);

        let comparison = engine(&backend).run_comparison("user689", "tap", "birds", 90);
        assert_eq!(comparison.filter.since_millis, 10 * MILLIS_PER_DAY);
        assert!(comparison.all_succeeded());
        assert!(comparison.counts_agree());
        assert_eq!(
            comparison.counts(),
            vec![("map", 2), ("aggregate", 2), ("records", 2)]
        );
    }

    #[test]
    fn test_unknown_user_counts_zero() {
        let backend = Arc::new(MemoryBackend::new());
        ensure_registered(&*backend, &EVENT_MODULE, Duration::from_secs(1)).unwrap();
        let comparison = engine(&backend).run_comparison("ghost", "tap", "birds", 90);
        assert!(comparison.counts().iter().all(|(_, count)| *count == 0));
    }

    #[test]
    fn test_missing_module_does_not_stop_other_strategies() {
        let backend = Arc::new(MemoryBackend::without_modules());
        seed(
            &backend,
            "user1",
            &[EventRecord::new("birds", "tap", NOW - 1).unwrap()],
        );

        let comparison = engine(&backend).run_comparison("user1", "tap", "birds", 90);
        assert!(!comparison.all_succeeded());
        assert!(matches!(
            comparison.get("aggregate").unwrap().result,
            Err(Error::CapabilityUnavailable { .. })
        ));
        assert_eq!(comparison.counts(), vec![("map", 1), ("records", 1)]);
        assert!(comparison.counts_agree());
    }
}
