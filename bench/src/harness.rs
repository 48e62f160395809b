//! Repeated query comparisons and the post-load consistency sample.

use crate::report::{QueryReport, StrategyResult};
use events_core::backend::Backend;
use events_core::consistency::{verify_user, ConsistencyReport};
use events_core::load::Workload;
use events_core::query::QueryEngine;
use events_core::store::{MapStore, RecordStore};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub user_id: String,
    pub action: String,
    pub campaign: String,
    pub window_days: u32,
}

/// Run `warmup` unrecorded comparisons, then `samples` recorded ones.
///
/// The window bound is taken once so every sample asks the same question.
pub fn measure(
    engine: &QueryEngine,
    query: &QuerySpec,
    warmup: usize,
    samples: usize,
) -> QueryReport {
    let filter = engine.filter_for(&query.action, &query.campaign, query.window_days);

    for _ in 0..warmup {
        engine.compare(&query.user_id, &filter);
    }

    let mut results: Vec<StrategyResult> = engine
        .strategies()
        .into_iter()
        .map(StrategyResult::new)
        .collect();
    let mut disagreements = 0;

    for _ in 0..samples {
        let comparison = engine.compare(&query.user_id, &filter);
        if !comparison.counts_agree() {
            disagreements += 1;
        }
        for (result, outcome) in results.iter_mut().zip(&comparison.outcomes) {
            match &outcome.result {
                Ok(timing) => result.add_sample(timing.elapsed, timing.count),
                Err(err) => result.add_error(err.to_string()),
            }
        }
    }

    let strategies: Vec<_> = results.iter().map(StrategyResult::summary).collect();
    let mut counts = strategies.iter().filter_map(|s| s.count);
    let final_agree = match counts.next() {
        Some(first) => counts.all(|c| c == first),
        None => true,
    };

    QueryReport {
        user_id: query.user_id.clone(),
        action: query.action.clone(),
        campaign: query.campaign.clone(),
        window_days: query.window_days,
        since_millis: filter.since_millis,
        counts_agree: final_agree && disagreements == 0,
        disagreements,
        strategies,
    }
}

/// Check the first `users` users of `workload` for agreement between the
/// two physical layouts.
pub fn verify_sample(
    backend: Arc<dyn Backend>,
    namespace: &str,
    workload: &Workload,
    users: usize,
) -> events_core::Result<Vec<ConsistencyReport>> {
    let map = MapStore::new(backend.clone(), namespace);
    let records = RecordStore::new(backend, namespace);
    (0..users.min(workload.user_count))
        .map(|index| verify_user(&map, &records, &workload.user_id(index)))
        .collect()
}
