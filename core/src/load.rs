//! Synthetic workload generation.
//!
//! A [`Workload`] expands into a deterministic [`UserPlan`] per user (how many
//! events, which campaign and action each one is). [`LoadGenerator`] walks
//! the plan and writes every event into both physical layouts, stamping each
//! with the clock at the moment it is generated.

use crate::backend::{Backend, WritePolicy};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::event::EventRecord;
use crate::store::{MapStore, RecordStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_CAMPAIGNS: [&str; 11] = [
    "cats",
    "dogs",
    "mice",
    "sheep",
    "chickens",
    "cows",
    "snakes",
    "fish",
    "elephants",
    "birds",
    "lizards",
];

pub const DEFAULT_ACTIONS: [&str; 11] = [
    "click", "tap", "clap", "dance", "climb", "walk", "run", "swim", "sail", "fly", "drive",
];

const PROGRESS_EVERY_USERS: usize = 100;

/// Shape of a synthetic load run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub user_count: usize,
    /// Each user gets `U[0, max_events_per_user)` events.
    pub max_events_per_user: usize,
    pub seed: u64,
    pub campaigns: Vec<String>,
    pub actions: Vec<String>,
    /// Minimum delay between two events of the same user.
    pub pacing: Duration,
    /// User ids are `{user_prefix}{index}`.
    pub user_prefix: String,
}

impl Workload {
    /// 1000 users, up to 500 events each, seed 10, the default campaigns and
    /// actions, 1 ms pacing.
    pub fn standard() -> Self {
        Self {
            user_count: 1000,
            max_events_per_user: 500,
            seed: 10,
            campaigns: DEFAULT_CAMPAIGNS.iter().map(|s| s.to_string()).collect(),
            actions: DEFAULT_ACTIONS.iter().map(|s| s.to_string()).collect(),
            pacing: Duration::from_millis(1),
            user_prefix: "user".to_string(),
        }
    }

    pub fn user_id(&self, index: usize) -> String {
        format!("{}{index}", self.user_prefix)
    }

    pub fn validate(&self) -> Result<()> {
        if self.campaigns.is_empty() {
            return Err(Error::InvalidWorkload("no campaigns".to_string()));
        }
        if self.actions.is_empty() {
            return Err(Error::InvalidWorkload("no actions".to_string()));
        }
        for campaign in &self.campaigns {
            EventRecord::new(campaign.as_str(), "probe", 0)
                .map_err(|err| Error::InvalidWorkload(err.to_string()))?;
        }
        for action in &self.actions {
            EventRecord::new("probe", action.as_str(), 0)
                .map_err(|err| Error::InvalidWorkload(err.to_string()))?;
        }
        Ok(())
    }

    /// The deterministic per-user plan, lazily generated from the seed.
    pub fn plan(&self) -> Result<WorkloadPlan<'_>> {
        self.validate()?;
        Ok(WorkloadPlan {
            workload: self,
            rng: StdRng::seed_from_u64(self.seed),
            next_user: 0,
        })
    }
}

/// The events to generate for one user, without timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPlan {
    pub user_id: String,
    /// `(campaign, action)` in generation order.
    pub events: Vec<(String, String)>,
}

/// Iterator over [`UserPlan`]s. Draw order per user: event count, then
/// campaign and action for each event.
pub struct WorkloadPlan<'a> {
    workload: &'a Workload,
    rng: StdRng,
    next_user: usize,
}

impl Iterator for WorkloadPlan<'_> {
    type Item = UserPlan;

    fn next(&mut self) -> Option<UserPlan> {
        if self.next_user >= self.workload.user_count {
            return None;
        }
        let index = self.next_user;
        self.next_user += 1;

        let event_count = if self.workload.max_events_per_user == 0 {
            0
        } else {
            self.rng.gen_range(0..self.workload.max_events_per_user)
        };
        let campaigns = &self.workload.campaigns;
        let actions = &self.workload.actions;
        let events = (0..event_count)
            .map(|_| {
                let campaign = &campaigns[self.rng.gen_range(0..campaigns.len())];
                let action = &actions[self.rng.gen_range(0..actions.len())];
                (campaign.clone(), action.clone())
            })
            .collect();

        Some(UserPlan {
            user_id: self.workload.user_id(index),
            events,
        })
    }
}

/// Outcome of a load run (or the part of it that completed).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Users whose events are fully written to both layouts.
    pub users_loaded: usize,
    /// Event records written to the record layout.
    pub events_loaded: usize,
    pub elapsed: Duration,
}

impl LoadReport {
    pub fn events_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.events_loaded as f64 / secs
    }
}

/// A load run that stopped on an error. Everything counted in `partial` is
/// already written and stays written.
#[derive(Debug, Error)]
#[error(
    "load aborted after {} users / {} events: {source}",
    .partial.users_loaded,
    .partial.events_loaded
)]
pub struct LoadAborted {
    pub partial: LoadReport,
    #[source]
    pub source: Error,
}

pub struct LoadGenerator {
    map_store: MapStore,
    record_store: RecordStore,
    clock: Arc<dyn Clock>,
}

impl LoadGenerator {
    pub fn new(
        backend: Arc<dyn Backend>,
        namespace: &str,
        policy: WritePolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            map_store: MapStore::new(backend.clone(), namespace).with_policy(policy),
            record_store: RecordStore::new(backend, namespace).with_policy(policy),
            clock,
        }
    }

    pub fn generate(&self, workload: &Workload) -> std::result::Result<LoadReport, LoadAborted> {
        let started = Instant::now();
        let mut report = LoadReport::default();

        let plan = workload.plan().map_err(|source| LoadAborted {
            partial: report.clone(),
            source,
        })?;

        log::info!(
            "Writing events for {} users (seed {}, up to {} events each)",
            workload.user_count,
            workload.seed,
            workload.max_events_per_user
        );
        for user in plan {
            if let Err(source) = self.load_user(&user, workload.pacing, &mut report) {
                report.elapsed = started.elapsed();
                log::error!(
                    "Load stopped at {} after {} users: {source}",
                    user.user_id,
                    report.users_loaded
                );
                return Err(LoadAborted {
                    partial: report,
                    source,
                });
            }
            report.users_loaded += 1;
            if report.users_loaded % PROGRESS_EVERY_USERS == 0 {
                log::info!(
                    "  {} users, {} events written",
                    report.users_loaded,
                    report.events_loaded
                );
            }
        }

        report.elapsed = started.elapsed();
        log::info!(
            "Completed data load in: {} ms ({} users, {} events)",
            report.elapsed.as_millis(),
            report.users_loaded,
            report.events_loaded
        );
        Ok(report)
    }

    /// Record layout first, event by event; the map layout gets the whole
    /// history in one write once the user's events are generated.
    fn load_user(&self, user: &UserPlan, pacing: Duration, report: &mut LoadReport) -> Result<()> {
        self.record_store.register_user(&user.user_id)?;

        let mut events = Vec::with_capacity(user.events.len());
        let mut last_ts: Option<i64> = None;
        for (campaign, action) in &user.events {
            if !pacing.is_zero() {
                self.clock.pause(pacing);
            }
            let mut ts = self.clock.now_millis();
            if let Some(prev) = last_ts {
                if ts <= prev {
                    ts = prev + 1;
                }
            }
            last_ts = Some(ts);

            let event = EventRecord::new(campaign.as_str(), action.as_str(), ts)?;
            let sequence = self.record_store.increment_count(&user.user_id)?;
            self.record_store
                .put_event(&user.user_id, sequence, &event)?;
            report.events_loaded += 1;
            events.push(event);
        }

        self.map_store.put(&user.user_id, &events)
    }
}
