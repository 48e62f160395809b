//! `userevents`: populate the event layouts or compare query strategies.
//!
//! Usage:
//!   userevents -h 127.0.0.1 -p 3000 -n test -l   # write the synthetic load
//!   userevents -h 127.0.0.1 -p 3000 -n test      # compare the three strategies
//!   userevents --in-memory                       # both, against an in-process store
//!
//! `USEREVENTS_*` environment variables (or a `.env` file) supply defaults
//! for every flag.

use anyhow::{bail, Context, Result};
use clap::Parser;
use events_bench::config::{BenchConfig, Cli, Mode};
use events_bench::harness::{measure, verify_sample, QuerySpec};
use events_bench::report::print_report;
use events_core::backend::{Backend, WritePolicy};
use events_core::clock::{Clock, SystemClock};
use events_core::initialize_logger;
use events_core::load::LoadGenerator;
use events_core::query::QueryEngine;
use events_core::udf::{ensure_registered, EVENT_MODULE};
use std::process;
use std::sync::Arc;
use std::time::Duration;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    let cli = Cli::parse();
    let config = match BenchConfig::load(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(2);
        }
    };

    if let Err(err) = initialize_logger(config.log_level, config.log_file.as_deref()) {
        eprintln!("Failed to initialize logger: {err:#}");
        process::exit(1);
    }

    if let Err(err) = run(&config) {
        log::error!("{err:#}");
        process::exit(1);
    }
}

fn run(config: &BenchConfig) -> Result<()> {
    let backend = events_bench::connect(config)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // A missing module only disables the aggregate strategy.
    if let Err(err) = ensure_registered(&*backend, &EVENT_MODULE, REGISTRATION_TIMEOUT) {
        log::warn!("Aggregation module {} unavailable: {err}", EVENT_MODULE.name);
    }

    match config.mode {
        Mode::Load => run_load(config, backend, clock),
        Mode::Query => {
            // An in-process store starts empty.
            if config.in_memory {
                run_load(config, backend.clone(), clock.clone())?;
            }
            run_query(config, backend, clock)
        }
    }
}

fn run_load(config: &BenchConfig, backend: Arc<dyn Backend>, clock: Arc<dyn Clock>) -> Result<()> {
    let workload = config.workload();
    let generator = LoadGenerator::new(
        backend.clone(),
        &config.namespace,
        WritePolicy::with_retention_days(config.retention_days),
        clock,
    );

    let report = generator
        .generate(&workload)
        .context("Failed to generate load")?;
    log::info!(
        "Loaded {} users / {} events in {} ms ({:.0} events/s)",
        report.users_loaded,
        report.events_loaded,
        report.elapsed.as_millis(),
        report.events_per_sec()
    );

    let checks = verify_sample(backend, &config.namespace, &workload, config.verify_users)
        .context("Failed to verify loaded users")?;
    let inconsistent: Vec<_> = checks.iter().filter(|c| !c.is_consistent()).collect();
    if !inconsistent.is_empty() {
        for check in &inconsistent {
            log::error!(
                "{}: map has {} events, records have {}",
                check.user_id,
                check.map_events,
                check.record_events
            );
        }
        bail!("{} of {} sampled users differ between layouts", inconsistent.len(), checks.len());
    }
    log::info!("{} sampled users consistent across layouts", checks.len());
    Ok(())
}

fn run_query(config: &BenchConfig, backend: Arc<dyn Backend>, clock: Arc<dyn Clock>) -> Result<()> {
    let engine = QueryEngine::new(backend, &config.namespace, clock);
    let query = QuerySpec {
        user_id: config.query_user.clone(),
        action: config.query_action.clone(),
        campaign: config.query_campaign.clone(),
        window_days: config.window_days,
    };
    log::info!(
        "Comparing {} over {} warmup + {} samples",
        engine.strategies().join(", "),
        config.warmup,
        config.samples
    );

    let report = measure(&engine, &query, config.warmup, config.samples);
    if config.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        println!("{json}");
    } else {
        print_report(&report);
    }

    if !report.any_answered() {
        bail!("no strategy returned a count for {}", query.user_id);
    }
    if !report.counts_agree {
        bail!("strategies disagree on the count for {}", query.user_id);
    }
    Ok(())
}
