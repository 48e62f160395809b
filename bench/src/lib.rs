//! Load generator and latency comparison driver for the per-user event
//! storage layouts in `events_core`.
//!
//! Run the driver: `cargo run --release --bin userevents -- --help`
//! Run benchmarks: `cargo bench`

pub mod config;
pub mod harness;
pub mod report;

use anyhow::{Context, Result};
use config::BenchConfig;
use events_core::backend::{Backend, KeyDbBackend, MemoryBackend};
use std::sync::Arc;

/// The backend selected by `config`: in-process or a KeyDB connection.
pub fn connect(config: &BenchConfig) -> Result<Arc<dyn Backend>> {
    if config.in_memory {
        log::info!("Using in-process backend");
        return Ok(Arc::new(MemoryBackend::new()));
    }
    let keydb = config.keydb();
    let backend = KeyDbBackend::connect(&keydb)
        .with_context(|| format!("Failed to reach KeyDB at {}", keydb.url))?;
    log::info!("Connected to {}", keydb.url);
    Ok(Arc::new(backend))
}
