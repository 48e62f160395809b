//! Report module: latency statistics per strategy and the printed comparison.

use serde::Serialize;
use std::time::Duration;

/// Samples collected for one strategy.
#[derive(Debug, Clone, Default)]
pub struct StrategyResult {
    pub strategy: String,
    pub durations: Vec<Duration>,
    /// Count returned by the most recent successful sample.
    pub count: Option<u64>,
    pub errors: usize,
    pub last_error: Option<String>,
}

impl StrategyResult {
    pub fn new(strategy: &str) -> Self {
        Self {
            strategy: strategy.to_string(),
            ..Self::default()
        }
    }

    pub fn add_sample(&mut self, elapsed: Duration, count: u64) {
        self.durations.push(elapsed);
        self.count = Some(count);
    }

    pub fn add_error(&mut self, error: String) {
        self.errors += 1;
        self.last_error = Some(error);
    }

    pub fn mean_us(&self) -> f64 {
        if self.durations.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.durations.iter().map(|d| d.as_secs_f64() * 1e6).sum();
        sum / self.durations.len() as f64
    }

    pub fn percentile_us(&self, pct: f64) -> f64 {
        if self.durations.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self
            .durations
            .iter()
            .map(|d| d.as_secs_f64() * 1e6)
            .collect();
        sorted.sort_by(f64::total_cmp);
        let idx = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    pub fn summary(&self) -> StrategySummary {
        StrategySummary {
            strategy: self.strategy.clone(),
            count: self.count,
            samples: self.durations.len(),
            errors: self.errors,
            mean_us: self.mean_us(),
            p50_us: self.percentile_us(50.0),
            p95_us: self.percentile_us(95.0),
            p99_us: self.percentile_us(99.0),
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategySummary {
    pub strategy: String,
    pub count: Option<u64>,
    pub samples: usize,
    pub errors: usize,
    pub mean_us: f64,
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Everything the driver reports about one query run.
#[derive(Debug, Clone, Serialize)]
pub struct QueryReport {
    pub user_id: String,
    pub action: String,
    pub campaign: String,
    pub window_days: u32,
    pub since_millis: i64,
    pub counts_agree: bool,
    pub disagreements: usize,
    pub strategies: Vec<StrategySummary>,
}

impl QueryReport {
    /// True when at least one strategy returned a count.
    pub fn any_answered(&self) -> bool {
        self.strategies.iter().any(|s| s.count.is_some())
    }
}

/// Print a formatted report comparing strategy results.
pub fn print_report(report: &QueryReport) {
    println!("\n{}", "=".repeat(72));
    println!("  User Event Query Report");
    println!(
        "  {} / {} / {} over the last {} days (since {})",
        report.user_id, report.action, report.campaign, report.window_days, report.since_millis
    );
    println!("{}", "=".repeat(72));

    println!(
        "\n  {:12} {:>8} {:>8} {:>12} {:>12} {:>12} {:>12}",
        "Strategy", "Count", "Errors", "Mean (µs)", "p50 (µs)", "p95 (µs)", "p99 (µs)"
    );
    println!("  {}", "-".repeat(82));
    for s in &report.strategies {
        let count = s
            .count
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:12} {:>8} {:>8} {:>12.0} {:>12.0} {:>12.0} {:>12.0}",
            s.strategy, count, s.errors, s.mean_us, s.p50_us, s.p95_us, s.p99_us
        );
    }

    for s in &report.strategies {
        if let Some(err) = &s.last_error {
            println!("\n  {} failed: {}", s.strategy, err);
        }
    }

    let verdict = if report.counts_agree {
        "all strategies agree"
    } else {
        "COUNTS DIFFER"
    };
    println!("\n  Agreement:  {verdict} ({} disagreeing samples)", report.disagreements);
    println!("\n{}", "=".repeat(72));
    println!();
}
