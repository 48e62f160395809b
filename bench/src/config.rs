//! Runtime configuration for the `userevents` driver.
//!
//! Sources, lowest to highest precedence: built-in defaults, a `.env` file,
//! `USEREVENTS_*` environment variables, command-line flags.

use anyhow::{Context, Result};
use clap::Parser;
use events_core::backend::KeyDbConfig;
use events_core::load::Workload;
use events_core::DEFAULT_RETENTION_DAYS;
use log::LevelFilter;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "USEREVENTS_";

/// Compare per-user event storage layouts on a key-value store.
///
/// Without `--load` the driver runs the query comparison.
#[derive(Parser, Debug, Default)]
#[command(name = "userevents", version, about, long_about = None)]
#[command(disable_help_flag = true)]
pub struct Cli {
    /// Server host
    #[arg(short = 'h', long)]
    pub host: Option<String>,

    /// Server port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Namespace for all records
    #[arg(short = 'n', long)]
    pub namespace: Option<String>,

    /// Generate and write the synthetic load instead of querying
    #[arg(short = 'l', long)]
    pub load: bool,

    /// Print usage and exit
    #[arg(short = 'u', long = "usage", action = clap::ArgAction::Help)]
    pub usage: Option<bool>,

    /// Run against an in-process backend (loads before querying)
    #[arg(long)]
    pub in_memory: bool,

    /// Number of users to generate
    #[arg(long)]
    pub users: Option<usize>,

    /// Upper bound (exclusive) on events per user
    #[arg(long)]
    pub max_events: Option<usize>,

    /// Workload seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// User to query
    #[arg(long)]
    pub user: Option<String>,

    /// Action to count
    #[arg(long)]
    pub action: Option<String>,

    /// Campaign to count
    #[arg(long)]
    pub campaign: Option<String>,

    /// Query window in days
    #[arg(long)]
    pub days: Option<u32>,

    /// Sampled comparisons per run
    #[arg(long)]
    pub samples: Option<usize>,

    /// Emit the report as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Load,
    Query,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchConfig {
    pub host: String,
    pub port: u16,
    pub namespace: String,
    /// Overrides the URL assembled from host and port.
    pub keydb_url: Option<String>,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub in_memory: bool,
    pub mode: Mode,

    pub users: usize,
    pub max_events: usize,
    pub seed: u64,
    pub pacing: Duration,
    pub retention_days: u32,

    pub query_user: String,
    pub query_action: String,
    pub query_campaign: String,
    pub window_days: u32,
    pub warmup: usize,
    pub samples: usize,
    /// Users checked for layout consistency after a load.
    pub verify_users: usize,

    pub json: bool,
    pub log_level: LevelFilter,
    pub log_file: Option<String>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        let workload = Workload::standard();
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            namespace: "test".to_string(),
            keydb_url: None,
            connect_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(5),
            in_memory: false,
            mode: Mode::Query,
            users: workload.user_count,
            max_events: workload.max_events_per_user,
            seed: workload.seed,
            pacing: workload.pacing,
            retention_days: DEFAULT_RETENTION_DAYS,
            query_user: "user689".to_string(),
            query_action: "tap".to_string(),
            query_campaign: "birds".to_string(),
            window_days: 90,
            warmup: 5,
            samples: 50,
            verify_users: 10,
            json: false,
            log_level: LevelFilter::Info,
            log_file: None,
        }
    }
}

impl BenchConfig {
    /// Defaults, then `.env`, then the process environment, then `cli`.
    pub fn load(cli: &Cli) -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            eprintln!("  Loaded environment from {}", path.display());
        }
        let mut config = Self::default();
        config.apply_env(|name| env::var(name).ok())?;
        config.apply_cli(cli)?;
        Ok(config)
    }

    /// Apply `USEREVENTS_*` variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(host) = var("HOST") {
            self.host = host;
        }
        if let Some(port) = var("PORT") {
            self.port = parse_var("PORT", &port)?;
        }
        if let Some(namespace) = var("NAMESPACE") {
            self.namespace = namespace;
        }
        if let Some(url) = var("KEYDB_URL") {
            self.keydb_url = Some(url);
        }
        if let Some(ms) = var("CONNECT_TIMEOUT_MS") {
            self.connect_timeout = Duration::from_millis(parse_var("CONNECT_TIMEOUT_MS", &ms)?);
        }
        if let Some(ms) = var("RESPONSE_TIMEOUT_MS") {
            self.response_timeout = Duration::from_millis(parse_var("RESPONSE_TIMEOUT_MS", &ms)?);
        }
        if let Some(users) = var("USERS") {
            self.users = parse_var("USERS", &users)?;
        }
        if let Some(max) = var("MAX_EVENTS") {
            self.max_events = parse_var("MAX_EVENTS", &max)?;
        }
        if let Some(seed) = var("SEED") {
            self.seed = parse_var("SEED", &seed)?;
        }
        if let Some(ms) = var("PACING_MS") {
            self.pacing = Duration::from_millis(parse_var("PACING_MS", &ms)?);
        }
        if let Some(days) = var("RETENTION_DAYS") {
            self.retention_days = parse_var("RETENTION_DAYS", &days)?;
        }
        if let Some(samples) = var("SAMPLES") {
            self.samples = parse_var("SAMPLES", &samples)?;
        }
        if let Some(warmup) = var("WARMUP") {
            self.warmup = parse_var("WARMUP", &warmup)?;
        }
        if let Some(verify) = var("VERIFY_USERS") {
            self.verify_users = parse_var("VERIFY_USERS", &verify)?;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = parse_var("LOG_LEVEL", &level)?;
        }
        if let Some(file) = var("LOG_FILE") {
            self.log_file = Some(file);
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &Cli) -> Result<()> {
        if let Some(host) = &cli.host {
            self.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(namespace) = &cli.namespace {
            self.namespace = namespace.clone();
        }
        if cli.load {
            self.mode = Mode::Load;
        }
        self.in_memory |= cli.in_memory;
        self.json |= cli.json;
        if let Some(users) = cli.users {
            self.users = users;
        }
        if let Some(max) = cli.max_events {
            self.max_events = max;
        }
        if let Some(seed) = cli.seed {
            self.seed = seed;
        }
        if let Some(user) = &cli.user {
            self.query_user = user.clone();
        }
        if let Some(action) = &cli.action {
            self.query_action = action.clone();
        }
        if let Some(campaign) = &cli.campaign {
            self.query_campaign = campaign.clone();
        }
        if let Some(days) = cli.days {
            self.window_days = days;
        }
        if let Some(samples) = cli.samples {
            self.samples = samples;
        }
        if let Some(level) = &cli.log_level {
            self.log_level = level
                .parse()
                .with_context(|| format!("invalid log level {level:?}"))?;
        }
        Ok(())
    }

    pub fn keydb(&self) -> KeyDbConfig {
        let mut keydb = KeyDbConfig::new(&self.host, self.port);
        if let Some(url) = &self.keydb_url {
            keydb.url = url.clone();
        }
        keydb.connect_timeout = self.connect_timeout;
        keydb.response_timeout = self.response_timeout;
        keydb
    }

    pub fn workload(&self) -> Workload {
        Workload {
            user_count: self.users,
            max_events_per_user: self.max_events,
            seed: self.seed,
            pacing: self.pacing,
            ..Workload::standard()
        }
    }
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("invalid value {raw:?} for {ENV_PREFIX}{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BenchConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert_eq!(config.namespace, "test");
        assert_eq!(config.mode, Mode::Query);
        assert_eq!((config.users, config.max_events, config.seed), (1000, 500, 10));
        assert_eq!(config.query_user, "user689");
        assert_eq!(config.keydb().url, "redis://127.0.0.1:3000/");
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config = BenchConfig::default();
        config
            .apply_env(env_of(&[
                ("USEREVENTS_HOST", "db.internal"),
                ("USEREVENTS_PORT", "6379"),
                ("USEREVENTS_SEED", "42"),
            ]))
            .unwrap();
        let cli = Cli::try_parse_from(["userevents", "-p", "5556", "-l", "-n", "bench"]).unwrap();
        config.apply_cli(&cli).unwrap();

        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 5556);
        assert_eq!(config.seed, 42);
        assert_eq!(config.namespace, "bench");
        assert_eq!(config.mode, Mode::Load);
    }

    #[test]
    fn test_keydb_url_override() {
        let mut config = BenchConfig::default();
        config
            .apply_env(env_of(&[("USEREVENTS_KEYDB_URL", "redis://cache:5556/")]))
            .unwrap();
        assert_eq!(config.keydb().url, "redis://cache:5556/");
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = BenchConfig::default();
        let err = config
            .apply_env(env_of(&[("USEREVENTS_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(err.to_string().contains("USEREVENTS_PORT"));
    }

    #[test]
    fn test_short_h_is_host() {
        let cli = Cli::try_parse_from(["userevents", "-h", "10.0.0.5"]).unwrap();
        assert_eq!(cli.host.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_usage_flag_prints_help() {
        let err = Cli::try_parse_from(["userevents", "-u"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
