//! Configuration module for the monitor.
//!
//! Command line flags (each with a `SUBNETX_*` environment fallback) are
//! parsed by clap and validated into a [`MonitorConfig`].

use clap::Parser;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::collector::{QualityThresholds, TransitionPolicy};
use crate::probe::ProbeConfig;
use crate::store::Target;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no targets configured, use --target or --targets-file")]
    NoTargets,
    #[error("invalid target host {0:?}")]
    InvalidHost(String),
    #[error("cannot read targets file {path}: {source}")]
    TargetsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid targets file {path}: {source}")]
    TargetsFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "subnetx-monitor")]
#[command(about = "Latency, traffic and connection status monitor for VPN clients")]
#[command(version)]
pub struct Cli {
    /// Host to monitor; repeat the flag or separate with commas
    #[arg(long = "target", env = "SUBNETX_TARGETS", value_delimiter = ',')]
    pub targets: Vec<String>,

    /// JSON file with an array of {"host", "description"} objects
    #[arg(long, env = "SUBNETX_TARGETS_FILE")]
    pub targets_file: Option<PathBuf>,

    /// Collection interval in seconds
    #[arg(long, env = "SUBNETX_INTERVAL", default_value_t = 10)]
    pub interval: u64,

    /// Stop after this many seconds (runs until signalled if omitted)
    #[arg(long, env = "SUBNETX_DURATION")]
    pub duration: Option<u64>,

    /// OpenVPN server status file
    #[arg(long, env = "SUBNETX_STATUS_FILE", default_value = "/var/log/openvpn/status.log")]
    pub status_file: PathBuf,

    /// Directory for the JSON documents
    #[arg(long, env = "SUBNETX_DATA_DIR", default_value = "/var/log/subnetx")]
    pub data_dir: PathBuf,

    /// Directory for log files
    #[arg(long, env = "SUBNETX_LOG_DIR", default_value = "/var/log/subnetx")]
    pub log_dir: PathBuf,

    /// Rotate a log file once it reaches this size
    #[arg(long, env = "SUBNETX_LOG_MAX_BYTES", default_value_t = 10 * 1024 * 1024)]
    pub log_max_bytes: u64,

    /// Echo requests per probe round
    #[arg(long, env = "SUBNETX_PING_COUNT", default_value_t = 5)]
    pub ping_count: u32,

    /// Wait for each echo reply, in milliseconds
    #[arg(long, env = "SUBNETX_PROBE_TIMEOUT_MS", default_value_t = 1500)]
    pub probe_timeout_ms: u64,

    /// Unreachable cycles tolerated before a connected client times out
    #[arg(long, env = "SUBNETX_TIMEOUT_CYCLES", default_value_t = 3)]
    pub timeout_cycles: u32,

    /// Seconds without contact before a timed-out client is disconnected
    /// (default: 10 x interval)
    #[arg(long, env = "SUBNETX_LONG_TIMEOUT")]
    pub long_timeout: Option<u64>,

    /// Concurrent probe rounds
    #[arg(long, env = "SUBNETX_WORKERS", default_value_t = 16)]
    pub workers: usize,

    /// Bound on reading the status file, in milliseconds
    #[arg(long, env = "SUBNETX_SOURCE_TIMEOUT_MS", default_value_t = 5000)]
    pub source_timeout_ms: u64,

    /// Seconds to wait for in-flight cycles on shutdown
    #[arg(long, env = "SUBNETX_SHUTDOWN_GRACE", default_value_t = 10)]
    pub shutdown_grace: u64,

    /// Enable debug console logging
    #[arg(short, long, env = "SUBNETX_VERBOSE")]
    pub verbose: bool,
}

#[derive(Debug, Deserialize)]
struct TargetEntry {
    host: String,
    #[serde(default)]
    description: Option<String>,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub targets: Vec<Target>,
    pub interval: Duration,
    pub duration: Option<Duration>,
    pub status_file: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_max_bytes: u64,
    pub probe: ProbeConfig,
    pub thresholds: QualityThresholds,
    pub policy: TransitionPolicy,
    pub workers: usize,
    pub source_timeout: Duration,
    pub shutdown_grace: Duration,
    pub verbose: bool,
    /// Hosts listed more than once; only the first entry is kept.
    pub duplicate_hosts: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            interval: Duration::from_secs(10),
            duration: None,
            status_file: PathBuf::from("/var/log/openvpn/status.log"),
            data_dir: PathBuf::from("/var/log/subnetx"),
            log_dir: PathBuf::from("/var/log/subnetx"),
            log_max_bytes: 10 * 1024 * 1024,
            probe: ProbeConfig::default(),
            thresholds: QualityThresholds::default(),
            policy: TransitionPolicy::default(),
            workers: 16,
            source_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            verbose: false,
            duplicate_hosts: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Validate parsed flags and load the target list.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let mut entries: Vec<TargetEntry> = cli
            .targets
            .iter()
            .map(|host| TargetEntry {
                host: host.clone(),
                description: None,
            })
            .collect();
        if let Some(path) = &cli.targets_file {
            entries.extend(load_targets_file(path)?);
        }

        let (targets, duplicate_hosts) = build_targets(entries)?;
        if targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }

        if cli.interval == 0 {
            return Err(ConfigError::Invalid("interval must be at least 1 second".to_string()));
        }
        let interval = Duration::from_secs(cli.interval);

        let probe_timeout = Duration::from_millis(cli.probe_timeout_ms);
        if probe_timeout.is_zero() || probe_timeout >= interval {
            return Err(ConfigError::Invalid(format!(
                "probe timeout {:?} must be positive and below the interval {:?}",
                probe_timeout, interval
            )));
        }

        let source_timeout = Duration::from_millis(cli.source_timeout_ms);
        if source_timeout.is_zero() || source_timeout >= interval {
            return Err(ConfigError::Invalid(format!(
                "source timeout {:?} must be positive and below the interval {:?}",
                source_timeout, interval
            )));
        }

        if cli.ping_count == 0 {
            return Err(ConfigError::Invalid("ping count must be at least 1".to_string()));
        }
        let probe = ProbeConfig {
            count: cli.ping_count,
            timeout: probe_timeout,
            ..Default::default()
        };
        // A whole round has to finish before the next tick.
        if probe.worst_case_round() >= interval {
            return Err(ConfigError::Invalid(format!(
                "a round of {} echoes can take {:?}, which does not fit the interval {:?}",
                probe.count,
                probe.worst_case_round(),
                interval
            )));
        }

        if cli.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if cli.duration == Some(0) {
            return Err(ConfigError::Invalid("duration must be at least 1 second".to_string()));
        }

        let long_timeout_secs = cli.long_timeout.unwrap_or(cli.interval.saturating_mul(10));
        let long_timeout = i64::try_from(long_timeout_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .ok_or_else(|| {
                ConfigError::Invalid(format!("long timeout of {} seconds is out of range", long_timeout_secs))
            })?;

        Ok(Self {
            targets,
            interval,
            duration: cli.duration.map(Duration::from_secs),
            status_file: cli.status_file,
            data_dir: cli.data_dir,
            log_dir: cli.log_dir,
            log_max_bytes: cli.log_max_bytes,
            probe,
            thresholds: QualityThresholds::default(),
            policy: TransitionPolicy {
                timeout_cycles: cli.timeout_cycles,
                long_timeout,
            },
            workers: cli.workers,
            source_timeout,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace),
            verbose: cli.verbose,
            duplicate_hosts,
        })
    }
}

fn load_targets_file(path: &Path) -> Result<Vec<TargetEntry>, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::TargetsFile {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::TargetsFormat {
        path: path.to_path_buf(),
        source,
    })
}

/// Check hosts and collapse duplicates, keeping the first occurrence.
fn build_targets(entries: Vec<TargetEntry>) -> Result<(Vec<Target>, Vec<String>), ConfigError> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    let mut duplicates = Vec::new();

    for entry in entries {
        let host = entry.host.trim();
        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidHost(entry.host));
        }

        if !seen.insert(host.to_string()) {
            duplicates.push(host.to_string());
            continue;
        }

        let description = entry.description.filter(|d| !d.trim().is_empty());
        targets.push(Target::new(host, description));
    }

    Ok((targets, duplicates))
}
