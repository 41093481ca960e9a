//! Tracing setup: console output plus size-rotated log files.
//!
//! `monitor.log` receives every event from this crate. Each collector also
//! gets its own file, selected by module path.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Rotated generations kept next to each log file.
pub const LOG_GENERATIONS: u32 = 5;

const CRATE_TARGET: &str = "subnetx_monitor";

/// Log files and the module paths routed into them.
const COLLECTOR_LOGS: [(&str, &[&str]); 3] = [
    (
        "ping_monitor.log",
        &["subnetx_monitor::collector::ping", "subnetx_monitor::probe"],
    ),
    (
        "traffic_monitor.log",
        &["subnetx_monitor::collector::traffic", "subnetx_monitor::source"],
    ),
    ("status_monitor.log", &["subnetx_monitor::collector::status"]),
];

/// Logging setup error types.
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("cannot open log file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("subscriber already installed: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Append-only file that rolls over to `name.1` ... `name.N` once it
/// reaches `max_bytes`.
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    max_files: u32,
    file: File,
    written: u64,
}

impl RotatingFile {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, max_files: u32) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            path,
            max_bytes,
            max_files,
            file,
            written,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.max_files > 0 {
            let oldest = rotated_path(&self.path, self.max_files);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for i in (1..self.max_files).rev() {
                let from = rotated_path(&self.path, i);
                if from.exists() {
                    fs::rename(&from, rotated_path(&self.path, i + 1))?;
                }
            }
            fs::rename(&self.path, rotated_path(&self.path, 1))?;
        }

        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn rotated_path(base: &Path, index: u32) -> PathBuf {
    let mut name = base.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}", index));
    base.with_file_name(name)
}

fn file_layer(
    dir: &Path,
    name: &str,
    max_bytes: u64,
    filter: Targets,
) -> Result<Box<dyn Layer<Registry> + Send + Sync>, LoggingError> {
    let path = dir.join(name);
    let file = RotatingFile::open(&path, max_bytes, LOG_GENERATIONS)
        .map_err(|source| LoggingError::Open { path, source })?;

    Ok(fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(filter)
        .boxed())
}

/// Install the global subscriber.
pub fn init(log_dir: &Path, max_bytes: u64, verbose: bool) -> Result<(), LoggingError> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let default_directive = format!("{}={}", CRATE_TARGET, if verbose { "debug" } else { "info" });
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let mut layers = vec![fmt::layer().with_filter(console_filter).boxed()];

    layers.push(file_layer(
        log_dir,
        "monitor.log",
        max_bytes,
        Targets::new().with_target(CRATE_TARGET, level),
    )?);
    for (name, modules) in COLLECTOR_LOGS {
        let filter = modules
            .iter()
            .fold(Targets::new(), |filter, module| filter.with_target(*module, level));
        layers.push(file_layer(log_dir, name, max_bytes, filter)?);
    }

    tracing_subscriber::registry().with(layers).try_init()?;
    Ok(())
}
