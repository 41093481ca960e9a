//! Persistence for the three JSON documents consumed by the dashboard.

mod document;
mod models;

pub use document::*;
pub use models::*;

use std::fs;
use std::path::Path;
use thiserror::Error;

pub const CLIENT_STATS_FILE: &str = "client_stats.json";
pub const TRAFFIC_STATS_FILE: &str = "traffic_stats.json";
pub const STATUS_STATS_FILE: &str = "status_stats.json";

/// Store error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The documents shared by all collectors. Each has its own lock.
pub struct Store {
    ping: Document<PingDocument>,
    traffic: Document<TrafficDocument>,
    status: Document<StatusRecord>,
}

impl Store {
    /// Open (or create) the documents inside `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        Ok(Self {
            ping: Document::open(dir.join(CLIENT_STATS_FILE)),
            traffic: Document::open(dir.join(TRAFFIC_STATS_FILE)),
            status: Document::open(dir.join(STATUS_STATS_FILE)),
        })
    }

    // --- client_stats.json ---

    /// Merge a cycle's snapshots with a single save.
    pub fn merge_ping(&self, snapshots: impl IntoIterator<Item = PingSnapshot>) -> Result<usize, StoreError> {
        self.ping
            .merge_and_save(snapshots.into_iter().map(|s| (s.target_id.clone(), s)))
    }

    pub fn ping_snapshot(&self, target_id: &str) -> Option<PingSnapshot> {
        self.ping.get(target_id)
    }

    // --- traffic_stats.json ---

    pub fn merge_traffic(
        &self,
        snapshots: impl IntoIterator<Item = TrafficSnapshot>,
    ) -> Result<usize, StoreError> {
        self.traffic
            .merge_and_save(snapshots.into_iter().map(|s| (s.target_id.clone(), s)))
    }

    pub fn traffic_snapshot(&self, target_id: &str) -> Option<TrafficSnapshot> {
        self.traffic.get(target_id)
    }

    /// Copy of every persisted traffic snapshot.
    pub fn traffic_snapshots(&self) -> TrafficDocument {
        self.traffic.read(|doc| doc.clone())
    }

    // --- status_stats.json ---

    /// Mutate the status record and save it atomically.
    pub fn update_status<R>(&self, f: impl FnOnce(&mut StatusRecord) -> R) -> Result<R, StoreError> {
        self.status.update(f)
    }

    pub fn status_record(&self) -> StatusRecord {
        self.status.read(|record| record.clone())
    }

    /// Retry any save that failed earlier. Every document is attempted; the
    /// first error is returned.
    pub fn flush(&self) -> Result<(), StoreError> {
        let results = [
            (self.ping.path(), self.ping.flush()),
            (self.traffic.path(), self.traffic.flush()),
            (self.status.path(), self.status.flush()),
        ];

        let mut first_err = None;
        for (path, result) in results {
            match result {
                Ok(true) => tracing::info!("Store: Flushed pending writes to {}", path.display()),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Store: Failed to flush {}: {}", path.display(), e);
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
