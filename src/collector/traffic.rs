//! Traffic collector: cumulative byte counters per target.
//!
//! Absolute counters are persisted. Deltas and rates are derived from the
//! previous snapshot each cycle and only reported in the log.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{format_bytes, Collector};
use crate::registry::TargetRegistry;
use crate::source::{find_session, ClientSession, SessionSource, SourceError};
use crate::store::{Store, Target, TrafficSnapshot};

/// Counter movement between two observations of the same target.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrafficDelta {
    pub received: u64,
    pub sent: u64,
    /// A counter went backwards (server restart or client reconnect).
    pub reset: bool,
    pub elapsed_secs: f64,
}

impl TrafficDelta {
    pub fn total(&self) -> u64 {
        self.received.saturating_add(self.sent)
    }

    /// Bytes per second, when there is a previous observation to compare with.
    pub fn rate(&self) -> Option<f64> {
        (self.elapsed_secs > 0.0).then(|| self.total() as f64 / self.elapsed_secs)
    }
}

/// Delta of one counter. A smaller reading rebases at the new value.
fn counter_delta(previous: u64, current: u64) -> (u64, bool) {
    if current < previous {
        (0, true)
    } else {
        (current - previous, false)
    }
}

/// Build the new snapshot for `target` from its session and the previous snapshot.
pub fn apply_session(
    target: &Target,
    session: &ClientSession,
    previous: Option<&TrafficSnapshot>,
    now: DateTime<Utc>,
) -> (TrafficSnapshot, TrafficDelta) {
    let delta = match previous {
        Some(prev) => {
            let (received, rx_reset) = counter_delta(prev.bytes_received, session.bytes_received);
            let (sent, tx_reset) = counter_delta(prev.bytes_sent, session.bytes_sent);
            TrafficDelta {
                received,
                sent,
                reset: rx_reset || tx_reset,
                elapsed_secs: (now - prev.timestamp).num_milliseconds().max(0) as f64 / 1000.0,
            }
        }
        None => TrafficDelta::default(),
    };

    let snapshot = TrafficSnapshot {
        target_id: target.id.clone(),
        name: session.common_name.clone(),
        ip: session
            .virtual_address
            .clone()
            .unwrap_or_else(|| target.host.clone()),
        real_ip: session.real_ip.clone(),
        bytes_received: session.bytes_received,
        bytes_sent: session.bytes_sent,
        total_traffic: session.bytes_received.saturating_add(session.bytes_sent),
        last_seen: session.last_seen().unwrap_or(now),
        timestamp: now,
    };

    (snapshot, delta)
}

/// Reads session counters each cycle and merges them into `traffic_stats.json`.
pub struct TrafficCollector<S> {
    registry: TargetRegistry,
    source: Arc<S>,
    store: Arc<Store>,
    read_timeout: Duration,
    previous: HashMap<String, TrafficSnapshot>,
}

impl<S: SessionSource> TrafficCollector<S> {
    /// Previous counters are seeded from the persisted document.
    pub fn new(registry: TargetRegistry, source: Arc<S>, store: Arc<Store>, read_timeout: Duration) -> Self {
        let previous = store.traffic_snapshots().into_iter().collect();
        Self {
            registry,
            source,
            store,
            read_timeout,
            previous,
        }
    }

    async fn read_sessions(&self) -> Result<Vec<ClientSession>, SourceError> {
        match tokio::time::timeout(self.read_timeout, self.source.sessions()).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(self.read_timeout)),
        }
    }

    /// Update `target` from the current session list.
    ///
    /// Returns `None` when the target has no session; its last snapshot is
    /// then left alone.
    pub fn collect(
        &mut self,
        target: &Target,
        sessions: &[ClientSession],
        now: DateTime<Utc>,
    ) -> Option<(TrafficSnapshot, TrafficDelta)> {
        let session = find_session(sessions, &target.host)?;
        let (snapshot, delta) = apply_session(target, session, self.previous.get(&target.id), now);
        self.previous.insert(target.id.clone(), snapshot.clone());
        Some((snapshot, delta))
    }
}

impl<S: SessionSource> Collector for TrafficCollector<S> {
    fn name(&self) -> &'static str {
        "traffic"
    }

    fn run_cycle(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            let sessions = match self.read_sessions().await {
                Ok(sessions) => sessions,
                Err(e) => {
                    tracing::warn!("Traffic: Failed to read client sessions: {}", e);
                    return;
                }
            };

            let now = Utc::now();
            let registry = self.registry.clone();
            let mut snapshots = Vec::with_capacity(registry.len());
            for target in registry.iter() {
                let Some((snapshot, delta)) = self.collect(target, &sessions, now) else {
                    tracing::debug!("Traffic: No session for {}, keeping last snapshot", target.host);
                    continue;
                };

                if delta.reset {
                    tracing::warn!(
                        "Traffic: Counters for {} went backwards, rebasing at rx={} tx={}",
                        target.host,
                        snapshot.bytes_received,
                        snapshot.bytes_sent
                    );
                }

                let rate = delta
                    .rate()
                    .map(|r| format!("{}/s", format_bytes(r)))
                    .unwrap_or_else(|| "n/a".to_string());
                tracing::info!(
                    "Traffic: {} ({}) rx={} tx={} total={} rate={}",
                    target.host,
                    snapshot.name,
                    format_bytes(snapshot.bytes_received as f64),
                    format_bytes(snapshot.bytes_sent as f64),
                    format_bytes(snapshot.total_traffic as f64),
                    rate
                );

                snapshots.push(snapshot);
            }

            let count = snapshots.len();
            if let Err(e) = self.store.merge_traffic(snapshots) {
                tracing::error!("Traffic: Failed to save {} snapshots: {}", count, e);
            }
        }
    }
}
