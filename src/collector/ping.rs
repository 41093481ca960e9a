//! Ping collector: latency, loss and quality per target.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{Collector, QualityThresholds};
use crate::probe::{ProbeRound, Prober};
use crate::registry::TargetRegistry;
use crate::store::{LatencySample, PingSnapshot, PingStatus, Store, Target};

/// RTT summary over the replies of one round.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RttStats {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    /// Mean absolute deviation around `avg`.
    pub mdev: f64,
}

impl RttStats {
    /// All zero when there are no samples.
    pub fn from_samples(samples: &[LatencySample]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let n = samples.len() as f64;
        let times = samples.iter().map(|s| s.response_time_ms);
        let min = times.clone().fold(f64::INFINITY, f64::min);
        let max = times.clone().fold(f64::NEG_INFINITY, f64::max);
        let avg = times.clone().sum::<f64>() / n;
        let mdev = times.map(|t| (t - avg).abs()).sum::<f64>() / n;

        Self { min, avg, max, mdev }
    }
}

/// Reduce a probe round to a snapshot.
pub fn build_snapshot(
    target: &Target,
    round: ProbeRound,
    thresholds: &QualityThresholds,
    now: DateTime<Utc>,
) -> PingSnapshot {
    let transmitted = round.transmitted;
    let received = round.received().min(transmitted);

    let packet_loss_percent = if transmitted == 0 {
        100.0
    } else {
        100.0 * (1.0 - received as f64 / transmitted as f64)
    };

    let rtt = RttStats::from_samples(&round.samples);
    let status = if received > 0 {
        PingStatus::Online
    } else {
        PingStatus::Timeout
    };

    PingSnapshot {
        target_id: target.id.clone(),
        timestamp: now,
        status,
        connection_quality: thresholds.classify(packet_loss_percent, rtt.avg),
        packet_loss_percent,
        min_rtt: rtt.min,
        avg_rtt: rtt.avg,
        max_rtt: rtt.max,
        mdev_rtt: rtt.mdev,
        packets_transmitted: transmitted,
        packets_received: received,
        samples: round.samples,
    }
}

/// Probe one target. A failed round counts as every probe lost.
async fn collect_target<P: Prober>(
    prober: &P,
    target: &Target,
    thresholds: &QualityThresholds,
    probe_count: u32,
) -> PingSnapshot {
    let round = match prober.probe_round(&target.host).await {
        Ok(round) => round,
        Err(e) => {
            tracing::warn!("Ping: Probe round failed for {}: {}", target.host, e);
            ProbeRound {
                transmitted: probe_count,
                samples: Vec::new(),
            }
        }
    };

    build_snapshot(target, round, thresholds, Utc::now())
}

/// Probes every target each cycle and merges the results into `client_stats.json`.
pub struct PingCollector<P> {
    registry: TargetRegistry,
    prober: Arc<P>,
    store: Arc<Store>,
    thresholds: QualityThresholds,
    probe_count: u32,
    workers: Arc<Semaphore>,
}

impl<P: Prober> PingCollector<P> {
    pub fn new(
        registry: TargetRegistry,
        prober: Arc<P>,
        store: Arc<Store>,
        thresholds: QualityThresholds,
        probe_count: u32,
        workers: usize,
    ) -> Self {
        Self {
            registry,
            prober,
            store,
            thresholds,
            probe_count,
            workers: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Probe a single target without persisting the result.
    #[cfg(test)]
    async fn collect(&self, target: &Target) -> PingSnapshot {
        collect_target(&*self.prober, target, &self.thresholds, self.probe_count).await
    }
}

impl<P: Prober> Collector for PingCollector<P> {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn run_cycle(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            let mut tasks = JoinSet::new();

            for target in self.registry.iter() {
                let prober = self.prober.clone();
                let workers = self.workers.clone();
                let target = target.clone();
                let thresholds = self.thresholds;
                let probe_count = self.probe_count;

                tasks.spawn(async move {
                    // Hold a worker slot for the whole round
                    let _permit = workers.acquire_owned().await.ok();
                    collect_target(&*prober, &target, &thresholds, probe_count).await
                });
            }

            let mut online = 0;
            let mut snapshots = Vec::with_capacity(self.registry.len());
            while let Some(joined) = tasks.join_next().await {
                let snapshot = match joined {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        tracing::error!("Ping: Probe task failed: {}", e);
                        continue;
                    }
                };

                if snapshot.status == PingStatus::Online {
                    online += 1;
                }
                tracing::info!(
                    "Ping: {} {:?} loss={:.1}% avg={:.2}ms mdev={:.2}ms quality={:?}",
                    snapshot.target_id,
                    snapshot.status,
                    snapshot.packet_loss_percent,
                    snapshot.avg_rtt,
                    snapshot.mdev_rtt,
                    snapshot.connection_quality
                );

                snapshots.push(snapshot);
            }

            let count = snapshots.len();
            if let Err(e) = self.store.merge_ping(snapshots) {
                tracing::error!("Ping: Failed to save {} snapshots: {}", count, e);
            }

            tracing::debug!("Ping: Cycle complete, {}/{} targets online", online, self.registry.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeError;
    use crate::store::{load_document, ConnectionQuality, PingDocument, CLIENT_STATS_FILE};
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Replays fixed RTTs per host; hosts without an entry fail.
    struct ScriptedProber {
        transmitted: u32,
        replies: HashMap<String, Vec<f64>>,
    }

    impl ScriptedProber {
        fn new(replies: Vec<(&str, Vec<f64>)>) -> Self {
            Self {
                transmitted: 5,
                replies: replies
                    .into_iter()
                    .map(|(host, rtts)| (host.to_string(), rtts))
                    .collect(),
            }
        }
    }

    impl Prober for ScriptedProber {
        fn probe_round(&self, host: &str) -> impl Future<Output = Result<ProbeRound, ProbeError>> + Send {
            let result = match self.replies.get(host) {
                Some(rtts) => Ok(ProbeRound {
                    transmitted: self.transmitted,
                    samples: rtts
                        .iter()
                        .enumerate()
                        .map(|(i, rtt)| LatencySample {
                            sequence: i as u32 + 1,
                            response_time_ms: *rtt,
                        })
                        .collect(),
                }),
                None => Err(ProbeError::Permission("operation not permitted".to_string())),
            };
            std::future::ready(result)
        }
    }

    fn collector(prober: ScriptedProber, hosts: &[&str], store: Arc<Store>) -> PingCollector<ScriptedProber> {
        let registry = TargetRegistry::new(hosts.iter().map(|h| Target::new(h, None)).collect());
        PingCollector::new(registry, Arc::new(prober), store, QualityThresholds::default(), 5, 4)
    }

    #[test]
    fn test_rtt_stats() {
        let samples: Vec<_> = [10.0, 12.0, 11.0, 13.0]
            .iter()
            .enumerate()
            .map(|(i, rtt)| LatencySample {
                sequence: i as u32,
                response_time_ms: *rtt,
            })
            .collect();

        let stats = RttStats::from_samples(&samples);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 13.0);
        assert!((stats.avg - 11.5).abs() < 1e-9);
        assert!((stats.mdev - 1.0).abs() < 1e-9);

        assert_eq!(RttStats::from_samples(&[]), RttStats::default());
    }

    #[tokio::test]
    async fn test_five_probe_round_with_one_loss() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let c = collector(
            ScriptedProber::new(vec![("10.8.0.2", vec![10.0, 12.0, 11.0, 13.0])]),
            &["10.8.0.2"],
            store,
        );

        let snapshot = c.collect(&Target::new("10.8.0.2", None)).await;
        assert_eq!(snapshot.packets_transmitted, 5);
        assert_eq!(snapshot.packets_received, 4);
        assert!((snapshot.packet_loss_percent - 20.0).abs() < 1e-9);
        assert!((snapshot.avg_rtt - 11.5).abs() < 1e-9);
        assert_eq!(snapshot.status, PingStatus::Online);
        assert_eq!(snapshot.connection_quality, ConnectionQuality::Poor);
    }

    #[tokio::test]
    async fn test_no_replies_is_timeout() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let c = collector(ScriptedProber::new(vec![("10.8.0.2", vec![])]), &["10.8.0.2"], store);

        let snapshot = c.collect(&Target::new("10.8.0.2", None)).await;
        assert_eq!(snapshot.status, PingStatus::Timeout);
        assert_eq!(snapshot.packet_loss_percent, 100.0);
        assert_eq!(snapshot.connection_quality, ConnectionQuality::None);
        assert_eq!((snapshot.min_rtt, snapshot.avg_rtt, snapshot.max_rtt, snapshot.mdev_rtt), (0.0, 0.0, 0.0, 0.0));
    }

    #[tokio::test]
    async fn test_probe_failure_is_lost_round() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let c = collector(ScriptedProber::new(vec![]), &["10.8.0.9"], store);

        let snapshot = c.collect(&Target::new("10.8.0.9", None)).await;
        assert_eq!(snapshot.packets_transmitted, 5);
        assert_eq!(snapshot.packets_received, 0);
        assert_eq!(snapshot.packet_loss_percent, 100.0);
        assert_eq!(snapshot.connection_quality, ConnectionQuality::None);
    }

    #[tokio::test]
    async fn test_cycle_merges_every_target() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());

        // An entry for a target outside this run survives the cycle.
        let mut foreign = build_snapshot(
            &Target::new("10.8.0.50", None),
            ProbeRound::default(),
            &QualityThresholds::default(),
            Utc::now(),
        );
        foreign.packets_transmitted = 3;
        store.merge_ping([foreign.clone()]).unwrap();

        let mut c = collector(
            ScriptedProber::new(vec![("10.8.0.2", vec![5.0; 5]), ("10.8.0.3", vec![90.0; 5])]),
            &["10.8.0.2", "10.8.0.3", "10.8.0.4"],
            store.clone(),
        );
        tokio::time::timeout(Duration::from_secs(5), c.run_cycle()).await.unwrap();

        let doc: PingDocument = load_document(&dir.path().join(CLIENT_STATS_FILE));
        assert_eq!(doc.len(), 4);
        assert_eq!(doc["10.8.0.2"].connection_quality, ConnectionQuality::Excellent);
        assert_eq!(doc["10.8.0.3"].connection_quality, ConnectionQuality::Fair);
        assert_eq!(doc["10.8.0.4"].status, PingStatus::Timeout);
        assert_eq!(doc["10.8.0.50"], foreign);
    }
}
