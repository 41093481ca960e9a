//! Scheduler module: runs the collectors on their tickers until shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::collector::{Collector, PingCollector, StatusCollector, TrafficCollector};
use crate::config::MonitorConfig;
use crate::probe::{PingProber, Prober};
use crate::registry::TargetRegistry;
use crate::source::{SessionSource, StatusFile};
use crate::store::{Store, StoreError};

/// Owns the collectors and their shared store for one monitoring run.
pub struct Orchestrator<P, S> {
    config: MonitorConfig,
    store: Arc<Store>,
    prober: Arc<P>,
    source: Arc<S>,
}

impl Orchestrator<PingProber, StatusFile> {
    /// ICMP probes and the configured OpenVPN status file.
    pub fn new(config: MonitorConfig, store: Arc<Store>) -> Self {
        let prober = PingProber::new(config.probe);
        let source = StatusFile::new(config.status_file.clone());
        Self::with_components(config, store, prober, source)
    }
}

impl<P: Prober, S: SessionSource> Orchestrator<P, S> {
    pub fn with_components(config: MonitorConfig, store: Arc<Store>, prober: P, source: S) -> Self {
        Self {
            config,
            store,
            prober: Arc::new(prober),
            source: Arc::new(source),
        }
    }

    /// Run until `shutdown` resolves or the configured duration elapses,
    /// then stop the collectors and flush pending writes.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), StoreError> {
        let config = &self.config;
        let registry = TargetRegistry::new(config.targets.clone());
        tracing::info!(
            "Orchestrator: Monitoring {} targets every {:?}",
            registry.len(),
            config.interval
        );

        let token = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let ping = PingCollector::new(
            registry.clone(),
            self.prober.clone(),
            self.store.clone(),
            config.thresholds,
            config.probe.count,
            config.workers,
        );
        tasks.spawn(run_collector_loop(ping, config.interval, token.clone()));

        let traffic = TrafficCollector::new(
            registry.clone(),
            self.source.clone(),
            self.store.clone(),
            config.source_timeout,
        );
        tasks.spawn(run_collector_loop(traffic, config.interval, token.clone()));

        let status = StatusCollector::new(registry, self.store.clone(), config.policy);
        tasks.spawn(run_collector_loop(status, config.interval, token.clone()));

        let deadline = async {
            match config.duration {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = deadline => tracing::info!("Orchestrator: Run duration elapsed"),
            _ = shutdown => tracing::info!("Orchestrator: Shutdown requested"),
        }

        token.cancel();
        let drained = tokio::time::timeout(config.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!("Orchestrator: Collector task failed: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                "Orchestrator: Collectors still busy after {:?}, aborting",
                config.shutdown_grace
            );
            tasks.abort_all();
        }

        self.store.flush()?;
        tracing::info!("Orchestrator: Stopped");
        Ok(())
    }
}

/// Drive one collector on its own ticker. Cancellation is checked before each
/// cycle and after it completes; an in-flight cycle is never interrupted.
async fn run_collector_loop<C: Collector>(mut collector: C, period: Duration, token: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!("Orchestrator: Starting {} collector", collector.name());

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                collector.run_cycle().await;
                if token.is_cancelled() {
                    break;
                }
            }
        }
    }

    tracing::info!("Orchestrator: {} collector stopped", collector.name());
}
