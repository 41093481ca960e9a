//! Status collector: per-target connection state machine.
//!
//! Reachability is derived from what the other collectors persisted. A fresh
//! `online` ping snapshot or a growing traffic total marks a target reachable
//! for the cycle. Every state change appends exactly one event to
//! `status_stats.json`.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::Collector;
use crate::registry::TargetRegistry;
use crate::store::{
    ClientStatus, ConnectionState, Event, PingSnapshot, PingStatus, Store, Target, TrafficSnapshot,
};

/// When an unreachable target changes state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionPolicy {
    /// Consecutive unreachable cycles tolerated before `connected -> timeout`.
    pub timeout_cycles: u32,
    /// Time since last seen before `timeout -> disconnected`.
    pub long_timeout: Duration,
}

impl Default for TransitionPolicy {
    fn default() -> Self {
        Self {
            timeout_cycles: 3,
            long_timeout: Duration::seconds(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub missed_cycles: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Tracked {
    state: ConnectionState,
    missed_cycles: u32,
    last_seen: Option<DateTime<Utc>>,
}

/// Connection state per target id. Unknown targets start `disconnected`.
#[derive(Debug, Default)]
pub struct StatusMachine {
    policy: TransitionPolicy,
    tracked: HashMap<String, Tracked>,
}

impl StatusMachine {
    pub fn new(policy: TransitionPolicy) -> Self {
        Self {
            policy,
            tracked: HashMap::new(),
        }
    }

    /// Restore a previously recorded state.
    pub fn seed(&mut self, id: &str, state: ConnectionState, last_seen: Option<DateTime<Utc>>) {
        self.tracked.insert(
            id.to_string(),
            Tracked {
                state,
                missed_cycles: 0,
                last_seen,
            },
        );
    }

    fn state(&self, id: &str) -> ConnectionState {
        self.tracked.get(id).map(|t| t.state).unwrap_or_default()
    }

    pub fn last_seen(&self, id: &str) -> Option<DateTime<Utc>> {
        self.tracked.get(id).and_then(|t| t.last_seen)
    }

    /// Feed one cycle's reachability. Returns the transition, if any.
    pub fn observe(&mut self, id: &str, reachable: bool, now: DateTime<Utc>) -> Option<Transition> {
        let policy = self.policy;
        let tracked = self.tracked.entry(id.to_string()).or_default();
        let from = tracked.state;

        if reachable {
            tracked.missed_cycles = 0;
            tracked.last_seen = Some(now);
            tracked.state = ConnectionState::Connected;
        } else {
            tracked.missed_cycles = tracked.missed_cycles.saturating_add(1);
            match tracked.state {
                ConnectionState::Connected if tracked.missed_cycles > policy.timeout_cycles => {
                    tracked.state = ConnectionState::Timeout;
                }
                ConnectionState::Timeout
                    if tracked
                        .last_seen
                        .map_or(true, |seen| now - seen > policy.long_timeout) =>
                {
                    tracked.state = ConnectionState::Disconnected;
                }
                _ => {}
            }
        }

        (from != tracked.state).then_some(Transition {
            from,
            to: tracked.state,
            missed_cycles: tracked.missed_cycles,
        })
    }
}

/// Snapshot markers already consumed for one target.
#[derive(Debug, Clone, Copy, Default)]
struct Observation {
    ping_at: Option<DateTime<Utc>>,
    traffic_total: Option<u64>,
}

impl Observation {
    fn seeded(ping: Option<&PingSnapshot>, traffic: Option<&TrafficSnapshot>) -> Self {
        Self {
            ping_at: ping.map(|p| p.timestamp),
            traffic_total: traffic.map(|t| t.total_traffic),
        }
    }

    /// Consume the current snapshots and report whether they show the target
    /// reachable. The first traffic total seen is only a baseline.
    fn consume(&mut self, ping: Option<&PingSnapshot>, traffic: Option<&TrafficSnapshot>) -> bool {
        let fresh_online = match ping {
            Some(p) if self.ping_at.map_or(true, |at| p.timestamp > at) => {
                self.ping_at = Some(p.timestamp);
                p.status == PingStatus::Online
            }
            _ => false,
        };

        let traffic_moved = match traffic {
            Some(t) => {
                let moved = self.traffic_total.is_some_and(|prev| t.total_traffic > prev);
                self.traffic_total = Some(t.total_traffic);
                moved
            }
            None => false,
        };

        fresh_online || traffic_moved
    }
}

fn transition_message(status: &ClientStatus, transition: &Transition) -> String {
    match transition.to {
        ConnectionState::Connected => format!("{} ({}) connected", status.name, status.ip),
        ConnectionState::Timeout => format!(
            "{} ({}) timed out after {} missed cycles",
            status.name, status.ip, transition.missed_cycles
        ),
        ConnectionState::Disconnected => format!(
            "{} ({}) disconnected, was {}",
            status.name, status.ip, transition.from
        ),
    }
}

/// Tracks connection state per target and rewrites `status_stats.json` each cycle.
pub struct StatusCollector {
    registry: TargetRegistry,
    store: Arc<Store>,
    machine: StatusMachine,
    observed: HashMap<String, Observation>,
}

impl StatusCollector {
    /// States are seeded from the persisted record. Snapshots already on disk
    /// count as consumed, so a restart does not replay them.
    pub fn new(registry: TargetRegistry, store: Arc<Store>, policy: TransitionPolicy) -> Self {
        let mut machine = StatusMachine::new(policy);
        for (id, client) in store.status_record().clients {
            machine.seed(&id, client.status, client.last_seen);
        }

        let observed = registry
            .iter()
            .map(|target| {
                let ping = store.ping_snapshot(&target.id);
                let traffic = store.traffic_snapshot(&target.id);
                (target.id.clone(), Observation::seeded(ping.as_ref(), traffic.as_ref()))
            })
            .collect();

        Self {
            registry,
            store,
            machine,
            observed,
        }
    }

    #[cfg(test)]
    fn state(&self, id: &str) -> ConnectionState {
        self.machine.state(id)
    }

    /// Advance one target and build its status entry plus the event for a
    /// state change.
    fn evaluate(&mut self, target: &Target, now: DateTime<Utc>) -> (ClientStatus, Option<Event>) {
        let ping = self.store.ping_snapshot(&target.id);
        let traffic = self.store.traffic_snapshot(&target.id);

        let reachable = self
            .observed
            .entry(target.id.clone())
            .or_default()
            .consume(ping.as_ref(), traffic.as_ref());
        let transition = self.machine.observe(&target.id, reachable, now);

        // A configured description wins over the VPN common name.
        let name = match (&target.description, &traffic) {
            (None, Some(t)) => t.name.clone(),
            _ => target.display_name().to_string(),
        };

        let status = ClientStatus {
            name,
            ip: target.host.clone(),
            real_ip: traffic.and_then(|t| t.real_ip),
            last_seen: self.machine.last_seen(&target.id),
            status: self.machine.state(&target.id),
            timestamp: now,
        };

        let event = transition.map(|transition| {
            let message = transition_message(&status, &transition);
            match transition.to {
                ConnectionState::Connected => tracing::info!("Status: {}", message),
                _ => tracing::warn!("Status: {}", message),
            }
            Event {
                timestamp: now,
                kind: transition.to,
                client: status.name.clone(),
                message,
            }
        });

        (status, event)
    }
}

impl Collector for StatusCollector {
    fn name(&self) -> &'static str {
        "status"
    }

    fn run_cycle(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            let now = Utc::now();
            let registry = self.registry.clone();
            let updates: Vec<_> = registry
                .iter()
                .map(|target| {
                    let (status, event) = self.evaluate(target, now);
                    (target.id.clone(), status, event)
                })
                .collect();

            let result = self.store.update_status(|record| {
                let mut appended = 0;
                for (id, status, event) in updates {
                    record.clients.insert(id, status);
                    if let Some(event) = event {
                        record.events.push(event);
                        appended += 1;
                    }
                }
                appended
            });

            match result {
                Ok(appended) => tracing::debug!("Status: Cycle complete, {} new events", appended),
                Err(e) => tracing::error!("Status: Failed to save status document: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{build_snapshot, QualityThresholds};
    use crate::probe::ProbeRound;
    use crate::store::{load_document, LatencySample, StatusRecord, STATUS_STATS_FILE};
    use tempfile::tempdir;

    const HOST: &str = "10.8.0.2";

    fn ping_at(at: DateTime<Utc>, online: bool) -> PingSnapshot {
        let samples = if online {
            vec![LatencySample {
                sequence: 1,
                response_time_ms: 12.0,
            }]
        } else {
            Vec::new()
        };
        let round = ProbeRound {
            transmitted: 1,
            samples,
        };
        build_snapshot(&Target::new(HOST, None), round, &QualityThresholds::default(), at)
    }

    fn traffic(total: u64) -> TrafficSnapshot {
        TrafficSnapshot {
            target_id: HOST.to_string(),
            name: "laptop".to_string(),
            ip: HOST.to_string(),
            real_ip: Some("203.0.113.7".to_string()),
            bytes_received: total,
            bytes_sent: 0,
            total_traffic: total,
            last_seen: Utc::now(),
            timestamp: Utc::now(),
        }
    }

    fn collector(store: &Arc<Store>, timeout_cycles: u32) -> StatusCollector {
        let registry = TargetRegistry::new(vec![Target::new(HOST, None)]);
        let policy = TransitionPolicy {
            timeout_cycles,
            ..Default::default()
        };
        StatusCollector::new(registry, store.clone(), policy)
    }

    #[test]
    fn test_machine_transitions() {
        let mut machine = StatusMachine::new(TransitionPolicy::default());
        let t0 = Utc::now();

        let up = machine.observe(HOST, true, t0).unwrap();
        assert_eq!((up.from, up.to), (ConnectionState::Disconnected, ConnectionState::Connected));

        for _ in 0..3 {
            assert_eq!(machine.observe(HOST, false, t0), None);
        }
        let timeout = machine.observe(HOST, false, t0).unwrap();
        assert_eq!(timeout.to, ConnectionState::Timeout);
        assert_eq!(timeout.missed_cycles, 4);

        // Not yet past the long timeout.
        assert_eq!(machine.observe(HOST, false, t0 + Duration::seconds(50)), None);
        let down = machine.observe(HOST, false, t0 + Duration::seconds(101)).unwrap();
        assert_eq!((down.from, down.to), (ConnectionState::Timeout, ConnectionState::Disconnected));
        assert_eq!(machine.last_seen(HOST), Some(t0));
    }

    #[test]
    fn test_steady_state_emits_nothing() {
        let mut machine = StatusMachine::new(TransitionPolicy::default());
        let now = Utc::now();

        assert!(machine.observe(HOST, true, now).is_some());
        assert!(machine.observe(HOST, true, now).is_none());
        assert!(machine.observe(HOST, true, now).is_none());

        // Disconnected targets stay disconnected while unreachable.
        assert!(machine.observe("10.8.0.9", false, now).is_none());
        assert_eq!(machine.state("10.8.0.9"), ConnectionState::Disconnected);
    }

    #[test]
    fn test_seeded_timeout_without_last_seen_disconnects() {
        let mut machine = StatusMachine::new(TransitionPolicy::default());
        machine.seed(HOST, ConnectionState::Timeout, None);

        let t = machine.observe(HOST, false, Utc::now()).unwrap();
        assert_eq!(t.to, ConnectionState::Disconnected);
    }

    #[test]
    fn test_timeout_recovers() {
        let mut machine = StatusMachine::new(TransitionPolicy::default());
        machine.seed(HOST, ConnectionState::Timeout, Some(Utc::now()));

        let t = machine.observe(HOST, true, Utc::now()).unwrap();
        assert_eq!((t.from, t.to), (ConnectionState::Timeout, ConnectionState::Connected));
    }

    #[tokio::test]
    async fn test_unchanged_signal_adds_no_events() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let mut c = collector(&store, 3);
        let t0 = Utc::now();

        for i in 0..3 {
            store.merge_ping([ping_at(t0 + Duration::seconds(i), true)]).unwrap();
            c.run_cycle().await;
        }

        let record: StatusRecord = load_document(&dir.path().join(STATUS_STATS_FILE));
        assert_eq!(record.events.len(), 1);
        assert_eq!(record.events[0].kind, ConnectionState::Connected);
        assert_eq!(record.clients[HOST].status, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_exactly_once_transitions() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        store
            .update_status(|record| {
                record.clients.insert(
                    HOST.to_string(),
                    ClientStatus {
                        name: HOST.to_string(),
                        ip: HOST.to_string(),
                        real_ip: None,
                        last_seen: Some(Utc::now()),
                        status: ConnectionState::Connected,
                        timestamp: Utc::now(),
                    },
                );
            })
            .unwrap();

        let mut c = collector(&store, 0);
        let t0 = Utc::now();

        // reachable
        store.merge_ping([ping_at(t0 + Duration::seconds(1), true)]).unwrap();
        c.run_cycle().await;
        // unreachable: no fresh ping
        c.run_cycle().await;
        assert_eq!(c.state(HOST), ConnectionState::Timeout);
        // reachable again
        store.merge_ping([ping_at(t0 + Duration::seconds(2), true)]).unwrap();
        c.run_cycle().await;

        let events = store.status_record().events;
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ConnectionState::Timeout, ConnectionState::Connected]);
    }

    #[tokio::test]
    async fn test_offline_ping_is_unreachable() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let mut c = collector(&store, 3);

        store.merge_ping([ping_at(Utc::now(), false)]).unwrap();
        c.run_cycle().await;

        assert_eq!(c.state(HOST), ConnectionState::Disconnected);
        assert!(store.status_record().events.is_empty());
    }

    #[tokio::test]
    async fn test_traffic_growth_is_reachable() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let mut c = collector(&store, 3);

        // First total is a baseline only.
        store.merge_traffic([traffic(100)]).unwrap();
        c.run_cycle().await;
        assert_eq!(c.state(HOST), ConnectionState::Disconnected);

        store.merge_traffic([traffic(200)]).unwrap();
        c.run_cycle().await;
        assert_eq!(c.state(HOST), ConnectionState::Connected);

        let record = store.status_record();
        assert_eq!(record.clients[HOST].name, "laptop");
        assert_eq!(record.clients[HOST].real_ip.as_deref(), Some("203.0.113.7"));
    }

    #[tokio::test]
    async fn test_client_name_prefers_description() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let registry = TargetRegistry::new(vec![
            Target::new(HOST, Some("office-laptop".to_string())),
            Target::new("10.8.0.3", None),
        ]);
        let mut c = StatusCollector::new(registry, store.clone(), TransitionPolicy::default());

        store.merge_traffic([traffic(100)]).unwrap();
        store.merge_ping([ping_at(Utc::now(), true)]).unwrap();
        c.run_cycle().await;

        let record = store.status_record();
        assert_eq!(record.clients[HOST].name, "office-laptop");
        assert_eq!(record.clients["10.8.0.3"].name, "10.8.0.3");
        assert_eq!(record.events[0].client, "office-laptop");
        assert!(record.events[0].message.contains("office-laptop"));
    }

    #[tokio::test]
    async fn test_persisted_events_are_kept() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        store
            .update_status(|record| {
                record.events.push(Event {
                    timestamp: Utc::now(),
                    kind: ConnectionState::Disconnected,
                    client: "old-client".to_string(),
                    message: "old-client disconnected".to_string(),
                });
            })
            .unwrap();
        drop(store);

        let store = Arc::new(Store::open(dir.path()).unwrap());
        let mut c = collector(&store, 3);
        store.merge_ping([ping_at(Utc::now(), true)]).unwrap();
        c.run_cycle().await;

        let record: StatusRecord = load_document(&dir.path().join(STATUS_STATS_FILE));
        assert_eq!(record.events.len(), 2);
        assert_eq!(record.events[0].client, "old-client");
        assert_eq!(record.events[1].kind, ConnectionState::Connected);
    }
}
