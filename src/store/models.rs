//! Record types persisted in the JSON documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A monitored VPN client or host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub added_at: DateTime<Utc>,
}

impl Target {
    pub fn new(host: &str, description: Option<String>) -> Self {
        Self {
            id: host.to_string(),
            host: host.to_string(),
            description,
            added_at: Utc::now(),
        }
    }

    /// Human-facing name: the description when one was given, else the host.
    pub fn display_name(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.host)
    }
}

/// Outcome of the last probe round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingStatus {
    Online,
    Timeout,
}

/// Connection quality tier derived from packet loss and average RTT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
    None,
}

/// Connection state tracked by the status collector.
///
/// Also serves as the `type` of an [`Event`], naming the state entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    #[default]
    Disconnected,
    Timeout,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// One echo reply within a probe round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    pub sequence: u32,
    pub response_time_ms: f64,
}

/// Latest ping statistics for a target (`client_stats.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingSnapshot {
    pub target_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: PingStatus,
    pub connection_quality: ConnectionQuality,
    pub packet_loss_percent: f64,
    pub min_rtt: f64,
    pub avg_rtt: f64,
    pub max_rtt: f64,
    pub mdev_rtt: f64,
    pub packets_transmitted: u32,
    pub packets_received: u32,
    pub samples: Vec<LatencySample>,
}

/// Latest cumulative traffic counters for a target (`traffic_stats.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    pub target_id: String,
    pub name: String,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_ip: Option<String>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub total_traffic: u64,
    pub last_seen: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

/// Current connection status of one client in `status_stats.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientStatus {
    pub name: String,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_ip: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub status: ConnectionState,
    pub timestamp: DateTime<Utc>,
}

/// A status transition. Never rewritten once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: ConnectionState,
    pub client: String,
    pub message: String,
}

/// Contents of `status_stats.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    #[serde(default)]
    pub clients: BTreeMap<String, ClientStatus>,
    #[serde(default)]
    pub events: Vec<Event>,
}

/// Contents of `client_stats.json`.
pub type PingDocument = BTreeMap<String, PingSnapshot>;

/// Contents of `traffic_stats.json`.
pub type TrafficDocument = BTreeMap<String, TrafficSnapshot>;
