//! Latency probing.
//!
//! A probe round is a short burst of ICMP echo requests against one host.

mod ping;

pub use ping::*;

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::store::LatencySample;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Raw result of one probe round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeRound {
    pub transmitted: u32,
    /// One entry per echo reply, in sequence order.
    pub samples: Vec<LatencySample>,
}

impl ProbeRound {
    pub fn received(&self) -> u32 {
        self.samples.len() as u32
    }
}

/// Runs probe rounds against hosts.
pub trait Prober: Send + Sync + 'static {
    fn probe_round(&self, host: &str) -> impl Future<Output = Result<ProbeRound, ProbeError>> + Send;
}

/// Probe round configuration.
#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    /// Echo requests per round.
    pub count: u32,
    /// Wait for each individual reply.
    pub timeout: Duration,
    /// Gap between consecutive requests in a round.
    pub spacing: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            count: 5,
            timeout: Duration::from_millis(1500),
            spacing: Duration::from_millis(200),
        }
    }
}

impl ProbeConfig {
    /// Longest a round can take: every request waits out its timeout.
    pub fn worst_case_round(&self) -> Duration {
        let waits = self.timeout.saturating_mul(self.count);
        let gaps = self.spacing.saturating_mul(self.count.saturating_sub(1));
        waits.saturating_add(gaps)
    }
}
