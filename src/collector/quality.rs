//! Connection quality classification.

use crate::store::ConnectionQuality;

/// Loss and latency limits for each quality tier. Rules are evaluated in
/// order and the first match wins; a limit is exceeded when the measured
/// value is strictly greater.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityThresholds {
    pub critical_loss: f64,
    pub poor_loss: f64,
    pub poor_rtt_ms: f64,
    pub fair_rtt_ms: f64,
    pub good_rtt_ms: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            critical_loss: 20.0,
            poor_loss: 5.0,
            poor_rtt_ms: 150.0,
            fair_rtt_ms: 80.0,
            good_rtt_ms: 30.0,
        }
    }
}

impl QualityThresholds {
    /// Classify a round by packet loss (percent) and average RTT (ms).
    pub fn classify(&self, packet_loss_percent: f64, avg_rtt: f64) -> ConnectionQuality {
        if packet_loss_percent >= 100.0 {
            ConnectionQuality::None
        } else if packet_loss_percent > self.critical_loss {
            ConnectionQuality::Critical
        } else if packet_loss_percent > self.poor_loss || avg_rtt > self.poor_rtt_ms {
            ConnectionQuality::Poor
        } else if packet_loss_percent > 0.0 || avg_rtt > self.fair_rtt_ms {
            ConnectionQuality::Fair
        } else if avg_rtt > self.good_rtt_ms {
            ConnectionQuality::Good
        } else {
            ConnectionQuality::Excellent
        }
    }
}
