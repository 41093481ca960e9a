//! Periodic collectors: ping, traffic and connection status.
//!
//! Each collector is driven by its own ticker task (see `scheduler`). A cycle
//! handles its own failures; nothing a collector does in a cycle can fail
//! another collector.

mod ping;
mod quality;
mod status;
mod traffic;

pub use ping::*;
pub use quality::*;
pub use status::*;
pub use traffic::*;

use std::future::Future;

/// A unit of periodic collection work.
pub trait Collector: Send + 'static {
    /// Short name for log lines.
    fn name(&self) -> &'static str;

    /// Run one collection cycle to completion.
    fn run_cycle(&mut self) -> impl Future<Output = ()> + Send;
}

/// Format a byte count with binary units, e.g. `1.50 KB`.
pub fn format_bytes(bytes: f64) -> String {
    if !bytes.is_finite() || bytes < 0.0 {
        return "0 B".to_string();
    }

    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", value as u64)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
