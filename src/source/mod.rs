//! Client session data published by the VPN server.
//!
//! The traffic collector only parses this data; the counters are computed by
//! the OpenVPN server itself.

mod openvpn;

pub use openvpn::*;

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Session source error types.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("read timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed status data: {0}")]
    Parse(String),
}

/// One connected client as reported by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSession {
    pub common_name: String,
    /// Public address the client connects from, without the port.
    pub real_ip: Option<String>,
    /// Tunnel address assigned to the client.
    pub virtual_address: Option<String>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connected_since: Option<DateTime<Utc>>,
    /// Last packet routed to or from the client.
    pub last_ref: Option<DateTime<Utc>>,
}

impl ClientSession {
    /// Most recent activity the server knows about.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_ref.or(self.connected_since)
    }
}

/// Session belonging to `host`, matched on virtual address first, then
/// common name, then real address.
pub fn find_session<'a>(sessions: &'a [ClientSession], host: &str) -> Option<&'a ClientSession> {
    sessions
        .iter()
        .find(|s| s.virtual_address.as_deref() == Some(host))
        .or_else(|| sessions.iter().find(|s| s.common_name == host))
        .or_else(|| sessions.iter().find(|s| s.real_ip.as_deref() == Some(host)))
}

/// Produces the current session list.
pub trait SessionSource: Send + Sync + 'static {
    fn sessions(&self) -> impl Future<Output = Result<Vec<ClientSession>, SourceError>> + Send;
}
