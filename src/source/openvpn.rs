//! OpenVPN server status file parser.
//!
//! Handles `--status-version` 1 (sectioned CSV), 2 (prefixed CSV) and 3
//! (prefixed, tab separated).

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use super::{ClientSession, SessionSource, SourceError};

const COMMON_NAME: &str = "Common Name";
const REAL_ADDRESS: &str = "Real Address";
const VIRTUAL_ADDRESS: &str = "Virtual Address";
const BYTES_RECEIVED: &str = "Bytes Received";
const BYTES_SENT: &str = "Bytes Sent";
const CONNECTED_SINCE: &str = "Connected Since";
const CONNECTED_SINCE_T: &str = "Connected Since (time_t)";
const LAST_REF: &str = "Last Ref";
const LAST_REF_T: &str = "Last Ref (time_t)";

/// Column layout used by versions 2 and 3 when no HEADER line is present.
const DEFAULT_CLIENT_COLUMNS: &[&str] = &[
    COMMON_NAME,
    REAL_ADDRESS,
    VIRTUAL_ADDRESS,
    "Virtual IPv6 Address",
    BYTES_RECEIVED,
    BYTES_SENT,
    CONNECTED_SINCE,
    CONNECTED_SINCE_T,
    "Username",
    "Client ID",
    "Peer ID",
    "Data Channel Cipher",
];

const DEFAULT_ROUTE_COLUMNS: &[&str] = &[VIRTUAL_ADDRESS, COMMON_NAME, REAL_ADDRESS, LAST_REF, LAST_REF_T];

/// Sessions read from the status file the server rewrites periodically.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SessionSource for StatusFile {
    fn sessions(&self) -> impl Future<Output = Result<Vec<ClientSession>, SourceError>> + Send {
        let path = self.path.clone();
        async move {
            let text = tokio::fs::read_to_string(&path).await?;
            parse_status(&text)
        }
    }
}

/// Column names of one table, in order.
struct Columns(Vec<String>);

impl Columns {
    fn from_names(names: &[&str]) -> Self {
        Self(names.iter().map(|s| s.to_string()).collect())
    }

    fn get<'a>(&self, row: &[&'a str], name: &str) -> Option<&'a str> {
        let idx = self.0.iter().position(|c| c == name)?;
        row.get(idx).map(|v| v.trim()).filter(|v| !v.is_empty())
    }
}

#[derive(Default)]
struct RouteInfo {
    virtual_address: Option<String>,
    last_ref: Option<DateTime<Utc>>,
}

/// Parse the contents of a status file.
pub fn parse_status(text: &str) -> Result<Vec<ClientSession>, SourceError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let tabbed = text
        .lines()
        .any(|l| l.starts_with("CLIENT_LIST\t") || l.starts_with("HEADER\t") || l.starts_with("TITLE\t"));
    let sep = if tabbed { '\t' } else { ',' };

    let prefixed = tabbed
        || text
            .lines()
            .any(|l| l.starts_with("CLIENT_LIST,") || l.starts_with("HEADER,") || l.starts_with("TITLE,"));

    if prefixed {
        Ok(parse_prefixed(text, sep))
    } else if text.lines().any(|l| l.trim() == "OpenVPN CLIENT LIST") {
        Ok(parse_sectioned(text))
    } else {
        Err(SourceError::Parse("unrecognized status file format".to_string()))
    }
}

/// Versions 2 and 3: every line starts with its record type.
fn parse_prefixed(text: &str, sep: char) -> Vec<ClientSession> {
    let mut client_cols = Columns::from_names(DEFAULT_CLIENT_COLUMNS);
    let mut route_cols = Columns::from_names(DEFAULT_ROUTE_COLUMNS);
    let mut client_rows = Vec::new();
    let mut routes = HashMap::new();

    for line in text.lines() {
        let fields: Vec<&str> = line.trim_end_matches('\r').split(sep).collect();
        match fields.as_slice() {
            ["HEADER", "CLIENT_LIST", names @ ..] => client_cols = Columns::from_names(names),
            ["HEADER", "ROUTING_TABLE", names @ ..] => route_cols = Columns::from_names(names),
            ["CLIENT_LIST", row @ ..] => client_rows.push(row.to_vec()),
            ["ROUTING_TABLE", row @ ..] => add_route(&mut routes, &route_cols, row),
            _ => {}
        }
    }

    build_sessions(&client_cols, &client_rows, &routes)
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Preamble,
    Clients,
    Routes,
    Done,
}

/// Version 1: a client table and a routing table, each introduced by a
/// section title and a column header line.
fn parse_sectioned(text: &str) -> Vec<ClientSession> {
    let mut section = Section::Preamble;
    let mut client_cols = None;
    let mut route_cols = None;
    let mut client_rows = Vec::new();
    let mut routes = HashMap::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        match line.trim() {
            "" => continue,
            "OpenVPN CLIENT LIST" => {
                section = Section::Clients;
                continue;
            }
            "ROUTING TABLE" => {
                section = Section::Routes;
                continue;
            }
            "GLOBAL STATS" | "END" => {
                section = Section::Done;
                continue;
            }
            _ => {}
        }

        let fields: Vec<&str> = line.split(',').collect();
        match section {
            Section::Clients => {
                if fields.first() == Some(&"Updated") {
                    continue;
                }
                if client_cols.is_none() {
                    client_cols = Some(Columns::from_names(&fields));
                } else {
                    client_rows.push(fields);
                }
            }
            Section::Routes => match &route_cols {
                None => route_cols = Some(Columns::from_names(&fields)),
                Some(cols) => add_route(&mut routes, cols, &fields),
            },
            Section::Preamble | Section::Done => {}
        }
    }

    match client_cols {
        Some(cols) => build_sessions(&cols, &client_rows, &routes),
        None => Vec::new(),
    }
}

fn route_key(common_name: &str, real_address: &str) -> (String, String) {
    (common_name.to_string(), real_address.to_string())
}

fn add_route(routes: &mut HashMap<(String, String), RouteInfo>, cols: &Columns, row: &[&str]) {
    let (Some(name), Some(real)) = (cols.get(row, COMMON_NAME), cols.get(row, REAL_ADDRESS)) else {
        return;
    };

    let info: &mut RouteInfo = routes.entry(route_key(name, real)).or_default();

    // iroute entries (subnets, MAC addresses) share the client's key; keep the host address.
    if info.virtual_address.is_none() {
        if let Some(addr) = cols.get(row, VIRTUAL_ADDRESS) {
            if addr.parse::<IpAddr>().is_ok() {
                info.virtual_address = Some(addr.to_string());
            }
        }
    }

    let last_ref = cols
        .get(row, LAST_REF_T)
        .and_then(parse_epoch)
        .or_else(|| cols.get(row, LAST_REF).and_then(parse_openvpn_time));
    if last_ref > info.last_ref {
        info.last_ref = last_ref;
    }
}

fn build_sessions(
    cols: &Columns,
    rows: &[Vec<&str>],
    routes: &HashMap<(String, String), RouteInfo>,
) -> Vec<ClientSession> {
    rows.iter()
        .filter_map(|row| {
            let session = session_from_row(cols, row, routes);
            if session.is_none() {
                tracing::warn!("Status source: Skipping malformed client row: {}", row.join(","));
            }
            session
        })
        .collect()
}

fn session_from_row(
    cols: &Columns,
    row: &[&str],
    routes: &HashMap<(String, String), RouteInfo>,
) -> Option<ClientSession> {
    let common_name = cols.get(row, COMMON_NAME)?;
    let real_address = cols.get(row, REAL_ADDRESS).unwrap_or_default();
    let bytes_received = cols.get(row, BYTES_RECEIVED)?.parse().ok()?;
    let bytes_sent = cols.get(row, BYTES_SENT)?.parse().ok()?;

    let connected_since = cols
        .get(row, CONNECTED_SINCE_T)
        .and_then(parse_epoch)
        .or_else(|| cols.get(row, CONNECTED_SINCE).and_then(parse_openvpn_time));

    let route = routes.get(&route_key(common_name, real_address));

    Some(ClientSession {
        common_name: common_name.to_string(),
        real_ip: strip_port(real_address),
        virtual_address: cols
            .get(row, VIRTUAL_ADDRESS)
            .map(str::to_string)
            .or_else(|| route.and_then(|r| r.virtual_address.clone())),
        bytes_received,
        bytes_sent,
        connected_since,
        last_ref: route.and_then(|r| r.last_ref),
    })
}

fn parse_epoch(s: &str) -> Option<DateTime<Utc>> {
    s.parse::<i64>().ok().and_then(|t| DateTime::from_timestamp(t, 0))
}

/// Parse the human-readable timestamps OpenVPN writes in server local time.
pub fn parse_openvpn_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = ["%Y-%m-%d %H:%M:%S", "%a %b %d %H:%M:%S %Y"];

    for fmt in &formats {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s.trim(), fmt) {
            return Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc));
        }
    }

    None
}

/// Strip the port (and the transport prefix newer servers add) from a real address.
fn strip_port(addr: &str) -> Option<String> {
    let addr = addr.trim();
    if addr.is_empty() {
        return None;
    }

    // e.g. "udp4:203.0.113.7:51234"
    let addr = match addr.split_once(':') {
        Some((proto, rest)) if proto.starts_with("udp") || proto.starts_with("tcp") => rest,
        _ => addr,
    };

    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Some(sa.ip().to_string());
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Some(ip.to_string());
    }

    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            Some(host.to_string())
        }
        _ => Some(addr.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_V2: &str = "TITLE,OpenVPN 2.6.8 x86_64-pc-linux-gnu\n\
TIME,2024-03-20 10:30:45,1710930645\n\
HEADER,CLIENT_LIST,Common Name,Real Address,Virtual Address,Virtual IPv6 Address,Bytes Received,Bytes Sent,Connected Since,Connected Since (time_t),Username,Client ID,Peer ID,Data Channel Cipher\n\
CLIENT_LIST,laptop,203.0.113.7:51234,10.8.0.2,,1024,2048,2024-03-20 10:00:00,1710928800,UNDEF,0,0,AES-256-GCM\n\
CLIENT_LIST,phone,198.51.100.4:40000,10.8.0.3,,10,20,2024-03-20 10:10:00,1710929400,UNDEF,1,1,AES-256-GCM\n\
HEADER,ROUTING_TABLE,Virtual Address,Common Name,Real Address,Last Ref,Last Ref (time_t)\n\
ROUTING_TABLE,10.8.0.2,laptop,203.0.113.7:51234,2024-03-20 10:30:40,1710930640\n\
GLOBAL_STATS,Max bcast/mcast queue length,0\n\
END\n";

    #[test]
    fn test_parse_version_2() {
        let sessions = parse_status(STATUS_V2).unwrap();
        assert_eq!(sessions.len(), 2);

        let laptop = &sessions[0];
        assert_eq!(laptop.common_name, "laptop");
        assert_eq!(laptop.real_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(laptop.virtual_address.as_deref(), Some("10.8.0.2"));
        assert_eq!(laptop.bytes_received, 1024);
        assert_eq!(laptop.bytes_sent, 2048);
        assert_eq!(laptop.connected_since, DateTime::from_timestamp(1710928800, 0));
        assert_eq!(laptop.last_ref, DateTime::from_timestamp(1710930640, 0));

        let phone = &sessions[1];
        assert_eq!(phone.last_ref, None);
        assert_eq!(phone.last_seen(), DateTime::from_timestamp(1710929400, 0));
    }

    #[test]
    fn test_parse_version_3_tabs() {
        let text = STATUS_V2.replace(',', "\t");
        let sessions = parse_status(&text).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1].virtual_address.as_deref(), Some("10.8.0.3"));
    }

    #[test]
    fn test_parse_version_2_without_header() {
        let text = "CLIENT_LIST,laptop,203.0.113.7:51234,10.8.0.2,,5,6,2024-03-20 10:00:00,1710928800,UNDEF,0,0\n";
        let sessions = parse_status(text).unwrap();
        assert_eq!(sessions[0].bytes_sent, 6);
    }

    #[test]
    fn test_parse_version_1() {
        let text = "OpenVPN CLIENT LIST\n\
Updated,Wed Mar 20 10:30:45 2024\n\
Common Name,Real Address,Bytes Received,Bytes Sent,Connected Since\n\
laptop,203.0.113.7:51234,1024,2048,Wed Mar 20 10:00:00 2024\n\
ROUTING TABLE\n\
Virtual Address,Common Name,Real Address,Last Ref\n\
192.168.50.0/24,laptop,203.0.113.7:51234,Wed Mar 20 10:29:00 2024\n\
10.8.0.2,laptop,203.0.113.7:51234,Wed Mar 20 10:30:40 2024\n\
GLOBAL STATS\n\
Max bcast/mcast queue length,0\n\
END\n";

        let sessions = parse_status(text).unwrap();
        assert_eq!(sessions.len(), 1);

        let laptop = &sessions[0];
        assert_eq!(laptop.virtual_address.as_deref(), Some("10.8.0.2"));
        assert_eq!(laptop.bytes_received, 1024);
        assert_eq!(laptop.connected_since, parse_openvpn_time("2024-03-20 10:00:00"));
        assert_eq!(laptop.last_ref, parse_openvpn_time("2024-03-20 10:30:40"));
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let text = "CLIENT_LIST,laptop,203.0.113.7:51234,10.8.0.2,,not-a-number,6\n\
CLIENT_LIST,phone,198.51.100.4:40000,10.8.0.3,,1,2\n";
        let sessions = parse_status(text).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].common_name, "phone");
    }

    #[test]
    fn test_empty_and_unknown_input() {
        assert!(parse_status("").unwrap().is_empty());
        assert!(matches!(parse_status("hello world"), Err(SourceError::Parse(_))));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("203.0.113.7:51234").as_deref(), Some("203.0.113.7"));
        assert_eq!(strip_port("udp4:203.0.113.7:51234").as_deref(), Some("203.0.113.7"));
        assert_eq!(strip_port("[2001:db8::1]:1194").as_deref(), Some("2001:db8::1"));
        assert_eq!(strip_port("2001:db8::1").as_deref(), Some("2001:db8::1"));
        assert_eq!(strip_port("vpn.example.com:1194").as_deref(), Some("vpn.example.com"));
        assert_eq!(strip_port(""), None);
    }

    #[tokio::test]
    async fn test_status_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.log");
        std::fs::write(&path, STATUS_V2).unwrap();

        let source = StatusFile::new(&path);
        let sessions = source.sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);

        let missing = StatusFile::new(dir.path().join("absent.log"));
        assert!(matches!(missing.sessions().await, Err(SourceError::Io(_))));
    }
}
