use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as Unix seconds.
///
/// NETINFO timestamps are the only wall-clock consumer in the protocol;
/// a clock set before the epoch reads as zero rather than failing.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Target of a stream: where the exit should connect to.
///
/// BEGIN payloads carry `host:port` in ASCII; the host may be a literal IP
/// or a name the exit must resolve first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetAddr {
    /// Literal IP + port, connectable without resolution
    Ip(SocketAddr),
    /// Hostname + port, resolved on the exit side
    Hostname { host: String, port: u16 },
}

impl TargetAddr {
    pub fn from_socket(addr: SocketAddr) -> Self {
        Self::Ip(addr)
    }

    pub fn from_hostname(host: String, port: u16) -> Self {
        Self::Hostname { host, port }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Hostname { port, .. } => *port,
        }
    }

    /// The literal IP, if no resolution is needed.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Self::Ip(addr) => Some(addr.ip()),
            Self::Hostname { .. } => None,
        }
    }

    /// Parse the `host:port` form used in BEGIN payloads.
    ///
    /// IPv6 literals use the bracketed `[::1]:80` form.
    pub fn parse(s: &str) -> Result<Self, crate::VeilError> {
        if let Ok(sock) = s.parse::<SocketAddr>() {
            return Ok(Self::Ip(sock));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| crate::VeilError::InvalidAddress(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| crate::VeilError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(crate::VeilError::InvalidAddress(s.to_string()));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self::Ip(SocketAddr::new(ip, port)));
        }
        Ok(Self::Hostname {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{}", addr),
            Self::Hostname { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}
