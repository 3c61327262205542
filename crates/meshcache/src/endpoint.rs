//! Peer addressing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A peer's network address.
///
/// Host names are lowercased on construction, which makes equality and
/// ordering case-insensitive. Endpoints order by host first, then port; that
/// order fixes the bucket layout the peer picker hashes into, so all peers
/// agree on key placement as long as they agree on the peer list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerEndpoint {
    host: String,
    port: u16,
}

impl PeerEndpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error parsing a `host:port` string.
#[derive(Debug, thiserror::Error)]
#[error("invalid peer endpoint: {0}")]
pub struct ParseEndpointError(String);

impl FromStr for PeerEndpoint {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseEndpointError(s.to_owned()))?;
        if host.is_empty() {
            return Err(ParseEndpointError(s.to_owned()));
        }
        let port = port
            .parse()
            .map_err(|_| ParseEndpointError(s.to_owned()))?;
        Ok(Self::new(host, port))
    }
}

/// Identifies a group uniquely within a process.
///
/// Multiple peers can live in one process (as they do in tests), so the
/// group name alone is not enough; dispatch is keyed by name plus the self
/// endpoint of the pool that registered the group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub name: String,
    pub endpoint: PeerEndpoint,
}

impl GroupKey {
    pub fn new(name: impl Into<String>, endpoint: PeerEndpoint) -> Self {
        Self {
            name: name.into(),
            endpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_case_insensitive() {
        let a = PeerEndpoint::new("Cache-01.Example.COM", 8080);
        let b = PeerEndpoint::new("cache-01.example.com", 8080);
        assert_eq!(a, b);
        assert_eq!(a.host(), "cache-01.example.com");
    }

    #[test]
    fn test_ordering_by_host_then_port() {
        let mut endpoints = vec![
            PeerEndpoint::new("b", 1),
            PeerEndpoint::new("a", 9),
            PeerEndpoint::new("a", 1),
        ];
        endpoints.sort();
        assert_eq!(
            endpoints,
            vec![
                PeerEndpoint::new("a", 1),
                PeerEndpoint::new("a", 9),
                PeerEndpoint::new("b", 1),
            ]
        );
    }

    #[test]
    fn test_parse() {
        let ep: PeerEndpoint = "LocalHost:9000".parse().unwrap();
        assert_eq!(ep, PeerEndpoint::new("localhost", 9000));
        assert_eq!(ep.to_string(), "localhost:9000");

        assert!("localhost".parse::<PeerEndpoint>().is_err());
        assert!(":9000".parse::<PeerEndpoint>().is_err());
        assert!("localhost:notaport".parse::<PeerEndpoint>().is_err());
    }
}
