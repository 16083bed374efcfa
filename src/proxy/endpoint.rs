//! Proxy endpoints
//!
//! An [`Endpoint`] is a resolved socket address tagged with the transport
//! protocol it is served over.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use tokio::net::lookup_host;
use tokio::time::timeout;
use tracing::debug;

use crate::Result;

/// Transport protocol of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => bail!("unsupported protocol '{}', expected 'tcp' or 'udp'", other),
        }
    }
}

/// IP address family of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// Wildcard address of this family with an ephemeral port.
    pub fn unspecified(&self) -> SocketAddr {
        match self {
            AddressFamily::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            AddressFamily::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => f.write_str("v4"),
            AddressFamily::V6 => f.write_str("v6"),
        }
    }
}

/// A protocol-tagged socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    protocol: Protocol,
    addr: SocketAddr,
}

impl Endpoint {
    pub fn new(protocol: Protocol, addr: SocketAddr) -> Self {
        Self { protocol, addr }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new(Protocol::Tcp, addr)
    }

    pub fn udp(addr: SocketAddr) -> Self {
        Self::new(Protocol::Udp, addr)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.addr.ip())
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Same protocol, different address. Used once the OS has assigned
    /// the real port of a frontend bound to port 0.
    pub(crate) fn with_addr(&self, addr: SocketAddr) -> Self {
        Self::new(self.protocol, addr)
    }

    /// Resolve `host:port` into an endpoint.
    ///
    /// When `family` is given, only addresses of that family are
    /// considered; otherwise the first resolved address wins.
    pub async fn resolve(
        protocol: Protocol,
        host: &str,
        port: u16,
        family: Option<AddressFamily>,
        resolve_timeout: Duration,
    ) -> Result<Self> {
        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            if let Some(family) = family {
                if AddressFamily::of(&ip) != family {
                    bail!("address {} is not an IP{} address", ip, family);
                }
            }
            return Ok(Self::new(protocol, SocketAddr::new(ip, port)));
        }

        debug!("Resolving host: {}:{}", host, port);
        let addrs: Vec<SocketAddr> = timeout(resolve_timeout, lookup_host((host, port)))
            .await
            .map_err(|_| anyhow!("DNS resolution timed out for {}", host))?
            .with_context(|| format!("DNS resolution failed for {}", host))?
            .collect();

        let addr = addrs
            .into_iter()
            .find(|addr| family.map_or(true, |f| AddressFamily::of(&addr.ip()) == f))
            .ok_or_else(|| match family {
                Some(f) => anyhow!("no IP{} address found for {}", f, host),
                None => anyhow!("DNS resolution returned no addresses for {}", host),
            })?;

        debug!("Resolved {} to {}", host, addr);
        Ok(Self::new(protocol, addr))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.addr)
    }
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    /// Parses `tcp://127.0.0.1:80` or `udp://[::1]:53`.
    fn from_str(s: &str) -> Result<Self> {
        let (proto, addr) = s
            .split_once("://")
            .ok_or_else(|| anyhow!("endpoint '{}' must look like proto://ip:port", s))?;
        let protocol = proto.parse::<Protocol>()?;
        let addr = addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid socket address in endpoint '{}'", s))?;
        Ok(Self::new(protocol, addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse_and_display() {
        let ep: Endpoint = "tcp://127.0.0.1:8080".parse().unwrap();
        assert_eq!(ep.protocol(), Protocol::Tcp);
        assert_eq!(ep.port(), 8080);
        assert_eq!(ep.family(), AddressFamily::V4);
        assert_eq!(ep.to_string(), "tcp://127.0.0.1:8080");

        let ep: Endpoint = "UDP://[::1]:53".parse().unwrap();
        assert_eq!(ep.protocol(), Protocol::Udp);
        assert_eq!(ep.family(), AddressFamily::V6);
        assert_eq!(ep.to_string(), "udp://[::1]:53");

        assert!("sctp://127.0.0.1:1".parse::<Endpoint>().is_err());
        assert!("127.0.0.1:1".parse::<Endpoint>().is_err());
        assert!("tcp://localhost:1".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_unspecified_matches_family() {
        assert_eq!(AddressFamily::V4.unspecified().to_string(), "0.0.0.0:0");
        assert_eq!(AddressFamily::V6.unspecified().to_string(), "[::]:0");
    }

    #[tokio::test]
    async fn test_resolve_literal_addresses() {
        let ep = Endpoint::resolve(Protocol::Udp, "127.0.0.1", 53, None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ep, Endpoint::udp("127.0.0.1:53".parse().unwrap()));

        let ep = Endpoint::resolve(Protocol::Tcp, "[::1]", 80, Some(AddressFamily::V6), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ep.family(), AddressFamily::V6);

        let mismatch = Endpoint::resolve(
            Protocol::Tcp,
            "127.0.0.1",
            80,
            Some(AddressFamily::V6),
            Duration::from_secs(1),
        )
        .await;
        assert!(mismatch.is_err());
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let ep = Endpoint::resolve(
            Protocol::Tcp,
            "localhost",
            8080,
            Some(AddressFamily::V4),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(ep.addr().ip().is_loopback());
        assert_eq!(ep.port(), 8080);
    }
}
