//! Network address representation
//!
//! An [`Address`] is either a concrete socket address or an FQDN with a
//! port. Flow metadata uses it for sources and destinations; the
//! write-back path resolves FQDN destinations just before sending.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::config::DomainStrategy;
use crate::error::UdpError;

/// A socket address or a domain name with port
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Address {
    /// IP socket address
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// The unspecified address (`0.0.0.0:0`), used where a destination
    /// has not been decided yet
    #[must_use]
    pub fn unspecified() -> Self {
        Address::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Whether this address identifies an actual peer or target.
    ///
    /// The unspecified socket address and empty domains are invalid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match self {
            Address::Socket(addr) => !(addr.ip().is_unspecified() && addr.port() == 0),
            Address::Domain(domain, _) => !domain.is_empty(),
        }
    }

    /// Whether this is a domain address
    #[must_use]
    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_, _))
    }

    /// The port
    #[must_use]
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// The host part as a string
    #[must_use]
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// The socket address, if this is one
    #[must_use]
    pub fn as_socket(&self) -> Option<SocketAddr> {
        match self {
            Address::Socket(addr) => Some(*addr),
            Address::Domain(_, _) => None,
        }
    }

    /// Resolve to a socket address, honoring the domain strategy for
    /// FQDNs. Socket addresses resolve to themselves.
    pub async fn resolve(&self, strategy: DomainStrategy) -> Result<SocketAddr, UdpError> {
        match self {
            Address::Socket(addr) => Ok(*addr),
            Address::Domain(domain, port) => {
                let candidates: Vec<SocketAddr> =
                    tokio::net::lookup_host((domain.as_str(), *port))
                        .await
                        .map_err(|e| UdpError::resolve(self, e))?
                        .collect();
                pick_by_strategy(&candidates, strategy)
                    .ok_or_else(|| UdpError::resolve(self, "no suitable address"))
            }
        }
    }
}

/// Apply a domain strategy to a resolver result
fn pick_by_strategy(candidates: &[SocketAddr], strategy: DomainStrategy) -> Option<SocketAddr> {
    let v4 = candidates.iter().find(|a| a.is_ipv4()).copied();
    let v6 = candidates.iter().find(|a| a.is_ipv6()).copied();
    match strategy {
        DomainStrategy::AsIs => candidates.first().copied(),
        DomainStrategy::PreferIpv4 => v4.or(v6),
        DomainStrategy::PreferIpv6 => v6.or(v4),
        DomainStrategy::Ipv4Only => v4,
        DomainStrategy::Ipv6Only => v6,
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{addr}"),
            Address::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl From<(&str, u16)> for Address {
    fn from((domain, port): (&str, u16)) -> Self {
        Address::Domain(domain.to_string(), port)
    }
}
