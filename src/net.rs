//! Network address data model
//!
//! Destinations carry a network (TCP or UDP), an address that is either an
//! IP literal or an unresolved domain name, and a port. A `Destination` is
//! immutable once resolved; address translation upstream is represented by
//! carrying the original destination alongside it, never by mutation.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Transport network of a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Stream-oriented TCP
    Tcp,
    /// Datagram-oriented UDP
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// A destination address: IP literal or domain name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 or IPv6 literal
    Ip(IpAddr),
    /// Unresolved domain name
    Domain(String),
}

impl Address {
    /// Parse a string as an address: IP literal if it parses, domain otherwise
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.parse::<IpAddr>() {
            Ok(ip) => Self::Ip(ip),
            Err(_) => Self::Domain(s.to_string()),
        }
    }

    /// Get the IP if this address is a literal
    #[must_use]
    pub const fn ip(&self) -> Option<IpAddr> {
        match self {
            Self::Ip(ip) => Some(*ip),
            Self::Domain(_) => None,
        }
    }

    /// Get the domain if this address is a domain name
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        match self {
            Self::Ip(_) => None,
            Self::Domain(d) => Some(d),
        }
    }

    /// Check whether this address is a domain name
    #[must_use]
    pub const fn is_domain(&self) -> bool {
        matches!(self, Self::Domain(_))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(ip) => write!(f, "{ip}"),
            Self::Domain(d) => write!(f, "{d}"),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Self::Ip(ip)
    }
}

/// A resolved flow destination. Network and port are never mutated after
/// creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Transport network
    pub network: Network,
    /// Target address
    pub address: Address,
    /// Target port
    pub port: u16,
}

impl Destination {
    /// Create a TCP destination
    pub fn tcp(address: impl Into<Address>, port: u16) -> Self {
        Self {
            network: Network::Tcp,
            address: address.into(),
            port,
        }
    }

    /// Create a UDP destination
    pub fn udp(address: impl Into<Address>, port: u16) -> Self {
        Self {
            network: Network::Udp,
            address: address.into(),
            port,
        }
    }

    /// Build from a socket address
    #[must_use]
    pub fn from_socket_addr(network: Network, addr: SocketAddr) -> Self {
        Self {
            network,
            address: Address::Ip(addr.ip()),
            port: addr.port(),
        }
    }

    /// Convert to a socket address if the address is an IP literal
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.network, self.address, self.port)
    }
}
