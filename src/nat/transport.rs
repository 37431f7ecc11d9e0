// src/nat/transport.rs
//! Transport addresses as ICE sees them: a socket address plus its transport

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::nat::ice::utils::is_ipv6_link_local;

/// Transport protocol of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportProtocol {
    /// Datagram transport
    Udp,
    /// Stream transport (RFC 6544)
    Tcp,
}

impl TransportProtocol {
    /// Reliable transports never retransmit checks
    pub fn is_reliable(&self) -> bool {
        matches!(self, TransportProtocol::Tcp)
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Udp => write!(f, "udp"),
            TransportProtocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Socket address bound to a transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportAddress {
    /// IP address and port
    pub addr: SocketAddr,
    /// Transport protocol
    pub protocol: TransportProtocol,
}

impl TransportAddress {
    /// Create a transport address
    pub fn new(addr: SocketAddr, protocol: TransportProtocol) -> Self {
        Self { addr, protocol }
    }

    /// UDP transport address
    pub fn udp(addr: SocketAddr) -> Self {
        Self::new(addr, TransportProtocol::Udp)
    }

    /// TCP transport address
    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new(addr, TransportProtocol::Tcp)
    }

    /// IP part of the address
    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Port part of the address
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Whether this is an IPv6 address
    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// Whether this is an IPv6 link-local address (fe80::/10)
    pub fn is_link_local_v6(&self) -> bool {
        match self.addr.ip() {
            IpAddr::V6(v6) => is_ipv6_link_local(&v6),
            IpAddr::V4(_) => false,
        }
    }

    /// Same address under a different transport
    pub fn with_protocol(&self, protocol: TransportProtocol) -> Self {
        Self::new(self.addr, protocol)
    }

    /// Whether traffic from this address can plausibly reach `dst`.
    ///
    /// Requires the same transport and address family; IPv6 link-local
    /// addresses only reach other link-local addresses.
    pub fn can_reach(&self, dst: &TransportAddress) -> bool {
        if self.protocol != dst.protocol {
            return false;
        }

        if self.is_ipv6() != dst.is_ipv6() {
            return false;
        }

        if self.is_ipv6() && self.is_link_local_v6() != dst.is_link_local_v6() {
            return false;
        }

        true
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.protocol)
    }
}

impl From<SocketAddr> for TransportAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::udp(addr)
    }
}
