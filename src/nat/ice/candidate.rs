// src/nat/ice/candidate.rs
//! ICE candidate representation
//!
//! Candidates are plain values. A candidate's base is stored as a transport
//! address and resolved through the owning component, so no candidate holds
//! a pointer to another one.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::priority::{calculate_priority, default_preference, LOCAL_PREFERENCE_SINGLE_HOST};
use crate::nat::transport::{TransportAddress, TransportProtocol};

/// ICE candidate type (RFC 8445 Section 5.1.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    /// Host candidate (local address)
    Host,
    /// Server reflexive (from STUN)
    ServerReflexive,
    /// Peer reflexive (discovered during connectivity checks)
    PeerReflexive,
    /// Relayed candidate (from TURN)
    Relayed,
}

impl CandidateType {
    /// SDP token for this type
    pub fn to_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relayed => "relay",
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_str())
    }
}

/// How a candidate was obtained, with the data specific to that origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    /// Address of a local interface
    Host,
    /// Mapped address learned from a STUN server
    ServerReflexive {
        /// STUN server that reported the mapping
        stun_server: SocketAddr,
    },
    /// Mapped address learned from a connectivity check
    PeerReflexive,
    /// Address allocated on a TURN server
    Relayed {
        /// TURN server holding the allocation
        relay_server: SocketAddr,
        /// Our reflexive address as seen by the relay
        mapped: SocketAddr,
    },
}

impl CandidateKind {
    /// Payload-free type tag
    pub fn candidate_type(&self) -> CandidateType {
        match self {
            CandidateKind::Host => CandidateType::Host,
            CandidateKind::ServerReflexive { .. } => CandidateType::ServerReflexive,
            CandidateKind::PeerReflexive => CandidateType::PeerReflexive,
            CandidateKind::Relayed { .. } => CandidateType::Relayed,
        }
    }

    /// STUN or TURN server that produced the candidate
    pub fn server_address(&self) -> Option<SocketAddr> {
        match self {
            CandidateKind::ServerReflexive { stun_server } => Some(*stun_server),
            CandidateKind::Relayed { relay_server, .. } => Some(*relay_server),
            CandidateKind::Host | CandidateKind::PeerReflexive => None,
        }
    }
}

/// ICE candidate, local or remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Transport address
    pub address: TransportAddress,

    /// Origin of the candidate
    pub kind: CandidateKind,

    /// Component ID (1 for RTP, 2 for RTCP)
    pub component_id: u32,

    /// Foundation (RFC 8445 Section 5.1.1.3)
    pub foundation: String,

    /// Priority (RFC 8445 Section 5.1.2)
    pub priority: u32,

    /// Local preference the priority was computed with
    pub local_preference: u32,

    /// Address traffic is actually sent from; self for host and relayed
    pub base: TransportAddress,

    /// Related address (base for reflexive, mapped address for relayed)
    pub related: Option<TransportAddress>,

    /// Ufrag of the agent that owns a remote candidate
    pub ufrag: Option<String>,

    /// Candidate sits on a virtual (VPN, tunnel) interface
    pub is_virtual: bool,
}

impl Candidate {
    fn with_kind(address: TransportAddress, kind: CandidateKind, component_id: u32) -> Self {
        Self {
            address,
            kind,
            component_id,
            foundation: String::new(),
            priority: 0,
            local_preference: LOCAL_PREFERENCE_SINGLE_HOST,
            base: address,
            related: None,
            ufrag: None,
            is_virtual: false,
        }
    }

    /// Create a new host candidate
    pub fn host(address: TransportAddress, component_id: u32) -> Self {
        Self::with_kind(address, CandidateKind::Host, component_id)
    }

    /// Create a server reflexive candidate derived from `base`
    pub fn server_reflexive(
        address: TransportAddress,
        base: TransportAddress,
        stun_server: SocketAddr,
        component_id: u32,
    ) -> Self {
        let mut candidate =
            Self::with_kind(address, CandidateKind::ServerReflexive { stun_server }, component_id);
        candidate.base = base;
        candidate.related = Some(base);
        candidate
    }

    /// Create a relayed candidate; its base is itself
    pub fn relayed(
        address: TransportAddress,
        relay_server: SocketAddr,
        mapped: SocketAddr,
        component_id: u32,
    ) -> Self {
        let mut candidate = Self::with_kind(
            address,
            CandidateKind::Relayed { relay_server, mapped },
            component_id,
        );
        candidate.related = Some(TransportAddress::new(mapped, address.protocol));
        candidate
    }

    /// Create a local peer reflexive candidate discovered by a check sent
    /// from `base`, keeping the priority advertised in that check
    pub fn peer_reflexive(
        address: TransportAddress,
        base: TransportAddress,
        component_id: u32,
        priority: u32,
    ) -> Self {
        let mut candidate = Self::with_kind(address, CandidateKind::PeerReflexive, component_id);
        candidate.base = base;
        candidate.related = Some(base);
        candidate.priority = priority;
        candidate
    }

    /// Create a remote candidate as signalled by the peer
    pub fn remote(
        address: TransportAddress,
        kind: CandidateKind,
        component_id: u32,
        foundation: impl Into<String>,
        priority: u32,
    ) -> Self {
        let mut candidate = Self::with_kind(address, kind, component_id);
        candidate.foundation = foundation.into();
        candidate.priority = priority;
        candidate
    }

    /// Set the related address
    pub fn with_related(mut self, related: TransportAddress) -> Self {
        self.related = Some(related);
        self
    }

    /// Set the owning agent's ufrag
    pub fn with_ufrag(mut self, ufrag: impl Into<String>) -> Self {
        self.ufrag = Some(ufrag.into());
        self
    }

    /// Mark the candidate as living on a virtual interface
    pub fn with_virtual(mut self, is_virtual: bool) -> Self {
        self.is_virtual = is_virtual;
        self
    }

    /// Candidate type tag
    pub fn candidate_type(&self) -> CandidateType {
        self.kind.candidate_type()
    }

    /// Transport protocol
    pub fn transport(&self) -> TransportProtocol {
        self.address.protocol
    }

    /// Whether this candidate was allocated on a relay
    pub fn is_relayed(&self) -> bool {
        self.candidate_type() == CandidateType::Relayed
    }

    /// STUN/TURN server the candidate came from
    pub fn server_address(&self) -> Option<SocketAddr> {
        self.kind.server_address()
    }

    /// Priority this candidate would have if it were of type `candidate_type`
    pub fn priority_for_type(&self, candidate_type: CandidateType) -> u32 {
        calculate_priority(candidate_type, self.local_preference, self.component_id)
    }

    /// Priority advertised in the PRIORITY attribute of checks sent from
    /// this candidate (RFC 8445 Section 7.1.1)
    pub fn prflx_priority(&self) -> u32 {
        self.priority_for_type(CandidateType::PeerReflexive)
    }

    /// Recompute the priority from the candidate's own type
    pub fn compute_priority(&mut self, local_preference: u32) {
        self.local_preference = local_preference;
        self.priority = self.priority_for_type(self.candidate_type());
    }

    /// Preference when choosing a component's default candidate
    pub fn default_preference(&self) -> u32 {
        default_preference(self.candidate_type(), &self.address.ip())
    }

    /// Same transport address and same base (RFC 8445 Section 5.1.3)
    pub fn is_redundant_with(&self, other: &Candidate) -> bool {
        self.address == other.address && self.base == other.base
    }

    /// Whether a check from this candidate can plausibly reach `remote`
    pub fn can_reach(&self, remote: &Candidate) -> bool {
        self.address.can_reach(&remote.address)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} comp={} prio={} foundation={}",
            self.candidate_type(),
            self.address,
            self.component_id,
            self.priority,
            self.foundation
        )?;
        if self.base != self.address {
            write!(f, " base={}", self.base)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp(s: &str) -> TransportAddress {
        TransportAddress::udp(s.parse().unwrap())
    }

    #[test]
    fn test_host_is_its_own_base() {
        let host = Candidate::host(udp("192.168.1.100:54321"), 1);
        assert_eq!(host.base, host.address);
        assert_eq!(host.related, None);
        assert_eq!(host.candidate_type(), CandidateType::Host);
    }

    #[test]
    fn test_srflx_base_and_server() {
        let base = udp("192.168.1.100:54321");
        let stun: SocketAddr = "198.51.100.1:3478".parse().unwrap();
        let srflx = Candidate::server_reflexive(udp("203.0.113.5:40000"), base, stun, 1);
        assert_eq!(srflx.base, base);
        assert_eq!(srflx.related, Some(base));
        assert_eq!(srflx.server_address(), Some(stun));
    }

    #[test]
    fn test_relayed_related_is_mapped() {
        let relay: SocketAddr = "198.51.100.2:3478".parse().unwrap();
        let mapped: SocketAddr = "203.0.113.5:40001".parse().unwrap();
        let cand = Candidate::relayed(udp("198.51.100.2:50000"), relay, mapped, 1);
        assert!(cand.is_relayed());
        assert_eq!(cand.base, cand.address);
        assert_eq!(cand.related, Some(TransportAddress::udp(mapped)));
    }

    #[test]
    fn test_prflx_priority_uses_own_local_preference() {
        let mut host = Candidate::host(udp("10.0.0.1:5000"), 1);
        host.compute_priority(65535);
        assert_eq!(host.priority, (126 << 24) + (65535 << 8) + 255);
        assert_eq!(host.prflx_priority(), (110 << 24) + (65535 << 8) + 255);
    }

    #[test]
    fn test_redundancy_needs_same_base() {
        let a = Candidate::host(udp("10.0.0.1:5000"), 1);
        let b = Candidate::host(udp("10.0.0.1:5000"), 1);
        let c = Candidate::peer_reflexive(udp("10.0.0.1:5000"), udp("10.0.0.2:5000"), 1, 10);
        assert!(a.is_redundant_with(&b));
        assert!(!a.is_redundant_with(&c));
    }
}
