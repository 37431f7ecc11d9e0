// src/nat/ice/priority.rs
//! ICE priority calculation (RFC 8445 Section 5.1.2 and 6.1.2.3)

use std::net::IpAddr;

use super::candidate::CandidateType;
use super::utils::is_ipv6_link_local;

/// Type preference of host candidates (RFC 8445 Section 5.1.2.2)
pub const TYPE_PREFERENCE_HOST: u32 = 126;
/// Type preference of peer reflexive candidates
pub const TYPE_PREFERENCE_PRFLX: u32 = 110;
/// Type preference of server reflexive candidates
pub const TYPE_PREFERENCE_SRFLX: u32 = 100;
/// Type preference of relayed candidates
pub const TYPE_PREFERENCE_RELAY: u32 = 0;

/// Largest type preference that fits the priority formula
pub const MAX_TYPE_PREFERENCE: u32 = 126;
/// Largest local preference that fits the priority formula
pub const MAX_LOCAL_PREFERENCE: u32 = 65535;
/// Largest component ID
pub const MAX_COMPONENT_ID: u32 = 256;

/// Local preference of a component with a single host address
pub const LOCAL_PREFERENCE_SINGLE_HOST: u32 = 65535;
/// Local preference of virtual interfaces, always last (RFC 8421)
pub const LOCAL_PREFERENCE_VIRTUAL: u32 = 0;
/// Local preference of IPv6 link-local addresses
pub const LOCAL_PREFERENCE_IPV6_LINK_LOCAL: u32 = 30;
/// Local preference of routable IPv6 addresses
pub const LOCAL_PREFERENCE_IPV6: u32 = 40;
/// Local preference of IPv4 addresses
pub const LOCAL_PREFERENCE_IPV4: u32 = 10;

/// Calculate candidate priority per RFC 8445 Section 5.1.2.1
///
/// priority = (2^24)*(type preference) +
///            (2^8)*(local preference) +
///            (2^0)*(256 - component ID)
pub fn calculate_priority(
    candidate_type: CandidateType,
    local_preference: u32,
    component_id: u32,
) -> u32 {
    let type_pref = get_type_preference(candidate_type).min(MAX_TYPE_PREFERENCE);
    let local_pref = local_preference.min(MAX_LOCAL_PREFERENCE);
    let component = component_id.clamp(1, MAX_COMPONENT_ID);

    (type_pref << 24) + (local_pref << 8) + (256 - component)
}

/// Get type preference for candidate type
pub fn get_type_preference(candidate_type: CandidateType) -> u32 {
    match candidate_type {
        CandidateType::Host => TYPE_PREFERENCE_HOST,
        CandidateType::PeerReflexive => TYPE_PREFERENCE_PRFLX,
        CandidateType::ServerReflexive => TYPE_PREFERENCE_SRFLX,
        CandidateType::Relayed => TYPE_PREFERENCE_RELAY,
    }
}

/// Local preference of a candidate address within its component.
///
/// A component with fewer than two host candidates is not multihomed and
/// uses the maximum. Otherwise virtual interfaces rank last and IPv6 ranks
/// above IPv4, with link-local IPv6 below global IPv6.
pub fn local_preference(ip: &IpAddr, is_virtual: bool, host_candidates: usize) -> u32 {
    if host_candidates < 2 {
        return LOCAL_PREFERENCE_SINGLE_HOST;
    }

    if is_virtual {
        return LOCAL_PREFERENCE_VIRTUAL;
    }

    match ip {
        IpAddr::V6(v6) if is_ipv6_link_local(v6) => LOCAL_PREFERENCE_IPV6_LINK_LOCAL,
        IpAddr::V6(_) => LOCAL_PREFERENCE_IPV6,
        IpAddr::V4(_) => LOCAL_PREFERENCE_IPV4,
    }
}

/// Preference used when picking a component's default candidate.
///
/// Relayed candidates are the most likely to work everywhere, so they
/// come first.
pub fn default_preference(candidate_type: CandidateType, ip: &IpAddr) -> u32 {
    match (candidate_type, ip) {
        (CandidateType::Relayed, _) => 30,
        (CandidateType::Host, IpAddr::V4(_)) => 25,
        (CandidateType::Host, IpAddr::V6(_)) => 20,
        (CandidateType::ServerReflexive, _) => 10,
        _ => 5,
    }
}

/// Calculate pair priority per RFC 8445 Section 6.1.2.3
///
/// - Let G be the priority of the candidate provided by the controlling agent
/// - Let D be the priority of the candidate provided by the controlled agent
/// - Pair Priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
pub fn calculate_pair_priority(
    controlling: bool,
    local_priority: u32,
    remote_priority: u32,
) -> u64 {
    let (g, d) = if controlling {
        (local_priority as u64, remote_priority as u64)
    } else {
        (remote_priority as u64, local_priority as u64)
    };

    let min_priority = g.min(d);
    let max_priority = g.max(d);

    (min_priority << 32) + (max_priority << 1) + if g > d { 1 } else { 0 }
}
