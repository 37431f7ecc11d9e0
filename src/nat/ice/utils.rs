// src/nat/ice/utils.rs
//! ICE utility functions: credentials, tie-breakers and address helpers

use std::net::{IpAddr, Ipv6Addr};

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Minimum ufrag length (RFC 8445 Section 5.3)
pub const MIN_UFRAG_LEN: usize = 4;

/// Minimum password length (RFC 8445 Section 5.3)
pub const MIN_PASSWORD_LEN: usize = 22;

/// Length of generated ufrags
const UFRAG_LEN: usize = 8;

/// Length of generated passwords
const PASSWORD_LEN: usize = 24;

fn random_ice_chars(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate a random local user fragment
pub fn generate_ufrag() -> String {
    random_ice_chars(UFRAG_LEN.max(MIN_UFRAG_LEN))
}

/// Generate a random local password
pub fn generate_password() -> String {
    random_ice_chars(PASSWORD_LEN.max(MIN_PASSWORD_LEN))
}

/// Generate a role-conflict tie-breaker
pub fn generate_tie_breaker() -> u64 {
    rand::thread_rng().gen()
}

/// Whether an IPv6 address is link-local (fe80::/10)
pub fn is_ipv6_link_local(ipv6: &Ipv6Addr) -> bool {
    (ipv6.segments()[0] & 0xffc0) == 0xfe80
}

/// Check if IP address is link-local
pub fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => is_ipv6_link_local(v6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_lengths() {
        let ufrag = generate_ufrag();
        let password = generate_password();
        assert!(ufrag.len() >= MIN_UFRAG_LEN);
        assert!(password.len() >= MIN_PASSWORD_LEN);
        assert!(ufrag.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(generate_ufrag(), ufrag);
    }

    #[test]
    fn test_link_local_detection() {
        let link_local = "fe80::1234:5678".parse::<IpAddr>().unwrap();
        let not_link_local = "2001:db8::1".parse::<IpAddr>().unwrap();
        assert!(is_link_local(&link_local));
        assert!(!is_link_local(&not_link_local));

        // Edges of fe80::/10
        let edge = "febf:ffff:ffff:ffff:ffff:ffff:ffff:ffff".parse::<IpAddr>().unwrap();
        let outside = "fec0::".parse::<IpAddr>().unwrap();
        assert!(is_link_local(&edge));
        assert!(!is_link_local(&outside));
    }
}
