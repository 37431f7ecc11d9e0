// src/nat/ice/foundation.rs
//! Foundation assignment for ICE candidates (RFC 8445 Section 5.1.1.3)
//!
//! The foundation is an identifier, scoped within a session, that groups
//! similar candidates together for the purposes of computing candidate pairs
//! and applying rules during the connectivity check procedure. Two candidates
//! are similar when they share type, base IP, STUN/TURN server and transport.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use parking_lot::Mutex;
use tracing::trace;

use super::candidate::CandidateType;
use crate::nat::transport::TransportProtocol;

/// First foundation handed to local candidates
const FIRST_LOCAL_FOUNDATION: u64 = 1;

/// First foundation handed to remote peer-reflexive candidates, kept far
/// away from local foundations
const FIRST_REMOTE_PRFLX_FOUNDATION: u64 = 10000;

/// Characteristics that make two candidates similar
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FoundationKey {
    candidate_type: CandidateType,
    base_ip: IpAddr,
    server: Option<SocketAddr>,
    transport: TransportProtocol,
}

#[derive(Debug)]
struct RegistryState {
    assigned: HashMap<FoundationKey, String>,
    next_local: u64,
    next_remote_prflx: u64,
}

/// Session-scoped foundation registry.
///
/// Similar candidates always receive the same foundation; new
/// characteristics get the next integer, starting at 1.
#[derive(Debug)]
pub struct FoundationsRegistry {
    state: Mutex<RegistryState>,
}

impl FoundationsRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                assigned: HashMap::new(),
                next_local: FIRST_LOCAL_FOUNDATION,
                next_remote_prflx: FIRST_REMOTE_PRFLX_FOUNDATION,
            }),
        }
    }

    /// Foundation for a local candidate with these characteristics
    pub fn assign(
        &self,
        candidate_type: CandidateType,
        base_ip: IpAddr,
        server: Option<SocketAddr>,
        transport: TransportProtocol,
    ) -> String {
        let key = FoundationKey { candidate_type, base_ip, server, transport };
        let mut state = self.state.lock();

        if let Some(existing) = state.assigned.get(&key) {
            return existing.clone();
        }

        let foundation = state.next_local.to_string();
        state.next_local += 1;
        state.assigned.insert(key, foundation.clone());
        trace!("Assigned foundation {} to {:?} base {}", foundation, candidate_type, base_ip);
        foundation
    }

    /// Fresh foundation for a remote peer-reflexive candidate learned from
    /// an incoming check
    pub fn obtain_remote_prflx_foundation(&self) -> String {
        let mut state = self.state.lock();
        let foundation = state.next_remote_prflx.to_string();
        state.next_remote_prflx += 1;
        foundation
    }

    /// Number of distinct local foundations handed out
    pub fn len(&self) -> usize {
        self.state.lock().assigned.len()
    }

    /// Whether no local foundation was assigned yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FoundationsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Foundation of a candidate pair: both candidate foundations joined
pub fn calculate_pair_foundation(local_foundation: &str, remote_foundation: &str) -> String {
    format!("{}:{}", local_foundation, remote_foundation)
}
