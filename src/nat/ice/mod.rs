// src/nat/ice/mod.rs
//! ICE (Interactive Connectivity Establishment) connectivity core
//!
//! This module implements the connectivity-establishment half of RFC 8445:
//! - Candidate and pair priorities, foundations
//! - Check lists with the frozen algorithm and triggered checks
//! - Paced connectivity checks and inbound check handling
//! - Role conflict repair
//! - Nomination strategies
//! - Consent freshness and keep-alives (RFC 7675)
//!
//! Candidates are supplied by the caller; gathering, SDP and sockets live
//! outside this module. STUN transactions go through a
//! [`TransactionService`](crate::nat::stun::TransactionService).

pub mod agent;
pub mod candidate;
pub mod check_list;
pub mod config;
pub(crate) mod connectivity;
pub mod foundation;
pub mod keepalive;
pub mod nomination;
pub mod pair;
pub mod priority;
pub(crate) mod server;
pub mod states;
pub mod stream;
pub mod utils;

use std::time::Duration;

// Re-export main types for convenience
pub use agent::IceAgent;

pub use candidate::{Candidate, CandidateKind, CandidateType};

pub use check_list::{prune_and_order, CheckList};

pub use config::IceConfig;

pub use foundation::{calculate_pair_foundation, FoundationsRegistry};

pub use keepalive::ConsentConfig;

pub use nomination::NominationStrategy;

pub use pair::{CandidatePair, CandidatePairState, PairRef};

pub use priority::{calculate_pair_priority, calculate_priority};

pub use states::{
    CheckListState, EventBus, EventHandler, HandlerId, IceEvent, IceProcessingState,
};

pub use stream::{Component, IceMediaStream};

/// Supported ICE specifications
pub const SUPPORTED_SPECS: &[&str] = &[
    "RFC 8445 - Interactive Connectivity Establishment (ICE)",
    "RFC 7675 - STUN Usage for Consent Freshness",
    "RFC 8421 - Guidelines for Multihomed and IPv4/IPv6 Dual-Stack ICE",
];

/// Validate ICE configuration
pub fn validate_ice_config(config: &IceConfig) -> NatResult<()> {
    if config.ta.is_zero() {
        return Err(NatError::Configuration("Ta must be positive".to_string()));
    }

    if config.max_check_list_size == 0 {
        return Err(NatError::Configuration(
            "Check list size limit must be positive".to_string()
        ));
    }

    // Validate retransmissions
    if config.check_rto.is_zero() {
        return Err(NatError::Configuration("Check RTO must be positive".to_string()));
    }

    if config.check_max_wait < config.check_rto {
        return Err(NatError::Configuration(
            "Maximum retransmission wait is shorter than the RTO".to_string()
        ));
    }

    // Validate keep-alives
    if config.keep_alives && config.consent.keep_alive_interval.is_zero() {
        return Err(NatError::Configuration(
            "Keep-alive interval must be positive".to_string()
        ));
    }

    if config.consent.enabled && config.consent.wait_interval.is_zero() {
        return Err(NatError::Configuration(
            "Consent retransmission wait must be positive".to_string()
        ));
    }

    Ok(())
}

/// Configuration for interactive P2P sessions: host and reflexive pairs are
/// nominated at once and consent is refreshed every 5 seconds
pub fn create_p2p_ice_config() -> IceConfig {
    IceConfig {
        nomination_strategy: NominationStrategy::FirstHostOrReflexiveValid,
        consent: ConsentConfig {
            enabled: true,
            keep_alive_interval: Duration::from_secs(5),
            ..ConsentConfig::default()
        },
        ..IceConfig::default()
    }
}

/// Configuration favouring the best path over fast setup
pub fn create_reliable_ice_config() -> IceConfig {
    IceConfig {
        nomination_strategy: NominationStrategy::HighestPriority,
        check_list_failure_grace: Duration::from_secs(10),
        ..IceConfig::default()
    }
}

/// Re-export error types
pub use crate::nat::error::{NatError, NatResult};
