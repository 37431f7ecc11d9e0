// src/nat/ice/keepalive.rs
//! ICE keepalive and consent freshness implementation (RFC 7675)
//!
//! Once processing is COMPLETED, every selected pair is kept alive
//! periodically: with a full Binding request when consent freshness is
//! enabled, otherwise with a Binding indication. A consent request that
//! exhausts its retransmissions fails the pair and emits
//! [`IceEvent::ConsentLost`](super::states::IceEvent::ConsentLost).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::agent::IceAgent;
use super::config::duration_ms;
use crate::nat::stun::transaction::RetransmissionPolicy;

/// Wait between consent request retransmissions
pub const DEFAULT_CONSENT_WAIT_INTERVAL: Duration = Duration::from_millis(500);

/// Retransmissions before consent is considered lost
pub const DEFAULT_CONSENT_MAX_RETRANSMISSIONS: u32 = 30;

/// Pause between two keep-alive rounds
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Consent freshness configuration per RFC 7675
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsentConfig {
    /// Send Binding requests instead of indications on selected pairs
    pub enabled: bool,

    /// Retransmission wait of a consent request (fixed, not doubled)
    #[serde(with = "duration_ms")]
    pub wait_interval: Duration,

    /// Retransmissions of a consent request
    pub max_retransmissions: u32,

    /// Pause between keep-alive rounds
    #[serde(with = "duration_ms")]
    pub keep_alive_interval: Duration,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wait_interval: DEFAULT_CONSENT_WAIT_INTERVAL,
            max_retransmissions: DEFAULT_CONSENT_MAX_RETRANSMISSIONS,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
        }
    }
}

impl ConsentConfig {
    /// Schedule used for consent requests
    pub fn retransmission_policy(&self) -> RetransmissionPolicy {
        RetransmissionPolicy::new(self.wait_interval, self.wait_interval, self.max_retransmissions)
    }

    /// Time after which an unanswered consent request is given up
    pub fn consent_timeout(&self) -> Duration {
        self.retransmission_policy().total_wait()
    }
}

/// Keep-alive loop of one agent
#[derive(Debug)]
pub(crate) struct KeepAlive {
    agent: Weak<IceAgent>,
    scheduled: AtomicBool,
}

impl KeepAlive {
    pub(crate) fn new(agent: Weak<IceAgent>) -> Self {
        Self { agent, scheduled: AtomicBool::new(false) }
    }

    /// Spawn the loop unless it already runs
    pub(crate) fn schedule(&self, token: CancellationToken) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let Some(agent) = self.agent.upgrade() else {
            return;
        };
        info!("Agent {} starts keep-alives", agent.id());
        agent.spawn(run(self.agent.clone(), token));
    }
}

/// One round: a consent check or an indication per selected pair
fn keep_alive_round(agent: &IceAgent) {
    let consent = agent.perform_consent_freshness();
    let policy = agent.consent_config().retransmission_policy();

    for stream in agent.streams() {
        for component in stream.components() {
            let Some(pair) = component.selected_pair() else {
                continue;
            };

            if consent {
                trace!("Consent check for {}", pair);
                agent.client().start_consent_check(agent, &pair, policy);
            } else {
                trace!("Binding indication for {}", pair);
                agent.client().send_binding_indication(agent, &pair);
            }
        }
    }
}

async fn run(agent: Weak<IceAgent>, token: CancellationToken) {
    loop {
        let interval = {
            let Some(agent) = agent.upgrade() else {
                break;
            };
            if !agent.keep_alive_condition() {
                break;
            }
            keep_alive_round(&agent);
            agent.consent_config().keep_alive_interval
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("Keep-alive loop ends");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consent_defaults() {
        let config = ConsentConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.wait_interval, Duration::from_millis(500));
        assert_eq!(config.max_retransmissions, 30);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_consent_timeout_is_fixed_interval() {
        let config = ConsentConfig::default();
        let policy = config.retransmission_policy();
        assert_eq!(policy.wait_after(0), policy.wait_after(20));
        assert_eq!(config.consent_timeout(), Duration::from_millis(500 * 31));
    }

    #[test]
    fn test_consent_config_json() {
        let config: ConsentConfig =
            serde_json::from_str(r#"{ "enabled": true, "keep_alive_interval": 2000 }"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(2));
        assert_eq!(config.max_retransmissions, 30);
    }
}
