// src/nat/ice/config.rs
//! ICE agent configuration.
//!
//! Every tunable the connectivity core reads lives here and is handed to
//! [`IceAgent::new`](super::agent::IceAgent::new). Durations serialize as
//! integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::keepalive::ConsentConfig;
use super::nomination::NominationStrategy;
use crate::nat::error::{NatError, NatResult};

/// Default pacing interval Ta (RFC 8445 Section 14.2)
pub const DEFAULT_TA: Duration = Duration::from_millis(20);

/// Default aggregate check list size across all streams
pub const DEFAULT_MAX_CHECK_LIST_SIZE: usize = 100;

/// Default delay between COMPLETED and TERMINATED
pub const DEFAULT_TERMINATION_DELAY: Duration = Duration::from_millis(3000);

/// Retransmission timeout for connectivity checks
pub const DEFAULT_CHECK_RTO: Duration = Duration::from_millis(100);

/// Upper bound of the doubling check retransmission wait
pub const DEFAULT_CHECK_MAX_WAIT: Duration = Duration::from_millis(1600);

/// Retransmissions for a connectivity check
pub const DEFAULT_CHECK_MAX_RETRANSMISSIONS: u32 = 6;

/// Grace period before a fully checked list without valid pairs fails
pub const DEFAULT_CHECK_LIST_FAILURE_GRACE: Duration = Duration::from_secs(5);

/// How long a validated relayed pair waits for a better one
pub const DEFAULT_RELAY_NOMINATION_WAIT: Duration = Duration::from_millis(800);

/// ICE agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// Pacing interval between checks of one list
    #[serde(with = "duration_ms")]
    pub ta: Duration,

    /// Maximum number of pairs across all check lists
    pub max_check_list_size: usize,

    /// Delay between COMPLETED and TERMINATED (zero terminates immediately)
    #[serde(with = "duration_ms")]
    pub termination_delay: Duration,

    /// Initial retransmission timeout of a check
    #[serde(with = "duration_ms")]
    pub check_rto: Duration,

    /// Maximum retransmission wait of a check
    #[serde(with = "duration_ms")]
    pub check_max_wait: Duration,

    /// Retransmissions of a check over unreliable transports
    pub check_max_retransmissions: u32,

    /// Grace period before failing a list with no valid pair per component
    #[serde(with = "duration_ms")]
    pub check_list_failure_grace: Duration,

    /// Wait before nominating a relayed pair
    #[serde(with = "duration_ms")]
    pub relay_nomination_wait: Duration,

    /// Nomination strategy used while controlling
    pub nomination_strategy: NominationStrategy,

    /// Initial role
    pub controlling: bool,

    /// Run the keep-alive loop once COMPLETED
    pub keep_alives: bool,

    /// Consent freshness / keep-alive parameters
    pub consent: ConsentConfig,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            ta: DEFAULT_TA,
            max_check_list_size: DEFAULT_MAX_CHECK_LIST_SIZE,
            termination_delay: DEFAULT_TERMINATION_DELAY,
            check_rto: DEFAULT_CHECK_RTO,
            check_max_wait: DEFAULT_CHECK_MAX_WAIT,
            check_max_retransmissions: DEFAULT_CHECK_MAX_RETRANSMISSIONS,
            check_list_failure_grace: DEFAULT_CHECK_LIST_FAILURE_GRACE,
            relay_nomination_wait: DEFAULT_RELAY_NOMINATION_WAIT,
            nomination_strategy: NominationStrategy::default(),
            controlling: true,
            keep_alives: true,
            consent: ConsentConfig::default(),
        }
    }
}

impl IceConfig {
    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> NatResult<Self> {
        let config: IceConfig = serde_json::from_str(json)
            .map_err(|e| NatError::Configuration(format!("invalid ICE config: {}", e)))?;
        super::validate_ice_config(&config)?;
        Ok(config)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> NatResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| NatError::Configuration(format!("cannot serialize ICE config: {}", e)))
    }
}

/// `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IceConfig::default();
        assert_eq!(config.ta, Duration::from_millis(20));
        assert_eq!(config.max_check_list_size, 100);
        assert_eq!(config.termination_delay, Duration::from_millis(3000));
        assert_eq!(config.check_rto, Duration::from_millis(100));
        assert_eq!(config.nomination_strategy, NominationStrategy::FirstValid);
        assert!(config.controlling);
        assert!(!config.consent.enabled);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = IceConfig::from_json(
            r#"{ "ta": 50, "nomination_strategy": "HighestPriority", "consent": { "enabled": true } }"#,
        )
        .unwrap();
        assert_eq!(config.ta, Duration::from_millis(50));
        assert_eq!(config.nomination_strategy, NominationStrategy::HighestPriority);
        assert!(config.consent.enabled);
        assert_eq!(config.consent.max_retransmissions, 30);
        assert_eq!(config.max_check_list_size, 100);
    }

    #[test]
    fn test_json_roundtrip_keeps_millis() {
        let mut config = IceConfig::default();
        config.relay_nomination_wait = Duration::from_millis(1234);
        let json = config.to_json().unwrap();
        assert!(json.contains("\"relay_nomination_wait\": 1234"));
        assert_eq!(IceConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(matches!(
            IceConfig::from_json("{ \"ta\": \"fast\" }"),
            Err(NatError::Configuration(_))
        ));
    }
}
