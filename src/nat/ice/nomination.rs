// src/nat/ice/nomination.rs
//! ICE nomination procedures (RFC 8445 Section 8)
//!
//! The nominator listens to the agent's events and, while the agent is
//! controlling, decides which validated pair gets nominated for its
//! component. It runs inside the synchronous event handlers, so a
//! nomination happens before the validation that caused it returns.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::agent::IceAgent;
use super::pair::{CandidatePairState, PairRef};
use super::states::IceEvent;

/// Nomination strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NominationStrategy {
    /// Never nominate; the application calls `nominate` itself
    None,

    /// Nominate the first pair that becomes valid
    #[default]
    FirstValid,

    /// Wait for the check list to finish, then nominate the best valid pair
    /// of every component
    HighestPriority,

    /// Nominate host and reflexive pairs at once, give relayed pairs a
    /// short grace period in which a better pair may validate
    FirstHostOrReflexiveValid,
}

impl fmt::Display for NominationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NominationStrategy::None => "none",
            NominationStrategy::FirstValid => "first-valid",
            NominationStrategy::HighestPriority => "highest-priority",
            NominationStrategy::FirstHostOrReflexiveValid => "first-host-or-reflexive-valid",
        };
        f.write_str(s)
    }
}

/// Relayed pair waiting for a better alternative
#[derive(Debug)]
struct RelayWait {
    pair: PairRef,
    token: CancellationToken,
}

/// (stream name, component id)
type ComponentKey = (String, u32);

/// Nomination controller
#[derive(Debug)]
pub(crate) struct Nominator {
    agent: Weak<IceAgent>,
    strategy: RwLock<NominationStrategy>,
    relay_wait: Duration,
    relay_waits: Mutex<HashMap<ComponentKey, RelayWait>>,
}

impl Nominator {
    pub(crate) fn new(agent: Weak<IceAgent>, strategy: NominationStrategy, relay_wait: Duration) -> Self {
        Self {
            agent,
            strategy: RwLock::new(strategy),
            relay_wait,
            relay_waits: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn strategy(&self) -> NominationStrategy {
        *self.strategy.read()
    }

    pub(crate) fn set_strategy(&self, strategy: NominationStrategy) {
        *self.strategy.write() = strategy;
    }

    /// Entry point from the agent's event bus
    pub(crate) fn handle_event(&self, agent: &IceAgent, event: &IceEvent) {
        if let IceEvent::EndOfOrdinaryChecks { stream } = event {
            self.end_of_ordinary_checks(agent, stream);
            return;
        }

        let strategy = self.strategy();
        if !agent.is_controlling() || strategy == NominationStrategy::None {
            return;
        }

        let pair = match event {
            IceEvent::PairValidated { pair } => pair,
            IceEvent::PairStateChanged { pair, new: CandidatePairState::Failed, .. } => pair,
            _ => return,
        };

        if component_has_selected(agent, pair) {
            trace!("Keep-alive for pair {}", pair);
            return;
        }

        let validated = matches!(event, IceEvent::PairValidated { .. });
        match strategy {
            NominationStrategy::FirstValid if validated => {
                info!("Nominate (first valid): {}", pair);
                nominate(agent, pair);
            }
            NominationStrategy::HighestPriority => self.nominate_highest_priority(agent, pair),
            NominationStrategy::FirstHostOrReflexiveValid if validated => {
                self.nominate_first_host_or_reflexive(agent, pair)
            }
            _ => {}
        }
    }

    fn nominate_highest_priority(&self, agent: &IceAgent, trigger: &PairRef) {
        let Some(stream) = agent.stream(trigger.stream()) else {
            return;
        };
        if !stream.check_list().all_checks_completed() {
            return;
        }

        for component in stream.components() {
            if let Some(best) = stream.valid_pair(component.id()) {
                info!("Nominate (highest priority): {}", best);
                nominate(agent, &best);
            }
        }
    }

    fn nominate_first_host_or_reflexive(&self, agent: &IceAgent, pair: &PairRef) {
        let key: ComponentKey = (pair.stream().to_string(), pair.component_id());

        let nominate_now = {
            let mut waits = self.relay_waits.lock();
            if pair.is_relayed() {
                if !waits.contains_key(&key) {
                    info!("Wait {:?} before nominating relayed pair {}", self.relay_wait, pair);
                    let token = agent.shutdown_token().child_token();
                    waits.insert(key.clone(), RelayWait { pair: pair.clone(), token: token.clone() });
                    agent.spawn(relay_timeout(self.agent.clone(), key, pair.clone(), token, self.relay_wait));
                }
                false
            } else {
                if let Some(wait) = waits.remove(&key) {
                    wait.token.cancel();
                    info!("Found a better pair to nominate for component {}/{}", key.0, key.1);
                }
                true
            }
        };

        if nominate_now {
            info!("Nominate (first host or reflexive valid): {}", pair);
            nominate(agent, pair);
        }
    }

    /// A stream ran out of ordinary checks: a waiting relayed pair whose
    /// every alternative failed is nominated right away
    fn end_of_ordinary_checks(&self, agent: &IceAgent, stream_name: &str) {
        let waiting: Vec<(ComponentKey, PairRef)> = self
            .relay_waits
            .lock()
            .iter()
            .filter(|(key, _)| key.0 == stream_name)
            .map(|(key, wait)| (key.clone(), wait.pair.clone()))
            .collect();
        if waiting.is_empty() {
            return;
        }

        let Some(stream) = agent.stream(stream_name) else {
            return;
        };
        let pairs = stream.check_list().pairs();

        for (key, relayed) in waiting {
            let all_others_failed = pairs
                .iter()
                .filter(|p| !Arc::ptr_eq(p, &relayed))
                .all(|p| p.state() == CandidatePairState::Failed);

            if all_others_failed && !relayed.is_nominated() {
                if let Some(wait) = self.relay_waits.lock().remove(&key) {
                    wait.token.cancel();
                }
                info!("Nominate (first host or reflexive valid): {}", relayed);
                nominate(agent, &relayed);
            }
        }
    }

    fn relay_wait_expired(&self, agent: &IceAgent, key: &ComponentKey, pair: &PairRef) {
        let still_waiting = {
            let mut waits = self.relay_waits.lock();
            match waits.get(key) {
                Some(wait) if Arc::ptr_eq(&wait.pair, pair) => {
                    waits.remove(key);
                    true
                }
                _ => false,
            }
        };

        if still_waiting {
            info!("Nominate (first host or reflexive valid): {}", pair);
            nominate(agent, pair);
        }
    }
}

fn component_has_selected(agent: &IceAgent, pair: &PairRef) -> bool {
    agent
        .stream(pair.stream())
        .and_then(|s| s.component(pair.component_id()))
        .map_or(false, |c| c.selected_pair().is_some())
}

fn nominate(agent: &IceAgent, pair: &PairRef) {
    if let Err(e) = agent.nominate(pair) {
        debug!("Could not nominate {}: {}", pair, e);
    }
}

async fn relay_timeout(
    agent: Weak<IceAgent>,
    key: ComponentKey,
    pair: PairRef,
    token: CancellationToken,
    wait: Duration,
) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(wait) => {
            if let Some(agent) = agent.upgrade() {
                agent.nominator().relay_wait_expired(&agent, &key, &pair);
            }
        }
    }
}
