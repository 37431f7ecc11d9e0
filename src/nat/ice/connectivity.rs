// src/nat/ice/connectivity.rs
//! ICE connectivity check client (RFC 8445 Section 7.2)
//!
//! One pacemaker task per active check list sends a check every
//! `Ta * max(1, active lists)`, draining the triggered-check queue before
//! ordinary checks. Responses and timeouts come back through the
//! transaction service's callback and drive pair, check list and agent
//! state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::agent::IceAgent;
use super::candidate::Candidate;
use super::pair::{CandidatePair, CandidatePairState, PairRef};
use super::states::{CheckListState, IceEvent, IceProcessingState};
use super::stream::IceMediaStream;
use crate::nat::stun::protocol::{AttributeValue, Message, TransactionId, ROLE_CONFLICT};
use crate::nat::stun::transaction::{
    RetransmissionPolicy, StunResponseEvent, TransactionOutcome,
};
use crate::nat::transport::TransportAddress;

/// Why a Binding request is being sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckKind {
    /// Ordinary or triggered check; drives the pair state machine
    Ordinary,
    /// Consent freshness request on a selected pair
    Consent,
}

/// Running pacemaker: (instance id, stop token)
type PaceMakerEntry = (u64, CancellationToken);

/// Sends connectivity checks and processes their outcome
#[derive(Debug)]
pub(crate) struct ConnectivityCheckClient {
    agent: Weak<IceAgent>,
    /// Agent-wide token; every token handed out below is its child
    root: CancellationToken,
    /// Parent of the current pacemakers, replaced on `stop`
    token: Mutex<CancellationToken>,
    pacemakers: Mutex<HashMap<String, PaceMakerEntry>>,
    next_pacemaker_id: AtomicU64,
    /// Streams whose failure grace timer has been armed
    failure_timers: Mutex<HashSet<String>>,
}

impl ConnectivityCheckClient {
    pub(crate) fn new(agent: Weak<IceAgent>, root: CancellationToken) -> Self {
        Self {
            agent,
            token: Mutex::new(root.child_token()),
            root,
            pacemakers: Mutex::new(HashMap::new()),
            next_pacemaker_id: AtomicU64::new(1),
            failure_timers: Mutex::new(HashSet::new()),
        }
    }

    /// Start checks for the first stream still pending
    pub(crate) fn start_checks_first(&self, agent: &IceAgent) {
        let streams = agent.streams_with_pending_connectivity_establishment();
        if let Some(first) = streams.first() {
            info!("Agent {} starts connectivity checks", agent.id());
            self.start_checks(agent, first);
        }
    }

    /// Spawn a pacemaker for the stream's check list unless one runs already
    pub(crate) fn start_checks(&self, agent: &IceAgent, stream: &Arc<IceMediaStream>) {
        if matches!(agent.state(), IceProcessingState::Terminated | IceProcessingState::Failed) {
            trace!("Not starting checks for {}: agent is {}", stream.name(), agent.state());
            return;
        }

        let mut pacemakers = self.pacemakers.lock();
        if pacemakers.contains_key(stream.name()) {
            return;
        }

        let id = self.next_pacemaker_id.fetch_add(1, Ordering::Relaxed);
        let token = self.token.lock().child_token();
        pacemakers.insert(stream.name().to_string(), (id, token.clone()));
        debug!("Starting pacemaker {} for stream {}", id, stream.name());
        agent.spawn(pacemaker(self.agent.clone(), stream.name().to_string(), id, token));
    }

    /// Number of running pacemakers
    #[cfg(test)]
    pub(crate) fn pacemaker_count(&self) -> usize {
        self.pacemakers.lock().len()
    }

    /// Stop every pacemaker; later `start_checks` calls spawn fresh ones
    pub(crate) fn stop(&self) {
        {
            let mut token = self.token.lock();
            token.cancel();
            *token = self.root.child_token();
        }
        let stopped = {
            let mut pacemakers = self.pacemakers.lock();
            let n = pacemakers.len();
            pacemakers.clear();
            n
        };
        if stopped > 0 {
            debug!("Stopped {} pacemakers", stopped);
        }
    }

    fn pacemaker_exited(&self, stream: &str, id: u64) {
        let mut pacemakers = self.pacemakers.lock();
        if matches!(pacemakers.get(stream), Some((current, _)) if *current == id) {
            pacemakers.remove(stream);
        }
    }

    fn check_pair(&self, agent: &IceAgent, pair: &PairRef) {
        if self
            .start_check_for_pair(agent, pair, agent.check_policy(), CheckKind::Ordinary)
            .is_none()
        {
            info!("Pair failed: {}", pair);
            pair.set_failed();
            self.update_check_list_and_timer_states(agent, pair);
        }
    }

    /// Consent freshness request on a selected pair
    pub(crate) fn start_consent_check(
        &self,
        agent: &IceAgent,
        pair: &PairRef,
        policy: RetransmissionPolicy,
    ) {
        if self.start_check_for_pair(agent, pair, policy, CheckKind::Consent).is_none() {
            debug!("Could not send consent check for {}", pair);
        }
    }

    /// Binding indication keep-alive, sent from the pair's base
    pub(crate) fn send_binding_indication(&self, agent: &IceAgent, pair: &PairRef) {
        let result = agent.service().send_indication(
            Message::binding_indication(),
            pair.remote().address,
            pair.local_base(),
        );
        if let Err(e) = result {
            info!("Failed to send binding indication for {}: {}", pair, e);
        }
    }

    /// Build and send a Binding request for `pair` (RFC 8445 Section 7.2.4).
    ///
    /// Ordinary checks move the pair to IN_PROGRESS before the request
    /// leaves, so a response can never overtake the transition.
    fn start_check_for_pair(
        &self,
        agent: &IceAgent,
        pair: &PairRef,
        policy: RetransmissionPolicy,
        kind: CheckKind,
    ) -> Option<TransactionId> {
        let media = pair.stream();
        let Some(username) = agent.generate_local_user_name(media) else {
            warn!("No remote credentials for stream {}, cannot check {}", media, pair);
            return None;
        };

        let mut request = Message::binding_request();
        request.add(AttributeValue::Priority(pair.local().prflx_priority()));

        if agent.is_controlling() {
            request.add(AttributeValue::IceControlling(agent.tie_breaker()));
            if pair.is_nominated() {
                debug!("Add USE-CANDIDATE in check for {}", pair);
                request.add(AttributeValue::UseCandidate);
                pair.set_use_candidate_sent();
            }
        } else {
            request.add(AttributeValue::IceControlled(agent.tie_breaker()));
        }

        request.add(AttributeValue::Username(username.clone()));
        request.add(AttributeValue::MessageIntegrity {
            username,
            media: Some(media.to_string()),
        });

        let policy = if pair.local().transport().is_reliable() {
            policy.without_retransmissions()
        } else {
            policy
        };

        let transaction_id = request.transaction_id;
        if kind == CheckKind::Ordinary {
            pair.set_in_progress(transaction_id);
        }

        let weak = self.agent.clone();
        let checked = pair.clone();
        let callback = Box::new(move |outcome: TransactionOutcome| {
            if let Some(agent) = weak.upgrade() {
                agent.client().process_outcome(&agent, &checked, kind, transaction_id, outcome);
            }
        });

        debug!("Start {:?} check for {} tid {}", kind, pair, transaction_id);
        match agent.service().send_request(
            request,
            pair.remote().address,
            pair.local_base(),
            policy,
            callback,
        ) {
            Ok(tid) => Some(tid),
            Err(e) => {
                info!("Failed to send check for {}: {}", pair, e);
                None
            }
        }
    }

    fn process_outcome(
        &self,
        agent: &IceAgent,
        pair: &PairRef,
        kind: CheckKind,
        transaction_id: TransactionId,
        outcome: TransactionOutcome,
    ) {
        // The pair moved on from this check. Its success still proves the
        // path, anything else is left to the current state.
        if kind == CheckKind::Ordinary && pair.transaction_id() != Some(transaction_id) {
            let success = matches!(
                &outcome,
                TransactionOutcome::Response(event) if event.response.is_success_response()
            );
            if !success {
                trace!("Ignoring outcome of superseded check {} for {}", transaction_id, pair);
                return;
            }
        }

        match outcome {
            TransactionOutcome::Response(event) => self.process_response(agent, pair, &event),
            TransactionOutcome::Timeout(_) => self.process_timeout(agent, pair, kind),
        }
    }

    /// Handle a response (RFC 8445 Section 7.2.5)
    fn process_response(&self, agent: &IceAgent, pair: &PairRef, event: &StunResponseEvent) {
        let symmetric = event.local_address == pair.local_base()
            && event.remote_address == pair.remote().address;

        if !symmetric {
            info!(
                "Non-symmetric response for {}: {} <- {}, failing",
                pair, event.local_address, event.remote_address
            );
            pair.set_failed();
        } else if event.response.is_error_response() {
            let Some((code, reason)) = event.response.error_code() else {
                debug!("Malformed error response for {}", pair);
                return;
            };
            self.process_error_response(agent, pair, code, reason, &event.request);
        } else if event.response.is_success_response() {
            self.process_success_response(agent, pair, event);
        }

        self.update_check_list_and_timer_states(agent, pair);
    }

    fn process_error_response(
        &self,
        agent: &IceAgent,
        pair: &PairRef,
        code: u16,
        reason: &str,
        request: &Message,
    ) {
        if code == ROLE_CONFLICT {
            let was_controlling = request.ice_controlling().is_some();
            info!("Role conflict on {}, switching to controlling={}", pair, !was_controlling);
            agent.set_controlling(!was_controlling);

            if let Some(stream) = agent.stream(pair.stream()) {
                stream.check_list().schedule_triggered_check(pair);
                self.start_checks(agent, &stream);
            }
        } else {
            info!("Error response for {}: {} {}, failing", pair, code, reason);
            pair.set_failed();
        }
    }

    fn process_success_response(&self, agent: &IceAgent, checked: &PairRef, event: &StunResponseEvent) {
        let Some(mapped) = event.response.xor_mapped_address() else {
            info!("Pair failed (no XOR-MAPPED-ADDRESS): {}", checked);
            checked.set_failed();
            return;
        };

        let Some(stream) = agent.stream(checked.stream()) else {
            return;
        };
        let Some(component) = stream.component(checked.component_id()) else {
            return;
        };

        let mapped = TransportAddress::new(mapped, checked.local().transport());

        let valid_local = match agent.find_local_candidate(&mapped) {
            Some(local) => local,
            None => {
                // The mapped address is a new peer reflexive candidate
                let priority = event
                    .request
                    .priority()
                    .unwrap_or_else(|| checked.local().prflx_priority());
                let prflx = Candidate::peer_reflexive(
                    mapped,
                    checked.local().base,
                    checked.component_id(),
                    priority,
                );
                if component.selected_pair().is_none() {
                    info!("Discovered peer reflexive candidate {}", mapped);
                }
                component.add_local_candidate(prflx.clone());
                component.find_local_candidate(&mapped).unwrap_or(prflx)
            }
        };

        let remote = checked.remote().clone();
        let valid = agent
            .find_candidate_pair(&valid_local.address, &remote.address)
            .unwrap_or_else(|| {
                CandidatePair::new(
                    stream.name(),
                    valid_local,
                    remote,
                    agent.is_controlling(),
                    agent.events().clone(),
                )
            });

        if component.selected_pair().is_none() {
            info!("Pair succeeded: {}", checked);
        }
        checked.set_succeeded();

        if !valid.is_valid() {
            if component.selected_pair().is_none() {
                info!("Pair validated: {}", valid);
            }
            stream.add_to_valid_list(&valid);
        }

        // Frozen pairs of the same foundation become WAITING
        for pair in stream.check_list().pairs() {
            if pair.foundation() == checked.foundation() {
                pair.set_waiting_if(CandidatePairState::Frozen);
            }
        }

        // Other streams: unfreeze pairs whose foundation is now valid here
        for other in agent.streams() {
            if other.name() == stream.name() {
                continue;
            }
            let list = other.check_list();
            let was_frozen = list.is_frozen();

            for pair in list.pairs() {
                if stream.valid_list_contains_foundation(pair.foundation()) {
                    pair.set_waiting_if(CandidatePairState::Frozen);
                }
            }

            if list.is_frozen() {
                list.compute_initial_pair_states();
            }
            if was_frozen {
                info!("Start checks for stream {} that was frozen", other.name());
                self.start_checks(agent, &other);
            }
        }

        let controlling = agent.is_controlling();
        if controlling && event.request.use_candidate() {
            if component.selected_pair().is_none() {
                info!("Nomination confirmed for pair {}", valid);
                agent.nomination_confirmed(&valid);
            } else {
                trace!("Keep-alive for pair {}", valid);
            }
        } else if !controlling && checked.use_candidate_received() && !checked.is_nominated() {
            if component.selected_pair().is_none() {
                info!("Nomination confirmed for pair {}", checked);
                agent.nomination_confirmed(checked);
            } else {
                trace!("Keep-alive for pair {}", valid);
            }
        }

        if let Some(selected) = component.selected_pair() {
            if Arc::ptr_eq(&selected, checked) {
                checked.set_consent_freshness(Instant::now());
            }
        }
    }

    fn process_timeout(&self, agent: &IceAgent, pair: &PairRef, kind: CheckKind) {
        info!("Timeout for pair {}, failing", pair);
        pair.set_failed();

        if kind == CheckKind::Consent {
            warn!("Consent lost for {}", pair);
            agent.events().emit(IceEvent::ConsentLost { pair: pair.clone() });
        }

        self.update_check_list_and_timer_states(agent, pair);
    }

    /// Check list and timer state updates (RFC 8445 Section 7.2.5.4)
    fn update_check_list_and_timer_states(&self, agent: &IceAgent, pair: &PairRef) {
        if agent.state() == IceProcessingState::Completed {
            return;
        }
        let Some(stream) = agent.stream(pair.stream()) else {
            return;
        };

        if stream.check_list().all_checks_completed() {
            if !stream.valid_list_contains_all_components() {
                self.arm_failure_timer(agent, &stream);
            }

            for other in agent.streams() {
                if other.name() == stream.name() {
                    continue;
                }
                if other.check_list().is_frozen() {
                    other.check_list().compute_initial_pair_states();
                    self.start_checks(agent, &other);
                }
            }
        }

        agent.check_list_states_updated();
    }

    /// Fail the list after a grace period unless it completes meanwhile
    fn arm_failure_timer(&self, agent: &IceAgent, stream: &IceMediaStream) {
        if agent.is_over() {
            return;
        }
        let name = stream.name().to_string();
        if !self.failure_timers.lock().insert(name.clone()) {
            return;
        }

        let grace = agent.config().check_list_failure_grace;
        info!("Check list of stream {} fails in {:?} unless a check succeeds", name, grace);

        let weak = self.agent.clone();
        let token = self.root.clone();
        agent.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    let Some(agent) = weak.upgrade() else {
                        return;
                    };
                    if agent.is_over() {
                        return;
                    }
                    let Some(stream) = agent.stream(&name) else {
                        return;
                    };
                    if stream.check_list().state() != CheckListState::Completed {
                        info!("Check list for stream {} FAILED", name);
                        stream.check_list().set_state(CheckListState::Failed);
                        agent.check_list_states_updated();
                    }
                }
            }
        });
    }
}

async fn pacemaker(agent: Weak<IceAgent>, stream: String, id: u64, token: CancellationToken) {
    let mut idle = false;

    loop {
        let wait = match agent.upgrade() {
            Some(agent) => agent.calculate_ta(),
            None => break,
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let Some(agent) = agent.upgrade() else {
            break;
        };
        let Some(media) = agent.stream(&stream) else {
            break;
        };

        let list = media.check_list();
        let next = list
            .pop_triggered_check()
            .or_else(|| list.next_ordinary_pair_to_check());

        match next {
            Some(pair) => {
                idle = false;
                agent.client().check_pair(&agent, &pair);
            }
            None if !idle => {
                idle = true;
                trace!("No more ordinary checks for stream {}", stream);
                list.fire_end_of_ordinary_checks();
            }
            None => {}
        }
    }

    if let Some(agent) = agent.upgrade() {
        agent.client().pacemaker_exited(&stream, id);
    }
    debug!("Pacemaker {} for stream {} exits", id, stream);
}
