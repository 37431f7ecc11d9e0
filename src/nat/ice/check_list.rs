// src/nat/ice/check_list.rs
//! ICE check list management (RFC 8445 Section 6.1.2)
//!
//! A check list holds one stream's candidate pairs in descending priority
//! order, plus the FIFO queue of triggered checks. Membership is serialized
//! by one mutex; pair state has its own lock, always taken after the list's.
//! Events are emitted only after the list lock is released.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::candidate::CandidateType;
use super::pair::{CandidatePairState, PairRef};
use super::states::{CheckListState, EventBus, IceEvent};
use super::stream::Component;
use crate::nat::transport::TransportAddress;

#[derive(Debug)]
struct CheckListInner {
    /// Invariant: sorted in descending priority order
    pairs: Vec<PairRef>,
    triggered: VecDeque<PairRef>,
    state: CheckListState,
}

/// Check list of one media stream
#[derive(Debug)]
pub struct CheckList {
    stream: String,
    inner: Mutex<CheckListInner>,
    events: Arc<EventBus>,
}

impl CheckList {
    /// Create an empty RUNNING check list
    pub fn new(stream: impl Into<String>, events: Arc<EventBus>) -> Self {
        Self {
            stream: stream.into(),
            inner: Mutex::new(CheckListInner {
                pairs: Vec::new(),
                triggered: VecDeque::new(),
                state: CheckListState::Running,
            }),
            events,
        }
    }

    /// Name of the owning stream
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Current state
    pub fn state(&self) -> CheckListState {
        self.inner.lock().state
    }

    /// Change state, emitting an event if it actually changed
    pub fn set_state(&self, new: CheckListState) {
        let old = std::mem::replace(&mut self.inner.lock().state, new);
        if old != new {
            info!("Check list for stream {} {:?} -> {:?}", self.stream, old, new);
            self.events.emit(IceEvent::CheckListStateChanged {
                stream: self.stream.clone(),
                old,
                new,
            });
        }
    }

    /// Snapshot of the pairs, highest priority first
    pub fn pairs(&self) -> Vec<PairRef> {
        self.inner.lock().pairs.clone()
    }

    /// Number of pairs
    pub fn len(&self) -> usize {
        self.inner.lock().pairs.len()
    }

    /// Whether the list holds no pairs
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued triggered checks
    pub fn triggered_len(&self) -> usize {
        self.inner.lock().triggered.len()
    }

    /// Pair joining these addresses
    pub fn find(&self, local: &TransportAddress, remote: &TransportAddress) -> Option<PairRef> {
        self.inner
            .lock()
            .pairs
            .iter()
            .find(|p| p.same_addresses(local, remote))
            .cloned()
    }

    /// Insert a pair at its priority position
    pub fn add(&self, pair: PairRef) {
        let priority = pair.priority();
        let mut inner = self.inner.lock();
        let pos = inner
            .pairs
            .iter()
            .position(|p| p.priority() < priority)
            .unwrap_or(inner.pairs.len());
        trace!("Adding pair {} to check list {} at {}", pair, self.stream, pos);
        inner.pairs.insert(pos, pair);
    }

    /// Replace every pair and drop queued triggered checks
    pub fn replace_all(&self, pairs: Vec<PairRef>) {
        let mut inner = self.inner.lock();
        inner.pairs = pairs;
        inner.triggered.clear();
    }

    /// Remove every pair and queued check
    pub fn clear(&self) {
        self.replace_all(Vec::new());
    }

    /// Queue a triggered check and make the pair WAITING (RFC 8445 Section 7.3.1.4)
    pub fn schedule_triggered_check(&self, pair: &PairRef) {
        {
            let mut inner = self.inner.lock();
            if !inner.triggered.iter().any(|p| Arc::ptr_eq(p, pair)) {
                inner.triggered.push_back(pair.clone());
            }
        }
        pair.set_waiting();
    }

    /// Oldest queued triggered check
    pub fn pop_triggered_check(&self) -> Option<PairRef> {
        self.inner.lock().triggered.pop_front()
    }

    /// Highest priority WAITING pair, or failing that the highest priority
    /// FROZEN pair, which becomes WAITING
    pub fn next_ordinary_pair_to_check(&self) -> Option<PairRef> {
        let (pair, unfreeze) = {
            let inner = self.inner.lock();
            if let Some(waiting) = inner
                .pairs
                .iter()
                .find(|p| p.state() == CandidatePairState::Waiting)
            {
                (Some(waiting.clone()), false)
            } else {
                let frozen = inner
                    .pairs
                    .iter()
                    .find(|p| p.state() == CandidatePairState::Frozen)
                    .cloned();
                (frozen, true)
            }
        };

        match pair {
            // Another path may have started a check since the scan
            Some(pair) if unfreeze => pair
                .set_waiting_if(CandidatePairState::Frozen)
                .then_some(pair),
            other => other,
        }
    }

    /// Whether any pair is WAITING
    pub fn is_active(&self) -> bool {
        self.inner
            .lock()
            .pairs
            .iter()
            .any(|p| p.state() == CandidatePairState::Waiting)
    }

    /// Whether every pair is SUCCEEDED or FAILED
    pub fn all_checks_completed(&self) -> bool {
        self.inner.lock().pairs.iter().all(|p| p.state().is_terminal())
    }

    /// Whether every pair is FROZEN
    pub fn is_frozen(&self) -> bool {
        self.inner
            .lock()
            .pairs
            .iter()
            .all(|p| p.state() == CandidatePairState::Frozen)
    }

    /// Seed the frozen algorithm (RFC 8445 Section 6.1.2.6): for every
    /// foundation, the pair with the lowest component ID, ties broken by
    /// higher priority, becomes WAITING.
    pub fn compute_initial_pair_states(&self) {
        let pairs = self.pairs();
        let mut winners: HashMap<&str, &PairRef> = HashMap::new();
        let mut order: Vec<&str> = Vec::new();

        for pair in &pairs {
            match winners.get(pair.foundation()) {
                None => {
                    order.push(pair.foundation());
                    winners.insert(pair.foundation(), pair);
                }
                Some(current) => {
                    let replace = if current.component_id() == pair.component_id() {
                        pair.priority() > current.priority()
                    } else {
                        pair.component_id() < current.component_id()
                    };
                    if replace {
                        winners.insert(pair.foundation(), pair);
                    }
                }
            }
        }

        for foundation in order {
            if let Some(pair) = winners.get(foundation) {
                debug!("Initial WAITING pair for foundation {}: {}", foundation, pair);
                pair.set_waiting_if(CandidatePairState::Frozen);
            }
        }
    }

    /// Recompute priorities after a role change and restore ordering
    pub fn recompute_pair_priorities(&self, controlling: bool) {
        let mut inner = self.inner.lock();
        for pair in &inner.pairs {
            pair.compute_priority(controlling);
        }
        inner.pairs.sort_by_key(|p| std::cmp::Reverse(p.priority()));
    }

    /// Apply a confirmed nomination (RFC 8445 Section 8.1.2).
    ///
    /// The first nominated pair of a component becomes its selected pair;
    /// pairs of that component that are FROZEN or WAITING, or IN_PROGRESS
    /// with lower priority, are removed from the list and the triggered queue.
    pub fn handle_nomination_confirmed(&self, nominated: &PairRef, component: &Component) {
        if component.selected_pair().is_some() {
            return;
        }

        info!("Selected pair for stream {} component {}: {}", self.stream, component.id(), nominated);
        component.set_selected_pair(nominated.clone());

        let component_id = component.id();
        let nominated_priority = nominated.priority();
        let obsolete = |p: &PairRef| {
            if p.component_id() != component_id || Arc::ptr_eq(p, nominated) {
                return false;
            }
            match p.state() {
                CandidatePairState::Frozen | CandidatePairState::Waiting => true,
                CandidatePairState::InProgress => p.priority() < nominated_priority,
                _ => false,
            }
        };

        let mut inner = self.inner.lock();
        let before = inner.pairs.len();
        inner.pairs.retain(|p| !obsolete(p));
        inner.triggered.retain(|p| !obsolete(p));
        debug!(
            "Removed {} pairs of component {} after nomination",
            before - inner.pairs.len(),
            component_id
        );
    }

    /// Report that the pacemaker found nothing left to check
    pub fn fire_end_of_ordinary_checks(&self) {
        self.events.emit(IceEvent::EndOfOrdinaryChecks { stream: self.stream.clone() });
    }
}

/// Order and prune a freshly formed check list (RFC 8445 Section 6.1.2.4).
///
/// Pairs are sorted by descending priority. A pair whose local candidate is
/// server reflexive is replaced by `rebase`, which returns the same pair
/// built on the candidate's base; the result is dropped if an equal pair is
/// already kept. At most `max` pairs survive.
pub fn prune_and_order<F>(pairs: Vec<PairRef>, max: usize, rebase: F) -> Vec<PairRef>
where
    F: Fn(&PairRef) -> Option<PairRef>,
{
    let mut sorted = pairs;
    sorted.sort_by_key(|p| std::cmp::Reverse(p.priority()));

    let mut kept: Vec<PairRef> = Vec::with_capacity(sorted.len());
    for pair in sorted {
        let pair = if pair.local().candidate_type() == CandidateType::ServerReflexive {
            rebase(&pair).unwrap_or(pair)
        } else {
            pair
        };

        if kept.iter().any(|k| **k == *pair) {
            trace!("Pruning redundant pair {}", pair);
            continue;
        }
        kept.push(pair);
    }

    kept.sort_by_key(|p| std::cmp::Reverse(p.priority()));
    if kept.len() > max {
        debug!("Limiting check list from {} to {} pairs", kept.len(), max);
        kept.truncate(max);
    }
    kept
}
