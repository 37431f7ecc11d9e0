// src/nat/ice/pair.rs
//! Candidate pairs and their state machine (RFC 8445 Section 6.1.2.6)
//!
//! A pair's identity is its (local, remote) address tuple; everything else
//! is mutable state behind one mutex. Pairs are shared as [`PairRef`]s
//! between the check list, the valid list, triggered-check queue and
//! in-flight transactions.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::candidate::Candidate;
use super::foundation::calculate_pair_foundation;
use super::priority::calculate_pair_priority;
use super::states::{EventBus, IceEvent};
use crate::nat::stun::protocol::TransactionId;
use crate::nat::transport::TransportAddress;

/// Shared handle to a candidate pair
pub type PairRef = Arc<CandidatePair>;

/// Candidate pair state (RFC 8445 Section 6.1.2.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidatePairState {
    /// Waiting for a pair with the same foundation to succeed
    Frozen,
    /// Ready to be checked
    Waiting,
    /// A check is in flight
    InProgress,
    /// A check produced a successful, symmetric response
    Succeeded,
    /// A check failed or timed out
    Failed,
}

impl CandidatePairState {
    /// Succeeded or failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, CandidatePairState::Succeeded | CandidatePairState::Failed)
    }
}

impl fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidatePairState::Frozen => "Frozen",
            CandidatePairState::Waiting => "Waiting",
            CandidatePairState::InProgress => "In-Progress",
            CandidatePairState::Succeeded => "Succeeded",
            CandidatePairState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct PairInner {
    priority: u64,
    state: CandidatePairState,
    /// Present exactly while the pair is IN_PROGRESS
    transaction: Option<TransactionId>,
    nominated: bool,
    use_candidate_received: bool,
    use_candidate_sent: bool,
    valid: bool,
    consent_freshness: Option<Instant>,
}

/// A local and a remote candidate checked together
pub struct CandidatePair {
    me: Weak<CandidatePair>,
    stream: String,
    local: Candidate,
    remote: Candidate,
    foundation: String,
    inner: Mutex<PairInner>,
    events: Arc<EventBus>,
}

impl CandidatePair {
    /// Create a FROZEN pair whose priority reflects the given role
    pub fn new(
        stream: impl Into<String>,
        local: Candidate,
        remote: Candidate,
        controlling: bool,
        events: Arc<EventBus>,
    ) -> PairRef {
        let foundation = calculate_pair_foundation(&local.foundation, &remote.foundation);
        let priority = calculate_pair_priority(controlling, local.priority, remote.priority);

        Arc::new_cyclic(|me| CandidatePair {
            me: me.clone(),
            stream: stream.into(),
            local,
            remote,
            foundation,
            inner: Mutex::new(PairInner {
                priority,
                state: CandidatePairState::Frozen,
                transaction: None,
                nominated: false,
                use_candidate_received: false,
                use_candidate_sent: false,
                valid: false,
                consent_freshness: None,
            }),
            events,
        })
    }

    fn handle(&self) -> Option<PairRef> {
        self.me.upgrade()
    }

    fn emit(&self, make: impl FnOnce(PairRef) -> IceEvent) {
        if let Some(me) = self.handle() {
            self.events.emit(make(me));
        }
    }

    /// Name of the stream the pair belongs to
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Local candidate
    pub fn local(&self) -> &Candidate {
        &self.local
    }

    /// Remote candidate
    pub fn remote(&self) -> &Candidate {
        &self.remote
    }

    /// Component the pair belongs to
    pub fn component_id(&self) -> u32 {
        self.local.component_id
    }

    /// Pair foundation
    pub fn foundation(&self) -> &str {
        &self.foundation
    }

    /// Address checks for this pair are sent from
    pub fn local_base(&self) -> TransportAddress {
        self.local.base
    }

    /// Whether either candidate is relayed
    pub fn is_relayed(&self) -> bool {
        self.local.is_relayed() || self.remote.is_relayed()
    }

    /// Current pair priority
    pub fn priority(&self) -> u64 {
        self.inner.lock().priority
    }

    /// Recompute the priority after a role change
    pub fn compute_priority(&self, controlling: bool) {
        let priority = calculate_pair_priority(controlling, self.local.priority, self.remote.priority);
        self.inner.lock().priority = priority;
    }

    /// Current state
    pub fn state(&self) -> CandidatePairState {
        self.inner.lock().state
    }

    /// Outstanding transaction, present only while IN_PROGRESS
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.inner.lock().transaction
    }

    fn transition(&self, new: CandidatePairState, transaction: Option<TransactionId>) {
        self.transition_from(None, new, transaction);
    }

    /// Apply a transition, only from `expected` when given. The check and
    /// the update happen under the pair lock.
    fn transition_from(
        &self,
        expected: Option<CandidatePairState>,
        new: CandidatePairState,
        transaction: Option<TransactionId>,
    ) -> bool {
        let old = {
            let mut inner = self.inner.lock();
            let old = inner.state;
            if expected.map_or(false, |e| e != old) {
                return false;
            }
            inner.state = new;
            inner.transaction = transaction;
            old
        };

        if old != new {
            debug!("Pair {} state {} -> {}", self, old, new);
            self.emit(|pair| IceEvent::PairStateChanged { pair, old, new });
        }
        true
    }

    /// Move to FROZEN
    pub fn set_frozen(&self) {
        self.transition(CandidatePairState::Frozen, None);
    }

    /// Move to WAITING
    pub fn set_waiting(&self) {
        self.transition(CandidatePairState::Waiting, None);
    }

    /// Move to WAITING if the pair is still in state `from`
    pub fn set_waiting_if(&self, from: CandidatePairState) -> bool {
        self.transition_from(Some(from), CandidatePairState::Waiting, None)
    }

    /// Move to IN_PROGRESS with the transaction carrying the check
    pub fn set_in_progress(&self, transaction: TransactionId) {
        self.transition(CandidatePairState::InProgress, Some(transaction));
    }

    /// Move to SUCCEEDED
    pub fn set_succeeded(&self) {
        self.transition(CandidatePairState::Succeeded, None);
    }

    /// Move to FAILED
    pub fn set_failed(&self) {
        self.transition(CandidatePairState::Failed, None);
    }

    /// Whether the pair is nominated
    pub fn is_nominated(&self) -> bool {
        self.inner.lock().nominated
    }

    /// Mark the pair nominated; never reverted
    pub fn nominate(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            !std::mem::replace(&mut inner.nominated, true)
        };

        if changed {
            debug!("Pair {} nominated", self);
            self.emit(|pair| IceEvent::PairNominated { pair });
        }
    }

    /// Whether the pair is in its stream's valid list
    pub fn is_valid(&self) -> bool {
        self.inner.lock().valid
    }

    /// Mark the pair valid
    pub fn validate(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            !std::mem::replace(&mut inner.valid, true)
        };

        if changed {
            debug!("Pair {} validated", self);
            self.emit(|pair| IceEvent::PairValidated { pair });
        }
    }

    /// Whether the peer sent USE-CANDIDATE for this pair
    pub fn use_candidate_received(&self) -> bool {
        self.inner.lock().use_candidate_received
    }

    /// Record that the peer sent USE-CANDIDATE
    pub fn set_use_candidate_received(&self) {
        self.inner.lock().use_candidate_received = true;
    }

    /// Whether we sent USE-CANDIDATE for this pair
    pub fn use_candidate_sent(&self) -> bool {
        self.inner.lock().use_candidate_sent
    }

    /// Record that we sent USE-CANDIDATE
    pub fn set_use_candidate_sent(&self) {
        self.inner.lock().use_candidate_sent = true;
    }

    /// Last time consent was confirmed; `None` when unknown
    pub fn consent_freshness(&self) -> Option<Instant> {
        self.inner.lock().consent_freshness
    }

    /// Record a consent confirmation
    pub fn set_consent_freshness(&self, at: Instant) {
        let old = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut inner.consent_freshness, Some(at))
        };

        if old != Some(at) {
            trace!("Pair {} consent refreshed", self);
            self.emit(|pair| IceEvent::ConsentFreshnessChanged { pair, old, new: Some(at) });
        }
    }

    /// Whether two pairs join the same addresses
    pub fn same_addresses(&self, local: &TransportAddress, remote: &TransportAddress) -> bool {
        self.local.address == *local && self.remote.address == *remote
    }
}

impl PartialEq for CandidatePair {
    fn eq(&self, other: &Self) -> bool {
        self.local.address == other.local.address && self.remote.address == other.remote.address
    }
}

impl Eq for CandidatePair {}

impl Hash for CandidatePair {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.local.address.hash(state);
        self.remote.address.hash(state);
    }
}

impl fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.local.address, self.remote.address, self.foundation)
    }
}

impl fmt::Debug for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CandidatePair")
            .field("stream", &self.stream)
            .field("local", &self.local.address)
            .field("remote", &self.remote.address)
            .field("foundation", &self.foundation)
            .field("priority", &inner.priority)
            .field("state", &inner.state)
            .field("nominated", &inner.nominated)
            .field("valid", &inner.valid)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::nat::ice::candidate::CandidateKind;
    use parking_lot::Mutex as PlMutex;

    pub(crate) fn local(addr: &str, component: u32, foundation: &str, priority: u32) -> Candidate {
        let mut c = Candidate::host(TransportAddress::udp(addr.parse().unwrap()), component);
        c.foundation = foundation.into();
        c.priority = priority;
        c
    }

    pub(crate) fn remote(addr: &str, component: u32, foundation: &str, priority: u32) -> Candidate {
        Candidate::remote(
            TransportAddress::udp(addr.parse().unwrap()),
            CandidateKind::Host,
            component,
            foundation,
            priority,
        )
    }

    fn pair(bus: &Arc<EventBus>) -> PairRef {
        CandidatePair::new(
            "audio",
            local("192.168.1.10:5000", 1, "1", 2_130_706_431),
            remote("192.168.1.20:6000", 1, "7", 2_130_706_175),
            true,
            bus.clone(),
        )
    }

    #[test]
    fn test_new_pair_is_frozen() {
        let bus = Arc::new(EventBus::new());
        let p = pair(&bus);
        assert_eq!(p.state(), CandidatePairState::Frozen);
        assert_eq!(p.foundation(), "1:7");
        assert_eq!(p.transaction_id(), None);
        assert!(!p.is_nominated());
        assert!(!p.is_valid());
        assert_eq!(p.consent_freshness(), None);
    }

    #[test]
    fn test_transaction_only_while_in_progress() {
        let bus = Arc::new(EventBus::new());
        let p = pair(&bus);
        let tid = TransactionId::new();
        p.set_in_progress(tid);
        assert_eq!(p.transaction_id(), Some(tid));
        p.set_succeeded();
        assert_eq!(p.transaction_id(), None);
        assert!(p.state().is_terminal());
    }

    #[test]
    fn test_unfreeze_keeps_in_flight_check() {
        let bus = Arc::new(EventBus::new());
        let p = pair(&bus);
        let tid = TransactionId::new();

        // Another path started a check after the pair was picked as frozen
        p.set_in_progress(tid);
        assert!(!p.set_waiting_if(CandidatePairState::Frozen));
        assert_eq!(p.state(), CandidatePairState::InProgress);
        assert_eq!(p.transaction_id(), Some(tid));

        let q = pair(&bus);
        assert!(q.set_waiting_if(CandidatePairState::Frozen));
        assert_eq!(q.state(), CandidatePairState::Waiting);
    }

    #[test]
    fn test_events_fire_on_change_only() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe(Arc::new(move |event| {
            let name = match event {
                IceEvent::PairStateChanged { new, .. } => format!("state:{}", new),
                IceEvent::PairNominated { .. } => "nominated".to_string(),
                IceEvent::PairValidated { .. } => "validated".to_string(),
                IceEvent::ConsentFreshnessChanged { .. } => "consent".to_string(),
                _ => "other".to_string(),
            };
            s.lock().push(name);
        }));

        let p = pair(&bus);
        p.set_waiting();
        p.set_waiting();
        p.validate();
        p.validate();
        p.nominate();
        p.nominate();
        p.set_consent_freshness(Instant::now());

        assert_eq!(
            *seen.lock(),
            vec!["state:Waiting", "validated", "nominated", "consent"]
        );
    }

    #[test]
    fn test_equality_ignores_state() {
        let bus = Arc::new(EventBus::new());
        let a = pair(&bus);
        let b = CandidatePair::new(
            "audio",
            local("192.168.1.10:5000", 1, "9", 1),
            remote("192.168.1.20:6000", 1, "9", 2),
            false,
            bus.clone(),
        );
        a.set_failed();
        b.nominate();
        assert_eq!(*a, *b);
        assert_ne!(a.priority(), b.priority());
    }

    #[test]
    fn test_role_change_recomputes_priority() {
        let bus = Arc::new(EventBus::new());
        let p = pair(&bus);
        let controlling = p.priority();
        p.compute_priority(false);
        assert_eq!(p.priority(), controlling - 1);
    }
}
