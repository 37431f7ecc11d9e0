// src/nat/ice/stream.rs
//! ICE media streams and their components
//!
//! A stream owns its components by id, one check list and one valid list.
//! Candidates and pairs refer back to their component and stream by id and
//! name only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use super::candidate::{Candidate, CandidateType};
use super::check_list::{prune_and_order, CheckList};
use super::config::DEFAULT_MAX_CHECK_LIST_SIZE;
use super::foundation::FoundationsRegistry;
use super::pair::{CandidatePair, PairRef};
use super::priority::local_preference;
use super::states::EventBus;
use crate::nat::transport::{TransportAddress, TransportProtocol};

/// Component ID of RTP
pub const RTP_COMPONENT_ID: u32 = 1;

/// Component ID of RTCP
pub const RTCP_COMPONENT_ID: u32 = 2;

#[derive(Debug, Default)]
struct ComponentInner {
    /// Sorted by descending priority
    local: Vec<Candidate>,
    remote: Vec<Candidate>,
    selected: Option<PairRef>,
}

/// One transport flow of a stream
#[derive(Debug)]
pub struct Component {
    id: u32,
    stream: String,
    transport: TransportProtocol,
    registry: Arc<FoundationsRegistry>,
    inner: RwLock<ComponentInner>,
}

impl Component {
    /// Create an empty component
    pub fn new(
        id: u32,
        stream: impl Into<String>,
        transport: TransportProtocol,
        registry: Arc<FoundationsRegistry>,
    ) -> Self {
        Self {
            id,
            stream: stream.into(),
            transport,
            registry,
            inner: RwLock::new(ComponentInner::default()),
        }
    }

    /// Component ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Name of the owning stream
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Transport of the component
    pub fn transport(&self) -> TransportProtocol {
        self.transport
    }

    /// Add a harvested local candidate.
    ///
    /// The candidate receives its foundation and (unless it is a peer
    /// reflexive candidate that already carries one) its priority. Returns
    /// `false` if a redundant candidate is already present.
    pub fn add_local_candidate(&self, mut candidate: Candidate) -> bool {
        candidate.component_id = self.id;
        candidate.foundation = self.registry.assign(
            candidate.candidate_type(),
            candidate.base.ip(),
            candidate.server_address(),
            candidate.transport(),
        );

        let mut inner = self.inner.write();

        if inner.local.iter().any(|c| c.is_redundant_with(&candidate)) {
            debug!("Ignoring redundant local candidate {}", candidate);
            return false;
        }

        let keeps_priority =
            candidate.candidate_type() == CandidateType::PeerReflexive && candidate.priority != 0;
        if !keeps_priority {
            let hosts = inner
                .local
                .iter()
                .filter(|c| c.candidate_type() == CandidateType::Host)
                .count()
                + usize::from(candidate.candidate_type() == CandidateType::Host);
            let pref = local_preference(&candidate.address.ip(), candidate.is_virtual, hosts);
            candidate.compute_priority(pref);
        }

        trace!("Stream {} component {} adds local {}", self.stream, self.id, candidate);
        let pos = inner
            .local
            .iter()
            .position(|c| c.priority < candidate.priority)
            .unwrap_or(inner.local.len());
        inner.local.insert(pos, candidate);
        true
    }

    /// Add a remote candidate signalled by the peer
    pub fn add_remote_candidate(&self, mut candidate: Candidate) {
        candidate.component_id = self.id;
        self.inner.write().remote.push(candidate);
    }

    /// Local candidates, highest priority first
    pub fn local_candidates(&self) -> Vec<Candidate> {
        self.inner.read().local.clone()
    }

    /// Remote candidates
    pub fn remote_candidates(&self) -> Vec<Candidate> {
        self.inner.read().remote.clone()
    }

    /// Number of local candidates
    pub fn local_candidate_count(&self) -> usize {
        self.inner.read().local.len()
    }

    /// Number of remote candidates
    pub fn remote_candidate_count(&self) -> usize {
        self.inner.read().remote.len()
    }

    /// Number of local host candidates
    pub fn count_local_host_candidates(&self) -> usize {
        self.inner
            .read()
            .local
            .iter()
            .filter(|c| c.candidate_type() == CandidateType::Host)
            .count()
    }

    /// Local candidate with this transport address
    pub fn find_local_candidate(&self, address: &TransportAddress) -> Option<Candidate> {
        self.inner.read().local.iter().find(|c| c.address == *address).cloned()
    }

    /// Remote candidate with this transport address
    pub fn find_remote_candidate(&self, address: &TransportAddress) -> Option<Candidate> {
        self.inner.read().remote.iter().find(|c| c.address == *address).cloned()
    }

    /// Local candidate to advertise as the default destination
    pub fn default_candidate(&self) -> Option<Candidate> {
        self.inner
            .read()
            .local
            .iter()
            .max_by_key(|c| c.default_preference())
            .cloned()
    }

    /// Pair selected by nomination
    pub fn selected_pair(&self) -> Option<PairRef> {
        self.inner.read().selected.clone()
    }

    /// Set the selected pair
    pub fn set_selected_pair(&self, pair: PairRef) {
        self.inner.write().selected = Some(pair);
    }

    /// Drop candidates and selection
    pub fn free(&self) {
        let mut inner = self.inner.write();
        debug!(
            "Freeing component {} of stream {} ({} local candidates)",
            self.id,
            self.stream,
            inner.local.len()
        );
        inner.local.clear();
        inner.remote.clear();
        inner.selected = None;
    }
}

#[derive(Debug, Default)]
struct RemoteCredentials {
    ufrag: Option<String>,
    password: Option<String>,
}

/// Named group of components checked together
#[derive(Debug)]
pub struct IceMediaStream {
    name: String,
    /// Ordered by creation, ids ascending
    components: RwLock<Vec<Arc<Component>>>,
    last_component_id: Mutex<u32>,
    check_list: CheckList,
    /// Sorted by descending priority
    valid_list: Mutex<Vec<PairRef>>,
    credentials: RwLock<RemoteCredentials>,
    max_check_list_size: AtomicUsize,
    events: Arc<EventBus>,
    registry: Arc<FoundationsRegistry>,
}

impl IceMediaStream {
    /// Create an empty stream
    pub fn new(
        name: impl Into<String>,
        events: Arc<EventBus>,
        registry: Arc<FoundationsRegistry>,
    ) -> Self {
        let name = name.into();
        Self {
            check_list: CheckList::new(name.clone(), events.clone()),
            name,
            components: RwLock::new(Vec::new()),
            last_component_id: Mutex::new(0),
            valid_list: Mutex::new(Vec::new()),
            credentials: RwLock::new(RemoteCredentials::default()),
            max_check_list_size: AtomicUsize::new(DEFAULT_MAX_CHECK_LIST_SIZE),
            events,
            registry,
        }
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the next component (ids start at 1)
    pub fn create_component(&self, transport: TransportProtocol) -> Arc<Component> {
        let id = {
            let mut last = self.last_component_id.lock();
            *last += 1;
            *last
        };
        let component = Arc::new(Component::new(id, self.name.clone(), transport, self.registry.clone()));
        self.components.write().push(component.clone());
        debug!("Stream {} created component {}", self.name, id);
        component
    }

    /// Component by id
    pub fn component(&self, id: u32) -> Option<Arc<Component>> {
        self.components.read().iter().find(|c| c.id() == id).cloned()
    }

    /// All components in creation order
    pub fn components(&self) -> Vec<Arc<Component>> {
        self.components.read().clone()
    }

    /// Number of components
    pub fn component_count(&self) -> usize {
        self.components.read().len()
    }

    /// Remove and free a component
    pub fn remove_component(&self, id: u32) -> Option<Arc<Component>> {
        let removed = {
            let mut components = self.components.write();
            let pos = components.iter().position(|c| c.id() == id)?;
            components.remove(pos)
        };
        removed.free();
        Some(removed)
    }

    /// The stream's check list
    pub fn check_list(&self) -> &CheckList {
        &self.check_list
    }

    /// Set the peer's credentials for this stream
    pub fn set_remote_credentials(&self, ufrag: impl Into<String>, password: impl Into<String>) {
        let mut credentials = self.credentials.write();
        credentials.ufrag = Some(ufrag.into());
        credentials.password = Some(password.into());
    }

    /// Peer ufrag
    pub fn remote_ufrag(&self) -> Option<String> {
        self.credentials.read().ufrag.clone()
    }

    /// Peer password
    pub fn remote_password(&self) -> Option<String> {
        self.credentials.read().password.clone()
    }

    /// Limit of pairs kept in this stream's check list
    pub fn set_max_check_list_size(&self, max: usize) {
        self.max_check_list_size.store(max, Ordering::Relaxed);
    }

    /// Current pair limit
    pub fn max_check_list_size(&self) -> usize {
        self.max_check_list_size.load(Ordering::Relaxed)
    }

    /// Form, order and prune the check list (RFC 8445 Section 6.1.2).
    ///
    /// Every local candidate is paired with every remote candidate of the
    /// same component that it can reach and whose port is known.
    pub fn init_check_list(&self, controlling: bool) {
        self.check_list.clear();

        let components = self.components();
        let mut pairs = Vec::new();
        for component in &components {
            let remotes = component.remote_candidates();
            for local in component.local_candidates() {
                for remote in &remotes {
                    if remote.address.port() == 0 || !local.can_reach(remote) {
                        continue;
                    }
                    pairs.push(CandidatePair::new(
                        self.name.clone(),
                        local.clone(),
                        remote.clone(),
                        controlling,
                        self.events.clone(),
                    ));
                }
            }
        }

        let formed = pairs.len();
        let rebase = |pair: &PairRef| {
            let component = components.iter().find(|c| c.id() == pair.component_id())?;
            let base = component.find_local_candidate(&pair.local().base)?;
            Some(CandidatePair::new(
                self.name.clone(),
                base,
                pair.remote().clone(),
                controlling,
                self.events.clone(),
            ))
        };
        let pruned = prune_and_order(pairs, self.max_check_list_size(), rebase);

        info!(
            "Check list for stream {}: {} pairs formed, {} kept",
            self.name,
            formed,
            pruned.len()
        );
        self.check_list.replace_all(pruned);
    }

    /// Add a pair to the check list
    pub fn add_to_check_list(&self, pair: PairRef) {
        self.check_list.add(pair);
    }

    /// Pair joining these addresses, from the check list or the valid list
    pub fn find_candidate_pair(
        &self,
        local: &TransportAddress,
        remote: &TransportAddress,
    ) -> Option<PairRef> {
        self.check_list.find(local, remote).or_else(|| {
            self.valid_list
                .lock()
                .iter()
                .find(|p| p.same_addresses(local, remote))
                .cloned()
        })
    }

    /// Add a pair to the valid list and mark it valid
    pub fn add_to_valid_list(&self, pair: &PairRef) {
        {
            let mut valid = self.valid_list.lock();
            if !valid.iter().any(|p| **p == **pair) {
                let priority = pair.priority();
                let pos = valid
                    .iter()
                    .position(|p| p.priority() < priority)
                    .unwrap_or(valid.len());
                valid.insert(pos, pair.clone());
            }
        }
        pair.validate();
    }

    /// Snapshot of the valid list, highest priority first
    pub fn valid_list(&self) -> Vec<PairRef> {
        self.valid_list.lock().clone()
    }

    /// Whether a valid pair has this foundation
    pub fn valid_list_contains_foundation(&self, foundation: &str) -> bool {
        self.valid_list.lock().iter().any(|p| p.foundation() == foundation)
    }

    /// Whether a nominated valid pair exists for the component
    pub fn valid_list_contains_nominee_for_component(&self, component_id: u32) -> bool {
        self.valid_list
            .lock()
            .iter()
            .any(|p| p.component_id() == component_id && p.is_nominated())
    }

    /// Highest priority valid pair of the component
    pub fn valid_pair(&self, component_id: u32) -> Option<PairRef> {
        self.valid_list
            .lock()
            .iter()
            .find(|p| p.component_id() == component_id)
            .cloned()
    }

    /// Whether every component has a valid pair
    pub fn valid_list_contains_all_components(&self) -> bool {
        self.components()
            .iter()
            .all(|c| self.valid_pair(c.id()).is_some())
    }

    /// Whether every component has a nominated valid pair
    pub fn all_components_are_nominated(&self) -> bool {
        self.components()
            .iter()
            .all(|c| self.valid_list_contains_nominee_for_component(c.id()))
    }

    /// Whether every component has a selected pair
    pub fn all_components_have_selected(&self) -> bool {
        self.components().iter().all(|c| c.selected_pair().is_some())
    }

    /// Local candidate with this address in any component
    pub fn find_local_candidate(&self, address: &TransportAddress) -> Option<Candidate> {
        self.components().iter().find_map(|c| c.find_local_candidate(address))
    }

    /// Remote candidate with this address in any component
    pub fn find_remote_candidate(&self, address: &TransportAddress) -> Option<Candidate> {
        self.components().iter().find_map(|c| c.find_remote_candidate(address))
    }

    /// Number of local host candidates across components
    pub fn count_host_candidates(&self) -> usize {
        self.components().iter().map(|c| c.count_local_host_candidates()).sum()
    }

    /// Release every component and pair
    pub fn free(&self) {
        let components: Vec<_> = self.components.write().drain(..).collect();
        for component in components {
            component.free();
        }
        self.check_list.clear();
        self.valid_list.lock().clear();
        debug!("Stream {} freed", self.name);
    }
}
