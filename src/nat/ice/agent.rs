// src/nat/ice/agent.rs
//! Main ICE agent implementation
//!
//! The agent owns the media streams, the session credentials, the role and
//! the overall processing state. It wires the check client, the check
//! server, the nominator and the keep-alive loop together; each of those
//! holds a weak handle back to the agent.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::candidate::{Candidate, CandidateKind};
use super::config::IceConfig;
use super::connectivity::ConnectivityCheckClient;
use super::foundation::FoundationsRegistry;
use super::keepalive::{ConsentConfig, KeepAlive};
use super::nomination::{NominationStrategy, Nominator};
use super::pair::{CandidatePair, CandidatePairState, PairRef};
use super::server::ConnectivityCheckServer;
use super::states::{
    CheckListState, EventBus, EventHandler, HandlerId, IceEvent, IceProcessingState,
};
use super::stream::{Component, IceMediaStream};
use super::utils::{generate_password, generate_tie_breaker, generate_ufrag};
use crate::nat::error::{NatError, NatResult};
use crate::nat::stun::transaction::{RetransmissionPolicy, TransactionService};
use crate::nat::transport::{TransportAddress, TransportProtocol};

/// Main ICE agent
pub struct IceAgent {
    me: Weak<IceAgent>,
    id: Uuid,
    config: IceConfig,
    service: Arc<dyn TransactionService>,
    handle: Handle,
    /// Root of every task the agent spawns
    shutdown_token: CancellationToken,

    events: Arc<EventBus>,
    registry: Arc<FoundationsRegistry>,
    streams: RwLock<Vec<Arc<IceMediaStream>>>,

    ufrag: String,
    password: String,
    tie_breaker: AtomicU64,
    controlling: AtomicBool,

    state: Mutex<IceProcessingState>,
    generation: AtomicU32,
    ta: Mutex<Duration>,
    consent_freshness: AtomicBool,

    start_lock: ReentrantMutex<()>,
    nominate_lock: ReentrantMutex<()>,
    /// Pairs learned from checks received before our own checks started
    pre_discovered: Mutex<Vec<PairRef>>,
    shutdown: AtomicBool,
    termination_scheduled: AtomicBool,

    client: ConnectivityCheckClient,
    server: Arc<ConnectivityCheckServer>,
    nominator: Nominator,
    keep_alive: KeepAlive,
}

impl IceAgent {
    /// Create an agent on the current tokio runtime.
    ///
    /// The agent registers itself with `service` as the listener for its
    /// local ufrag right away, so checks from a fast peer are queued even
    /// before [`start_connectivity_establishment`](Self::start_connectivity_establishment).
    pub fn new(config: IceConfig, service: Arc<dyn TransactionService>) -> NatResult<Arc<Self>> {
        super::validate_ice_config(&config)?;
        let handle = Handle::try_current().map_err(|_| {
            NatError::Configuration("IceAgent requires a tokio runtime".to_string())
        })?;

        let shutdown_token = CancellationToken::new();
        let events = Arc::new(EventBus::new());

        let agent = Arc::new_cyclic(|me: &Weak<IceAgent>| IceAgent {
            me: me.clone(),
            id: Uuid::new_v4(),
            service,
            handle,
            client: ConnectivityCheckClient::new(me.clone(), shutdown_token.clone()),
            server: Arc::new(ConnectivityCheckServer::new(me.clone())),
            nominator: Nominator::new(
                me.clone(),
                config.nomination_strategy,
                config.relay_nomination_wait,
            ),
            keep_alive: KeepAlive::new(me.clone()),
            shutdown_token,
            events,
            registry: Arc::new(FoundationsRegistry::new()),
            streams: RwLock::new(Vec::new()),
            ufrag: generate_ufrag(),
            password: generate_password(),
            tie_breaker: AtomicU64::new(generate_tie_breaker()),
            controlling: AtomicBool::new(config.controlling),
            state: Mutex::new(IceProcessingState::Waiting),
            generation: AtomicU32::new(0),
            ta: Mutex::new(config.ta),
            consent_freshness: AtomicBool::new(config.consent.enabled),
            start_lock: ReentrantMutex::new(()),
            nominate_lock: ReentrantMutex::new(()),
            pre_discovered: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            termination_scheduled: AtomicBool::new(false),
            config,
        });

        let weak = Arc::downgrade(&agent);
        agent.events.subscribe(Arc::new(move |event: &IceEvent| {
            if let Some(agent) = weak.upgrade() {
                agent.nominator.handle_event(&agent, event);
            }
        }));
        agent.server.start(&agent);

        info!(
            "Agent {} created: ufrag={} controlling={} strategy={}",
            agent.id,
            agent.ufrag,
            agent.is_controlling(),
            agent.nominator.strategy()
        );
        Ok(agent)
    }

    /// Agent id used in log lines
    pub fn id(&self) -> Uuid {
        self.id
    }

    // ---- Streams and components ----

    /// Create a media stream; names are unique per agent
    pub fn create_media_stream(&self, name: &str) -> NatResult<Arc<IceMediaStream>> {
        let mut streams = self.streams.write();
        if streams.iter().any(|s| s.name() == name) {
            return Err(NatError::Configuration(format!("stream {} already exists", name)));
        }

        let stream = Arc::new(IceMediaStream::new(name, self.events.clone(), self.registry.clone()));
        streams.push(stream.clone());
        debug!("Agent {} created stream {}", self.id, name);
        Ok(stream)
    }

    /// Create the next component of a stream
    pub fn create_component(
        &self,
        stream: &str,
        transport: TransportProtocol,
    ) -> NatResult<Arc<Component>> {
        let stream = self
            .stream(stream)
            .ok_or_else(|| NatError::UnknownStream(stream.to_string()))?;
        Ok(stream.create_component(transport))
    }

    /// Stream by name
    pub fn stream(&self, name: &str) -> Option<Arc<IceMediaStream>> {
        self.streams.read().iter().find(|s| s.name() == name).cloned()
    }

    /// All streams in creation order
    pub fn streams(&self) -> Vec<Arc<IceMediaStream>> {
        self.streams.read().clone()
    }

    /// Names of all streams
    pub fn stream_names(&self) -> Vec<String> {
        self.streams.read().iter().map(|s| s.name().to_string()).collect()
    }

    /// Number of streams
    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    /// Remove and free a stream
    pub fn remove_stream(&self, name: &str) -> Option<Arc<IceMediaStream>> {
        let removed = {
            let mut streams = self.streams.write();
            let pos = streams.iter().position(|s| s.name() == name)?;
            streams.remove(pos)
        };
        removed.free();
        debug!("Agent {} removed stream {}", self.id, name);
        Some(removed)
    }

    // ---- Connectivity establishment ----

    /// Form the check lists and start checking.
    ///
    /// Components without remote candidates are dropped first, then streams
    /// left without components. Fails, and moves to FAILED, when nothing is
    /// left to check.
    pub fn start_connectivity_establishment(&self) -> NatResult<()> {
        let _start = self.start_lock.lock();

        if self.is_shut_down() {
            return Err(NatError::Shutdown);
        }
        if self.state() != IceProcessingState::Waiting {
            return Err(NatError::InvalidState(format!(
                "connectivity establishment already started ({})",
                self.state()
            )));
        }

        info!("Agent {} starts connectivity establishment", self.id);
        self.prune_streams();

        let streams = self.streams_with_pending_connectivity_establishment();
        if streams.is_empty() {
            warn!("Agent {}: no stream has remote candidates", self.id);
            self.set_state(IceProcessingState::Failed);
            return Err(NatError::InvalidState(
                "no stream with remote candidates to check".to_string(),
            ));
        }

        let per_stream = (self.config.max_check_list_size / streams.len()).max(1);
        let controlling = self.is_controlling();
        for stream in &streams {
            stream.set_max_check_list_size(per_stream);
            stream.init_check_list(controlling);
        }
        if let Some(first) = streams.first() {
            first.check_list().compute_initial_pair_states();
        }

        self.set_state(IceProcessingState::Running);

        let backlog: Vec<PairRef> = std::mem::take(&mut *self.pre_discovered.lock());
        if !backlog.is_empty() {
            debug!("Agent {} replays {} pre-discovered pairs", self.id, backlog.len());
        }
        for pair in backlog {
            self.trigger_check(pair);
        }

        self.client.start_checks_first(self);
        Ok(())
    }

    fn prune_streams(&self) {
        for stream in self.streams() {
            for component in stream.components() {
                if component.remote_candidate_count() == 0 {
                    info!(
                        "Removing component {} of stream {}: no remote candidates",
                        component.id(),
                        stream.name()
                    );
                    stream.remove_component(component.id());
                }
            }
            if stream.component_count() == 0 {
                info!("Removing stream {}: no components left", stream.name());
                self.remove_stream(stream.name());
            }
        }
    }

    /// Nominate a valid pair (controlling role only).
    ///
    /// The pair is re-checked with USE-CANDIDATE through the triggered
    /// queue. Nothing happens if its component already has a nominee.
    pub fn nominate(&self, pair: &PairRef) -> NatResult<()> {
        let _nominate = self.nominate_lock.lock();

        if !self.is_controlling() {
            return Err(NatError::InvalidState(
                "only the controlling agent nominates".to_string(),
            ));
        }
        let stream = self
            .stream(pair.stream())
            .ok_or_else(|| NatError::UnknownStream(pair.stream().to_string()))?;

        if !pair.is_valid() {
            return Err(NatError::InvalidState(format!("{} is not a valid pair", pair)));
        }

        if pair.is_nominated() || stream.valid_list_contains_nominee_for_component(pair.component_id()) {
            debug!("Component {} of {} already has a nominee", pair.component_id(), pair.stream());
            return Ok(());
        }

        info!("Agent {} nominates {}", self.id, pair);
        pair.nominate();
        self.cancel_in_progress_check(pair);
        stream.check_list().schedule_triggered_check(pair);
        self.client.start_checks(self, &stream);
        Ok(())
    }

    /// Current nomination strategy
    pub fn nomination_strategy(&self) -> NominationStrategy {
        self.nominator.strategy()
    }

    /// Change the nomination strategy
    pub fn set_nomination_strategy(&self, strategy: NominationStrategy) {
        self.nominator.set_strategy(strategy);
    }

    // ---- Role ----

    /// Switch role; pair priorities of every check list are recomputed
    pub fn set_controlling(&self, controlling: bool) {
        let old = self.controlling.swap(controlling, Ordering::AcqRel);
        if old == controlling {
            return;
        }

        info!("Agent {} is now {}", self.id, if controlling { "controlling" } else { "controlled" });
        for stream in self.streams() {
            stream.check_list().recompute_pair_priorities(controlling);
        }
    }

    /// Whether we are the controlling agent
    pub fn is_controlling(&self) -> bool {
        self.controlling.load(Ordering::Acquire)
    }

    /// Tie-breaker sent in ICE-CONTROLLING / ICE-CONTROLLED
    pub fn tie_breaker(&self) -> u64 {
        self.tie_breaker.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn set_tie_breaker(&self, tie_breaker: u64) {
        self.tie_breaker.store(tie_breaker, Ordering::Release);
    }

    // ---- Credentials ----

    /// Local username fragment
    pub fn local_ufrag(&self) -> &str {
        &self.ufrag
    }

    /// Local password
    pub fn local_password(&self) -> &str {
        &self.password
    }

    /// USERNAME for requests we send on `media`: `remoteUfrag:localUfrag`
    pub fn generate_local_user_name(&self, media: &str) -> Option<String> {
        let remote = self.stream(media)?.remote_ufrag()?;
        Some(format!("{}:{}", remote, self.ufrag))
    }

    /// USERNAME the peer uses towards us on `media`: `localUfrag:remoteUfrag`
    pub fn generate_remote_user_name(&self, media: &str) -> Option<String> {
        let remote = self.stream(media)?.remote_ufrag()?;
        Some(format!("{}:{}", self.ufrag, remote))
    }

    // ---- State ----

    /// Processing state
    pub fn state(&self) -> IceProcessingState {
        *self.state.lock()
    }

    /// Whether connectivity establishment was started
    pub fn is_started(&self) -> bool {
        self.state() != IceProcessingState::Waiting
    }

    /// Whether processing is COMPLETED, FAILED or TERMINATED
    pub fn is_over(&self) -> bool {
        self.state().is_over()
    }

    /// Whether [`free`](Self::free) was called
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Session generation
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Set the session generation
    pub fn set_generation(&self, generation: u32) {
        self.generation.store(generation, Ordering::Relaxed);
    }

    // ---- Timing ----

    /// Override the pacing interval `Ta`
    pub fn set_ta(&self, ta: Duration) -> NatResult<()> {
        if ta.is_zero() {
            return Err(NatError::Configuration("Ta must be positive".to_string()));
        }
        *self.ta.lock() = ta;
        Ok(())
    }

    /// Pacing interval of one check list: `Ta * max(1, active lists)`
    pub fn calculate_ta(&self) -> Duration {
        let active = self.active_check_list_count().max(1) as u32;
        self.ta.lock().saturating_mul(active)
    }

    /// Initial retransmission timeout of a connectivity check
    pub fn calculate_conn_check_rto(&self) -> Duration {
        self.config.check_rto
    }

    fn active_check_list_count(&self) -> usize {
        self.streams
            .read()
            .iter()
            .filter(|s| s.check_list().is_active())
            .count()
    }

    // ---- Consent ----

    /// Use Binding requests (consent freshness) rather than indications as
    /// keep-alives
    pub fn set_perform_consent_freshness(&self, enabled: bool) {
        self.consent_freshness.store(enabled, Ordering::Release);
    }

    /// Whether keep-alives are consent freshness checks
    pub fn perform_consent_freshness(&self) -> bool {
        self.consent_freshness.load(Ordering::Acquire)
    }

    // ---- Lookups ----

    /// Local candidate with this address in any stream
    pub fn find_local_candidate(&self, address: &TransportAddress) -> Option<Candidate> {
        self.streams.read().iter().find_map(|s| s.find_local_candidate(address))
    }

    /// Remote candidate with this address in any stream
    pub fn find_remote_candidate(&self, address: &TransportAddress) -> Option<Candidate> {
        self.streams.read().iter().find_map(|s| s.find_remote_candidate(address))
    }

    /// Pair joining these addresses in any stream
    pub fn find_candidate_pair(
        &self,
        local: &TransportAddress,
        remote: &TransportAddress,
    ) -> Option<PairRef> {
        self.streams.read().iter().find_map(|s| s.find_candidate_pair(local, remote))
    }

    /// Number of local host candidates across streams
    pub fn count_host_candidates(&self) -> usize {
        self.streams.read().iter().map(|s| s.count_host_candidates()).sum()
    }

    /// Selected pair of component 1 of `stream`
    pub fn selected_pair(&self, stream: &str) -> Option<PairRef> {
        self.stream(stream)?.component(1)?.selected_pair()
    }

    /// Local candidate of [`selected_pair`](Self::selected_pair)
    pub fn selected_local_candidate(&self, stream: &str) -> Option<Candidate> {
        self.selected_pair(stream).map(|p| p.local().clone())
    }

    /// Remote candidate of [`selected_pair`](Self::selected_pair)
    pub fn selected_remote_candidate(&self, stream: &str) -> Option<Candidate> {
        self.selected_pair(stream).map(|p| p.remote().clone())
    }

    // ---- Events ----

    /// Register a synchronous event handler
    pub fn subscribe(&self, handler: EventHandler) -> HandlerId {
        self.events.subscribe(handler)
    }

    /// Remove an event handler
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Broadcast receiver of every event
    pub fn subscribe_events(&self) -> broadcast::Receiver<IceEvent> {
        self.events.subscribe_channel()
    }

    // ---- Shutdown ----

    /// Stop every task, terminate, free all streams and shut the transaction
    /// service down
    pub fn free(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Freeing agent {}", self.id);

        self.shutdown_token.cancel();
        self.server.stop(self);

        if !matches!(self.state(), IceProcessingState::Failed | IceProcessingState::Terminated) {
            self.terminate(IceProcessingState::Terminated);
        }

        let streams: Vec<Arc<IceMediaStream>> = self.streams.write().drain(..).collect();
        for stream in streams {
            stream.free();
            debug!("Agent {} freed stream {}", self.id, stream.name());
        }

        self.service.shutdown();
        info!("Agent {} freed", self.id);
    }

    // ---- Crate internals ----

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future)
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    pub(crate) fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub(crate) fn service(&self) -> &Arc<dyn TransactionService> {
        &self.service
    }

    pub(crate) fn client(&self) -> &ConnectivityCheckClient {
        &self.client
    }

    #[cfg(test)]
    pub(crate) fn server(&self) -> &Arc<ConnectivityCheckServer> {
        &self.server
    }

    pub(crate) fn nominator(&self) -> &Nominator {
        &self.nominator
    }

    pub(crate) fn config(&self) -> &IceConfig {
        &self.config
    }

    pub(crate) fn consent_config(&self) -> &ConsentConfig {
        &self.config.consent
    }

    /// Retransmission schedule of an ordinary check
    pub(crate) fn check_policy(&self) -> RetransmissionPolicy {
        RetransmissionPolicy::new(
            self.calculate_conn_check_rto(),
            self.config.check_max_wait,
            self.config.check_max_retransmissions,
        )
    }

    /// Keep-alives run while COMPLETED or TERMINATED and not freed
    pub(crate) fn keep_alive_condition(&self) -> bool {
        !self.is_shut_down()
            && matches!(self.state(), IceProcessingState::Completed | IceProcessingState::Terminated)
    }

    #[cfg(test)]
    pub(crate) fn pre_discovered_count(&self) -> usize {
        self.pre_discovered.lock().len()
    }

    /// Streams whose check list is neither COMPLETED nor FAILED
    pub(crate) fn streams_with_pending_connectivity_establishment(&self) -> Vec<Arc<IceMediaStream>> {
        self.streams()
            .into_iter()
            .filter(|s| !s.check_list().state().is_terminal())
            .collect()
    }

    fn locate_local_candidate(
        &self,
        address: &TransportAddress,
    ) -> Option<(Arc<IceMediaStream>, Arc<Component>, Candidate)> {
        self.streams().into_iter().find_map(|stream| {
            stream.components().into_iter().find_map(|component| {
                let candidate = component.find_local_candidate(address)?;
                Some((stream.clone(), component, candidate))
            })
        })
    }

    /// A check from the peer reached `local` from `remote` (RFC 8445
    /// Section 7.3.1.3 and 7.3.1.4)
    pub(crate) fn incoming_check_received(
        &self,
        remote: TransportAddress,
        local: TransportAddress,
        priority: u32,
        remote_ufrag: &str,
        use_candidate: bool,
    ) {
        if self.is_over() {
            trace!("Check from {} after processing ended, consent only", remote);
            return;
        }

        let Some((stream, component, local_candidate)) = self.locate_local_candidate(&local) else {
            info!("No local candidate for {}, ignoring check from {}", local, remote);
            return;
        };

        // An unknown source joins the component with its triggered pair
        let remote_candidate = match component.find_remote_candidate(&remote) {
            Some(known) => known,
            None => {
                let candidate = Candidate::remote(
                    remote,
                    CandidateKind::PeerReflexive,
                    component.id(),
                    self.registry.obtain_remote_prflx_foundation(),
                    priority,
                )
                .with_ufrag(remote_ufrag);
                debug!("Discovered remote peer reflexive candidate {}", candidate);
                candidate
            }
        };

        let pair = CandidatePair::new(
            stream.name(),
            local_candidate,
            remote_candidate,
            self.is_controlling(),
            self.events.clone(),
        );
        if use_candidate {
            pair.set_use_candidate_received();
        }

        let _start = self.start_lock.lock();
        if self.is_started() {
            self.trigger_check(pair);
        } else {
            debug!("Checks not started yet, queueing {}", pair);
            self.pre_discovered.lock().push(pair);
        }
    }

    /// Triggered check for a pair learned from an incoming check
    fn trigger_check(&self, triggered: PairRef) {
        let Some(stream) = self.stream(triggered.stream()) else {
            return;
        };

        let pair = match stream.find_candidate_pair(&triggered.local().address, &triggered.remote().address) {
            Some(known) => {
                if triggered.use_candidate_received() {
                    known.set_use_candidate_received();
                }

                match known.state() {
                    CandidatePairState::Succeeded => {
                        if !self.is_controlling() && known.use_candidate_received() {
                            if !known.is_nominated() {
                                info!("Nomination confirmed for succeeded pair {}", known);
                                self.nomination_confirmed(&known);
                            }
                            self.check_list_states_updated();
                        }
                        return;
                    }
                    CandidatePairState::InProgress => self.cancel_in_progress_check(&known),
                    _ => {}
                }
                known
            }
            None => {
                let Some(component) = stream.component(triggered.component_id()) else {
                    debug!("Component of {} is gone, dropping the triggered check", triggered);
                    return;
                };
                if component.find_remote_candidate(&triggered.remote().address).is_none() {
                    component.add_remote_candidate(triggered.remote().clone());
                }
                debug!("Adding triggered pair {} to check list", triggered);
                stream.add_to_check_list(triggered.clone());
                triggered
            }
        };

        stream.check_list().schedule_triggered_check(&pair);
        self.client.start_checks(self, &stream);
    }

    /// Stop retransmitting the check in flight on `pair`; its response,
    /// if one still arrives, is processed
    fn cancel_in_progress_check(&self, pair: &PairRef) {
        if let Some(transaction) = pair.transaction_id() {
            debug!("Cancelling check {} for {}", transaction, pair);
            self.service.cancel_transaction(&transaction);
        }
    }

    /// The nomination of `pair` is confirmed (RFC 8445 Section 8.1.1)
    pub(crate) fn nomination_confirmed(&self, pair: &PairRef) {
        let _nominate = self.nominate_lock.lock();

        let Some(stream) = self.stream(pair.stream()) else {
            return;
        };
        let Some(component) = stream.component(pair.component_id()) else {
            return;
        };

        pair.nominate();

        let list = stream.check_list();
        if list.state() == CheckListState::Running {
            list.handle_nomination_confirmed(pair, &component);
        }

        if stream.all_components_have_selected() && list.state() == CheckListState::Running {
            info!("Every component of stream {} has a selected pair", stream.name());
            list.set_state(CheckListState::Completed);
        }
    }

    /// Re-evaluate the processing state from the check list states
    pub(crate) fn check_list_states_updated(&self) {
        if self.is_shut_down() || self.is_over() {
            return;
        }

        let streams = self.streams();
        if streams.iter().any(|s| s.check_list().state() == CheckListState::Running) {
            return;
        }

        if !streams.iter().any(|s| s.check_list().state() == CheckListState::Completed) {
            info!("Agent {}: every check list failed", self.id);
            self.terminate(IceProcessingState::Failed);
            return;
        }

        if !self.compare_and_set_state(IceProcessingState::Running, IceProcessingState::Completed) {
            return;
        }

        if self.config.keep_alives {
            self.keep_alive.schedule(self.shutdown_token.child_token());
        }
        self.schedule_termination();

        for stream in &streams {
            for component in stream.components() {
                if let Some(pair) = component.selected_pair() {
                    info!(
                        "Agent {} selected pair for {}/{}: {}",
                        self.id,
                        stream.name(),
                        component.id(),
                        pair
                    );
                }
            }
        }
    }

    fn schedule_termination(&self) {
        if self.termination_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let delay = self.config.termination_delay;
        if delay.is_zero() {
            self.terminate(IceProcessingState::Terminated);
            return;
        }

        debug!("Agent {} terminates in {:?}", self.id, delay);
        let weak = self.me.clone();
        let token = self.shutdown_token.child_token();
        self.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(agent) = weak.upgrade() {
                        if agent.state() == IceProcessingState::Completed {
                            agent.terminate(IceProcessingState::Terminated);
                        }
                    }
                }
            }
        });
    }

    /// Stop checking and enter FAILED or TERMINATED
    fn terminate(&self, state: IceProcessingState) {
        if !matches!(state, IceProcessingState::Failed | IceProcessingState::Terminated) {
            return;
        }
        self.client.stop();
        self.set_state(state);
    }

    fn set_state(&self, new: IceProcessingState) {
        let old = std::mem::replace(&mut *self.state.lock(), new);
        if old != new {
            info!("Agent {} ICE state {} -> {}", self.id, old, new);
            self.events.emit(IceEvent::ProcessingStateChanged { old, new });
        }
    }

    fn compare_and_set_state(&self, expected: IceProcessingState, new: IceProcessingState) -> bool {
        {
            let mut state = self.state.lock();
            if *state != expected {
                return false;
            }
            *state = new;
        }
        info!("Agent {} ICE state {} -> {}", self.id, expected, new);
        self.events.emit(IceEvent::ProcessingStateChanged { old: expected, new });
        true
    }
}

impl Drop for IceAgent {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

impl fmt::Debug for IceAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceAgent")
            .field("id", &self.id)
            .field("ufrag", &self.ufrag)
            .field("state", &self.state())
            .field("controlling", &self.is_controlling())
            .field("streams", &self.stream_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::stun::memory::MemoryNetwork;
    use crate::nat::stun::protocol::{Message, TransactionId};
    use crate::nat::stun::transaction::{RequestListener, ResponseCallback};

    fn udp(s: &str) -> TransportAddress {
        TransportAddress::udp(s.parse().unwrap())
    }

    fn agent_with(config: IceConfig) -> Arc<IceAgent> {
        let net = MemoryNetwork::new().unwrap();
        IceAgent::new(config, net.stack()).unwrap()
    }

    fn agent() -> Arc<IceAgent> {
        agent_with(IceConfig::default())
    }

    fn add_host_pair(agent: &IceAgent, stream: &str, local: &str, remote: &str) -> Arc<Component> {
        if agent.stream(stream).is_none() {
            agent.create_media_stream(stream).unwrap();
        }
        let component = agent.create_component(stream, TransportProtocol::Udp).unwrap();
        component.add_local_candidate(Candidate::host(udp(local), component.id()));
        component.add_remote_candidate(Candidate::remote(
            udp(remote),
            CandidateKind::Host,
            component.id(),
            "1",
            2_130_706_431,
        ));
        component
    }

    #[test]
    fn test_new_requires_runtime() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let stack = rt.block_on(async { MemoryNetwork::new().unwrap().stack() });
        let err = IceAgent::new(IceConfig::default(), stack).unwrap_err();
        assert!(matches!(err, NatError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let net = MemoryNetwork::new().unwrap();
        let config = IceConfig { ta: Duration::ZERO, ..IceConfig::default() };
        assert!(IceAgent::new(config, net.stack()).is_err());
    }

    #[tokio::test]
    async fn test_credentials_and_usernames() {
        let agent = agent();
        assert!(agent.local_ufrag().len() >= 4);
        assert!(agent.local_password().len() >= 22);
        assert_eq!(agent.state(), IceProcessingState::Waiting);
        assert!(!agent.is_started());

        let stream = agent.create_media_stream("audio").unwrap();
        assert!(agent.generate_local_user_name("audio").is_none());

        stream.set_remote_credentials("rfrag", "remotepasswordremotepass");
        assert_eq!(
            agent.generate_local_user_name("audio"),
            Some(format!("rfrag:{}", agent.local_ufrag()))
        );
        assert_eq!(
            agent.generate_remote_user_name("audio"),
            Some(format!("{}:rfrag", agent.local_ufrag()))
        );
    }

    #[tokio::test]
    async fn test_stream_management() {
        let agent = agent();
        agent.create_media_stream("audio").unwrap();
        agent.create_media_stream("video").unwrap();
        assert!(matches!(agent.create_media_stream("audio"), Err(NatError::Configuration(_))));
        assert!(matches!(
            agent.create_component("data", TransportProtocol::Udp),
            Err(NatError::UnknownStream(_))
        ));

        assert_eq!(agent.stream_names(), vec!["audio".to_string(), "video".to_string()]);
        assert!(agent.remove_stream("audio").is_some());
        assert!(agent.remove_stream("audio").is_none());
        assert_eq!(agent.stream_count(), 1);
    }

    #[tokio::test]
    async fn test_ta_and_rto() {
        let agent = agent();
        assert_eq!(agent.calculate_ta(), Duration::from_millis(20));
        assert!(agent.set_ta(Duration::ZERO).is_err());
        agent.set_ta(Duration::from_millis(50)).unwrap();
        assert_eq!(agent.calculate_ta(), Duration::from_millis(50));
        assert_eq!(agent.calculate_conn_check_rto(), Duration::from_millis(100));

        agent.set_generation(3);
        assert_eq!(agent.generation(), 3);
    }

    #[tokio::test]
    async fn test_ta_scales_with_active_lists() {
        let agent = agent();
        add_host_pair(&agent, "audio", "10.0.0.1:5000", "10.0.0.2:6000");
        add_host_pair(&agent, "video", "10.0.0.1:5002", "10.0.0.2:6002");
        for stream in agent.streams() {
            stream.init_check_list(true);
            stream.check_list().compute_initial_pair_states();
        }
        assert_eq!(agent.calculate_ta(), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_start_without_remote_candidates_fails() {
        let agent = agent();
        agent.create_media_stream("audio").unwrap();
        let component = agent.create_component("audio", TransportProtocol::Udp).unwrap();
        component.add_local_candidate(Candidate::host(udp("10.0.0.1:5000"), 1));

        assert!(agent.start_connectivity_establishment().is_err());
        assert_eq!(agent.state(), IceProcessingState::Failed);
        assert_eq!(agent.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_start_splits_check_list_budget_and_prunes() {
        let agent = agent_with(IceConfig { max_check_list_size: 10, ..IceConfig::default() });
        add_host_pair(&agent, "audio", "10.0.0.1:5000", "10.0.0.2:6000");
        add_host_pair(&agent, "video", "10.0.0.1:5002", "10.0.0.2:6002");
        // A component without remote candidates is dropped
        let lonely = agent.create_component("video", TransportProtocol::Udp).unwrap();
        lonely.add_local_candidate(Candidate::host(udp("10.0.0.1:5004"), lonely.id()));

        agent.start_connectivity_establishment().unwrap();
        assert_eq!(agent.state(), IceProcessingState::Running);
        assert!(agent.is_started());

        let audio = agent.stream("audio").unwrap();
        let video = agent.stream("video").unwrap();
        assert_eq!(audio.max_check_list_size(), 5);
        assert_eq!(video.component_count(), 1);
        assert_eq!(audio.check_list().pairs()[0].state(), CandidatePairState::Waiting);
        // Only the first list gets initial states
        assert_eq!(video.check_list().pairs()[0].state(), CandidatePairState::Frozen);

        assert!(matches!(
            agent.start_connectivity_establishment(),
            Err(NatError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_nominate_requires_controlling() {
        let agent = agent_with(IceConfig { controlling: false, ..IceConfig::default() });
        add_host_pair(&agent, "audio", "10.0.0.1:5000", "10.0.0.2:6000");
        let stream = agent.stream("audio").unwrap();
        stream.init_check_list(false);
        let pair = stream.check_list().pairs()[0].clone();

        assert!(matches!(agent.nominate(&pair), Err(NatError::InvalidState(_))));
        assert!(!pair.is_nominated());
    }

    #[tokio::test]
    async fn test_nominate_schedules_triggered_check_once() {
        let agent = agent();
        add_host_pair(&agent, "audio", "10.0.0.1:5000", "10.0.0.2:6000");
        let stream = agent.stream("audio").unwrap();
        stream.init_check_list(true);
        let pair = stream.check_list().pairs()[0].clone();

        // Only valid pairs can be nominated
        assert!(matches!(agent.nominate(&pair), Err(NatError::InvalidState(_))));
        assert!(!pair.is_nominated());
        assert_eq!(stream.check_list().triggered_len(), 0);

        stream.add_to_valid_list(&pair);
        agent.nominate(&pair).unwrap();
        assert!(pair.is_nominated());
        assert_eq!(pair.state(), CandidatePairState::Waiting);
        assert_eq!(stream.check_list().triggered_len(), 1);

        agent.nominate(&pair).unwrap();
        assert_eq!(stream.check_list().triggered_len(), 1);
    }

    /// Accepts every request and remembers cancellations
    #[derive(Default)]
    struct RecordingService {
        cancelled: Mutex<Vec<TransactionId>>,
    }

    impl TransactionService for RecordingService {
        fn send_request(
            &self,
            request: Message,
            _destination: TransportAddress,
            _source: TransportAddress,
            _policy: RetransmissionPolicy,
            _callback: ResponseCallback,
        ) -> NatResult<TransactionId> {
            Ok(request.transaction_id)
        }

        fn send_indication(&self, _: Message, _: TransportAddress, _: TransportAddress) -> NatResult<()> {
            Ok(())
        }

        fn send_response(
            &self,
            _: TransactionId,
            _: Message,
            _: TransportAddress,
            _: TransportAddress,
        ) -> NatResult<()> {
            Ok(())
        }

        fn cancel_transaction(&self, transaction_id: &TransactionId) {
            self.cancelled.lock().push(*transaction_id);
        }

        fn register_request_listener(&self, _: &str, _: Arc<dyn RequestListener>) {}

        fn unregister_request_listener(&self, _: &str) {}

        fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn test_nominate_cancels_check_in_flight() {
        let service = Arc::new(RecordingService::default());
        let agent = IceAgent::new(IceConfig::default(), service.clone()).unwrap();
        add_host_pair(&agent, "audio", "10.0.0.1:5000", "10.0.0.2:6000");
        let stream = agent.stream("audio").unwrap();
        stream.init_check_list(true);
        let pair = stream.check_list().pairs()[0].clone();
        stream.add_to_valid_list(&pair);

        let transaction = TransactionId::new();
        pair.set_in_progress(transaction);
        agent.nominate(&pair).unwrap();

        assert_eq!(*service.cancelled.lock(), vec![transaction]);
        assert_eq!(pair.state(), CandidatePairState::Waiting);
        assert!(pair.transaction_id().is_none());
        assert_eq!(stream.check_list().triggered_len(), 1);
    }

    #[tokio::test]
    async fn test_triggered_check_cancels_check_in_flight() {
        let service = Arc::new(RecordingService::default());
        let agent = IceAgent::new(IceConfig::default(), service.clone()).unwrap();
        add_host_pair(&agent, "audio", "10.0.0.1:5000", "10.0.0.2:6000");
        agent.start_connectivity_establishment().unwrap();
        let stream = agent.stream("audio").unwrap();
        let pair = stream.check_list().pairs()[0].clone();

        let transaction = TransactionId::new();
        pair.set_in_progress(transaction);
        agent.incoming_check_received(udp("10.0.0.2:6000"), udp("10.0.0.1:5000"), 7, "peer", false);

        assert_eq!(*service.cancelled.lock(), vec![transaction]);
        assert_eq!(pair.state(), CandidatePairState::Waiting);
        assert_eq!(stream.check_list().triggered_len(), 1);
    }

    #[tokio::test]
    async fn test_set_controlling_recomputes_priorities() {
        let agent = agent();
        let component = add_host_pair(&agent, "audio", "10.0.0.1:5000", "10.0.0.2:6000");
        component.add_local_candidate(Candidate::host(udp("10.0.0.1:5001"), 1));
        let stream = agent.stream("audio").unwrap();
        stream.init_check_list(true);
        let before: Vec<u64> = stream.check_list().pairs().iter().map(|p| p.priority()).collect();

        agent.set_controlling(false);
        assert!(!agent.is_controlling());
        let after: Vec<u64> = stream.check_list().pairs().iter().map(|p| p.priority()).collect();
        assert_ne!(before, after);
        assert!(after.windows(2).all(|w| w[0] >= w[1]));
    }

    #[tokio::test]
    async fn test_incoming_check_after_completion_is_ignored() {
        let agent = agent();
        add_host_pair(&agent, "audio", "10.0.0.1:5000", "10.0.0.2:6000");
        agent.set_state(IceProcessingState::Completed);

        agent.incoming_check_received(udp("10.0.0.9:7000"), udp("10.0.0.1:5000"), 1, "peer", false);
        assert!(agent.find_remote_candidate(&udp("10.0.0.9:7000")).is_none());
        assert_eq!(agent.pre_discovered_count(), 0);
    }

    #[tokio::test]
    async fn test_incoming_check_on_unknown_local_address_is_dropped() {
        let agent = agent();
        add_host_pair(&agent, "audio", "10.0.0.1:5000", "10.0.0.2:6000");
        agent.incoming_check_received(udp("10.0.0.9:7000"), udp("10.0.0.1:9999"), 1, "peer", false);
        assert_eq!(agent.pre_discovered_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_prflx_foundations_start_at_10000() {
        let agent = agent();
        add_host_pair(&agent, "audio", "10.0.0.1:5000", "10.0.0.2:6000");
        agent.incoming_check_received(udp("10.0.0.9:7000"), udp("10.0.0.1:5000"), 7, "peer", false);
        agent.incoming_check_received(udp("10.0.0.9:7001"), udp("10.0.0.1:5000"), 7, "peer", false);

        let foundations: Vec<String> = agent
            .pre_discovered
            .lock()
            .iter()
            .map(|pair| pair.remote().foundation.clone())
            .collect();
        assert_eq!(foundations, vec!["10000".to_string(), "10001".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_check_adds_remote_candidate_only_with_its_pair() {
        let agent = agent();
        add_host_pair(&agent, "audio", "10.0.0.1:5000", "10.0.0.2:6000");
        // Second component knows no remote candidate; only a check reached it
        let rtcp = agent.create_component("audio", TransportProtocol::Udp).unwrap();
        rtcp.add_local_candidate(Candidate::host(udp("10.0.0.1:5001"), rtcp.id()));

        agent.incoming_check_received(udp("10.0.0.9:7000"), udp("10.0.0.1:5000"), 7, "peer", false);
        agent.incoming_check_received(udp("10.0.0.9:7001"), udp("10.0.0.1:5001"), 7, "peer", false);
        assert_eq!(agent.pre_discovered_count(), 2);
        assert!(agent.find_remote_candidate(&udp("10.0.0.9:7000")).is_none());
        assert_eq!(rtcp.remote_candidate_count(), 0);

        agent.start_connectivity_establishment().unwrap();
        let stream = agent.stream("audio").unwrap();
        assert_eq!(stream.component_count(), 1);
        assert_eq!(agent.pre_discovered_count(), 0);

        let replayed = agent.find_remote_candidate(&udp("10.0.0.9:7000")).expect("replayed remote");
        assert_eq!(replayed.kind, CandidateKind::PeerReflexive);
        assert!(stream
            .find_candidate_pair(&udp("10.0.0.1:5000"), &udp("10.0.0.9:7000"))
            .is_some());
        // The pruned component took its queued check with it
        assert!(agent.find_remote_candidate(&udp("10.0.0.9:7001")).is_none());
        assert_eq!(stream.check_list().pairs().len(), 2);
    }

    #[tokio::test]
    async fn test_state_events_are_delivered() {
        let agent = agent();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = agent.subscribe(Arc::new(move |event: &IceEvent| {
            if let IceEvent::ProcessingStateChanged { new, .. } = event {
                sink.lock().push(*new);
            }
        }));

        agent.set_state(IceProcessingState::Running);
        assert!(agent.compare_and_set_state(IceProcessingState::Running, IceProcessingState::Completed));
        assert!(!agent.compare_and_set_state(IceProcessingState::Running, IceProcessingState::Completed));
        assert!(agent.unsubscribe(id));
        agent.set_state(IceProcessingState::Terminated);

        assert_eq!(
            *seen.lock(),
            vec![IceProcessingState::Running, IceProcessingState::Completed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_free_terminates_and_clears() {
        let agent = agent();
        add_host_pair(&agent, "audio", "10.0.0.1:5000", "10.0.0.2:6000");
        let mut events = agent.subscribe_events();
        agent.start_connectivity_establishment().unwrap();

        agent.free();
        assert!(agent.is_shut_down());
        assert_eq!(agent.state(), IceProcessingState::Terminated);
        assert_eq!(agent.stream_count(), 0);
        assert_eq!(agent.client().pacemaker_count(), 0);
        assert!(!agent.server().is_started());
        assert!(matches!(agent.start_connectivity_establishment(), Err(NatError::Shutdown)));

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let IceEvent::ProcessingStateChanged { new, .. } = event {
                states.push(new);
            }
        }
        assert_eq!(states, vec![IceProcessingState::Running, IceProcessingState::Terminated]);
    }
}
