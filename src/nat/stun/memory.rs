// src/nat/stun/memory.rs
//! In-process transaction service.
//!
//! A [`MemoryNetwork`] connects any number of [`MemoryStack`]s. Each stack
//! binds transport addresses and implements [`TransactionService`] by handing
//! messages to the stack bound at the destination on a spawned task. The
//! network can put an address behind a NAT mapping (so the peer observes a
//! different source, which is how peer-reflexive candidates appear) and can
//! block paths, in which case requests time out after the policy's total wait.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::protocol::{Message, TransactionId, BAD_REQUEST, UNAUTHORIZED};
use super::transaction::{
    username_local_part, RequestListener, ResponseCallback, RetransmissionPolicy,
    StunRequestEvent, StunResponseEvent, StunTimeoutEvent, TransactionOutcome,
    TransactionService,
};
use crate::nat::error::{NatError, NatResult};
use crate::nat::transport::TransportAddress;

/// Shared routing state
#[derive(Default)]
struct NetworkState {
    /// Bound addresses and their owning stack
    endpoints: HashMap<TransportAddress, Weak<MemoryStack>>,
    /// private -> public source rewriting
    nat_out: HashMap<SocketAddr, SocketAddr>,
    /// public -> private inbound routing
    nat_in: HashMap<SocketAddr, SocketAddr>,
    /// (from, to) pairs whose packets are dropped, in observed addresses
    blocked: HashSet<(SocketAddr, SocketAddr)>,
    /// Requests delivered per bound address
    requests: HashMap<SocketAddr, usize>,
    /// Indications delivered per bound address
    indications: HashMap<SocketAddr, usize>,
}

/// Simulated network joining in-process STUN stacks
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    handle: Handle,
    next_stack_id: Arc<AtomicU64>,
}

impl MemoryNetwork {
    /// Create a network bound to the current tokio runtime
    pub fn new() -> NatResult<Self> {
        let handle = Handle::try_current().map_err(|_| {
            NatError::Configuration("MemoryNetwork requires a tokio runtime".to_string())
        })?;

        Ok(Self {
            state: Arc::new(Mutex::new(NetworkState::default())),
            handle,
            next_stack_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Create a new stack attached to this network
    pub fn stack(&self) -> Arc<MemoryStack> {
        let id = self.next_stack_id.fetch_add(1, Ordering::Relaxed);
        let network = self.clone();
        Arc::new_cyclic(|me| MemoryStack {
            id,
            me: me.clone(),
            network,
            listeners: RwLock::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            bound: Mutex::new(HashSet::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Put `private` behind a NAT that maps it to `public`
    pub fn add_nat_mapping(&self, private: SocketAddr, public: SocketAddr) {
        let mut state = self.state.lock();
        state.nat_out.insert(private, public);
        state.nat_in.insert(public, private);
    }

    /// Drop traffic in both directions between two observed addresses
    pub fn block_path(&self, a: SocketAddr, b: SocketAddr) {
        let mut state = self.state.lock();
        state.blocked.insert((a, b));
        state.blocked.insert((b, a));
    }

    /// Restore a path removed with [`block_path`](Self::block_path)
    pub fn unblock_path(&self, a: SocketAddr, b: SocketAddr) {
        let mut state = self.state.lock();
        state.blocked.remove(&(a, b));
        state.blocked.remove(&(b, a));
    }

    /// Number of requests delivered to `addr`
    pub fn requests_received(&self, addr: SocketAddr) -> usize {
        self.state.lock().requests.get(&addr).copied().unwrap_or(0)
    }

    /// Number of indications delivered to `addr`
    pub fn indications_received(&self, addr: SocketAddr) -> usize {
        self.state.lock().indications.get(&addr).copied().unwrap_or(0)
    }

    /// Source address a packet from `local` is seen with
    fn observed(&self, local: TransportAddress) -> TransportAddress {
        let state = self.state.lock();
        match state.nat_out.get(&local.addr) {
            Some(public) => TransportAddress::new(*public, local.protocol),
            None => local,
        }
    }

    /// Resolve the stack and bound address that receive a packet sent from
    /// `observed_source` to `destination`
    fn route(
        &self,
        observed_source: TransportAddress,
        destination: TransportAddress,
    ) -> Option<(Arc<MemoryStack>, TransportAddress)> {
        let state = self.state.lock();

        if state.blocked.contains(&(observed_source.addr, destination.addr)) {
            trace!("Dropping packet {} -> {}: path blocked", observed_source, destination);
            return None;
        }

        let target_addr = state.nat_in.get(&destination.addr).copied().unwrap_or(destination.addr);
        let target = TransportAddress::new(target_addr, destination.protocol);

        let stack = state.endpoints.get(&target).and_then(Weak::upgrade)?;
        Some((stack, target))
    }

    fn count(&self, addr: SocketAddr, indication: bool) {
        let mut state = self.state.lock();
        let counter = if indication { &mut state.indications } else { &mut state.requests };
        *counter.entry(addr).or_insert(0) += 1;
    }
}

/// Outstanding client transaction
struct PendingTransaction {
    request: Message,
    source: TransportAddress,
    destination: TransportAddress,
    callback: ResponseCallback,
    timer: JoinHandle<()>,
    /// Expiry is silent once cancelled
    cancelled: bool,
}

/// One participant on a [`MemoryNetwork`]
pub struct MemoryStack {
    id: u64,
    me: Weak<MemoryStack>,
    network: MemoryNetwork,
    listeners: RwLock<HashMap<String, Arc<dyn RequestListener>>>,
    transactions: Mutex<HashMap<TransactionId, PendingTransaction>>,
    bound: Mutex<HashSet<TransportAddress>>,
    shut_down: AtomicBool,
}

impl MemoryStack {
    /// Bind a local transport address so it can send and receive
    pub fn bind(&self, addr: TransportAddress) -> NatResult<()> {
        let mut state = self.network.state.lock();
        if let Some(existing) = state.endpoints.get(&addr).and_then(Weak::upgrade) {
            if existing.id != self.id {
                return Err(NatError::Configuration(format!("{} is already bound", addr)));
            }
        }
        state.endpoints.insert(addr, self.me.clone());
        self.bound.lock().insert(addr);
        debug!("Stack {} bound {}", self.id, addr);
        Ok(())
    }

    /// Number of client transactions still waiting for an outcome
    pub fn pending_transactions(&self) -> usize {
        self.transactions.lock().len()
    }

    fn ensure_usable(&self, source: &TransportAddress) -> NatResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(NatError::Shutdown);
        }
        if !self.bound.lock().contains(source) {
            return Err(NatError::Transaction(format!("{} is not bound", source)));
        }
        Ok(())
    }

    /// Key that protects an outgoing request, resolved from our listeners
    fn outgoing_key(&self, request: &Message) -> NatResult<Option<String>> {
        let Some((username, media)) = request.integrity() else {
            return Ok(None);
        };

        let listeners = self.listeners.read();
        listeners
            .values()
            .find_map(|l| l.remote_key(username, media.unwrap_or("")))
            .map(Some)
            .ok_or_else(|| {
                NatError::Authentication(format!("no remote key for username {}", username))
            })
    }

    fn deliver_request(
        &self,
        request: Message,
        local: TransportAddress,
        remote: TransportAddress,
        key: Option<String>,
    ) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        self.network.count(local.addr, false);

        let Some(username) = request.username().map(str::to_string) else {
            debug!("Dropping request from {} without USERNAME", remote);
            return;
        };

        let listener = self
            .listeners
            .read()
            .get(username_local_part(&username))
            .cloned();

        let Some(listener) = listener else {
            debug!("No listener for username {}, dropping request from {}", username, remote);
            return;
        };

        if let Some(key) = key {
            if listener.local_key(&username).as_deref() != Some(key.as_str()) {
                warn!("MESSAGE-INTEGRITY mismatch for {} from {}", username, remote);
                let response = Message::binding_error(&request, UNAUTHORIZED, "Unauthorized");
                let _ = self.send_response(request.transaction_id, response, local, remote);
                return;
            }
        }

        let event = StunRequestEvent {
            request: request.clone(),
            local_address: local,
            remote_address: remote,
        };

        if let Err(e) = listener.process_request(&event) {
            debug!("Request from {} rejected: {}", remote, e);
            let response = Message::binding_error(&request, BAD_REQUEST, &e.to_string());
            let _ = self.send_response(request.transaction_id, response, local, remote);
        }
    }

    fn deliver_response(
        &self,
        response: Message,
        local: TransportAddress,
        remote: TransportAddress,
    ) {
        let pending = self.transactions.lock().remove(&response.transaction_id);

        let Some(pending) = pending else {
            trace!("Response for unknown transaction {} ignored", response.transaction_id);
            return;
        };
        pending.timer.abort();

        let event = StunResponseEvent {
            request: pending.request,
            response,
            local_address: local,
            remote_address: remote,
        };
        (pending.callback)(TransactionOutcome::Response(event));
    }

    fn expire(&self, transaction_id: TransactionId) {
        let pending = self.transactions.lock().remove(&transaction_id);

        if let Some(pending) = pending {
            if pending.cancelled {
                trace!("Cancelled transaction {} expired", transaction_id);
                return;
            }
            trace!("Transaction {} timed out", transaction_id);
            let event = StunTimeoutEvent {
                request: pending.request,
                local_address: pending.source,
                remote_address: pending.destination,
            };
            (pending.callback)(TransactionOutcome::Timeout(event));
        }
    }
}

impl TransactionService for MemoryStack {
    fn send_request(
        &self,
        request: Message,
        destination: TransportAddress,
        source: TransportAddress,
        policy: RetransmissionPolicy,
        callback: ResponseCallback,
    ) -> NatResult<TransactionId> {
        self.ensure_usable(&source)?;
        let key = self.outgoing_key(&request)?;
        let transaction_id = request.transaction_id;

        let me = self.me.clone();
        let total_wait = policy.total_wait();
        {
            let mut transactions = self.transactions.lock();
            let timer = self.network.handle.spawn(async move {
                tokio::time::sleep(total_wait).await;
                if let Some(stack) = me.upgrade() {
                    stack.expire(transaction_id);
                }
            });
            transactions.insert(
                transaction_id,
                PendingTransaction {
                    request: request.clone(),
                    source,
                    destination,
                    callback,
                    timer,
                    cancelled: false,
                },
            );
        }

        // The simulated network never loses packets on an open path, so a
        // single transmission stands in for the whole retransmission schedule.
        let observed = self.network.observed(source);
        if let Some((peer, target)) = self.network.route(observed, destination) {
            self.network.handle.spawn(async move {
                peer.deliver_request(request, target, observed, key);
            });
        }

        Ok(transaction_id)
    }

    fn send_indication(
        &self,
        indication: Message,
        destination: TransportAddress,
        source: TransportAddress,
    ) -> NatResult<()> {
        self.ensure_usable(&source)?;

        let observed = self.network.observed(source);
        if let Some((_, target)) = self.network.route(observed, destination) {
            trace!("Indication {} -> {}", observed, target);
            self.network.count(target.addr, true);
        }
        drop(indication);
        Ok(())
    }

    fn send_response(
        &self,
        _transaction_id: TransactionId,
        response: Message,
        source: TransportAddress,
        destination: TransportAddress,
    ) -> NatResult<()> {
        self.ensure_usable(&source)?;

        let observed = self.network.observed(source);
        if let Some((peer, target)) = self.network.route(observed, destination) {
            self.network.handle.spawn(async move {
                peer.deliver_response(response, target, observed);
            });
        }
        Ok(())
    }

    fn cancel_transaction(&self, transaction_id: &TransactionId) {
        // Nothing is retransmitted here; the entry stays so that a response
        // already on its way is still delivered until the transaction expires
        if let Some(pending) = self.transactions.lock().get_mut(transaction_id) {
            pending.cancelled = true;
            trace!("Cancelled transaction {}", transaction_id);
        }
    }

    fn register_request_listener(&self, ufrag: &str, listener: Arc<dyn RequestListener>) {
        self.listeners.write().insert(ufrag.to_string(), listener);
    }

    fn unregister_request_listener(&self, ufrag: &str) {
        self.listeners.write().remove(ufrag);
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        for (_, pending) in self.transactions.lock().drain() {
            pending.timer.abort();
        }
        self.listeners.write().clear();

        let bound: Vec<_> = self.bound.lock().drain().collect();
        let mut state = self.network.state.lock();
        for addr in bound {
            state.endpoints.remove(&addr);
        }
        debug!("Stack {} shut down", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::error::StunError;
    use crate::nat::stun::protocol::AttributeValue;
    use crate::nat::stun::transaction::CredentialsAuthority;
    use std::time::Duration;
    use tokio::sync::oneshot;

    /// Answers every request with its source address
    struct Echo {
        stack: Weak<MemoryStack>,
        reject: bool,
    }

    impl CredentialsAuthority for Echo {
        fn local_key(&self, _username: &str) -> Option<String> {
            Some("secret".into())
        }
        fn remote_key(&self, _username: &str, _media: &str) -> Option<String> {
            Some("secret".into())
        }
        fn check_local_user_name(&self, _username: &str) -> bool {
            true
        }
    }

    impl RequestListener for Echo {
        fn process_request(&self, event: &StunRequestEvent) -> NatResult<()> {
            if self.reject {
                return Err(StunError::MissingAttribute("PRIORITY".into()).into());
            }
            let response = Message::binding_success(&event.request, event.remote_address.addr);
            if let Some(stack) = self.stack.upgrade() {
                stack.send_response(
                    event.request.transaction_id,
                    response,
                    event.local_address,
                    event.remote_address,
                )?;
            }
            Ok(())
        }
    }

    fn addr(s: &str) -> TransportAddress {
        TransportAddress::udp(s.parse().unwrap())
    }

    fn request(username: &str) -> Message {
        let mut req = Message::binding_request();
        req.add(AttributeValue::Username(username.into()));
        req
    }

    fn policy() -> RetransmissionPolicy {
        RetransmissionPolicy::new(Duration::from_millis(100), Duration::from_millis(1600), 2)
    }

    fn send(
        stack: &MemoryStack,
        req: Message,
        to: TransportAddress,
        from: TransportAddress,
    ) -> oneshot::Receiver<TransactionOutcome> {
        let (tx, rx) = oneshot::channel();
        stack
            .send_request(req, to, from, policy(), Box::new(move |o| {
                let _ = tx.send(o);
            }))
            .unwrap();
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_response_through_nat() {
        let net = MemoryNetwork::new().unwrap();
        let a = net.stack();
        let b = net.stack();
        let a_addr = addr("192.168.1.10:5000");
        let b_addr = addr("198.51.100.20:6000");
        a.bind(a_addr).unwrap();
        b.bind(b_addr).unwrap();
        net.add_nat_mapping(a_addr.addr, "203.0.113.1:40000".parse().unwrap());
        b.register_request_listener("bbbb", Arc::new(Echo { stack: Arc::downgrade(&b), reject: false }));

        let rx = send(&a, request("bbbb:aaaa"), b_addr, a_addr);
        match rx.await.unwrap() {
            TransactionOutcome::Response(ev) => {
                assert!(ev.response.is_success_response());
                assert_eq!(ev.response.xor_mapped_address(), Some("203.0.113.1:40000".parse().unwrap()));
                assert_eq!(ev.local_address, a_addr);
                assert_eq!(ev.remote_address, b_addr);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(net.requests_received(b_addr.addr), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_path_times_out() {
        let net = MemoryNetwork::new().unwrap();
        let a = net.stack();
        let b = net.stack();
        let a_addr = addr("10.0.0.1:5000");
        let b_addr = addr("10.0.0.2:5000");
        a.bind(a_addr).unwrap();
        b.bind(b_addr).unwrap();
        b.register_request_listener("bbbb", Arc::new(Echo { stack: Arc::downgrade(&b), reject: false }));
        net.block_path(a_addr.addr, b_addr.addr);

        let start = tokio::time::Instant::now();
        let rx = send(&a, request("bbbb:aaaa"), b_addr, a_addr);
        assert!(matches!(rx.await.unwrap(), TransactionOutcome::Timeout(_)));
        assert!(start.elapsed() >= Duration::from_millis(700));
        assert_eq!(a.pending_transactions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_error_answers_bad_request() {
        let net = MemoryNetwork::new().unwrap();
        let a = net.stack();
        let b = net.stack();
        let a_addr = addr("10.0.0.1:5000");
        let b_addr = addr("10.0.0.2:5000");
        a.bind(a_addr).unwrap();
        b.bind(b_addr).unwrap();
        b.register_request_listener("bbbb", Arc::new(Echo { stack: Arc::downgrade(&b), reject: true }));

        let rx = send(&a, request("bbbb:aaaa"), b_addr, a_addr);
        match rx.await.unwrap() {
            TransactionOutcome::Response(ev) => {
                assert_eq!(ev.response.error_code().map(|(c, _)| c), Some(BAD_REQUEST));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_transaction_never_calls_back() {
        let net = MemoryNetwork::new().unwrap();
        let a = net.stack();
        let a_addr = addr("10.0.0.1:5000");
        a.bind(a_addr).unwrap();

        let req = request("nobody:aaaa");
        let tid = req.transaction_id;
        let rx = send(&a, req, addr("10.0.0.9:5000"), a_addr);
        a.cancel_transaction(&tid);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_transaction_still_takes_late_response() {
        let net = MemoryNetwork::new().unwrap();
        let a = net.stack();
        let b = net.stack();
        let a_addr = addr("10.0.0.1:5000");
        let b_addr = addr("10.0.0.2:5000");
        a.bind(a_addr).unwrap();
        b.bind(b_addr).unwrap();
        b.register_request_listener("bbbb", Arc::new(Echo { stack: Arc::downgrade(&b), reject: false }));

        let req = request("bbbb:aaaa");
        let tid = req.transaction_id;
        let rx = send(&a, req, b_addr, a_addr);
        // The request is already in flight
        a.cancel_transaction(&tid);

        match rx.await.unwrap() {
            TransactionOutcome::Response(ev) => assert!(ev.response.is_success_response()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(a.pending_transactions(), 0);
    }

    #[tokio::test]
    async fn test_unbound_source_rejected() {
        let net = MemoryNetwork::new().unwrap();
        let a = net.stack();
        let result = a.send_indication(
            Message::binding_indication(),
            addr("10.0.0.2:5000"),
            addr("10.0.0.1:5000"),
        );
        assert!(matches!(result, Err(NatError::Transaction(_))));
    }

    #[tokio::test]
    async fn test_double_bind_rejected() {
        let net = MemoryNetwork::new().unwrap();
        let a = net.stack();
        let b = net.stack();
        a.bind(addr("10.0.0.1:5000")).unwrap();
        assert!(b.bind(addr("10.0.0.1:5000")).is_err());
    }
}
