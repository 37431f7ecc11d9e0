// src/nat/stun/transaction.rs
//! Transaction service abstraction consumed by the ICE core.
//!
//! The ICE engine never touches sockets. It hands Binding requests and
//! indications to a [`TransactionService`], which retransmits, correlates
//! responses and reports either a response or a timeout through a one-shot
//! callback carrying whatever payload the caller captured.

use std::sync::Arc;
use std::time::Duration;

use super::protocol::{Message, TransactionId};
use crate::nat::error::NatResult;
use crate::nat::transport::TransportAddress;

/// Retransmission schedule for one client transaction (RFC 8489 Section 6.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmissionPolicy {
    /// Wait before the first retransmission
    pub initial_wait: Duration,
    /// Upper bound for the doubling wait
    pub max_wait: Duration,
    /// Number of retransmissions after the initial send
    pub max_retransmissions: u32,
}

impl RetransmissionPolicy {
    /// Create a policy
    pub fn new(initial_wait: Duration, max_wait: Duration, max_retransmissions: u32) -> Self {
        Self { initial_wait, max_wait, max_retransmissions }
    }

    /// Same schedule without retransmissions, for reliable transports
    pub fn without_retransmissions(self) -> Self {
        Self { max_retransmissions: 0, ..self }
    }

    /// Wait that follows transmission number `attempt` (0 = initial send)
    pub fn wait_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_wait.saturating_mul(factor).min(self.max_wait)
    }

    /// Time from the initial send until the transaction times out
    pub fn total_wait(&self) -> Duration {
        (0..=self.max_retransmissions)
            .map(|attempt| self.wait_after(attempt))
            .fold(Duration::ZERO, |acc, w| acc.saturating_add(w))
    }
}

/// Inbound request as delivered to a [`RequestListener`]
#[derive(Debug, Clone)]
pub struct StunRequestEvent {
    /// The request
    pub request: Message,
    /// Local address the request arrived on
    pub local_address: TransportAddress,
    /// Address the request came from
    pub remote_address: TransportAddress,
}

/// Response correlated with an outstanding request
#[derive(Debug, Clone)]
pub struct StunResponseEvent {
    /// The request that was sent
    pub request: Message,
    /// The response that answered it
    pub response: Message,
    /// Local address the response arrived on
    pub local_address: TransportAddress,
    /// Address the response came from
    pub remote_address: TransportAddress,
}

/// Request that was never answered
#[derive(Debug, Clone)]
pub struct StunTimeoutEvent {
    /// The request that was sent
    pub request: Message,
    /// Local address the request was sent from
    pub local_address: TransportAddress,
    /// Address the request was sent to
    pub remote_address: TransportAddress,
}

/// Result of a client transaction
#[derive(Debug, Clone)]
pub enum TransactionOutcome {
    /// A success or error response arrived
    Response(StunResponseEvent),
    /// Retransmissions were exhausted
    Timeout(StunTimeoutEvent),
}

/// One-shot completion callback; a cancelled transaction only invokes it
/// for a response that still arrives
pub type ResponseCallback = Box<dyn FnOnce(TransactionOutcome) + Send + 'static>;

/// Short-term credential lookups used to key MESSAGE-INTEGRITY
pub trait CredentialsAuthority: Send + Sync {
    /// Password protecting requests addressed to `username`, if it is ours
    fn local_key(&self, username: &str) -> Option<String>;

    /// Password of the peer for requests we send under `username`
    fn remote_key(&self, username: &str, media: &str) -> Option<String>;

    /// Whether `username` names this session as the recipient
    fn check_local_user_name(&self, username: &str) -> bool;
}

/// Handler for inbound requests.
///
/// Returning an error makes the service answer with 400 (Bad Request).
pub trait RequestListener: CredentialsAuthority {
    /// Process one inbound request; the listener sends its own response
    fn process_request(&self, event: &StunRequestEvent) -> NatResult<()>;
}

/// Transport-independent STUN transaction layer
pub trait TransactionService: Send + Sync {
    /// Start a client transaction; `callback` fires once with the outcome
    fn send_request(
        &self,
        request: Message,
        destination: TransportAddress,
        source: TransportAddress,
        policy: RetransmissionPolicy,
        callback: ResponseCallback,
    ) -> NatResult<TransactionId>;

    /// Send a fire-and-forget indication
    fn send_indication(
        &self,
        indication: Message,
        destination: TransportAddress,
        source: TransportAddress,
    ) -> NatResult<()>;

    /// Answer a server transaction
    fn send_response(
        &self,
        transaction_id: TransactionId,
        response: Message,
        source: TransportAddress,
        destination: TransportAddress,
    ) -> NatResult<()>;

    /// Stop retransmitting a client transaction. A response arriving before
    /// the transaction expires is still delivered; expiry is silent.
    fn cancel_transaction(&self, transaction_id: &TransactionId);

    /// Route requests whose USERNAME starts with `ufrag` to `listener`
    fn register_request_listener(&self, ufrag: &str, listener: Arc<dyn RequestListener>);

    /// Stop routing requests for `ufrag`
    fn unregister_request_listener(&self, ufrag: &str);

    /// Cancel everything and release endpoints
    fn shutdown(&self);
}

/// Local part of a `local:remote` username (the whole string without a colon)
pub fn username_local_part(username: &str) -> &str {
    username.split_once(':').map(|(l, _)| l).unwrap_or(username)
}
