// src/nat/stun/mod.rs
//! Logical STUN layer for ICE connectivity checks.
//!
//! - [`protocol`]: Binding messages with typed ICE attributes
//! - [`transaction`]: the transaction service contract the ICE core relies on
//! - [`memory`]: an in-process transaction service with NAT and loss simulation

pub mod memory;
pub mod protocol;
pub mod transaction;

pub use memory::{MemoryNetwork, MemoryStack};
pub use protocol::{
    Attribute, AttributeType, AttributeValue, Message, MessageClass, MessageType,
    TransactionId, BAD_REQUEST, ROLE_CONFLICT, UNAUTHORIZED,
};
pub use transaction::{
    CredentialsAuthority, RequestListener, ResponseCallback, RetransmissionPolicy,
    StunRequestEvent, StunResponseEvent, StunTimeoutEvent, TransactionOutcome,
    TransactionService,
};
