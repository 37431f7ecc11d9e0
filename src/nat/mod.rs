// src/nat/mod.rs
//! NAT traversal core: ICE connectivity establishment over a logical STUN
//! transaction layer.
//!
//! - [`ice`]: agents, check lists, pairs, nomination and keep-alives
//! - [`stun`]: Binding messages and the transaction service the ICE core
//!   drives, with an in-memory implementation for tests and simulations
//! - [`transport`]: transport addresses and reachability rules
//! - [`error`]: error types shared by all of the above

pub mod error;
pub mod ice;
pub mod stun;
pub mod transport;

pub use error::{NatError, NatResult, StunError};
pub use transport::{TransportAddress, TransportProtocol};
