// src/nat/error.rs
//! Error types for the ICE core and the logical STUN layer beneath it

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by ICE agent operations
#[derive(Debug, Error)]
pub enum NatError {
    /// STUN protocol errors
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// Timeout errors
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Authentication failure
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The transaction service refused or lost a transaction
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// No media stream with this name
    #[error("Unknown media stream: {0}")]
    UnknownStream(String),

    /// The agent or transaction service has been shut down
    #[error("Shut down")]
    Shutdown,
}

/// STUN-level errors for binding transactions
#[derive(Debug, Error)]
pub enum StunError {
    /// Missing required attribute
    #[error("Missing required attribute: {0}")]
    MissingAttribute(String),

    /// Malformed or unexpected message
    #[error("Malformed STUN message: {0}")]
    MalformedMessage(String),

    /// STUN error response
    #[error("STUN error response: {code} - {reason}")]
    ErrorResponse {
        /// Error code (e.g. 487)
        code: u16,
        /// Reason phrase
        reason: String,
    },

    /// Response arrived on a different address pair than the request used
    #[error("Asymmetric response: expected {expected_local}<-{expected_remote}, got {local}<-{remote}")]
    AsymmetricResponse {
        /// Address the request was sent from
        expected_local: SocketAddr,
        /// Address the request was sent to
        expected_remote: SocketAddr,
        /// Address the response was received on
        local: SocketAddr,
        /// Address the response came from
        remote: SocketAddr,
    },

    /// No outstanding transaction with this id
    #[error("Unknown transaction")]
    UnknownTransaction,

    /// MESSAGE-INTEGRITY could not be verified
    #[error("MESSAGE-INTEGRITY check failed")]
    IntegrityCheckFailed,
}

/// Result type for NAT operations
pub type NatResult<T> = Result<T, NatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stun_error_converts() {
        let err: NatError = StunError::MissingAttribute("PRIORITY".into()).into();
        assert!(matches!(err, NatError::Stun(StunError::MissingAttribute(_))));
        assert_eq!(err.to_string(), "STUN error: Missing required attribute: PRIORITY");
    }

    #[test]
    fn test_error_response_display() {
        let err = StunError::ErrorResponse { code: 487, reason: "Role Conflict".into() };
        assert_eq!(err.to_string(), "STUN error response: 487 - Role Conflict");
    }
}
