// src/nat/stun/protocol.rs
//! Logical STUN Binding messages used by ICE connectivity checks.
//!
//! Messages are kept as typed attribute lists; encoding to bytes belongs to
//! whatever transaction service carries them.

use std::fmt;
use std::net::SocketAddr;

use rand::RngCore;

/// ERROR-CODE for a role conflict (RFC 8445 Section 7.2.5.1)
pub const ROLE_CONFLICT: u16 = 487;

/// ERROR-CODE for a malformed request
pub const BAD_REQUEST: u16 = 400;

/// ERROR-CODE for failed credentials
pub const UNAUTHORIZED: u16 = 401;

/// STUN message types (RFC 8489 Section 3), Binding method only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// Binding request
    BindingRequest = 0x0001,
    /// Binding indication
    BindingIndication = 0x0011,
    /// Binding success response
    BindingResponse = 0x0101,
    /// Binding error response
    BindingError = 0x0111,
}

impl MessageType {
    /// Get message class (request, indication, response, error)
    pub fn class(&self) -> MessageClass {
        match (*self as u16) & 0x0110 {
            0x0000 => MessageClass::Request,
            0x0010 => MessageClass::Indication,
            0x0100 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }

    /// Get message method
    pub fn method(&self) -> u16 {
        let value = *self as u16;
        (value & 0x000F) | ((value & 0x00E0) >> 1) | ((value & 0x3E00) >> 2)
    }
}

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Request
    Request,
    /// Indication
    Indication,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
}

/// STUN attribute types carried by ICE checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum AttributeType {
    /// USERNAME
    Username = 0x0006,
    /// MESSAGE-INTEGRITY
    MessageIntegrity = 0x0008,
    /// ERROR-CODE
    ErrorCode = 0x0009,
    /// XOR-MAPPED-ADDRESS
    XorMappedAddress = 0x0020,
    /// PRIORITY (RFC 8445 Section 16.1)
    Priority = 0x0024,
    /// USE-CANDIDATE (RFC 8445 Section 16.1)
    UseCandidate = 0x0025,
    /// ICE-CONTROLLED
    IceControlled = 0x8029,
    /// ICE-CONTROLLING
    IceControlling = 0x802A,
}

impl AttributeType {
    /// Check if attribute is comprehension-required
    pub fn is_comprehension_required(&self) -> bool {
        (*self as u16) < 0x8000
    }
}

/// Typed attribute payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// Short-term credential username
    Username(String),
    /// Integrity over the message, keyed by the password that
    /// `username` (and optionally the media name) resolves to
    MessageIntegrity {
        /// Username used to look up the key
        username: String,
        /// Media stream whose remote password keys the HMAC, if any
        media: Option<String>,
    },
    /// Error code with reason phrase
    ErrorCode {
        /// Numeric code
        code: u16,
        /// Reason phrase
        reason: String,
    },
    /// Reflexive transport address of the requester
    XorMappedAddress(SocketAddr),
    /// Priority the requester would give a peer-reflexive candidate
    Priority(u32),
    /// Nomination flag, no value
    UseCandidate,
    /// Tie-breaker of a controlled agent
    IceControlled(u64),
    /// Tie-breaker of a controlling agent
    IceControlling(u64),
}

impl AttributeValue {
    /// Attribute type this payload encodes as
    pub fn attr_type(&self) -> AttributeType {
        match self {
            AttributeValue::Username(_) => AttributeType::Username,
            AttributeValue::MessageIntegrity { .. } => AttributeType::MessageIntegrity,
            AttributeValue::ErrorCode { .. } => AttributeType::ErrorCode,
            AttributeValue::XorMappedAddress(_) => AttributeType::XorMappedAddress,
            AttributeValue::Priority(_) => AttributeType::Priority,
            AttributeValue::UseCandidate => AttributeType::UseCandidate,
            AttributeValue::IceControlled(_) => AttributeType::IceControlled,
            AttributeValue::IceControlling(_) => AttributeType::IceControlling,
        }
    }
}

/// STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute type
    pub attr_type: AttributeType,
    /// Attribute payload
    pub value: AttributeValue,
}

impl Attribute {
    /// Create attribute from its payload
    pub fn new(value: AttributeValue) -> Self {
        Self { attr_type: value.attr_type(), value }
    }
}

/// STUN transaction ID (96 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate a new random transaction ID
    pub fn new() -> Self {
        let mut id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type
    pub message_type: MessageType,
    /// Transaction ID
    pub transaction_id: TransactionId,
    /// Attributes in insertion order
    pub attributes: Vec<Attribute>,
}

impl Message {
    /// Create new STUN message
    pub fn new(message_type: MessageType, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// New Binding request with a fresh transaction ID
    pub fn binding_request() -> Self {
        Self::new(MessageType::BindingRequest, TransactionId::new())
    }

    /// New Binding indication with a fresh transaction ID
    pub fn binding_indication() -> Self {
        Self::new(MessageType::BindingIndication, TransactionId::new())
    }

    /// Success response answering `request`, reporting `mapped` as the
    /// requester's reflexive address
    pub fn binding_success(request: &Message, mapped: SocketAddr) -> Self {
        let mut response = Self::new(MessageType::BindingResponse, request.transaction_id);
        response.add(AttributeValue::XorMappedAddress(mapped));
        response
    }

    /// Error response answering `request`
    pub fn binding_error(request: &Message, code: u16, reason: &str) -> Self {
        let mut response = Self::new(MessageType::BindingError, request.transaction_id);
        response.add(AttributeValue::ErrorCode { code, reason: reason.to_string() });
        response
    }

    /// Add attribute to message
    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// Add attribute from its payload
    pub fn add(&mut self, value: AttributeValue) {
        self.add_attribute(Attribute::new(value));
    }

    /// Get attribute by type
    pub fn get_attribute(&self, attr_type: AttributeType) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }

    /// Whether an attribute of this type is present
    pub fn has_attribute(&self, attr_type: AttributeType) -> bool {
        self.get_attribute(attr_type).is_some()
    }

    /// Message class
    pub fn class(&self) -> MessageClass {
        self.message_type.class()
    }

    /// Whether this is an error response
    pub fn is_error_response(&self) -> bool {
        self.class() == MessageClass::ErrorResponse
    }

    /// Whether this is a success response
    pub fn is_success_response(&self) -> bool {
        self.class() == MessageClass::SuccessResponse
    }

    /// USERNAME value
    pub fn username(&self) -> Option<&str> {
        match self.get_attribute(AttributeType::Username).map(|a| &a.value) {
            Some(AttributeValue::Username(u)) => Some(u.as_str()),
            _ => None,
        }
    }

    /// PRIORITY value
    pub fn priority(&self) -> Option<u32> {
        match self.get_attribute(AttributeType::Priority).map(|a| &a.value) {
            Some(AttributeValue::Priority(p)) => Some(*p),
            _ => None,
        }
    }

    /// Whether USE-CANDIDATE is present
    pub fn use_candidate(&self) -> bool {
        self.has_attribute(AttributeType::UseCandidate)
    }

    /// ICE-CONTROLLING tie-breaker
    pub fn ice_controlling(&self) -> Option<u64> {
        match self.get_attribute(AttributeType::IceControlling).map(|a| &a.value) {
            Some(AttributeValue::IceControlling(t)) => Some(*t),
            _ => None,
        }
    }

    /// ICE-CONTROLLED tie-breaker
    pub fn ice_controlled(&self) -> Option<u64> {
        match self.get_attribute(AttributeType::IceControlled).map(|a| &a.value) {
            Some(AttributeValue::IceControlled(t)) => Some(*t),
            _ => None,
        }
    }

    /// XOR-MAPPED-ADDRESS value
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        match self.get_attribute(AttributeType::XorMappedAddress).map(|a| &a.value) {
            Some(AttributeValue::XorMappedAddress(addr)) => Some(*addr),
            _ => None,
        }
    }

    /// ERROR-CODE as (code, reason)
    pub fn error_code(&self) -> Option<(u16, &str)> {
        match self.get_attribute(AttributeType::ErrorCode).map(|a| &a.value) {
            Some(AttributeValue::ErrorCode { code, reason }) => Some((*code, reason.as_str())),
            _ => None,
        }
    }

    /// MESSAGE-INTEGRITY key reference as (username, media)
    pub fn integrity(&self) -> Option<(&str, Option<&str>)> {
        match self.get_attribute(AttributeType::MessageIntegrity).map(|a| &a.value) {
            Some(AttributeValue::MessageIntegrity { username, media }) => {
                Some((username.as_str(), media.as_deref()))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_class() {
        assert_eq!(MessageType::BindingRequest.class(), MessageClass::Request);
        assert_eq!(MessageType::BindingIndication.class(), MessageClass::Indication);
        assert_eq!(MessageType::BindingResponse.class(), MessageClass::SuccessResponse);
        assert_eq!(MessageType::BindingError.class(), MessageClass::ErrorResponse);
        assert_eq!(MessageType::BindingError.method(), 0x0001);
    }

    #[test]
    fn test_typed_getters() {
        let mut req = Message::binding_request();
        req.add(AttributeValue::Priority(1_845_501_695));
        req.add(AttributeValue::IceControlling(42));
        req.add(AttributeValue::UseCandidate);
        req.add(AttributeValue::Username("remote:local".into()));

        assert_eq!(req.priority(), Some(1_845_501_695));
        assert_eq!(req.ice_controlling(), Some(42));
        assert_eq!(req.ice_controlled(), None);
        assert!(req.use_candidate());
        assert_eq!(req.username(), Some("remote:local"));
        assert!(!AttributeType::IceControlling.is_comprehension_required());
        assert!(AttributeType::Priority.is_comprehension_required());
    }

    #[test]
    fn test_responses_keep_transaction_id() {
        let req = Message::binding_request();
        let mapped: SocketAddr = "203.0.113.10:40000".parse().unwrap();

        let ok = Message::binding_success(&req, mapped);
        assert_eq!(ok.transaction_id, req.transaction_id);
        assert!(ok.is_success_response());
        assert_eq!(ok.xor_mapped_address(), Some(mapped));

        let err = Message::binding_error(&req, ROLE_CONFLICT, "Role Conflict");
        assert!(err.is_error_response());
        assert_eq!(err.error_code(), Some((487, "Role Conflict")));
    }

    #[test]
    fn test_transaction_ids_are_unique() {
        let a = TransactionId::new();
        let b = TransactionId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 24);
    }
}
