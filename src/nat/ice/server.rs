// src/nat/ice/server.rs
//! Answers inbound connectivity checks (RFC 8445 Section 7.3)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, info, trace};

use super::agent::IceAgent;
use crate::nat::error::{NatResult, StunError};
use crate::nat::stun::protocol::{AttributeValue, Message, ROLE_CONFLICT};
use crate::nat::stun::transaction::{
    username_local_part, CredentialsAuthority, RequestListener, StunRequestEvent,
};

/// Request listener registered under the agent's local ufrag
#[derive(Debug)]
pub(crate) struct ConnectivityCheckServer {
    agent: Weak<IceAgent>,
    started: AtomicBool,
}

impl ConnectivityCheckServer {
    pub(crate) fn new(agent: Weak<IceAgent>) -> Self {
        Self { agent, started: AtomicBool::new(false) }
    }

    /// Start receiving requests addressed to the agent
    pub(crate) fn start(self: &Arc<Self>, agent: &IceAgent) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let listener: Arc<dyn RequestListener> = self.clone();
        agent.service().register_request_listener(agent.local_ufrag(), listener);
        debug!("Agent {} accepts checks for ufrag {}", agent.id(), agent.local_ufrag());
    }

    /// Stop receiving requests
    pub(crate) fn stop(&self, agent: &IceAgent) {
        if self.started.swap(false, Ordering::AcqRel) {
            agent.service().unregister_request_listener(agent.local_ufrag());
        }
    }

    /// Whether the listener is registered
    #[cfg(test)]
    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Resolve a role conflict (RFC 8445 Section 7.3.1.1).
    ///
    /// Returns `false` when the request was answered with 487 and must not
    /// be processed further.
    fn repair_role_conflict(&self, agent: &IceAgent, event: &StunRequestEvent) -> bool {
        let request = &event.request;
        let ours = agent.tie_breaker();

        if agent.is_controlling() {
            let Some(theirs) = request.ice_controlling() else {
                return true;
            };
            if ours >= theirs {
                info!("Role conflict with {}: we stay controlling", event.remote_address);
                self.send_role_conflict(agent, event);
                return false;
            }
            info!("Role conflict with {}: switching to controlled", event.remote_address);
            agent.set_controlling(false);
        } else {
            let Some(theirs) = request.ice_controlled() else {
                return true;
            };
            if ours < theirs {
                info!("Role conflict with {}: we stay controlled", event.remote_address);
                self.send_role_conflict(agent, event);
                return false;
            }
            info!("Role conflict with {}: switching to controlling", event.remote_address);
            agent.set_controlling(true);
        }
        true
    }

    fn send_role_conflict(&self, agent: &IceAgent, event: &StunRequestEvent) {
        let response = Message::binding_error(&event.request, ROLE_CONFLICT, "Role Conflict");
        if let Err(e) = agent.service().send_response(
            event.request.transaction_id,
            response,
            event.local_address,
            event.remote_address,
        ) {
            debug!("Failed to send 487 to {}: {}", event.remote_address, e);
        }
    }
}

impl CredentialsAuthority for ConnectivityCheckServer {
    fn local_key(&self, username: &str) -> Option<String> {
        let agent = self.agent.upgrade()?;
        (username_local_part(username) == agent.local_ufrag()).then(|| agent.local_password().to_string())
    }

    fn remote_key(&self, username: &str, media: &str) -> Option<String> {
        let agent = self.agent.upgrade()?;
        let stream = agent.stream(media)?;

        // Requests we send carry "remote:local"; a bare remote ufrag also
        // resolves to the peer's password
        let bare_remote = !username.contains(':') && stream.remote_ufrag().as_deref() == Some(username);
        if bare_remote || agent.generate_local_user_name(media).as_deref() == Some(username) {
            stream.remote_password()
        } else {
            None
        }
    }

    fn check_local_user_name(&self, username: &str) -> bool {
        self.agent
            .upgrade()
            .map_or(false, |agent| username_local_part(username) == agent.local_ufrag())
    }
}

impl RequestListener for ConnectivityCheckServer {
    fn process_request(&self, event: &StunRequestEvent) -> NatResult<()> {
        let Some(agent) = self.agent.upgrade() else {
            return Ok(());
        };
        let request = &event.request;

        let Some(username) = request.username() else {
            trace!("Check from {} without USERNAME dropped", event.remote_address);
            return Ok(());
        };
        if !self.check_local_user_name(username) {
            trace!("Check from {} for foreign username {} dropped", event.remote_address, username);
            return Ok(());
        }
        let username = username.to_string();

        if !self.repair_role_conflict(&agent, event) {
            return Ok(());
        }

        let priority = request
            .priority()
            .ok_or_else(|| StunError::MissingAttribute("PRIORITY".to_string()))?;
        let use_candidate = request.use_candidate();
        let remote_ufrag = username
            .split_once(':')
            .map(|(_, remote)| remote.to_string())
            .unwrap_or_default();

        agent.incoming_check_received(
            event.remote_address,
            event.local_address,
            priority,
            &remote_ufrag,
            use_candidate,
        );

        let mut response = Message::binding_success(request, event.remote_address.addr);
        response.add(AttributeValue::Username(username.clone()));
        response.add(AttributeValue::MessageIntegrity { username, media: None });

        agent.service().send_response(
            request.transaction_id,
            response,
            event.local_address,
            event.remote_address,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::ice::config::IceConfig;
    use crate::nat::ice::pair::CandidatePairState;
    use crate::nat::stun::memory::MemoryNetwork;
    use crate::nat::stun::transaction::TransactionService;
    use crate::nat::ice::candidate::{Candidate, CandidateKind};
    use crate::nat::transport::{TransportAddress, TransportProtocol};

    fn udp(s: &str) -> TransportAddress {
        TransportAddress::udp(s.parse().unwrap())
    }

    fn new_agent(controlling: bool) -> Arc<IceAgent> {
        let net = MemoryNetwork::new().unwrap();
        let stack = net.stack();
        stack.bind(udp("10.0.0.1:5000")).unwrap();
        let config = IceConfig { controlling, keep_alives: false, ..IceConfig::default() };
        let agent = IceAgent::new(config, stack).unwrap();
        let stream = agent.create_media_stream("audio").unwrap();
        stream.set_remote_credentials("peer", "peerpasswordpeerpassword");
        let component = agent.create_component("audio", TransportProtocol::Udp).unwrap();
        component.add_local_candidate(Candidate::host(udp("10.0.0.1:5000"), 1));
        agent
    }

    fn request(agent: &IceAgent, build: impl FnOnce(&mut Message)) -> StunRequestEvent {
        let mut request = Message::binding_request();
        request.add(AttributeValue::Username(format!("{}:peer", agent.local_ufrag())));
        build(&mut request);
        StunRequestEvent {
            request,
            local_address: udp("10.0.0.1:5000"),
            remote_address: udp("10.0.0.2:6000"),
        }
    }

    #[tokio::test]
    async fn test_credentials() {
        let agent = new_agent(true);
        let server = agent.server();
        let local = format!("{}:peer", agent.local_ufrag());

        assert_eq!(server.local_key(&local).as_deref(), Some(agent.local_password()));
        assert!(server.local_key("someoneelse:peer").is_none());
        assert!(server.check_local_user_name(&local));
        assert!(!server.check_local_user_name("someoneelse"));

        let outgoing = format!("peer:{}", agent.local_ufrag());
        assert_eq!(server.remote_key(&outgoing, "audio").as_deref(), Some("peerpasswordpeerpassword"));
        assert_eq!(server.remote_key("peer", "audio").as_deref(), Some("peerpasswordpeerpassword"));
        assert!(server.remote_key(&outgoing, "video").is_none());
        assert!(server.remote_key("stranger:x", "audio").is_none());
    }

    #[tokio::test]
    async fn test_missing_priority_is_rejected() {
        let agent = new_agent(false);
        let event = request(&agent, |_| {});
        let err = agent.server().process_request(&event).unwrap_err();
        assert!(err.to_string().contains("PRIORITY"));
        assert_eq!(agent.pre_discovered_count(), 0);
    }

    #[tokio::test]
    async fn test_foreign_username_is_ignored() {
        let agent = new_agent(false);
        let mut event = request(&agent, |_| {});
        event.request.attributes.clear();
        event.request.add(AttributeValue::Username("stranger:peer".into()));
        event.request.add(AttributeValue::Priority(1));
        assert!(agent.server().process_request(&event).is_ok());
        assert_eq!(agent.pre_discovered_count(), 0);
    }

    fn with_role_attribute(agent: &IceAgent, attr: AttributeValue) -> StunRequestEvent {
        request(agent, |m| {
            m.add(AttributeValue::Priority(1_845_501_695));
            m.add(attr);
        })
    }

    #[tokio::test]
    async fn test_role_conflict_while_controlling() {
        // Larger tie-breaker on their side: switch to controlled
        let agent = new_agent(true);
        agent.set_tie_breaker(10);
        let event = with_role_attribute(&agent, AttributeValue::IceControlling(20));
        agent.server().process_request(&event).unwrap();
        assert!(!agent.is_controlling());
        assert_eq!(agent.pre_discovered_count(), 1);

        // Ours is at least theirs: stay controlling, answer 487
        let agent = new_agent(true);
        agent.set_tie_breaker(20);
        let event = with_role_attribute(&agent, AttributeValue::IceControlling(20));
        agent.server().process_request(&event).unwrap();
        assert!(agent.is_controlling());
        assert_eq!(agent.pre_discovered_count(), 0);
    }

    #[tokio::test]
    async fn test_role_conflict_while_controlled() {
        // Ours is at least theirs: switch to controlling
        let agent = new_agent(false);
        agent.set_tie_breaker(20);
        let event = with_role_attribute(&agent, AttributeValue::IceControlled(20));
        agent.server().process_request(&event).unwrap();
        assert!(agent.is_controlling());
        assert_eq!(agent.pre_discovered_count(), 1);

        // Theirs is larger: stay controlled, answer 487
        let agent = new_agent(false);
        agent.set_tie_breaker(10);
        let event = with_role_attribute(&agent, AttributeValue::IceControlled(20));
        agent.server().process_request(&event).unwrap();
        assert!(!agent.is_controlling());
        assert_eq!(agent.pre_discovered_count(), 0);
    }

    #[tokio::test]
    async fn test_no_conflict_when_roles_differ() {
        let agent = new_agent(false);
        agent.set_tie_breaker(10);
        let event = with_role_attribute(&agent, AttributeValue::IceControlling(20));
        agent.server().process_request(&event).unwrap();
        assert!(!agent.is_controlling());
        assert_eq!(agent.pre_discovered_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_before_start_is_queued() {
        let agent = new_agent(false);
        let event = request(&agent, |m| {
            m.add(AttributeValue::Priority(1_845_501_695));
            m.add(AttributeValue::IceControlling(1));
            m.add(AttributeValue::UseCandidate);
        });
        agent.server().process_request(&event).unwrap();
        assert_eq!(agent.pre_discovered_count(), 1);
        assert!(agent.find_remote_candidate(&udp("10.0.0.2:6000")).is_none());

        agent
            .stream("audio")
            .unwrap()
            .component(1)
            .unwrap()
            .add_remote_candidate(Candidate::remote(
                udp("10.0.0.3:6000"),
                CandidateKind::Host,
                1,
                "1",
                2_130_706_431,
            ));
        agent.start_connectivity_establishment().unwrap();
        assert_eq!(agent.pre_discovered_count(), 0);

        let remote = agent
            .find_remote_candidate(&udp("10.0.0.2:6000"))
            .expect("peer reflexive remote candidate");
        assert_eq!(remote.priority, 1_845_501_695);
        assert_eq!(remote.ufrag.as_deref(), Some("peer"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_after_start_triggers_a_check() {
        let agent = new_agent(false);
        agent
            .stream("audio")
            .unwrap()
            .component(1)
            .unwrap()
            .add_remote_candidate(Candidate::remote(
                udp("10.0.0.2:6000"),
                CandidateKind::Host,
                1,
                "1",
                2_130_706_431,
            ));
        agent.start_connectivity_establishment().unwrap();

        let event = request(&agent, |m| {
            m.add(AttributeValue::Priority(1_845_501_695));
            m.add(AttributeValue::IceControlling(1));
            m.add(AttributeValue::UseCandidate);
        });
        agent.server().process_request(&event).unwrap();

        let stream = agent.stream("audio").unwrap();
        let pair = stream
            .find_candidate_pair(&udp("10.0.0.1:5000"), &udp("10.0.0.2:6000"))
            .expect("pair");
        assert!(pair.use_candidate_received());
        assert_eq!(pair.state(), CandidatePairState::Waiting);
        assert_eq!(stream.check_list().triggered_len(), 1);
    }

    #[tokio::test]
    async fn test_stop_unregisters() {
        let agent = new_agent(false);
        assert!(agent.server().is_started());
        agent.server().stop(&agent);
        assert!(!agent.server().is_started());
        agent.service().shutdown();
    }
}
