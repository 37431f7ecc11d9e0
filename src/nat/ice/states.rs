// src/nat/ice/states.rs
//! ICE processing states and the event bus that reports transitions.
//!
//! Handlers registered with [`EventBus::subscribe`] run synchronously, before
//! the call that caused the transition returns; the nominator relies on that
//! ordering. Asynchronous observers can take a broadcast receiver instead.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::trace;

use super::pair::{CandidatePairState, PairRef};

/// Capacity of the broadcast channel for asynchronous observers
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Overall ICE processing state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IceProcessingState {
    /// Created, checks not started
    Waiting,
    /// Connectivity checks in progress
    Running,
    /// Every stream has a selected pair per component
    Completed,
    /// Connectivity could not be established
    Failed,
    /// Done and no longer checking; keep-alives may still run
    Terminated,
}

impl IceProcessingState {
    /// Whether processing has finished one way or another
    pub fn is_over(&self) -> bool {
        matches!(
            self,
            IceProcessingState::Completed
                | IceProcessingState::Terminated
                | IceProcessingState::Failed
        )
    }

    /// Whether checks have started and are still meaningful
    pub fn is_established_or_running(&self) -> bool {
        !matches!(
            self,
            IceProcessingState::Waiting
                | IceProcessingState::Completed
                | IceProcessingState::Terminated
        )
    }
}

impl fmt::Display for IceProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IceProcessingState::Waiting => "Waiting",
            IceProcessingState::Running => "Running",
            IceProcessingState::Completed => "Completed",
            IceProcessingState::Failed => "Failed",
            IceProcessingState::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

/// ICE check list state per RFC 8445
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckListState {
    /// Check list is running
    Running,
    /// Check list has completed successfully
    Completed,
    /// Check list has failed
    Failed,
}

impl CheckListState {
    /// Completed and failed lists never change again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CheckListState::Running)
    }
}

/// Typed notification of a state change
#[derive(Debug, Clone)]
pub enum IceEvent {
    /// Agent processing state changed
    ProcessingStateChanged {
        /// Previous state
        old: IceProcessingState,
        /// New state
        new: IceProcessingState,
    },
    /// A stream's check list changed state
    CheckListStateChanged {
        /// Stream name
        stream: String,
        /// Previous state
        old: CheckListState,
        /// New state
        new: CheckListState,
    },
    /// A stream's pacemaker found nothing left to check
    EndOfOrdinaryChecks {
        /// Stream name
        stream: String,
    },
    /// Candidate pair state changed
    PairStateChanged {
        /// The pair
        pair: PairRef,
        /// Previous state
        old: CandidatePairState,
        /// New state
        new: CandidatePairState,
    },
    /// Pair was nominated
    PairNominated {
        /// The pair
        pair: PairRef,
    },
    /// Pair entered the valid list
    PairValidated {
        /// The pair
        pair: PairRef,
    },
    /// Consent freshness of a pair was refreshed
    ConsentFreshnessChanged {
        /// The pair
        pair: PairRef,
        /// Previous timestamp
        old: Option<Instant>,
        /// New timestamp
        new: Option<Instant>,
    },
    /// A consent check on a selected pair went unanswered
    ConsentLost {
        /// The pair
        pair: PairRef,
    },
}

impl IceEvent {
    /// Pair the event is about, if any
    pub fn pair(&self) -> Option<&PairRef> {
        match self {
            IceEvent::PairStateChanged { pair, .. }
            | IceEvent::PairNominated { pair }
            | IceEvent::PairValidated { pair }
            | IceEvent::ConsentFreshnessChanged { pair, .. }
            | IceEvent::ConsentLost { pair } => Some(pair),
            _ => None,
        }
    }
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Synchronous event handler
pub type EventHandler = Arc<dyn Fn(&IceEvent) + Send + Sync>;

/// Registry of event handlers plus a broadcast channel
pub struct EventBus {
    handlers: RwLock<Vec<(HandlerId, EventHandler)>>,
    next_id: AtomicU64,
    channel: broadcast::Sender<IceEvent>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            channel,
        }
    }

    /// Register a synchronous handler
    pub fn subscribe(&self, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    /// Remove a handler; returns whether it was registered
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    /// Receiver for asynchronous observers
    pub fn subscribe_channel(&self) -> broadcast::Receiver<IceEvent> {
        self.channel.subscribe()
    }

    /// Deliver an event to every handler, then to channel subscribers.
    ///
    /// Handlers are snapshotted first, so a handler may subscribe,
    /// unsubscribe or emit without deadlocking.
    pub fn emit(&self, event: IceEvent) {
        trace!("Event: {:?}", event);
        let handlers: Vec<EventHandler> =
            self.handlers.read().iter().map(|(_, h)| h.clone()).collect();

        for handler in handlers {
            handler(&event);
        }

        // No receivers is not an error
        let _ = self.channel.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}
