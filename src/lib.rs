//! SHARP ICE library (lib.rs)
//!
//! Connectivity establishment core of Interactive Connectivity Establishment
//! (RFC 8445): candidate pairing, paced connectivity checks, role conflict
//! repair, nomination and consent freshness.
//!
//! The crate does not open sockets. An [`IceAgent`] drives STUN Binding
//! transactions through a [`TransactionService`]; [`MemoryNetwork`] provides
//! an in-process implementation with NAT mappings and path loss.
//!
//! ```no_run
//! use sharp_ice::{IceAgent, IceConfig, MemoryNetwork};
//!
//! # async fn run() -> sharp_ice::NatResult<()> {
//! let network = MemoryNetwork::new()?;
//! let agent = IceAgent::new(IceConfig::default(), network.stack())?;
//! let stream = agent.create_media_stream("audio")?;
//! # let _ = stream;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// NAT traversal core
pub mod nat;

// Re-export main types
pub use nat::ice::{
    Candidate, CandidateKind, CandidatePair, CandidatePairState, CandidateType, CheckListState,
    Component, ConsentConfig, IceAgent, IceConfig, IceEvent, IceMediaStream, IceProcessingState,
    NominationStrategy, PairRef,
};
pub use nat::stun::{MemoryNetwork, MemoryStack, TransactionService};
pub use nat::transport::{TransportAddress, TransportProtocol};

// Re-export error types
pub use nat::error::{NatError, NatResult, StunError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system with custom configuration
///
/// `RUST_LOG` takes precedence over `level`.
///
/// # Arguments
/// * `level` - Log level (trace/debug/info/warn/error)
///
/// # Example
/// ```
/// sharp_ice::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let mut filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // Reduce verbosity of the runtime
    if let Ok(directive) = "tokio=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let result = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true),
        )
        .with(filter)
        .try_init();

    if result.is_err() {
        tracing::debug!("Logging already initialized");
    }
}
