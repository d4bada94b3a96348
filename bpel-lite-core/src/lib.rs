//! bpel-lite-core: correlation-based message routing for BPEL-style
//! process engines
//!
//! This crate contains the routing layer that sits between a transport
//! binding and a process-instance executor:
//! - `CorrelationKey` computation from message payloads via property
//!   aliases (declaration-order, deterministic)
//! - The per-(partner link, operation) correlator: persisted routes and
//!   queued messages, matched symmetrically
//! - `MessageExchange` lifecycle (NEW → REQUEST → ONE_WAY/ASYNC →
//!   RESPONSE/FAULT/FAILURE)
//! - `OutstandingRequestManager` pairing receives with replies inside one
//!   instance, with conflictingReceive detection
//! - The `Router` itself: instance creation, route matching, message
//!   queueing, deferral for disabled processes, expiry sweeps
//!
//! Persistence goes through the [`store::EngineStore`] port;
//! [`store_memory::MemoryStore`] is the in-process implementation used by
//! tests and single-node deployments. Instance execution is out of scope:
//! the router hands resumptions and async replies to a job scheduler.

pub mod config;
pub mod correlation;
pub mod error;
pub mod events;
pub mod mex;
pub mod outstanding;
pub mod router;
pub mod store;
pub mod store_memory;
pub mod types;

pub use config::EngineConfig;
pub use correlation::{compute_candidate_keys, compute_correlation_key, extract_property};
pub use error::{CorrelationError, EngineError, ProcessFault};
pub use events::RuntimeEvent;
pub use mex::{CorrelationStatus, FailureType, MessageExchange, MexFailure, MexStatus};
pub use outstanding::OutstandingRequestManager;
pub use router::{Router, RoutingOutcome, SelectOutcome};
pub use store::EngineStore;
pub use store_memory::MemoryStore;
pub use types::{
    CorrelationKey, CorrelationSetDef, CorrelationSetId, Job, JobKind, MexPattern, OperationDef,
    PartnerLinkDef, PartnerLinkInstance, ProcessDef, ProcessInstance, ProcessLifecycle,
    PropertyAliasDef, QueuedMessage, Route, Selector,
};
