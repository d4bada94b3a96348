use crate::mex::FailureType;
use crate::types::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Runtime events — the durable audit trail for every routing decision.
///
/// `CorrelationMatched` / `CorrelationNoMatch` / `InstanceCreated` mirror
/// the correlation outcomes on the message exchange; the rest cover arming,
/// cancellation and reply continuation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RuntimeEvent {
    /// A create-eligible message spawned a new instance.
    InstanceCreated {
        instance_id: Uuid,
        process_id: String,
        mex_id: Uuid,
    },
    /// An inbound message consumed a waiting route.
    CorrelationMatched {
        correlator_id: String,
        instance_id: Uuid,
        mex_id: Uuid,
        /// Key that won; `None` for the default (null-key) route.
        key: Option<CorrelationKey>,
        group_id: String,
    },
    /// No route matched; message persisted with its candidate keys.
    CorrelationNoMatch {
        correlator_id: String,
        mex_id: Uuid,
        keys: Vec<CorrelationKey>,
    },
    /// Instance creation rejected — the process version is retired.
    CreateRejected {
        process_id: String,
        mex_id: Uuid,
    },
    /// Delivery deferred — the process is temporarily disabled.
    DeliveryDeferred {
        process_id: String,
        mex_id: Uuid,
        fire_at: Timestamp,
        attempt: u32,
    },
    /// A receive/pick armed its selectors and (possibly) added routes.
    ReceiveArmed {
        instance_id: Uuid,
        channel: String,
        correlator_ids: Vec<String>,
    },
    /// A pending receive was cancelled (timeout or sibling branch fired).
    ReceiveCancelled {
        instance_id: Uuid,
        channel: String,
    },
    /// All routes of a group were removed after a match.
    RoutesRemoved {
        group_id: String,
        instance_id: Uuid,
    },
    /// A queued message was consumed by a later-armed receive.
    QueuedMessageMatched {
        correlator_id: String,
        instance_id: Uuid,
        mex_id: Uuid,
    },
    /// The instance replied on an exchange.
    ReplySent {
        instance_id: Uuid,
        mex_id: Uuid,
        fault: Option<String>,
    },
    /// The reply targeted an ASYNC exchange; a continuation job carries it.
    AsyncReplyScheduled {
        mex_id: Uuid,
    },
    /// An exchange was failed (unknown endpoint, expiry, abandonment...).
    DeliveryFailed {
        mex_id: Uuid,
        failure_type: FailureType,
        reason: String,
    },
    /// A queued message aged out without ever finding a route.
    QueuedMessageExpired {
        correlator_id: String,
        mex_id: Uuid,
        enqueued_at: Timestamp,
    },
}
