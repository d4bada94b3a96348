use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Declared correlation set identifier (compile-time constant).
pub type CorrelationSetId = i32;

/// Index of a selector within an arming pick/receive.
pub type RouteIndex = u32;

/// Sentinel set id used for opaque (session-identifier) correlation —
/// messages matched by stateful endpoint addressing rather than any
/// declared correlation set.
pub const OPAQUE_CORRELATION_SET: CorrelationSetId = -1;

pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ─── Correlation key ──────────────────────────────────────────

/// The concrete property values extracted for one correlation set from one
/// specific message. Pure value type: equal iff `set_id` and `values` are
/// element-wise equal. Never mutated after construction, safe to hash,
/// compare and persist as a lookup token.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationKey {
    pub set_id: CorrelationSetId,
    pub values: Vec<String>,
}

impl CorrelationKey {
    pub fn new(set_id: CorrelationSetId, values: Vec<String>) -> Self {
        Self { set_id, values }
    }

    /// Key synthesized from a session/conversation identifier, used when no
    /// declared correlation set captures the conversation.
    pub fn opaque(session_id: &str) -> Self {
        Self {
            set_id: OPAQUE_CORRELATION_SET,
            values: vec![session_id.to_string()],
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.set_id, self.values.join("~"))
    }
}

// ─── Correlation set declarations (compiled, immutable) ───────

/// How to extract one property's value from a message of a given type.
/// The location is a dot-path into the canonical JSON payload; the full
/// expression-language machinery lives outside the routing core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PropertyAliasDef {
    pub location: String,
}

/// A declared correlation set: identifier, ordered property names, and the
/// per-message-type aliases for extracting each property. Owned by the
/// compiled process definition; immutable at run time.
#[derive(Clone, Debug)]
pub struct CorrelationSetDef {
    pub set_id: CorrelationSetId,
    pub name: String,
    /// Qualified property names, in declaration order. Key values are
    /// collected in this order.
    pub properties: Vec<String>,
    /// (property name, message type) → alias.
    pub aliases: BTreeMap<(String, String), PropertyAliasDef>,
}

impl CorrelationSetDef {
    pub fn alias(&self, property: &str, message_type: &str) -> Option<&PropertyAliasDef> {
        self.aliases
            .get(&(property.to_string(), message_type.to_string()))
    }
}

// ─── Process / partner-link / operation definitions ───────────

/// Message-exchange pattern declared for an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MexPattern {
    OneWay,
    RequestResponse,
    Unknown,
}

/// One myRole operation on a partner link.
#[derive(Clone, Debug)]
pub struct OperationDef {
    pub name: String,
    pub pattern: MexPattern,
    /// True if a receive for this operation may spawn a new instance.
    pub create_instance: bool,
    /// Every correlation set this operation participates in, across every
    /// receive/pick/onMessage branch that could accept it, in declaration
    /// order. Candidate keys are tried in this order.
    pub correlation_sets: Vec<CorrelationSetId>,
    pub input_message_type: String,
}

/// A partner link's myRole side: the engine acts as server for these
/// operations.
#[derive(Clone, Debug)]
pub struct PartnerLinkDef {
    pub name: String,
    /// Service name the transport layer routes by.
    pub service: String,
    pub operations: Vec<OperationDef>,
}

impl PartnerLinkDef {
    pub fn operation(&self, name: &str) -> Option<&OperationDef> {
        self.operations.iter().find(|op| op.name == name)
    }
}

/// Administrative lifecycle of a deployed process version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessLifecycle {
    Active,
    /// Temporarily not accepting work; deliveries are rescheduled.
    Disabled,
    /// No longer eligible to start new instances.
    Retired,
}

/// Compiled process definition, reduced to what routing needs: partner
/// links, operations and correlation sets. The activity graph stays with
/// the (external) execution engine.
#[derive(Clone, Debug)]
pub struct ProcessDef {
    pub process_id: String,
    pub lifecycle: ProcessLifecycle,
    pub partner_links: Vec<PartnerLinkDef>,
    pub correlation_sets: BTreeMap<CorrelationSetId, CorrelationSetDef>,
}

impl ProcessDef {
    pub fn partner_link(&self, name: &str) -> Option<&PartnerLinkDef> {
        self.partner_links.iter().find(|pl| pl.name == name)
    }

    pub fn correlation_set(&self, set_id: CorrelationSetId) -> Option<&CorrelationSetDef> {
        self.correlation_sets.get(&set_id)
    }
}

/// Correlator identifier: one routing table per (partner link, operation).
pub fn correlator_id(partner_link: &str, operation: &str) -> String {
    format!("{partner_link}.{operation}")
}

// ─── Runtime instance record ──────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Active,
    Completed,
    Terminated,
    Failed,
}

/// Persisted process-instance record. Execution state (scopes, variables,
/// continuations) belongs to the external execution engine; routing only
/// needs identity and the instantiating correlator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub instance_id: Uuid,
    pub process_id: String,
    pub state: InstanceState,
    /// Correlator that created this instance — lets a `select` armed right
    /// after creation match the instantiating message without a route.
    pub instantiating_correlator: Option<String>,
    pub created_at: Timestamp,
}

// ─── Routing table records ────────────────────────────────────

/// A persisted "instance X is waiting for a message matching key K" record.
/// All routes sharing a `group_id` belong to one multi-branch receive and
/// are removed together when any one of them matches.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Route {
    /// Binds together the alternative keys of a single pick/receive. This
    /// is the arming pick's response channel.
    pub group_id: String,
    /// Which selector of the arming pick this route resumes.
    pub index: RouteIndex,
    /// `None` is the default route: a receive with no correlation-set
    /// initiation, waiting for the next message on the operation.
    pub key: Option<CorrelationKey>,
    pub target_instance: Uuid,
}

/// An inbound message that found no matching route and was not eligible to
/// create an instance. Persisted with all candidate keys so a later route
/// registration can consume it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub mex_id: Uuid,
    pub keys: Vec<CorrelationKey>,
    pub enqueued_at: Timestamp,
}

// ─── Selector ─────────────────────────────────────────────────

/// Identifies one partner-link instantiation within a process instance.
/// Distinct scope instances of the same declared partner link are distinct
/// for request/reply matching.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartnerLinkInstance {
    pub partner_link: String,
    pub scope_instance_id: u64,
}

/// One armed branch of a receive/pick: which operation it accepts, on which
/// partner-link instance, with which correlation key (if any), and the
/// BPEL-level message-exchange disambiguator for receive/reply pairing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Selector {
    pub partner_link_instance: PartnerLinkInstance,
    pub operation: String,
    /// Receive/reply disambiguator (BPEL messageExchange attribute), not a
    /// runtime mex identifier. Empty by default.
    pub bpel_mex_id: String,
    pub one_way: bool,
    /// `None` arms the default (null-key) route.
    pub correlation_key: Option<CorrelationKey>,
}

// ─── Scheduled jobs ───────────────────────────────────────────

/// Work handed to the external scheduler: resuming instances, continuing
/// async replies, retrying deliveries against inactive processes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum JobKind {
    /// Run a freshly created instance from the start.
    StartInstance { instance_id: Uuid, mex_id: Uuid },
    /// Resume a waiting instance at the stored resumption coordinates.
    ResumeInstance {
        instance_id: Uuid,
        /// Pick response channel + selector index, `"<group>&<index>"`.
        channel: String,
        mex_id: Uuid,
    },
    /// Push an out-of-band response for an exchange that went ASYNC.
    AsyncResponse { mex_id: Uuid },
    /// Re-attempt delivery against a temporarily disabled process.
    RetryDelivery { mex_id: Uuid, attempt: u32 },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub fire_at: Timestamp,
}

impl Job {
    pub fn immediate(kind: JobKind) -> Self {
        Self {
            job_id: Uuid::now_v7(),
            kind,
            fire_at: now_ms(),
        }
    }

    pub fn at(kind: JobKind, fire_at: Timestamp) -> Self {
        Self {
            job_id: Uuid::now_v7(),
            kind,
            fire_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_key_equality_is_elementwise() {
        let a = CorrelationKey::new(1, vec!["123".into(), "abc".into()]);
        let b = CorrelationKey::new(1, vec!["123".into(), "abc".into()]);
        let c = CorrelationKey::new(2, vec!["123".into(), "abc".into()]);
        let d = CorrelationKey::new(1, vec!["abc".into(), "123".into()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn opaque_key_uses_sentinel_set() {
        let k = CorrelationKey::opaque("session-9");
        assert_eq!(k.set_id, OPAQUE_CORRELATION_SET);
        assert_eq!(k.values, vec!["session-9".to_string()]);
    }

    #[test]
    fn correlator_id_joins_plink_and_operation() {
        assert_eq!(
            correlator_id("purchasing", "submitOrder"),
            "purchasing.submitOrder"
        );
    }
}
