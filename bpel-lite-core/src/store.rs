use crate::events::RuntimeEvent;
use crate::mex::MessageExchange;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Persistence port for all routing state.
///
/// The router operates exclusively through this trait, enabling pluggable
/// backends (MemoryStore for tests and embedded use, a database for
/// production). Correlator tables are keyed by `"<partnerLink>.<operation>"`
/// (see [`correlator_id`]).
///
/// Atomicity contract: each method is one transaction. In particular,
/// [`consume_route`](EngineStore::consume_route) (find + group removal),
/// [`consume_route_or_enqueue`](EngineStore::consume_route_or_enqueue) and
/// [`dequeue_or_add_route`](EngineStore::dequeue_or_add_route) must be
/// atomic with respect to concurrent deliveries on the same correlator,
/// otherwise two messages could both match and consume one route.
#[async_trait]
pub trait EngineStore: Send + Sync {
    // ── Instances ──

    async fn create_instance(
        &self,
        process_id: &str,
        instantiating_correlator: &str,
    ) -> Result<ProcessInstance>;
    async fn load_instance(&self, instance_id: Uuid) -> Result<Option<ProcessInstance>>;
    async fn update_instance_state(&self, instance_id: Uuid, state: InstanceState) -> Result<()>;

    // ── Message exchanges ──

    async fn save_mex(&self, mex: &MessageExchange) -> Result<()>;
    async fn load_mex(&self, mex_id: Uuid) -> Result<Option<MessageExchange>>;

    // ── Correlator: routes ──

    /// Register a route. Routes sharing a `group_id` (possibly across
    /// correlators, for a multi-operation pick) are removed together.
    async fn add_route(&self, correlator_id: &str, route: &Route) -> Result<()>;

    /// Look up a route for one key (`None` = the default route) without
    /// consuming it.
    async fn find_route(&self, correlator_id: &str, key: Option<&CorrelationKey>)
        -> Result<Option<Route>>;

    /// Remove every route of a group targeting the given instance — the
    /// match step's sibling invalidation, also used for explicit
    /// cancellation when a pick branch times out.
    async fn remove_routes(&self, group_id: &str, target_instance: Uuid) -> Result<()>;

    /// Try each candidate key in order against the route table; on the
    /// first hit, remove the whole route group and return the route
    /// together with the key that won. One transaction.
    async fn consume_route(
        &self,
        correlator_id: &str,
        candidates: &[Option<CorrelationKey>],
    ) -> Result<Option<(Route, Option<CorrelationKey>)>>;

    // ── Correlator: queued messages ──

    async fn enqueue_message(&self, correlator_id: &str, message: &QueuedMessage) -> Result<()>;

    /// [`consume_route`](EngineStore::consume_route), falling back to
    /// enqueueing the message when no candidate matches — in one
    /// transaction, so an interleaved `select` cannot slip a route in
    /// between the lookup and the enqueue. `None` means enqueued.
    async fn consume_route_or_enqueue(
        &self,
        correlator_id: &str,
        candidates: &[Option<CorrelationKey>],
        message: &QueuedMessage,
    ) -> Result<Option<(Route, Option<CorrelationKey>)>>;

    /// The symmetric operation for the arming side: consume the oldest
    /// queued message matching `key` (`None` matches any message on the
    /// correlator), or register the route if none is queued. One
    /// transaction. `None` means the route was added.
    async fn dequeue_or_add_route(
        &self,
        correlator_id: &str,
        key: Option<&CorrelationKey>,
        route: &Route,
    ) -> Result<Option<QueuedMessage>>;

    /// Remove and return every queued message enqueued before the cutoff,
    /// with its correlator id. Administrative expiry sweep.
    async fn expire_messages(&self, enqueued_before: Timestamp)
        -> Result<Vec<(String, QueuedMessage)>>;

    // ── Scheduled jobs ──

    async fn schedule_job(&self, job: &Job) -> Result<()>;
    async fn take_due_jobs(&self, now: Timestamp, max: usize) -> Result<Vec<Job>>;

    // ── Event log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(&self, instance_id: Option<Uuid>, event: &RuntimeEvent) -> Result<u64>;
    async fn read_events(
        &self,
        instance_id: Option<Uuid>,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>>;
}
