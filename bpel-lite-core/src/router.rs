//! The routing engine: decides, for every inbound message, whether it
//! starts a new process instance, resumes a specific waiting instance, or
//! must wait itself for a future matching receive — and matches a running
//! instance's outstanding receives against the eventual replies.
//!
//! Matching protocol for one inbound message:
//!
//! 1. compute the candidate key set (one key per correlation set the
//!    operation participates in, declaration order, plus the opaque
//!    session key if the endpoint carries one);
//! 2. try each candidate against the correlator's route table — first hit
//!    wins, group siblings removed atomically;
//! 3. fall back to the default (null-key) route;
//! 4. create a new instance if the operation is instance-creating and the
//!    process is not retired;
//! 5. otherwise persist the message with its candidate keys.
//!
//! No-match, retirement rejection and unknown-endpoint are ordinary
//! protocol branches reported through [`RoutingOutcome`] and the exchange's
//! correlation status, never errors.

use crate::config::EngineConfig;
use crate::correlation::compute_candidate_keys;
use crate::error::{CorrelationError, EngineError, ProcessFault};
use crate::events::RuntimeEvent;
use crate::mex::{CorrelationStatus, FailureType, MessageExchange, MexStatus};
use crate::outstanding::OutstandingRequestManager;
use crate::store::EngineStore;
use crate::types::*;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Where a routed inbound message ended up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutingOutcome {
    /// A new instance was created and the message delivered to it.
    Created { instance_id: Uuid },
    /// An existing instance's waiting route consumed the message.
    Matched {
        instance_id: Uuid,
        group_id: String,
        index: RouteIndex,
    },
    /// No match; the message is persisted for a future receive.
    Queued,
    /// Delivery refused — the exchange carries the failure detail.
    Rejected {
        failure_type: FailureType,
        reason: String,
    },
    /// Process temporarily disabled; a retry job was scheduled.
    Deferred { fire_at: Timestamp },
}

/// Result of arming a receive/pick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Selector `index` was satisfied immediately — by the instantiating
    /// message or by a previously queued one. The exchange is associated
    /// with the arming channel and ready for the instance to consume.
    Matched { index: RouteIndex, mex_id: Uuid },
    /// Routes registered; the instance will be resumed by a later match.
    Armed,
}

/// The correlation/message-exchange router.
///
/// Owns the deployed-process registry (an explicit engine-context field,
/// not process-global state) and drives all routing through the
/// [`EngineStore`] port.
pub struct Router {
    store: Arc<dyn EngineStore>,
    config: EngineConfig,
    processes: HashMap<String, Arc<ProcessDef>>,
}

impl Router {
    pub fn new(store: Arc<dyn EngineStore>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            processes: HashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    /// Deploy (or replace) a process definition.
    pub fn register_process(&mut self, def: ProcessDef) {
        self.processes.insert(def.process_id.clone(), Arc::new(def));
    }

    /// Administrative lifecycle change for a deployed process.
    pub fn set_process_lifecycle(&mut self, process_id: &str, lifecycle: ProcessLifecycle) {
        if let Some(def) = self.processes.get(process_id) {
            let mut def = (**def).clone();
            def.lifecycle = lifecycle;
            self.processes.insert(process_id.to_string(), Arc::new(def));
        }
    }

    pub fn process(&self, process_id: &str) -> Option<Arc<ProcessDef>> {
        self.processes.get(process_id).cloned()
    }

    fn my_role_for_service(&self, service: &str) -> Option<(Arc<ProcessDef>, PartnerLinkDef)> {
        for def in self.processes.values() {
            if let Some(pl) = def.partner_links.iter().find(|pl| pl.service == service) {
                return Some((def.clone(), pl.clone()));
            }
        }
        None
    }

    // ── Inbound delivery ──────────────────────────────────────

    /// Entry point for the transport/binding layer: route one inbound
    /// message and return its (persisted) message exchange. Routing
    /// outcomes — including unknown endpoint, queueing and retirement
    /// rejection — are reported on the exchange, not as errors.
    pub async fn deliver_inbound_message(
        &self,
        service: &str,
        operation: &str,
        payload: Value,
        session_id: Option<&str>,
    ) -> Result<MessageExchange> {
        let Some((process, plink)) = self.my_role_for_service(service) else {
            let reason = format!("no process implements service `{service}`");
            error!("{reason}");
            let mut mex = MessageExchange::inbound(service, "", operation, payload, session_id);
            mex.correlation_status = CorrelationStatus::UnknownEndpoint;
            mex.set_failure(FailureType::UnknownEndpoint, &reason);
            self.store.save_mex(&mex).await?;
            self.store
                .append_event(
                    None,
                    &RuntimeEvent::DeliveryFailed {
                        mex_id: mex.mex_id,
                        failure_type: FailureType::UnknownEndpoint,
                        reason,
                    },
                )
                .await?;
            return Ok(mex);
        };

        let mut mex =
            MessageExchange::inbound(service, &plink.name, operation, payload, session_id);
        self.invoke_my_role(&process, &plink, &mut mex, 0).await?;
        self.store.save_mex(&mex).await?;
        Ok(mex)
    }

    /// Re-enter routing for a deferred delivery (fired by the scheduler).
    pub async fn redeliver(&self, mex_id: Uuid, attempt: u32) -> Result<RoutingOutcome> {
        let mut mex = self
            .store
            .load_mex(mex_id)
            .await?
            .ok_or_else(|| EngineError::Consistency(format!("redeliver: unknown mex {mex_id}")))?;
        let Some((process, plink)) = self.my_role_for_service(&mex.service) else {
            let reason = format!("service `{}` no longer deployed", mex.service);
            mex.set_failure(FailureType::UnknownEndpoint, &reason);
            self.store.save_mex(&mex).await?;
            return Ok(RoutingOutcome::Rejected {
                failure_type: FailureType::UnknownEndpoint,
                reason,
            });
        };
        let outcome = self.invoke_my_role(&process, &plink, &mut mex, attempt).await?;
        self.store.save_mex(&mex).await?;
        Ok(outcome)
    }

    /// The routing decision for one exchange. Mutates the exchange's
    /// status/correlation fields; the caller persists it.
    async fn invoke_my_role(
        &self,
        process: &ProcessDef,
        plink: &PartnerLinkDef,
        mex: &mut MessageExchange,
        attempt: u32,
    ) -> Result<RoutingOutcome> {
        let Some(op) = plink.operation(&mex.operation) else {
            let reason = format!(
                "operation `{}` not declared on partner link `{}`",
                mex.operation, plink.name
            );
            warn!("{reason}");
            mex.set_failure(FailureType::UnknownOperation, &reason);
            self.emit_failure(mex.instance_id, mex, FailureType::UnknownOperation, &reason)
                .await?;
            return Ok(RoutingOutcome::Rejected {
                failure_type: FailureType::UnknownOperation,
                reason,
            });
        };

        if mex.status == MexStatus::New {
            mex.mark_request()?;
        }

        if process.lifecycle == ProcessLifecycle::Disabled {
            return self.defer_delivery(process, mex, attempt).await;
        }

        let payload = mex.request.clone().unwrap_or(Value::Null);
        let keys = match compute_candidate_keys(process, op, &payload, mex.session_id.as_deref()) {
            Ok(keys) => keys,
            Err(CorrelationError::Fault(fault)) => {
                // Message-format problem; reject gracefully, nothing to roll back.
                let reason = fault.to_string();
                debug!("unable to evaluate correlation keys: {reason}");
                mex.set_failure(FailureType::FormatError, &reason);
                self.emit_failure(mex.instance_id, mex, FailureType::FormatError, &reason)
                    .await?;
                return Ok(RoutingOutcome::Rejected {
                    failure_type: FailureType::FormatError,
                    reason,
                });
            }
            Err(CorrelationError::Config(err)) => {
                // Configuration defect: fail hard, this will never succeed.
                error!("correlation configuration defect: {err}");
                return Err(err.into());
            }
        };

        let cid = correlator_id(&plink.name, &op.name);
        debug!(
            "INPUTMSG: {cid}: MSG RCVD keys={:?} session={:?}",
            keys, mex.session_id
        );

        // Declared keys in declaration order, opaque key, then the default
        // (null-key) route as last resort.
        let mut candidates: Vec<Option<CorrelationKey>> =
            keys.iter().cloned().map(Some).collect();
        candidates.push(None);

        if op.create_instance {
            match self.store.consume_route(&cid, &candidates).await? {
                Some((route, key)) => self.complete_match(op, &cid, mex, route, key).await,
                None => self.create_new_instance(process, op, &cid, mex).await,
            }
        } else {
            let queued = QueuedMessage {
                mex_id: mex.mex_id,
                keys: keys.clone(),
                enqueued_at: now_ms(),
            };
            match self
                .store
                .consume_route_or_enqueue(&cid, &candidates, &queued)
                .await?
            {
                Some((route, key)) => self.complete_match(op, &cid, mex, route, key).await,
                None => {
                    debug!("INPUTMSG: {cid}: SAVING (no match)");
                    mex.correlation_status = CorrelationStatus::Queued;
                    self.store
                        .append_event(
                            None,
                            &RuntimeEvent::CorrelationNoMatch {
                                correlator_id: cid,
                                mex_id: mex.mex_id,
                                keys,
                            },
                        )
                        .await?;
                    mex.settle_pattern(op.pattern)?;
                    Ok(RoutingOutcome::Queued)
                }
            }
        }
    }

    async fn complete_match(
        &self,
        op: &OperationDef,
        cid: &str,
        mex: &mut MessageExchange,
        route: Route,
        key: Option<CorrelationKey>,
    ) -> Result<RoutingOutcome> {
        let instance_id = route.target_instance;
        debug!("INPUTMSG: {cid}: ROUTING to instance {instance_id}");

        mex.correlation_status = CorrelationStatus::Matched;
        mex.instance_id = Some(instance_id);
        // Resumption coordinates: pick response channel + selector index.
        let channel = format!("{}&{}", route.group_id, route.index);
        mex.channel = Some(channel.clone());

        self.store
            .append_event(
                Some(instance_id),
                &RuntimeEvent::CorrelationMatched {
                    correlator_id: cid.to_string(),
                    instance_id,
                    mex_id: mex.mex_id,
                    key,
                    group_id: route.group_id.clone(),
                },
            )
            .await?;
        self.store
            .append_event(
                Some(instance_id),
                &RuntimeEvent::RoutesRemoved {
                    group_id: route.group_id.clone(),
                    instance_id,
                },
            )
            .await?;
        self.store
            .schedule_job(&Job::immediate(JobKind::ResumeInstance {
                instance_id,
                channel,
                mex_id: mex.mex_id,
            }))
            .await?;

        mex.settle_pattern(op.pattern)?;
        Ok(RoutingOutcome::Matched {
            instance_id,
            group_id: route.group_id,
            index: route.index,
        })
    }

    async fn create_new_instance(
        &self,
        process: &ProcessDef,
        op: &OperationDef,
        cid: &str,
        mex: &mut MessageExchange,
    ) -> Result<RoutingOutcome> {
        if process.lifecycle == ProcessLifecycle::Retired {
            // Deliberate administrative act, not an engine defect: tell the
            // caller creation was rejected and leave the message's fate to
            // them. Never silently queue or drop.
            let reason = format!(
                "process `{}` is retired; instance creation rejected",
                process.process_id
            );
            warn!("{reason}");
            mex.set_failure(FailureType::ProcessRetired, &reason);
            self.store
                .append_event(
                    None,
                    &RuntimeEvent::CreateRejected {
                        process_id: process.process_id.clone(),
                        mex_id: mex.mex_id,
                    },
                )
                .await?;
            return Ok(RoutingOutcome::Rejected {
                failure_type: FailureType::ProcessRetired,
                reason,
            });
        }

        debug!("INPUTMSG: {cid}: routing failed, CREATING NEW INSTANCE");
        let instance = self.store.create_instance(&process.process_id, cid).await?;
        mex.correlation_status = CorrelationStatus::CreateInstance;
        mex.instance_id = Some(instance.instance_id);

        self.store
            .append_event(
                Some(instance.instance_id),
                &RuntimeEvent::InstanceCreated {
                    instance_id: instance.instance_id,
                    process_id: process.process_id.clone(),
                    mex_id: mex.mex_id,
                },
            )
            .await?;
        self.store
            .schedule_job(&Job::immediate(JobKind::StartInstance {
                instance_id: instance.instance_id,
                mex_id: mex.mex_id,
            }))
            .await?;

        mex.settle_pattern(op.pattern)?;
        Ok(RoutingOutcome::Created {
            instance_id: instance.instance_id,
        })
    }

    async fn defer_delivery(
        &self,
        process: &ProcessDef,
        mex: &mut MessageExchange,
        attempt: u32,
    ) -> Result<RoutingOutcome> {
        let next = attempt + 1;
        if next >= self.config.max_delivery_attempts {
            let reason = format!(
                "process `{}` still disabled after {attempt} delivery attempts",
                process.process_id
            );
            warn!("{reason}");
            mex.set_failure(FailureType::Other, &reason);
            self.emit_failure(mex.instance_id, mex, FailureType::Other, &reason)
                .await?;
            return Ok(RoutingOutcome::Rejected {
                failure_type: FailureType::Other,
                reason,
            });
        }
        let fire_at = now_ms() + self.config.retry_interval_ms;
        self.store
            .schedule_job(&Job::at(
                JobKind::RetryDelivery {
                    mex_id: mex.mex_id,
                    attempt: next,
                },
                fire_at,
            ))
            .await?;
        self.store
            .append_event(
                None,
                &RuntimeEvent::DeliveryDeferred {
                    process_id: process.process_id.clone(),
                    mex_id: mex.mex_id,
                    fire_at,
                    attempt: next,
                },
            )
            .await?;
        debug!(
            "process `{}` disabled; delivery of mex {} deferred to {fire_at}",
            process.process_id, mex.mex_id
        );
        Ok(RoutingOutcome::Deferred { fire_at })
    }

    async fn emit_failure(
        &self,
        instance_id: Option<Uuid>,
        mex: &MessageExchange,
        failure_type: FailureType,
        reason: &str,
    ) -> Result<()> {
        self.store
            .append_event(
                instance_id,
                &RuntimeEvent::DeliveryFailed {
                    mex_id: mex.mex_id,
                    failure_type,
                    reason: reason.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    // ── Arming receives (called by the continuation engine) ───

    /// Arm a receive/pick for a running instance: detect same-operation
    /// ambiguity, register the selectors with the outstanding-request
    /// manager, then either match immediately (instantiating message or a
    /// queued one) or add one route per selector.
    pub async fn select(
        &self,
        instance_id: Uuid,
        orm: &mut OutstandingRequestManager,
        channel: &str,
        selectors: Vec<Selector>,
        instantiating_mex: Option<Uuid>,
    ) -> Result<SelectOutcome> {
        if let Some(index) = orm.find_conflict(&selectors) {
            return Err(anyhow::Error::new(ProcessFault::ConflictingReceive { index }));
        }
        orm.register(channel, selectors.clone())?;

        // A selector armed by the instance just created for this message
        // matches it directly, without touching the route table.
        if let Some(imex) = instantiating_mex {
            let instance = self
                .store
                .load_instance(instance_id)
                .await?
                .ok_or_else(|| {
                    EngineError::Consistency(format!("select: unknown instance {instance_id}"))
                })?;
            if let Some(icid) = instance.instantiating_correlator.as_deref() {
                for (i, sel) in selectors.iter().enumerate() {
                    let cid =
                        correlator_id(&sel.partner_link_instance.partner_link, &sel.operation);
                    if cid == icid {
                        debug!("SELECT: {channel}: matches instantiating mex {imex}");
                        orm.associate(channel, imex)?;
                        return Ok(SelectOutcome::Matched {
                            index: i as RouteIndex,
                            mex_id: imex,
                        });
                    }
                }
            }
        }

        let mut correlator_ids = Vec::with_capacity(selectors.len());
        for (i, sel) in selectors.iter().enumerate() {
            let cid = correlator_id(&sel.partner_link_instance.partner_link, &sel.operation);
            let route = Route {
                group_id: channel.to_string(),
                index: i as RouteIndex,
                key: sel.correlation_key.clone(),
                target_instance: instance_id,
            };
            if let Some(queued) = self
                .store
                .dequeue_or_add_route(&cid, sel.correlation_key.as_ref(), &route)
                .await?
            {
                // A queued message satisfies this branch right now. Drop
                // the routes already added for earlier selectors.
                self.store.remove_routes(channel, instance_id).await?;
                let mut qmex = self.store.load_mex(queued.mex_id).await?.ok_or_else(|| {
                    EngineError::Consistency(format!(
                        "select: queued mex {} missing",
                        queued.mex_id
                    ))
                })?;
                qmex.correlation_status = CorrelationStatus::Matched;
                qmex.instance_id = Some(instance_id);
                qmex.channel = Some(format!("{channel}&{i}"));
                self.store.save_mex(&qmex).await?;
                orm.associate(channel, queued.mex_id)?;
                self.store
                    .append_event(
                        Some(instance_id),
                        &RuntimeEvent::QueuedMessageMatched {
                            correlator_id: cid,
                            instance_id,
                            mex_id: queued.mex_id,
                        },
                    )
                    .await?;
                debug!("SELECT: {channel}: consumed queued mex {}", queued.mex_id);
                return Ok(SelectOutcome::Matched {
                    index: i as RouteIndex,
                    mex_id: queued.mex_id,
                });
            }
            debug!("SELECT: {channel}: ADDED ROUTE {cid} --> {instance_id}");
            correlator_ids.push(cid);
        }

        self.store
            .append_event(
                Some(instance_id),
                &RuntimeEvent::ReceiveArmed {
                    instance_id,
                    channel: channel.to_string(),
                    correlator_ids,
                },
            )
            .await?;
        Ok(SelectOutcome::Armed)
    }

    /// Cancel a pending receive: drop its registration and its routes.
    /// Used when a pick's timeout fires before any message arrives.
    pub async fn cancel_select(
        &self,
        instance_id: Uuid,
        orm: &mut OutstandingRequestManager,
        channel: &str,
    ) -> Result<()> {
        orm.cancel(channel);
        self.store.remove_routes(channel, instance_id).await?;
        self.store
            .append_event(
                Some(instance_id),
                &RuntimeEvent::ReceiveCancelled {
                    instance_id,
                    channel: channel.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    // ── Replies ───────────────────────────────────────────────

    /// Resolve a reply activity against the outstanding request it answers
    /// and write the response (or fault) into the exchange. A reply against
    /// an ASYNC exchange schedules a continuation job — the original
    /// caller's thread is long gone.
    pub async fn reply(
        &self,
        instance_id: Uuid,
        orm: &mut OutstandingRequestManager,
        partner_link: &PartnerLinkInstance,
        operation: &str,
        bpel_mex_id: &str,
        response: Value,
        fault: Option<&str>,
    ) -> Result<()> {
        let mex_ref = orm
            .release(partner_link, operation, bpel_mex_id)
            .ok_or_else(|| {
                anyhow::Error::new(ProcessFault::MissingRequest(format!(
                    "{}.{operation} (mexId `{bpel_mex_id}`)",
                    partner_link.partner_link
                )))
            })?;
        let mut mex = self.store.load_mex(mex_ref).await?.ok_or_else(|| {
            EngineError::Consistency(format!("reply: exchange {mex_ref} not found"))
        })?;

        let was_async = match fault {
            Some(name) => mex.set_fault(name, Some(response))?,
            None => mex.set_response(response)?,
        };
        if was_async {
            self.store
                .schedule_job(&Job::immediate(JobKind::AsyncResponse { mex_id: mex.mex_id }))
                .await?;
            self.store
                .append_event(
                    Some(instance_id),
                    &RuntimeEvent::AsyncReplyScheduled { mex_id: mex.mex_id },
                )
                .await?;
        }
        self.store.save_mex(&mex).await?;
        self.store
            .append_event(
                Some(instance_id),
                &RuntimeEvent::ReplySent {
                    instance_id,
                    mex_id: mex.mex_id,
                    fault: fault.map(str::to_string),
                },
            )
            .await?;
        Ok(())
    }

    /// Answer an outstanding request with a failure instead of a response —
    /// the instance could not produce one (e.g. an upstream invoke broke).
    /// Same release/continuation mechanics as [`reply`](Self::reply).
    pub async fn reply_with_failure(
        &self,
        instance_id: Uuid,
        orm: &mut OutstandingRequestManager,
        partner_link: &PartnerLinkInstance,
        operation: &str,
        bpel_mex_id: &str,
        failure_type: FailureType,
        reason: &str,
    ) -> Result<()> {
        let mex_ref = orm
            .release(partner_link, operation, bpel_mex_id)
            .ok_or_else(|| {
                anyhow::Error::new(ProcessFault::MissingRequest(format!(
                    "{}.{operation} (mexId `{bpel_mex_id}`)",
                    partner_link.partner_link
                )))
            })?;
        let mut mex = self.store.load_mex(mex_ref).await?.ok_or_else(|| {
            EngineError::Consistency(format!("reply_with_failure: exchange {mex_ref} not found"))
        })?;
        let was_async = mex.status == MexStatus::Async;
        mex.set_failure(failure_type, reason);
        self.store.save_mex(&mex).await?;
        if was_async {
            self.store
                .schedule_job(&Job::immediate(JobKind::AsyncResponse { mex_id: mex.mex_id }))
                .await?;
        }
        self.emit_failure(Some(instance_id), &mex, failure_type, reason)
            .await?;
        Ok(())
    }

    /// Fail every outstanding exchange of an abandoned/terminated instance.
    /// Request-response exchanges get a continuation job so the failure
    /// reaches the waiting caller.
    pub async fn fail_outstanding(
        &self,
        instance_id: Uuid,
        orm: &mut OutstandingRequestManager,
    ) -> Result<Vec<Uuid>> {
        let mex_ids = orm.release_all();
        for mex_id in &mex_ids {
            let Some(mut mex) = self.store.load_mex(*mex_id).await? else {
                continue;
            };
            mex.set_failure(FailureType::Aborted, "instance terminated before reply");
            self.store.save_mex(&mex).await?;
            if mex.pattern == MexPattern::RequestResponse {
                self.store
                    .schedule_job(&Job::immediate(JobKind::AsyncResponse { mex_id: *mex_id }))
                    .await?;
            }
            self.emit_failure(
                Some(instance_id),
                &mex,
                FailureType::Aborted,
                "instance terminated before reply",
            )
            .await?;
        }
        Ok(mex_ids)
    }

    // ── Administrative sweeps ─────────────────────────────────

    /// Expire queued messages older than the configured TTL, failing their
    /// exchanges with `NoMatch`. Returns the expired exchange ids.
    pub async fn expire_queued_messages(&self, now: Timestamp) -> Result<Vec<Uuid>> {
        let cutoff = now - self.config.queued_message_ttl_ms;
        let expired = self.store.expire_messages(cutoff).await?;
        let mut out = Vec::with_capacity(expired.len());
        for (cid, queued) in expired {
            if let Some(mut mex) = self.store.load_mex(queued.mex_id).await? {
                mex.set_failure(
                    FailureType::NoMatch,
                    "queued message expired without finding a route",
                );
                self.store.save_mex(&mex).await?;
            }
            self.store
                .append_event(
                    None,
                    &RuntimeEvent::QueuedMessageExpired {
                        correlator_id: cid,
                        mex_id: queued.mex_id,
                        enqueued_at: queued.enqueued_at,
                    },
                )
                .await?;
            out.push(queued.mex_id);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn order_process() -> ProcessDef {
        let mut aliases = BTreeMap::new();
        aliases.insert(
            ("orderId".to_string(), "OrderMessage".to_string()),
            PropertyAliasDef {
                location: "order.id".to_string(),
            },
        );
        let cset = CorrelationSetDef {
            set_id: 1,
            name: "orderCorr".to_string(),
            properties: vec!["orderId".to_string()],
            aliases,
        };
        let mut csets = BTreeMap::new();
        csets.insert(1, cset);
        ProcessDef {
            process_id: "order-process".to_string(),
            lifecycle: ProcessLifecycle::Active,
            partner_links: vec![PartnerLinkDef {
                name: "purchasing".to_string(),
                service: "OrderService".to_string(),
                operations: vec![
                    OperationDef {
                        name: "submitOrder".to_string(),
                        pattern: MexPattern::RequestResponse,
                        create_instance: true,
                        correlation_sets: vec![1],
                        input_message_type: "OrderMessage".to_string(),
                    },
                    OperationDef {
                        name: "sendInvoice".to_string(),
                        pattern: MexPattern::OneWay,
                        create_instance: false,
                        correlation_sets: vec![1],
                        input_message_type: "OrderMessage".to_string(),
                    },
                    OperationDef {
                        name: "checkStatus".to_string(),
                        pattern: MexPattern::RequestResponse,
                        create_instance: false,
                        correlation_sets: vec![1],
                        input_message_type: "OrderMessage".to_string(),
                    },
                ],
            }],
            correlation_sets: csets,
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn router_with(process: ProcessDef) -> Router {
        init_tracing();
        let store: Arc<dyn EngineStore> = Arc::new(MemoryStore::new());
        let mut router = Router::new(store, EngineConfig::default());
        router.register_process(process);
        router
    }

    fn order_key(id: &str) -> CorrelationKey {
        CorrelationKey::new(1, vec![id.to_string()])
    }

    fn selector(operation: &str, key: Option<CorrelationKey>, one_way: bool) -> Selector {
        Selector {
            partner_link_instance: PartnerLinkInstance {
                partner_link: "purchasing".to_string(),
                scope_instance_id: 0,
            },
            operation: operation.to_string(),
            bpel_mex_id: String::new(),
            one_way,
            correlation_key: key,
        }
    }

    async fn due_job_kinds(router: &Router) -> Vec<JobKind> {
        router
            .store()
            .take_due_jobs(now_ms() + 1, 64)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.kind)
            .collect()
    }

    #[tokio::test]
    async fn unmatched_create_operation_spawns_instance() {
        let router = router_with(order_process());
        let mex = router
            .deliver_inbound_message("OrderService", "submitOrder", json!({"order": {"id": "123"}}), None)
            .await
            .unwrap();

        assert_eq!(mex.correlation_status, CorrelationStatus::CreateInstance);
        assert_eq!(mex.status, MexStatus::Async);
        let instance_id = mex.instance_id.unwrap();

        let instance = router.store().load_instance(instance_id).await.unwrap().unwrap();
        assert_eq!(instance.process_id, "order-process");
        assert_eq!(
            instance.instantiating_correlator.as_deref(),
            Some("purchasing.submitOrder")
        );

        let kinds = due_job_kinds(&router).await;
        assert!(kinds
            .iter()
            .any(|k| matches!(k, JobKind::StartInstance { instance_id: i, .. } if *i == instance_id)));
    }

    #[tokio::test]
    async fn matched_delivery_resumes_the_armed_instance() {
        let router = router_with(order_process());
        let instance = router
            .store()
            .create_instance("order-process", "purchasing.submitOrder")
            .await
            .unwrap();
        let mut orm = OutstandingRequestManager::default();

        let outcome = router
            .select(
                instance.instance_id,
                &mut orm,
                "ch-1",
                vec![selector("sendInvoice", Some(order_key("123")), true)],
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome, SelectOutcome::Armed);

        let mex = router
            .deliver_inbound_message("OrderService", "sendInvoice", json!({"order": {"id": "123"}}), None)
            .await
            .unwrap();
        assert_eq!(mex.correlation_status, CorrelationStatus::Matched);
        assert_eq!(mex.instance_id, Some(instance.instance_id));
        assert_eq!(mex.channel.as_deref(), Some("ch-1&0"));
        assert_eq!(mex.status, MexStatus::OneWay);

        let kinds = due_job_kinds(&router).await;
        assert!(kinds
            .iter()
            .any(|k| matches!(k, JobKind::ResumeInstance { channel, .. } if channel == "ch-1&0")));

        // Route group was consumed; the same key now queues.
        let again = router
            .deliver_inbound_message("OrderService", "sendInvoice", json!({"order": {"id": "123"}}), None)
            .await
            .unwrap();
        assert_eq!(again.correlation_status, CorrelationStatus::Queued);
    }

    #[tokio::test]
    async fn non_create_operation_queues_without_a_route() {
        let router = router_with(order_process());
        let mex = router
            .deliver_inbound_message("OrderService", "sendInvoice", json!({"order": {"id": "9"}}), None)
            .await
            .unwrap();
        assert_eq!(mex.correlation_status, CorrelationStatus::Queued);
        assert_eq!(mex.status, MexStatus::OneWay);
        assert!(mex.instance_id.is_none());
    }

    #[tokio::test]
    async fn later_select_consumes_the_queued_message() {
        let router = router_with(order_process());
        let queued = router
            .deliver_inbound_message("OrderService", "sendInvoice", json!({"order": {"id": "9"}}), None)
            .await
            .unwrap();
        assert_eq!(queued.correlation_status, CorrelationStatus::Queued);

        let instance = router
            .store()
            .create_instance("order-process", "purchasing.submitOrder")
            .await
            .unwrap();
        let mut orm = OutstandingRequestManager::default();
        let outcome = router
            .select(
                instance.instance_id,
                &mut orm,
                "ch-1",
                vec![selector("sendInvoice", Some(order_key("9")), true)],
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SelectOutcome::Matched {
                index: 0,
                mex_id: queued.mex_id
            }
        );

        let mex = router.store().load_mex(queued.mex_id).await.unwrap().unwrap();
        assert_eq!(mex.correlation_status, CorrelationStatus::Matched);
        assert_eq!(mex.instance_id, Some(instance.instance_id));
        assert_eq!(mex.channel.as_deref(), Some("ch-1&0"));
    }

    #[tokio::test]
    async fn retired_process_rejects_instance_creation() {
        let mut process = order_process();
        process.lifecycle = ProcessLifecycle::Retired;
        let router = router_with(process);

        let mex = router
            .deliver_inbound_message("OrderService", "submitOrder", json!({"order": {"id": "1"}}), None)
            .await
            .unwrap();
        assert_eq!(mex.status, MexStatus::Failure);
        assert_eq!(
            mex.failure.as_ref().unwrap().failure_type,
            FailureType::ProcessRetired
        );
        assert!(mex.instance_id.is_none());
    }

    #[tokio::test]
    async fn retired_process_still_routes_to_existing_instances() {
        let mut process = order_process();
        process.lifecycle = ProcessLifecycle::Retired;
        let router = router_with(process);
        let instance = router
            .store()
            .create_instance("order-process", "purchasing.submitOrder")
            .await
            .unwrap();
        let mut orm = OutstandingRequestManager::default();
        router
            .select(
                instance.instance_id,
                &mut orm,
                "ch-1",
                vec![selector("sendInvoice", Some(order_key("5")), true)],
                None,
            )
            .await
            .unwrap();

        let mex = router
            .deliver_inbound_message("OrderService", "sendInvoice", json!({"order": {"id": "5"}}), None)
            .await
            .unwrap();
        assert_eq!(mex.correlation_status, CorrelationStatus::Matched);
        assert_eq!(mex.instance_id, Some(instance.instance_id));
    }

    #[tokio::test]
    async fn disabled_process_defers_delivery() {
        let mut process = order_process();
        process.lifecycle = ProcessLifecycle::Disabled;
        let router = router_with(process);

        let mex = router
            .deliver_inbound_message("OrderService", "submitOrder", json!({"order": {"id": "1"}}), None)
            .await
            .unwrap();
        // Still in flight, waiting for the retry job.
        assert_eq!(mex.status, MexStatus::Request);

        let jobs = router
            .store()
            .take_due_jobs(now_ms() + EngineConfig::default().retry_interval_ms + 1, 64)
            .await
            .unwrap();
        assert!(jobs.iter().any(|j| matches!(
            j.kind,
            JobKind::RetryDelivery { mex_id, attempt: 1 } if mex_id == mex.mex_id
        )));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_deliveries_consume_one_route() {
        let router = Arc::new(router_with(order_process()));
        let instance = router
            .store()
            .create_instance("order-process", "purchasing.submitOrder")
            .await
            .unwrap();
        let mut orm = OutstandingRequestManager::default();
        router
            .select(
                instance.instance_id,
                &mut orm,
                "ch-1",
                vec![selector("sendInvoice", Some(order_key("123")), true)],
                None,
            )
            .await
            .unwrap();

        let deliver = |router: Arc<Router>| {
            tokio::spawn(async move {
                router
                    .deliver_inbound_message(
                        "OrderService",
                        "sendInvoice",
                        json!({"order": {"id": "123"}}),
                        None,
                    )
                    .await
                    .unwrap()
            })
        };
        let a = deliver(router.clone());
        let b = deliver(router.clone());
        let statuses = [a.await.unwrap().correlation_status, b.await.unwrap().correlation_status];

        // The single route feeds exactly one of the two racers.
        assert!(statuses.contains(&CorrelationStatus::Matched));
        assert!(statuses.contains(&CorrelationStatus::Queued));
    }

    #[tokio::test]
    async fn redelivery_after_reenabling_routes_normally() {
        let mut process = order_process();
        process.lifecycle = ProcessLifecycle::Disabled;
        let mut router = router_with(process);

        let mex = router
            .deliver_inbound_message("OrderService", "submitOrder", json!({"order": {"id": "6"}}), None)
            .await
            .unwrap();
        assert_eq!(mex.status, MexStatus::Request);

        router.set_process_lifecycle("order-process", ProcessLifecycle::Active);
        let outcome = router.redeliver(mex.mex_id, 1).await.unwrap();
        assert!(matches!(outcome, RoutingOutcome::Created { .. }));

        let mex = router.store().load_mex(mex.mex_id).await.unwrap().unwrap();
        assert_eq!(mex.correlation_status, CorrelationStatus::CreateInstance);
        assert_eq!(mex.status, MexStatus::Async);
    }

    #[tokio::test]
    async fn redelivery_gives_up_after_the_attempt_cap() {
        let mut process = order_process();
        process.lifecycle = ProcessLifecycle::Disabled;
        let router = router_with(process);

        let mex = router
            .deliver_inbound_message("OrderService", "submitOrder", json!({"order": {"id": "6"}}), None)
            .await
            .unwrap();

        let last_attempt = EngineConfig::default().max_delivery_attempts - 1;
        let outcome = router.redeliver(mex.mex_id, last_attempt).await.unwrap();
        assert!(matches!(
            outcome,
            RoutingOutcome::Rejected {
                failure_type: FailureType::Other,
                ..
            }
        ));

        let mex = router.store().load_mex(mex.mex_id).await.unwrap().unwrap();
        assert_eq!(mex.status, MexStatus::Failure);
        assert_eq!(mex.failure.as_ref().unwrap().failure_type, FailureType::Other);
    }

    #[tokio::test]
    async fn unknown_service_fails_the_exchange() {
        let router = router_with(order_process());
        let mex = router
            .deliver_inbound_message("NoSuchService", "submitOrder", json!({}), None)
            .await
            .unwrap();
        assert_eq!(mex.status, MexStatus::Failure);
        assert_eq!(mex.correlation_status, CorrelationStatus::UnknownEndpoint);
        assert_eq!(
            mex.failure.as_ref().unwrap().failure_type,
            FailureType::UnknownEndpoint
        );
    }

    #[tokio::test]
    async fn unknown_operation_is_rejected() {
        let router = router_with(order_process());
        let mex = router
            .deliver_inbound_message("OrderService", "noSuchOp", json!({}), None)
            .await
            .unwrap();
        assert_eq!(mex.status, MexStatus::Failure);
        assert_eq!(
            mex.failure.as_ref().unwrap().failure_type,
            FailureType::UnknownOperation
        );
    }

    #[tokio::test]
    async fn unroutable_message_format_is_rejected_gracefully() {
        let router = router_with(order_process());
        let mex = router
            .deliver_inbound_message("OrderService", "sendInvoice", json!({"wrong": "shape"}), None)
            .await
            .unwrap();
        assert_eq!(mex.status, MexStatus::Failure);
        assert_eq!(
            mex.failure.as_ref().unwrap().failure_type,
            FailureType::FormatError
        );
    }

    #[tokio::test]
    async fn conflicting_receive_is_detected_before_arming() {
        let router = router_with(order_process());
        let instance = router
            .store()
            .create_instance("order-process", "purchasing.submitOrder")
            .await
            .unwrap();
        let mut orm = OutstandingRequestManager::default();

        router
            .select(
                instance.instance_id,
                &mut orm,
                "ch-1",
                vec![selector("checkStatus", Some(order_key("1")), false)],
                None,
            )
            .await
            .unwrap();
        let err = router
            .select(
                instance.instance_id,
                &mut orm,
                "ch-2",
                vec![selector("checkStatus", Some(order_key("2")), false)],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProcessFault>(),
            Some(ProcessFault::ConflictingReceive { index: 0 })
        ));
    }

    #[tokio::test]
    async fn instantiating_message_matches_the_first_select() {
        let router = router_with(order_process());
        let created = router
            .deliver_inbound_message("OrderService", "submitOrder", json!({"order": {"id": "44"}}), None)
            .await
            .unwrap();
        let instance_id = created.instance_id.unwrap();

        let mut orm = OutstandingRequestManager::default();
        let outcome = router
            .select(
                instance_id,
                &mut orm,
                "ch-1",
                vec![selector("submitOrder", None, false)],
                Some(created.mex_id),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SelectOutcome::Matched {
                index: 0,
                mex_id: created.mex_id
            }
        );
        // No route was ever added for the instantiating receive.
        let route = router
            .store()
            .find_route("purchasing.submitOrder", None)
            .await
            .unwrap();
        assert!(route.is_none());
    }

    #[tokio::test]
    async fn reply_settles_the_exchange_and_schedules_the_continuation() {
        let router = router_with(order_process());
        let created = router
            .deliver_inbound_message("OrderService", "submitOrder", json!({"order": {"id": "44"}}), None)
            .await
            .unwrap();
        let instance_id = created.instance_id.unwrap();

        let mut orm = OutstandingRequestManager::default();
        router
            .select(
                instance_id,
                &mut orm,
                "ch-1",
                vec![selector("submitOrder", None, false)],
                Some(created.mex_id),
            )
            .await
            .unwrap();

        let plink = PartnerLinkInstance {
            partner_link: "purchasing".to_string(),
            scope_instance_id: 0,
        };
        router
            .reply(instance_id, &mut orm, &plink, "submitOrder", "", json!({"ack": true}), None)
            .await
            .unwrap();

        let mex = router.store().load_mex(created.mex_id).await.unwrap().unwrap();
        assert_eq!(mex.status, MexStatus::Response);
        assert_eq!(mex.response, Some(json!({"ack": true})));

        let kinds = due_job_kinds(&router).await;
        assert!(kinds
            .iter()
            .any(|k| matches!(k, JobKind::AsyncResponse { mex_id } if *mex_id == created.mex_id)));

        // A second reply has nothing left to answer.
        let err = router
            .reply(instance_id, &mut orm, &plink, "submitOrder", "", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProcessFault>(),
            Some(ProcessFault::MissingRequest(_))
        ));
    }

    #[tokio::test]
    async fn failure_reply_reaches_the_async_caller() {
        let router = router_with(order_process());
        let created = router
            .deliver_inbound_message("OrderService", "submitOrder", json!({"order": {"id": "5"}}), None)
            .await
            .unwrap();
        let instance_id = created.instance_id.unwrap();
        let mut orm = OutstandingRequestManager::default();
        router
            .select(
                instance_id,
                &mut orm,
                "ch-1",
                vec![selector("submitOrder", None, false)],
                Some(created.mex_id),
            )
            .await
            .unwrap();

        let plink = PartnerLinkInstance {
            partner_link: "purchasing".to_string(),
            scope_instance_id: 0,
        };
        router
            .reply_with_failure(
                instance_id,
                &mut orm,
                &plink,
                "submitOrder",
                "",
                FailureType::Other,
                "downstream invoke failed",
            )
            .await
            .unwrap();

        let mex = router.store().load_mex(created.mex_id).await.unwrap().unwrap();
        assert_eq!(mex.status, MexStatus::Failure);
        let kinds = due_job_kinds(&router).await;
        assert!(kinds
            .iter()
            .any(|k| matches!(k, JobKind::AsyncResponse { mex_id } if *mex_id == created.mex_id)));
    }

    #[tokio::test]
    async fn pick_match_drops_the_sibling_routes() {
        let router = router_with(order_process());
        let instance = router
            .store()
            .create_instance("order-process", "purchasing.submitOrder")
            .await
            .unwrap();
        let mut orm = OutstandingRequestManager::default();
        router
            .select(
                instance.instance_id,
                &mut orm,
                "ch-1",
                vec![
                    selector("sendInvoice", Some(order_key("7")), true),
                    selector("checkStatus", Some(order_key("7")), false),
                ],
                None,
            )
            .await
            .unwrap();

        let mex = router
            .deliver_inbound_message("OrderService", "checkStatus", json!({"order": {"id": "7"}}), None)
            .await
            .unwrap();
        assert_eq!(mex.correlation_status, CorrelationStatus::Matched);
        assert_eq!(mex.channel.as_deref(), Some("ch-1&1"));

        // The one-way branch's route went with the group.
        let sibling = router
            .store()
            .find_route("purchasing.sendInvoice", Some(&order_key("7")))
            .await
            .unwrap();
        assert!(sibling.is_none());
    }

    #[tokio::test]
    async fn cancelled_select_leaves_no_routes_behind() {
        let router = router_with(order_process());
        let instance = router
            .store()
            .create_instance("order-process", "purchasing.submitOrder")
            .await
            .unwrap();
        let mut orm = OutstandingRequestManager::default();
        router
            .select(
                instance.instance_id,
                &mut orm,
                "ch-1",
                vec![selector("sendInvoice", Some(order_key("3")), true)],
                None,
            )
            .await
            .unwrap();

        router
            .cancel_select(instance.instance_id, &mut orm, "ch-1")
            .await
            .unwrap();
        assert!(orm.is_empty());

        let mex = router
            .deliver_inbound_message("OrderService", "sendInvoice", json!({"order": {"id": "3"}}), None)
            .await
            .unwrap();
        assert_eq!(mex.correlation_status, CorrelationStatus::Queued);
    }

    #[tokio::test]
    async fn terminated_instance_fails_its_outstanding_exchanges() {
        let router = router_with(order_process());
        let created = router
            .deliver_inbound_message("OrderService", "submitOrder", json!({"order": {"id": "8"}}), None)
            .await
            .unwrap();
        let instance_id = created.instance_id.unwrap();
        let mut orm = OutstandingRequestManager::default();
        router
            .select(
                instance_id,
                &mut orm,
                "ch-1",
                vec![selector("submitOrder", None, false)],
                Some(created.mex_id),
            )
            .await
            .unwrap();

        let failed = router.fail_outstanding(instance_id, &mut orm).await.unwrap();
        assert_eq!(failed, vec![created.mex_id]);
        assert!(orm.is_empty());

        let mex = router.store().load_mex(created.mex_id).await.unwrap().unwrap();
        assert_eq!(mex.status, MexStatus::Failure);
        assert_eq!(mex.failure.as_ref().unwrap().failure_type, FailureType::Aborted);

        // The waiting caller still gets an out-of-band answer.
        let kinds = due_job_kinds(&router).await;
        assert!(kinds
            .iter()
            .any(|k| matches!(k, JobKind::AsyncResponse { mex_id } if *mex_id == created.mex_id)));
    }

    #[tokio::test]
    async fn event_log_records_the_instance_lifecycle() {
        let router = router_with(order_process());
        let created = router
            .deliver_inbound_message("OrderService", "submitOrder", json!({"order": {"id": "31"}}), None)
            .await
            .unwrap();
        let instance_id = created.instance_id.unwrap();

        let mut orm = OutstandingRequestManager::default();
        router
            .select(
                instance_id,
                &mut orm,
                "ch-1",
                vec![selector("submitOrder", None, false)],
                Some(created.mex_id),
            )
            .await
            .unwrap();
        let plink = PartnerLinkInstance {
            partner_link: "purchasing".to_string(),
            scope_instance_id: 0,
        };
        router
            .reply(instance_id, &mut orm, &plink, "submitOrder", "", json!({"ok": true}), None)
            .await
            .unwrap();

        let events = router
            .store()
            .read_events(Some(instance_id), 0)
            .await
            .unwrap();
        assert!(events
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::InstanceCreated { instance_id: i, .. } if *i == instance_id)));
        assert!(events
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::ReplySent { mex_id, fault: None, .. } if *mex_id == created.mex_id)));
        // Sequence numbers are strictly increasing.
        assert!(events.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[tokio::test]
    async fn expiry_sweep_fails_stale_queued_messages() {
        let router = router_with(order_process());
        let queued = router
            .deliver_inbound_message("OrderService", "sendInvoice", json!({"order": {"id": "2"}}), None)
            .await
            .unwrap();

        let far_future = now_ms() + EngineConfig::default().queued_message_ttl_ms + 1_000;
        let expired = router.expire_queued_messages(far_future).await.unwrap();
        assert_eq!(expired, vec![queued.mex_id]);

        let mex = router.store().load_mex(queued.mex_id).await.unwrap().unwrap();
        assert_eq!(mex.status, MexStatus::Failure);
        assert_eq!(mex.failure.as_ref().unwrap().failure_type, FailureType::NoMatch);

        // Expired messages no longer match a later select.
        let instance = router
            .store()
            .create_instance("order-process", "purchasing.submitOrder")
            .await
            .unwrap();
        let mut orm = OutstandingRequestManager::default();
        let outcome = router
            .select(
                instance.instance_id,
                &mut orm,
                "ch-1",
                vec![selector("sendInvoice", Some(order_key("2")), true)],
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome, SelectOutcome::Armed);
    }

    #[tokio::test]
    async fn opaque_session_key_routes_without_declared_sets() {
        let mut process = order_process();
        // A session-scoped operation with no declared correlation sets.
        process.partner_links[0].operations.push(OperationDef {
            name: "sessionPing".to_string(),
            pattern: MexPattern::OneWay,
            create_instance: false,
            correlation_sets: vec![],
            input_message_type: "PingMessage".to_string(),
        });
        let router = router_with(process);

        let instance = router
            .store()
            .create_instance("order-process", "purchasing.submitOrder")
            .await
            .unwrap();
        let mut orm = OutstandingRequestManager::default();
        router
            .select(
                instance.instance_id,
                &mut orm,
                "ch-1",
                vec![selector("sessionPing", Some(CorrelationKey::opaque("sess-9")), true)],
                None,
            )
            .await
            .unwrap();

        let mex = router
            .deliver_inbound_message("OrderService", "sessionPing", json!({}), Some("sess-9"))
            .await
            .unwrap();
        assert_eq!(mex.correlation_status, CorrelationStatus::Matched);
        assert_eq!(mex.instance_id, Some(instance.instance_id));
    }
}
