//! In-memory [`EngineStore`] backing tests and embedded deployments.
//! A single async mutex over the whole state gives every method the
//! one-transaction atomicity the trait requires.

use crate::events::RuntimeEvent;
use crate::mex::MessageExchange;
use crate::store::EngineStore;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    instances: HashMap<Uuid, ProcessInstance>,
    mexes: HashMap<Uuid, MessageExchange>,
    /// correlator id → waiting routes, in arming order.
    routes: HashMap<String, Vec<Route>>,
    /// correlator id → queued messages, oldest first.
    queues: HashMap<String, Vec<QueuedMessage>>,
    jobs: Vec<Job>,
    events: Vec<(u64, Option<Uuid>, RuntimeEvent)>,
    next_seq: u64,
}

impl Inner {
    fn match_route(
        &mut self,
        correlator_id: &str,
        candidates: &[Option<CorrelationKey>],
    ) -> Option<(Route, Option<CorrelationKey>)> {
        let routes = self.routes.get(correlator_id)?;
        let mut hit: Option<(Route, Option<CorrelationKey>)> = None;
        for cand in candidates {
            if let Some(route) = routes.iter().find(|r| r.key == *cand) {
                hit = Some((route.clone(), cand.clone()));
                break;
            }
        }
        let (route, key) = hit?;
        self.remove_group(&route.group_id, route.target_instance);
        Some((route, key))
    }

    fn remove_group(&mut self, group_id: &str, target_instance: Uuid) {
        for routes in self.routes.values_mut() {
            routes.retain(|r| !(r.group_id == group_id && r.target_instance == target_instance));
        }
    }

    fn dequeue(&mut self, correlator_id: &str, key: Option<&CorrelationKey>) -> Option<QueuedMessage> {
        let queue = self.queues.get_mut(correlator_id)?;
        let pos = match key {
            // Default route: next message on the operation, oldest first.
            None => {
                if queue.is_empty() {
                    return None;
                }
                0
            }
            Some(k) => queue.iter().position(|m| m.keys.contains(k))?,
        };
        Some(queue.remove(pos))
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn create_instance(
        &self,
        process_id: &str,
        instantiating_correlator: &str,
    ) -> Result<ProcessInstance> {
        let instance = ProcessInstance {
            instance_id: Uuid::now_v7(),
            process_id: process_id.to_string(),
            state: InstanceState::Active,
            instantiating_correlator: Some(instantiating_correlator.to_string()),
            created_at: now_ms(),
        };
        let mut inner = self.inner.lock().await;
        inner.instances.insert(instance.instance_id, instance.clone());
        Ok(instance)
    }

    async fn load_instance(&self, instance_id: Uuid) -> Result<Option<ProcessInstance>> {
        Ok(self.inner.lock().await.instances.get(&instance_id).cloned())
    }

    async fn update_instance_state(&self, instance_id: Uuid, state: InstanceState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(instance) = inner.instances.get_mut(&instance_id) {
            instance.state = state;
        }
        Ok(())
    }

    async fn save_mex(&self, mex: &MessageExchange) -> Result<()> {
        self.inner.lock().await.mexes.insert(mex.mex_id, mex.clone());
        Ok(())
    }

    async fn load_mex(&self, mex_id: Uuid) -> Result<Option<MessageExchange>> {
        Ok(self.inner.lock().await.mexes.get(&mex_id).cloned())
    }

    async fn add_route(&self, correlator_id: &str, route: &Route) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .routes
            .entry(correlator_id.to_string())
            .or_default()
            .push(route.clone());
        Ok(())
    }

    async fn find_route(
        &self,
        correlator_id: &str,
        key: Option<&CorrelationKey>,
    ) -> Result<Option<Route>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .routes
            .get(correlator_id)
            .and_then(|routes| routes.iter().find(|r| r.key.as_ref() == key))
            .cloned())
    }

    async fn remove_routes(&self, group_id: &str, target_instance: Uuid) -> Result<()> {
        self.inner.lock().await.remove_group(group_id, target_instance);
        Ok(())
    }

    async fn consume_route(
        &self,
        correlator_id: &str,
        candidates: &[Option<CorrelationKey>],
    ) -> Result<Option<(Route, Option<CorrelationKey>)>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.match_route(correlator_id, candidates))
    }

    async fn enqueue_message(&self, correlator_id: &str, message: &QueuedMessage) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .queues
            .entry(correlator_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn consume_route_or_enqueue(
        &self,
        correlator_id: &str,
        candidates: &[Option<CorrelationKey>],
        message: &QueuedMessage,
    ) -> Result<Option<(Route, Option<CorrelationKey>)>> {
        let mut inner = self.inner.lock().await;
        if let Some(hit) = inner.match_route(correlator_id, candidates) {
            return Ok(Some(hit));
        }
        inner
            .queues
            .entry(correlator_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(None)
    }

    async fn dequeue_or_add_route(
        &self,
        correlator_id: &str,
        key: Option<&CorrelationKey>,
        route: &Route,
    ) -> Result<Option<QueuedMessage>> {
        let mut inner = self.inner.lock().await;
        if let Some(message) = inner.dequeue(correlator_id, key) {
            return Ok(Some(message));
        }
        inner
            .routes
            .entry(correlator_id.to_string())
            .or_default()
            .push(route.clone());
        Ok(None)
    }

    async fn expire_messages(
        &self,
        enqueued_before: Timestamp,
    ) -> Result<Vec<(String, QueuedMessage)>> {
        let mut inner = self.inner.lock().await;
        let mut expired = Vec::new();
        for (correlator_id, queue) in inner.queues.iter_mut() {
            let mut kept = Vec::with_capacity(queue.len());
            for message in queue.drain(..) {
                if message.enqueued_at < enqueued_before {
                    expired.push((correlator_id.clone(), message));
                } else {
                    kept.push(message);
                }
            }
            *queue = kept;
        }
        Ok(expired)
    }

    async fn schedule_job(&self, job: &Job) -> Result<()> {
        self.inner.lock().await.jobs.push(job.clone());
        Ok(())
    }

    async fn take_due_jobs(&self, now: Timestamp, max: usize) -> Result<Vec<Job>> {
        let mut inner = self.inner.lock().await;
        let mut due = Vec::new();
        let mut remaining = Vec::new();
        for job in inner.jobs.drain(..) {
            if job.fire_at <= now && due.len() < max {
                due.push(job);
            } else {
                remaining.push(job);
            }
        }
        inner.jobs = remaining;
        due.sort_by_key(|j| j.fire_at);
        Ok(due)
    }

    async fn append_event(&self, instance_id: Option<Uuid>, event: &RuntimeEvent) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.events.push((seq, instance_id, event.clone()));
        Ok(seq)
    }

    async fn read_events(
        &self,
        instance_id: Option<Uuid>,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .events
            .iter()
            .filter(|(seq, iid, _)| *seq >= from_seq && (instance_id.is_none() || *iid == instance_id))
            .map(|(seq, _, e)| (*seq, e.clone()))
            .collect())
    }
}
