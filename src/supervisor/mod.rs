//! FleetSupervisor — process-wide authority over which agents are running.
//!
//! The supervisor owns the fleet registry and reconciles it against the
//! authoritative agent records: enable/disable and configuration-changed
//! signals arrive over the fabric, and each is resolved by comparing the
//! current record with the currently running worker rather than by replaying
//! message history, so out-of-order control messages still converge.
//!
//! # Reconciliation discipline
//!
//! `add_agent`, `remove_agent` and `agent_updated` all suspend mid-sequence
//! (record fetch, subscription setup), so a check-then-act against the
//! registry is racy on its own. Every mutating path takes a per-agent-id
//! async lock first; that single-flight discipline is what upholds the
//! at-most-one-worker-per-id invariant.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::error::FleetError;
use crate::fabric::topics;
use crate::messages::{FleetPong, UpdateJob};
use crate::store::AgentStore;
use crate::worker::{AgentWorker, WorkerDeps};

/// Cross-cutting hook invoked when a worker joins or leaves the registry.
/// Hooks run synchronously, in registration order.
pub type AgentHook = Box<dyn Fn(&Arc<AgentWorker>) + Send + Sync>;

pub struct FleetSupervisor {
    deps: WorkerDeps,
    agent_store: Arc<dyn AgentStore>,
    /// Agent id -> live worker. Mutated only under the per-id reconcile
    /// lock; read concurrently from message handlers.
    registry: RwLock<HashMap<String, Arc<AgentWorker>>>,
    /// Per-agent-id single-flight locks serializing reconcile-and-mutate.
    reconcile_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Channels this process already subscribed; a second claim is a no-op.
    subscriptions: Mutex<HashSet<String>>,
    add_handlers: Mutex<Vec<AgentHook>>,
    remove_handlers: Mutex<Vec<AgentHook>>,
}

impl FleetSupervisor {
    pub fn new(agent_store: Arc<dyn AgentStore>, deps: WorkerDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            agent_store,
            registry: RwLock::new(HashMap::new()),
            reconcile_locks: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashSet::new()),
            add_handlers: Mutex::new(Vec::new()),
            remove_handlers: Mutex::new(Vec::new()),
        })
    }

    /// Wire the fleet-wide subscriptions: delete broadcasts and the worker
    /// liveness heartbeat. Call once after construction.
    pub async fn init(self: &Arc<Self>) -> Result<(), FleetError> {
        let supervisor = self.clone();
        self.deps
            .pubsub
            .subscribe(
                topics::AGENT_DELETE,
                Arc::new(move |message| {
                    let supervisor = supervisor.clone();
                    Box::pin(async move {
                        let Some(agent_id) = agent_id_from(&message) else {
                            warn!("agent delete broadcast without an agent id");
                            return;
                        };
                        info!(agent_id = %agent_id, "agent deleted, removing from fleet");
                        supervisor.remove_agent(&agent_id).await;
                    })
                }),
            )
            .await?;

        let supervisor = self.clone();
        self.deps
            .pubsub
            .subscribe(
                topics::HEARTBEAT_PING,
                Arc::new(move |_message| {
                    let supervisor = supervisor.clone();
                    Box::pin(async move {
                        trace!("got heartbeat ping");
                        let ids = supervisor.current_agents();
                        if let Err(e) = supervisor
                            .deps
                            .pubsub
                            .publish(topics::HEARTBEAT_PONG, serde_json::json!(ids))
                            .await
                        {
                            warn!("heartbeat pong failed: {e}");
                        }
                    })
                }),
            )
            .await?;

        Ok(())
    }

    /// Answer cluster-inventory pings with this process's owned agent ids.
    pub async fn heartbeat(self: &Arc<Self>) -> Result<(), FleetError> {
        let supervisor = self.clone();
        self.deps
            .pubsub
            .subscribe(
                topics::FLEET_PING,
                Arc::new(move |_message| {
                    let supervisor = supervisor.clone();
                    Box::pin(async move {
                        let pong = FleetPong {
                            id: Uuid::new_v4(),
                            current_agents: supervisor.current_agents(),
                        };
                        match serde_json::to_value(&pong) {
                            Ok(value) => {
                                if let Err(e) = supervisor
                                    .deps
                                    .pubsub
                                    .publish(topics::FLEET_PONG, value)
                                    .await
                                {
                                    warn!("fleet pong failed: {e}");
                                }
                            }
                            Err(e) => warn!("unserializable fleet pong: {e}"),
                        }
                    })
                }),
            )
            .await
    }

    /// Start consuming the control queue: each `{agentId}` payload triggers
    /// one reconciliation. Errors are logged and the loop continues.
    pub async fn start_work(self: &Arc<Self>) -> Result<(), FleetError> {
        info!("waiting for agent control jobs");
        let supervisor = self.clone();
        self.deps
            .queue
            .register_handler(
                topics::CONTROL_QUEUE,
                Arc::new(move |payload| {
                    let supervisor = supervisor.clone();
                    Box::pin(async move {
                        let job: UpdateJob = match serde_json::from_value(payload) {
                            Ok(job) => job,
                            Err(e) => {
                                warn!("malformed control job dropped: {e}");
                                return;
                            }
                        };
                        info!(agent_id = %job.agent_id, "got agent control job");
                        if let Err(e) = supervisor.agent_updated(&job.agent_id).await {
                            error!(agent_id = %job.agent_id, "reconciliation failed: {e}");
                        }
                    })
                }),
            )
            .await
    }

    pub fn register_add_handler(&self, handler: AgentHook) {
        debug!("registering add agent handler");
        let mut handlers = self.add_handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.push(handler);
    }

    pub fn register_remove_handler(&self, handler: AgentHook) {
        debug!("registering remove agent handler");
        let mut handlers = self.remove_handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.push(handler);
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<Arc<AgentWorker>> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        registry.get(agent_id).cloned()
    }

    /// Ids of the workers this process currently owns.
    pub fn current_agents(&self) -> Vec<String> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        registry.keys().cloned().collect()
    }

    fn lock_for(&self, agent_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.reconcile_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(agent_id.to_string()).or_default().clone()
    }

    /// Drop the per-id lock entry once no worker remains for the id. Skipped
    /// while another task still holds or awaits the same lock.
    fn prune_lock(&self, agent_id: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.reconcile_locks.lock().unwrap_or_else(|e| e.into_inner());
        // Two clones are accounted for: the map's and the caller's. More
        // means a waiter is queued behind the caller.
        if Arc::strong_count(lock) <= 2 {
            if let Some(current) = locks.get(agent_id) {
                if Arc::ptr_eq(current, lock) {
                    locks.remove(agent_id);
                }
            }
        }
    }

    #[cfg(test)]
    fn reconcile_lock_count(&self) -> usize {
        let locks = self.reconcile_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.len()
    }

    /// Create and register the worker for `agent_id`.
    ///
    /// Fails with `NotFound` when no record exists. A disabled record logs
    /// and creates nothing; `enabled` is authoritative.
    pub async fn add_agent(self: &Arc<Self>, agent_id: &str) -> Result<(), FleetError> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;
        let result = self.add_agent_locked(agent_id).await;
        if self.get_agent(agent_id).is_none() {
            self.prune_lock(agent_id, &lock);
        }
        result
    }

    async fn add_agent_locked(self: &Arc<Self>, agent_id: &str) -> Result<(), FleetError> {
        info!(agent_id = %agent_id, "creating agent");

        let record = self.agent_store.find(agent_id).await?.ok_or_else(|| {
            FleetError::NotFound(format!("agent {agent_id} not found when creating agent"))
        })?;

        if !record.enabled {
            info!(agent_id = %agent_id, "agent is disabled, skipping creation");
            return Ok(());
        }

        if self.get_agent(agent_id).is_some() {
            debug!(agent_id = %agent_id, "worker already present, skipping creation");
            return Ok(());
        }

        let worker = AgentWorker::create(&record, self.deps.clone()).await?;

        self.listen_for_run(agent_id).await?;
        self.listen_for_changes(agent_id).await?;

        // Add handlers see a fully wired worker before it is published in
        // the registry.
        {
            let handlers = self.add_handlers.lock().unwrap_or_else(|e| e.into_inner());
            for handler in handlers.iter() {
                handler(&worker);
            }
        }

        {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            registry.insert(agent_id.to_string(), worker.clone());
        }

        worker.spawn_start();
        info!(agent_id = %agent_id, "agent worker registered");
        Ok(())
    }

    /// Tear down and deregister the worker for `agent_id`. Safe to call when
    /// the agent is already absent.
    pub async fn remove_agent(self: &Arc<Self>, agent_id: &str) {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;
        self.remove_agent_locked(agent_id).await;
        self.prune_lock(agent_id, &lock);
    }

    async fn remove_agent_locked(self: &Arc<Self>, agent_id: &str) {
        info!(agent_id = %agent_id, "removing agent");

        let worker = self.get_agent(agent_id);

        // Remove handlers run first so they can still reach the worker.
        if let Some(worker) = &worker {
            let handlers = self.remove_handlers.lock().unwrap_or_else(|e| e.into_inner());
            for handler in handlers.iter() {
                handler(worker);
            }
        }

        if let Some(worker) = &worker {
            worker.on_destroy().await;
        }

        {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            registry.remove(agent_id);
        }

        for channel in [
            topics::run_job(agent_id),
            topics::agent_update(agent_id),
            topics::agent_delete(agent_id),
        ] {
            if let Err(e) = self.deps.pubsub.unsubscribe(&channel).await {
                warn!(agent_id = %agent_id, channel = %channel, "unsubscribe failed: {e}");
            }
            let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            subs.remove(&channel);
        }
    }

    /// Reconcile the running worker for `agent_id` against its record.
    ///
    /// Fails with `NotFound` when no record exists; callers on message paths
    /// log and move on.
    pub async fn agent_updated(self: &Arc<Self>, agent_id: &str) -> Result<(), FleetError> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;
        let result = self.agent_updated_locked(agent_id).await;
        if self.get_agent(agent_id).is_none() {
            self.prune_lock(agent_id, &lock);
        }
        result
    }

    async fn agent_updated_locked(self: &Arc<Self>, agent_id: &str) -> Result<(), FleetError> {
        info!(agent_id = %agent_id, "reconciling agent");

        let record = self.agent_store.find(agent_id).await?.ok_or_else(|| {
            FleetError::NotFound(format!("agent {agent_id} not found when updating agent"))
        })?;

        let present = self.get_agent(agent_id).is_some();

        if record.enabled && !present {
            self.add_agent_locked(agent_id).await?;
        }
        if !record.enabled && present {
            self.remove_agent_locked(agent_id).await;
        }

        // Propagate configuration changes, root spell id included, onto a
        // surviving worker.
        if let Some(worker) = self.get_agent(agent_id) {
            worker.update(&record);
        }

        Ok(())
    }

    /// Relay run requests published on the agent's run channel into its job
    /// queue. Subscribes at most once per id for this process's lifetime.
    pub async fn listen_for_run(self: &Arc<Self>, agent_id: &str) -> Result<(), FleetError> {
        let channel = topics::run_job(agent_id);
        if !self.claim_subscription(&channel) {
            return Ok(());
        }
        debug!(agent_id = %agent_id, channel = %channel, "listening for run requests");

        let supervisor = self.clone();
        let id = agent_id.to_string();
        self.deps
            .pubsub
            .subscribe(
                &channel,
                Arc::new(move |mut message| {
                    let supervisor = supervisor.clone();
                    let id = id.clone();
                    Box::pin(async move {
                        if supervisor.get_agent(&id).is_none() {
                            error!(agent_id = %id, "agent not found when running spell");
                            return;
                        }
                        // Stamp the owning id so a stale publisher cannot
                        // address another worker through this channel.
                        if let Some(obj) = message.as_object_mut() {
                            obj.insert("agentId".into(), Value::String(id.clone()));
                        }
                        if let Err(e) = supervisor.deps.queue.add_job(&id, message).await {
                            error!(agent_id = %id, "failed to enqueue run job: {e}");
                        }
                    })
                }),
            )
            .await
    }

    /// Subscribe to the agent's update and delete channels. Subscribes at
    /// most once per id for this process's lifetime.
    pub async fn listen_for_changes(self: &Arc<Self>, agent_id: &str) -> Result<(), FleetError> {
        let update_channel = topics::agent_update(agent_id);
        if self.claim_subscription(&update_channel) {
            let queue = self.deps.queue.clone();
            let id = agent_id.to_string();
            self.deps
                .pubsub
                .subscribe(
                    &update_channel,
                    Arc::new(move |_message| {
                        let queue = queue.clone();
                        let id = id.clone();
                        Box::pin(async move {
                            // Reconciliation runs on the control-queue
                            // consumer; the handler only enqueues, so the
                            // queue keeps per-id ordering.
                            info!(agent_id = %id, "agent updated, scheduling reconciliation");
                            let job = serde_json::json!({ "agentId": id });
                            if let Err(e) = queue.add_job(topics::CONTROL_QUEUE, job).await {
                                error!(agent_id = %id, "failed to enqueue reconcile job: {e}");
                            }
                        })
                    }),
                )
                .await?;
        }

        let delete_channel = topics::agent_delete(agent_id);
        if self.claim_subscription(&delete_channel) {
            let supervisor = self.clone();
            let id = agent_id.to_string();
            self.deps
                .pubsub
                .subscribe(
                    &delete_channel,
                    Arc::new(move |_message| {
                        let supervisor = supervisor.clone();
                        let id = id.clone();
                        Box::pin(async move {
                            info!(agent_id = %id, "agent deleted, removing");
                            supervisor.remove_agent(&id).await;
                        })
                    }),
                )
                .await?;
        }

        Ok(())
    }

    /// Remove every worker this process owns. Used at shutdown.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("shutting down fleet");
        for agent_id in self.current_agents() {
            self.remove_agent(&agent_id).await;
        }
    }

    /// Record a subscription claim; false when the channel was already
    /// claimed.
    fn claim_subscription(&self, channel: &str) -> bool {
        let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subs.insert(channel.to_string())
    }
}

fn agent_id_from(message: &Value) -> Option<String> {
    match message {
        Value::String(id) => Some(id.clone()),
        Value::Object(obj) => obj
            .get("agentId")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn agent_id_from_string_or_object() {
        assert_eq!(agent_id_from(&json!("a1")).as_deref(), Some("a1"));
        assert_eq!(
            agent_id_from(&json!({"agentId": "a2"})).as_deref(),
            Some("a2")
        );
        assert_eq!(agent_id_from(&json!(7)), None);
    }

    #[test]
    fn subscription_claims_are_single_shot() {
        let supervisor = FleetSupervisor::new(
            Arc::new(crate::store::MemoryAgentStore::new()),
            crate::worker::tests::test_deps(),
        );
        assert!(supervisor.claim_subscription("agent:a1:run"));
        assert!(!supervisor.claim_subscription("agent:a1:run"));
    }

    fn record(id: &str) -> crate::store::AgentRecord {
        crate::store::AgentRecord {
            id: id.into(),
            project_id: "p1".into(),
            root_spell_id: None,
            enabled: true,
            name: None,
            secrets: None,
            public_variables: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn lock_entry_released_with_the_worker() {
        let agents = Arc::new(crate::store::MemoryAgentStore::new());
        agents.insert(record("a1"));
        let supervisor = FleetSupervisor::new(agents, crate::worker::tests::test_deps());

        supervisor.add_agent("a1").await.unwrap();
        assert_eq!(supervisor.reconcile_lock_count(), 1);

        supervisor.remove_agent("a1").await;
        assert_eq!(supervisor.reconcile_lock_count(), 0);
    }

    #[tokio::test]
    async fn unknown_ids_leave_no_lock_entry() {
        let supervisor = FleetSupervisor::new(
            Arc::new(crate::store::MemoryAgentStore::new()),
            crate::worker::tests::test_deps(),
        );

        assert!(supervisor.agent_updated("ghost").await.is_err());
        assert!(supervisor.add_agent("ghost").await.is_err());
        supervisor.remove_agent("ghost").await;

        assert_eq!(supervisor.reconcile_lock_count(), 0);
    }
}
