//! AgentWorker — the unit of execution bound to one agent identity.
//!
//! A worker owns one run-job queue subscription and one pub/sub handle scoped
//! to its id, plus a lazily-loaded root spell runner. Lifecycle is two-phase:
//! [`AgentWorker::create`] applies configuration and registers the queue
//! handler synchronously, then [`AgentWorker::spawn_start`] loads the root
//! spell and runs plugin start hooks on a background task, moving the state
//! machine `Created → Loading → Ready` (or `Failed`, terminal, when the root
//! spell cannot be loaded).
//!
//! `run_worker` never lets an error escape: every branch publishes exactly
//! one result or error event on the agent's public channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::FleetError;
use crate::fabric::{topics, JobQueue, PubSub};
use crate::messages::{AgentLogEvent, LogSeverity, RunJob, RunOutcome};
use crate::plugin::{AgentContext, CapabilityRegistry, PluginEventBus, PluginSet};
use crate::spell::{SpellEngine, SpellInput, SpellRunner};
use crate::store::{AgentRecord, SpellStore};

/// Fallback published when a spell execution dies without a usable message.
const EXECUTION_FALLBACK: &str = "Error running agent";

/// Startup/readiness state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Loading,
    Ready,
    /// Root spell load failed. Terminal — the worker stays not-ready until
    /// it is removed and re-added.
    Failed,
}

/// Configuration snapshot derived from the agent record.
///
/// Replaced atomically by `update`; never mutated in place.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub project_id: String,
    pub root_spell_id: Option<String>,
    pub secrets: HashMap<String, String>,
    pub public_variables: HashMap<String, Value>,
}

impl AgentConfig {
    fn from_record(record: &AgentRecord) -> Self {
        // Secrets are stored JSON-encoded; an undecodable blob logs and
        // yields no secrets rather than failing the whole worker.
        let secrets = match record.secrets.as_deref() {
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                warn!(agent_id = %record.id, "undecodable secrets blob: {e}");
                HashMap::new()
            }),
            None => HashMap::new(),
        };
        Self {
            name: record.name.clone().unwrap_or_else(|| "agent".to_string()),
            project_id: record.project_id.clone(),
            root_spell_id: record.root_spell_id.clone(),
            secrets,
            public_variables: record.public_variables.clone(),
        }
    }
}

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub pubsub: Arc<dyn PubSub>,
    pub queue: Arc<dyn JobQueue>,
    pub spell_store: Arc<dyn SpellStore>,
    pub engine: Arc<dyn SpellEngine>,
    pub plugins: Arc<PluginSet>,
    /// Response-timeout budget per spell invocation; expiry abandons the
    /// execution (it keeps running detached) and publishes a run error.
    pub job_timeout: Option<Duration>,
}

pub struct AgentWorker {
    id: String,
    config: RwLock<AgentConfig>,
    state: Mutex<WorkerState>,
    deps: WorkerDeps,
    root_runner: Mutex<Option<Arc<dyn SpellRunner>>>,
    plugin_buses: Mutex<Vec<Arc<PluginEventBus>>>,
    capabilities: Mutex<Option<CapabilityRegistry>>,
    start_task: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl AgentWorker {
    /// Build the worker and claim its run-job queue.
    ///
    /// Applies the record synchronously and registers the queue handler bound
    /// to this agent id. Spell loading and plugin start hooks run later, in
    /// [`spawn_start`].
    pub async fn create(record: &AgentRecord, deps: WorkerDeps) -> Result<Arc<Self>, FleetError> {
        let worker = Arc::new(Self {
            id: record.id.clone(),
            config: RwLock::new(AgentConfig::from_record(record)),
            state: Mutex::new(WorkerState::Created),
            deps,
            root_runner: Mutex::new(None),
            plugin_buses: Mutex::new(Vec::new()),
            capabilities: Mutex::new(None),
            start_task: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        info!(agent_id = %worker.id, name = %worker.config_snapshot().name, "creating agent worker");

        let handler_worker = worker.clone();
        worker
            .deps
            .queue
            .register_handler(
                &record.id,
                Arc::new(move |payload| {
                    let worker = handler_worker.clone();
                    Box::pin(async move {
                        match serde_json::from_value::<RunJob>(payload) {
                            Ok(job) => worker.run_worker(job).await,
                            Err(e) => {
                                warn!(agent_id = %worker.id, "malformed run job dropped: {e}")
                            }
                        }
                    })
                }),
            )
            .await?;

        Ok(worker)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_ready(&self) -> bool {
        self.state() == WorkerState::Ready
    }

    pub fn config_snapshot(&self) -> AgentConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn root_spell_id(&self) -> Option<String> {
        self.config.read().unwrap_or_else(|e| e.into_inner()).root_spell_id.clone()
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = next;
    }

    /// Replace the configuration snapshot. Never touches subscriptions; safe
    /// to call while `run_worker` is executing.
    pub fn update(&self, record: &AgentRecord) {
        let next = AgentConfig::from_record(record);
        info!(agent_id = %self.id, name = %next.name, "updated agent");
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        *config = next;
    }

    /// Kick off the asynchronous start phase.
    pub fn spawn_start(self: &Arc<Self>) {
        let worker = self.clone();
        let task = tokio::spawn(async move {
            worker.start().await;
        });
        let mut slot = self.start_task.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(task);
    }

    /// Load the root spell, wire plugin buses, run start hooks, flip ready.
    async fn start(self: &Arc<Self>) {
        self.set_state(WorkerState::Loading);
        let config = self.config_snapshot();

        match &config.root_spell_id {
            None => {
                self.warn("no root spell configured for agent", serde_json::json!({})).await;
            }
            Some(root_id) => {
                let loaded = match self.deps.spell_store.find(&config.project_id, root_id).await {
                    Ok(Some(spell)) => self.deps.engine.load(&spell).await,
                    Ok(None) => Err(FleetError::NotFound(format!("root spell {root_id}"))),
                    Err(e) => Err(e),
                };
                match loaded {
                    Ok(runner) => {
                        let mut slot = self.root_runner.lock().unwrap_or_else(|e| e.into_inner());
                        *slot = Some(runner);
                    }
                    Err(e) => {
                        self.error(
                            "failed to load root spell",
                            serde_json::json!({ "spellId": root_id, "error": e.to_string() }),
                        )
                        .await;
                        self.set_state(WorkerState::Failed);
                        return;
                    }
                }
            }
        }

        // Wire one event bus per plugin, then assemble the capability set.
        let mut buses = Vec::new();
        for plugin in self.deps.plugins.iter() {
            let bus = PluginEventBus::new(plugin.as_ref(), &self.id);
            if let Err(e) = bus.init(self.deps.pubsub.clone()).await {
                self.error(
                    "failed to initialize plugin bus",
                    serde_json::json!({ "plugin": plugin.name(), "error": e.to_string() }),
                )
                .await;
                continue;
            }
            bus.activate();
            buses.push(bus);
        }
        {
            let registry = CapabilityRegistry::assemble(&self.deps.plugins, &buses);
            let mut slot = self.capabilities.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(registry);
        }
        {
            let mut slot = self.plugin_buses.lock().unwrap_or_else(|e| e.into_inner());
            *slot = buses;
        }

        // Each start hook is isolated: one failing plugin cannot block
        // startup or the remaining hooks.
        let ctx = self.hook_context();
        for plugin in self.deps.plugins.iter() {
            if let Err(e) = plugin.on_agent_start(&ctx).await {
                self.error(
                    "error in agent start hook",
                    serde_json::json!({ "plugin": plugin.name(), "error": e.to_string() }),
                )
                .await;
            }
        }

        self.set_state(WorkerState::Ready);
        info!(agent_id = %self.id, name = %config.name, "agent worker ready");
    }

    fn hook_context(&self) -> AgentContext {
        let config = self.config_snapshot();
        let root_runner = self.root_runner.lock().unwrap_or_else(|e| e.into_inner()).clone();
        AgentContext {
            agent_id: self.id.clone(),
            project_id: config.project_id,
            root_runner,
        }
    }

    /// Process one run job. Every branch publishes exactly one event on the
    /// agent's public channel; errors never escape.
    pub async fn run_worker(self: &Arc<Self>, job: RunJob) {
        debug!(agent_id = %self.id, job_id = %job.job_id, "running worker");

        // Guard against stale subscriptions during reassignment: jobs
        // addressed to another id are dropped without a published event.
        if job.agent_id != self.id {
            debug!(
                agent_id = %self.id,
                job_agent_id = %job.agent_id,
                "job addressed to different agent, dropping"
            );
            return;
        }

        let config = self.config_snapshot();

        let spell = match self.deps.spell_store.find(&config.project_id, &job.spell_id).await {
            Ok(Some(spell)) => spell,
            Ok(None) => {
                tracing::error!(agent_id = %self.id, spell_id = %job.spell_id, "Spell not found");
                self.publish_outcome(RunOutcome::error(&job, &config.project_id, "Spell not found"))
                    .await;
                return;
            }
            Err(e) => {
                tracing::error!(agent_id = %self.id, spell_id = %job.spell_id, "spell lookup failed: {e}");
                self.publish_outcome(RunOutcome::error(
                    &job,
                    &config.project_id,
                    &safe_error_message(&e),
                ))
                .await;
                return;
            }
        };

        let runner = match self.deps.engine.load(&spell).await {
            Ok(runner) => runner,
            Err(e) => {
                tracing::error!(agent_id = %self.id, spell_id = %job.spell_id, "spell load failed: {e}");
                self.publish_outcome(RunOutcome::error(
                    &job,
                    &config.project_id,
                    &safe_error_message(&e),
                ))
                .await;
                return;
            }
        };

        // Worker secrets overlaid by job-supplied secrets, job values winning.
        let mut secrets = config.secrets.clone();
        secrets.extend(job.secrets.clone());

        let input = SpellInput {
            inputs: job.inputs.clone(),
            secrets,
            public_variables: config.public_variables.clone(),
            session_id: job.session_id.clone(),
            component_name: job.component_name.clone(),
            run_subspell: job.run_subspell,
        };

        debug!(agent_id = %self.id, spell_id = %job.spell_id, "running agent's spell");

        let result = match self.deps.job_timeout {
            None => runner.run(input).await,
            Some(budget) => {
                // Race the execution against the budget. Expiry abandons the
                // spawned task — it keeps running detached; this is a
                // response timeout, not cancellation.
                let task = tokio::spawn(async move { runner.run(input).await });
                match tokio::time::timeout(budget, task).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_err)) => {
                        tracing::error!(agent_id = %self.id, "spell task panicked: {join_err}");
                        Err(FleetError::Execution(EXECUTION_FALLBACK.to_string()))
                    }
                    Err(_) => {
                        self.publish_outcome(RunOutcome::error(
                            &job,
                            &config.project_id,
                            "spell execution timed out",
                        ))
                        .await;
                        return;
                    }
                }
            }
        };

        match result {
            Ok(output) => {
                self.publish_outcome(RunOutcome::success(&job, &config.project_id, output)).await;
            }
            Err(e) => {
                tracing::error!(agent_id = %self.id, spell_id = %job.spell_id, "error running agent spell: {e}");
                self.publish_outcome(RunOutcome::error(
                    &job,
                    &config.project_id,
                    &safe_error_message(&e),
                ))
                .await;
            }
        }
    }

    async fn publish_outcome(&self, outcome: RunOutcome) {
        let channel = topics::run_result(&self.id);
        match serde_json::to_value(&outcome) {
            Ok(value) => self.publish_event(&channel, value).await,
            Err(e) => warn!(agent_id = %self.id, "unserializable outcome: {e}"),
        }
    }

    /// Publish on the agent's event stream, stamping `agentId` and
    /// `projectId` — callers never set these themselves.
    pub async fn publish_event(&self, channel: &str, mut message: Value) {
        let project_id = self.config_snapshot().project_id;
        if let Some(obj) = message.as_object_mut() {
            obj.insert("agentId".into(), Value::String(self.id.clone()));
            obj.insert("projectId".into(), Value::String(project_id));
        }
        if let Err(e) = self.deps.pubsub.publish(channel, message).await {
            warn!(agent_id = %self.id, channel = %channel, "publish failed: {e}");
        }
    }

    /// Tear down the worker. Idempotent — a second call is a no-op.
    pub async fn on_destroy(self: &Arc<Self>) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Abort the start phase if it never finished.
        let task = {
            let mut slot = self.start_task.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(task) = task {
            task.abort();
        }

        let ctx = self.hook_context();
        for plugin in self.deps.plugins.iter() {
            if let Err(e) = plugin.on_agent_stop(&ctx).await {
                warn!(agent_id = %self.id, plugin = %plugin.name(), "agent stop hook failed: {e}");
            }
        }

        let buses = {
            let mut slot = self.plugin_buses.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *slot)
        };
        for bus in buses {
            bus.deactivate();
        }

        if let Err(e) = self.deps.queue.remove_handler(&self.id).await {
            warn!(agent_id = %self.id, "failed to release run queue: {e}");
        }

        self.log("destroyed agent", serde_json::json!({ "id": self.id })).await;
    }

    // ── log event helpers ─────────────────────────────────────────────────────
    //
    // Write to the local logger and publish the same signal on the agent log
    // channel so remote observers see what operators see.

    pub async fn log(&self, message: &str, data: Value) {
        info!(agent_id = %self.id, data = %data, "{message}");
        self.publish_log(LogSeverity::Log, message, data).await;
    }

    pub async fn warn(&self, message: &str, data: Value) {
        warn!(agent_id = %self.id, data = %data, "{message}");
        self.publish_log(LogSeverity::Warn, message, data).await;
    }

    pub async fn error(&self, message: &str, data: Value) {
        tracing::error!(agent_id = %self.id, data = %data, "{message}");
        self.publish_log(LogSeverity::Error, message, data).await;
    }

    async fn publish_log(&self, severity: LogSeverity, message: &str, data: Value) {
        let project_id = self.config_snapshot().project_id;
        let event = AgentLogEvent::new(&self.id, &project_id, severity, message, data);
        match serde_json::to_value(&event) {
            Ok(value) => self.publish_event(&topics::agent_log(&self.id), value).await,
            Err(e) => warn!(agent_id = %self.id, "unserializable log event: {e}"),
        }
    }
}

fn safe_error_message(e: &FleetError) -> String {
    match e {
        FleetError::Execution(message) => message.clone(),
        other => other.to_string(),
    }
}
