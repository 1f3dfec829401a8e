//! Plugin capability interface and per-agent event/action routing.
//!
//! Plugins extend agents without the worker or supervisor knowing their
//! internals. Each plugin declares its events and actions once; a
//! [`PluginEventBus`] (one per plugin per agent) forwards emitted events onto
//! a named channel of the central bus and dispatches inbound actions to the
//! declared handlers.
//!
//! Plugins are registered at process initialization as an ordered
//! [`PluginSet`] and always iterated in registration order — routing never
//! depends on map iteration order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, trace};

use crate::error::FleetError;
use crate::fabric::{topics, PubSub};
use crate::spell::SpellRunner;

// ── Declarations ──────────────────────────────────────────────────────────────

/// A named event a plugin may emit.
#[derive(Debug, Clone)]
pub struct EventDefinition {
    pub name: String,
    pub display_name: String,
}

/// Handler invoked when an action with the matching name arrives.
pub type ActionHandler =
    Arc<dyn Fn(ActionPayload) -> BoxFuture<'static, Result<(), FleetError>> + Send + Sync>;

/// A named action a plugin responds to.
#[derive(Clone)]
pub struct ActionDefinition {
    pub name: String,
    pub display_name: String,
    pub handler: ActionHandler,
}

/// Wire payload of an inbound action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPayload {
    pub action_name: String,
    #[serde(default)]
    pub event: Value,
    #[serde(default)]
    pub data: Value,
}

/// A named value type a plugin contributes to the capability registry.
#[derive(Debug, Clone)]
pub struct ValueTypeDef {
    pub name: String,
    pub display_name: String,
}

/// A named node type a plugin contributes to the capability registry.
#[derive(Debug, Clone)]
pub struct NodeTypeDef {
    pub name: String,
    pub display_name: String,
}

/// Context handed to agent start/stop hooks.
pub struct AgentContext {
    pub agent_id: String,
    pub project_id: String,
    /// The loaded root spell runner, when the agent has one.
    pub root_runner: Option<Arc<dyn SpellRunner>>,
}

/// A pluggable capability bound into every agent on this worker process.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Events this plugin may emit. Declared once; immutable afterward.
    fn events(&self) -> Vec<EventDefinition> {
        Vec::new()
    }

    /// Actions this plugin responds to. Declared once; immutable afterward.
    fn actions(&self) -> Vec<ActionDefinition> {
        Vec::new()
    }

    fn value_types(&self) -> Vec<ValueTypeDef> {
        Vec::new()
    }

    fn node_types(&self) -> Vec<NodeTypeDef> {
        Vec::new()
    }

    /// Runs during agent startup. A failing hook is logged and never blocks
    /// the remaining hooks or the agent becoming ready.
    async fn on_agent_start(&self, _ctx: &AgentContext) -> Result<(), FleetError> {
        Ok(())
    }

    /// Runs during agent teardown.
    async fn on_agent_stop(&self, _ctx: &AgentContext) -> Result<(), FleetError> {
        Ok(())
    }
}

/// Ordered list of plugins, fixed at process initialization.
#[derive(Default, Clone)]
pub struct PluginSet {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

// ── PluginEventBus ────────────────────────────────────────────────────────────

/// Per-plugin, per-agent event/action router.
///
/// `init` wires declared events to `agent:<id>:<plugin>:event` on the central
/// bus and subscribes `agent:<id>:<plugin>:action` to the internal
/// dispatcher. `activate`/`deactivate` silence event emission without
/// touching subscriptions.
pub struct PluginEventBus {
    plugin_name: String,
    agent_id: String,
    enabled: AtomicBool,
    initialized: AtomicBool,
    declared_events: Mutex<HashSet<String>>,
    actions: Mutex<HashMap<String, ActionHandler>>,
    central: Mutex<Option<Arc<dyn PubSub>>>,
}

impl PluginEventBus {
    pub fn new(plugin: &dyn Plugin, agent_id: &str) -> Arc<Self> {
        let declared_events = plugin.events().into_iter().map(|e| e.name).collect();
        let actions = plugin
            .actions()
            .into_iter()
            .map(|a| (a.name, a.handler))
            .collect();
        Arc::new(Self {
            plugin_name: plugin.name().to_string(),
            agent_id: agent_id.to_string(),
            enabled: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            declared_events: Mutex::new(declared_events),
            actions: Mutex::new(actions),
            central: Mutex::new(None),
        })
    }

    /// Wire this bus to the central bus. Runs exactly once; repeat calls are
    /// no-ops.
    pub async fn init(self: &Arc<Self>, central: Arc<dyn PubSub>) -> Result<(), FleetError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!(plugin = %self.plugin_name, "plugin bus already initialized");
            return Ok(());
        }

        let action_channel = topics::plugin_action(&self.agent_id, &self.plugin_name);
        let bus = self.clone();
        central
            .subscribe(
                &action_channel,
                Arc::new(move |message| {
                    let bus = bus.clone();
                    Box::pin(async move {
                        let payload: ActionPayload = match serde_json::from_value(message) {
                            Ok(p) => p,
                            Err(e) => {
                                error!(plugin = %bus.plugin_name, "malformed action payload: {e}");
                                return;
                            }
                        };
                        // Handler errors are plugin defects; surface them loudly.
                        if let Err(e) = bus.handle_action(payload).await {
                            error!(plugin = %bus.plugin_name, "action handler failed: {e}");
                        }
                    })
                }),
            )
            .await?;

        let mut slot = self.central.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(central);
        Ok(())
    }

    /// Forward a declared event onto the central bus. No-op while the plugin
    /// is deactivated or for event names the plugin never declared.
    pub async fn emit_event(&self, name: &str, mut payload: Value) -> Result<(), FleetError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        {
            let declared = self.declared_events.lock().unwrap_or_else(|e| e.into_inner());
            if !declared.contains(name) {
                return Ok(());
            }
        }
        let central = {
            let slot = self.central.lock().unwrap_or_else(|e| e.into_inner());
            slot.clone()
        };
        let Some(central) = central else {
            return Err(FleetError::Fabric(format!(
                "plugin {} emitted before init",
                self.plugin_name
            )));
        };

        if let Some(obj) = payload.as_object_mut() {
            obj.insert("eventName".into(), Value::String(name.to_string()));
        }
        debug!(plugin = %self.plugin_name, event = %name, "forwarding event to central bus");
        central
            .publish(&topics::plugin_event(&self.agent_id, &self.plugin_name), payload)
            .await
    }

    /// Dispatch an inbound action to its registered handler.
    ///
    /// Unknown action names are silently ignored — plugins may loosely share
    /// an action channel namespace. Handler errors propagate to the caller.
    pub async fn handle_action(&self, payload: ActionPayload) -> Result<(), FleetError> {
        trace!(plugin = %self.plugin_name, action = %payload.action_name, "handling action");
        let handler = {
            let actions = self.actions.lock().unwrap_or_else(|e| e.into_inner());
            actions.get(&payload.action_name).cloned()
        };
        match handler {
            Some(handler) => handler(payload).await,
            None => Ok(()),
        }
    }

    pub fn activate(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        debug!(plugin = %self.plugin_name, "plugin activated");
    }

    pub fn deactivate(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        debug!(plugin = %self.plugin_name, "plugin deactivated");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }
}

// ── CapabilityRegistry ────────────────────────────────────────────────────────

/// Capabilities contributed by every plugin, assembled once per agent.
///
/// Later registrations of the same name silently overwrite earlier ones —
/// last-registered-wins, not an error.
#[derive(Default)]
pub struct CapabilityRegistry {
    pub values: HashMap<String, ValueTypeDef>,
    pub nodes: HashMap<String, NodeTypeDef>,
    pub emitters: HashMap<String, Arc<PluginEventBus>>,
}

impl CapabilityRegistry {
    pub fn assemble(plugins: &PluginSet, buses: &[Arc<PluginEventBus>]) -> Self {
        let mut registry = Self::default();
        for plugin in plugins.iter() {
            for value in plugin.value_types() {
                registry.values.insert(value.name.clone(), value);
            }
            for node in plugin.node_types() {
                registry.nodes.insert(node.name.clone(), node);
            }
        }
        for bus in buses {
            registry
                .emitters
                .insert(bus.plugin_name().to_string(), bus.clone());
        }
        registry
    }
}
