//! Integration tests for fleet-level agent lifecycle.
//!
//! Run with:
//!   cargo test --test fleet_lifecycle

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use spellfleet::fabric::memory::MemoryFabric;
use spellfleet::fabric::{topics, JobQueue, PubSub};
use spellfleet::plugin::PluginSet;
use spellfleet::spell::{EchoEngine, Spell};
use spellfleet::store::{AgentRecord, MemoryAgentStore, MemorySpellStore};
use spellfleet::{FleetError, FleetSupervisor, WorkerDeps};

// ── helpers ──────────────────────────────────────────────────────────────────

struct Fixture {
    fabric: Arc<MemoryFabric>,
    agents: Arc<MemoryAgentStore>,
    spells: Arc<MemorySpellStore>,
    supervisor: Arc<FleetSupervisor>,
}

async fn fixture() -> Fixture {
    let fabric = Arc::new(MemoryFabric::new(16));
    let agents = Arc::new(MemoryAgentStore::new());
    let spells = Arc::new(MemorySpellStore::new());
    let deps = WorkerDeps {
        pubsub: fabric.clone(),
        queue: fabric.clone(),
        spell_store: spells.clone(),
        engine: Arc::new(EchoEngine),
        plugins: Arc::new(PluginSet::new()),
        job_timeout: None,
    };
    let supervisor = FleetSupervisor::new(agents.clone(), deps);
    supervisor.init().await.unwrap();
    supervisor.heartbeat().await.unwrap();
    supervisor.start_work().await.unwrap();
    Fixture {
        fabric,
        agents,
        spells,
        supervisor,
    }
}

fn record(id: &str, enabled: bool) -> AgentRecord {
    AgentRecord {
        id: id.into(),
        project_id: "p1".into(),
        root_spell_id: None,
        enabled,
        name: Some("fleet test agent".into()),
        secrets: None,
        public_variables: HashMap::new(),
    }
}

fn seeded_spell(fx: &Fixture, id: &str) {
    fx.spells.insert(Spell {
        id: id.into(),
        project_id: "p1".into(),
        name: "echo".into(),
        graph: json!({}),
    });
}

fn run_payload(agent_id: &str, spell_id: &str) -> Value {
    json!({
        "inputs": {"text": "hello"},
        "jobId": "j1",
        "agentId": agent_id,
        "spellId": spell_id,
        "componentName": "default",
        "runSubspell": false,
        "secrets": {},
        "publicVariables": {},
    })
}

async fn collect(fabric: &Arc<MemoryFabric>, channel: &str) -> Arc<Mutex<Vec<Value>>> {
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    fabric
        .subscribe(
            channel,
            Arc::new(move |msg| {
                let sink = sink.clone();
                Box::pin(async move {
                    sink.lock().unwrap().push(msg);
                })
            }),
        )
        .await
        .unwrap();
    seen
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

// ── add / remove ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn add_unknown_agent_fails_with_not_found() {
    let fx = fixture().await;
    let err = fx.supervisor.add_agent("ghost").await.unwrap_err();
    assert!(matches!(err, FleetError::NotFound(_)));
    assert!(fx.supervisor.current_agents().is_empty());
}

#[tokio::test]
async fn disabled_agent_is_not_created() {
    let fx = fixture().await;
    fx.agents.insert(record("a1", false));

    fx.supervisor.add_agent("a1").await.unwrap();

    assert!(fx.supervisor.get_agent("a1").is_none());
}

#[tokio::test]
async fn concurrent_adds_create_exactly_one_worker() {
    let fx = fixture().await;
    fx.agents.insert(record("a1", true));
    seeded_spell(&fx, "s1");

    let mut handles = Vec::new();
    for _ in 0..10 {
        let supervisor = fx.supervisor.clone();
        handles.push(tokio::spawn(async move { supervisor.add_agent("a1").await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(fx.supervisor.current_agents(), vec!["a1".to_string()]);

    // A duplicate run subscription or queue handler would produce duplicate
    // results for a single run request.
    let results = collect(&fx.fabric, &topics::run_result("a1")).await;
    fx.fabric
        .publish(&topics::run_job("a1"), run_payload("a1", "s1"))
        .await
        .unwrap();
    settle().await;
    assert_eq!(results.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn remove_agent_is_idempotent() {
    let fx = fixture().await;
    fx.agents.insert(record("a1", true));
    fx.supervisor.add_agent("a1").await.unwrap();

    fx.supervisor.remove_agent("a1").await;
    fx.supervisor.remove_agent("a1").await;
    fx.supervisor.remove_agent("never-existed").await;

    assert!(fx.supervisor.current_agents().is_empty());
}

#[tokio::test]
async fn run_request_flows_from_channel_to_result() {
    let fx = fixture().await;
    fx.agents.insert(record("a1", true));
    seeded_spell(&fx, "s1");
    fx.supervisor.add_agent("a1").await.unwrap();

    let results = collect(&fx.fabric, &topics::run_result("a1")).await;
    fx.fabric
        .publish(&topics::run_job("a1"), run_payload("a1", "s1"))
        .await
        .unwrap();
    settle().await;

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["result"], json!({"text": "hello"}));
}

// ── reconciliation ───────────────────────────────────────────────────────────

#[tokio::test]
async fn reconcile_follows_enabled_flag() {
    let fx = fixture().await;
    fx.agents.insert(record("a1", true));
    seeded_spell(&fx, "s1");

    fx.supervisor.agent_updated("a1").await.unwrap();
    assert!(fx.supervisor.get_agent("a1").is_some());

    fx.agents.set_enabled("a1", false);
    fx.supervisor.agent_updated("a1").await.unwrap();
    assert!(fx.supervisor.get_agent("a1").is_none());

    fx.agents.set_enabled("a1", true);
    fx.supervisor.agent_updated("a1").await.unwrap();
    assert!(fx.supervisor.get_agent("a1").is_some());

    // The disable must have released the run subscription; a leftover one
    // would deliver this request twice after the re-enable resubscribes.
    let results = collect(&fx.fabric, &topics::run_result("a1")).await;
    fx.fabric
        .publish(&topics::run_job("a1"), run_payload("a1", "s1"))
        .await
        .unwrap();
    settle().await;
    assert_eq!(results.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn reconcile_propagates_config_changes() {
    let fx = fixture().await;
    fx.agents.insert(record("a1", true));
    fx.supervisor.add_agent("a1").await.unwrap();

    let mut updated = record("a1", true);
    updated.name = Some("renamed".into());
    updated.root_spell_id = Some("s9".into());
    fx.agents.insert(updated);
    fx.supervisor.agent_updated("a1").await.unwrap();

    let worker = fx.supervisor.get_agent("a1").unwrap();
    let config = worker.config_snapshot();
    assert_eq!(config.name, "renamed");
    assert_eq!(config.root_spell_id.as_deref(), Some("s9"));
}

#[tokio::test]
async fn control_queue_job_starts_agent() {
    let fx = fixture().await;
    fx.agents.insert(record("a1", true));

    fx.fabric
        .add_job(topics::CONTROL_QUEUE, json!({"agentId": "a1"}))
        .await
        .unwrap();
    settle().await;

    assert!(fx.supervisor.get_agent("a1").is_some());
}

#[tokio::test]
async fn update_channel_propagates_config() {
    let fx = fixture().await;
    fx.agents.insert(record("a1", true));
    fx.supervisor.add_agent("a1").await.unwrap();

    let mut updated = record("a1", true);
    updated.name = Some("renamed".into());
    fx.agents.insert(updated);
    fx.fabric
        .publish(&topics::agent_update("a1"), json!({}))
        .await
        .unwrap();
    settle().await;

    let worker = fx.supervisor.get_agent("a1").unwrap();
    assert_eq!(worker.config_snapshot().name, "renamed");
}

#[tokio::test]
async fn update_channel_triggers_reconcile() {
    let fx = fixture().await;
    fx.agents.insert(record("a1", true));
    fx.supervisor.add_agent("a1").await.unwrap();

    fx.agents.set_enabled("a1", false);
    fx.fabric
        .publish(&topics::agent_update("a1"), json!({}))
        .await
        .unwrap();
    settle().await;

    assert!(fx.supervisor.get_agent("a1").is_none());
}

#[tokio::test]
async fn fleet_delete_broadcast_removes_agent() {
    let fx = fixture().await;
    fx.agents.insert(record("a1", true));
    fx.supervisor.add_agent("a1").await.unwrap();

    fx.fabric
        .publish(topics::AGENT_DELETE, json!({"agentId": "a1"}))
        .await
        .unwrap();
    settle().await;

    assert!(fx.supervisor.get_agent("a1").is_none());
}

// ── heartbeats ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn heartbeat_pong_lists_owned_agents() {
    let fx = fixture().await;
    fx.agents.insert(record("a1", true));
    fx.supervisor.add_agent("a1").await.unwrap();

    let pongs = collect(&fx.fabric, topics::HEARTBEAT_PONG).await;
    fx.fabric
        .publish(topics::HEARTBEAT_PING, json!({}))
        .await
        .unwrap();
    settle().await;

    let pongs = pongs.lock().unwrap();
    assert_eq!(pongs.len(), 1);
    assert_eq!(pongs[0], json!(["a1"]));
}

#[tokio::test]
async fn fleet_ping_answered_with_inventory() {
    let fx = fixture().await;
    fx.agents.insert(record("a1", true));
    fx.supervisor.add_agent("a1").await.unwrap();

    let pongs = collect(&fx.fabric, topics::FLEET_PONG).await;
    fx.fabric
        .publish(topics::FLEET_PING, json!({}))
        .await
        .unwrap();
    settle().await;

    let pongs = pongs.lock().unwrap();
    assert_eq!(pongs.len(), 1);
    assert_eq!(pongs[0]["currentAgents"], json!(["a1"]));
    assert!(pongs[0]["id"].as_str().is_some());
}

// ── shutdown ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_drains_every_agent() {
    let fx = fixture().await;
    fx.agents.insert(record("a1", true));
    fx.agents.insert(record("a2", true));
    fx.supervisor.add_agent("a1").await.unwrap();
    fx.supervisor.add_agent("a2").await.unwrap();

    fx.supervisor.shutdown().await;

    assert!(fx.supervisor.current_agents().is_empty());
}
