//! Spellfleet — fleet worker entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Init logger at default level
//!   3. Load config
//!   4. Build the in-memory fabric, stores, and spell engine
//!   5. Start the supervisor: fleet subscriptions, heartbeat, control queue
//!   6. Start the event relay and a demo observer
//!   7. Run until ctrl-c, then drain the fleet

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use spellfleet::fabric::memory::MemoryFabric;
use spellfleet::plugin::PluginSet;
use spellfleet::relay::EventRelay;
use spellfleet::spell::{EchoEngine, Spell};
use spellfleet::store::{AgentRecord, MemoryAgentStore, MemorySpellStore};
use spellfleet::{config, logger, FleetError, FleetSupervisor, WorkerDeps};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), FleetError> {
    // Load .env if present — ignore errors (file is optional).
    let _ = dotenvy::dotenv();

    // Bootstrap logger at "info" before config is available.
    logger::init("info")?;

    let config = config::load()?;

    info!(
        worker_name = %config.worker_name,
        log_level = %config.log_level,
        queue_depth = config.queue_depth,
        "config loaded"
    );
    if config.log_level != "info" {
        // The subscriber is already installed; RUST_LOG is the way to change
        // the level of a running deployment.
        info!(log_level = %config.log_level, "configured level applies via RUST_LOG");
    }

    let fabric = Arc::new(MemoryFabric::new(config.queue_depth));
    let agent_store = Arc::new(MemoryAgentStore::new());
    let spell_store = Arc::new(MemorySpellStore::new());

    seed_demo_agent(&agent_store, &spell_store);

    let deps = WorkerDeps {
        pubsub: fabric.clone(),
        queue: fabric.clone(),
        spell_store,
        engine: Arc::new(EchoEngine),
        plugins: Arc::new(PluginSet::new()),
        job_timeout: config.job_timeout,
    };

    let supervisor = FleetSupervisor::new(agent_store, deps);
    supervisor.init().await?;
    supervisor.heartbeat().await?;
    supervisor.start_work().await?;

    let relay = EventRelay::new(256);
    relay.start(fabric.clone()).await?;

    let shutdown = CancellationToken::new();

    // Demo observer: mirror relayed agent events into the local log until
    // shutdown.
    let mut events = relay.subscribe();
    let observer_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = observer_shutdown.cancelled() => return,
                event = events.recv() => match event {
                    Ok(event) => info!(
                        agent_id = %event.agent_id,
                        message_type = %event.message_type,
                        "relayed agent event"
                    ),
                    Err(_) => return,
                },
            }
        }
    });

    supervisor.add_agent("demo").await?;
    info!(worker_name = %config.worker_name, "fleet worker running, ctrl-c to stop");

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
        }
        signal_shutdown.cancel();
    });

    shutdown.cancelled().await;
    info!("shutting down");
    supervisor.shutdown().await;

    Ok(())
}

/// Seed one echo agent so the demo binary has something to run.
fn seed_demo_agent(agents: &MemoryAgentStore, spells: &MemorySpellStore) {
    spells.insert(Spell {
        id: "demo-spell".into(),
        project_id: "demo-project".into(),
        name: "echo".into(),
        graph: serde_json::json!({}),
    });
    agents.insert(AgentRecord {
        id: "demo".into(),
        project_id: "demo-project".into(),
        root_spell_id: Some("demo-spell".into()),
        enabled: true,
        name: Some("demo agent".into()),
        secrets: None,
        public_variables: Default::default(),
    });
}
