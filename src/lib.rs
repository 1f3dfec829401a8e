//! Spellfleet — agent fleet lifecycle over a pub/sub + job-queue fabric.
//!
//! A fleet worker process hosts many [`worker::AgentWorker`]s, one per
//! enabled agent. The [`supervisor::FleetSupervisor`] reconciles the running
//! set against the authoritative agent records, reacting to control messages
//! on the fabric. [`plugin`] routes per-agent plugin events and actions, and
//! [`relay::EventRelay`] bridges agent channels to in-process observers.
//!
//! The fabric itself ([`fabric::PubSub`] + [`fabric::JobQueue`]) and the
//! record stores are external collaborators behind traits; in-memory
//! implementations back single-process deployments and tests.

pub mod config;
pub mod error;
pub mod fabric;
pub mod logger;
pub mod messages;
pub mod plugin;
pub mod relay;
pub mod spell;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use error::FleetError;
pub use supervisor::FleetSupervisor;
pub use worker::{AgentWorker, WorkerDeps, WorkerState};
