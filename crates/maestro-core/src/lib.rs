//! Core types, error taxonomy, and collaborator contracts for Maestro.
//!
//! Every other Maestro crate depends on this one. It defines the unified
//! error enum, the small shared enums used on the request path, the generic
//! [`Worker`] contract that agent implementations satisfy, and the narrow
//! interfaces to the external collaborators (long-term memory, metrics,
//! durable run state, event notification).
//!
//! # Main types
//!
//! - [`MaestroError`] — Unified error enum for all Maestro components.
//! - [`MaestroResult`] — Convenience alias for `Result<T, MaestroError>`.
//! - [`Worker`] / [`WorkerFactory`] — The opaque `run` contract behind every agent.
//! - [`MemoryStore`] — Best-effort long-term memory sink.
//! - [`MetricsSink`] — Fire-and-forget metrics recorder.
//! - [`StateStore`] — Scoped run-state snapshots.
//! - [`EventHookChain`] — Fan-out of [`MaestroEvent`]s to registered hooks.

/// Error taxonomy shared by all components.
pub mod error;
/// Runtime event notifications and hook chains.
pub mod events;
/// Long-term memory collaborator.
pub mod memory;
/// Metrics collaborator.
pub mod metrics;
/// Durable run-state collaborator.
pub mod state;
/// Shared request-path enums.
pub mod types;
/// The generic worker contract.
pub mod worker;

pub use error::{MaestroError, MaestroResult};
pub use events::{BroadcastHook, EventHook, EventHookChain, MaestroEvent};
pub use memory::{InMemoryMemoryStore, MemoryKind, MemoryRecord, MemoryStore};
pub use metrics::{
    DispatchRecord, ExecutionRecord, InMemoryMetrics, MetricsSink, MetricsSnapshot, NoopMetrics,
    TracingMetrics, WorkflowRecord,
};
pub use state::{FileStateStore, InMemoryStateStore, RunSnapshot, StateStore};
pub use types::{ExecutionMode, Priority, Tier};
pub use worker::{InstanceContext, SharedWorker, Worker, WorkerFactory, WorkerInput, WorkerOutput};
