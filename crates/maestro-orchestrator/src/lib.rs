//! Workflow orchestration and the platform facade for Maestro.
//!
//! A workflow is a declarative graph of tasks with dependencies. Definitions
//! are validated once at registration (including cycle detection); each
//! execution is then driven by its own loop that computes the ready set,
//! runs it with the workflow's strategy, retries failures with exponential
//! backoff and applies the fail-fast or continue policy.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Registers workflows and drives their executions.
//! - [`WorkflowDefinition`] / [`WorkflowTask`] — Immutable task graph and its nodes.
//! - [`WorkflowExecution`] — Per-execution task states and outputs.
//! - [`CustomHandler`] — User-registered body for `custom` tasks.
//! - [`Platform`] — Registry, dispatcher, executor and orchestrator wired together.

/// The orchestrator and its drive loop.
pub mod engine;
/// Execution and task state.
pub mod execution;
/// Condition, data and custom task bodies.
pub mod handlers;
/// Service wiring and lifecycle.
pub mod platform;
/// Definition-time checks.
pub mod validation;
/// Workflow definition types.
pub mod workflow;

pub use engine::{Orchestrator, OrchestratorConfig, WorkflowInput};
pub use execution::{TaskExecution, TaskStatus, WorkflowExecution, WorkflowStatus};
pub use handlers::{CustomHandler, CustomTaskInput, EchoHandler};
pub use platform::{Platform, PlatformCollaborators, PlatformConfig};
pub use validation::validate_workflow;
pub use workflow::{
    Condition, DataOperation, ErrorHandling, ExecutionStrategy, RetryPolicy, TaskKind,
    WorkflowDefinition, WorkflowTask,
};
