//! Run lifecycle, timeouts and result caching for Maestro agents.
//!
//! A run moves `pending → running → {completed | failed | timeout | cancelled}`
//! and never leaves a terminal state. Each run owns an instance lease, a
//! state snapshot for its duration and, when routed by the dispatcher, one
//! borrowed load slot.
//!
//! # Main types
//!
//! - [`Executor`] — Starts, tracks, cancels and cleans up runs.
//! - [`ExecuteRequest`] / [`ExecutionOutcome`] — Input and return value of [`Executor::execute`].
//! - [`ExecutionContext`] / [`ExecutionResult`] — Immutable run input and its evolving result.
//! - [`ResultCache`] — Content-addressed cache of successful synchronous results.

/// Content-addressed result cache.
pub mod cache;
/// The executor and its sweeps.
pub mod executor;
/// Run contexts, results and statistics.
pub mod types;

pub use cache::{cache_key, ResultCache};
pub use executor::{Executor, ExecutorConfig};
pub use types::{
    ExecuteRequest, ExecutionContext, ExecutionOutcome, ExecutionResult, ExecutionStatus,
    ExecutorStats,
};
