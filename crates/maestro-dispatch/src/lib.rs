//! Capability-based request routing for Maestro.
//!
//! The dispatcher keeps a local [`CapabilityProfile`] per registered agent
//! type, filters them against a request's required capabilities, health,
//! spare capacity and constraints, and picks one with the requested
//! [`DispatchStrategy`]. Every successful dispatch borrows one load slot that
//! must be handed back with [`Dispatcher::release`].
//!
//! # Main types
//!
//! - [`Dispatcher`] — Atomic filter/select/increment over the registry.
//! - [`DispatchRequest`] / [`DispatchResult`] — Immutable request and decision.
//! - [`CapabilityProfile`] — Per-agent load, latency and success-rate cache.
//! - [`RoutingTable`] — Static request type to capability mapping.

/// The dispatcher and its statistics.
pub mod dispatcher;
/// Dispatcher-local routing profiles.
pub mod profile;
/// Request, result and strategy types.
pub mod request;
/// Request type to capability table.
pub mod routing;
mod strategy;

pub use dispatcher::{DispatchHistoryEntry, Dispatcher, DispatcherConfig, DispatcherStats};
pub use profile::CapabilityProfile;
pub use request::{
    DispatchConstraints, DispatchOutcome, DispatchRequest, DispatchResult, DispatchStrategy,
    RoutingMetadata,
};
pub use routing::RoutingTable;
