//! Authoritative directory of agent types and their live instances.
//!
//! Descriptors are registered explicitly by the host; nothing is discovered
//! by scanning. Each descriptor carries a [`WorkerFactory`](maestro_core::WorkerFactory)
//! that builds the worker behind every instance bound to a
//! `(workspace, user)` pair.
//!
//! # Main types
//!
//! - [`Registry`] — Descriptor and instance directory with capability/tool/tag indexes.
//! - [`DescriptorSpec`] — Caller-supplied agent definition, validated on registration.
//! - [`AgentDescriptor`] — A registered agent type and its lifecycle status.
//! - [`AgentInstance`] — A live binding of a descriptor to a workspace and user.
//! - [`InstanceLease`] — Scoped instance ownership; dropping it destroys the instance.

/// Descriptor and instance types.
pub mod descriptor;
/// Scoped instance ownership.
pub mod lease;
/// The registry itself and its background sweep.
pub mod registry;

pub use descriptor::{
    slugify, AgentDescriptor, AgentInstance, DescriptorSpec, DescriptorStatus, InstanceStatus,
    RegistrationSource,
};
pub use lease::InstanceLease;
pub use registry::{Registry, RegistryConfig, RegistryStats};
