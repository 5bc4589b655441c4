use crate::registry::Registry;
use maestro_core::Worker;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Scoped ownership of one agent instance.
///
/// Dropping the lease destroys the instance in the registry, on every exit
/// path including panics and cancelled futures. An instance already removed
/// by the reaper is not an error.
pub struct InstanceLease {
    registry: Arc<Registry>,
    instance_id: Uuid,
    agent_id: String,
    worker: Arc<dyn Worker>,
}

impl InstanceLease {
    pub(crate) fn new(
        registry: Arc<Registry>,
        instance_id: Uuid,
        agent_id: String,
        worker: Arc<dyn Worker>,
    ) -> Self {
        Self {
            registry,
            instance_id,
            agent_id,
            worker,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// The worker bound to this instance.
    pub fn worker(&self) -> Arc<dyn Worker> {
        Arc::clone(&self.worker)
    }

    /// Record a successful run against the instance.
    pub fn record_success(&self) {
        if let Err(e) = self.registry.record_instance_success(self.instance_id) {
            debug!(instance = %self.instance_id, error = %e, "Could not record instance success");
        }
    }

    /// Record a failed run against the instance.
    pub fn record_error(&self, message: &str) {
        if let Err(e) = self.registry.record_instance_error(self.instance_id, message) {
            debug!(instance = %self.instance_id, error = %e, "Could not record instance error");
        }
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        match self.registry.destroy_instance(self.instance_id) {
            Ok(()) => {}
            Err(maestro_core::MaestroError::NotFound(_)) => {
                debug!(instance = %self.instance_id, "Leased instance already removed");
            }
            Err(e) => {
                warn!(instance = %self.instance_id, error = %e, "Failed to release instance");
            }
        }
    }
}

impl std::fmt::Debug for InstanceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLease")
            .field("instance_id", &self.instance_id)
            .field("agent_id", &self.agent_id)
            .finish()
    }
}
