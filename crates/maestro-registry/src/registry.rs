use crate::descriptor::{
    AgentDescriptor, AgentInstance, DescriptorSpec, DescriptorStatus, InstanceStatus,
};
use crate::lease::InstanceLease;
use chrono::{DateTime, Utc};
use maestro_core::{InstanceContext, MaestroError, MaestroResult, Worker, WorkerFactory};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Registry tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Expected heartbeat period. A descriptor is flipped to `inactive`
    /// after three periods without contact.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Instances idle for longer than this are destroyed by the reaper.
    #[serde(default = "default_instance_idle_secs")]
    pub instance_idle_secs: u64,
    /// Period of the background sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Consecutive errors after which an instance moves to `error`.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_instance_idle_secs() -> u64 {
    3_600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_error_threshold() -> u32 {
    5
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            instance_idle_secs: default_instance_idle_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            error_threshold: default_error_threshold(),
        }
    }
}

impl RegistryConfig {
    fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.heartbeat_interval_secs.saturating_mul(3)) as i64)
    }

    fn idle_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.instance_idle_secs as i64)
    }
}

/// Point-in-time counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub descriptors: usize,
    pub instances: usize,
    pub errored_instances: usize,
    pub descriptors_by_status: HashMap<String, usize>,
}

struct DescriptorEntry {
    descriptor: AgentDescriptor,
    factory: Arc<dyn WorkerFactory>,
    instances: HashSet<Uuid>,
}

impl DescriptorEntry {
    /// Refresh the heartbeat and bring an `inactive` descriptor back.
    fn revive(&mut self, now: DateTime<Utc>) {
        self.descriptor.last_heartbeat = now;
        if self.descriptor.status == DescriptorStatus::Inactive {
            self.descriptor.status = if self.instances.is_empty() {
                DescriptorStatus::Registered
            } else {
                DescriptorStatus::Active
            };
            info!(agent = %self.descriptor.id, status = %self.descriptor.status, "Agent back from inactive");
        }
    }
}

struct InstanceEntry {
    instance: AgentInstance,
    worker: Arc<dyn Worker>,
    /// Held by a run; the reaper leaves leased instances alone.
    leased: bool,
}

#[derive(Default)]
struct RegistryState {
    descriptors: HashMap<String, DescriptorEntry>,
    instances: HashMap<Uuid, InstanceEntry>,
    by_capability: HashMap<String, BTreeSet<String>>,
    by_tool: HashMap<String, BTreeSet<String>>,
    by_tag: HashMap<String, BTreeSet<String>>,
}

fn index_insert(index: &mut HashMap<String, BTreeSet<String>>, keys: &[String], id: &str) {
    for key in keys {
        index.entry(key.clone()).or_default().insert(id.to_string());
    }
}

fn index_remove(index: &mut HashMap<String, BTreeSet<String>>, keys: &[String], id: &str) {
    for key in keys {
        if let Some(ids) = index.get_mut(key) {
            ids.remove(id);
            if ids.is_empty() {
                index.remove(key);
            }
        }
    }
}

fn index_lookup(index: &HashMap<String, BTreeSet<String>>, key: &str) -> Vec<String> {
    index
        .get(key)
        .map(|ids| ids.iter().cloned().collect())
        .unwrap_or_default()
}

impl RegistryState {
    fn descriptor_mut(&mut self, id: &str) -> MaestroResult<&mut DescriptorEntry> {
        self.descriptors
            .get_mut(id)
            .ok_or_else(|| MaestroError::NotFound(format!("agent '{id}' is not registered")))
    }

    fn insert_descriptor(
        &mut self,
        id: String,
        spec: DescriptorSpec,
        factory: Arc<dyn WorkerFactory>,
    ) {
        let descriptor = AgentDescriptor::from_spec(id.clone(), spec, Utc::now());
        index_insert(&mut self.by_capability, &descriptor.capabilities, &id);
        index_insert(&mut self.by_tool, &descriptor.tools, &id);
        index_insert(&mut self.by_tag, &descriptor.tags, &id);
        info!(
            agent = %id,
            capabilities = ?descriptor.capabilities,
            source = ?descriptor.source,
            "Registered agent"
        );
        self.descriptors.insert(
            id,
            DescriptorEntry {
                descriptor,
                factory,
                instances: HashSet::new(),
            },
        );
    }

    /// Run activity on `instance_id` counts as contact from its agent type.
    fn record_contact(&mut self, instance_id: Uuid, now: DateTime<Utc>) {
        let Some(entry) = self.instances.get_mut(&instance_id) else {
            return;
        };
        entry.instance.last_activity = now;
        let descriptor_id = entry.instance.descriptor_id.clone();
        if let Some(owner) = self.descriptors.get_mut(&descriptor_id) {
            owner.revive(now);
        }
    }

    fn remove_instance(&mut self, instance_id: Uuid) -> MaestroResult<AgentInstance> {
        let entry = self
            .instances
            .remove(&instance_id)
            .ok_or_else(|| MaestroError::NotFound(format!("instance {instance_id}")))?;
        let descriptor_id = entry.instance.descriptor_id.clone();
        if let Some(owner) = self.descriptors.get_mut(&descriptor_id) {
            owner.instances.remove(&instance_id);
            if owner.instances.is_empty()
                && matches!(
                    owner.descriptor.status,
                    DescriptorStatus::Active | DescriptorStatus::Inactive
                )
            {
                owner.descriptor.status = DescriptorStatus::Registered;
            }
        }
        Ok(entry.instance)
    }
}

/// Authoritative directory of agent types and their live instances.
///
/// All mutations take the single write lock; lookups take the read lock.
/// No method holds the lock across an `.await`.
pub struct Registry {
    config: RegistryConfig,
    state: RwLock<RegistryState>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            state: RwLock::new(RegistryState::default()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register an agent type and return its derived id.
    pub fn register(
        &self,
        spec: DescriptorSpec,
        factory: Arc<dyn WorkerFactory>,
    ) -> MaestroResult<String> {
        let id = spec.validate()?;
        let mut state = self.state.write();
        if state.descriptors.contains_key(&id) {
            return Err(MaestroError::Conflict(format!(
                "agent '{id}' is already registered"
            )));
        }
        state.insert_descriptor(id.clone(), spec, factory);
        Ok(id)
    }

    /// Register an explicit list of agent types. Either all are registered or none.
    pub fn register_all(
        &self,
        entries: Vec<(DescriptorSpec, Arc<dyn WorkerFactory>)>,
    ) -> MaestroResult<Vec<String>> {
        let mut ids = Vec::with_capacity(entries.len());
        let mut seen = HashSet::new();
        for (spec, _) in &entries {
            let id = spec.validate()?;
            if !seen.insert(id.clone()) {
                return Err(MaestroError::Conflict(format!(
                    "agent '{id}' appears twice in the batch"
                )));
            }
            ids.push(id);
        }

        let mut state = self.state.write();
        if let Some(taken) = ids.iter().find(|id| state.descriptors.contains_key(*id)) {
            return Err(MaestroError::Conflict(format!(
                "agent '{taken}' is already registered"
            )));
        }
        for (id, (spec, factory)) in ids.iter().zip(entries) {
            state.insert_descriptor(id.clone(), spec, factory);
        }
        Ok(ids)
    }

    /// Remove an agent type. Fails while any instance is still bound to it.
    pub fn unregister_descriptor(&self, id: &str) -> MaestroResult<AgentDescriptor> {
        let mut state = self.state.write();
        let live = state.descriptor_mut(id)?.instances.len();
        if live > 0 {
            return Err(MaestroError::Conflict(format!(
                "agent '{id}' still has {live} live instance(s)"
            )));
        }
        let entry = state
            .descriptors
            .remove(id)
            .ok_or_else(|| MaestroError::NotFound(format!("agent '{id}' is not registered")))?;
        let d = &entry.descriptor;
        index_remove(&mut state.by_capability, &d.capabilities, id);
        index_remove(&mut state.by_tool, &d.tools, id);
        index_remove(&mut state.by_tag, &d.tags, id);
        info!(agent = %id, "Unregistered agent");
        Ok(entry.descriptor)
    }

    /// Create a live instance bound to `(workspace, user)`.
    pub fn create_instance(
        &self,
        descriptor_id: &str,
        workspace: &str,
        user: &str,
        config: serde_json::Value,
    ) -> MaestroResult<Uuid> {
        self.insert_instance(descriptor_id, workspace, user, config, false)
            .map(|(id, _)| id)
    }

    /// Create an instance and hand back a lease that destroys it on drop.
    pub fn lease_instance(
        self: &Arc<Self>,
        descriptor_id: &str,
        workspace: &str,
        user: &str,
        config: serde_json::Value,
    ) -> MaestroResult<InstanceLease> {
        let (id, worker) = self.insert_instance(descriptor_id, workspace, user, config, true)?;
        Ok(InstanceLease::new(
            Arc::clone(self),
            id,
            descriptor_id.to_string(),
            worker,
        ))
    }

    /// Take ownership of an existing instance (e.g. one created at dispatch time).
    pub fn adopt_instance(self: &Arc<Self>, instance_id: Uuid) -> MaestroResult<InstanceLease> {
        let (agent_id, worker) = {
            let mut state = self.state.write();
            let entry = state
                .instances
                .get_mut(&instance_id)
                .ok_or_else(|| MaestroError::NotFound(format!("instance {instance_id}")))?;
            if entry.leased {
                return Err(MaestroError::Conflict(format!(
                    "instance {instance_id} is already leased"
                )));
            }
            if entry.instance.status == InstanceStatus::Error {
                return Err(MaestroError::Conflict(format!(
                    "instance {instance_id} is in error state"
                )));
            }
            entry.leased = true;
            entry.instance.last_activity = Utc::now();
            (entry.instance.descriptor_id.clone(), Arc::clone(&entry.worker))
        };
        Ok(InstanceLease::new(
            Arc::clone(self),
            instance_id,
            agent_id,
            worker,
        ))
    }

    fn insert_instance(
        &self,
        descriptor_id: &str,
        workspace: &str,
        user: &str,
        config: serde_json::Value,
        leased: bool,
    ) -> MaestroResult<(Uuid, Arc<dyn Worker>)> {
        if workspace.trim().is_empty() || user.trim().is_empty() {
            return Err(MaestroError::Validation(
                "workspace and user must not be empty".into(),
            ));
        }

        let mut state = self.state.write();
        let entry = state.descriptor_mut(descriptor_id)?;
        match entry.descriptor.status {
            DescriptorStatus::Disabled | DescriptorStatus::Error => {
                return Err(MaestroError::Conflict(format!(
                    "agent '{descriptor_id}' is {}",
                    entry.descriptor.status
                )));
            }
            _ => {}
        }
        if entry.instances.len() >= entry.descriptor.max_instances {
            return Err(MaestroError::Capacity(format!(
                "agent '{descriptor_id}' reached its limit of {} instance(s)",
                entry.descriptor.max_instances
            )));
        }

        let instance_id = Uuid::new_v4();
        let ctx = InstanceContext {
            instance_id,
            agent_id: descriptor_id.to_string(),
            workspace: workspace.to_string(),
            user: user.to_string(),
            config: config.clone(),
        };
        let worker = entry.factory.create(&ctx)?;

        let now = Utc::now();
        entry.instances.insert(instance_id);
        entry.descriptor.last_heartbeat = now;
        if matches!(
            entry.descriptor.status,
            DescriptorStatus::Registered | DescriptorStatus::Inactive
        ) {
            entry.descriptor.status = DescriptorStatus::Active;
        }

        state.instances.insert(
            instance_id,
            InstanceEntry {
                instance: AgentInstance {
                    id: instance_id,
                    descriptor_id: descriptor_id.to_string(),
                    workspace: workspace.to_string(),
                    user: user.to_string(),
                    config,
                    created_at: now,
                    last_activity: now,
                    status: InstanceStatus::Active,
                    error_count: 0,
                    total_errors: 0,
                    last_error: None,
                },
                worker: Arc::clone(&worker),
                leased,
            },
        );
        debug!(agent = %descriptor_id, instance = %instance_id, workspace, "Instance created");
        Ok((instance_id, worker))
    }

    /// Destroy an instance.
    pub fn destroy_instance(&self, instance_id: Uuid) -> MaestroResult<()> {
        let removed = self.state.write().remove_instance(instance_id)?;
        debug!(agent = %removed.descriptor_id, instance = %instance_id, "Instance destroyed");
        Ok(())
    }

    pub fn get_descriptor(&self, id: &str) -> Option<AgentDescriptor> {
        self.state
            .read()
            .descriptors
            .get(id)
            .map(|e| e.descriptor.clone())
    }

    /// All descriptors, ordered by id.
    pub fn list_descriptors(&self) -> Vec<AgentDescriptor> {
        let state = self.state.read();
        let mut out: Vec<AgentDescriptor> = state
            .descriptors
            .values()
            .map(|e| e.descriptor.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn get_instance(&self, instance_id: Uuid) -> Option<AgentInstance> {
        self.state
            .read()
            .instances
            .get(&instance_id)
            .map(|e| e.instance.clone())
    }

    pub fn instances_of(&self, descriptor_id: &str) -> Vec<AgentInstance> {
        let state = self.state.read();
        let Some(entry) = state.descriptors.get(descriptor_id) else {
            return Vec::new();
        };
        let mut out: Vec<AgentInstance> = entry
            .instances
            .iter()
            .filter_map(|id| state.instances.get(id).map(|e| e.instance.clone()))
            .collect();
        out.sort_by_key(|i| i.created_at);
        out
    }

    pub fn instance_count(&self, descriptor_id: &str) -> usize {
        self.state
            .read()
            .descriptors
            .get(descriptor_id)
            .map_or(0, |e| e.instances.len())
    }

    /// Live instance count per descriptor.
    pub fn instance_counts(&self) -> HashMap<String, usize> {
        self.state
            .read()
            .descriptors
            .iter()
            .map(|(id, e)| (id.clone(), e.instances.len()))
            .collect()
    }

    pub fn find_by_capability(&self, capability: &str) -> Vec<String> {
        index_lookup(&self.state.read().by_capability, capability)
    }

    pub fn find_by_tool(&self, tool: &str) -> Vec<String> {
        index_lookup(&self.state.read().by_tool, tool)
    }

    pub fn find_by_tag(&self, tag: &str) -> Vec<String> {
        index_lookup(&self.state.read().by_tag, tag)
    }

    /// Descriptors declaring every capability in `required`, ordered by id.
    pub fn find_by_capabilities(&self, required: &[String]) -> Vec<String> {
        let state = self.state.read();
        let mut sets = required.iter().map(|c| state.by_capability.get(c));
        let Some(Some(first)) = sets.next() else {
            return Vec::new();
        };
        let mut acc: BTreeSet<String> = first.clone();
        for set in sets {
            match set {
                Some(s) => acc.retain(|id| s.contains(id)),
                None => return Vec::new(),
            }
        }
        acc.into_iter().collect()
    }

    /// Record contact from an agent type. Revives `inactive` descriptors.
    pub fn heartbeat(&self, id: &str) -> MaestroResult<()> {
        let mut state = self.state.write();
        state.descriptor_mut(id)?.revive(Utc::now());
        Ok(())
    }

    /// Operator status change. `registered`/`active` are normalised against the
    /// live instance count.
    pub fn set_status(&self, id: &str, status: DescriptorStatus) -> MaestroResult<()> {
        let mut state = self.state.write();
        let entry = state.descriptor_mut(id)?;
        let next = match status {
            DescriptorStatus::Registered | DescriptorStatus::Active => {
                if entry.instances.is_empty() {
                    DescriptorStatus::Registered
                } else {
                    DescriptorStatus::Active
                }
            }
            other => other,
        };
        if next != entry.descriptor.status {
            info!(agent = %id, from = %entry.descriptor.status, to = %next, "Agent status changed");
            entry.descriptor.status = next;
        }
        Ok(())
    }

    /// Mark activity on an instance and its agent type.
    pub fn touch_instance(&self, instance_id: Uuid) -> MaestroResult<()> {
        let mut state = self.state.write();
        if !state.instances.contains_key(&instance_id) {
            return Err(MaestroError::NotFound(format!("instance {instance_id}")));
        }
        state.record_contact(instance_id, Utc::now());
        Ok(())
    }

    /// Count an error against an instance. Returns the resulting status.
    pub fn record_instance_error(
        &self,
        instance_id: Uuid,
        message: &str,
    ) -> MaestroResult<InstanceStatus> {
        let mut state = self.state.write();
        let status = {
            let entry = state
                .instances
                .get_mut(&instance_id)
                .ok_or_else(|| MaestroError::NotFound(format!("instance {instance_id}")))?;
            let instance = &mut entry.instance;
            instance.error_count += 1;
            instance.total_errors += 1;
            instance.last_error = Some(message.to_string());
            if instance.status == InstanceStatus::Active
                && instance.error_count >= self.config.error_threshold
            {
                instance.status = InstanceStatus::Error;
                warn!(
                    instance = %instance_id,
                    agent = %instance.descriptor_id,
                    errors = instance.error_count,
                    "Instance moved to error after consecutive failures"
                );
            }
            instance.status
        };
        state.record_contact(instance_id, Utc::now());
        Ok(status)
    }

    /// Reset the consecutive error counter after a successful run.
    pub fn record_instance_success(&self, instance_id: Uuid) -> MaestroResult<()> {
        let mut state = self.state.write();
        let entry = state
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| MaestroError::NotFound(format!("instance {instance_id}")))?;
        entry.instance.error_count = 0;
        state.record_contact(instance_id, Utc::now());
        Ok(())
    }

    /// Flip `active` descriptors without contact for 3× the heartbeat interval to `inactive`.
    /// A descriptor with a leased instance is mid-run and is left alone.
    pub fn check_heartbeats(&self) -> Vec<String> {
        self.check_heartbeats_at(Utc::now())
    }

    /// [`check_heartbeats`](Self::check_heartbeats) against an explicit clock.
    pub fn check_heartbeats_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = self.config.heartbeat_timeout();
        let mut state = self.state.write();
        let RegistryState {
            descriptors,
            instances,
            ..
        } = &mut *state;
        let mut flipped = Vec::new();
        for (id, entry) in descriptors.iter_mut() {
            let running = entry
                .instances
                .iter()
                .any(|iid| instances.get(iid).is_some_and(|i| i.leased));
            let d = &mut entry.descriptor;
            if d.status == DescriptorStatus::Active
                && !running
                && now - d.last_heartbeat > timeout
            {
                d.status = DescriptorStatus::Inactive;
                warn!(agent = %id, last_heartbeat = %d.last_heartbeat, "Agent missed heartbeat");
                flipped.push(id.clone());
            }
        }
        flipped.sort();
        flipped
    }

    /// Destroy unleased instances idle beyond the retention window.
    pub fn reap_idle_instances(&self) -> Vec<Uuid> {
        self.reap_idle_instances_at(Utc::now())
    }

    /// [`reap_idle_instances`](Self::reap_idle_instances) against an explicit clock.
    pub fn reap_idle_instances_at(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let window = self.config.idle_window();
        let mut state = self.state.write();
        let idle: Vec<Uuid> = state
            .instances
            .values()
            .filter(|e| !e.leased && now - e.instance.last_activity > window)
            .map(|e| e.instance.id)
            .collect();
        for id in &idle {
            if let Ok(instance) = state.remove_instance(*id) {
                info!(agent = %instance.descriptor_id, instance = %id, "Reaped idle instance");
            }
        }
        idle
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        let mut by_status: HashMap<String, usize> = HashMap::new();
        for entry in state.descriptors.values() {
            *by_status
                .entry(entry.descriptor.status.to_string())
                .or_insert(0) += 1;
        }
        RegistryStats {
            descriptors: state.descriptors.len(),
            instances: state.instances.len(),
            errored_instances: state
                .instances
                .values()
                .filter(|e| e.instance.status == InstanceStatus::Error)
                .count(),
            descriptors_by_status: by_status,
        }
    }

    /// Start the heartbeat/reaper sweep. Calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                let stale = registry.check_heartbeats();
                let reaped = registry.reap_idle_instances();
                if !stale.is_empty() || !reaped.is_empty() {
                    debug!(
                        inactive = stale.len(),
                        reaped = reaped.len(),
                        "Registry sweep finished"
                    );
                }
            }
        }));
        info!(period_secs = period.as_secs(), "Registry sweep started");
    }

    /// Stop the background sweep.
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            info!("Registry sweep stopped");
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
