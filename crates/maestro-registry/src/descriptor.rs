use chrono::{DateTime, Utc};
use maestro_core::{MaestroError, MaestroResult, Tier};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an agent type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorStatus {
    /// Registered, no live instances.
    Registered,
    /// At least one live instance.
    Active,
    /// Missed its heartbeat window.
    Inactive,
    /// Switched off by an operator.
    Disabled,
    /// Marked broken.
    Error,
}

impl DescriptorStatus {
    /// Whether the dispatcher may route to this agent type.
    pub fn is_healthy(self) -> bool {
        matches!(self, DescriptorStatus::Registered | DescriptorStatus::Active)
    }
}

impl std::fmt::Display for DescriptorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescriptorStatus::Registered => write!(f, "registered"),
            DescriptorStatus::Active => write!(f, "active"),
            DescriptorStatus::Inactive => write!(f, "inactive"),
            DescriptorStatus::Disabled => write!(f, "disabled"),
            DescriptorStatus::Error => write!(f, "error"),
        }
    }
}

/// How a descriptor came to be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationSource {
    /// From the host's explicit registration list.
    Static,
    /// Registered at runtime through the API.
    Dynamic,
    /// Announced by an external discovery mechanism.
    Discovered,
}

impl Default for RegistrationSource {
    fn default() -> Self {
        RegistrationSource::Dynamic
    }
}

/// Caller-supplied definition of an agent type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorSpec {
    /// Human name; the descriptor id is derived from it.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Capability tags used for routing.
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Ceiling on live instances.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    /// Ceiling on concurrent dispatched work.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default)]
    pub cost_per_call: f64,
    /// Latency hint used until real measurements arrive.
    #[serde(default = "default_expected_latency_ms")]
    pub expected_latency_ms: u64,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub source: RegistrationSource,
}

fn default_max_instances() -> usize {
    10
}

fn default_max_concurrent() -> u32 {
    5
}

fn default_expected_latency_ms() -> u64 {
    1_000
}

impl DescriptorSpec {
    /// Spec with defaults for everything but name and capabilities.
    pub fn new(name: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            capabilities,
            tools: Vec::new(),
            tags: Vec::new(),
            max_instances: default_max_instances(),
            max_concurrent: default_max_concurrent(),
            cost_per_call: 0.0,
            expected_latency_ms: default_expected_latency_ms(),
            tier: Tier::default(),
            source: RegistrationSource::default(),
        }
    }

    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = max;
        self
    }

    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_cost(mut self, cost_per_call: f64) -> Self {
        self.cost_per_call = cost_per_call;
        self
    }

    pub fn with_latency(mut self, expected_latency_ms: u64) -> Self {
        self.expected_latency_ms = expected_latency_ms;
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_source(mut self, source: RegistrationSource) -> Self {
        self.source = source;
        self
    }

    /// Check the spec and return its derived id.
    pub fn validate(&self) -> MaestroResult<String> {
        let id = slugify(&self.name);
        if id.is_empty() {
            return Err(MaestroError::Validation(format!(
                "agent name '{}' does not yield a usable id",
                self.name
            )));
        }
        if self.capabilities.is_empty() {
            return Err(MaestroError::Validation(format!(
                "agent '{id}' declares no capabilities"
            )));
        }
        for list in [&self.capabilities, &self.tools, &self.tags] {
            if list.iter().any(|v| v.trim().is_empty()) {
                return Err(MaestroError::Validation(format!(
                    "agent '{id}' has an empty capability, tool or tag"
                )));
            }
        }
        if self.max_instances == 0 {
            return Err(MaestroError::Validation(format!(
                "agent '{id}': max_instances must be at least 1"
            )));
        }
        if self.max_concurrent == 0 {
            return Err(MaestroError::Validation(format!(
                "agent '{id}': max_concurrent must be at least 1"
            )));
        }
        if !self.cost_per_call.is_finite() || self.cost_per_call < 0.0 {
            return Err(MaestroError::Validation(format!(
                "agent '{id}': cost_per_call must be a non-negative number"
            )));
        }
        Ok(id)
    }
}

/// Derive a stable lowercase id: runs of non-alphanumerics become a single `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    slug
}

fn normalize(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = values.iter().map(|v| v.trim().to_string()).collect();
    out.sort();
    out.dedup();
    out
}

/// A registered agent type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Sorted, de-duplicated.
    pub capabilities: Vec<String>,
    pub tools: Vec<String>,
    pub tags: Vec<String>,
    pub max_instances: usize,
    pub max_concurrent: u32,
    pub cost_per_call: f64,
    pub expected_latency_ms: u64,
    pub tier: Tier,
    pub status: DescriptorStatus,
    pub source: RegistrationSource,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentDescriptor {
    pub(crate) fn from_spec(id: String, spec: DescriptorSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: spec.name.trim().to_string(),
            description: spec.description,
            capabilities: normalize(&spec.capabilities),
            tools: normalize(&spec.tools),
            tags: normalize(&spec.tags),
            max_instances: spec.max_instances,
            max_concurrent: spec.max_concurrent,
            cost_per_call: spec.cost_per_call,
            expected_latency_ms: spec.expected_latency_ms,
            tier: spec.tier,
            status: DescriptorStatus::Registered,
            source: spec.source,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    /// Whether every capability in `required` is declared.
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|c| self.capabilities.binary_search(c).is_ok())
    }
}

/// Status of a live instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Active,
    /// Too many consecutive errors; stays here until destroyed.
    Error,
}

/// A live binding of a descriptor to a `(workspace, user)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    pub id: Uuid,
    pub descriptor_id: String,
    pub workspace: String,
    pub user: String,
    #[serde(default)]
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: InstanceStatus,
    /// Consecutive errors since the last success.
    pub error_count: u32,
    pub total_errors: u64,
    pub last_error: Option<String>,
}
