use serde::{Deserialize, Serialize};

/// Request priority, used by priority-based routing and confidence scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// The default.
    Normal,
    /// Prefer reliable agents.
    High,
    /// Prefer fast agents.
    Urgent,
}

impl Priority {
    /// Multiplier applied to dispatch confidence.
    pub fn confidence_multiplier(self) -> f64 {
        match self {
            Priority::Low => 0.85,
            Priority::Normal => 0.95,
            Priority::High | Priority::Urgent => 1.0,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

/// Declared quality tier of an agent type. Ordered: `Basic < Standard < Premium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Cheap, best-effort agents.
    Basic,
    /// The default.
    Standard,
    /// Highest quality agents.
    Premium,
}

impl Default for Tier {
    fn default() -> Self {
        Tier::Standard
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Basic => write!(f, "basic"),
            Tier::Standard => write!(f, "standard"),
            Tier::Premium => write!(f, "premium"),
        }
    }
}

/// How the executor hands a run back to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Block until a terminal state and return the result.
    Sync,
    /// Start in the background and return the run id.
    Async,
    /// Like `Async`; progress is observed through the event stream.
    Streaming,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Sync
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Sync => write!(f, "sync"),
            ExecutionMode::Async => write!(f, "async"),
            ExecutionMode::Streaming => write!(f, "streaming"),
        }
    }
}
