use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Static request type → required capabilities table.
///
/// A request type with no entry requires a capability of the same name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingTable {
    routes: HashMap<String, Vec<String>>,
}

impl RoutingTable {
    /// Empty table; every type routes to the capability of the same name.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the built-in request types.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.insert("research", vec!["research".into()]);
        table.insert("analysis", vec!["analysis".into()]);
        table.insert("writing", vec!["writing".into()]);
        table.insert("summarization", vec!["writing".into(), "analysis".into()]);
        table.insert("coding", vec!["coding".into()]);
        table.insert("code_review", vec!["coding".into(), "review".into()]);
        table.insert("translation", vec!["translation".into()]);
        table
    }

    /// Set the capabilities required by `request_type`, replacing any previous entry.
    pub fn insert(&mut self, request_type: impl Into<String>, capabilities: Vec<String>) {
        let mut caps = capabilities;
        caps.sort();
        caps.dedup();
        self.routes.insert(request_type.into(), caps);
    }

    /// Apply overrides from configuration.
    pub fn extend(&mut self, overrides: &HashMap<String, Vec<String>>) {
        for (request_type, caps) in overrides {
            self.insert(request_type.clone(), caps.clone());
        }
    }

    /// Required capabilities for a request type, sorted.
    pub fn resolve(&self, request_type: &str) -> Vec<String> {
        match self.routes.get(request_type) {
            Some(caps) => caps.clone(),
            None => vec![request_type.to_string()],
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
