use crate::workflow::{TaskKind, WorkflowDefinition, WorkflowTask};
use maestro_core::{MaestroError, MaestroResult};
use std::collections::{HashMap, HashSet};

/// Structural checks run once, at registration.
pub fn validate_workflow(def: &WorkflowDefinition) -> MaestroResult<()> {
    if def.id.trim().is_empty() {
        return Err(MaestroError::Validation("workflow id must not be empty".into()));
    }
    if def.name.trim().is_empty() {
        return Err(MaestroError::Validation(format!(
            "workflow '{}' has no name",
            def.id
        )));
    }
    if def.tasks.is_empty() {
        return Err(MaestroError::Validation(format!(
            "workflow '{}' has no tasks",
            def.id
        )));
    }

    let mut ids = HashSet::new();
    for task in &def.tasks {
        if task.id.trim().is_empty() {
            return Err(MaestroError::Validation(format!(
                "workflow '{}' has a task with an empty id",
                def.id
            )));
        }
        if !ids.insert(task.id.as_str()) {
            return Err(MaestroError::Validation(format!(
                "workflow '{}' declares task '{}' twice",
                def.id, task.id
            )));
        }
        validate_task_body(task)?;
    }

    for task in &def.tasks {
        for dep in &task.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(MaestroError::Validation(format!(
                    "task '{}' depends on unknown task '{dep}'",
                    task.id
                )));
            }
        }
    }

    if let Some(task_id) = find_cycle(def) {
        return Err(MaestroError::Validation(format!(
            "workflow '{}' has a dependency cycle through task '{task_id}'",
            def.id
        )));
    }
    Ok(())
}

fn validate_task_body(task: &WorkflowTask) -> MaestroResult<()> {
    let missing = match task.kind {
        TaskKind::Agent => task
            .request_type
            .as_deref()
            .map_or(true, |t| t.trim().is_empty())
            .then_some("request_type"),
        TaskKind::Condition => task.condition.is_none().then_some("condition"),
        TaskKind::Data => task.operation.is_none().then_some("operation"),
        TaskKind::Custom => None,
    };
    match missing {
        Some(field) => Err(MaestroError::Validation(format!(
            "task '{}' is missing '{field}'",
            task.id
        ))),
        None => Ok(()),
    }
}

/// Returns a task on a cycle, if any.
pub(crate) fn find_cycle(def: &WorkflowDefinition) -> Option<String> {
    let deps: HashMap<&str, &[String]> = def
        .tasks
        .iter()
        .map(|t| (t.id.as_str(), t.depends_on.as_slice()))
        .collect();
    let mut visited: HashMap<&str, u8> = HashMap::new();
    for task in &def.tasks {
        if let Some(id) = dfs_cycle(task.id.as_str(), &deps, &mut visited) {
            return Some(id.to_string());
        }
    }
    None
}

fn dfs_cycle<'a>(
    id: &'a str,
    deps: &HashMap<&'a str, &'a [String]>,
    visited: &mut HashMap<&'a str, u8>,
) -> Option<&'a str> {
    match visited.get(id) {
        Some(1) => return Some(id), // back edge
        Some(2) => return None,
        _ => {}
    }
    visited.insert(id, 1);
    if let Some(edges) = deps.get(id) {
        for dep in edges.iter() {
            if let Some(hit) = dfs_cycle(dep.as_str(), deps, visited) {
                return Some(hit);
            }
        }
    }
    visited.insert(id, 2);
    None
}
