use crate::execution::{TaskStatus, WorkflowExecution, WorkflowStatus};
use crate::handlers::{
    apply_data_operation, evaluate_condition, CustomHandler, CustomTaskInput, EchoHandler,
};
use crate::validation::validate_workflow;
use crate::workflow::{
    ErrorHandling, ExecutionStrategy, RetryPolicy, TaskKind, WorkflowDefinition, WorkflowTask,
};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use maestro_core::{
    BroadcastHook, EventHook, EventHookChain, MaestroError, MaestroEvent, MaestroResult,
    MetricsSink, NoopMetrics, WorkflowRecord,
};
use maestro_dispatch::{DispatchRequest, Dispatcher};
use maestro_executor::{ExecutionStatus, Executor};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Orchestrator ceilings and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Non-terminal executions allowed at once.
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,
    /// Tasks running at once, across all executions.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Retry policy for workflows that do not set one.
    #[serde(default)]
    pub default_retry: RetryPolicy,
    #[serde(default = "default_execution_retention_secs")]
    pub execution_retention_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_max_concurrent_workflows() -> usize {
    10
}

fn default_max_concurrent_tasks() -> usize {
    10
}

fn default_execution_retention_secs() -> u64 {
    3_600
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_event_buffer() -> usize {
    256
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent_workflows(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            default_retry: RetryPolicy::default(),
            execution_retention_secs: default_execution_retention_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Caller-supplied scope and inputs for one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub workspace: String,
    pub user: String,
    #[serde(default)]
    pub inputs: Value,
}

impl WorkflowInput {
    pub fn new(workspace: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            user: user.into(),
            inputs: Value::Null,
        }
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }
}

struct ExecutionControl {
    paused: AtomicBool,
    cancelled: AtomicBool,
    /// Wakes the drive loop on pause, resume and cancel.
    wake: Notify,
    done: watch::Sender<bool>,
}

impl ExecutionControl {
    fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            wake: Notify::new(),
            done,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.wake.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Returns once the execution is resumed or cancelled.
    async fn wait_unpaused(&self) {
        loop {
            let notified = self.wake.notified();
            if !self.is_paused() || self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone)]
struct ExecutionEntry {
    definition: Arc<WorkflowDefinition>,
    state: Arc<Mutex<WorkflowExecution>>,
    control: Arc<ExecutionControl>,
}

/// How a drive loop ended.
enum DriveEnd {
    Completed,
    Failed(String),
    Cancelled,
}

/// Drives workflow task graphs through the dispatcher and executor.
///
/// Each execution gets one spawned drive loop, which is the only writer of
/// its task states apart from `cancel_workflow`.
pub struct Orchestrator {
    dispatcher: Arc<Dispatcher>,
    executor: Arc<Executor>,
    config: OrchestratorConfig,
    metrics: Arc<dyn MetricsSink>,
    hooks: EventHookChain,
    events: Arc<BroadcastHook>,
    handlers: RwLock<HashMap<String, Arc<dyn CustomHandler>>>,
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    executions: RwLock<HashMap<Uuid, ExecutionEntry>>,
    task_slots: Arc<Semaphore>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        executor: Arc<Executor>,
        config: OrchestratorConfig,
    ) -> Self {
        let events = Arc::new(BroadcastHook::new(config.event_buffer));
        let mut hooks = EventHookChain::new();
        hooks.add(events.clone());
        let task_slots = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        Self {
            dispatcher,
            executor,
            config,
            metrics: Arc::new(NoopMetrics),
            hooks,
            events,
            handlers: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            task_slots,
            sweeper: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn EventHook>) -> Self {
        self.hooks.add(hook);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Register a handler for `custom` tasks naming it.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn CustomHandler>) {
        let name = name.into();
        debug!(handler = %name, "Custom handler registered");
        self.handlers.write().insert(name, handler);
    }

    /// Validate and store a workflow definition.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> MaestroResult<String> {
        validate_workflow(&definition)?;
        let id = definition.id.clone();
        let task_count = definition.tasks.len();
        {
            let mut workflows = self.workflows.write();
            if workflows.contains_key(&id) {
                return Err(MaestroError::Conflict(format!(
                    "workflow '{id}' is already registered"
                )));
            }
            workflows.insert(id.clone(), Arc::new(definition));
        }
        self.metrics.record_workflow_registration(&WorkflowRecord {
            workflow_id: id.clone(),
            execution_id: None,
            task_count,
            duration_ms: None,
            error: None,
        });
        info!(workflow = %id, tasks = task_count, "Workflow registered");
        Ok(id)
    }

    /// Remove a definition. Rejected while any execution of it is active.
    pub fn unregister_workflow(&self, workflow_id: &str) -> MaestroResult<()> {
        let active = self
            .executions
            .read()
            .values()
            .filter(|e| e.definition.id == workflow_id)
            .any(|e| !e.state.lock().status.is_terminal());
        if active {
            return Err(MaestroError::Conflict(format!(
                "workflow '{workflow_id}' has active executions"
            )));
        }
        if self.workflows.write().remove(workflow_id).is_none() {
            return Err(MaestroError::NotFound(format!("workflow '{workflow_id}'")));
        }
        info!(workflow = %workflow_id, "Workflow unregistered");
        Ok(())
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.workflows
            .read()
            .get(workflow_id)
            .map(|d| d.as_ref().clone())
    }

    /// Registered workflow ids, sorted.
    pub fn list_workflows(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start an execution of a registered workflow and return its id.
    pub fn execute_workflow(
        self: &Arc<Self>,
        workflow_id: &str,
        input: WorkflowInput,
    ) -> MaestroResult<Uuid> {
        if input.workspace.trim().is_empty() || input.user.trim().is_empty() {
            return Err(MaestroError::Validation(
                "workspace and user must not be empty".into(),
            ));
        }
        let definition = self
            .workflows
            .read()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| MaestroError::NotFound(format!("workflow '{workflow_id}'")))?;

        let execution =
            WorkflowExecution::new(&definition, &input.workspace, &input.user, input.inputs);
        let execution_id = execution.id;
        let entry = ExecutionEntry {
            definition,
            state: Arc::new(Mutex::new(execution)),
            control: Arc::new(ExecutionControl::new()),
        };
        {
            let mut executions = self.executions.write();
            let active = executions
                .values()
                .filter(|e| !e.state.lock().status.is_terminal())
                .count();
            if active >= self.config.max_concurrent_workflows {
                return Err(MaestroError::Capacity(format!(
                    "orchestrator is at its limit of {} concurrent workflow(s)",
                    self.config.max_concurrent_workflows
                )));
            }
            executions.insert(execution_id, entry.clone());
        }

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.drive(entry).await;
        });
        info!(workflow = %workflow_id, execution_id = %execution_id, "Workflow execution submitted");
        Ok(execution_id)
    }

    fn entry(&self, execution_id: Uuid) -> MaestroResult<ExecutionEntry> {
        self.executions
            .read()
            .get(&execution_id)
            .cloned()
            .ok_or_else(|| MaestroError::NotFound(format!("workflow execution {execution_id}")))
    }

    /// Pause a running execution. Tasks already running finish; no new
    /// tasks start until it is resumed.
    pub async fn pause_workflow(&self, execution_id: Uuid) -> MaestroResult<bool> {
        let entry = self.entry(execution_id)?;
        {
            let mut exec = entry.state.lock();
            if exec.status != WorkflowStatus::Running {
                return Ok(false);
            }
            exec.status = WorkflowStatus::Paused;
        }
        entry.control.paused.store(true, Ordering::SeqCst);
        entry.control.wake.notify_waiters();
        info!(execution_id = %execution_id, "Workflow paused");
        self.hooks
            .emit(MaestroEvent::WorkflowPaused {
                execution_id,
                timestamp: Utc::now(),
            })
            .await;
        Ok(true)
    }

    pub async fn resume_workflow(&self, execution_id: Uuid) -> MaestroResult<bool> {
        let entry = self.entry(execution_id)?;
        {
            let mut exec = entry.state.lock();
            if exec.status != WorkflowStatus::Paused {
                return Ok(false);
            }
            exec.status = WorkflowStatus::Running;
        }
        entry.control.paused.store(false, Ordering::SeqCst);
        entry.control.wake.notify_waiters();
        info!(execution_id = %execution_id, "Workflow resumed");
        self.hooks
            .emit(MaestroEvent::WorkflowResumed {
                execution_id,
                timestamp: Utc::now(),
            })
            .await;
        Ok(true)
    }

    /// Cancel an execution. Running tasks are marked failed and their
    /// executor runs cancelled. Returns `false` if it was already terminal.
    pub async fn cancel_workflow(&self, execution_id: Uuid) -> MaestroResult<bool> {
        let entry = self.entry(execution_id)?;
        let run_ids: Vec<Uuid> = {
            let mut exec = entry.state.lock();
            if exec.status.is_terminal() {
                return Ok(false);
            }
            let now = Utc::now();
            exec.status = WorkflowStatus::Cancelled;
            exec.error = Some("workflow cancelled".into());
            exec.finished_at = Some(now);
            let mut runs = Vec::new();
            for task in &mut exec.tasks {
                match task.status {
                    TaskStatus::Running => {
                        task.status = TaskStatus::Failed;
                        task.error = Some("workflow cancelled".into());
                        task.finished_at = Some(now);
                        runs.extend(task.run_id);
                    }
                    TaskStatus::Ready => task.status = TaskStatus::Waiting,
                    _ => {}
                }
            }
            runs
        };
        entry.control.cancelled.store(true, Ordering::SeqCst);
        entry.control.wake.notify_waiters();

        for run_id in run_ids {
            if let Err(e) = self.executor.cancel_execution(run_id).await {
                debug!(run_id = %run_id, error = %e, "Run already gone while cancelling workflow");
            }
        }
        info!(execution_id = %execution_id, workflow = %entry.definition.id, "Workflow cancelled");
        self.hooks
            .emit(MaestroEvent::WorkflowCancelled {
                execution_id,
                workflow_id: entry.definition.id.clone(),
                timestamp: Utc::now(),
            })
            .await;
        Ok(true)
    }

    /// Cancel every active execution. Returns how many were cancelled.
    pub async fn cancel_all(&self) -> usize {
        let ids: Vec<Uuid> = self
            .executions
            .read()
            .iter()
            .filter(|(_, e)| !e.state.lock().status.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        let mut cancelled = 0;
        for id in ids {
            if let Ok(true) = self.cancel_workflow(id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Snapshot of an execution.
    pub fn get_execution(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        self.executions
            .read()
            .get(&execution_id)
            .map(|e| e.state.lock().clone())
    }

    /// Wait until the drive loop of an execution has exited.
    pub async fn wait_for_completion(&self, execution_id: Uuid) -> MaestroResult<WorkflowExecution> {
        let entry = self.entry(execution_id)?;
        let mut done = entry.control.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
        let snapshot = entry.state.lock().clone();
        Ok(snapshot)
    }

    /// All retained executions, oldest first.
    pub fn list_executions(&self) -> Vec<WorkflowExecution> {
        let mut all: Vec<WorkflowExecution> = self
            .executions
            .read()
            .values()
            .map(|e| e.state.lock().clone())
            .collect();
        all.sort_by_key(|e| e.created_at);
        all
    }

    /// Receive workflow and task events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MaestroEvent> {
        self.events.subscribe()
    }

    /// Drop finished executions past the retention window.
    pub fn purge_finished_executions(&self) -> usize {
        self.purge_finished_executions_at(Utc::now())
    }

    pub fn purge_finished_executions_at(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::seconds(self.config.execution_retention_secs as i64);
        let mut executions = self.executions.write();
        let before = executions.len();
        executions.retain(|_, entry| {
            let exec = entry.state.lock();
            !(exec.status.is_terminal()
                && *entry.control.done.borrow()
                && exec.finished_at.is_some_and(|t| now - t > retention))
        });
        before - executions.len()
    }

    /// Start the retention sweep. Calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.cleanup_interval_secs.max(1));
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                let purged = orchestrator.purge_finished_executions();
                if purged > 0 {
                    debug!(purged, "Workflow execution cleanup finished");
                }
            }
        }));
        info!(period_secs = period.as_secs(), "Workflow execution cleanup started");
    }

    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            info!("Workflow execution cleanup stopped");
        }
    }

    async fn drive(self: Arc<Self>, entry: ExecutionEntry) {
        let ExecutionEntry {
            definition,
            state,
            control,
        } = entry;
        let started = Instant::now();
        let execution_id = {
            let mut exec = state.lock();
            if exec.status == WorkflowStatus::Pending {
                exec.status = WorkflowStatus::Running;
                exec.started_at = Some(Utc::now());
            }
            exec.id
        };

        if !control.is_cancelled() {
            info!(workflow = %definition.id, execution_id = %execution_id, "Workflow started");
            self.hooks
                .emit(MaestroEvent::WorkflowStarted {
                    execution_id,
                    workflow_id: definition.id.clone(),
                    timestamp: Utc::now(),
                })
                .await;
        }

        let end = loop {
            if control.is_cancelled() {
                break DriveEnd::Cancelled;
            }
            let stopped = {
                let mut exec = state.lock();
                if !exec.is_stopped(definition.error_handling) {
                    None
                } else {
                    let failure = match definition.error_handling {
                        ErrorHandling::FailFast => exec.first_failure().map(|failed| {
                            format!(
                                "task '{}' failed: {}",
                                failed.task_id,
                                failed.error.clone().unwrap_or_default()
                            )
                        }),
                        ErrorHandling::Continue => None,
                    };
                    match failure {
                        Some(message) => {
                            exec.park_ready();
                            Some(DriveEnd::Failed(message))
                        }
                        None => Some(DriveEnd::Completed),
                    }
                }
            };
            if let Some(end) = stopped {
                break end;
            }

            if control.is_paused() {
                debug!(execution_id = %execution_id, "Drive loop idle while paused");
                control.wait_unpaused().await;
                continue;
            }

            let ready = state.lock().ready_set(&definition);
            if ready.is_empty() {
                break DriveEnd::Failed("no runnable tasks left".into());
            }
            let batch = self.select_batch(&definition, ready);
            debug!(execution_id = %execution_id, tasks = ?batch, "Running task batch");

            let runs = join_all(
                batch
                    .iter()
                    .map(|task_id| self.run_task(&definition, &state, &control, task_id)),
            );
            tokio::select! {
                _ = runs => {}
                _ = control.cancelled() => break DriveEnd::Cancelled,
            }
        };

        self.finish(&definition, &state, end, started).await;
        control.done.send_replace(true);
    }

    /// The tasks to run this iteration, in declaration order.
    fn select_batch(&self, definition: &WorkflowDefinition, ready: Vec<String>) -> Vec<String> {
        let limit = self.config.max_concurrent_tasks.max(1);
        match definition.strategy {
            ExecutionStrategy::Sequential => ready.into_iter().take(1).collect(),
            ExecutionStrategy::Parallel => ready.into_iter().take(limit).collect(),
            ExecutionStrategy::Hybrid => {
                let is_agent = |id: &str| {
                    definition
                        .task(id)
                        .is_some_and(|t| t.kind == TaskKind::Agent)
                };
                match ready.iter().find(|id| !is_agent(id.as_str())) {
                    Some(control_task) => vec![control_task.clone()],
                    None => ready.into_iter().take(limit).collect(),
                }
            }
        }
    }

    async fn finish(
        &self,
        definition: &WorkflowDefinition,
        state: &Mutex<WorkflowExecution>,
        end: DriveEnd,
        started: Instant,
    ) {
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let applied = {
            let mut exec = state.lock();
            if exec.status.is_terminal() {
                None
            } else {
                exec.finished_at = Some(Utc::now());
                match &end {
                    DriveEnd::Completed => exec.status = WorkflowStatus::Completed,
                    DriveEnd::Failed(message) => {
                        exec.status = WorkflowStatus::Failed;
                        exec.error = Some(message.clone());
                    }
                    DriveEnd::Cancelled => exec.status = WorkflowStatus::Cancelled,
                }
                Some(exec.id)
            }
        };
        let Some(execution_id) = applied else {
            return;
        };

        let record = |error: Option<String>| WorkflowRecord {
            workflow_id: definition.id.clone(),
            execution_id: Some(execution_id),
            task_count: definition.tasks.len(),
            duration_ms: Some(duration_ms),
            error,
        };
        let event = match end {
            DriveEnd::Completed => {
                self.metrics.record_workflow_completion(&record(None));
                info!(workflow = %definition.id, execution_id = %execution_id, duration_ms, "Workflow completed");
                MaestroEvent::WorkflowCompleted {
                    execution_id,
                    workflow_id: definition.id.clone(),
                    duration_ms,
                    timestamp: Utc::now(),
                }
            }
            DriveEnd::Failed(error) => {
                self.metrics
                    .record_workflow_failure(&record(Some(error.clone())));
                warn!(workflow = %definition.id, execution_id = %execution_id, error = %error, "Workflow failed");
                MaestroEvent::WorkflowFailed {
                    execution_id,
                    workflow_id: definition.id.clone(),
                    error,
                    timestamp: Utc::now(),
                }
            }
            DriveEnd::Cancelled => MaestroEvent::WorkflowCancelled {
                execution_id,
                workflow_id: definition.id.clone(),
                timestamp: Utc::now(),
            },
        };
        self.hooks.emit(event).await;
    }

    /// Run one task to a terminal state, retrying with backoff.
    async fn run_task(
        &self,
        definition: &WorkflowDefinition,
        state: &Mutex<WorkflowExecution>,
        control: &ExecutionControl,
        task_id: &str,
    ) {
        let Some(task) = definition.task(task_id) else {
            return;
        };
        let policy = definition.retry.unwrap_or(self.config.default_retry);
        let max_retries = task.max_retries.unwrap_or(policy.max_retries);

        loop {
            let Ok(permit) = self.task_slots.acquire().await else {
                return;
            };
            let started = {
                let mut exec = state.lock();
                let execution_id = exec.id;
                if exec.status.is_terminal() || control.is_cancelled() {
                    return;
                }
                let Some(t) = exec.task_mut(task_id) else {
                    return;
                };
                if t.status != TaskStatus::Ready {
                    return;
                }
                t.status = TaskStatus::Running;
                t.attempts += 1;
                t.error = None;
                if t.started_at.is_none() {
                    t.started_at = Some(Utc::now());
                }
                (execution_id, t.attempts)
            };
            let (execution_id, attempt) = started;
            self.hooks
                .emit(MaestroEvent::TaskStarted {
                    execution_id,
                    task_id: task_id.to_string(),
                    timestamp: Utc::now(),
                })
                .await;

            let result = match task.timeout_secs {
                Some(secs) => {
                    let body = self.run_task_body(definition, state, task);
                    match tokio::time::timeout(Duration::from_secs(secs), body).await {
                        Ok(result) => result,
                        Err(_) => {
                            self.cancel_task_run(state, task_id).await;
                            Err(MaestroError::Timeout(format!(
                                "task '{task_id}' exceeded {secs}s"
                            )))
                        }
                    }
                }
                None => self.run_task_body(definition, state, task).await,
            };
            drop(permit);

            match result {
                Ok(output) => {
                    self.complete_task(definition, state, task, output).await;
                    return;
                }
                Err(e) if attempt <= max_retries => {
                    let error = e.to_string();
                    let delay = policy.compute_backoff(attempt - 1);
                    let retrying = {
                        let mut exec = state.lock();
                        let live = !exec.status.is_terminal();
                        match exec.task_mut(task_id) {
                            Some(t) if live && t.status == TaskStatus::Running => {
                                t.status = TaskStatus::Ready;
                                t.error = Some(error.clone());
                                true
                            }
                            _ => false,
                        }
                    };
                    if !retrying {
                        return;
                    }
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    warn!(execution_id = %execution_id, task = %task_id, attempt, delay_ms, error = %error, "Task failed, retrying");
                    self.hooks
                        .emit(MaestroEvent::TaskRetrying {
                            execution_id,
                            task_id: task_id.to_string(),
                            attempt,
                            delay_ms,
                            error,
                            timestamp: Utc::now(),
                        })
                        .await;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.fail_task(definition, state, task_id, e.to_string())
                        .await;
                    return;
                }
            }
        }
    }

    async fn complete_task(
        &self,
        definition: &WorkflowDefinition,
        state: &Mutex<WorkflowExecution>,
        task: &WorkflowTask,
        output: Value,
    ) {
        let skip_downstream = task.kind == TaskKind::Condition && output == Value::Bool(false);
        let applied = {
            let mut exec = state.lock();
            let live = !exec.status.is_terminal();
            let execution_id = exec.id;
            match exec.task_mut(&task.id) {
                Some(t) if live && t.status == TaskStatus::Running => {
                    t.status = TaskStatus::Completed;
                    t.output = Some(output);
                    t.finished_at = Some(Utc::now());
                    let skipped = if skip_downstream {
                        exec.skip_dependents(definition, &task.id)
                    } else {
                        Vec::new()
                    };
                    Some((execution_id, skipped))
                }
                _ => None,
            }
        };
        let Some((execution_id, skipped)) = applied else {
            return;
        };
        debug!(execution_id = %execution_id, task = %task.id, "Task completed");
        self.hooks
            .emit(MaestroEvent::TaskCompleted {
                execution_id,
                task_id: task.id.clone(),
                timestamp: Utc::now(),
            })
            .await;
        if skip_downstream {
            info!(execution_id = %execution_id, task = %task.id, skipped = skipped.len(), "Condition false, skipping dependents");
        }
        self.emit_skipped(execution_id, skipped).await;
    }

    async fn fail_task(
        &self,
        definition: &WorkflowDefinition,
        state: &Mutex<WorkflowExecution>,
        task_id: &str,
        error: String,
    ) {
        let applied = {
            let mut exec = state.lock();
            let live = !exec.status.is_terminal();
            let execution_id = exec.id;
            match exec.task_mut(task_id) {
                Some(t) if live && t.status == TaskStatus::Running => {
                    t.status = TaskStatus::Failed;
                    t.error = Some(error.clone());
                    t.finished_at = Some(Utc::now());
                    let skipped = if definition.error_handling == ErrorHandling::Continue {
                        exec.skip_dependents(definition, task_id)
                    } else {
                        Vec::new()
                    };
                    Some((execution_id, skipped))
                }
                _ => None,
            }
        };
        let Some((execution_id, skipped)) = applied else {
            return;
        };
        warn!(execution_id = %execution_id, task = %task_id, error = %error, "Task failed");
        self.hooks
            .emit(MaestroEvent::TaskFailed {
                execution_id,
                task_id: task_id.to_string(),
                error,
                timestamp: Utc::now(),
            })
            .await;
        self.emit_skipped(execution_id, skipped).await;
    }

    async fn emit_skipped(&self, execution_id: Uuid, skipped: Vec<String>) {
        for task_id in skipped {
            self.hooks
                .emit(MaestroEvent::TaskSkipped {
                    execution_id,
                    task_id,
                    timestamp: Utc::now(),
                })
                .await;
        }
    }

    async fn cancel_task_run(&self, state: &Mutex<WorkflowExecution>, task_id: &str) {
        let run_id = state.lock().task(task_id).and_then(|t| t.run_id);
        if let Some(run_id) = run_id {
            if let Err(e) = self.executor.cancel_execution(run_id).await {
                debug!(run_id = %run_id, error = %e, "Could not cancel timed out run");
            }
        }
    }

    async fn run_task_body(
        &self,
        definition: &WorkflowDefinition,
        state: &Mutex<WorkflowExecution>,
        task: &WorkflowTask,
    ) -> MaestroResult<Value> {
        match task.kind {
            TaskKind::Agent => self.run_agent_task(definition, state, task).await,
            TaskKind::Condition => {
                let condition = task.condition.as_ref().ok_or_else(|| {
                    MaestroError::Validation(format!("task '{}' has no condition", task.id))
                })?;
                let exec = state.lock();
                Ok(Value::Bool(evaluate_condition(condition, &exec)))
            }
            TaskKind::Data => {
                let operation = task.operation.as_ref().ok_or_else(|| {
                    MaestroError::Validation(format!("task '{}' has no operation", task.id))
                })?;
                let dependencies = state.lock().dependency_outputs(definition, &task.id);
                apply_data_operation(operation, &dependencies)
            }
            TaskKind::Custom => {
                let handler = task
                    .handler
                    .as_deref()
                    .and_then(|name| self.handlers.read().get(name).cloned())
                    .unwrap_or_else(|| Arc::new(EchoHandler) as Arc<dyn CustomHandler>);
                let input = {
                    let exec = state.lock();
                    CustomTaskInput {
                        execution_id: exec.id,
                        task_id: task.id.clone(),
                        payload: task.payload.clone(),
                        inputs: exec.inputs.clone(),
                        dependencies: exec
                            .dependency_outputs(definition, &task.id)
                            .into_iter()
                            .collect(),
                    }
                };
                handler.handle(input).await
            }
        }
    }

    /// Dispatch, run through the executor, and wait for the terminal result.
    async fn run_agent_task(
        &self,
        definition: &WorkflowDefinition,
        state: &Mutex<WorkflowExecution>,
        task: &WorkflowTask,
    ) -> MaestroResult<Value> {
        let request_type = task.request_type.as_deref().ok_or_else(|| {
            MaestroError::Validation(format!("task '{}' has no request_type", task.id))
        })?;
        let (workspace, user, payload) = {
            let exec = state.lock();
            let mut payload = match &task.payload {
                Value::Object(map) => map.clone(),
                Value::Null => serde_json::Map::new(),
                other => {
                    let mut map = serde_json::Map::new();
                    map.insert("input".into(), other.clone());
                    map
                }
            };
            for (dep, output) in exec.dependency_outputs(definition, &task.id) {
                payload.insert(format!("dep_{dep}"), output);
            }
            (
                exec.workspace.clone(),
                exec.user.clone(),
                Value::Object(payload),
            )
        };

        let request = DispatchRequest::new(request_type, workspace, user, payload.clone())
            .with_priority(task.priority)
            .with_strategy(task.strategy)
            .with_constraints(task.constraints.clone());
        let dispatch = self.dispatcher.dispatch(&request)?;
        let run_id = self.executor.submit_dispatched(
            dispatch.clone(),
            payload,
            Value::Null,
            task.timeout_secs.map(Duration::from_secs),
        )?;

        let cancelled = {
            let mut exec = state.lock();
            if let Some(t) = exec.task_mut(&task.id) {
                t.run_id = Some(run_id);
            }
            exec.status == WorkflowStatus::Cancelled
        };
        if cancelled {
            let _ = self.executor.cancel_execution(run_id).await;
        }

        let result = self.executor.wait(run_id).await?;
        match result.status {
            ExecutionStatus::Completed => Ok(serde_json::json!({
                "dispatch": dispatch,
                "run_id": run_id,
                "output": result.output,
            })),
            ExecutionStatus::Timeout => Err(MaestroError::Timeout(
                result
                    .error
                    .unwrap_or_else(|| format!("run {run_id} timed out")),
            )),
            status => Err(MaestroError::Worker(
                result
                    .error
                    .unwrap_or_else(|| format!("run {run_id} ended {status}")),
            )),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::workflow::{Condition, DataOperation};
    use maestro_executor::ExecutorConfig;
    use maestro_registry::Registry;

    fn orchestrator(config: OrchestratorConfig) -> Arc<Orchestrator> {
        let registry = Arc::new(Registry::default());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), Default::default()));
        let executor = Arc::new(
            Executor::new(registry, ExecutorConfig::default()).with_dispatcher(dispatcher.clone()),
        );
        Arc::new(Orchestrator::new(dispatcher, executor, config))
    }

    #[test]
    fn test_config_defaults_from_empty_object() {
        let config: OrchestratorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_concurrent_workflows, 10);
        assert_eq!(config.max_concurrent_tasks, 10);
        assert_eq!(config.default_retry, RetryPolicy::default());
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let orch = orchestrator(OrchestratorConfig::default());
        let def = WorkflowDefinition::new(
            "w",
            "W",
            vec![WorkflowTask::condition("c", Condition::AlwaysTrue)],
        );
        orch.register_workflow(def.clone()).unwrap();
        let err = orch.register_workflow(def).unwrap_err();
        assert!(matches!(err, MaestroError::Conflict(_)));
        assert_eq!(orch.list_workflows(), vec!["w"]);
    }

    #[tokio::test]
    async fn test_hybrid_batches_control_tasks_first() {
        let orch = orchestrator(OrchestratorConfig::default());
        let def = WorkflowDefinition::new(
            "h",
            "H",
            vec![
                WorkflowTask::agent("a1", "writing", Value::Null),
                WorkflowTask::data("d", DataOperation::Merge),
                WorkflowTask::agent("a2", "writing", Value::Null),
            ],
        )
        .with_strategy(ExecutionStrategy::Hybrid);
        let ready = vec!["a1".to_string(), "d".to_string(), "a2".to_string()];
        assert_eq!(orch.select_batch(&def, ready), vec!["d"]);
        let ready = vec!["a1".to_string(), "a2".to_string()];
        assert_eq!(orch.select_batch(&def, ready), vec!["a1", "a2"]);
    }

    #[tokio::test]
    async fn test_parallel_batch_respects_task_ceiling() {
        let orch = orchestrator(OrchestratorConfig {
            max_concurrent_tasks: 2,
            ..Default::default()
        });
        let def = WorkflowDefinition::new("p", "P", vec![])
            .with_strategy(ExecutionStrategy::Parallel);
        let ready: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(orch.select_batch(&def, ready), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unknown_workflow_not_found() {
        let orch = orchestrator(OrchestratorConfig::default());
        let err = orch
            .execute_workflow("ghost", WorkflowInput::new("ws", "u"))
            .unwrap_err();
        assert!(matches!(err, MaestroError::NotFound(_)));
        assert!(matches!(
            orch.cancel_workflow(Uuid::new_v4()).await,
            Err(MaestroError::NotFound(_))
        ));
    }
}
