use crate::cache::{cache_key, ResultCache};
use crate::types::{
    ExecuteRequest, ExecutionContext, ExecutionOutcome, ExecutionResult, ExecutionStatus,
    ExecutorStats,
};
use chrono::{DateTime, Utc};
use maestro_core::{
    BroadcastHook, EventHook, EventHookChain, ExecutionMode, ExecutionRecord, MaestroError,
    MaestroEvent, MaestroResult, MemoryKind, MemoryStore, MetricsSink, NoopMetrics, RunSnapshot,
    StateStore, WorkerInput, WorkerOutput,
};
use maestro_dispatch::{DispatchOutcome, DispatchResult, Dispatcher};
use maestro_registry::{InstanceLease, Registry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Executor tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Deadline for runs that do not set their own.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    /// Terminal results older than this are purged.
    #[serde(default = "default_result_retention_secs")]
    pub result_retention_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Ceiling on non-terminal runs.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Capacity of the event broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    3_600
}

fn default_cache_max_entries() -> usize {
    1_000
}

fn default_result_retention_secs() -> u64 {
    3_600
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_max_concurrent_runs() -> usize {
    100
}

fn default_event_buffer() -> usize {
    256
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            cache_enabled: default_cache_enabled(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_entries: default_cache_max_entries(),
            result_retention_secs: default_result_retention_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            max_concurrent_runs: default_max_concurrent_runs(),
            event_buffer: default_event_buffer(),
        }
    }
}

struct RunEntry {
    context: ExecutionContext,
    result: ExecutionResult,
    cancel: Arc<Notify>,
    /// Flipped to `true` once the run's cleanup has finished.
    done: watch::Sender<bool>,
}

#[derive(Default)]
struct ExecutorState {
    runs: HashMap<Uuid, RunEntry>,
    cache_hits: u64,
    cache_misses: u64,
    finished: u64,
    total_tokens: u64,
    total_cost: f64,
    total_duration_ms: u64,
}

impl ExecutorState {
    fn active_runs(&self) -> usize {
        self.runs
            .values()
            .filter(|r| !r.result.status.is_terminal())
            .count()
    }
}

enum RunEnd {
    Succeeded(WorkerOutput),
    Failed(String),
    TimedOut,
    Cancelled,
}

/// Keeps the worker's own message for worker failures.
fn error_message(err: &MaestroError) -> String {
    match err {
        MaestroError::Worker(msg) => msg.clone(),
        other => other.to_string(),
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Runs units of work against agent instances.
///
/// Every run holds an [`InstanceLease`] for its whole life, so the instance
/// is destroyed on every exit path. Runs routed by the dispatcher also hand
/// their load slot back when they reach a terminal state.
pub struct Executor {
    registry: Arc<Registry>,
    dispatcher: Option<Arc<Dispatcher>>,
    config: ExecutorConfig,
    memory: Option<Arc<dyn MemoryStore>>,
    state_store: Option<Arc<dyn StateStore>>,
    metrics: Arc<dyn MetricsSink>,
    hooks: EventHookChain,
    events: Arc<BroadcastHook>,
    cache: ResultCache,
    state: Mutex<ExecutorState>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    pub fn new(registry: Arc<Registry>, config: ExecutorConfig) -> Self {
        let events = Arc::new(BroadcastHook::new(config.event_buffer));
        let mut hooks = EventHookChain::new();
        hooks.add(events.clone());
        let cache = ResultCache::new(
            Duration::from_secs(config.cache_ttl_secs),
            config.cache_max_entries,
        );
        Self {
            registry,
            dispatcher: None,
            config,
            memory: None,
            state_store: None,
            metrics: Arc::new(NoopMetrics),
            hooks,
            events,
            cache,
            state: Mutex::new(ExecutorState::default()),
            sweeper: Mutex::new(None),
        }
    }

    /// Dispatcher that receives slot releases for dispatched runs.
    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Add an event hook after the built-in broadcast hook.
    pub fn with_hook(mut self, hook: Arc<dyn EventHook>) -> Self {
        self.hooks.add(hook);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run work on a fresh instance of `request.agent_id`.
    ///
    /// Synchronous mode waits for the terminal result and may be served from
    /// the cache. Asynchronous and streaming modes return the run id at once;
    /// streaming callers follow progress through [`subscribe`](Self::subscribe).
    pub async fn execute(self: &Arc<Self>, request: ExecuteRequest) -> MaestroResult<ExecutionOutcome> {
        request.validate()?;
        if self.registry.get_descriptor(&request.agent_id).is_none() {
            return Err(MaestroError::NotFound(format!(
                "agent '{}' is not registered",
                request.agent_id
            )));
        }

        let key = (request.mode == ExecutionMode::Sync && self.config.cache_enabled)
            .then(|| cache_key(&request.agent_id, &request.payload, &request.config));
        if let Some(key) = &key {
            if let Some(hit) = self.cache.get(key) {
                self.state.lock().cache_hits += 1;
                debug!(agent = %request.agent_id, run_id = %hit.run_id, "Served from cache");
                return Ok(ExecutionOutcome::Finished(hit));
            }
            self.state.lock().cache_misses += 1;
        }

        self.check_capacity()?;
        let lease = self.registry.lease_instance(
            &request.agent_id,
            &request.workspace,
            &request.user,
            request.config.clone(),
        )?;
        let timeout = request
            .timeout
            .unwrap_or(Duration::from_secs(self.config.default_timeout_secs));
        let context = ExecutionContext {
            run_id: Uuid::new_v4(),
            agent_id: request.agent_id,
            instance_id: lease.instance_id(),
            workspace: request.workspace,
            user: request.user,
            payload: request.payload,
            config: request.config,
            mode: request.mode,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            dispatch: None,
            created_at: Utc::now(),
        };
        let run_id = self.launch(context, lease, key)?;

        match request.mode {
            ExecutionMode::Sync => Ok(ExecutionOutcome::Finished(self.wait(run_id).await?)),
            ExecutionMode::Async | ExecutionMode::Streaming => {
                Ok(ExecutionOutcome::Submitted(run_id))
            }
        }
    }

    /// Start a run on the instance created by `dispatch` and return its id.
    ///
    /// Dispatched runs are asynchronous and never served from the cache.
    /// The dispatch slot is released exactly once: on a launch failure, or
    /// when the run reaches a terminal state.
    pub fn submit_dispatched(
        self: &Arc<Self>,
        dispatch: DispatchResult,
        payload: serde_json::Value,
        config: serde_json::Value,
        timeout: Option<Duration>,
    ) -> MaestroResult<Uuid> {
        let lease = match self.registry.adopt_instance(dispatch.instance_id) {
            Ok(lease) => lease,
            Err(e) => {
                self.release_slot(&dispatch, false, 0);
                return Err(e);
            }
        };

        let timeout = timeout.unwrap_or(Duration::from_secs(self.config.default_timeout_secs));
        let context = ExecutionContext {
            run_id: Uuid::new_v4(),
            agent_id: dispatch.agent_id.clone(),
            instance_id: dispatch.instance_id,
            workspace: dispatch.workspace.clone(),
            user: dispatch.user.clone(),
            payload,
            config,
            mode: ExecutionMode::Async,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            dispatch: Some(dispatch.clone()),
            created_at: Utc::now(),
        };
        self.launch(context, lease, None).inspect_err(|_| {
            self.release_slot(&dispatch, false, 0);
        })
    }

    /// [`submit_dispatched`](Self::submit_dispatched) and wait for the result.
    pub async fn execute_dispatched(
        self: &Arc<Self>,
        dispatch: DispatchResult,
        payload: serde_json::Value,
        config: serde_json::Value,
        timeout: Option<Duration>,
    ) -> MaestroResult<ExecutionResult> {
        let run_id = self.submit_dispatched(dispatch, payload, config, timeout)?;
        self.wait(run_id).await
    }

    fn check_capacity(&self) -> MaestroResult<()> {
        let active = self.state.lock().active_runs();
        if active >= self.config.max_concurrent_runs {
            return Err(MaestroError::Capacity(format!(
                "executor is at its limit of {} concurrent run(s)",
                self.config.max_concurrent_runs
            )));
        }
        Ok(())
    }

    fn launch(
        self: &Arc<Self>,
        context: ExecutionContext,
        lease: InstanceLease,
        cache_key: Option<String>,
    ) -> MaestroResult<Uuid> {
        let run_id = context.run_id;
        let cancel = Arc::new(Notify::new());
        {
            let mut state = self.state.lock();
            if state.active_runs() >= self.config.max_concurrent_runs {
                return Err(MaestroError::Capacity(format!(
                    "executor is at its limit of {} concurrent run(s)",
                    self.config.max_concurrent_runs
                )));
            }
            let (done, _) = watch::channel(false);
            state.runs.insert(
                run_id,
                RunEntry {
                    result: ExecutionResult::pending(&context),
                    context: context.clone(),
                    cancel: Arc::clone(&cancel),
                    done,
                },
            );
        }

        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor.drive(context, lease, cancel, cache_key).await;
        });
        Ok(run_id)
    }

    async fn drive(
        self: Arc<Self>,
        context: ExecutionContext,
        lease: InstanceLease,
        cancel: Arc<Notify>,
        cache_key: Option<String>,
    ) {
        let run_id = context.run_id;
        let started = Instant::now();

        let end = if self.mark_running(run_id) {
            self.hooks
                .emit(MaestroEvent::RunStarted {
                    run_id,
                    agent_id: context.agent_id.clone(),
                    workspace: context.workspace.clone(),
                    timestamp: Utc::now(),
                })
                .await;
            self.save_snapshot(&context).await;
            if let Err(e) = self.registry.touch_instance(context.instance_id) {
                debug!(run_id = %run_id, error = %e, "Could not mark instance activity");
            }

            let worker = lease.worker();
            let input = WorkerInput {
                run_id,
                instance_id: context.instance_id,
                agent_id: context.agent_id.clone(),
                workspace: context.workspace.clone(),
                user: context.user.clone(),
                payload: context.payload.clone(),
                config: context.config.clone(),
            };
            let deadline = Duration::from_millis(context.timeout_ms);

            let end = tokio::select! {
                _ = cancel.notified() => RunEnd::Cancelled,
                res = tokio::time::timeout(deadline, worker.run(input)) => match res {
                    Ok(Ok(output)) => RunEnd::Succeeded(output),
                    Ok(Err(e)) => RunEnd::Failed(error_message(&e)),
                    Err(_) => RunEnd::TimedOut,
                },
            };
            self.delete_snapshot(run_id).await;
            end
        } else {
            RunEnd::Cancelled
        };
        let duration_ms = elapsed_ms(started);

        match &end {
            RunEnd::Succeeded(output) => {
                lease.record_success();
                self.remember(&context, output).await;
            }
            RunEnd::Failed(msg) => lease.record_error(msg),
            RunEnd::TimedOut => lease.record_error("timed out"),
            RunEnd::Cancelled => {}
        }
        drop(lease);

        let (applied, result) = self.finish(&context, end, duration_ms);

        if let Some(dispatch) = &context.dispatch {
            self.release_slot(dispatch, result.is_success(), duration_ms);
        }
        self.metrics.record_execution(&ExecutionRecord {
            agent_id: context.agent_id.clone(),
            workspace: context.workspace.clone(),
            duration_ms,
            tokens: result.tokens_used,
            cost: result.cost,
            success: result.is_success(),
        });
        if applied {
            self.emit_terminal(&result, context.timeout_ms).await;
        }
        if let Some(key) = cache_key {
            if result.is_success() {
                self.cache.insert(key, result.clone());
            }
        }
        self.signal_done(run_id);
    }

    /// `pending → running`. False when the run was cancelled first.
    fn mark_running(&self, run_id: Uuid) -> bool {
        let mut state = self.state.lock();
        match state.runs.get_mut(&run_id) {
            Some(entry) if entry.result.status == ExecutionStatus::Pending => {
                entry.result.status = ExecutionStatus::Running;
                entry.result.started_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Record the terminal state unless one is already set. Returns whether
    /// this call set it, and the run's final result.
    fn finish(
        &self,
        context: &ExecutionContext,
        end: RunEnd,
        duration_ms: u64,
    ) -> (bool, ExecutionResult) {
        let (status, output, error, tokens, cost) = match end {
            RunEnd::Succeeded(out) => (
                ExecutionStatus::Completed,
                Some(out.output),
                None,
                out.tokens_used,
                out.cost,
            ),
            RunEnd::Failed(msg) => (ExecutionStatus::Failed, None, Some(msg), 0, 0.0),
            RunEnd::TimedOut => (
                ExecutionStatus::Timeout,
                None,
                Some(format!("timed out after {} ms", context.timeout_ms)),
                0,
                0.0,
            ),
            RunEnd::Cancelled => (
                ExecutionStatus::Cancelled,
                None,
                Some("cancelled".to_string()),
                0,
                0.0,
            ),
        };

        let mut state = self.state.lock();
        state.finished += 1;
        state.total_tokens += tokens;
        state.total_cost += cost;
        state.total_duration_ms += duration_ms;

        let fallback = || {
            let mut result = ExecutionResult::pending(context);
            result.status = status;
            result
        };
        let Some(entry) = state.runs.get_mut(&context.run_id) else {
            return (false, fallback());
        };
        if entry.result.status.is_terminal() {
            return (false, entry.result.clone());
        }
        let r = &mut entry.result;
        r.status = status;
        r.output = output;
        r.error = error;
        r.tokens_used = tokens;
        r.cost = cost;
        r.finished_at = Some(Utc::now());
        r.duration_ms = Some(duration_ms);
        (true, r.clone())
    }

    fn signal_done(&self, run_id: Uuid) {
        if let Some(entry) = self.state.lock().runs.get(&run_id) {
            entry.done.send_replace(true);
        }
    }

    async fn emit_terminal(&self, result: &ExecutionResult, timeout_ms: u64) {
        let timestamp = Utc::now();
        let event = match result.status {
            ExecutionStatus::Completed => {
                info!(run_id = %result.run_id, agent = %result.agent_id, duration_ms = ?result.duration_ms, "Run completed");
                MaestroEvent::RunCompleted {
                    run_id: result.run_id,
                    agent_id: result.agent_id.clone(),
                    duration_ms: result.duration_ms.unwrap_or(0),
                    timestamp,
                }
            }
            ExecutionStatus::Timeout => {
                warn!(run_id = %result.run_id, agent = %result.agent_id, timeout_ms, "Run timed out");
                MaestroEvent::RunTimedOut {
                    run_id: result.run_id,
                    agent_id: result.agent_id.clone(),
                    timeout_ms,
                    timestamp,
                }
            }
            ExecutionStatus::Failed => {
                warn!(run_id = %result.run_id, agent = %result.agent_id, error = ?result.error, "Run failed");
                MaestroEvent::RunFailed {
                    run_id: result.run_id,
                    agent_id: result.agent_id.clone(),
                    error: result.error.clone().unwrap_or_default(),
                    timestamp,
                }
            }
            ExecutionStatus::Cancelled => MaestroEvent::RunCancelled {
                run_id: result.run_id,
                agent_id: result.agent_id.clone(),
                timestamp,
            },
            ExecutionStatus::Pending | ExecutionStatus::Running => return,
        };
        self.hooks.emit(event).await;
    }

    fn release_slot(&self, dispatch: &DispatchResult, success: bool, latency_ms: u64) {
        match &self.dispatcher {
            Some(dispatcher) => {
                dispatcher.release(dispatch, &DispatchOutcome { success, latency_ms });
            }
            None => warn!(
                dispatch = %dispatch.dispatch_id,
                "Dispatched run finished but no dispatcher is attached"
            ),
        }
    }

    async fn save_snapshot(&self, context: &ExecutionContext) {
        let Some(store) = &self.state_store else {
            return;
        };
        let snapshot = RunSnapshot {
            run_id: context.run_id,
            agent_id: context.agent_id.clone(),
            workspace: context.workspace.clone(),
            user: context.user.clone(),
            payload: context.payload.clone(),
            created_at: context.created_at,
        };
        if let Err(e) = store.save(&snapshot).await {
            warn!(run_id = %context.run_id, error = %e, "Failed to save run snapshot");
        }
    }

    async fn delete_snapshot(&self, run_id: Uuid) {
        if let Some(store) = &self.state_store {
            if let Err(e) = store.delete(run_id).await {
                warn!(run_id = %run_id, error = %e, "Failed to delete run snapshot");
            }
        }
    }

    async fn remember(&self, context: &ExecutionContext, output: &WorkerOutput) {
        let Some(memory) = &self.memory else {
            return;
        };
        let content = serde_json::json!({
            "run_id": context.run_id,
            "input": context.payload,
            "output": output.output,
        });
        let tags = vec![context.agent_id.clone(), "execution".to_string()];
        if let Err(e) = memory
            .store(
                MemoryKind::Episodic,
                &context.agent_id,
                &context.workspace,
                content,
                tags,
            )
            .await
        {
            warn!(run_id = %context.run_id, error = %e, "Failed to store run memory");
        }
    }

    /// Current result of a run.
    pub fn get_status(&self, run_id: Uuid) -> Option<ExecutionResult> {
        self.state
            .lock()
            .runs
            .get(&run_id)
            .map(|entry| entry.result.clone())
    }

    /// The immutable context a run was started with.
    pub fn get_context(&self, run_id: Uuid) -> Option<ExecutionContext> {
        self.state
            .lock()
            .runs
            .get(&run_id)
            .map(|entry| entry.context.clone())
    }

    /// Wait until the run is terminal and its cleanup has finished.
    pub async fn wait(&self, run_id: Uuid) -> MaestroResult<ExecutionResult> {
        let mut done = {
            let state = self.state.lock();
            let entry = state
                .runs
                .get(&run_id)
                .ok_or_else(|| MaestroError::NotFound(format!("run {run_id}")))?;
            entry.done.subscribe()
        };
        let _ = done.wait_for(|finished| *finished).await;
        self.get_status(run_id)
            .ok_or_else(|| MaestroError::NotFound(format!("run {run_id}")))
    }

    /// Cancel a run. The result turns `cancelled` at once; the worker is
    /// abandoned at its next suspension point. Returns `false` if the run
    /// was already terminal.
    pub async fn cancel_execution(&self, run_id: Uuid) -> MaestroResult<bool> {
        let agent_id = {
            let mut state = self.state.lock();
            let entry = state
                .runs
                .get_mut(&run_id)
                .ok_or_else(|| MaestroError::NotFound(format!("run {run_id}")))?;
            if entry.result.status.is_terminal() {
                return Ok(false);
            }
            let now = Utc::now();
            let r = &mut entry.result;
            r.status = ExecutionStatus::Cancelled;
            r.error = Some("cancelled".into());
            r.finished_at = Some(now);
            r.duration_ms = r.started_at.map(|s| {
                u64::try_from((now - s).num_milliseconds()).unwrap_or(0)
            });
            entry.cancel.notify_one();
            r.agent_id.clone()
        };
        info!(run_id = %run_id, agent = %agent_id, "Run cancelled");
        self.hooks
            .emit(MaestroEvent::RunCancelled {
                run_id,
                agent_id,
                timestamp: Utc::now(),
            })
            .await;
        Ok(true)
    }

    /// Cancel every non-terminal run. Returns how many were cancelled.
    pub async fn cancel_all(&self) -> usize {
        let active: Vec<Uuid> = {
            let state = self.state.lock();
            state
                .runs
                .values()
                .filter(|r| !r.result.status.is_terminal())
                .map(|r| r.result.run_id)
                .collect()
        };
        let mut cancelled = 0;
        for run_id in active {
            if let Ok(true) = self.cancel_execution(run_id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// All retained runs, oldest first.
    pub fn list_runs(&self) -> Vec<ExecutionResult> {
        let mut runs: Vec<ExecutionResult> = self
            .state
            .lock()
            .runs
            .values()
            .map(|entry| entry.result.clone())
            .collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    pub fn stats(&self) -> ExecutorStats {
        let state = self.state.lock();
        let mut by_status: HashMap<String, usize> = HashMap::new();
        for entry in state.runs.values() {
            *by_status
                .entry(entry.result.status.to_string())
                .or_insert(0) += 1;
        }
        ExecutorStats {
            finished_runs: state.finished,
            active_runs: state.active_runs(),
            by_status,
            cache_hits: state.cache_hits,
            cache_misses: state.cache_misses,
            cache_entries: self.cache.len(),
            total_tokens: state.total_tokens,
            total_cost: state.total_cost,
            average_duration_ms: if state.finished == 0 {
                0.0
            } else {
                state.total_duration_ms as f64 / state.finished as f64
            },
        }
    }

    /// Receive run events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MaestroEvent> {
        self.events.subscribe()
    }

    /// Drop terminal results past the retention window.
    pub fn purge_finished_runs(&self) -> usize {
        self.purge_finished_runs_at(Utc::now())
    }

    pub fn purge_finished_runs_at(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::seconds(self.config.result_retention_secs as i64);
        let mut state = self.state.lock();
        let before = state.runs.len();
        state.runs.retain(|_, entry| {
            let r = &entry.result;
            !(r.status.is_terminal()
                && *entry.done.borrow()
                && r.finished_at.is_some_and(|t| now - t > retention))
        });
        before - state.runs.len()
    }

    /// Drop expired cache entries.
    pub fn purge_expired_cache(&self) -> usize {
        self.cache.purge_expired()
    }

    /// Start the retention and cache sweep. Calling twice is a no-op.
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
                let Some(executor) = weak.upgrade() else {
                    break;
                };
                let runs = executor.purge_finished_runs();
                let entries = executor.purge_expired_cache();
                if runs > 0 || entries > 0 {
                    debug!(runs, cache_entries = entries, "Executor cleanup finished");
                }
            }
        }));
        info!(period_secs = period.as_secs(), "Executor cleanup started");
    }

    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            info!("Executor cleanup stopped");
        }
    }
}
