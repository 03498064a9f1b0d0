/// Task-graph scheduler
///
/// Drives a root task's sub-task graph to completion: persists the graph,
/// computes the ready set from the dependency tracker, dispatches ready
/// nodes to the supervisor (sequential nodes strictly one at a time in
/// declaration order, parallel nodes concurrently up to the supervisor
/// cap), cascades dependency failures, and reduces the children's
/// terminal states into the root's.
///
/// # Cancellation
///
/// Each driven root owns a `CancellationToken` in the active registry;
/// dispatched children get child tokens, so a root cancel terminates
/// every running child through the supervisor while pending children are
/// transitioned to cancelled directly. A root-level timeout behaves as a
/// cancel of the remaining graph with the root terminal state `timeout`.

use crate::graph::{topological_order, DependencyTracker, GraphNode};
use crate::parser::ParsedGraph;
use crate::supervisor::{Supervisor, TaskOutcome, TaskSpec};
use serde_json::json;
use sqlx::sqlite::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use taskmill_shared::db::store::{with_acquire_retry, Store};
use taskmill_shared::error::{TaskmillError, TaskmillResult};
use taskmill_shared::events::{record_log, EventBus};
use taskmill_shared::models::subtask::{CreateSubTask, SubTask};
use taskmill_shared::models::task::{
    CreateTask, ExecutionMode, Priority, ReturnMode, Task, TaskStatus,
};
use taskmill_shared::models::task_log::{LogKind, LogLevel, NewTaskLog};
use taskmill_shared::models::task_result::{NewTaskResult, ResultStatus, TaskResult};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bound on `returnMode=summary` output.
pub const SUMMARY_MAX_BYTES: usize = 4096;

/// Truncates `out` to the largest character boundary at or below
/// `max_bytes`
///
/// Child output and task names are arbitrary UTF-8, so a raw byte
/// truncation could land inside a multi-byte character and panic; the
/// straddling character is dropped whole instead.
pub fn truncate_output(out: &mut String, max_bytes: usize) {
    if out.len() <= max_bytes {
        return;
    }
    let mut end = max_bytes;
    while end > 0 && !out.is_char_boundary(end) {
        end -= 1;
    }
    out.truncate(end);
}

/// Scheduler over one store and one supervisor.
pub struct Scheduler {
    pool: SqlitePool,

    /// Store handle over the same pool, for multi-statement transactions
    store: Store,

    bus: EventBus,
    supervisor: Arc<Supervisor>,

    /// Roots currently being driven → their cancel tokens
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl Scheduler {
    pub fn new(pool: SqlitePool, bus: EventBus, supervisor: Arc<Supervisor>) -> Self {
        let store = Store::from_pool(pool.clone());
        Scheduler {
            pool,
            store,
            bus,
            supervisor,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// True when the given root is currently being driven.
    pub async fn is_active(&self, root_id: &str) -> bool {
        self.active.lock().await.contains_key(root_id)
    }

    /// Persists a parsed graph: the root task, one task row per sub-task
    /// and the sub-task shape records, all in pending state.
    pub async fn persist_graph(
        &self,
        graph: &ParsedGraph,
        work_directory: &str,
        return_mode: Option<ReturnMode>,
    ) -> TaskmillResult<Task> {
        if Task::find_by_id(&self.pool, &graph.root.id).await?.is_some() {
            return Err(TaskmillError::InvalidInput(format!(
                "task id '{}' already exists",
                graph.root.id
            )));
        }

        let default_timeout = graph
            .root
            .timeout_ms
            .unwrap_or(self.supervisor.config().execution_timeout_ms as i64);

        let root = Task::create(
            &self.pool,
            CreateTask {
                id: Some(graph.root.id.clone()),
                parent_id: None,
                name: graph.root.name.clone(),
                description: graph.root.objective.clone(),
                prompt: graph.root.objective.clone(),
                work_directory: work_directory.to_string(),
                priority: Priority::Medium,
                execution_mode: graph.root.execution_mode,
                return_mode,
                metadata: json!({ "requirements": graph.root.requirements }),
                timeout_ms: default_timeout,
            },
        )
        .await?;

        for sub in &graph.subtasks {
            let mut metadata = serde_json::Map::new();
            if let Some(complexity) = &sub.complexity {
                metadata.insert("complexity".into(), json!(complexity));
            }
            if let Some(impact) = &sub.impact {
                metadata.insert("impact".into(), json!(impact));
            }

            let created = Task::create(
                &self.pool,
                CreateTask {
                    id: Some(sub.id.clone()),
                    parent_id: Some(root.id.clone()),
                    name: sub.name.clone(),
                    description: sub.name.clone(),
                    prompt: sub.prompt(),
                    work_directory: work_directory.to_string(),
                    priority: sub.priority.unwrap_or(Priority::Medium),
                    execution_mode: sub.execution_mode.unwrap_or(graph.root.execution_mode),
                    return_mode: None,
                    metadata: serde_json::Value::Object(metadata),
                    timeout_ms: sub.timeout_ms.unwrap_or(default_timeout),
                },
            )
            .await;

            let created = match created {
                Ok(task) => task,
                Err(e) => {
                    // Cascade wipes the partial graph.
                    let _ = Task::delete(&self.pool, &root.id).await;
                    return Err(e.into());
                }
            };

            if let Err(e) = SubTask::create(
                &self.pool,
                CreateSubTask {
                    parent_id: root.id.clone(),
                    ordinal: sub.ordinal,
                    task_id: created.id,
                    name: sub.name.clone(),
                    description: sub.name.clone(),
                    execution_mode: sub.execution_mode,
                    dependencies: sub.dependencies.clone(),
                },
            )
            .await
            {
                let _ = Task::delete(&self.pool, &root.id).await;
                return Err(e.into());
            }
        }

        info!(
            root_id = %root.id,
            subtasks = graph.subtasks.len(),
            "Persisted task graph"
        );
        Ok(root)
    }

    /// Drives a persisted graph to completion and returns the root's
    /// result. Single-node roots (no sub-tasks) run directly through the
    /// supervisor.
    pub async fn run_graph(&self, root_id: &str) -> TaskmillResult<TaskResult> {
        // Acquire timeouts on the initial read are retried once before
        // surfacing as retryable to the caller.
        let root = with_acquire_retry(|| async {
            Task::find_by_id(&self.pool, root_id)
                .await
                .map_err(TaskmillError::from)
        })
        .await?
        .ok_or_else(|| TaskmillError::NotFound(format!("task '{}'", root_id)))?;

        if root.status.is_terminal() {
            return TaskResult::for_task(&self.pool, root_id).await?.ok_or_else(|| {
                TaskmillError::Internal(format!("terminal task '{}' has no result", root_id))
            });
        }

        let cancel = self.register(root_id).await?;
        let result = self.drive(root, cancel).await;
        self.active.lock().await.remove(root_id);
        result
    }

    /// Requests cancellation of a root task. Idempotent: cancelling a
    /// terminal task returns `false` and changes nothing.
    pub async fn cancel(&self, task_id: &str) -> TaskmillResult<bool> {
        if let Some(token) = self.active.lock().await.get(task_id).cloned() {
            token.cancel();
            return Ok(true);
        }

        let task = with_acquire_retry(|| async {
            Task::find_by_id(&self.pool, task_id)
                .await
                .map_err(TaskmillError::from)
        })
        .await?
        .ok_or_else(|| TaskmillError::NotFound(format!("task '{}'", task_id)))?;

        if task.status.is_terminal() {
            return Ok(false);
        }

        // Not driven by any scheduler: transition directly. The task row
        // and its sub-task mirror commit together.
        let progress = task.progress;
        let tx_task_id = task_id.to_string();
        self.store
            .transaction(move |conn: &mut sqlx::SqliteConnection| {
                Box::pin(async move {
                    Task::apply_terminal(&mut *conn, &tx_task_id, TaskStatus::Cancelled)
                        .await
                        .map_err(TaskmillError::from)?;
                    SubTask::mirror_status(&mut *conn, &tx_task_id, TaskStatus::Cancelled, progress)
                        .await
                        .map_err(TaskmillError::from)?;
                    Ok(())
                })
            })
            .await?;
        TaskResult::insert(
            &self.pool,
            NewTaskResult {
                task_id: task_id.to_string(),
                status: ResultStatus::Cancelled,
                output: String::new(),
                error: Some("task was cancelled".into()),
                execution_time_ms: 0,
                metadata: json!({}),
            },
        )
        .await?;
        let _ = record_log(
            &self.pool,
            &self.bus,
            NewTaskLog::info(task_id, LogKind::Status, "task cancelled")
                .with_status(TaskStatus::Cancelled.as_str()),
        )
        .await;

        Ok(true)
    }

    async fn register(&self, root_id: &str) -> TaskmillResult<CancellationToken> {
        let mut active = self.active.lock().await;
        if active.contains_key(root_id) {
            return Err(TaskmillError::AlreadyRunning(root_id.to_string()));
        }
        let token = CancellationToken::new();
        active.insert(root_id.to_string(), token.clone());
        Ok(token)
    }

    async fn drive(&self, root: Task, cancel: CancellationToken) -> TaskmillResult<TaskResult> {
        let subtasks = SubTask::list_by_parent(&self.pool, &root.id).await?;

        if subtasks.is_empty() {
            // Single task: the supervisor writes the terminal state and
            // the result.
            let spec = TaskSpec {
                task_id: root.id.clone(),
                prompt: root.prompt.clone(),
                work_directory: root.work_directory.clone(),
                timeout_ms: root.timeout_ms,
            };
            return match self.supervisor.run_task(spec, cancel).await {
                Ok(_) => TaskResult::for_task(&self.pool, &root.id)
                    .await?
                    .ok_or_else(|| {
                        TaskmillError::Internal(format!(
                            "task '{}' finished without a result",
                            root.id
                        ))
                    }),
                Err(e) => Err(e),
            };
        }

        self.drive_graph(root, subtasks, cancel).await
    }

    async fn drive_graph(
        &self,
        root: Task,
        subtasks: Vec<SubTask>,
        cancel: CancellationToken,
    ) -> TaskmillResult<TaskResult> {
        let nodes: Vec<GraphNode> = subtasks
            .iter()
            .map(|s| GraphNode {
                id: s.task_id.clone(),
                dependencies: s.dependencies.clone(),
            })
            .collect();

        // Cycle detection happens before any sub-task is dispatched.
        if let Err(e) = topological_order(&nodes) {
            self.fail_root_invalid(&root, &e).await?;
            return Err(e);
        }

        if root.status == TaskStatus::Pending {
            Task::mark_running(&self.pool, &root.id).await?;
        }
        let _ = record_log(
            &self.pool,
            &self.bus,
            NewTaskLog::info(&root.id, LogKind::Status, "graph execution started")
                .with_status(TaskStatus::Running.as_str()),
        )
        .await;

        let children = Task::children_of(&self.pool, &root.id).await?;
        let child_map: HashMap<String, Task> =
            children.into_iter().map(|t| (t.id.clone(), t)).collect();

        let mut tracker = DependencyTracker::new(&nodes);
        let mut dispatched: HashSet<String> = HashSet::new();
        let mut terminal: HashMap<String, TaskStatus> = HashMap::new();
        let mut sequential_inflight: Option<String> = None;
        let mut failed_seen = false;
        let mut timeout_seen = false;
        let mut failure_cascade = false;
        let mut root_deadline_hit = false;

        // Resume support: sub-tasks already terminal from a previous run
        // keep their states and satisfy their dependents.
        for sub in &subtasks {
            if sub.status.is_terminal() {
                terminal.insert(sub.task_id.clone(), sub.status);
                if sub.status == TaskStatus::Completed {
                    tracker.satisfy(&sub.task_id);
                }
                if sub.status == TaskStatus::Failed {
                    failed_seen = true;
                }
                if sub.status == TaskStatus::Timeout {
                    timeout_seen = true;
                }
            }
        }

        let mut joinset: JoinSet<(String, TaskmillResult<TaskOutcome>)> = JoinSet::new();
        let root_mode = root.execution_mode;
        let started = tokio::time::Instant::now();
        let root_deadline = started + Duration::from_millis(root.timeout_ms.max(1) as u64);
        let deadline_sleep = tokio::time::sleep_until(root_deadline);
        tokio::pin!(deadline_sleep);

        loop {
            // Dispatch the current ready wave (unless the graph is being
            // cancelled). All ready parallel nodes go out together; at
            // most one sequential node is in flight at a time, in
            // declaration order.
            if !cancel.is_cancelled() {
                for sub in &subtasks {
                    if dispatched.contains(&sub.task_id) || terminal.contains_key(&sub.task_id) {
                        continue;
                    }
                    if !tracker.is_ready(&sub.task_id) {
                        continue;
                    }
                    let mode = sub.execution_mode.unwrap_or(root_mode);
                    match mode {
                        ExecutionMode::Parallel => {
                            self.dispatch(&mut joinset, &child_map, &sub.task_id, &cancel);
                            dispatched.insert(sub.task_id.clone());
                        }
                        ExecutionMode::Sequential => {
                            if sequential_inflight.is_none() {
                                self.dispatch(&mut joinset, &child_map, &sub.task_id, &cancel);
                                dispatched.insert(sub.task_id.clone());
                                sequential_inflight = Some(sub.task_id.clone());
                            }
                        }
                    }
                }
            }

            if joinset.is_empty() {
                break;
            }

            let joined = tokio::select! {
                joined = joinset.join_next() => joined,
                _ = &mut deadline_sleep, if !root_deadline_hit => {
                    // Root-level timeout behaves as a cancel of the
                    // remaining graph.
                    root_deadline_hit = true;
                    cancel.cancel();
                    continue;
                }
            };

            let (task_id, run) = match joined {
                Some(Ok(pair)) => pair,
                Some(Err(e)) => {
                    warn!(root_id = %root.id, error = %e, "Dispatched sub-task panicked");
                    continue;
                }
                None => break,
            };

            if sequential_inflight.as_deref() == Some(task_id.as_str()) {
                sequential_inflight = None;
            }

            let status = match run {
                Ok(outcome) => outcome.task_status(),
                // Spawn exhaustion already left the task failed.
                Err(_) => TaskStatus::Failed,
            };
            terminal.insert(task_id.clone(), status);

            match status {
                TaskStatus::Completed => {
                    tracker.satisfy(&task_id);
                }
                _ => {
                    if status == TaskStatus::Failed {
                        failed_seen = true;
                    }
                    if status == TaskStatus::Timeout {
                        timeout_seen = true;
                    }

                    // Dependents of a non-success node are never
                    // dispatched: cancel the whole dependency closure.
                    for blocked in tracker.closure_of(&task_id) {
                        if dispatched.contains(&blocked) || terminal.contains_key(&blocked) {
                            continue;
                        }
                        self.cancel_blocked(&blocked, &task_id).await?;
                        terminal.insert(blocked, TaskStatus::Cancelled);
                        if status == TaskStatus::Failed {
                            failure_cascade = true;
                        }
                    }

                    // Sequential root mode: a failure stops dispatch of
                    // later declaration-order siblings.
                    if root_mode == ExecutionMode::Sequential
                        && matches!(status, TaskStatus::Failed | TaskStatus::Timeout)
                    {
                        let failed_ordinal = subtasks
                            .iter()
                            .find(|s| s.task_id == task_id)
                            .map(|s| s.ordinal)
                            .unwrap_or(i64::MAX);
                        for sub in &subtasks {
                            if sub.ordinal <= failed_ordinal
                                || dispatched.contains(&sub.task_id)
                                || terminal.contains_key(&sub.task_id)
                            {
                                continue;
                            }
                            self.cancel_blocked(&sub.task_id, &task_id).await?;
                            terminal.insert(sub.task_id.clone(), TaskStatus::Cancelled);
                            if status == TaskStatus::Failed {
                                failure_cascade = true;
                            }
                        }
                    }
                }
            }
        }

        // Anything still non-terminal (pending nodes after a cancel, or
        // nodes stranded behind non-success dependencies) is cancelled.
        for sub in &subtasks {
            if terminal.contains_key(&sub.task_id) {
                continue;
            }
            let blocked_on = tracker.unsatisfied(&sub.task_id);
            let reason = blocked_on.first().cloned().unwrap_or_default();
            self.cancel_blocked(&sub.task_id, &reason).await?;
            terminal.insert(sub.task_id.clone(), TaskStatus::Cancelled);
        }

        // Reduce the children's terminal states into the root's.
        let all_completed = terminal.values().all(|s| *s == TaskStatus::Completed);
        let root_status = if root_deadline_hit {
            TaskStatus::Timeout
        } else if cancel.is_cancelled() {
            TaskStatus::Cancelled
        } else if failed_seen || failure_cascade {
            TaskStatus::Failed
        } else if timeout_seen {
            TaskStatus::Timeout
        } else if all_completed {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };

        self.finish_root(&root, &subtasks, root_status, started).await
    }

    fn dispatch(
        &self,
        joinset: &mut JoinSet<(String, TaskmillResult<TaskOutcome>)>,
        child_map: &HashMap<String, Task>,
        task_id: &str,
        cancel: &CancellationToken,
    ) {
        let Some(task) = child_map.get(task_id) else {
            warn!(task_id = %task_id, "Sub-task has no task row, skipping dispatch");
            return;
        };

        let spec = TaskSpec {
            task_id: task.id.clone(),
            prompt: task.prompt.clone(),
            work_directory: task.work_directory.clone(),
            timeout_ms: task.timeout_ms,
        };
        let supervisor = self.supervisor.clone();
        let child_cancel = cancel.child_token();

        joinset.spawn(async move {
            let id = spec.task_id.clone();
            (id, supervisor.run_task(spec, child_cancel).await)
        });
    }

    /// Cancels a node that will never run because a dependency ended
    /// non-success, logging which dependency blocked it.
    async fn cancel_blocked(&self, task_id: &str, blocked_on: &str) -> TaskmillResult<()> {
        let tx_task_id = task_id.to_string();
        self.store
            .transaction(move |conn: &mut sqlx::SqliteConnection| {
                Box::pin(async move {
                    Task::apply_terminal(&mut *conn, &tx_task_id, TaskStatus::Cancelled)
                        .await
                        .map_err(TaskmillError::from)?;
                    SubTask::mirror_status(&mut *conn, &tx_task_id, TaskStatus::Cancelled, 0)
                        .await
                        .map_err(TaskmillError::from)?;
                    Ok(())
                })
            })
            .await?;

        let message = if blocked_on.is_empty() {
            "cancelled before dispatch".to_string()
        } else {
            format!("cancelled: dependency '{}' did not complete", blocked_on)
        };

        TaskResult::insert(
            &self.pool,
            NewTaskResult {
                task_id: task_id.to_string(),
                status: ResultStatus::Cancelled,
                output: String::new(),
                error: Some(message.clone()),
                execution_time_ms: 0,
                metadata: json!({ "blocked_on": blocked_on }),
            },
        )
        .await?;

        let _ = record_log(
            &self.pool,
            &self.bus,
            NewTaskLog::info(task_id, LogKind::Status, message)
                .with_level(LogLevel::Warn)
                .with_status(TaskStatus::Cancelled.as_str()),
        )
        .await;

        Ok(())
    }

    async fn fail_root_invalid(&self, root: &Task, error: &TaskmillError) -> TaskmillResult<()> {
        if root.status == TaskStatus::Pending {
            Task::mark_running(&self.pool, &root.id).await?;
        }
        Task::mark_failed(&self.pool, &root.id).await?;
        TaskResult::insert(
            &self.pool,
            NewTaskResult {
                task_id: root.id.clone(),
                status: ResultStatus::Error,
                output: String::new(),
                error: Some(error.to_string()),
                execution_time_ms: 0,
                metadata: json!({}),
            },
        )
        .await?;
        let _ = record_log(
            &self.pool,
            &self.bus,
            NewTaskLog::info(&root.id, LogKind::Error, error.to_string())
                .with_level(LogLevel::Error)
                .with_status(TaskStatus::Failed.as_str()),
        )
        .await;
        Ok(())
    }

    async fn finish_root(
        &self,
        root: &Task,
        subtasks: &[SubTask],
        root_status: TaskStatus,
        started: tokio::time::Instant,
    ) -> TaskmillResult<TaskResult> {
        let marked = match root_status {
            TaskStatus::Completed => Task::mark_completed(&self.pool, &root.id).await?,
            TaskStatus::Failed => Task::mark_failed(&self.pool, &root.id).await?,
            TaskStatus::Timeout => Task::mark_timeout(&self.pool, &root.id).await?,
            TaskStatus::Cancelled => Task::mark_cancelled(&self.pool, &root.id).await?,
            _ => None,
        };

        let execution_time_ms = marked
            .as_ref()
            .and_then(|t| t.duration_ms())
            .unwrap_or_else(|| started.elapsed().as_millis() as i64);

        // Reload the sub-task rows: their mirrored statuses changed while
        // the graph ran.
        let subtasks = SubTask::list_by_parent(&self.pool, &root.id).await?;
        let output = self
            .reduce_output(&subtasks, root.return_mode.unwrap_or(ReturnMode::Full))
            .await?;

        let result_status = match root_status {
            TaskStatus::Completed => ResultStatus::Success,
            TaskStatus::Timeout => ResultStatus::Timeout,
            TaskStatus::Cancelled => ResultStatus::Cancelled,
            _ => ResultStatus::Error,
        };

        TaskResult::insert(
            &self.pool,
            NewTaskResult {
                task_id: root.id.clone(),
                status: result_status,
                output,
                error: match result_status {
                    ResultStatus::Success => None,
                    _ => Some(format!("graph finished with status '{}'", root_status)),
                },
                execution_time_ms,
                metadata: json!({ "subtask_count": subtasks.len() }),
            },
        )
        .await?;

        let _ = record_log(
            &self.pool,
            &self.bus,
            NewTaskLog::info(
                &root.id,
                LogKind::Status,
                format!("graph finished: {}", root_status),
            )
            .with_status(root_status.as_str()),
        )
        .await;

        info!(root_id = %root.id, status = %root_status, "Graph execution finished");

        TaskResult::for_task(&self.pool, &root.id).await?.ok_or_else(|| {
            TaskmillError::Internal(format!("root '{}' finished without a result", root.id))
        })
    }

    /// Builds the root output from the children's results: `full`
    /// concatenates every child's output, `summary` synthesizes a
    /// bounded per-child status digest.
    async fn reduce_output(
        &self,
        subtasks: &[SubTask],
        return_mode: ReturnMode,
    ) -> TaskmillResult<String> {
        let mut out = String::new();

        match return_mode {
            ReturnMode::Full => {
                for sub in subtasks {
                    if let Some(result) = TaskResult::for_task(&self.pool, &sub.task_id).await? {
                        out.push_str(&format!("### Task {}: {}\n", sub.ordinal, sub.name));
                        out.push_str(&result.output);
                        if !out.ends_with('\n') {
                            out.push('\n');
                        }
                        out.push('\n');
                    }
                }
            }
            ReturnMode::Summary => {
                let completed = subtasks
                    .iter()
                    .filter(|s| s.status == TaskStatus::Completed)
                    .count();
                out.push_str(&format!(
                    "{}/{} sub-tasks completed\n",
                    completed,
                    subtasks.len()
                ));
                for sub in subtasks {
                    out.push_str(&format!(
                        "Task {} ({}): {}\n",
                        sub.ordinal,
                        sub.name,
                        sub.status.as_str()
                    ));
                }
                truncate_output(&mut out, SUMMARY_MAX_BYTES);
            }
        }

        Ok(out)
    }
}
