/// Child-process supervisor
///
/// Runs a single task's prompt under a deadline and reports back. The
/// supervisor owns the instance pool (FIFO acquisition under a cap, idle
/// reuse) and the full spawn contract:
///
/// 1. Acquire an instance slot, bind it, transition the task to running
/// 2. Hand the prompt to the runner (child process)
/// 3. Heartbeat timer: periodic heartbeat log + telemetry while running
/// 4. Deadline timer: SIGTERM/grace/SIGKILL through the runner's kill
///    token, terminal state `timeout` under the `timeout_handled` guard
/// 5. External cancel: same termination dance, terminal state `cancelled`
/// 6. Always: stop timers, write the task result, fold instance metrics,
///    unbind and release the slot
///
/// Spawn failures (the child never started) retry up to `max_retries`
/// with linear backoff; anything after the child started is reported
/// as-is, never retried.

use crate::runner::{RunRequest, RunnerError, TaskRunner};
use sqlx::sqlite::SqlitePool;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taskmill_shared::db::store::Store;
use taskmill_shared::error::{TaskmillError, TaskmillResult};
use taskmill_shared::events::{record_log, EventBus};
use taskmill_shared::models::instance::{Instance, InstanceStatus, TaskOutcomeKind};
use taskmill_shared::models::subtask::SubTask;
use taskmill_shared::models::task::{Task, TaskStatus};
use taskmill_shared::models::task_log::{LogKind, LogLevel, NewTaskLog};
use taskmill_shared::models::task_result::{NewTaskResult, ResultStatus, TaskResult};
use taskmill_shared::models::telemetry::{InstanceTelemetry, NewTelemetry, TelemetryKind};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Heartbeat cadence during a running child
    pub heartbeat_interval_ms: u64,

    /// Default per-task timeout when the task carries none
    pub execution_timeout_ms: u64,

    /// Spawn-retry cap
    pub max_retries: u32,

    /// Base delay between spawn retries (linear backoff)
    pub retry_delay_ms: u64,

    /// Concurrent-children cap; requests beyond it queue FIFO
    pub max_instances: usize,

    /// Grace between SIGTERM and SIGKILL
    pub kill_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            heartbeat_interval_ms: 15_000,
            execution_timeout_ms: 1_800_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            max_instances: 10,
            kill_grace_ms: 1_000,
        }
    }
}

/// One execution order for the supervisor.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_id: String,
    pub prompt: String,
    pub work_directory: String,
    pub timeout_ms: i64,
}

/// Terminal taxonomy of one supervised execution.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success {
        output: String,
        execution_time_ms: i64,
    },
    Failed {
        output: String,
        error: String,
        execution_time_ms: i64,
    },
    Timeout {
        execution_time_ms: i64,
    },
    Cancelled {
        execution_time_ms: i64,
    },
}

impl TaskOutcome {
    pub fn task_status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Success { .. } => TaskStatus::Completed,
            TaskOutcome::Failed { .. } => TaskStatus::Failed,
            TaskOutcome::Timeout { .. } => TaskStatus::Timeout,
            TaskOutcome::Cancelled { .. } => TaskStatus::Cancelled,
        }
    }

    pub fn result_status(&self) -> ResultStatus {
        match self {
            TaskOutcome::Success { .. } => ResultStatus::Success,
            TaskOutcome::Failed { .. } => ResultStatus::Error,
            TaskOutcome::Timeout { .. } => ResultStatus::Timeout,
            TaskOutcome::Cancelled { .. } => ResultStatus::Cancelled,
        }
    }

    fn outcome_kind(&self) -> TaskOutcomeKind {
        match self {
            TaskOutcome::Success { .. } => TaskOutcomeKind::Success,
            TaskOutcome::Failed { .. } => TaskOutcomeKind::Failure,
            TaskOutcome::Timeout { .. } => TaskOutcomeKind::Timeout,
            TaskOutcome::Cancelled { .. } => TaskOutcomeKind::Cancelled,
        }
    }

    pub fn execution_time_ms(&self) -> i64 {
        match self {
            TaskOutcome::Success {
                execution_time_ms, ..
            }
            | TaskOutcome::Failed {
                execution_time_ms, ..
            }
            | TaskOutcome::Timeout { execution_time_ms }
            | TaskOutcome::Cancelled { execution_time_ms } => *execution_time_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success { .. })
    }
}

/// FIFO instance pool under the concurrency cap.
struct InstanceSlots {
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<String>>,
}

/// A held slot: dropping the permit wakes the next waiter.
struct InstanceLease {
    instance_id: String,
    _permit: OwnedSemaphorePermit,
}

impl InstanceSlots {
    fn new(cap: usize) -> Self {
        InstanceSlots {
            semaphore: Arc::new(Semaphore::new(cap.max(1))),
            idle: Mutex::new(VecDeque::new()),
        }
    }

    /// Acquires a slot, reusing an idle instance or creating a fresh one.
    async fn acquire(&self, pool: &SqlitePool) -> TaskmillResult<InstanceLease> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TaskmillError::Internal("instance pool closed".into()))?;

        // Reuse the least-recently released instance that is still live.
        loop {
            let candidate = self.idle.lock().await.pop_front();
            match candidate {
                Some(id) => match Instance::find_by_id(pool, &id).await? {
                    Some(instance)
                        if matches!(
                            instance.status,
                            InstanceStatus::Idle | InstanceStatus::Error
                        ) =>
                    {
                        return Ok(InstanceLease {
                            instance_id: instance.id,
                            _permit: permit,
                        });
                    }
                    _ => continue,
                },
                None => break,
            }
        }

        let instance = Instance::create(pool, Default::default()).await?;
        debug!(instance_id = %instance.id, "Created new instance slot");
        Ok(InstanceLease {
            instance_id: instance.id,
            _permit: permit,
        })
    }

    async fn release(&self, instance_id: String) {
        self.idle.lock().await.push_back(instance_id);
    }

    async fn drain(&self) -> Vec<String> {
        self.idle.lock().await.drain(..).collect()
    }
}

enum RunEnd {
    Outcome(TaskOutcome),
    SpawnExhausted { attempts: u32, message: String },
}

/// Supervisor: one shared pool of instance slots, one runner.
pub struct Supervisor {
    pool: SqlitePool,

    /// Store handle over the same pool, for multi-statement transactions
    store: Store,

    bus: EventBus,
    runner: Arc<dyn TaskRunner>,
    config: SupervisorConfig,
    slots: InstanceSlots,
}

impl Supervisor {
    pub fn new(
        pool: SqlitePool,
        bus: EventBus,
        runner: Arc<dyn TaskRunner>,
        config: SupervisorConfig,
    ) -> Self {
        let slots = InstanceSlots::new(config.max_instances);
        let store = Store::from_pool(pool.clone());
        Supervisor {
            pool,
            store,
            bus,
            runner,
            config,
            slots,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Runs one task to a terminal state
    ///
    /// Returns the outcome taxonomy; every branch leaves the store
    /// consistent (terminal task status, one result row, instance
    /// unbound, metrics folded).
    pub async fn run_task(
        &self,
        spec: TaskSpec,
        cancel: CancellationToken,
    ) -> TaskmillResult<TaskOutcome> {
        if spec.timeout_ms <= 0 {
            return Err(TaskmillError::InvalidInput(format!(
                "timeout must be positive, got {}",
                spec.timeout_ms
            )));
        }

        // Cancel before dispatch: cancelled, never failed.
        if cancel.is_cancelled() {
            return self.cancel_before_start(&spec).await;
        }

        let lease = tokio::select! {
            lease = self.slots.acquire(&self.pool) => lease?,
            _ = cancel.cancelled() => {
                return self.cancel_before_start(&spec).await;
            }
        };
        let instance_id = lease.instance_id.clone();

        // Bind and transition to running. A task that is no longer
        // pending was cancelled underneath us; bail out cleanly.
        Instance::bind(&self.pool, &instance_id, &spec.task_id).await?;
        Task::bind_instance(&self.pool, &spec.task_id, &instance_id).await?;

        if Task::mark_running(&self.pool, &spec.task_id).await?.is_none() {
            Task::release_instance(&self.pool, &spec.task_id).await?;
            Instance::release(&self.pool, &instance_id, InstanceStatus::Idle).await?;
            self.slots.release(instance_id).await;
            return Ok(TaskOutcome::Cancelled {
                execution_time_ms: 0,
            });
        }

        let _ = record_log(
            &self.pool,
            &self.bus,
            NewTaskLog::info(&spec.task_id, LogKind::Status, "task dispatched")
                .with_instance(&instance_id)
                .with_status(TaskStatus::Running.as_str()),
        )
        .await;

        let heartbeat = self.spawn_heartbeat(spec.task_id.clone(), instance_id.clone());

        let start = tokio::time::Instant::now();
        let end = self.drive_child(&spec, &cancel, start).await;

        heartbeat.abort();

        let execution_time_ms = start.elapsed().as_millis() as i64;
        let result = self
            .finish(&spec, &instance_id, end, execution_time_ms)
            .await;

        // Slot release happens even when the terminal bookkeeping failed.
        if let Err(e) = Task::release_instance(&self.pool, &spec.task_id).await {
            error!(task_id = %spec.task_id, error = %e, "Failed to unbind instance");
        }
        self.slots.release(instance_id).await;

        result
    }

    /// Terminates idle instances. Called on process shutdown.
    pub async fn shutdown(&self) {
        for instance_id in self.slots.drain().await {
            if let Err(e) = Instance::terminate(&self.pool, &instance_id).await {
                warn!(instance_id = %instance_id, error = %e, "Failed to terminate instance");
            }
        }
    }

    /// The runner race: child exit vs deadline vs external cancel, with
    /// spawn retries under linear backoff.
    async fn drive_child(
        &self,
        spec: &TaskSpec,
        cancel: &CancellationToken,
        start: tokio::time::Instant,
    ) -> RunEnd {
        let deadline = start + Duration::from_millis(spec.timeout_ms as u64);
        let request = RunRequest {
            task_id: spec.task_id.clone(),
            prompt: spec.prompt.clone(),
            work_directory: PathBuf::from(&spec.work_directory),
        };

        let mut attempt: u32 = 0;
        loop {
            let kill = CancellationToken::new();
            let run_fut = self.runner.run(request.clone(), kill.clone());
            tokio::pin!(run_fut);

            enum Step {
                Done(Result<crate::runner::ChildOutput, RunnerError>),
                Deadline,
                Cancel,
            }

            let step = tokio::select! {
                res = &mut run_fut => Step::Done(res),
                _ = tokio::time::sleep_until(deadline) => Step::Deadline,
                _ = cancel.cancelled() => Step::Cancel,
            };

            let elapsed = start.elapsed().as_millis() as i64;
            match step {
                Step::Done(Ok(output)) => {
                    if output.is_success() {
                        return RunEnd::Outcome(TaskOutcome::Success {
                            output: output.stdout,
                            execution_time_ms: elapsed,
                        });
                    }
                    let error = if output.stderr.is_empty() {
                        format!("child exited with code {:?}", output.exit_code)
                    } else {
                        output.stderr
                    };
                    return RunEnd::Outcome(TaskOutcome::Failed {
                        output: output.stdout,
                        error,
                        execution_time_ms: elapsed,
                    });
                }
                Step::Done(Err(RunnerError::Io(message))) => {
                    return RunEnd::Outcome(TaskOutcome::Failed {
                        output: String::new(),
                        error: message,
                        execution_time_ms: elapsed,
                    });
                }
                Step::Done(Err(RunnerError::SpawnFailed(message))) => {
                    attempt += 1;
                    if attempt >= self.config.max_retries {
                        return RunEnd::SpawnExhausted {
                            attempts: attempt,
                            message,
                        };
                    }

                    warn!(
                        task_id = %spec.task_id,
                        attempt,
                        max_retries = self.config.max_retries,
                        error = %message,
                        "Spawn failed, retrying"
                    );
                    let _ = record_log(
                        &self.pool,
                        &self.bus,
                        NewTaskLog::info(
                            &spec.task_id,
                            LogKind::Error,
                            format!("spawn attempt {} failed: {}", attempt, message),
                        )
                        .with_level(LogLevel::Warn),
                    )
                    .await;

                    // Linear backoff, abandoned by cancel or the deadline.
                    // No child is alive here, so there is nothing to kill.
                    let delay = Duration::from_millis(self.config.retry_delay_ms * attempt as u64);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = tokio::time::sleep_until(deadline) => {
                            return RunEnd::Outcome(self.claim_forced_outcome(spec, true, start).await);
                        }
                        _ = cancel.cancelled() => {
                            return RunEnd::Outcome(self.claim_forced_outcome(spec, false, start).await);
                        }
                    }
                }
                Step::Deadline => {
                    let outcome = self.claim_forced_outcome(spec, true, start).await;
                    kill.cancel();
                    // Reap the child; a late natural exit is ignored by
                    // contract.
                    let _ = (&mut run_fut).await;
                    return RunEnd::Outcome(outcome);
                }
                Step::Cancel => {
                    let outcome = self.claim_forced_outcome(spec, false, start).await;
                    kill.cancel();
                    let _ = (&mut run_fut).await;
                    return RunEnd::Outcome(outcome);
                }
            }
        }
    }

    /// Names the terminal state of a forced termination. The
    /// `timeout_handled` claim decides the winner when deadline and
    /// cancel overlap: whoever claims first names the state, the loser's
    /// transition becomes a no-op.
    async fn claim_forced_outcome(
        &self,
        spec: &TaskSpec,
        by_deadline: bool,
        start: tokio::time::Instant,
    ) -> TaskOutcome {
        let claimed = Task::claim_timeout_handled(&self.pool, &spec.task_id)
            .await
            .unwrap_or(false);

        let execution_time_ms = start.elapsed().as_millis() as i64;
        if by_deadline && claimed {
            TaskOutcome::Timeout { execution_time_ms }
        } else {
            TaskOutcome::Cancelled { execution_time_ms }
        }
    }

    /// Periodic heartbeat: log row + telemetry sample + instance stamp.
    fn spawn_heartbeat(&self, task_id: String, instance_id: String) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let bus = self.bus.clone();
        let period = Duration::from_millis(self.config.heartbeat_interval_ms);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;

                if let Err(e) = record_log(
                    &pool,
                    &bus,
                    NewTaskLog::info(&task_id, LogKind::Heartbeat, "heartbeat")
                        .with_instance(&instance_id)
                        .with_level(LogLevel::Debug),
                )
                .await
                {
                    warn!(task_id = %task_id, error = %e, "Heartbeat log failed");
                }

                if let Err(e) = InstanceTelemetry::record(
                    &pool,
                    NewTelemetry::new(TelemetryKind::Heartbeat, 1.0)
                        .for_instance(&instance_id)
                        .for_task(&task_id),
                )
                .await
                {
                    warn!(task_id = %task_id, error = %e, "Heartbeat telemetry failed");
                }

                if let Err(e) = Instance::touch_heartbeat(&pool, &instance_id).await {
                    warn!(instance_id = %instance_id, error = %e, "Heartbeat stamp failed");
                }
            }
        })
    }

    /// Applies the terminal state, result row, logs, telemetry and
    /// instance metrics for a finished run.
    async fn finish(
        &self,
        spec: &TaskSpec,
        instance_id: &str,
        end: RunEnd,
        execution_time_ms: i64,
    ) -> TaskmillResult<TaskOutcome> {
        let (outcome, spawn_error) = match end {
            RunEnd::Outcome(outcome) => (outcome, None),
            RunEnd::SpawnExhausted { attempts, message } => {
                let error = format!(
                    "failed to spawn assistant process after {} attempts: {}",
                    attempts, message
                );
                (
                    TaskOutcome::Failed {
                        output: String::new(),
                        error: error.clone(),
                        execution_time_ms,
                    },
                    Some(TaskmillError::SpawnFailed { attempts, message }),
                )
            }
        };

        self.apply_terminal(spec, instance_id, &outcome).await?;

        let kind = outcome.outcome_kind();
        if let Err(e) =
            Instance::record_outcome(&self.pool, instance_id, kind, execution_time_ms).await
        {
            error!(instance_id = %instance_id, error = %e, "Failed to fold instance metrics");
        }

        let release_status = match outcome {
            TaskOutcome::Failed { .. } => InstanceStatus::Error,
            _ => InstanceStatus::Idle,
        };
        Instance::release(&self.pool, instance_id, release_status).await?;

        match spawn_error {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    async fn apply_terminal(
        &self,
        spec: &TaskSpec,
        instance_id: &str,
        outcome: &TaskOutcome,
    ) -> TaskmillResult<()> {
        let pool = &self.pool;
        let task_id = spec.task_id.as_str();
        let status = outcome.task_status();

        // The task's terminal transition and the sub-task mirror commit
        // together, so no reader ever sees them disagree.
        let tx_task_id = spec.task_id.clone();
        let _marked = self
            .store
            .transaction(move |conn: &mut sqlx::SqliteConnection| {
                Box::pin(async move {
                    let marked = Task::apply_terminal(&mut *conn, &tx_task_id, status)
                        .await
                        .map_err(TaskmillError::from)?;
                    let progress = match &marked {
                        Some(task) => task.progress,
                        None => Task::find_by_id_on(&mut *conn, &tx_task_id)
                            .await
                            .map_err(TaskmillError::from)?
                            .map(|t| t.progress)
                            .unwrap_or(0),
                    };
                    SubTask::mirror_status(&mut *conn, &tx_task_id, status, progress)
                        .await
                        .map_err(TaskmillError::from)?;
                    Ok(marked)
                })
            })
            .await?;

        let (output, error) = match outcome {
            TaskOutcome::Success { output, .. } => (output.clone(), None),
            TaskOutcome::Failed { output, error, .. } => (output.clone(), Some(error.clone())),
            TaskOutcome::Timeout { .. } => (
                String::new(),
                Some(format!("task exceeded {}ms timeout", spec.timeout_ms)),
            ),
            TaskOutcome::Cancelled { .. } => (String::new(), Some("task was cancelled".into())),
        };

        TaskResult::insert(
            pool,
            NewTaskResult {
                task_id: task_id.to_string(),
                status: outcome.result_status(),
                output,
                error: error.clone(),
                execution_time_ms: outcome.execution_time_ms(),
                metadata: serde_json::Value::Object(Default::default()),
            },
        )
        .await?;

        let (kind, level, message) = match outcome {
            TaskOutcome::Success { .. } => {
                (LogKind::Status, LogLevel::Info, "task completed".to_string())
            }
            TaskOutcome::Failed { error, .. } => {
                (LogKind::Error, LogLevel::Error, format!("task failed: {}", error))
            }
            TaskOutcome::Timeout { .. } => (
                LogKind::Status,
                LogLevel::Warn,
                format!("task timed out after {}ms", spec.timeout_ms),
            ),
            TaskOutcome::Cancelled { .. } => {
                (LogKind::Status, LogLevel::Info, "task cancelled".to_string())
            }
        };
        let _ = record_log(
            pool,
            &self.bus,
            NewTaskLog::info(task_id, kind, message)
                .with_instance(instance_id)
                .with_level(level)
                .with_status(status.as_str()),
        )
        .await;

        let telemetry = match outcome {
            TaskOutcome::Success { .. } | TaskOutcome::Cancelled { .. } => NewTelemetry::new(
                TelemetryKind::Performance,
                outcome.execution_time_ms() as f64,
            ),
            TaskOutcome::Failed { .. } => NewTelemetry::new(TelemetryKind::Error, 1.0),
            TaskOutcome::Timeout { .. } => NewTelemetry::new(TelemetryKind::Timeout, 1.0),
        };
        let _ = InstanceTelemetry::record(
            pool,
            telemetry.for_instance(instance_id).for_task(task_id),
        )
        .await;

        match outcome {
            TaskOutcome::Success { .. } => {
                info!(task_id = %task_id, "Task completed");
            }
            TaskOutcome::Failed { error, .. } => {
                warn!(task_id = %task_id, error = %error, "Task failed");
            }
            TaskOutcome::Timeout { .. } => {
                warn!(task_id = %task_id, timeout_ms = spec.timeout_ms, "Task timed out");
            }
            TaskOutcome::Cancelled { .. } => {
                info!(task_id = %task_id, "Task cancelled");
            }
        }

        Ok(())
    }

    /// Cancel observed before the child ever started.
    async fn cancel_before_start(&self, spec: &TaskSpec) -> TaskmillResult<TaskOutcome> {
        let tx_task_id = spec.task_id.clone();
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

        TaskResult::insert(
            &self.pool,
            NewTaskResult {
                task_id: spec.task_id.clone(),
                status: ResultStatus::Cancelled,
                output: String::new(),
                error: Some("task was cancelled before start".into()),
                execution_time_ms: 0,
                metadata: serde_json::Value::Object(Default::default()),
            },
        )
        .await?;

        let _ = record_log(
            &self.pool,
            &self.bus,
            NewTaskLog::info(
                &spec.task_id,
                LogKind::Status,
                "task cancelled before start",
            )
            .with_status(TaskStatus::Cancelled.as_str()),
        )
        .await;

        Ok(TaskOutcome::Cancelled {
            execution_time_ms: 0,
        })
    }
}
