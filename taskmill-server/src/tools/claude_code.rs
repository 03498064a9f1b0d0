/// `claude_code` tool
///
/// Runs work through the scheduler and returns the terminal result.
/// Three request shapes share one entry point:
///
/// 1. `prompt` equals the id of a persisted root task → resume its
///    scheduling.
/// 2. `prompt` is a task markdown document (`# Task <id>: …`) → parse,
///    persist the graph, drive it.
/// 3. anything else → create a single task and run it.
///
/// While the call is pending, every log row of the driven root (and its
/// sub-tasks) is forwarded to the transport as a `task_log` event frame.
/// `returnMode=summary` truncates the returned output to a bounded
/// length.

use crate::app::AppState;
use crate::error::ErrorBody;
use crate::tools::EventSink;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use taskmill_engine::parser::parse_task_markdown;
use taskmill_engine::scheduler::{truncate_output, SUMMARY_MAX_BYTES};
use taskmill_shared::error::TaskmillError;
use taskmill_shared::models::task::{CreateTask, ExecutionMode, ReturnMode, Task};
use taskmill_shared::models::task_result::TaskResult;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct ClaudeCodeRequest {
    /// Prompt text, a task id to resume, or a task markdown document
    #[validate(length(min = 1))]
    prompt: String,

    /// Working directory for the child process(es)
    #[validate(length(min = 1))]
    work_folder: String,

    /// Attach the created task under an existing parent
    parent_task_id: Option<String>,

    /// `summary` or `full` (default)
    return_mode: Option<String>,

    /// Human name for the created task
    task_description: Option<String>,

    /// Advisory execution mode annotation
    mode: Option<String>,

    /// Per-task timeout in milliseconds
    #[validate(range(min = 1, max = 86_400_000))]
    timeout: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClaudeCodeResponse {
    task_id: String,
    status: String,
    output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    execution_time_ms: i64,
}

pub async fn handle(
    state: &AppState,
    arguments: JsonValue,
    events: EventSink,
) -> Result<JsonValue, ErrorBody> {
    let request: ClaudeCodeRequest = serde_json::from_value(arguments)
        .map_err(|e| ErrorBody::new("invalid-input", format!("bad arguments: {}", e)))?;
    request.validate()?;

    let return_mode = match request.return_mode.as_deref() {
        None => None,
        Some(raw) => Some(ReturnMode::parse(raw).ok_or_else(|| {
            ErrorBody::new("invalid-input", format!("unknown returnMode '{}'", raw))
        })?),
    };

    let root_id = resolve_root(state, &request, return_mode).await?;

    // Forward this root's log rows as event frames while the call runs.
    let forwarder = spawn_log_forwarder(state, root_id.clone(), events);

    let run = state.scheduler.run_graph(&root_id).await;
    // Let the forwarder flush the terminal log frames before it stops.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    forwarder.abort();

    let result = match run {
        Ok(result) => result,
        Err(e) => {
            // Spawn exhaustion still leaves a terminal task and result
            // behind; other errors surface directly.
            if let TaskmillError::SpawnFailed { .. } = e {
                match TaskResult::for_task(state.store.pool(), &root_id).await {
                    Ok(Some(result)) => result,
                    _ => return Err(e.into()),
                }
            } else {
                return Err(e.into());
            }
        }
    };

    let mut output = result.output;
    if return_mode == Some(ReturnMode::Summary) {
        truncate_output(&mut output, SUMMARY_MAX_BYTES);
    }

    let response = ClaudeCodeResponse {
        task_id: root_id,
        status: result.status.as_str().to_string(),
        output,
        error: result.error,
        execution_time_ms: result.execution_time_ms,
    };

    serde_json::to_value(&response)
        .map_err(|e| ErrorBody::new("internal", format!("failed to encode response: {}", e)))
}

/// Determines which root to drive: an existing task, a freshly persisted
/// graph, or a new single task.
async fn resolve_root(
    state: &AppState,
    request: &ClaudeCodeRequest,
    return_mode: Option<ReturnMode>,
) -> Result<String, ErrorBody> {
    let pool = state.store.pool();
    let trimmed = request.prompt.trim();

    // Shape 1: resume a persisted graph by id.
    if !trimmed.contains('\n') {
        if let Some(existing) = Task::find_by_id(pool, trimmed).await.map_err(to_internal)? {
            if state.scheduler.is_active(&existing.id).await {
                return Err(TaskmillError::AlreadyRunning(existing.id).into());
            }
            tracing::info!(task_id = %existing.id, "Resuming persisted task");
            return Ok(existing.id);
        }
    }

    // Shape 2: the prompt is itself a task markdown document.
    if trimmed.starts_with("# Task ") {
        let graph = parse_task_markdown(trimmed).map_err(ErrorBody::from)?;
        let root = state
            .scheduler
            .persist_graph(&graph, &request.work_folder, return_mode)
            .await
            .map_err(ErrorBody::from)?;
        return Ok(root.id);
    }

    // Shape 3: one task, no sub-graph.
    if let Some(parent_id) = &request.parent_task_id {
        if Task::find_by_id(pool, parent_id)
            .await
            .map_err(to_internal)?
            .is_none()
        {
            return Err(ErrorBody::new(
                "not-found",
                format!("parent task '{}' not found", parent_id),
            ));
        }
    }

    let execution_mode = match request.mode.as_deref() {
        Some("parallel") => ExecutionMode::Parallel,
        _ => ExecutionMode::Sequential,
    };

    let name = request
        .task_description
        .clone()
        .unwrap_or_else(|| summarize_prompt(trimmed));

    let task = Task::create(
        pool,
        CreateTask {
            parent_id: request.parent_task_id.clone(),
            name,
            description: request.task_description.clone().unwrap_or_default(),
            prompt: request.prompt.clone(),
            work_directory: request.work_folder.clone(),
            execution_mode,
            return_mode,
            metadata: json!({ "mode": request.mode }),
            timeout_ms: request
                .timeout
                .unwrap_or(state.config.execution_timeout_ms as i64),
            ..Default::default()
        },
    )
    .await
    .map_err(to_internal)?;

    tracing::info!(task_id = %task.id, "Created task");
    Ok(task.id)
}

/// First line of the prompt, bounded, as a display name.
fn summarize_prompt(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or("task");
    let mut name: String = first_line.chars().take(80).collect();
    if name.is_empty() {
        name = "task".into();
    }
    name
}

fn spawn_log_forwarder(
    state: &AppState,
    root_id: String,
    events: EventSink,
) -> tokio::task::JoinHandle<()> {
    let mut rx = state.bus.subscribe();
    tokio::spawn(async move {
        let sub_prefix = format!("{}-sub-", root_id);
        while let Ok(log) = rx.recv().await {
            if log.task_id != root_id && !log.task_id.starts_with(&sub_prefix) {
                continue;
            }
            let payload = match serde_json::to_value(&log) {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            if events
                .send(json!({ "event": "task_log", "payload": payload }))
                .is_err()
            {
                break;
            }
        }
    })
}

fn to_internal(err: sqlx::Error) -> ErrorBody {
    ErrorBody::from(TaskmillError::from(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        let valid: ClaudeCodeRequest = serde_json::from_value(json!({
            "prompt": "What is 2+2?",
            "workFolder": "/tmp",
            "timeout": 5000
        }))
        .unwrap();
        assert!(valid.validate().is_ok());

        let empty_prompt: ClaudeCodeRequest = serde_json::from_value(json!({
            "prompt": "",
            "workFolder": "/tmp"
        }))
        .unwrap();
        assert!(empty_prompt.validate().is_err());

        // A zero timeout is rejected before anything is persisted.
        let zero_timeout: ClaudeCodeRequest = serde_json::from_value(json!({
            "prompt": "x",
            "workFolder": "/tmp",
            "timeout": 0
        }))
        .unwrap();
        assert!(zero_timeout.validate().is_err());
    }

    #[test]
    fn test_summarize_prompt_bounds() {
        assert_eq!(summarize_prompt("short ask"), "short ask");

        let long = "a".repeat(200);
        assert_eq!(summarize_prompt(&long).len(), 80);

        assert_eq!(summarize_prompt(""), "task");
    }
}
