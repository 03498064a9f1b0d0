/// Integration tests for the transport surface
///
/// Requests enter through `handle_line`, exactly as the stdio loop
/// delivers them; the engine runs with the deterministic mock runner.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};
use taskmill_engine::runner::MockRunner;
use taskmill_server::app::AppState;
use taskmill_server::config::Config;
use taskmill_server::transport::handle_line;
use taskmill_shared::db::store::Store;
use taskmill_shared::models::task::{Task, TaskStatus};
use tempfile::TempDir;
use tokio::sync::mpsc;

fn test_config(dir: &TempDir) -> Config {
    Config {
        debug: false,
        heartbeat_interval_ms: 200,
        execution_timeout_ms: 30_000,
        max_retries: 2,
        retry_delay_ms: 20,
        db_path: dir.path().join("server_test.db"),
        min_connections: 1,
        max_connections: 4,
        connection_timeout_ms: 5_000,
        busy_timeout_ms: 2_000,
        schema_version: 1,
        cli_command: "claude".into(),
        max_instances: 4,
        use_roomodes: false,
        watch_roomodes: false,
    }
}

async fn test_state(dir: &TempDir) -> AppState {
    let config = test_config(dir);
    let store = Store::open(config.database_config(), config.schema_version)
        .await
        .expect("store open");
    AppState::with_runner(store, config, Arc::new(MockRunner::new()))
}

async fn call(state: &AppState, line: &str) -> (JsonValue, Vec<JsonValue>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let response = handle_line(state, line, tx).await;

    let mut events = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        events.push(frame);
    }
    (response, events)
}

#[tokio::test]
async fn test_health_shape() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let (response, _) = call(&state, r#"{"name": "health"}"#).await;
    let result = &response["result"];

    assert_eq!(result["status"], "ok");
    assert!(result["version"].is_string());
    assert!(result["uptimeMs"].is_u64());
    assert_eq!(result["config"]["heartbeatIntervalMs"], 200);
    assert_eq!(result["config"]["executionTimeoutMs"], 30_000);
    assert_eq!(result["config"]["maxRetries"], 2);
    assert_eq!(result["config"]["retryDelayMs"], 20);
    assert!(result["pool"]["size"].is_u64());
    assert!(result["pool"]["idle"].is_u64());
    assert!(result["pool"]["busy"].is_u64());
}

#[tokio::test]
async fn test_unknown_tool() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let (response, _) = call(&state, r#"{"name": "frobnicate", "arguments": {}}"#).await;
    assert_eq!(response["error"]["code"], "unknown-tool");
}

#[tokio::test]
async fn test_malformed_frame() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let (response, _) = call(&state, "this is not json").await;
    assert_eq!(response["error"]["code"], "invalid-input");
}

#[tokio::test]
async fn test_convert_task_markdown_inline() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let md_path = dir.path().join("task.md");
    tokio::fs::write(
        &md_path,
        r#"# Task 7: Example

**Objective**: Do the example.

## Requirements

- [ ] It is done

### Task 1: Only step

- do it
"#,
    )
    .await
    .unwrap();

    let line = json!({
        "name": "convert_task_markdown",
        "arguments": { "markdownPath": md_path }
    })
    .to_string();
    let (response, _) = call(&state, &line).await;

    let result = &response["result"];
    assert_eq!(result["rootId"], "7");
    assert_eq!(result["subtaskCount"], 1);
    assert_eq!(result["graph"]["root"]["name"], "Example");
}

#[tokio::test]
async fn test_convert_task_markdown_to_file() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let md_path = dir.path().join("task.md");
    let out_path = dir.path().join("graph.json");
    tokio::fs::write(
        &md_path,
        r#"# Task 8: File output

**Objective**: Write the graph.

## Requirements

- [ ] Output file exists

### Task 1: A

- a

### Task 2: B

- **Dependencies**: Task 1
- b
"#,
    )
    .await
    .unwrap();

    let line = json!({
        "name": "convert_task_markdown",
        "arguments": { "markdownPath": md_path, "outputPath": out_path }
    })
    .to_string();
    let (response, _) = call(&state, &line).await;

    assert_eq!(response["result"]["subtaskCount"], 2);
    assert!(
        response["result"].get("graph").is_none(),
        "graph goes to the file, not inline"
    );

    let written = tokio::fs::read_to_string(&out_path).await.unwrap();
    let graph: JsonValue = serde_json::from_str(&written).unwrap();
    assert_eq!(graph["root"]["id"], "8");
    assert_eq!(graph["subtasks"][1]["dependencies"][0], "8-sub-1");
}

#[tokio::test]
async fn test_convert_task_markdown_malformed() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let md_path = dir.path().join("bad.md");
    tokio::fs::write(&md_path, "no title here\n").await.unwrap();

    let line = json!({
        "name": "convert_task_markdown",
        "arguments": { "markdownPath": md_path }
    })
    .to_string();
    let (response, _) = call(&state, &line).await;
    assert_eq!(response["error"]["code"], "invalid-input");
}

#[tokio::test]
async fn test_convert_task_markdown_missing_file() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let line = json!({
        "name": "convert_task_markdown",
        "arguments": { "markdownPath": dir.path().join("absent.md") }
    })
    .to_string();
    let (response, _) = call(&state, &line).await;
    assert_eq!(response["error"]["code"], "invalid-input");
}

#[tokio::test]
async fn test_claude_code_single_prompt() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let line = json!({
        "name": "claude_code",
        "arguments": {
            "prompt": "[output:4] What is 2+2?",
            "workFolder": "/tmp",
            "timeout": 5000
        }
    })
    .to_string();
    let (response, events) = call(&state, &line).await;

    let result = &response["result"];
    assert_eq!(result["status"], "success");
    assert_eq!(result["output"], "4");
    assert!(result["executionTimeMs"].is_i64() || result["executionTimeMs"].is_u64());

    let task_id = result["taskId"].as_str().unwrap();
    let task = Task::find_by_id(state.store.pool(), task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    // Progress streamed as task_log frames while the call was pending.
    assert!(
        events.iter().any(|e| e["event"] == "task_log"),
        "expected at least one task_log event frame"
    );
    assert!(events
        .iter()
        .all(|e| e["payload"]["task_id"].as_str().unwrap().starts_with(task_id)));
}

#[tokio::test]
async fn test_claude_code_zero_timeout_rejected() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let line = json!({
        "name": "claude_code",
        "arguments": { "prompt": "x", "workFolder": "/tmp", "timeout": 0 }
    })
    .to_string();
    let (response, _) = call(&state, &line).await;
    assert_eq!(response["error"]["code"], "invalid-input");
}

#[tokio::test]
async fn test_claude_code_markdown_prompt_runs_graph() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let doc = r#"# Task wired: Inline graph

**Objective**: Run a two-node graph from the prompt.

## Requirements

- [ ] Both nodes run

### Task 1: First

- [output:one] first

### Task 2: Second

- **Dependencies**: Task 1
- [output:two] second
"#;
    let line = json!({
        "name": "claude_code",
        "arguments": { "prompt": doc, "workFolder": "/tmp" }
    })
    .to_string();
    let (response, _) = call(&state, &line).await;

    let result = &response["result"];
    assert_eq!(result["taskId"], "wired");
    assert_eq!(result["status"], "success");
    assert!(result["output"].as_str().unwrap().contains("one"));
    assert!(result["output"].as_str().unwrap().contains("two"));

    let sub = Task::find_by_id(state.store.pool(), "wired-sub-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sub.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_claude_code_summary_mode_passes_short_output_through() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let line = json!({
        "name": "claude_code",
        "arguments": {
            "prompt": "[output:short answer] question",
            "workFolder": "/tmp",
            "returnMode": "summary"
        }
    })
    .to_string();
    let (response, _) = call(&state, &line).await;
    assert_eq!(response["result"]["output"], "short answer");
}

#[tokio::test]
async fn test_claude_code_summary_mode_truncates_on_char_boundary() {
    use taskmill_engine::scheduler::SUMMARY_MAX_BYTES;

    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    // A two-byte character straddles the byte limit exactly; the bound
    // must land on a character boundary, not panic mid-character.
    let mut payload = "a".repeat(SUMMARY_MAX_BYTES - 1);
    payload.push('é');
    payload.push_str("-overflow-tail");

    let line = json!({
        "name": "claude_code",
        "arguments": {
            "prompt": format!("[output:{}] question", payload),
            "workFolder": "/tmp",
            "returnMode": "summary"
        }
    })
    .to_string();
    let (response, _) = call(&state, &line).await;

    let output = response["result"]["output"].as_str().unwrap();
    assert_eq!(output.len(), SUMMARY_MAX_BYTES - 1);
    assert!(output.chars().all(|c| c == 'a'));
    assert_eq!(response["result"]["status"], "success");
}

#[tokio::test]
async fn test_claude_code_missing_parent_is_not_found() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let line = json!({
        "name": "claude_code",
        "arguments": {
            "prompt": "do something",
            "workFolder": "/tmp",
            "parentTaskId": "no-such-parent"
        }
    })
    .to_string();
    let (response, _) = call(&state, &line).await;
    assert_eq!(response["error"]["code"], "not-found");
}
