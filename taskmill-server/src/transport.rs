/// Line-delimited JSON transport over stdio
///
/// One JSON object per line. Requests are `{ name, arguments }`;
/// responses are `{ result }` or `{ error: { code, message, data? } }`;
/// unsolicited `{ event: "task_log", payload }` frames may appear while
/// a long-running call is pending. stdout carries frames only; all
/// logging goes to stderr.
///
/// Requests are handled concurrently (each in its own task), so a
/// `health` call answers while a `claude_code` call is still driving a
/// graph. A single writer task serializes every outgoing frame.

use crate::app::AppState;
use crate::error::ErrorBody;
use crate::tools::{dispatch, ToolRequest};
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Serves requests from stdin until EOF, then drains in-flight calls.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    let (tx, rx) = mpsc::unbounded_channel::<JsonValue>();
    let writer = spawn_writer(rx);

    let mut inflight: JoinSet<()> = JoinSet::new();

    info!("Transport ready, reading requests from stdin");
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let state = state.clone();
        let tx = tx.clone();
        inflight.spawn(async move {
            let frame = handle_line(&state, &line, tx.clone()).await;
            let _ = tx.send(frame);
        });
    }

    debug!("stdin closed, draining in-flight requests");
    while inflight.join_next().await.is_some() {}

    drop(tx);
    let _ = writer.await;
    info!("Transport shut down");
    Ok(())
}

/// Decodes one request line and runs it to a response frame.
pub async fn handle_line(
    state: &AppState,
    line: &str,
    events: mpsc::UnboundedSender<JsonValue>,
) -> JsonValue {
    let request: ToolRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return json!({
                "error": ErrorBody::new("invalid-input", format!("bad request frame: {}", e))
            });
        }
    };

    match dispatch(state, request, events).await {
        Ok(result) => json!({ "result": result }),
        Err(error) => json!({ "error": error }),
    }
}

fn spawn_writer(mut rx: mpsc::UnboundedReceiver<JsonValue>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = rx.recv().await {
            let mut line = frame.to_string();
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    })
}
