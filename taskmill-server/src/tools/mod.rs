/// Tool surface
///
/// Three operations are exposed to the transport:
///
/// - `health`: server status, configuration echo and pool statistics
/// - `convert_task_markdown`: parse a markdown task file into graph JSON
/// - `claude_code`: run a prompt (or resume a persisted graph) through
///   the scheduler and return the terminal result
///
/// Handlers are plain async functions over [`AppState`]; the transport
/// owns framing and concurrency.

pub mod claude_code;
pub mod convert_task_markdown;
pub mod health;

use crate::app::AppState;
use crate::error::ErrorBody;
use serde::Deserialize;
use serde_json::Value as JsonValue;

/// Sink for unsolicited frames (`task_log` events) emitted while a call
/// is pending.
pub type EventSink = tokio::sync::mpsc::UnboundedSender<JsonValue>;

/// A decoded transport request.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    /// Tool name
    pub name: String,

    /// Tool arguments (tool-specific shape)
    #[serde(default)]
    pub arguments: JsonValue,
}

/// Routes one request to its handler.
pub async fn dispatch(
    state: &AppState,
    request: ToolRequest,
    events: EventSink,
) -> Result<JsonValue, ErrorBody> {
    tracing::debug!(tool = %request.name, "Dispatching tool request");

    match request.name.as_str() {
        "health" => health::handle(state).await,
        "convert_task_markdown" => convert_task_markdown::handle(state, request.arguments).await,
        "claude_code" => claude_code::handle(state, request.arguments, events).await,
        other => Err(ErrorBody::new(
            "unknown-tool",
            format!("unknown tool: {}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_request_decoding() {
        let request: ToolRequest =
            serde_json::from_str(r#"{"name": "health", "arguments": {}}"#).unwrap();
        assert_eq!(request.name, "health");

        // Arguments are optional on the wire.
        let request: ToolRequest = serde_json::from_str(r#"{"name": "health"}"#).unwrap();
        assert!(request.arguments.is_null());
    }
}
