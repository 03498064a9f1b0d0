/// `convert_task_markdown` tool
///
/// Parses a markdown task document into the typed graph. With an
/// `outputPath` the graph JSON is written there; without one it is
/// returned inline. Either way the response carries a summary.
///
/// # Request
///
/// ```json
/// { "markdownPath": "/work/task.md", "outputPath": "/work/task.json" }
/// ```
///
/// # Response
///
/// ```json
/// { "rootId": "025", "subtaskCount": 4, "outputPath": "/work/task.json" }
/// ```

use crate::app::AppState;
use crate::error::ErrorBody;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use taskmill_engine::parser::parse_task_markdown;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct ConvertRequest {
    /// Path of the markdown document to parse
    #[validate(length(min = 1))]
    markdown_path: String,

    /// Where to write the graph JSON; inline response when omitted
    output_path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConvertResponse {
    root_id: String,
    subtask_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    graph: Option<JsonValue>,
}

pub async fn handle(_state: &AppState, arguments: JsonValue) -> Result<JsonValue, ErrorBody> {
    let request: ConvertRequest = serde_json::from_value(arguments)
        .map_err(|e| ErrorBody::new("invalid-input", format!("bad arguments: {}", e)))?;
    request.validate()?;

    let markdown = tokio::fs::read_to_string(&request.markdown_path)
        .await
        .map_err(|e| {
            ErrorBody::new(
                "invalid-input",
                format!("cannot read '{}': {}", request.markdown_path, e),
            )
        })?;

    let graph = parse_task_markdown(&markdown).map_err(ErrorBody::from)?;
    let graph_json = serde_json::to_value(&graph)
        .map_err(|e| ErrorBody::new("internal", format!("failed to encode graph: {}", e)))?;

    let inline = match &request.output_path {
        Some(path) => {
            let pretty = serde_json::to_string_pretty(&graph_json)
                .map_err(|e| ErrorBody::new("internal", format!("failed to encode graph: {}", e)))?;
            tokio::fs::write(path, pretty).await.map_err(|e| {
                ErrorBody::new("invalid-input", format!("cannot write '{}': {}", path, e))
            })?;
            tracing::info!(
                markdown_path = %request.markdown_path,
                output_path = %path,
                "Converted task markdown"
            );
            None
        }
        None => Some(graph_json),
    };

    let response = ConvertResponse {
        root_id: graph.root.id.clone(),
        subtask_count: graph.subtasks.len(),
        output_path: request.output_path,
        graph: inline,
    };

    serde_json::to_value(&response)
        .map_err(|e| ErrorBody::new("internal", format!("failed to encode response: {}", e)))
}
