/// Error handling for the transport surface
///
/// Every tool failure is serialized as `{ "error": { code, message,
/// data? } }` on the wire. Codes come from the engine's typed error
/// kinds; nothing reaches the client as an untyped string.
///
/// # Codes
///
/// `invalid-input`, `unknown-tool`, `not-found`, `already-running`,
/// `invalid-graph`, `acquire-timeout`, `spawn-failed`, `child-timeout`,
/// `internal`.

use serde::{Deserialize, Serialize};
use taskmill_shared::error::TaskmillError;

/// Wire form of a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code
    pub code: String,

    /// Human-readable message
    pub message: String,

    /// Optional structured detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorBody {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<&TaskmillError> for ErrorBody {
    fn from(err: &TaskmillError) -> Self {
        let body = ErrorBody::new(err.code(), err.to_string());
        match err {
            // Internal details stay in the server log.
            TaskmillError::Database(inner) => {
                tracing::error!(error = %inner, "Store error surfaced to transport");
                ErrorBody::new("internal", "an internal error occurred")
            }
            TaskmillError::Internal(inner) => {
                tracing::error!(error = %inner, "Internal error surfaced to transport");
                ErrorBody::new("internal", "an internal error occurred")
            }
            _ => body,
        }
    }
}

impl From<TaskmillError> for ErrorBody {
    fn from(err: TaskmillError) -> Self {
        ErrorBody::from(&err)
    }
}

impl From<validator::ValidationErrors> for ErrorBody {
    fn from(errors: validator::ValidationErrors) -> Self {
        let details: Vec<serde_json::Value> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| {
                    serde_json::json!({
                        "field": field,
                        "code": e.code,
                    })
                })
            })
            .collect();

        ErrorBody::new("invalid-input", "request validation failed")
            .with_data(serde_json::json!({ "fields": details }))
    }
}
