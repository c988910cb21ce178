//! The uniform tool result envelope.
//!
//! Every tool returns `{ success, data, errors, warnings, metadata }` as
//! plain JSON, even when a handler fails internally. The dispatcher is the
//! only place that converts an [`Error`](crate::Error) into an envelope, so
//! handlers can use `?` freely and never worry about leaking a panic or a
//! raw exception dump across the tool boundary.

use crate::Error;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Result envelope returned by every tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    /// Whether the operation succeeded. Bulk operations with any failed
    /// items report `false` with partial results in `data`.
    pub success: bool,

    /// Tool-specific payload; `null` on failure unless partial results exist.
    pub data: Option<Value>,

    /// Human-readable error strings, empty on success.
    pub errors: Vec<String>,

    /// Non-fatal notices (per-item fetch failures, destructive-op banners).
    pub warnings: Vec<String>,

    /// Source tool name plus any extra keys a tool attaches.
    pub metadata: ResultMetadata,
}

/// Envelope metadata. `source` is always the tool name; everything else is
/// optional and tool-specific.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub source: String,

    #[serde(rename = "errorKind", skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,

    #[serde(rename = "durationMs", skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(rename = "apiCalls", skip_serializing_if = "Option::is_none")]
    pub api_calls: Option<u64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResultMetadata {
    pub fn for_source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            error_kind: None,
            duration_ms: None,
            api_calls: None,
            extra: Map::new(),
        }
    }
}

impl ToolExecutionResult {
    /// Successful result with a data payload.
    pub fn success(source: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            errors: Vec::new(),
            warnings: Vec::new(),
            metadata: ResultMetadata::for_source(source),
        }
    }

    /// Failed result with one or more error strings.
    pub fn failure(source: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            success: false,
            data: None,
            errors,
            warnings: Vec::new(),
            metadata: ResultMetadata::for_source(source),
        }
    }

    /// Convert an [`Error`] into a failure envelope, preserving the error
    /// kind in metadata so clients can branch on it.
    pub fn from_error(source: impl Into<String>, err: &Error) -> Self {
        let mut result = Self::failure(source, vec![err.to_string()]);
        result.metadata.error_kind = Some(err.kind().to_string());
        result
    }

    /// Attach a warning, preserving success status.
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Attach several warnings at once.
    pub fn with_warnings(mut self, warnings: impl IntoIterator<Item = String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    /// Replace the data payload (used for partial-failure results that carry
    /// both errors and per-item outcomes).
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Add an extra metadata key.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.extra.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_envelope_shape() {
        let result = ToolExecutionResult::success("query-wiql", json!({"count": 3}));
        let wire = serde_json::to_value(&result).unwrap();

        assert_eq!(wire["success"], true);
        assert_eq!(wire["data"]["count"], 3);
        assert_eq!(wire["errors"], json!([]));
        assert_eq!(wire["warnings"], json!([]));
        assert_eq!(wire["metadata"]["source"], "query-wiql");
    }

    #[test]
    fn test_failure_envelope_from_error() {
        let err = Error::handle_not_found("qh_0123");
        let result = ToolExecutionResult::from_error("execute-bulk-operations", &err);

        assert!(!result.success);
        assert!(result.data.is_none());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(
            result.metadata.error_kind.as_deref(),
            Some("HandleNotFoundOrExpired")
        );
    }

    #[test]
    fn test_warning_preserves_success() {
        let result = ToolExecutionResult::success("execute-bulk-operations", json!({}))
            .with_warning("destructive operation executed without dry run");

        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_partial_failure_carries_data() {
        let result = ToolExecutionResult::failure(
            "execute-bulk-operations",
            vec!["item 20: 404".to_string()],
        )
        .with_data(json!({"successful": 2, "failed": 1}));

        assert!(!result.success);
        assert_eq!(result.data.unwrap()["successful"], 2);
    }

    #[test]
    fn test_metadata_extra_keys_flatten() {
        let result = ToolExecutionResult::success("query-wiql", json!(null))
            .with_metadata("queryType", json!("flat"));
        let wire = serde_json::to_value(&result).unwrap();
        assert_eq!(wire["metadata"]["queryType"], "flat");
    }

    #[test]
    fn test_envelope_round_trip() {
        let result = ToolExecutionResult::failure("inspect-query-handle", vec!["gone".into()]);
        let text = serde_json::to_string(&result).unwrap();
        let back: ToolExecutionResult = serde_json::from_str(&text).unwrap();
        assert!(!back.success);
        assert_eq!(back.metadata.source, "inspect-query-handle");
    }
}
