use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrementalMode {
    /// Process every document in scope.
    #[default]
    Full,
    /// Skip documents whose content is unchanged since they were last indexed.
    Delta,
}

impl IncrementalMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Delta => "delta",
        }
    }
}

impl std::fmt::Display for IncrementalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IncrementalMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "delta" => Ok(Self::Delta),
            _ => Err(Error::InvalidIncrementalMode(s.to_string())),
        }
    }
}

/// Read-only context shared by every stage in one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    pub workflow_id: String,
    /// `None` means every document.
    pub document_ids: Option<Vec<String>>,
    pub incremental_mode: IncrementalMode,
    #[serde(default)]
    pub metadata: Value,
}

impl PipelineContext {
    #[must_use]
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            document_ids: None,
            incremental_mode: IncrementalMode::Full,
            metadata: Value::Null,
        }
    }

    /// A context with a freshly generated, time-ordered workflow id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7().to_string())
    }

    #[must_use]
    pub fn with_documents<I, S>(mut self, document_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.document_ids = Some(document_ids.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_document_scope(mut self, document_ids: Option<Vec<String>>) -> Self {
        self.document_ids = document_ids;
        self
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: IncrementalMode) -> Self {
        self.incremental_mode = mode;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Values supplied under `metadata.config.<stage>`.
    #[must_use]
    pub fn stage_config(&self, stage: &str) -> Option<&Value> {
        self.metadata.get("config").and_then(|c| c.get(stage))
    }

    #[must_use]
    pub fn in_scope(&self, document_id: &str) -> bool {
        self.document_ids
            .as_ref()
            .is_none_or(|ids| ids.iter().any(|id| id == document_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_and_stage_config() {
        let ctx = PipelineContext::new("w1")
            .with_documents(["a", "b"])
            .with_metadata(json!({"config": {"sections": {"max_chars": 10}}}));
        assert!(ctx.in_scope("a"));
        assert!(!ctx.in_scope("c"));
        assert_eq!(ctx.stage_config("sections"), Some(&json!({"max_chars": 10})));
        assert!(ctx.stage_config("extractions").is_none());

        assert!(PipelineContext::new("w2").in_scope("anything"));
        assert_eq!("delta".parse::<IncrementalMode>().unwrap(), IncrementalMode::Delta);
    }
}
