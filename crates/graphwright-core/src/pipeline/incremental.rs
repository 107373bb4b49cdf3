use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::context::IncrementalMode;
use super::schema::Row;
use crate::document::Document;
use crate::storage::{Storage, TableQuery};
use crate::Result;

/// Stable content hash: CRLF folded to LF, trailing whitespace dropped per line.
#[must_use]
pub fn fingerprint(content: &str) -> String {
    let normalized = content
        .replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    hex::encode(Sha256::digest(normalized.trim().as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ContentUnchanged,
}

impl SkipReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ContentUnchanged => "content_unchanged",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentDecision {
    Skip {
        document_id: String,
        reason: SkipReason,
    },
    Process {
        document: Document,
        fingerprint: String,
    },
}

impl DocumentDecision {
    #[must_use]
    pub fn document_id(&self) -> &str {
        match self {
            Self::Skip { document_id, .. } => document_id,
            Self::Process { document, .. } => &document.document_id,
        }
    }

    #[must_use]
    pub const fn is_skip(&self) -> bool {
        matches!(self, Self::Skip { .. })
    }
}

/// Decides per document whether a run has work to do.
#[derive(Debug, Clone, Copy)]
pub struct IncrementalTracker {
    mode: IncrementalMode,
}

impl IncrementalTracker {
    #[must_use]
    pub const fn new(mode: IncrementalMode) -> Self {
        Self { mode }
    }

    #[must_use]
    pub const fn mode(&self) -> IncrementalMode {
        self.mode
    }

    /// Full mode always processes. Delta mode skips a document whose current
    /// fingerprint matches the one recorded when it was last indexed.
    #[must_use]
    pub fn decide(&self, document: Document) -> DocumentDecision {
        let fingerprint = fingerprint(&document.content);
        let unchanged = document.indexed_with_hash.as_deref() == Some(fingerprint.as_str());

        if self.mode == IncrementalMode::Delta && unchanged {
            tracing::debug!(document_id = %document.document_id, "Skipping unchanged document");
            return DocumentDecision::Skip {
                document_id: document.document_id,
                reason: SkipReason::ContentUnchanged,
            };
        }

        DocumentDecision::Process {
            document,
            fingerprint,
        }
    }

    /// Splits documents into those to process and the ids that were skipped.
    #[must_use]
    pub fn partition(&self, documents: Vec<Document>) -> (Vec<(Document, String)>, Vec<String>) {
        let mut process = Vec::new();
        let mut skipped = Vec::new();
        for document in documents {
            match self.decide(document) {
                DocumentDecision::Process {
                    document,
                    fingerprint,
                } => process.push((document, fingerprint)),
                DocumentDecision::Skip { document_id, .. } => skipped.push(document_id),
            }
        }
        (process, skipped)
    }
}

/// Rows written for `document_id` by the most recent run other than
/// `exclude_workflow`, in write order.
///
/// A table that has never been written reads as empty; store failures propagate.
pub async fn previous_state(
    storage: &Storage,
    table: &str,
    document_id: &str,
    exclude_workflow: &str,
) -> Result<Vec<Row>> {
    let query = TableQuery::new(table).filter_eq("document_id", document_id);
    let rows: Vec<Row> = storage
        .query_rows(&query)
        .await?
        .into_iter()
        .filter(|row| row_workflow(row) != Some(exclude_workflow))
        .collect();

    let Some(latest) = rows.last().map(|row| row_workflow(row).map(ToString::to_string)) else {
        return Ok(Vec::new());
    };

    Ok(rows
        .into_iter()
        .filter(|row| row_workflow(row).map(ToString::to_string) == latest)
        .collect())
}

fn row_workflow(row: &Row) -> Option<&str> {
    row.get("workflow_id").and_then(Value::as_str)
}
