use serde::{Deserialize, Serialize};

use crate::pipeline::incremental::fingerprint;
use crate::pipeline::schema::{ColumnType, TableSchema};

/// Base table holding ingested documents.
pub const DOCUMENTS_TABLE: &str = "documents";

#[must_use]
pub fn document_schema() -> TableSchema {
    TableSchema::new()
        .column("document_id", ColumnType::Text)
        .nullable("title", ColumnType::Text)
        .column("content", ColumnType::Text)
        .column("content_hash", ColumnType::Text)
        .nullable("indexed_with_hash", ColumnType::Text)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    pub content_hash: String,
    /// Fingerprint of the content last processed to completion.
    #[serde(default)]
    pub indexed_with_hash: Option<String>,
}

impl Document {
    #[must_use]
    pub fn new(document_id: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            document_id: document_id.into(),
            title: None,
            content_hash: fingerprint(&content),
            content,
            indexed_with_hash: None,
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub document_id: String,
    pub section_id: String,
    pub ordinal: i64,
    pub text: String,
    pub text_hash: String,
    pub start_offset: i64,
    pub end_offset: i64,
}

/// Splits content into paragraph-aligned sections of at most `max_chars` bytes.
///
/// Blank lines separate paragraphs, with or without a carriage return.
/// Neighbouring paragraphs are grouped while they fit; a single paragraph
/// longer than `max_chars` is cut at the last whitespace inside the limit, or
/// at the limit itself when there is none. Offsets are byte offsets into
/// `content`.
#[must_use]
pub fn split_sections(document_id: &str, content: &str, max_chars: usize) -> Vec<Section> {
    let max_chars = max_chars.max(1);

    let mut paragraphs: Vec<(usize, usize)> = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        if line.trim().is_empty() {
            paragraphs.extend(current.take());
        } else {
            let start = offset + (line.len() - line.trim_start().len());
            let end = offset + line.trim_end().len();
            current = Some(current.map_or((start, end), |(first, _)| (first, end)));
        }
        offset += line.len();
    }
    paragraphs.extend(current);

    let mut pieces = Vec::with_capacity(paragraphs.len());
    for paragraph in paragraphs {
        cut_paragraph(content, paragraph, max_chars, &mut pieces);
    }

    let mut spans: Vec<(usize, usize)> = Vec::new();
    for (start, end) in pieces {
        match spans.last_mut() {
            Some(span) if end - span.0 <= max_chars => span.1 = end,
            _ => spans.push((start, end)),
        }
    }

    spans
        .into_iter()
        .enumerate()
        .map(|(ordinal, (start, end))| {
            let text = content[start..end].to_string();
            Section {
                document_id: document_id.to_string(),
                section_id: format!("s{ordinal:04}"),
                ordinal: i64::try_from(ordinal).unwrap_or(i64::MAX),
                text_hash: fingerprint(&text),
                text,
                start_offset: i64::try_from(start).unwrap_or(i64::MAX),
                end_offset: i64::try_from(end).unwrap_or(i64::MAX),
            }
        })
        .collect()
}

/// Pushes `(start, end)` as pieces of at most `max_chars` bytes, each trimmed.
fn cut_paragraph(content: &str, (mut start, end): (usize, usize), max_chars: usize, out: &mut Vec<(usize, usize)>) {
    while end - start > max_chars {
        let mut limit = start + max_chars;
        while !content.is_char_boundary(limit) {
            limit -= 1;
        }

        let cut = match content[start..limit].rfind(char::is_whitespace) {
            Some(pos) if pos > 0 => start + pos,
            _ if limit > start => limit,
            // A single character wider than the limit.
            _ => start + content[start..].chars().next().map_or(1, char::len_utf8),
        };
        out.push((start, start + content[start..cut].trim_end().len()));
        start = end - content[cut..end].trim_start().len();
    }
    if end > start {
        out.push((start, end));
    }
}
