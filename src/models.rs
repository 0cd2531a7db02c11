//! Core data models.
//!
//! These types flow between the document store, the retrieval engine, the
//! chat orchestrator and the HTTP layer. A [`Document`]'s `id` is the only
//! key shared with the vector index.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Author value surfaced when a document has no known author.
pub const UNKNOWN_AUTHOR: &str = "Unknown";

/// Closed set of document kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Book,
    Article,
    Manuscript,
    Thesis,
    #[default]
    Unknown,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Book => "book",
            DocumentType::Article => "article",
            DocumentType::Manuscript => "manuscript",
            DocumentType::Thesis => "thesis",
            DocumentType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "book" => Ok(DocumentType::Book),
            "article" => Ok(DocumentType::Article),
            "manuscript" => Ok(DocumentType::Manuscript),
            "thesis" => Ok(DocumentType::Thesis),
            "unknown" | "" => Ok(DocumentType::Unknown),
            other => Err(format!(
                "unknown document type '{}': expected book, article, manuscript, thesis, or unknown",
                other
            )),
        }
    }
}

/// A stored document. `content_preview` and `content_hash` are derived from
/// `content` by the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: i64,
    pub title: String,
    pub author: String,
    pub year: Option<i32>,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    pub tags: Vec<String>,
    pub source_file: String,
    pub page_number: Option<i64>,
    pub content: String,
    pub content_preview: String,
    pub content_hash: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Document {
    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id,
            title: self.title.clone(),
            author: self.author.clone(),
            year: self.year,
            doc_type: self.doc_type,
            tags: self.tags.clone(),
            source_file: self.source_file.clone(),
            page_number: self.page_number,
            content_preview: self.content_preview.clone(),
        }
    }

    pub fn has_known_author(&self) -> bool {
        self.author != UNKNOWN_AUTHOR
    }

    /// One-line citation: `Title (year) by Author`.
    pub fn heading(&self) -> String {
        let mut heading = self.title.clone();
        if let Some(year) = self.year {
            heading.push_str(&format!(" ({})", year));
        }
        if self.has_known_author() {
            heading.push_str(&format!(" by {}", self.author));
        }
        heading
    }
}

/// A document without its full content, as returned by listings and search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentSummary {
    pub id: i64,
    pub title: String,
    pub author: String,
    pub year: Option<i32>,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    pub tags: Vec<String>,
    pub source_file: String,
    pub page_number: Option<i64>,
    pub content_preview: String,
}

/// Ingestion input. The store assigns `id` and derives preview and hash.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewDocument {
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default, rename = "type")]
    pub doc_type: DocumentType,
    #[serde(default)]
    pub tags: Vec<String>,
    pub source_file: String,
    #[serde(default)]
    pub page_number: Option<i64>,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertStatus {
    Inserted,
    Unchanged,
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub id: i64,
    pub status: UpsertStatus,
    /// Retired id when changed content replaced an older row.
    pub previous_id: Option<i64>,
}

/// Metadata filters shared by listing, lexical search and retrieval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentFilter {
    pub doc_type: Option<DocumentType>,
    pub year: Option<i32>,
}

impl DocumentFilter {
    pub fn matches(&self, doc: &Document) -> bool {
        self.doc_type.map_or(true, |t| doc.doc_type == t) && self.year.map_or(true, |y| doc.year == Some(y))
    }
}

/// Which retrieval paths a query may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Vector search, falling back to lexical when it yields nothing.
    #[default]
    Semantic,
    /// Vector search with lexical hits appended.
    Hybrid,
    Lexical,
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            "lexical" | "keyword" => Ok(SearchMode::Lexical),
            other => Err(format!(
                "Unknown search mode: {}. Use semantic, hybrid, or lexical.",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Query {
    pub text: String,
    pub filter: DocumentFilter,
    /// Result cap; the retriever's default applies when absent.
    pub k: Option<usize>,
    pub mode: SearchMode,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_filter(mut self, filter: DocumentFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// One ranked hit. `similarity` is absent for lexical hits.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub document_id: i64,
    pub rank: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_offset: Option<usize>,
    pub document: DocumentSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Attribution entry sent after an answer completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub document_id: i64,
    pub title: String,
    pub author: String,
    pub year: Option<i32>,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
}

impl From<&RetrievalResult> for SourceRef {
    fn from(result: &RetrievalResult) -> Self {
        SourceRef {
            document_id: result.document_id,
            title: result.document.title.clone(),
            author: result.document.author.clone(),
            year: result.document.year,
            doc_type: result.document.doc_type,
            similarity: result.similarity,
        }
    }
}

/// Bounded prefix of `content`, cut on a char boundary, with an ellipsis
/// when truncated.
pub fn content_preview(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &content[..byte_idx]),
        None => content.to_string(),
    }
}
