//! Document store abstraction.
//!
//! The store is the source of truth for document metadata and content. The
//! vector index only holds weak references (`document_id`) into it, so every
//! read path here must tolerate ids that have since disappeared.
//!
//! [`sqlite::SqliteDocumentStore`] is the production implementation.

pub mod sqlite;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::StoreError;
use crate::models::{Document, DocumentFilter, DocumentType, NewDocument, UpsertOutcome};

pub use sqlite::SqliteDocumentStore;

/// A page of documents plus the size of the whole filtered set.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub documents: Vec<Document>,
    pub total: i64,
}

/// Fields with a browsable vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VocabularyField {
    Type,
    Year,
    Author,
}

impl FromStr for VocabularyField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "type" | "types" => Ok(VocabularyField::Type),
            "year" | "years" => Ok(VocabularyField::Year),
            "author" | "authors" => Ok(VocabularyField::Author),
            other => Err(format!(
                "unknown field '{}': expected types, years, or authors",
                other
            )),
        }
    }
}

/// Distinct values of one field. Types exclude `unknown`; years exclude
/// unknown years and are newest first; authors keep `"Unknown"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Vocabulary {
    Types(Vec<DocumentType>),
    Years(Vec<i32>),
    Authors(Vec<String>),
}

impl Vocabulary {
    pub fn len(&self) -> usize {
        match self {
            Vocabulary::Types(v) => v.len(),
            Vocabulary::Years(v) => v.len(),
            Vocabulary::Authors(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Document, StoreError>;

    /// Fetch many documents at once. Missing ids are simply absent from the map.
    async fn get_many(&self, ids: &[i64]) -> Result<HashMap<i64, Document>, StoreError>;

    /// Ordered by `id` ascending. `total` counts the filtered set.
    async fn list(
        &self,
        limit: usize,
        offset: usize,
        filter: &DocumentFilter,
    ) -> Result<Page, StoreError>;

    /// Up to `limit` documents with `id > after_id`, ordered by `id` ascending.
    /// Rows removed between calls never shift later rows out of the walk.
    async fn scan(&self, after_id: i64, limit: usize) -> Result<Vec<Document>, StoreError>;

    /// Case-insensitive substring match across title, author and content,
    /// ordered by `id` ascending.
    async fn search_lexical(
        &self,
        term: &str,
        limit: usize,
        filter: &DocumentFilter,
    ) -> Result<Vec<Document>, StoreError>;

    /// Idempotent on `(source_file, page_number)`. Unchanged content keeps the
    /// existing id; changed content retires it and assigns a fresh one.
    async fn upsert(&self, doc: NewDocument) -> Result<UpsertOutcome, StoreError>;

    /// Returns whether a document was removed.
    async fn purge(&self, id: i64) -> Result<bool, StoreError>;

    async fn distinct(&self, field: VocabularyField) -> Result<Vocabulary, StoreError>;

    async fn count(&self) -> Result<i64, StoreError>;

    /// Snapshot of every live id.
    async fn ids(&self) -> Result<HashSet<i64>, StoreError>;
}

/// Per-key async mutexes. Writes for one logical document are serialized;
/// writes for different documents proceed concurrently.
#[derive(Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(key.to_string()).or_default().clone()
        };
        let guard = slot.clone().lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.to_string(),
            slot,
            guard: Some(guard),
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
    slot: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self
            .locks
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Only the map and this guard hold the slot: nobody is waiting.
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.key);
        }
    }
}

/// Lock key for a logical document.
pub fn source_key(source_file: &str, page_number: Option<i64>) -> String {
    match page_number {
        Some(page) => format!("{}#{}", source_file, page),
        None => source_file.to_string(),
    }
}
