//! Retrieval engine: semantic search with lexical fallback.
//!
//! A query is embedded and searched against a snapshot of the live index.
//! Rows are collapsed to their best-scoring document, joined against the
//! document store (ids that no longer exist are dropped), filtered on
//! metadata and thresholded. When that yields nothing the store's
//! case-insensitive substring search takes over; those hits carry no
//! similarity.
//!
//! Ordering is always similarity descending, then `document_id` ascending,
//! with unscored hits after scored ones.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{EmbeddingError, IndexError, RetrievalError, StoreError};
use crate::models::{Document, Query, RetrievalResult, SearchMode};
use crate::store::DocumentStore;
use crate::vector_index::IndexHandle;

/// Map a distance onto `(0, 1]`, higher meaning closer.
pub fn similarity_from_distance(distance: f32) -> f64 {
    1.0 / (1.0 + f64::from(distance.max(0.0)))
}

#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub default_k: usize,
    pub max_k: usize,
    pub candidate_factor: usize,
    pub min_similarity: f64,
    pub timeout: Duration,
}

impl From<&RetrievalConfig> for RetrievalSettings {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            default_k: config.default_k,
            max_k: config.max_k,
            candidate_factor: config.candidate_factor,
            min_similarity: config.min_similarity,
            timeout: config.timeout(),
        }
    }
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

/// Which path produced the results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalPath {
    Semantic,
    Lexical,
    Hybrid,
}

#[derive(Debug, Clone, Serialize)]
pub struct Retrieval {
    pub results: Vec<RetrievalResult>,
    pub path: RetrievalPath,
    /// Why the semantic path was skipped, when it was forced out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

enum Semantic {
    Hits(Vec<Scored>),
    Skipped(String),
}

struct Scored {
    document: Document,
    similarity: f64,
    chunk_offset: Option<usize>,
}

pub struct Retriever {
    store: Arc<dyn DocumentStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: IndexHandle,
    settings: RetrievalSettings,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        index: IndexHandle,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            index,
            settings,
        }
    }

    pub async fn retrieve(&self, query: &Query) -> Result<Retrieval, RetrievalError> {
        let text = query.text.trim();
        if text.is_empty() {
            return Err(RetrievalError::InvalidQuery(
                "query must not be empty".to_string(),
            ));
        }
        let k = query
            .k
            .unwrap_or(self.settings.default_k)
            .clamp(1, self.settings.max_k);

        if query.mode == SearchMode::Lexical {
            let results = self.lexical(text, query, k, &HashSet::new()).await?;
            return Ok(Retrieval {
                results: rank(results),
                path: RetrievalPath::Lexical,
                degraded: None,
            });
        }

        let (mut scored, degraded) = match self.semantic(text, query, k).await? {
            Semantic::Hits(hits) => (hits, None),
            Semantic::Skipped(reason) => {
                tracing::info!(reason = %reason, "semantic retrieval skipped; using lexical fallback");
                (Vec::new(), Some(reason))
            }
        };
        scored.sort_by(compare_scored);
        scored.truncate(k);

        let mut results: Vec<RetrievalResult> = scored
            .into_iter()
            .map(|s| unranked(s.document, Some(s.similarity), s.chunk_offset))
            .collect();

        let path = if results.is_empty() {
            let lexical = self.lexical(text, query, k, &HashSet::new()).await?;
            results.extend(lexical);
            RetrievalPath::Lexical
        } else if query.mode == SearchMode::Hybrid && results.len() < k {
            let seen: HashSet<i64> = results.iter().map(|r| r.document_id).collect();
            let lexical = self.lexical(text, query, k - results.len(), &seen).await?;
            results.extend(lexical);
            RetrievalPath::Hybrid
        } else if query.mode == SearchMode::Hybrid {
            RetrievalPath::Hybrid
        } else {
            RetrievalPath::Semantic
        };

        tracing::debug!(path = ?path, results = results.len(), k, "retrieval complete");
        Ok(Retrieval {
            results: rank(results),
            path,
            degraded,
        })
    }

    async fn semantic(&self, text: &str, query: &Query, k: usize) -> Result<Semantic, RetrievalError> {
        let timeout = self.settings.timeout;
        let vector = match tokio::time::timeout(timeout, self.embedder.embed_query(text)).await {
            Err(_) => return Ok(Semantic::Skipped(EmbeddingError::Timeout(timeout).to_string())),
            Ok(Err(EmbeddingError::Disabled)) => {
                return Ok(Semantic::Skipped("embeddings disabled".to_string()))
            }
            Ok(Err(e)) => return Err(RetrievalError::Embedding(e)),
            Ok(Ok(v)) => v,
        };

        let Some(index) = self.index.load() else {
            return Ok(Semantic::Skipped("vector index not loaded".to_string()));
        };
        if index.is_empty() {
            return Ok(Semantic::Hits(Vec::new()));
        }
        if index.model() != self.embedder.model_name() {
            let mismatch = IndexError::ModelMismatch {
                expected: index.model().to_string(),
                actual: self.embedder.model_name().to_string(),
            };
            return Ok(Semantic::Skipped(format!("{}; reindex required", mismatch)));
        }
        if index.dims() != vector.len() {
            let mismatch = IndexError::DimensionMismatch {
                expected: index.dims(),
                actual: vector.len(),
            };
            return Ok(Semantic::Skipped(format!("{}; reindex required", mismatch)));
        }

        let vector = Arc::new(vector);
        let mut fetch = k.saturating_mul(self.settings.candidate_factor).max(k);

        loop {
            let neighbors = {
                let index = index.clone();
                let vector = vector.clone();
                let search = tokio::task::spawn_blocking(move || index.search(&vector, fetch));
                match tokio::time::timeout(timeout, search).await {
                    Err(_) => return Ok(Semantic::Skipped("vector search timed out".to_string())),
                    Ok(Err(join)) => {
                        return Ok(Semantic::Skipped(format!("vector search failed: {}", join)))
                    }
                    Ok(Ok(Err(e))) => return Ok(Semantic::Skipped(e.to_string())),
                    Ok(Ok(Ok(n))) => n,
                }
            };
            let exhausted = fetch >= index.size();

            // Best row per document, in ascending distance order.
            let mut best: Vec<(i64, f64, Option<usize>)> = Vec::new();
            let mut seen = HashSet::new();
            let mut below_threshold = false;
            for n in &neighbors {
                let similarity = similarity_from_distance(n.distance);
                if similarity < self.settings.min_similarity {
                    below_threshold = true;
                    break;
                }
                let Some(row) = index.row(n.row) else {
                    continue;
                };
                if seen.insert(row.document_id) {
                    best.push((row.document_id, similarity, row.chunk_offset));
                }
            }

            let ids: Vec<i64> = best.iter().map(|(id, _, _)| *id).collect();
            let mut docs = match self.store.get_many(&ids).await {
                Ok(docs) => docs,
                Err(e @ StoreError::Unavailable(_)) => {
                    tracing::warn!(error = %e, "document store unavailable during semantic retrieval");
                    return Ok(Semantic::Skipped(e.to_string()));
                }
                Err(e) => return Err(e.into()),
            };

            let mut hits = Vec::with_capacity(best.len());
            for (id, similarity, chunk_offset) in best {
                match docs.remove(&id) {
                    Some(document) if query.filter.matches(&document) => hits.push(Scored {
                        document,
                        similarity,
                        chunk_offset,
                    }),
                    Some(_) => {}
                    None => tracing::debug!(document_id = id, "dropping stale index reference"),
                }
            }

            if hits.len() >= k || exhausted || below_threshold {
                return Ok(Semantic::Hits(hits));
            }
            fetch = fetch.saturating_mul(2);
        }
    }

    async fn lexical(
        &self,
        text: &str,
        query: &Query,
        limit: usize,
        exclude: &HashSet<i64>,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        let docs = self
            .store
            .search_lexical(text, limit + exclude.len(), &query.filter)
            .await
            .map_err(|e| match e {
                StoreError::Unavailable(reason) => RetrievalError::Unavailable(reason),
                other => RetrievalError::Store(other),
            })?;

        Ok(docs
            .into_iter()
            .filter(|d| !exclude.contains(&d.id))
            .take(limit)
            .map(|d| unranked(d, None, None))
            .collect())
    }

    /// Raw documents for the top hits, keyed by id, for callers needing full content.
    pub async fn fetch_documents(
        &self,
        results: &[RetrievalResult],
    ) -> Result<HashMap<i64, Document>, StoreError> {
        let ids: Vec<i64> = results.iter().map(|r| r.document_id).collect();
        self.store.get_many(&ids).await
    }
}

fn compare_scored(a: &Scored, b: &Scored) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| a.document.id.cmp(&b.document.id))
}

fn unranked(document: Document, similarity: Option<f64>, chunk_offset: Option<usize>) -> RetrievalResult {
    RetrievalResult {
        document_id: document.id,
        rank: 0,
        similarity,
        chunk_offset,
        document: document.summary(),
    }
}

/// Scored hits first (similarity desc, id asc), then unscored hits by id.
fn rank(mut results: Vec<RetrievalResult>) -> Vec<RetrievalResult> {
    results.sort_by(|a, b| match (a.similarity, b.similarity) {
        (Some(x), Some(y)) => y.total_cmp(&x).then_with(|| a.document_id.cmp(&b.document_id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.document_id.cmp(&b.document_id),
    });
    for (i, r) in results.iter_mut().enumerate() {
        r.rank = i + 1;
    }
    results
}
