//! Reindex pipeline.
//!
//! Rebuilds the vector index from the document store without disturbing
//! readers:
//!
//! ```text
//! Idle -> Scanning -> Embedding -> Swapping -> Idle
//!             \           \
//!              `-----------`--> Failed -> Idle (error kept in the status)
//! ```
//!
//! - **Scanning** walks every document by key and fingerprints it. Rows
//!   whose fingerprint matches the live index (same model, dims and metric)
//!   are copied over instead of being embedded again.
//! - **Embedding** produces one heading row plus one row per overlapping
//!   content window for every changed document, batch by batch, into a
//!   fresh [`VectorIndex`]. The live index is never mutated.
//! - **Swapping** takes the swap lock (shared with [`Reindexer::purge`]),
//!   drops rows for documents deleted in the meantime, persists the new
//!   generation and publishes it with a pointer swap.
//!
//! Only one run may be in flight; a second trigger fails fast with
//! [`ReindexError::Busy`].

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::chunk::{chunk_text, ChunkPolicy};
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::{EmbeddingError, ReindexError};
use crate::models::Document;
use crate::store::DocumentStore;
use crate::vector_index::{IndexHandle, IndexRow, Metric, VectorIndex};

const SCAN_PAGE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReindexPhase {
    Idle,
    Scanning,
    Embedding,
    Swapping,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReindexReport {
    pub run_id: String,
    pub documents: usize,
    /// Documents whose vectors were carried over from the previous index.
    pub reused: usize,
    /// Documents embedded during this run.
    pub embedded: usize,
    /// Documents deleted while the run was in flight.
    pub dropped: usize,
    pub vectors: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReindexStatus {
    pub phase: ReindexPhase,
    pub run_id: Option<String>,
    pub last_report: Option<ReindexReport>,
    pub last_error: Option<String>,
}

impl Default for ReindexStatus {
    fn default() -> Self {
        Self {
            phase: ReindexPhase::Idle,
            run_id: None,
            last_report: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReindexSettings {
    pub chunking: ChunkPolicy,
    pub batch_size: usize,
    /// Bound on each embedding batch.
    pub batch_timeout: Duration,
    pub index_dir: Option<PathBuf>,
    pub metric: Metric,
}

impl ReindexSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunking: ChunkPolicy::from(&config.chunking),
            batch_size: config.embedding.batch_size.max(1),
            batch_timeout: config.embedding.timeout(),
            index_dir: config.index.dir.clone(),
            metric: config.index.metric,
        }
    }
}

#[derive(Clone)]
pub struct Reindexer {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn DocumentStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: IndexHandle,
    settings: ReindexSettings,
    running: AtomicBool,
    swap_lock: tokio::sync::Mutex<()>,
    status: Mutex<ReindexStatus>,
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard {
    inner: Arc<Inner>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
    }
}

/// A pending embedding: the row it will become and the text to embed.
struct Pending {
    row: IndexRow,
    text: String,
}

impl Reindexer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        index: IndexHandle,
        settings: ReindexSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                embedder,
                index,
                settings,
                running: AtomicBool::new(false),
                swap_lock: tokio::sync::Mutex::new(()),
                status: Mutex::new(ReindexStatus::default()),
            }),
        }
    }

    /// Start a run in the background and return its id.
    pub fn trigger(&self) -> Result<String, ReindexError> {
        let guard = self.acquire()?;
        let run_id = uuid::Uuid::new_v4().to_string();
        self.inner.begin(&run_id);

        let inner = self.inner.clone();
        let id = run_id.clone();
        tokio::spawn(async move {
            let _ = inner.execute(id, guard).await;
        });
        Ok(run_id)
    }

    /// Run to completion on the current task.
    pub async fn run(&self) -> Result<ReindexReport, ReindexError> {
        let guard = self.acquire()?;
        let run_id = uuid::Uuid::new_v4().to_string();
        self.inner.begin(&run_id);
        self.inner.execute(run_id, guard).await
    }

    pub fn status(&self) -> ReindexStatus {
        self.inner.status().clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Delete a document and remove its vectors from the live index.
    pub async fn purge(&self, id: i64) -> Result<bool, ReindexError> {
        let _swap = self.inner.swap_lock.lock().await;

        let removed = self.inner.store.purge(id).await?;
        if let Some(live) = self.inner.index.load() {
            if live.rows().iter().any(|r| r.document_id == id) {
                let next = live.retain_documents(|doc| doc != id);
                let next = self.inner.persist(next).await?;
                self.inner.index.swap(next);
            }
        }

        tracing::info!(document_id = id, removed, "purged document");
        Ok(removed)
    }

    fn acquire(&self) -> Result<RunGuard, ReindexError> {
        self.inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ReindexError::Busy)?;
        Ok(RunGuard {
            inner: self.inner.clone(),
        })
    }
}

impl Inner {
    fn status(&self) -> std::sync::MutexGuard<'_, ReindexStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, run_id: &str) {
        let mut status = self.status();
        status.phase = ReindexPhase::Scanning;
        status.run_id = Some(run_id.to_string());
        status.last_error = None;
    }

    fn set_phase(&self, phase: ReindexPhase) {
        tracing::info!(phase = ?phase, "reindex phase");
        self.status().phase = phase;
    }

    async fn execute(&self, run_id: String, _guard: RunGuard) -> Result<ReindexReport, ReindexError> {
        let started = Instant::now();
        tracing::info!(run_id = %run_id, "reindex started");

        match self.build(&run_id, started).await {
            Ok(report) => {
                tracing::info!(
                    run_id = %run_id,
                    documents = report.documents,
                    reused = report.reused,
                    embedded = report.embedded,
                    vectors = report.vectors,
                    elapsed_ms = report.elapsed_ms,
                    "reindex complete"
                );
                let mut status = self.status();
                status.phase = ReindexPhase::Idle;
                status.last_report = Some(report.clone());
                Ok(report)
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "reindex failed; live index unchanged");
                self.set_phase(ReindexPhase::Failed);
                let mut status = self.status();
                status.last_error = Some(e.to_string());
                status.phase = ReindexPhase::Idle;
                Err(e)
            }
        }
    }

    async fn build(&self, run_id: &str, started: Instant) -> Result<ReindexReport, ReindexError> {
        self.set_phase(ReindexPhase::Scanning);

        let model = self.embedder.model_name().to_string();
        let dims = self.embedder.dims();
        let metric = self.settings.metric;
        let mut next = VectorIndex::new(&model, dims, metric);

        // Live rows grouped by document, only when they are comparable.
        let live = self
            .index
            .load()
            .filter(|index| index.is_compatible(&model, dims, metric));
        let mut live_rows: HashMap<i64, Vec<usize>> = HashMap::new();
        if let Some(ref index) = live {
            for (i, row) in index.rows().iter().enumerate() {
                live_rows.entry(row.document_id).or_default().push(i);
            }
        }

        let mut pending: Vec<Pending> = Vec::new();
        let mut documents = 0usize;
        let mut reused = 0usize;
        let mut embedded = 0usize;
        let mut last_id = 0i64;

        loop {
            let page = self.store.scan(last_id, SCAN_PAGE).await?;
            let Some(last) = page.last() else {
                break;
            };
            last_id = last.id;

            for doc in &page {
                documents += 1;
                let fingerprint = self.fingerprint(doc, &model, dims);

                let carried = match (&live, live_rows.get(&doc.id)) {
                    (Some(index), Some(rows))
                        if rows.iter().all(|&i| {
                            index.row(i).is_some_and(|r| r.fingerprint == fingerprint)
                        }) =>
                    {
                        for &i in rows {
                            if let (Some(vector), Some(row)) = (index.vector(i), index.row(i)) {
                                next.add(vector, row.clone())?;
                            }
                        }
                        true
                    }
                    _ => false,
                };

                if carried {
                    reused += 1;
                } else {
                    embedded += 1;
                    pending.extend(self.plan(doc, &fingerprint));
                }
            }

            if page.len() < SCAN_PAGE {
                break;
            }
        }

        if !pending.is_empty() {
            self.set_phase(ReindexPhase::Embedding);
            for batch in pending.chunks(self.settings.batch_size) {
                let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
                let vectors = match tokio::time::timeout(
                    self.settings.batch_timeout,
                    self.embedder.embed(&texts),
                )
                .await
                {
                    Ok(result) => result?,
                    Err(_) => return Err(EmbeddingError::Timeout(self.settings.batch_timeout).into()),
                };
                if vectors.len() != batch.len() {
                    return Err(EmbeddingError::CountMismatch {
                        expected: batch.len(),
                        actual: vectors.len(),
                    }
                    .into());
                }
                for (item, vector) in batch.iter().zip(&vectors) {
                    next.add(vector, item.row.clone())?;
                }
            }
        }

        self.set_phase(ReindexPhase::Swapping);
        let _swap = self.swap_lock.lock().await;

        let live_ids = self.store.ids().await?;
        let before = next.document_count();
        let next = next.retain_documents(|id| live_ids.contains(&id));
        let dropped = before - next.document_count();

        let next = self.persist(next).await?;
        let vectors = next.size();
        self.index.swap(next);

        Ok(ReindexReport {
            run_id: run_id.to_string(),
            documents,
            reused,
            embedded,
            dropped,
            vectors,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Heading row plus one row per content window.
    fn plan(&self, doc: &Document, fingerprint: &str) -> Vec<Pending> {
        let mut out = vec![Pending {
            row: IndexRow {
                document_id: doc.id,
                chunk_offset: None,
                fingerprint: fingerprint.to_string(),
            },
            text: doc.heading(),
        }];
        for chunk in chunk_text(&doc.content, &self.settings.chunking) {
            out.push(Pending {
                row: IndexRow {
                    document_id: doc.id,
                    chunk_offset: Some(chunk.char_offset),
                    fingerprint: fingerprint.to_string(),
                },
                text: format!("{}\n{}", doc.title, chunk.text),
            });
        }
        out
    }

    fn fingerprint(&self, doc: &Document, model: &str, dims: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(dims.to_le_bytes());
        hasher.update(self.settings.chunking.window_chars.to_le_bytes());
        hasher.update(self.settings.chunking.overlap_chars.to_le_bytes());
        hasher.update(doc.heading().as_bytes());
        hasher.update([0u8]);
        hasher.update(doc.title.as_bytes());
        hasher.update([0u8]);
        hasher.update(doc.content_hash.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Write `index` as a new generation when an index directory is configured.
    async fn persist(&self, index: VectorIndex) -> Result<VectorIndex, ReindexError> {
        let Some(dir) = self.settings.index_dir.clone() else {
            return Ok(index);
        };
        let (index, saved) = tokio::task::spawn_blocking(move || {
            let saved = index.save(&dir);
            (index, saved)
        })
        .await
        .map_err(|e| ReindexError::Task(e.to_string()))?;
        let generation = saved?;
        tracing::debug!(generation = %generation.display(), "persisted vector index");
        Ok(index)
    }
}
