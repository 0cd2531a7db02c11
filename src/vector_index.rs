//! Flat vector index with generation-based persistence.
//!
//! A [`VectorIndex`] is an append-only table of fixed-dimension vectors
//! with a parallel metadata table mapping each row to the document (and
//! chunk) it was computed from. Search is exhaustive, which keeps results
//! exact and deterministic for corpora of this size.
//!
//! # On-disk layout
//!
//! ```text
//! <dir>/CURRENT             name of the live generation
//! <dir>/gen-<uuid>/vectors.bin   little-endian f32, row-major
//! <dir>/gen-<uuid>/rows.json     model, dims, metric, row metadata
//! ```
//!
//! A save writes a complete new generation into a temporary directory,
//! renames it into place, and only then repoints `CURRENT` with an atomic
//! rename. Readers follow `CURRENT`, so the vector blob and the metadata
//! table always switch together.
//!
//! [`IndexHandle`] is the shared, swappable reference to the live index.

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::IndexError;

const CURRENT_FILE: &str = "CURRENT";
const VECTORS_FILE: &str = "vectors.bin";
const ROWS_FILE: &str = "rows.json";
const GENERATION_PREFIX: &str = "gen-";
const TMP_PREFIX: &str = ".tmp-";
const FORMAT_VERSION: u32 = 1;

/// Distance metric, fixed when an index is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Euclidean distance.
    #[default]
    L2,
    /// `1 - cosine similarity`.
    Cosine,
}

impl Metric {
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            Metric::Cosine => 1.0 - cosine_similarity(a, b),
        }
    }
}

/// Metadata for one vector row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRow {
    pub document_id: i64,
    /// Character offset of the chunk; `None` for the document heading row.
    pub chunk_offset: Option<usize>,
    /// Digest of everything that went into the vector, used to skip re-embedding.
    pub fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub row: usize,
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    model: String,
    dims: usize,
    metric: Metric,
    vectors: Vec<f32>,
    rows: Vec<IndexRow>,
}

#[derive(Serialize, Deserialize)]
struct IndexMeta {
    format_version: u32,
    model: String,
    dims: usize,
    metric: Metric,
    count: usize,
    rows: Vec<IndexRow>,
}

impl VectorIndex {
    pub fn new(model: impl Into<String>, dims: usize, metric: Metric) -> Self {
        Self {
            model: model.into(),
            dims,
            metric,
            vectors: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn size(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether vectors from `model`/`dims` can be compared against this index.
    pub fn is_compatible(&self, model: &str, dims: usize, metric: Metric) -> bool {
        self.model == model && self.dims == dims && self.metric == metric
    }

    /// Append a vector, returning its row number.
    pub fn add(&mut self, vector: &[f32], row: IndexRow) -> Result<usize, IndexError> {
        if vector.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            });
        }
        self.vectors.extend_from_slice(vector);
        self.rows.push(row);
        Ok(self.rows.len() - 1)
    }

    pub fn row(&self, row: usize) -> Option<&IndexRow> {
        self.rows.get(row)
    }

    pub fn rows(&self) -> &[IndexRow] {
        &self.rows
    }

    pub fn vector(&self, row: usize) -> Option<&[f32]> {
        let start = row.checked_mul(self.dims)?;
        self.vectors.get(start..start + self.dims)
    }

    /// The `k` nearest rows, ascending by distance; equal distances keep row order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        if query.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                actual: query.len(),
            });
        }
        if k == 0 || self.rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut neighbors: Vec<Neighbor> = self
            .vectors
            .chunks_exact(self.dims)
            .enumerate()
            .map(|(row, v)| Neighbor {
                row,
                distance: self.metric.distance(query, v),
            })
            .collect();

        neighbors.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.row.cmp(&b.row))
        });
        neighbors.truncate(k);
        Ok(neighbors)
    }

    /// Number of distinct documents referenced by the index.
    pub fn document_count(&self) -> usize {
        let mut ids: Vec<i64> = self.rows.iter().map(|r| r.document_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// A copy holding only rows whose document passes `keep`.
    pub fn retain_documents(&self, keep: impl Fn(i64) -> bool) -> VectorIndex {
        let mut out = VectorIndex::new(self.model.clone(), self.dims, self.metric);
        for (row, meta) in self.rows.iter().enumerate() {
            if keep(meta.document_id) {
                out.rows.push(meta.clone());
                let start = row * self.dims;
                out.vectors
                    .extend_from_slice(&self.vectors[start..start + self.dims]);
            }
        }
        out
    }

    /// Persist as a new generation under `dir` and make it current.
    ///
    /// Returns the generation directory.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, IndexError> {
        fs::create_dir_all(dir)?;

        let generation = format!("{}{}", GENERATION_PREFIX, uuid::Uuid::new_v4().simple());
        let tmp_dir = dir.join(format!("{}{}", TMP_PREFIX, generation));
        let gen_dir = dir.join(&generation);
        fs::create_dir_all(&tmp_dir)?;

        let meta = IndexMeta {
            format_version: FORMAT_VERSION,
            model: self.model.clone(),
            dims: self.dims,
            metric: self.metric,
            count: self.rows.len(),
            rows: self.rows.clone(),
        };
        let meta_json = serde_json::to_vec(&meta)
            .map_err(|e| IndexError::Corrupt(format!("serialize rows: {}", e)))?;

        write_synced(&tmp_dir.join(VECTORS_FILE), &vec_to_blob(&self.vectors))?;
        write_synced(&tmp_dir.join(ROWS_FILE), &meta_json)?;
        fs::rename(&tmp_dir, &gen_dir)?;

        let pointer_tmp = dir.join(format!("{}{}", TMP_PREFIX, CURRENT_FILE));
        write_synced(&pointer_tmp, generation.as_bytes())?;
        fs::rename(&pointer_tmp, dir.join(CURRENT_FILE))?;

        collect_garbage(dir, &generation);
        Ok(gen_dir)
    }

    /// Load the current generation, or `None` if nothing has been saved yet.
    pub fn load(dir: &Path) -> Result<Option<VectorIndex>, IndexError> {
        let pointer = match fs::read_to_string(dir.join(CURRENT_FILE)) {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let generation = pointer.trim();
        if !generation.starts_with(GENERATION_PREFIX) || generation.contains(['/', '\\']) {
            return Err(IndexError::Corrupt(format!(
                "CURRENT names an invalid generation: {:?}",
                generation
            )));
        }

        let gen_dir = dir.join(generation);
        let meta: IndexMeta = serde_json::from_slice(&fs::read(gen_dir.join(ROWS_FILE))?)
            .map_err(|e| IndexError::Corrupt(format!("rows.json: {}", e)))?;
        if meta.format_version != FORMAT_VERSION {
            return Err(IndexError::Corrupt(format!(
                "unsupported format version {}",
                meta.format_version
            )));
        }
        if meta.dims == 0 {
            return Err(IndexError::Corrupt("dims must be positive".to_string()));
        }

        let vectors = blob_to_vec(&fs::read(gen_dir.join(VECTORS_FILE))?);
        if meta.rows.len() != meta.count || vectors.len() != meta.count * meta.dims {
            return Err(IndexError::Corrupt(format!(
                "expected {} rows of {} dims, found {} rows and {} floats",
                meta.count,
                meta.dims,
                meta.rows.len(),
                vectors.len()
            )));
        }

        Ok(Some(VectorIndex {
            model: meta.model,
            dims: meta.dims,
            metric: meta.metric,
            vectors,
            rows: meta.rows,
        }))
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Remove every generation and temp entry except `keep`.
fn collect_garbage(dir: &Path, keep: &str) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let stale_generation = name.starts_with(GENERATION_PREFIX) && name != keep;
        let stale_tmp = name.starts_with(TMP_PREFIX) && entry.path().is_dir();
        if stale_generation || stale_tmp {
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                tracing::warn!(path = %entry.path().display(), error = %e, "failed to remove old index generation");
            }
        }
    }
}

/// Shared handle to the live index.
///
/// Readers take an `Arc` snapshot with [`IndexHandle::load`] and keep using
/// it for the whole request; a concurrent [`IndexHandle::swap`] only affects
/// later loads.
#[derive(Clone, Default)]
pub struct IndexHandle {
    inner: Arc<ArcSwapOption<VectorIndex>>,
}

impl IndexHandle {
    pub fn new(index: Option<VectorIndex>) -> Self {
        Self {
            inner: Arc::new(ArcSwapOption::new(index.map(Arc::new))),
        }
    }

    pub fn load(&self) -> Option<Arc<VectorIndex>> {
        self.inner.load_full()
    }

    /// Publish `index`, returning the previous one.
    pub fn swap(&self, index: VectorIndex) -> Option<Arc<VectorIndex>> {
        self.inner.swap(Some(Arc::new(index)))
    }

    pub fn size(&self) -> usize {
        self.load().map_or(0, |index| index.size())
    }
}
