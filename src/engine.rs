//! Engine assembly.
//!
//! [`Engine`] owns one instance of every component and wires them together
//! around a shared [`IndexHandle`]: the retriever reads from it, the
//! reindexer swaps it. The CLI and the HTTP server both go through here.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::chat::{ChatOrchestrator, ChatSettings};
use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{RetrievalError, StoreError};
use crate::generation::{create_model, LanguageModel};
use crate::reindex::{ReindexSettings, Reindexer};
use crate::retrieval::{RetrievalSettings, Retriever};
use crate::store::{DocumentStore, SqliteDocumentStore};
use crate::vector_index::{IndexHandle, VectorIndex};
use crate::{db, migrate};

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub documents_count: i64,
    pub index_size: usize,
    pub locations_count: i64,
    pub feedback_count: i64,
}

/// Snapshot of what grounding a question would use.
#[derive(Debug, Clone, Serialize)]
pub struct GroundingPreview {
    pub query: String,
    pub docs_found: usize,
    pub doc_titles: Vec<String>,
    pub index_loaded: bool,
    pub index_vectors: usize,
    pub store_size: i64,
    pub context_preview: String,
}

pub struct Engine {
    pub config: Config,
    pub store: Arc<dyn DocumentStore>,
    pub index: IndexHandle,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub retriever: Arc<Retriever>,
    pub reindexer: Reindexer,
    pub chat: ChatOrchestrator,
}

impl Engine {
    /// Connect the store, run migrations, build the providers and load the
    /// persisted index if one exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config)
            .await
            .with_context(|| format!("Failed to open database {}", config.db.path.display()))?;
        migrate::run_migrations(&pool).await?;
        let store: Arc<dyn DocumentStore> =
            Arc::new(SqliteDocumentStore::new(pool, config.chunking.preview_chars));

        let embedder = create_provider(&config.embedding)?;
        let model = create_model(&config.generation)?;

        let index = match config.index.dir {
            Some(ref dir) => load_index(dir.clone()).await,
            None => None,
        };
        if let Some(ref index) = index {
            if index.model() != embedder.model_name() || index.dims() != embedder.dims() {
                tracing::warn!(
                    index_model = index.model(),
                    provider_model = embedder.model_name(),
                    "persisted index was built with a different model; reindex required"
                );
            }
            tracing::info!(vectors = index.size(), documents = index.document_count(), "loaded vector index");
        }

        Ok(Self::from_parts(
            config.clone(),
            store,
            embedder,
            model,
            IndexHandle::new(index),
        ))
    }

    /// Assemble an engine from already-built components.
    pub fn from_parts(
        config: Config,
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn LanguageModel>,
        index: IndexHandle,
    ) -> Self {
        let retriever = Arc::new(Retriever::new(
            store.clone(),
            embedder.clone(),
            index.clone(),
            RetrievalSettings::from(&config.retrieval),
        ));
        let reindexer = Reindexer::new(
            store.clone(),
            embedder.clone(),
            index.clone(),
            ReindexSettings::from_config(&config),
        );
        let chat = ChatOrchestrator::new(retriever.clone(), model, ChatSettings::from_config(&config));

        Self {
            config,
            store,
            index,
            embedder,
            retriever,
            reindexer,
            chat,
        }
    }

    pub async fn stats(&self) -> Result<EngineStats, StoreError> {
        Ok(EngineStats {
            documents_count: self.store.count().await?,
            index_size: self.index.size(),
            locations_count: 0,
            feedback_count: 0,
        })
    }

    pub async fn grounding_preview(&self, question: &str) -> Result<GroundingPreview, RetrievalError> {
        let grounding = self.chat.grounding(question).await?;
        let index = self.index.load();
        Ok(GroundingPreview {
            query: question.to_string(),
            docs_found: grounding.sources.len(),
            doc_titles: grounding.sources.iter().map(|s| s.title.clone()).collect(),
            index_loaded: index.is_some(),
            index_vectors: index.map_or(0, |i| i.size()),
            store_size: self.store.count().await?,
            context_preview: grounding.context.chars().take(1200).collect(),
        })
    }
}

/// Load the persisted generation. An unreadable index is logged and left
/// unloaded: retrieval then runs degraded until a reindex replaces it.
async fn load_index(dir: PathBuf) -> Option<VectorIndex> {
    let loaded = tokio::task::spawn_blocking(move || VectorIndex::load(&dir)).await;
    match loaded {
        Ok(Ok(index)) => index,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "failed to load vector index; starting without one");
            None
        }
        Err(e) => {
            tracing::error!(error = %e, "vector index loader panicked; starting without one");
            None
        }
    }
}
