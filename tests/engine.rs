//! End-to-end engine behaviour: retrieval over a live index, concurrent
//! reads during a rebuild, stale references, and the streamed answer
//! contract.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use annals::chat::ChatFrame;
use annals::config::{load_config, Config};
use annals::embedding::{EmbeddingProvider, HashProvider};
use annals::engine::Engine;
use annals::error::{EmbeddingError, GenerationError, ReindexError, RetrievalError};
use annals::generation::{ExtractiveModel, LanguageModel, Prompt, TokenStream};
use annals::models::{
    ChatMessage, DocumentFilter, DocumentType, NewDocument, Query, SearchMode, UpsertStatus,
};
use annals::reindex::ReindexPhase;
use annals::retrieval::RetrievalPath;
use annals::store::{DocumentStore, SqliteDocumentStore};
use annals::vector_index::IndexHandle;
use annals::{db, migrate};

const DIMS: usize = 1024;

fn write_config(dir: &Path) -> Config {
    let path = dir.join("annals.toml");
    std::fs::write(
        &path,
        format!(
            r#"[db]
path = "{root}/annals.sqlite"

[index]
dir = "{root}/index"

[chunking]
window_chars = 400
overlap_chars = 80

[embedding]
provider = "hash"
dims = {dims}
"#,
            root = dir.display(),
            dims = DIMS
        ),
    )
    .unwrap();
    load_config(&path).unwrap()
}

async fn open_store(config: &Config) -> Arc<SqliteDocumentStore> {
    let pool = db::connect_path(&config.db.path).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    Arc::new(SqliteDocumentStore::new(pool, config.chunking.preview_chars))
}

async fn engine_with(
    dir: &Path,
    embedder: Arc<dyn EmbeddingProvider>,
    model: Arc<dyn LanguageModel>,
) -> Engine {
    let config = write_config(dir);
    let store = open_store(&config).await;
    Engine::from_parts(config, store, embedder, model, IndexHandle::default())
}

async fn hash_engine(dir: &Path) -> Engine {
    engine_with(dir, Arc::new(HashProvider::new(DIMS)), Arc::new(ExtractiveModel)).await
}

fn doc(source: &str, title: &str, author: Option<&str>, year: Option<i32>, content: &str) -> NewDocument {
    NewDocument {
        title: title.to_string(),
        author: author.map(str::to_string),
        year,
        doc_type: DocumentType::Book,
        source_file: source.to_string(),
        content: content.to_string(),
        ..NewDocument::default()
    }
}

/// Three-document corpus; returns the ids of Treasure Fleet, Ming Naval Tech, Malacca Port.
async fn seed(engine: &Engine) -> (i64, i64, i64) {
    let fleet = engine
        .store
        .upsert(doc(
            "fleet.md",
            "Treasure Fleet",
            Some("Ma Huan"),
            Some(1433),
            "Zheng He commanded seven voyages of enormous ships across the Indian Ocean, \
             carrying silk and porcelain to distant kingdoms.",
        ))
        .await
        .unwrap();
    let ming = engine
        .store
        .upsert(doc(
            "ming.md",
            "Ming Naval Tech",
            None,
            Some(1420),
            "Shipyards at Nanjing built watertight bulkheads and sternpost rudders.",
        ))
        .await
        .unwrap();
    let malacca = engine
        .store
        .upsert(doc(
            "malacca.md",
            "Malacca Port",
            Some("Tome Pires"),
            Some(1515),
            "The port city of Malacca controlled the strait and hosted merchants from Gujarat and Java.",
        ))
        .await
        .unwrap();
    (fleet.id, ming.id, malacca.id)
}

#[tokio::test]
async fn semantic_query_ranks_closest_title_first() {
    let tmp = TempDir::new().unwrap();
    let engine = hash_engine(tmp.path()).await;
    let (_, ming, _) = seed(&engine).await;
    engine.reindexer.run().await.unwrap();

    let retrieval = engine
        .retriever
        .retrieve(&Query::new("naval technology").with_k(2))
        .await
        .unwrap();
    assert_eq!(retrieval.path, RetrievalPath::Semantic);
    assert!(retrieval.results.len() <= 2);
    assert_eq!(retrieval.results[0].document_id, ming);
    assert_eq!(retrieval.results[0].rank, 1);
    let similarity = retrieval.results[0].similarity.unwrap();
    assert!(similarity > 0.0 && similarity <= 1.0);
}

#[tokio::test]
async fn unmatched_query_falls_back_to_empty_lexical() {
    let tmp = TempDir::new().unwrap();
    let engine = hash_engine(tmp.path()).await;
    seed(&engine).await;
    engine.reindexer.run().await.unwrap();

    let retrieval = engine
        .retriever
        .retrieve(&Query::new("nonexistent topic xyz"))
        .await
        .unwrap();
    assert_eq!(retrieval.path, RetrievalPath::Lexical);
    assert!(retrieval.results.is_empty());
}

#[tokio::test]
async fn exact_title_comes_back_first() {
    let tmp = TempDir::new().unwrap();
    let engine = hash_engine(tmp.path()).await;
    let (fleet, ming, malacca) = seed(&engine).await;
    engine.reindexer.run().await.unwrap();

    for (title, id) in [("Treasure Fleet", fleet), ("Ming Naval Tech", ming), ("Malacca Port", malacca)] {
        let retrieval = engine.retriever.retrieve(&Query::new(title)).await.unwrap();
        assert_eq!(retrieval.results[0].document_id, id, "query {:?}", title);
        assert_eq!(retrieval.results[0].document.title, title);
    }
}

#[tokio::test]
async fn lexical_results_are_served_without_an_index() {
    let tmp = TempDir::new().unwrap();
    let engine = hash_engine(tmp.path()).await;
    let (fleet, _, _) = seed(&engine).await;

    let retrieval = engine.retriever.retrieve(&Query::new("porcelain")).await.unwrap();
    assert_eq!(retrieval.path, RetrievalPath::Lexical);
    assert!(retrieval.degraded.is_some());
    assert_eq!(retrieval.results.len(), 1);
    assert_eq!(retrieval.results[0].document_id, fleet);
    assert!(retrieval.results[0].similarity.is_none());
}

#[tokio::test]
async fn stale_index_entries_are_skipped() {
    let tmp = TempDir::new().unwrap();
    let engine = hash_engine(tmp.path()).await;
    let (_, _, malacca) = seed(&engine).await;
    engine.reindexer.run().await.unwrap();
    let vectors = engine.index.size();

    // Deleted behind the reindexer's back: the index still references it.
    assert!(engine.store.purge(malacca).await.unwrap());
    assert_eq!(engine.index.size(), vectors);

    let retrieval = engine.retriever.retrieve(&Query::new("Malacca Port")).await.unwrap();
    assert!(retrieval.results.iter().all(|r| r.document_id != malacca));
    for (i, result) in retrieval.results.iter().enumerate() {
        assert_eq!(result.rank, i + 1);
    }
}

#[tokio::test]
async fn purge_through_reindexer_drops_vectors() {
    let tmp = TempDir::new().unwrap();
    let engine = hash_engine(tmp.path()).await;
    let (fleet, _, _) = seed(&engine).await;
    engine.reindexer.run().await.unwrap();
    let before = engine.index.size();

    assert!(engine.reindexer.purge(fleet).await.unwrap());
    let index = engine.index.load().unwrap();
    assert!(index.size() < before);
    assert!(index.rows().iter().all(|r| r.document_id != fleet));
    assert!(!engine.reindexer.purge(fleet).await.unwrap());
}

#[tokio::test]
async fn upsert_is_idempotent_and_replaces_changed_content() {
    let tmp = TempDir::new().unwrap();
    let engine = hash_engine(tmp.path()).await;
    let original = doc("fleet.md", "Treasure Fleet", None, None, "First draft.");

    let first = engine.store.upsert(original.clone()).await.unwrap();
    let again = engine.store.upsert(original.clone()).await.unwrap();
    assert_eq!(again.id, first.id);
    assert_eq!(again.status, UpsertStatus::Unchanged);
    assert_eq!(engine.store.count().await.unwrap(), 1);

    let revised = engine
        .store
        .upsert(NewDocument {
            content: "Second draft.".to_string(),
            ..original
        })
        .await
        .unwrap();
    assert_ne!(revised.id, first.id);
    assert_eq!(revised.previous_id, Some(first.id));
    assert_eq!(engine.store.count().await.unwrap(), 1);
}

/// Hash embeddings whose batch calls wait for a permit while `hold` is set.
/// Query embeddings are never held.
struct GatedEmbedder {
    inner: HashProvider,
    hold: AtomicBool,
    gate: Semaphore,
}

impl GatedEmbedder {
    fn new() -> Self {
        Self {
            inner: HashProvider::new(DIMS),
            hold: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for GatedEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if self.hold.load(Ordering::SeqCst) {
            self.gate.acquire().await.unwrap().forget();
        }
        self.inner.embed(texts).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.inner.embed_one(text))
    }
}

async fn wait_for_phase(engine: &Engine, phase: ReindexPhase) {
    for _ in 0..500 {
        if engine.reindexer.status().phase == phase {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("reindex never reached {:?}", phase);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_see_the_old_index_until_the_swap() {
    let tmp = TempDir::new().unwrap();
    let embedder = Arc::new(GatedEmbedder::new());
    let engine = Arc::new(engine_with(tmp.path(), embedder.clone(), Arc::new(ExtractiveModel)).await);
    let (fleet, _, _) = seed(&engine).await;
    engine.reindexer.run().await.unwrap();
    let old_size = engine.index.size();

    let added = engine
        .store
        .upsert(doc(
            "calicut.md",
            "Calicut Pepper Trade",
            None,
            None,
            "Pepper and ginger left Calicut for Hormuz.",
        ))
        .await
        .unwrap();
    embedder.hold.store(true, Ordering::SeqCst);
    engine.reindexer.trigger().unwrap();
    wait_for_phase(&engine, ReindexPhase::Embedding).await;

    let readers: Vec<_> = (0..50)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .retriever
                    .retrieve(&Query::new("Treasure Fleet"))
                    .await
                    .unwrap()
            })
        })
        .collect();
    for reader in readers {
        let retrieval = reader.await.unwrap();
        assert_eq!(retrieval.path, RetrievalPath::Semantic);
        assert_eq!(retrieval.results[0].document_id, fleet);
        assert!(retrieval.results.iter().all(|r| r.document_id != added.id));
    }
    assert_eq!(engine.index.size(), old_size);

    assert!(matches!(engine.reindexer.trigger(), Err(ReindexError::Busy)));
    assert!(engine.reindexer.is_running());

    embedder.hold.store(false, Ordering::SeqCst);
    embedder.gate.add_permits(1_000);
    wait_for_phase(&engine, ReindexPhase::Idle).await;

    let status = engine.reindexer.status();
    let report = status.last_report.unwrap();
    assert_eq!(report.documents, 4);
    assert_eq!(report.reused, 3);
    assert_eq!(report.embedded, 1);

    let retrieval = engine
        .retriever
        .retrieve(&Query::new("Calicut Pepper Trade"))
        .await
        .unwrap();
    assert_eq!(retrieval.results[0].document_id, added.id);
}

#[tokio::test]
async fn streamed_answer_ends_with_scored_sources() {
    let tmp = TempDir::new().unwrap();
    let engine = hash_engine(tmp.path()).await;
    let (fleet, _, _) = seed(&engine).await;
    engine.reindexer.run().await.unwrap();

    let frames: Vec<ChatFrame> = engine
        .chat
        .answer(vec![ChatMessage::user("Treasure Fleet")], true)
        .collect()
        .await;

    let (last, deltas) = frames.split_last().unwrap();
    assert!(!deltas.is_empty());
    assert!(deltas.iter().all(|f| matches!(f, ChatFrame::Delta(_))));
    let ChatFrame::Sources(sources) = last else {
        panic!("expected sources last, got {:?}", last);
    };
    assert_eq!(sources[0].document_id, fleet);
    assert!(sources[0].similarity.is_some());

    let text: String = deltas
        .iter()
        .filter_map(|f| match f {
            ChatFrame::Delta(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert!(text.contains("'Treasure Fleet' by Ma Huan"));
}

#[tokio::test]
async fn answer_without_documents_has_empty_sources() {
    let tmp = TempDir::new().unwrap();
    let engine = hash_engine(tmp.path()).await;
    seed(&engine).await;
    engine.reindexer.run().await.unwrap();

    let answer = engine
        .chat
        .collect(vec![ChatMessage::user("Treasure Fleet")], false)
        .await
        .unwrap();
    assert!(answer.sources.is_empty());
    assert_eq!(answer.content, "No relevant documents found in the knowledge base.");
}

/// Emits one delta, then fails.
struct FailingModel;

#[async_trait]
impl LanguageModel for FailingModel {
    fn name(&self) -> &str {
        "failing"
    }

    async fn stream(&self, _prompt: Prompt) -> Result<TokenStream, GenerationError> {
        Ok(Box::pin(stream::iter(vec![
            Ok("Partial ".to_string()),
            Err(GenerationError::Stream("connection reset".to_string())),
        ])))
    }
}

#[tokio::test]
async fn model_failure_ends_with_error_frame() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(tmp.path(), Arc::new(HashProvider::new(DIMS)), Arc::new(FailingModel)).await;
    seed(&engine).await;

    let frames: Vec<ChatFrame> = engine
        .chat
        .answer(vec![ChatMessage::user("Treasure Fleet")], true)
        .collect()
        .await;
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], ChatFrame::Delta("Partial ".to_string()));
    match &frames[1] {
        ChatFrame::Error(message) => assert!(message.contains("connection reset")),
        other => panic!("expected error frame, got {:?}", other),
    }
}

/// Streams forever; records when its token stream is dropped.
struct EndlessModel {
    dropped: Arc<AtomicBool>,
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LanguageModel for EndlessModel {
    fn name(&self) -> &str {
        "endless"
    }

    async fn stream(&self, _prompt: Prompt) -> Result<TokenStream, GenerationError> {
        let flag = DropFlag(self.dropped.clone());
        Ok(Box::pin(stream::unfold(flag, |flag| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Some((Ok("word ".to_string()), flag))
        })))
    }
}

#[tokio::test]
async fn dropping_the_stream_stops_generation() {
    let tmp = TempDir::new().unwrap();
    let dropped = Arc::new(AtomicBool::new(false));
    let engine = engine_with(
        tmp.path(),
        Arc::new(HashProvider::new(DIMS)),
        Arc::new(EndlessModel {
            dropped: dropped.clone(),
        }),
    )
    .await;

    let mut answer = engine.chat.answer(vec![ChatMessage::user("anything")], false);
    for _ in 0..3 {
        assert!(matches!(answer.next().await, Some(ChatFrame::Delta(_))));
    }
    drop(answer);

    for _ in 0..200 {
        if dropped.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("model stream was not released after the consumer went away");
}

#[tokio::test]
async fn dangling_index_pointer_starts_degraded_and_reindex_repairs_it() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path());
    let index_dir = tmp.path().join("index");
    std::fs::create_dir_all(&index_dir).unwrap();
    std::fs::write(index_dir.join("CURRENT"), "gen-missing").unwrap();

    let engine = Engine::open(&config).await.unwrap();
    assert!(engine.index.load().is_none());
    let (fleet, _, _) = seed(&engine).await;

    let retrieval = engine.retriever.retrieve(&Query::new("porcelain")).await.unwrap();
    assert_eq!(retrieval.path, RetrievalPath::Lexical);
    assert!(retrieval.degraded.is_some());
    assert_eq!(retrieval.results[0].document_id, fleet);

    engine.reindexer.run().await.unwrap();
    drop(engine);

    let reopened = Engine::open(&config).await.unwrap();
    assert!(reopened.index.size() > 0);
}

/// Two-dimensional embeddings keyed on the first line of the text: anything
/// naming "maritime" there points one way, everything else the other.
/// Chunk rows carry the title on their first line, so only titles count.
struct TitleKeywordEmbedder;

impl TitleKeywordEmbedder {
    fn vector(text: &str) -> Vec<f32> {
        let first_line = text.lines().next().unwrap_or_default().to_lowercase();
        if first_line.contains("maritime") {
            vec![1.0, 0.0]
        } else {
            vec![0.0, 1.0]
        }
    }
}

#[async_trait]
impl EmbeddingProvider for TitleKeywordEmbedder {
    fn model_name(&self) -> &str {
        "title-keyword"
    }

    fn dims(&self) -> usize {
        2
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(Self::vector(text))
    }
}

/// Two maritime titles (book 1433, article 1515) and one inland title whose
/// content still mentions maritime trade. Returns their ids in that order.
async fn seed_maritime(engine: &Engine) -> (i64, i64, i64) {
    let mut ids = Vec::new();
    for (source, title, year, doc_type, content) in [
        ("fleet.md", "Maritime Fleet", 1433, DocumentType::Book, "Seven voyages west."),
        ("port.md", "Maritime Port", 1515, DocumentType::Article, "Merchants crowd the strait."),
        ("canal.md", "Inland Canal", 1420, DocumentType::Book, "Grain barges fed the maritime trade."),
    ] {
        let out = engine
            .store
            .upsert(NewDocument {
                title: title.to_string(),
                year: Some(year),
                doc_type,
                source_file: source.to_string(),
                content: content.to_string(),
                ..NewDocument::default()
            })
            .await
            .unwrap();
        ids.push(out.id);
    }
    engine.reindexer.run().await.unwrap();
    (ids[0], ids[1], ids[2])
}

async fn maritime_engine(dir: &Path) -> Engine {
    engine_with(dir, Arc::new(TitleKeywordEmbedder), Arc::new(ExtractiveModel)).await
}

#[tokio::test]
async fn hybrid_appends_unscored_lexical_hits_after_scored_ones() {
    let tmp = TempDir::new().unwrap();
    let engine = maritime_engine(tmp.path()).await;
    let (fleet, port, canal) = seed_maritime(&engine).await;

    let retrieval = engine
        .retriever
        .retrieve(&Query::new("maritime").with_k(5).with_mode(SearchMode::Hybrid))
        .await
        .unwrap();
    assert_eq!(retrieval.path, RetrievalPath::Hybrid);
    let ids: Vec<i64> = retrieval.results.iter().map(|r| r.document_id).collect();
    assert_eq!(ids, vec![fleet, port, canal]);
    assert_eq!(retrieval.results[0].similarity, Some(1.0));
    assert_eq!(retrieval.results[1].similarity, Some(1.0));
    assert_eq!(retrieval.results[2].similarity, None);
    assert_eq!(retrieval.results[2].rank, 3);

    let semantic = engine
        .retriever
        .retrieve(&Query::new("maritime").with_k(5))
        .await
        .unwrap();
    assert_eq!(semantic.path, RetrievalPath::Semantic);
    assert_eq!(semantic.results.len(), 2);
}

#[tokio::test]
async fn metadata_filters_apply_to_semantic_hits() {
    let tmp = TempDir::new().unwrap();
    let engine = maritime_engine(tmp.path()).await;
    let (fleet, port, _) = seed_maritime(&engine).await;

    let articles = engine
        .retriever
        .retrieve(&Query::new("maritime").with_filter(DocumentFilter {
            doc_type: Some(DocumentType::Article),
            year: None,
        }))
        .await
        .unwrap();
    assert_eq!(articles.path, RetrievalPath::Semantic);
    let ids: Vec<i64> = articles.results.iter().map(|r| r.document_id).collect();
    assert_eq!(ids, vec![port]);

    let year = engine
        .retriever
        .retrieve(&Query::new("maritime").with_filter(DocumentFilter {
            doc_type: None,
            year: Some(1433),
        }))
        .await
        .unwrap();
    assert_eq!(year.path, RetrievalPath::Semantic);
    let ids: Vec<i64> = year.results.iter().map(|r| r.document_id).collect();
    assert_eq!(ids, vec![fleet]);
}

#[tokio::test]
async fn results_are_ordered_and_bounded_for_every_k() {
    let tmp = TempDir::new().unwrap();
    let engine = maritime_engine(tmp.path()).await;
    seed_maritime(&engine).await;

    for mode in [SearchMode::Semantic, SearchMode::Hybrid, SearchMode::Lexical] {
        for k in [1, 2, 3, 4, 10] {
            let retrieval = engine
                .retriever
                .retrieve(&Query::new("maritime").with_k(k).with_mode(mode))
                .await
                .unwrap();
            let results = &retrieval.results;
            assert!(!results.is_empty(), "mode {:?} k {}", mode, k);
            assert!(results.len() <= k, "mode {:?} k {}", mode, k);

            for (i, result) in results.iter().enumerate() {
                assert_eq!(result.rank, i + 1);
            }
            for pair in results.windows(2) {
                match (pair[0].similarity, pair[1].similarity) {
                    (Some(a), Some(b)) => {
                        assert!(a > b || (a == b && pair[0].document_id < pair[1].document_id))
                    }
                    (Some(_), None) => {}
                    (None, Some(_)) => panic!("unscored hit ranked above a scored one"),
                    (None, None) => assert!(pair[0].document_id < pair[1].document_id),
                }
            }
            let unique: std::collections::HashSet<i64> =
                results.iter().map(|r| r.document_id).collect();
            assert_eq!(unique.len(), results.len());
        }
    }
}

/// Query embeddings take longer than any sensible retrieval timeout.
struct SlowQueryEmbedder {
    inner: HashProvider,
}

#[async_trait]
impl EmbeddingProvider for SlowQueryEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.inner.embed(texts).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(self.inner.embed_one(text))
    }
}

#[tokio::test]
async fn slow_query_embedding_times_out_to_lexical() {
    let tmp = TempDir::new().unwrap();
    let mut config = write_config(tmp.path());
    config.retrieval.timeout_ms = 50;
    let store = open_store(&config).await;
    let engine = Engine::from_parts(
        config,
        store,
        Arc::new(SlowQueryEmbedder {
            inner: HashProvider::new(DIMS),
        }),
        Arc::new(ExtractiveModel),
        IndexHandle::default(),
    );
    let (fleet, _, _) = seed(&engine).await;
    engine.reindexer.run().await.unwrap();

    let retrieval = tokio::time::timeout(
        Duration::from_secs(5),
        engine.retriever.retrieve(&Query::new("porcelain")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(retrieval.path, RetrievalPath::Lexical);
    assert!(retrieval.degraded.unwrap().contains("timed out"));
    assert_eq!(retrieval.results[0].document_id, fleet);
}

/// Query embeddings always fail; batch embeddings work.
struct BrokenQueryEmbedder {
    inner: HashProvider,
}

#[async_trait]
impl EmbeddingProvider for BrokenQueryEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.inner.embed(texts).await
    }

    async fn embed_query(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Provider("upstream returned 500".to_string()))
    }
}

#[tokio::test]
async fn embedding_failure_surfaces_but_answers_still_complete() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(
        tmp.path(),
        Arc::new(BrokenQueryEmbedder {
            inner: HashProvider::new(DIMS),
        }),
        Arc::new(ExtractiveModel),
    )
    .await;
    seed(&engine).await;
    engine.reindexer.run().await.unwrap();

    let err = engine
        .retriever
        .retrieve(&Query::new("Treasure Fleet"))
        .await
        .unwrap_err();
    assert!(matches!(err, RetrievalError::Embedding(_)), "got {:?}", err);

    let frames: Vec<ChatFrame> = engine
        .chat
        .answer(vec![ChatMessage::user("Treasure Fleet")], true)
        .collect()
        .await;
    assert_eq!(frames.last(), Some(&ChatFrame::Sources(Vec::new())));
    assert!(frames[..frames.len() - 1]
        .iter()
        .all(|f| matches!(f, ChatFrame::Delta(_))));
}

#[tokio::test]
async fn store_outage_during_semantic_join_is_unavailable() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path());
    let store = open_store(&config).await;
    let engine = Engine::from_parts(
        config,
        store.clone(),
        Arc::new(HashProvider::new(DIMS)),
        Arc::new(ExtractiveModel),
        IndexHandle::default(),
    );
    seed(&engine).await;
    engine.reindexer.run().await.unwrap();
    assert!(engine.index.size() > 0);

    store.close().await;
    let err = engine
        .retriever
        .retrieve(&Query::new("Treasure Fleet"))
        .await
        .unwrap_err();
    assert!(matches!(err, RetrievalError::Unavailable(_)), "got {:?}", err);
}

/// Query embeddings never finish; records when the pending call is dropped.
struct StalledQueryEmbedder {
    inner: HashProvider,
    dropped: Arc<AtomicBool>,
}

#[async_trait]
impl EmbeddingProvider for StalledQueryEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.inner.embed(texts).await
    }

    async fn embed_query(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let _flag = DropFlag(self.dropped.clone());
        futures::future::pending::<()>().await;
        Err(EmbeddingError::Disabled)
    }
}

#[tokio::test]
async fn dropping_the_stream_cancels_pending_retrieval() {
    let tmp = TempDir::new().unwrap();
    let dropped = Arc::new(AtomicBool::new(false));
    let engine = engine_with(
        tmp.path(),
        Arc::new(StalledQueryEmbedder {
            inner: HashProvider::new(DIMS),
            dropped: dropped.clone(),
        }),
        Arc::new(ExtractiveModel),
    )
    .await;

    let answer = engine.chat.answer(vec![ChatMessage::user("Treasure Fleet")], true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(answer);

    for _ in 0..200 {
        if dropped.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("retrieval kept running after the consumer went away");
}

#[tokio::test]
async fn index_from_another_model_is_skipped_as_degraded() {
    let tmp = TempDir::new().unwrap();
    let engine = hash_engine(tmp.path()).await;
    let (fleet, _, _) = seed(&engine).await;
    engine.reindexer.run().await.unwrap();

    let other = Engine::from_parts(
        engine.config.clone(),
        engine.store.clone(),
        Arc::new(TitleKeywordEmbedder),
        Arc::new(ExtractiveModel),
        engine.index.clone(),
    );
    let retrieval = other.retriever.retrieve(&Query::new("porcelain")).await.unwrap();
    assert_eq!(retrieval.path, RetrievalPath::Lexical);
    assert!(retrieval.degraded.unwrap().contains("model mismatch"));
    assert_eq!(retrieval.results[0].document_id, fleet);
}
