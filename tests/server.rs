//! HTTP API over a real listener.

use std::sync::Arc;
use tempfile::TempDir;

use annals::config::load_config;
use annals::engine::Engine;
use annals::models::{DocumentType, NewDocument};
use annals::sse::{parse_events, SseEvent};

struct TestServer {
    base: String,
    engine: Arc<Engine>,
    _tmp: TempDir,
}

async fn start() -> TestServer {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("annals.toml");
    std::fs::write(
        &config_path,
        format!(
            "[db]\npath = \"{root}/annals.sqlite\"\n\n[embedding]\nprovider = \"hash\"\ndims = 1024\n",
            root = tmp.path().display()
        ),
    )
    .unwrap();
    let config = load_config(&config_path).unwrap();
    let engine = Arc::new(Engine::open(&config).await.unwrap());

    for (source, title, year, doc_type, content) in [
        ("fleet.md", "Treasure Fleet", Some(1433), DocumentType::Book, "Zheng He sailed to Calicut."),
        ("ming.md", "Ming Naval Tech", None, DocumentType::Article, "Watertight bulkheads."),
        ("malacca.md", "Malacca Port", Some(1515), DocumentType::Book, "The strait and its merchants."),
    ] {
        engine
            .store
            .upsert(NewDocument {
                title: title.to_string(),
                year,
                doc_type,
                source_file: source.to_string(),
                content: content.to_string(),
                ..NewDocument::default()
            })
            .await
            .unwrap();
    }
    engine.reindexer.run().await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_engine = engine.clone();
    tokio::spawn(async move {
        annals::server::serve(listener, server_engine).await.unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        engine,
        _tmp: tmp,
    }
}

#[tokio::test]
async fn health_reports_version() {
    let server = start().await;
    let body: serde_json::Value = reqwest::get(format!("{}/health", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn listing_pages_and_filters() {
    let server = start().await;
    let body: serde_json::Value = reqwest::get(format!("{}/api/documents?limit=2", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 3);
    assert_eq!(body["documents"].as_array().unwrap().len(), 2);

    let body: serde_json::Value = reqwest::get(format!("{}/api/documents?type=article", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 1);
    assert_eq!(body["documents"][0]["title"], "Ming Naval Tech");

    let body: serde_json::Value = reqwest::get(format!("{}/api/documents/years", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["years"], serde_json::json!([1515, 1433]));
}

#[tokio::test]
async fn search_requires_a_query() {
    let server = start().await;
    let response = reqwest::get(format!("{}/api/documents/search?q=", server.base))
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let body: serde_json::Value = reqwest::get(format!(
        "{}/api/documents/search?q=Treasure%20Fleet&limit=2",
        server.base
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(body["results"][0]["document"]["title"], "Treasure Fleet");
    assert_eq!(body["results"][0]["rank"], 1);
    assert_eq!(body["path"], "semantic");
}

#[tokio::test]
async fn missing_document_is_404() {
    let server = start().await;
    let response = reqwest::get(format!("{}/api/documents/9999", server.base))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let response = reqwest::get(format!("{}/api/documents/abc", server.base))
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn delete_purges_store_and_index() {
    let server = start().await;
    let client = reqwest::Client::new();
    let response = client
        .delete(format!("{}/api/documents/1", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(server
        .engine
        .index
        .load()
        .unwrap()
        .rows()
        .iter()
        .all(|r| r.document_id != 1));

    let response = client
        .delete(format!("{}/api/documents/1", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn reindex_is_accepted() {
    let server = start().await;
    let response = reqwest::Client::new()
        .post(format!("{}/api/documents/reindex", server.base))
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    let body: serde_json::Value = response.json().await.unwrap();
    match status {
        202 => assert_eq!(body["status"], "accepted"),
        409 => assert_eq!(body["status"], "busy"),
        other => panic!("unexpected status {}", other),
    }
}

#[tokio::test]
async fn chat_stream_sends_deltas_sources_then_done() {
    let server = start().await;
    let response = reqwest::Client::new()
        .post(format!("{}/api/chat/stream", server.base))
        .json(&serde_json::json!({
            "messages": [{ "role": "user", "content": "Treasure Fleet" }]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    let body = response.text().await.unwrap();
    let events = parse_events(&body);
    let (done, rest) = events.split_last().unwrap();
    assert_eq!(*done, SseEvent::Done);
    let (sources, deltas) = rest.split_last().unwrap();
    assert!(deltas.iter().all(|e| matches!(e, SseEvent::Delta(_))));
    match sources {
        SseEvent::Sources(refs) => {
            assert_eq!(refs[0].title, "Treasure Fleet");
            assert!(refs[0].similarity.is_some());
        }
        other => panic!("expected sources, got {:?}", other),
    }
}

#[tokio::test]
async fn chat_without_user_turn_is_rejected() {
    let server = start().await;
    let response = reqwest::Client::new()
        .post(format!("{}/api/chat", server.base))
        .json(&serde_json::json!({
            "messages": [{ "role": "system", "content": "ignored" }]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn stats_count_documents_and_vectors() {
    let server = start().await;
    let body: serde_json::Value = reqwest::get(format!("{}/api/stats", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["documents_count"], 3);
    assert!(body["index_size"].as_u64().unwrap() >= 3);
}
