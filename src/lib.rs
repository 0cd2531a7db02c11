//! # Annals
//!
//! A document retrieval and streaming answer engine for historical research
//! corpora.
//!
//! Documents live in SQLite. A vector index over heading and chunk
//! embeddings is rebuilt in the background and swapped in atomically, so
//! queries never observe a half-built index. Retrieval ranks by vector
//! similarity and falls back to lexical matching when the semantic path has
//! nothing to offer. Chat answers stream as frames: text deltas, then the
//! sources, then end-of-stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌───────────┐
//! │  Ingest  │──▶│  SQLite   │──▶│ Reindexer │
//! │ txt/pdf  │   │  store    │   │ embed+swap│
//! └──────────┘   └────┬─────┘   └─────┬─────┘
//!                     │               ▼
//!                     │        ┌────────────┐
//!                     └───────▶│ Retriever  │──▶ Chat ──▶ SSE
//!                              └────────────┘
//!                      ┌──────────┐   ┌──────────┐
//!                      │   CLI    │   │   HTTP   │
//!                      │ (annals) │   │  (axum)  │
//!                      └──────────┘   └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed errors per component |
//! | [`store`] | Document store trait and SQLite implementation |
//! | [`ingest`] | File and directory import |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_index`] | In-memory index with atomic swap |
//! | [`reindex`] | Background index rebuild |
//! | [`retrieval`] | Semantic, lexical and hybrid retrieval |
//! | [`generation`] | Language model abstraction |
//! | [`chat`] | Grounded streaming answers |
//! | [`sse`] | Frame encoding for the streaming endpoint |
//! | [`engine`] | Component wiring |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chat;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod generation;
pub mod get;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod reindex;
pub mod retrieval;
pub mod search;
pub mod server;
pub mod sse;
pub mod stats;
pub mod store;
pub mod vector_index;
